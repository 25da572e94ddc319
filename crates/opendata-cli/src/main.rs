//! Open-data catalog CLI
//!
//! Command-line interface for searching the statistics catalog, inspecting
//! dataset metadata and exporting rows.

mod checkpoint;
mod where_clause;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use opendata_client::{
    Availability, CancelSignal, ClientConfig, ClientError, FetchStrategy, InspectReport,
    OpenData, QueryableReport, DEFAULT_SAMPLE_SIZE,
};
use opendata_core::validation::validate_file_name;
use opendata_core::{
    DatasetDescriptor, ExportRecord, FetchCursor, FnSink, QuerySpec, RowBatch, RowSink,
    SearchField, SinkError,
};
use opendata_storage::{CsvSink, SqliteTableSink, TableMode};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use checkpoint::{read_cursor, write_cursor, CheckpointSink};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "opendata")]
#[command(version, about = "Open-data statistics catalog CLI", long_about = None)]
struct Cli {
    /// Path to the local store (default: OPENDATA_STORE_PATH or opendata.db)
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the catalog into the local store
    Refresh {
        /// Only refresh when the snapshot is empty or stale
        #[arg(long)]
        if_stale: bool,
    },

    /// Search the local catalog snapshot
    Search {
        /// Search query
        query: String,

        /// Where to look: title, summary or both
        #[arg(short, long, default_value = "both")]
        field: SearchField,

        /// Maximum number of results
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Browse the catalog in identifier order
    List {
        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        /// Show detailed information
        #[arg(short = 'v', long)]
        verbose: bool,
    },

    /// Show a catalog entry
    Show {
        /// Dataset identifier
        id: String,
    },

    /// Show the columns of a dataset
    Structure {
        id: String,

        /// Refetch instead of using cached metadata
        #[arg(long)]
        refresh: bool,
    },

    /// Show the codes and labels of a dimension
    Vocabulary {
        id: String,
        dimension: String,

        /// Refetch instead of using cached metadata
        #[arg(long)]
        refresh: bool,
    },

    /// Show the TableInfos record of a dataset
    Info { id: String },

    /// List the metadata endpoints of a dataset
    Endpoints { id: String },

    /// Report title, description, columns and a sample of a dataset
    Inspect {
        id: String,

        /// Rows in the sample
        #[arg(long, default_value_t = DEFAULT_SAMPLE_SIZE)]
        sample: u64,
    },

    /// Estimate the size of a dataset
    Estimate {
        id: String,

        /// Columns to fetch, comma separated
        #[arg(long, value_delimiter = ',')]
        select: Vec<String>,
    },

    /// Fetch rows of a dataset
    Fetch(FetchArgs),

    /// Continue a fetch from its checkpoint
    Resume {
        /// Checkpoint written by `fetch --checkpoint`
        #[arg(long)]
        checkpoint: PathBuf,

        /// Rows per request
        #[arg(long)]
        page_size: Option<u64>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Show store statistics
    Stats,
}

#[derive(Args)]
struct FetchArgs {
    /// Dataset identifier
    id: String,

    /// Row filter, e.g. `RegioS=GM0363`, `Perioden~2023`, `Bevolking_1>=1000`
    #[arg(short = 'w', long = "where")]
    filters: Vec<String>,

    /// Match rows satisfying any filter instead of all
    #[arg(long)]
    any: bool,

    /// Columns to fetch, comma separated
    #[arg(long, value_delimiter = ',')]
    select: Vec<String>,

    /// Maximum number of rows (default: OPENDATA_MAX_RECORDS)
    #[arg(long)]
    limit: Option<u64>,

    /// Replace dimension codes with labels
    #[arg(long)]
    translate: bool,

    /// Save the cursor here after every page
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Rows per request
    #[arg(long)]
    page_size: Option<u64>,

    /// Fetch even if the target already holds a completed export
    #[arg(long)]
    force: bool,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct OutputArgs {
    /// Write rows to a CSV file
    #[arg(long, conflicts_with = "sqlite_table")]
    csv: Option<PathBuf>,

    /// Write rows to a table of a SQLite database
    #[arg(long)]
    sqlite_table: Option<String>,

    /// Database for --sqlite-table
    #[arg(long, default_value = "opendata_export.db")]
    sqlite_db: PathBuf,
}

impl OutputArgs {
    /// Key of the target in the export ledger; stdout has none
    fn ledger_key(&self) -> Option<String> {
        match (&self.csv, &self.sqlite_table) {
            (Some(path), _) => Some(path.display().to_string()),
            (None, Some(table)) => Some(format!("{}#{}", self.sqlite_db.display(), table)),
            (None, None) => None,
        }
    }

    fn open(&self, append: bool) -> Result<Box<dyn RowSink>, Box<dyn std::error::Error>> {
        if let Some(path) = &self.csv {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            validate_file_name(&name)?;
            let sink = if append {
                CsvSink::append(path)?
            } else {
                CsvSink::create(path)?
            };
            return Ok(Box::new(sink));
        }
        if let Some(table) = &self.sqlite_table {
            let mode = if append {
                TableMode::Append
            } else {
                TableMode::Replace
            };
            return Ok(Box::new(SqliteTableSink::open(&self.sqlite_db, table, mode)?));
        }
        Ok(Box::new(FnSink(write_json_lines)))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(cli.store) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli.command, config).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(store: Option<PathBuf>) -> Result<ClientConfig, ClientError> {
    let mut config = ClientConfig::from_env()?;
    if let Some(store) = store {
        config.store_path = store;
    }
    config.validate()?;
    Ok(config)
}

async fn run(command: Commands, config: ClientConfig) -> CliResult {
    let od = OpenData::connect(config).await?;

    match command {
        Commands::Refresh { if_stale } => refresh(&od, if_stale).await,
        Commands::Search {
            query,
            field,
            limit,
        } => search(&od, &query, field, limit).await,
        Commands::List {
            offset,
            limit,
            verbose,
        } => list(&od, offset, limit, verbose).await,
        Commands::Show { id } => show(&od, &id).await,
        Commands::Structure { id, refresh } => structure(&od, &id, refresh).await,
        Commands::Vocabulary {
            id,
            dimension,
            refresh,
        } => vocabulary(&od, &id, &dimension, refresh).await,
        Commands::Info { id } => info(&od, &id).await,
        Commands::Endpoints { id } => endpoints(&od, &id).await,
        Commands::Inspect { id, sample } => inspect(&od, &id, sample).await,
        Commands::Estimate { id, select } => estimate(&od, &id, select).await,
        Commands::Fetch(args) => fetch(&od, args).await,
        Commands::Resume {
            checkpoint,
            page_size,
            output,
        } => resume(&od, checkpoint, page_size, output).await,
        Commands::Stats => stats(&od).await,
    }
}

// ============================================================================
// Catalog
// ============================================================================

async fn refresh(od: &OpenData, if_stale: bool) -> CliResult {
    if if_stale && !od.catalog().is_stale().await? {
        println!("Catalog is up to date");
        return Ok(());
    }
    let count = od.catalog().refresh().await?;
    println!("Indexed {} datasets", format_number(count as u64));
    Ok(())
}

/// Refresh an empty snapshot; warn about a stale one
async fn ensure_catalog(od: &OpenData) -> CliResult {
    let info = od.catalog().snapshot_info().await?;
    if info.count == 0 {
        eprintln!("Catalog is empty, downloading...");
        od.catalog().refresh().await?;
    } else if od.catalog().is_stale().await? {
        eprintln!("Catalog snapshot is stale; run `opendata refresh` to update it");
    }
    Ok(())
}

async fn search(od: &OpenData, query: &str, field: SearchField, limit: usize) -> CliResult {
    ensure_catalog(od).await?;
    let results = od.catalog().search(query, field, limit).await?;

    println!("Search results for '{}':", query);
    println!();
    for d in &results {
        print_summary(d);
    }
    if results.is_empty() {
        println!("  (no matches)");
    }
    Ok(())
}

async fn list(od: &OpenData, offset: usize, limit: usize, verbose: bool) -> CliResult {
    ensure_catalog(od).await?;
    let datasets = od.catalog().list(offset, limit).await?;

    println!("Datasets:");
    println!();
    for d in &datasets {
        if verbose {
            print_descriptor(d);
            println!();
        } else {
            print_summary(d);
        }
    }
    Ok(())
}

async fn show(od: &OpenData, id: &str) -> CliResult {
    match od.catalog().get(id).await {
        Ok(d) => {
            print_descriptor(&d);
            Ok(())
        }
        Err(ClientError::NotFound(_)) => {
            let availability = od.catalog().check_availability(id).await?;
            println!("Dataset '{}' is not in the local catalog ({})", id, availability);
            match availability {
                Availability::Queryable => {
                    println!("The data service answers for it; try `opendata structure {}`", id)
                }
                Availability::DownloadOnly => {
                    println!("Only files are published; try `opendata inspect {}`", id)
                }
                _ => {}
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_summary(d: &DatasetDescriptor) {
    print!("  {}  {}", d.identifier, d.title);
    if d.status != opendata_core::DatasetStatus::Active {
        print!(" [{}]", d.status);
    }
    println!();
}

fn print_descriptor(d: &DatasetDescriptor) {
    println!("Dataset: {}", d.identifier);
    println!("Title: {}", d.title);
    if !d.summary.is_empty() {
        println!("Summary: {}", d.summary);
    }
    println!("Source: {}", d.source);
    println!("Status: {}", d.status);
    if let Some(rc) = d.record_count {
        println!("Rows: {}", format_number(rc.max(0) as u64));
    }
    if let Some(cc) = d.column_count {
        println!("Columns: {}", cc);
    }
    if let Some(modified) = &d.modified {
        println!("Modified: {}", modified);
    }
    println!("Indexed: {}", d.last_refreshed.format("%Y-%m-%d %H:%M"));
}

// ============================================================================
// Metadata
// ============================================================================

async fn structure(od: &OpenData, id: &str, refresh: bool) -> CliResult {
    let structure = if refresh {
        od.resolver().refresh_structure(id).await?
    } else {
        od.resolver().get_structure(id).await?
    };

    println!("Columns of {}:", id);
    for column in &structure.columns {
        print!("  {} ({})", column.key, column.kind);
        print!(" - {}", column.title);
        if let Some(unit) = &column.unit {
            print!(" [{}]", unit);
        }
        println!();
    }
    Ok(())
}

async fn vocabulary(od: &OpenData, id: &str, dimension: &str, refresh: bool) -> CliResult {
    let vocabulary = if refresh {
        od.resolver().refresh_vocabulary(id, dimension).await?
    } else {
        od.resolver().get_vocabulary(id, dimension).await?
    };

    println!("{} codes of {}/{}:", vocabulary.len(), id, dimension);
    for entry in vocabulary.entries() {
        println!("  {}\t{}", entry.code, entry.label);
    }
    Ok(())
}

async fn info(od: &OpenData, id: &str) -> CliResult {
    let info = od.resolver().get_info(id).await?;
    for (key, value) in &info.fields {
        match value {
            serde_json::Value::String(s) => println!("{}: {}", key, s),
            serde_json::Value::Null => {}
            other => println!("{}: {}", key, other),
        }
    }
    Ok(())
}

async fn endpoints(od: &OpenData, id: &str) -> CliResult {
    let endpoints = od.resolver().get_endpoints(id).await?;

    println!("Standard endpoints:");
    for e in &endpoints.standard {
        println!("  {}  {}", e.name, e.url);
    }
    println!("\nDimension endpoints:");
    for e in &endpoints.dimensions {
        println!("  {}  {}", e.name, e.url);
    }
    Ok(())
}

async fn inspect(od: &OpenData, id: &str, sample: u64) -> CliResult {
    match od.inspector().inspect(id, sample).await? {
        InspectReport::Queryable(report) => print_queryable(&report).await?,
        InspectReport::DownloadOnly(package) => {
            println!("Dataset: {} (download only)", id);
            println!("Title: {}", package.title);
            if let Some(notes) = package.notes.as_deref().filter(|n| !n.trim().is_empty()) {
                println!("Description: {}", notes.trim());
            }
            println!("\nResources:");
            for resource in &package.resources {
                println!(
                    "  {} [{}]  {}",
                    resource.name.as_deref().unwrap_or("-"),
                    resource.format.as_deref().unwrap_or("?"),
                    resource.url.as_deref().unwrap_or("")
                );
            }
        }
        InspectReport::NotFound { dataset_id } => {
            println!(
                "Dataset '{}' is unknown to the data service and the open-data portal",
                dataset_id
            );
        }
    }
    Ok(())
}

async fn print_queryable(report: &QueryableReport) -> CliResult {
    println!("Dataset: {}", report.dataset_id);
    println!("Title: {}", report.title());
    let description = report.info.as_deref().and_then(|i| {
        i.get_str("ShortDescription")
            .or_else(|| i.get_str("Summary"))
    });
    if let Some(description) = description {
        println!("Description: {}", description.trim());
    }
    if let Some(total) = report.row_count {
        println!("Rows: {}", format_number(total));
    }

    println!("\nColumns:");
    for column in &report.structure.columns {
        print!("  {} ({}) - {}", column.key, column.kind, column.title);
        if let Some(unit) = &column.unit {
            print!(" [{}]", unit);
        }
        println!();
    }

    let note = if report.sample_translated { "" } else { ", raw codes" };
    println!("\nSample ({} rows{}):", report.sample.len(), note);
    if report.sample.is_empty() {
        return Ok(());
    }
    let mut sink = CsvSink::from_writer(std::io::stdout());
    sink.accept(RowBatch {
        dataset_id: report.dataset_id.clone(),
        sequence: 0,
        start: 0,
        rows: report.sample.clone(),
    })
    .await?;
    sink.finish().await?;
    Ok(())
}

async fn estimate(od: &OpenData, id: &str, select: Vec<String>) -> CliResult {
    let projection = (!select.is_empty()).then_some(select);
    let estimate = od.estimator().estimate(id, projection.as_deref()).await?;

    let marker = if estimate.approximate { "~" } else { "" };
    println!("Dataset: {}", estimate.dataset_id);
    println!("Rows: {}{}", marker, format_number(estimate.approx_row_count));
    println!("Columns: {}", estimate.column_count);
    println!("Strategy: {}", estimate.recommended_strategy);
    if estimate.use_projection {
        println!("Hint: fetch with the given --select to reduce transfer size");
    }
    Ok(())
}

// ============================================================================
// Fetch
// ============================================================================

async fn fetch(od: &OpenData, args: FetchArgs) -> CliResult {
    let mut spec = QuerySpec::new(&args.id)
        .with_row_cap(args.limit.unwrap_or(od.config().max_records))
        .with_translation(args.translate);
    if let Some(filter) = where_clause::parse_clauses(&args.filters, args.any)? {
        spec = spec.with_filter(filter);
    }
    if !args.select.is_empty() {
        spec = spec.with_projection(args.select.clone());
    }

    let ledger_key = args.output.ledger_key();
    if let (Some(key), false) = (&ledger_key, args.force) {
        if let Some(export) = od.store().get_export(key).await? {
            eprintln!(
                "'{}' already holds {} rows of {} (exported {}); use --force to fetch again",
                export.path,
                format_number(export.rows),
                export.dataset_id,
                export.completed_at.format("%Y-%m-%d %H:%M")
            );
            return Ok(());
        }
    }

    let estimate = od
        .estimator()
        .estimate(&args.id, spec.projection.as_deref())
        .await?;
    eprintln!(
        "{}: {}{} rows, {} columns, {} fetch",
        estimate.dataset_id,
        if estimate.approximate { "~" } else { "" },
        format_number(estimate.approx_row_count),
        estimate.column_count,
        estimate.recommended_strategy
    );
    if estimate.recommended_strategy == FetchStrategy::Chunked && spec.projection.is_none() {
        eprintln!("Hint: --select a subset of columns to reduce transfer size");
    }

    let mut sink = args.output.open(false)?;
    let page_size = args.page_size.unwrap_or(od.config().page_size);
    drive(
        od,
        FetchCursor::start(spec),
        true,
        page_size,
        sink.as_mut(),
        args.checkpoint,
        ledger_key,
    )
    .await
}

async fn resume(
    od: &OpenData,
    checkpoint: PathBuf,
    page_size: Option<u64>,
    output: OutputArgs,
) -> CliResult {
    let cursor = read_cursor(&checkpoint).await?;
    if cursor.completed {
        println!(
            "Checkpoint '{}' is already complete ({} rows)",
            checkpoint.display(),
            format_number(cursor.offset)
        );
        return Ok(());
    }
    eprintln!(
        "Resuming {} at offset {}",
        cursor.dataset_id,
        format_number(cursor.offset)
    );

    let mut sink = output.open(true)?;
    let page_size = page_size.unwrap_or(od.config().page_size);
    drive(
        od,
        cursor,
        false,
        page_size,
        sink.as_mut(),
        Some(checkpoint),
        output.ledger_key(),
    )
    .await
}

/// Run a fetch or resume with Ctrl-C cancellation and checkpointing
async fn drive(
    od: &OpenData,
    cursor: FetchCursor,
    fresh: bool,
    page_size: u64,
    sink: &mut dyn RowSink,
    checkpoint: Option<PathBuf>,
    ledger_key: Option<String>,
) -> CliResult {
    let cancel = CancelSignal::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Cancelling after the current page...");
                cancel.cancel();
            }
        })
    };

    let mut sink = CheckpointSink::new(sink, checkpoint.clone(), cursor.clone());
    let outcome = if fresh {
        od.engine()
            .fetch(cursor.query, page_size, &mut sink, Some(&cancel))
            .await
    } else {
        od.engine()
            .resume_from(cursor, page_size, &mut sink, Some(&cancel))
            .await
    };
    watcher.abort();

    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            if let (Some(path), Some(cursor)) = (&checkpoint, e.cursor()) {
                write_cursor(path, cursor).await?;
                eprintln!(
                    "Checkpoint saved to '{}' at offset {}",
                    path.display(),
                    format_number(cursor.offset)
                );
            }
            return Err(e.into());
        }
    };

    if let Some(path) = &checkpoint {
        write_cursor(path, &result.cursor).await?;
    }

    if result.completed {
        eprintln!(
            "Fetched {} rows ({} in total)",
            format_number(result.total_rows_emitted),
            format_number(result.cursor.offset)
        );
        if let Some(key) = ledger_key {
            tracing::debug!(target = %key, rows = result.cursor.offset, "Recording export");
            od.store()
                .record_export(ExportRecord {
                    path: key,
                    dataset_id: result.cursor.dataset_id.clone(),
                    rows: result.cursor.offset,
                    completed_at: Utc::now(),
                })
                .await?;
        }
    } else {
        eprintln!(
            "Cancelled at offset {} after {} rows",
            format_number(result.cursor.offset),
            format_number(result.total_rows_emitted)
        );
        match &checkpoint {
            Some(path) => eprintln!(
                "Resume with: opendata resume --checkpoint {} (same output flags)",
                path.display()
            ),
            None => eprintln!("No --checkpoint was given; this fetch cannot be resumed"),
        }
    }
    Ok(())
}

fn write_json_lines(batch: RowBatch) -> Result<(), SinkError> {
    let mut out = std::io::stdout().lock();
    for row in &batch.rows {
        serde_json::to_writer(&mut out, row).map_err(|e| SinkError::Rejected(e.to_string()))?;
        writeln!(out)?;
    }
    Ok(())
}

// ============================================================================
// Stats
// ============================================================================

async fn stats(od: &OpenData) -> CliResult {
    let stats = od.store().stats().await?;

    println!("Store Statistics ({}):", od.store().path().display());
    println!("  Datasets: {}", format_number(stats.datasets));
    println!("  Metadata records: {}", format_number(stats.metadata_records));
    println!("  Exports: {}", format_number(stats.exports));
    match stats.catalog_refreshed_at {
        Some(at) => {
            let stale = if od.catalog().is_stale().await? {
                " (stale)"
            } else {
                ""
            };
            println!("  Catalog refreshed: {}{}", at.format("%Y-%m-%d %H:%M"), stale);
        }
        None => println!("  Catalog refreshed: never"),
    }
    Ok(())
}

fn format_number(n: u64) -> String {
    let mut digits = n.to_string();
    let mut parts = Vec::new();

    while digits.len() > 3 {
        let chunk = digits.split_off(digits.len() - 3);
        parts.push(chunk);
    }
    parts.push(digits);
    parts.reverse();
    parts.join(",")
}
