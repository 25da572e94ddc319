//! CSV export sink

use async_trait::async_trait;
use opendata_core::{Row, RowBatch, RowSink, SinkError};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Writes batches as CSV rows.
///
/// The header is taken from the first row received (upstream column order)
/// unless the sink was opened in append mode on a file that already has one.
/// Every accepted batch is flushed to the underlying writer before `accept`
/// returns.
pub struct CsvSink<W: Write + Send + 'static> {
    writer: Option<csv::Writer<W>>,
    header: Option<Arc<Vec<String>>>,
    header_written: bool,
    rows_written: u64,
}

impl CsvSink<File> {
    /// Create or truncate `path`
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let file = File::create(path.as_ref())?;
        Ok(Self::from_writer(file))
    }

    /// Append to `path`, reusing its header when the file already has rows
    pub fn append<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let path = path.as_ref();
        let existing_header = match std::fs::metadata(path) {
            Ok(meta) if meta.len() > 0 => {
                let mut reader = csv::Reader::from_path(path).map_err(csv_error)?;
                let header: Vec<String> = reader
                    .headers()
                    .map_err(csv_error)?
                    .iter()
                    .map(str::to_string)
                    .collect();
                Some(header)
            }
            _ => None,
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut sink = Self::from_writer(file);
        if let Some(header) = existing_header {
            tracing::debug!(path = %path.display(), columns = header.len(), "Appending to existing CSV");
            sink.header = Some(Arc::new(header));
            sink.header_written = true;
        }
        Ok(sink)
    }
}

impl<W: Write + Send + 'static> CsvSink<W> {
    pub fn from_writer(writer: W) -> Self {
        Self {
            writer: Some(csv::Writer::from_writer(writer)),
            header: None,
            header_written: false,
            rows_written: 0,
        }
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }
}

#[async_trait]
impl<W: Write + Send + 'static> RowSink for CsvSink<W> {
    async fn accept(&mut self, batch: RowBatch) -> Result<(), SinkError> {
        if batch.rows.is_empty() {
            return Ok(());
        }

        let header = match &self.header {
            Some(header) => Arc::clone(header),
            None => {
                let header = Arc::new(batch.rows[0].keys().cloned().collect::<Vec<_>>());
                self.header = Some(Arc::clone(&header));
                header
            }
        };
        let write_header = !self.header_written;
        let batch_sequence = batch.sequence;
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| SinkError::Rejected("CSV writer is closed".to_string()))?;

        let (writer, result) = tokio::task::spawn_blocking(move || {
            let result = write_rows(&mut writer, &header, write_header, &batch.rows);
            (writer, result)
        })
        .await
        .map_err(|e| SinkError::Rejected(format!("Task join error: {}", e)))?;

        self.writer = Some(writer);
        let written = result?;
        self.header_written = true;
        self.rows_written += written;
        tracing::debug!(
            sequence = batch_sequence,
            rows = written,
            total = self.rows_written,
            "CSV batch written"
        );
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

fn write_rows<W: Write>(
    writer: &mut csv::Writer<W>,
    header: &[String],
    write_header: bool,
    rows: &[Row],
) -> Result<u64, SinkError> {
    if write_header {
        writer.write_record(header).map_err(csv_error)?;
    }

    let mut record = Vec::with_capacity(header.len());
    for row in rows {
        if let Some(extra) = row.keys().find(|k| !header.contains(k)) {
            return Err(SinkError::Rejected(format!(
                "Column '{}' is not in the CSV header",
                extra
            )));
        }
        record.clear();
        record.extend(header.iter().map(|col| cell(row.get(col))));
        writer.write_record(&record).map_err(csv_error)?;
    }
    writer.flush()?;
    Ok(rows.len() as u64)
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn csv_error(err: csv::Error) -> SinkError {
    SinkError::Csv(err.to_string())
}
