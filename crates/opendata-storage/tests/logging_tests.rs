//! Store and sink operations leave a trace in the log.

use chrono::Utc;
use opendata_core::{DatasetDescriptor, DatasetStatus, ExportRecord, Row, RowBatch, RowSink, SourceOrigin};
use opendata_storage::{LocalSqliteStore, RecordKind, SqliteTableSink, TableMode};
use std::io::Write;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

fn descriptor(id: &str) -> DatasetDescriptor {
    DatasetDescriptor {
        identifier: id.to_string(),
        title: format!("Tabel {}", id),
        summary: String::new(),
        source: SourceOrigin::Cbs,
        status: DatasetStatus::Active,
        record_count: None,
        column_count: None,
        modified: None,
        last_refreshed: Utc::now(),
    }
}

#[tokio::test]
async fn test_writes_are_logged() {
    let captured = Captured::default();
    let writer = captured.clone();
    // Global so events from blocking worker threads are captured too.
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish(),
    )
    .unwrap();

    let dir = TempDir::new().unwrap();
    let store = LocalSqliteStore::new(dir.path().join("store.db"));
    store.initialize().await.unwrap();
    store
        .replace_catalog(vec![descriptor("85313NED"), descriptor("37296ned")], Utc::now())
        .await
        .unwrap();
    store
        .put_record(RecordKind::Structure, "85313NED", &vec!["RegioS"], Utc::now())
        .await
        .unwrap();
    store
        .record_export(ExportRecord {
            path: "bevolking.csv".into(),
            dataset_id: "85313NED".into(),
            rows: 3,
            completed_at: Utc::now(),
        })
        .await
        .unwrap();

    let mut sink =
        SqliteTableSink::open(dir.path().join("out.db"), "bevolking", TableMode::Replace).unwrap();
    let mut row = Row::new();
    row.insert("RegioS".into(), serde_json::json!("GM0363"));
    sink.accept(RowBatch {
        dataset_id: "85313NED".into(),
        sequence: 0,
        start: 0,
        rows: vec![row],
    })
    .await
    .unwrap();

    let log = captured.text();
    assert!(log.contains("Catalog snapshot replaced"), "{}", log);
    assert!(log.contains("stored=2"), "{}", log);
    assert!(log.contains("Metadata record stored"), "{}", log);
    assert!(log.contains("Export recorded"), "{}", log);
    assert!(log.contains("Created export table"), "{}", log);
    assert!(log.contains("SQLite batch inserted"), "{}", log);
}
