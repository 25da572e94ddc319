//! Writes the fetch cursor to disk after every accepted batch.

use async_trait::async_trait;
use opendata_core::{FetchCursor, RowBatch, RowSink, SinkError};
use std::path::{Path, PathBuf};

/// Forwards batches to `inner` and checkpoints the cursor once each is accepted
pub struct CheckpointSink<'a> {
    inner: &'a mut (dyn RowSink + 'a),
    path: Option<PathBuf>,
    cursor: FetchCursor,
}

impl<'a> CheckpointSink<'a> {
    /// `cursor` is the position the fetch starts from
    pub fn new(inner: &'a mut (dyn RowSink + 'a), path: Option<PathBuf>, cursor: FetchCursor) -> Self {
        Self {
            inner,
            path,
            cursor,
        }
    }
}

#[async_trait]
impl RowSink for CheckpointSink<'_> {
    async fn accept(&mut self, batch: RowBatch) -> Result<(), SinkError> {
        let end = batch.end();
        let next_sequence = batch.sequence + 1;
        self.inner.accept(batch).await?;

        self.cursor.offset = end;
        self.cursor.next_sequence = next_sequence;
        if let Some(path) = &self.path {
            write_cursor(path, &self.cursor).await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        self.inner.finish().await
    }
}

/// Replace the checkpoint file with `cursor`
pub async fn write_cursor(path: &Path, cursor: &FetchCursor) -> Result<(), SinkError> {
    let json = cursor
        .to_json()
        .map_err(|e| SinkError::Rejected(e.to_string()))?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

pub async fn read_cursor(path: &Path) -> Result<FetchCursor, Box<dyn std::error::Error>> {
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("Cannot read checkpoint '{}': {}", path.display(), e))?;
    Ok(FetchCursor::from_json(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendata_core::{FnSink, QuerySpec, Row};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_checkpoint_follows_accepted_batches() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fetch.json");
        let mut seen = 0usize;
        let mut inner = FnSink(|batch: RowBatch| {
            seen += batch.len();
            Ok(())
        });

        {
            let start = FetchCursor::start(QuerySpec::new("85313NED").with_row_cap(10));
            let mut sink = CheckpointSink::new(&mut inner, Some(path.clone()), start);
            for sequence in 0..2u64 {
                let batch = RowBatch {
                    dataset_id: "85313NED".into(),
                    sequence,
                    start: sequence * 3,
                    rows: vec![Row::new(); 3],
                };
                sink.accept(batch).await.unwrap();
            }
        }

        let cursor = read_cursor(&path).await.unwrap();
        assert_eq!(cursor.offset, 6);
        assert_eq!(cursor.next_sequence, 2);
        assert_eq!(cursor.query.row_cap, Some(10));
        assert!(!path.with_extension("tmp").exists());
        drop(inner);
        assert_eq!(seen, 6);
    }

    #[tokio::test]
    async fn test_checkpoint_never_ahead_of_csv_file() {
        let dir = TempDir::new().unwrap();
        let checkpoint = dir.path().join("fetch.json");
        let csv_path = dir.path().join("out.csv");
        let mut csv = opendata_storage::CsvSink::create(&csv_path).unwrap();

        let start = FetchCursor::start(QuerySpec::new("85313NED"));
        let mut sink = CheckpointSink::new(&mut csv, Some(checkpoint.clone()), start);
        for sequence in 0..3u64 {
            let rows = (0..40)
                .map(|i| {
                    let mut row = Row::new();
                    row.insert("ID".into(), serde_json::json!(sequence * 40 + i));
                    row
                })
                .collect();
            sink.accept(RowBatch {
                dataset_id: "85313NED".into(),
                sequence,
                start: sequence * 40,
                rows,
            })
            .await
            .unwrap();

            // No finish: the file must already hold what the cursor claims.
            let cursor = read_cursor(&checkpoint).await.unwrap();
            let lines = std::fs::read_to_string(&csv_path).unwrap().lines().count() as u64;
            assert_eq!(lines - 1, cursor.offset);
        }
    }

    #[tokio::test]
    async fn test_rejected_batch_leaves_checkpoint_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fetch.json");
        let mut inner = FnSink(|_batch: RowBatch| Err(SinkError::Rejected("disk full".into())));

        let start = FetchCursor::start(QuerySpec::new("85313NED"));
        let mut sink = CheckpointSink::new(&mut inner, Some(path.clone()), start);
        let batch = RowBatch {
            dataset_id: "85313NED".into(),
            sequence: 0,
            start: 0,
            rows: vec![Row::new()],
        };

        assert!(sink.accept(batch).await.is_err());
        assert!(!path.exists());
    }
}
