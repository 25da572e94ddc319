//! Batch consumer contract for paginated fetches

use crate::RowBatch;
use async_trait::async_trait;

#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Batch rejected: {0}")]
    Rejected(String),
}

/// Receives the batches of one fetch, in order.
///
/// An error from `accept` aborts the fetch. Once `accept` returns `Ok` the
/// batch must be durable: callers checkpoint the fetch position right after
/// it. `finish` is called once the engine stops feeding batches, whether the
/// fetch completed or was cancelled.
#[async_trait]
pub trait RowSink: Send {
    async fn accept(&mut self, batch: RowBatch) -> Result<(), SinkError>;

    async fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Adapts a closure into a sink
pub struct FnSink<F>(pub F);

#[async_trait]
impl<F> RowSink for FnSink<F>
where
    F: FnMut(RowBatch) -> Result<(), SinkError> + Send,
{
    async fn accept(&mut self, batch: RowBatch) -> Result<(), SinkError> {
        (self.0)(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_sink_forwards_batches() {
        let mut seen = Vec::new();
        {
            let mut sink = FnSink(|batch: RowBatch| {
                seen.push(batch.sequence);
                Ok(())
            });
            for sequence in 0..3 {
                sink.accept(RowBatch {
                    dataset_id: "X".into(),
                    sequence,
                    start: sequence * 10,
                    rows: vec![],
                })
                .await
                .unwrap();
            }
            sink.finish().await.unwrap();
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }
}
