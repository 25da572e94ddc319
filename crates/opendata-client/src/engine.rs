//! Paginated fetch engine.
//!
//! Pages through `TypedDataSet` with `$top`/`$skip`, one request at a time,
//! and hands each page to a [`RowSink`] as a [`RowBatch`]. The position is
//! tracked in a serializable [`FetchCursor`] so an interrupted fetch can be
//! resumed, including from another process.
//!
//! # Termination
//!
//! A fetch completes when the reported total is reached, when the row cap is
//! hit, or, if the service never reported a total, when a page comes back
//! short. The cap truncates the final batch. A short page below a known total
//! only means the service serves fewer rows per request than asked for, so
//! paging continues from the rows actually delivered.
//!
//! # Failures
//!
//! Transient page failures are retried on the same offset through the
//! configured [`BackoffPolicy`]. Once retries are exhausted, or on a fatal
//! response, the fetch stops with [`ClientError::PageFetch`] carrying the
//! cursor after the last batch the sink accepted.

use crate::backoff::{retry_transient, BackoffPolicy, Clock};
use crate::config::MAX_PAGE_SIZE;
use crate::error::{ClientError, Result};
use crate::metadata::MetadataResolver;
use crate::query::QueryBuilder;
use crate::translate::Translator;
use crate::upstream::{PageRequest, Upstream};
use opendata_core::sink::{RowSink, SinkError};
use opendata_core::{FetchCursor, QuerySpec, RowBatch};
use std::sync::Arc;
use tokio::sync::watch;

/// Cooperative cancellation, checked before every page request.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a fetch or resume call
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    /// Rows handed to the sink by this call
    pub total_rows_emitted: u64,
    /// False when the fetch was cancelled before reaching the end
    pub completed: bool,
    pub cursor: FetchCursor,
}

pub struct FetchEngine {
    upstream: Arc<dyn Upstream>,
    builder: QueryBuilder,
    translator: Arc<Translator>,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl FetchEngine {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        resolver: Arc<MetadataResolver>,
        translator: Arc<Translator>,
        backoff: BackoffPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            upstream,
            builder: QueryBuilder::new(resolver),
            translator,
            backoff,
            clock,
        }
    }

    /// Fetch every row matching `spec` into `sink`.
    pub async fn fetch<S: RowSink + ?Sized>(
        &self,
        spec: QuerySpec,
        page_size: u64,
        sink: &mut S,
        cancel: Option<&CancelSignal>,
    ) -> Result<FetchResult> {
        self.run(FetchCursor::start(spec), page_size, sink, cancel)
            .await
    }

    /// Continue a fetch from `cursor`. Batches continue the cursor's sequence
    /// numbering; rows before the cursor's offset are not requested again.
    pub async fn resume_from<S: RowSink + ?Sized>(
        &self,
        cursor: FetchCursor,
        page_size: u64,
        sink: &mut S,
        cancel: Option<&CancelSignal>,
    ) -> Result<FetchResult> {
        if cursor.completed {
            tracing::info!(dataset = %cursor.dataset_id, offset = cursor.offset, "Cursor already complete");
            return Ok(FetchResult {
                total_rows_emitted: 0,
                completed: true,
                cursor,
            });
        }
        tracing::info!(
            dataset = %cursor.dataset_id,
            offset = cursor.offset,
            sequence = cursor.next_sequence,
            "Resuming fetch"
        );
        self.run(cursor, page_size, sink, cancel).await
    }

    async fn run<S: RowSink + ?Sized>(
        &self,
        mut cursor: FetchCursor,
        page_size: u64,
        sink: &mut S,
        cancel: Option<&CancelSignal>,
    ) -> Result<FetchResult> {
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(ClientError::Validation(format!(
                "page size {} is outside 1..={}",
                page_size, MAX_PAGE_SIZE
            )));
        }
        if cursor.dataset_id != cursor.query.dataset_id {
            return Err(ClientError::Validation(format!(
                "cursor dataset '{}' does not match its query dataset '{}'",
                cursor.dataset_id, cursor.query.dataset_id
            )));
        }

        // Validation happens here, before the first data request.
        let params = self.builder.build(&cursor.query).await?;
        let dataset_id = cursor.dataset_id.clone();
        let mut emitted = 0u64;
        let mut first_request = true;

        tracing::info!(
            dataset = %dataset_id,
            offset = cursor.offset,
            page_size,
            row_cap = ?cursor.query.row_cap,
            "Starting fetch"
        );

        loop {
            if cursor.remaining_cap() == Some(0) {
                tracing::debug!(dataset = %dataset_id, offset = cursor.offset, "Row cap reached");
                break;
            }
            if cursor.total_known.is_some_and(|total| cursor.offset >= total) {
                break;
            }
            if cancel.is_some_and(CancelSignal::is_cancelled) {
                tracing::info!(
                    dataset = %dataset_id,
                    offset = cursor.offset,
                    emitted,
                    "Fetch cancelled"
                );
                sink.finish()
                    .await
                    .map_err(|source| sink_failure(&cursor, source))?;
                return Ok(FetchResult {
                    total_rows_emitted: emitted,
                    completed: false,
                    cursor,
                });
            }

            let request = PageRequest {
                top: page_size,
                skip: cursor.offset,
                inline_count: first_request && cursor.total_known.is_none(),
            };
            first_request = false;

            let page = retry_transient(
                &self.backoff,
                self.clock.as_ref(),
                &dataset_id,
                cursor.offset,
                || self.upstream.query_page(&params, request),
            )
            .await
            .map_err(|(cause, attempts)| {
                tracing::error!(
                    dataset = %dataset_id,
                    offset = cursor.offset,
                    attempts,
                    error = %cause,
                    "Page fetch failed"
                );
                ClientError::PageFetch {
                    dataset_id: dataset_id.clone(),
                    offset: cursor.offset,
                    attempts,
                    cause: Box::new(cause),
                    cursor: Box::new(cursor.clone()),
                }
            })?;

            if let Some(total) = page.total {
                cursor.total_known = Some(total);
            }
            let short_page = (page.rows.len() as u64) < page_size;
            let mut rows = page.rows;
            if let Some(remaining) = cursor.remaining_cap() {
                rows.truncate(usize::try_from(remaining).unwrap_or(usize::MAX));
            }
            if rows.is_empty() {
                if let Some(total) = cursor.total_known.filter(|t| cursor.offset < *t) {
                    tracing::warn!(
                        dataset = %dataset_id,
                        offset = cursor.offset,
                        total,
                        "Empty page before the reported total"
                    );
                }
                break;
            }
            if cursor.query.translate {
                if let Err(source) = self.translator.translate_rows(&dataset_id, &mut rows).await {
                    tracing::error!(
                        dataset = %dataset_id,
                        offset = cursor.offset,
                        error = %source,
                        "Batch translation failed"
                    );
                    return Err(ClientError::BatchTranslation {
                        dataset_id: dataset_id.clone(),
                        offset: cursor.offset,
                        source: Box::new(source),
                        cursor: Box::new(cursor.clone()),
                    });
                }
            }

            let batch = RowBatch {
                dataset_id: dataset_id.clone(),
                sequence: cursor.next_sequence,
                start: cursor.offset,
                rows,
            };
            let delivered = batch.len() as u64;
            sink.accept(batch)
                .await
                .map_err(|source| sink_failure(&cursor, source))?;

            cursor.offset += delivered;
            cursor.next_sequence += 1;
            emitted += delivered;
            tracing::debug!(
                dataset = %dataset_id,
                offset = cursor.offset,
                rows = delivered,
                total = ?cursor.total_known,
                "Batch delivered"
            );

            // Without a total, a short page is the only end marker.
            if short_page && cursor.total_known.is_none() {
                break;
            }
        }

        cursor.completed = true;
        sink.finish()
            .await
            .map_err(|source| sink_failure(&cursor, source))?;
        tracing::info!(
            dataset = %dataset_id,
            rows = emitted,
            batches = cursor.next_sequence,
            "Fetch complete"
        );
        Ok(FetchResult {
            total_rows_emitted: emitted,
            completed: true,
            cursor,
        })
    }
}

fn sink_failure(cursor: &FetchCursor, source: SinkError) -> ClientError {
    tracing::error!(
        dataset = %cursor.dataset_id,
        offset = cursor.offset,
        error = %source,
        "Sink rejected batch"
    );
    ClientError::Sink {
        dataset_id: cursor.dataset_id.clone(),
        offset: cursor.offset,
        source,
        cursor: Box::new(cursor.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_signal_shared_between_clones() {
        let signal = CancelSignal::new();
        let observer = signal.clone();
        assert!(!observer.is_cancelled());

        let waiter = tokio::spawn(async move { observer.cancelled().await });
        signal.cancel();
        waiter.await.unwrap();
        assert!(signal.is_cancelled());
    }
}
