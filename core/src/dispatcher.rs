use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::backoff::Exponential;
use crate::batcher::Batch;
use crate::errors::SinkError;
use crate::sink::{BulkClient, Document, ItemOutcome};
use crate::source::Partition;

/// Final outcome for one record of a dispatched batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkResult {
    pub partition: Partition,
    pub offset: i64,
    pub outcome: ItemOutcome,
}

/// Where a batch is in its delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    Pending,
    Retrying { attempt: u32 },
    Done,
}

impl DispatchState {
    fn attempt(self) -> u32 {
        match self {
            DispatchState::Retrying { attempt } => attempt,
            _ => 0,
        }
    }
}

/// Delivers batches through a [`BulkClient`], retrying what can be retried.
pub struct BulkDispatcher<C> {
    client: Arc<C>,
    backoff: Exponential,
    requests: AtomicU64,
    retries: AtomicU64,
}

impl<C: BulkClient> BulkDispatcher<C> {
    /// `backoff` is the retry policy of a single batch; each dispatch starts
    /// from a fresh copy of it.
    pub fn new(client: Arc<C>, backoff: Exponential) -> Self {
        Self {
            client,
            backoff,
            requests: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Bulk requests sent so far, retries included.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Writes `batch` and returns one result per record, in batch order, each of
    /// them either a success or a fatal failure.
    ///
    /// Fails with [`SinkError::RetriesExhausted`] when the store could not be
    /// reached within the retry budget; nothing of the batch is then known to
    /// be written. A request the store rejects as a whole (bad credentials,
    /// wrong endpoint) fails with that [`SinkError::FatalDelivery`] instead of
    /// being pinned on the individual documents.
    pub async fn dispatch(&self, batch: Batch) -> Result<Vec<BulkResult>, SinkError> {
        let mut outcomes: Vec<Option<ItemOutcome>> = vec![None; batch.len()];
        let mut pending: Vec<usize> = (0..batch.len()).collect();
        let mut backoff = self.backoff.clone();
        let mut state = if pending.is_empty() {
            DispatchState::Done
        } else {
            DispatchState::Pending
        };

        while state != DispatchState::Done {
            let attempt = state.attempt();
            let documents: Vec<Document> = pending
                .iter()
                .map(|&i| Document::from(&batch.records[i]))
                .collect();

            self.requests.fetch_add(1, Ordering::Relaxed);
            let response = self
                .client
                .bulk_write(&batch.index, &documents)
                .await
                .and_then(|items| {
                    if items.len() == documents.len() {
                        Ok(items)
                    } else {
                        Err(SinkError::RetryableDelivery {
                            reason: format!(
                                "store returned {} outcomes for {} documents",
                                items.len(),
                                documents.len()
                            ),
                        })
                    }
                });

            state = match response {
                Ok(items) => {
                    let mut retry = Vec::new();
                    for (&i, outcome) in pending.iter().zip(items) {
                        match outcome {
                            ItemOutcome::RetryableFailure(reason) => retry.push((i, reason)),
                            resolved => outcomes[i] = Some(resolved),
                        }
                    }

                    if retry.is_empty() {
                        DispatchState::Done
                    } else if let Some(delay) = backoff.next() {
                        warn!(
                            index = %batch.index,
                            failed = retry.len(),
                            attempt = attempt + 1,
                            "retrying documents after {:?}: {}",
                            delay,
                            retry[0].1
                        );
                        self.retries.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(delay).await;
                        pending = retry.into_iter().map(|(i, _)| i).collect();
                        DispatchState::Retrying {
                            attempt: attempt + 1,
                        }
                    } else {
                        for (i, reason) in retry {
                            outcomes[i] = Some(ItemOutcome::FatalFailure(format!(
                                "retries exhausted after {} attempts: {}",
                                attempt + 1,
                                reason
                            )));
                        }
                        DispatchState::Done
                    }
                }
                Err(e) if e.is_retryable() => match backoff.next() {
                    Some(delay) => {
                        warn!(
                            index = %batch.index,
                            attempt = attempt + 1,
                            "bulk request failed, retrying after {:?}: {}",
                            delay,
                            e
                        );
                        self.retries.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(delay).await;
                        DispatchState::Retrying {
                            attempt: attempt + 1,
                        }
                    }
                    None => {
                        return Err(SinkError::RetriesExhausted {
                            attempts: attempt + 1,
                            reason: e.to_string(),
                        });
                    }
                },
                Err(e) => return Err(e),
            };
        }

        debug!(index = %batch.index, items = batch.len(), "batch resolved");
        Ok(batch
            .records
            .into_iter()
            .zip(outcomes)
            .map(|(record, outcome)| BulkResult {
                partition: record.partition,
                offset: record.offset,
                outcome: outcome
                    .unwrap_or_else(|| ItemOutcome::FatalFailure("no outcome".to_string())),
            })
            .collect())
    }
}
