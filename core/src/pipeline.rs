//! The sink pipeline orchestrates the data flow from queue to store:
//! pull -> name -> batch -> bulk write -> acknowledge -> commit.
//!
//! ```text
//!  Stopped -> Starting -> Running -> Draining -> Stopped
//!                 \          \
//!                  `----------`--> Failed
//! ```
//!
//! Pulling and timed flushing run in their own tasks and hand their output to
//! the pipeline loop over bounded channels. Closed batches are dispatched in
//! their own tasks, at most one per index at a time, so a retried document can
//! never overwrite a newer version of itself. Completions are folded into the
//! [`OffsetTracker`] and only its safe offsets are ever committed back to the
//! queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batcher::{Batch, RecordBatcher};
use crate::config::SinkConfig;
use crate::dispatcher::{BulkDispatcher, BulkResult};
use crate::errors::{Result, SinkError};
use crate::index_namer::IndexNamer;
use crate::sink::{BulkClient, ItemOutcome};
use crate::source::{Partition, Record, RecordSource};
use crate::telemetry::PipelineMetrics;
use crate::tracker::OffsetTracker;

const RECORD_CHANNEL_CAPACITY: usize = 4;
const BATCH_CHANNEL_CAPACITY: usize = 64;
const PULL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_REPORTED_FATAL_ITEMS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Draining,
    Failed,
}

/// A record the store permanently refused. It counts as acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct FatalItem {
    pub partition: Partition,
    pub offset: i64,
    pub index: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub metrics: PipelineMetrics,
    pub fatal_items: Vec<FatalItem>,
    /// Last offset committed per partition.
    pub committed: HashMap<Partition, i64>,
}

type DispatchOutput = (String, Result<Vec<BulkResult>>);

/// Mutable bookkeeping of one `run`, owned by the pipeline loop.
#[derive(Default)]
struct RunState {
    inflight: JoinSet<DispatchOutput>,
    /// Indexes with a dispatch in flight.
    busy: HashSet<String>,
    /// Closed batches waiting for their index to be free, oldest first.
    queued: HashMap<String, VecDeque<Batch>>,
    /// Pulled records held back while the in-flight bound is reached.
    backlog: VecDeque<Record>,
    report: PipelineReport,
}

impl RunState {
    fn queued_batches(&self) -> usize {
        self.queued.values().map(VecDeque::len).sum()
    }

    /// Closed batches not yet resolved, running or waiting.
    fn open_dispatches(&self) -> usize {
        self.inflight.len() + self.queued_batches()
    }

    fn next_queued(&mut self, index: &str) -> Option<Batch> {
        let queue = self.queued.get_mut(index)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            self.queued.remove(index);
        }
        next
    }
}

pub struct SinkPipeline<S, C> {
    config: SinkConfig,
    source: Arc<S>,
    batcher: Arc<RecordBatcher>,
    dispatcher: Arc<BulkDispatcher<C>>,
    tracker: Arc<OffsetTracker>,
    state: watch::Sender<PipelineState>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl<S: RecordSource, C: BulkClient> SinkPipeline<S, C> {
    /// Builds a pipeline in the `Stopped` state. The configuration is checked
    /// when the pipeline starts.
    pub fn new(config: SinkConfig, source: S, client: C) -> Self {
        let batcher = RecordBatcher::new(config.bulk_size, config.bulk_max_bytes);
        let dispatcher = BulkDispatcher::new(Arc::new(client), config.retry_backoff());
        let (state, _) = watch::channel(PipelineState::Stopped);

        Self {
            config,
            source: Arc::new(source),
            batcher: Arc::new(batcher),
            dispatcher: Arc::new(dispatcher),
            tracker: Arc::new(OffsetTracker::new()),
            state,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Watches state transitions.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn tracker(&self) -> &OffsetTracker {
        &self.tracker
    }

    /// Asks a running pipeline to drain and stop. Returns immediately.
    pub fn stop(&self) {
        info!("Stop requested");
        self.shutdown.cancel();
    }

    fn transition(&self, next: PipelineState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = ?previous, to = ?next, "pipeline state changed");
        }
    }

    /// Runs the pipeline until [`SinkPipeline::stop`] is called or an
    /// unrecoverable error occurs.
    ///
    /// A pipeline runs once. To resume after it stopped or failed, build a new
    /// one; records left unacknowledged are then redelivered by the queue.
    pub async fn run(&self) -> Result<PipelineReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(anyhow::anyhow!(
                "pipeline has already run and ended {:?}; build a new one to restart",
                self.state()
            )
            .into());
        }

        self.transition(PipelineState::Starting);
        let namer = match self.start().await {
            Ok(namer) => namer,
            Err(e) => {
                error!("Pipeline failed to start: {}", e);
                self.transition(PipelineState::Failed);
                return Err(e);
            }
        };

        self.transition(PipelineState::Running);
        let intake = self.shutdown.child_token();
        let (records_tx, mut records_rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);
        let (batches_tx, mut batches_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let mut puller = self.spawn_puller(records_tx, intake.clone());
        let flusher = self.spawn_flusher(batches_tx, intake.clone());
        let mut run = RunState::default();

        let mut commit_ticker = interval(self.config.commit_interval());
        commit_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        commit_ticker.tick().await;
        let max_in_flight = self.config.processing.max_in_flight_requests;

        let failure = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break None,
                Some(joined) = run.inflight.join_next(), if !run.inflight.is_empty() => {
                    if let Err(e) = self.complete(&mut run, joined) {
                        break Some(e);
                    }
                    self.accept_backlog(&namer, &mut run, max_in_flight);
                }
                pulled = records_rx.recv(),
                    if run.backlog.is_empty() && run.open_dispatches() < max_in_flight => {
                    match pulled {
                        Some(records) => {
                            run.backlog.extend(records);
                            self.accept_backlog(&namer, &mut run, max_in_flight);
                        }
                        None => {
                            break match (&mut puller).await {
                                Ok(Ok(())) => None,
                                Ok(Err(e)) => Some(e),
                                Err(e) => Some(anyhow::anyhow!("record puller panicked: {e}").into()),
                            };
                        }
                    }
                }
                Some(batch) = batches_rx.recv() => self.submit(&mut run, batch),
                _ = commit_ticker.tick() => self.commit(&mut run).await,
            }
        };

        if let Some(e) = failure {
            return Err(self.fail(&mut run, &intake, e).await);
        }

        self.transition(PipelineState::Draining);
        intake.cancel();

        // whatever was pulled or flushed before intake stopped still gets written
        records_rx.close();
        while let Some(records) = records_rx.recv().await {
            run.backlog.extend(records);
        }
        while let Some(record) = run.backlog.pop_front() {
            self.accept(&namer, &mut run, record);
        }
        while let Some(batch) = batches_rx.recv().await {
            self.submit(&mut run, batch);
        }
        if let Err(e) = flusher.await {
            warn!("Flusher task ended abnormally: {}", e);
        }
        for batch in self.batcher.flush() {
            self.submit(&mut run, batch);
        }

        info!("Draining {} bulk requests", run.open_dispatches());
        let drained = timeout(self.config.shutdown_timeout(), async {
            while let Some(joined) = run.inflight.join_next().await {
                self.complete(&mut run, joined)?;
            }
            Ok::<(), SinkError>(())
        })
        .await;

        match drained {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.fail(&mut run, &intake, e).await),
            Err(_) => {
                warn!(
                    "Shutdown timeout reached, abandoning {} bulk requests; their records will be redelivered",
                    run.open_dispatches()
                );
                self.abandon(&mut run).await;
            }
        }

        self.commit(&mut run).await;
        if let Err(e) = self.source.shutdown().await {
            warn!("Source shutdown failed: {}", e);
        }

        self.transition(PipelineState::Stopped);
        let report = self.finish(run);
        info!("Pipeline stopped. Final metrics: {:?}", report.metrics);
        Ok(report)
    }

    /// Validates the configuration and waits for the store to be reachable.
    async fn start(&self) -> Result<IndexNamer> {
        self.config.validate()?;
        let namer = IndexNamer::from_config(&self.config)?;

        let mut backoff = self.config.retry_backoff();
        loop {
            match self.dispatcher.client().connect().await {
                Ok(()) => return Ok(namer),
                Err(e) if e.is_retryable() => match backoff.next() {
                    Some(delay) => {
                        warn!("Store not reachable, retrying in {:?}: {}", delay, e);
                        tokio::select! {
                            _ = self.shutdown.cancelled() => return Err(e),
                            _ = sleep(delay) => {}
                        }
                    }
                    None => {
                        return Err(SinkError::RetriesExhausted {
                            attempts: backoff.current_attempt() + 1,
                            reason: e.to_string(),
                        });
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn spawn_puller(
        &self,
        records_tx: mpsc::Sender<Vec<Record>>,
        intake: CancellationToken,
    ) -> JoinHandle<Result<()>> {
        let source = Arc::clone(&self.source);
        tokio::spawn(async move {
            loop {
                let pulled = tokio::select! {
                    _ = intake.cancelled() => return Ok(()),
                    pulled = source.pull_records() => pulled,
                };
                match pulled {
                    Ok(records) if records.is_empty() => tokio::task::yield_now().await,
                    Ok(records) => {
                        tokio::select! {
                            _ = intake.cancelled() => return Ok(()),
                            sent = records_tx.send(records) => {
                                if sent.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        warn!("Pulling records failed, retrying in {:?}: {}", PULL_RETRY_DELAY, e);
                        tokio::select! {
                            _ = intake.cancelled() => return Ok(()),
                            _ = sleep(PULL_RETRY_DELAY) => {}
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }

    fn spawn_flusher(
        &self,
        batches_tx: mpsc::Sender<Batch>,
        intake: CancellationToken,
    ) -> JoinHandle<()> {
        let batcher = Arc::clone(&self.batcher);
        let period = self.config.flush_interval();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = intake.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                for batch in batcher.flush() {
                    debug!(index = %batch.index, items = batch.len(), "flush interval elapsed");
                    if batches_tx.send(batch).await.is_err() {
                        return;
                    }
                }
            }
        })
    }

    /// Accepts held back records one at a time until the in-flight bound is reached.
    fn accept_backlog(&self, namer: &IndexNamer, run: &mut RunState, max_in_flight: usize) {
        while run.open_dispatches() < max_in_flight {
            let Some(record) = run.backlog.pop_front() else {
                break;
            };
            self.accept(namer, run, record);
        }
    }

    fn accept(&self, namer: &IndexNamer, run: &mut RunState, record: Record) {
        run.report.metrics.records_received += 1;
        run.report.metrics.bytes_received += record.size() as u64;
        self.tracker.track(&record.partition, record.offset);

        let index = namer.name_for(&record.stream, record.timestamp);
        if let Some(batch) = self.batcher.offer(&index, record) {
            self.submit(run, batch);
        }
    }

    /// Dispatches `batch` now, or queues it behind the batch in flight for its index.
    fn submit(&self, run: &mut RunState, batch: Batch) {
        run.report.metrics.record_batch(batch.len());
        if run.busy.contains(&batch.index) {
            debug!(index = %batch.index, "index busy, queueing batch");
            run.queued
                .entry(batch.index.clone())
                .or_default()
                .push_back(batch);
        } else {
            self.spawn_dispatch(run, batch);
        }
    }

    fn spawn_dispatch(&self, run: &mut RunState, batch: Batch) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let index = batch.index.clone();
        run.busy.insert(index.clone());
        run.inflight
            .spawn(async move { (index, dispatcher.dispatch(batch).await) });
    }

    /// Folds a finished dispatch into the tracker and starts the next batch of
    /// its index. Errors returned here end the run.
    fn complete(
        &self,
        run: &mut RunState,
        joined: std::result::Result<DispatchOutput, JoinError>,
    ) -> Result<()> {
        let (index, results) = match joined {
            Ok(output) => output,
            Err(e) if e.is_cancelled() => return Ok(()),
            Err(e) => return Err(anyhow::anyhow!("bulk dispatch panicked: {e}").into()),
        };
        run.busy.remove(&index);

        for result in results? {
            match result.outcome {
                ItemOutcome::Success => run.report.metrics.documents_indexed += 1,
                ItemOutcome::FatalFailure(reason) => {
                    error!(
                        partition = %result.partition,
                        offset = result.offset,
                        index = %index,
                        "document permanently rejected: {}",
                        reason
                    );
                    run.report.metrics.documents_failed += 1;
                    if run.report.fatal_items.len() < MAX_REPORTED_FATAL_ITEMS {
                        run.report.fatal_items.push(FatalItem {
                            partition: result.partition.clone(),
                            offset: result.offset,
                            index: index.clone(),
                            reason,
                        });
                    }
                }
                ItemOutcome::RetryableFailure(reason) => {
                    // left unacknowledged, the record is redelivered after a restart
                    warn!(
                        partition = %result.partition,
                        offset = result.offset,
                        "unresolved document: {}",
                        reason
                    );
                    continue;
                }
            }
            self.tracker.record_ack(&result.partition, result.offset);
        }

        if let Some(next) = run.next_queued(&index) {
            self.spawn_dispatch(run, next);
        }
        Ok(())
    }

    /// Commits every safe offset that moved since the last commit.
    async fn commit(&self, run: &mut RunState) {
        for (partition, offset) in self.tracker.safe_offsets() {
            if run.report.committed.get(&partition) == Some(&offset) {
                continue;
            }
            match self.source.commit_offset(&partition, offset).await {
                Ok(()) => {
                    debug!(%partition, offset, "offset committed");
                    run.report.metrics.offset_commits += 1;
                    run.report.committed.insert(partition, offset);
                }
                Err(e) => warn!("Committing offset {} of {} failed: {}", offset, partition, e),
            }
        }
    }

    /// Drops every unresolved batch. Their records stay unacknowledged.
    async fn abandon(&self, run: &mut RunState) {
        run.queued.clear();
        run.backlog.clear();
        run.inflight.abort_all();
        while run.inflight.join_next().await.is_some() {}
        run.busy.clear();
    }

    async fn fail(
        &self,
        run: &mut RunState,
        intake: &CancellationToken,
        cause: SinkError,
    ) -> SinkError {
        error!("Pipeline failed: {}", cause);
        intake.cancel();
        self.abandon(run).await;
        // offsets acknowledged before the failure are still durable
        self.commit(run).await;
        self.transition(PipelineState::Failed);
        cause
    }

    fn finish(&self, run: RunState) -> PipelineReport {
        let mut report = run.report;
        report.metrics.bulk_requests = self.dispatcher.requests();
        report.metrics.bulk_retries = self.dispatcher.retries();
        report
    }
}
