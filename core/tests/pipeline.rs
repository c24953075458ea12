use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sink_core::config::{
    BULK_SIZE, COMMIT_INTERVAL_MS, DATE_FORMAT, FLUSH_INTERVAL_MS, HOSTS, INDEXES,
    MAX_IN_FLIGHT_REQUESTS, MAX_RETRIES, MAX_RETRY_BACKOFF_MS, RETRY_BACKOFF_MS,
    SHUTDOWN_TIMEOUT_MS, TOPICS,
};
use sink_core::{
    BulkClient, Document, ItemOutcome, Partition, PipelineState, Record, RecordSource, SinkConfig,
    SinkError, SinkPipeline,
};

const TOPIC: &str = "orders";

#[derive(Default)]
struct SourceState {
    chunks: Mutex<VecDeque<Vec<Record>>>,
    commits: Mutex<Vec<(Partition, i64)>>,
    pulls: AtomicUsize,
    shut_down: AtomicBool,
}

/// In-memory queue handing out pre-built chunks of records.
#[derive(Clone, Default)]
struct FakeSource {
    state: Arc<SourceState>,
}

impl FakeSource {
    fn with_records(records: Vec<Record>, chunk_size: usize) -> Self {
        let source = FakeSource::default();
        {
            let mut chunks = source.state.chunks.lock().unwrap();
            for chunk in records.chunks(chunk_size) {
                chunks.push_back(chunk.to_vec());
            }
        }
        source
    }

    fn last_commit(&self, partition: &Partition) -> Option<i64> {
        self.state
            .commits
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _)| p == partition)
            .map(|(_, offset)| *offset)
    }

    fn commit_count(&self) -> usize {
        self.state.commits.lock().unwrap().len()
    }
}

#[async_trait]
impl RecordSource for FakeSource {
    async fn pull_records(&self) -> Result<Vec<Record>, SinkError> {
        self.state.pulls.fetch_add(1, Ordering::SeqCst);
        let next = self.state.chunks.lock().unwrap().pop_front();
        match next {
            Some(chunk) => Ok(chunk),
            None => {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(Vec::new())
            }
        }
    }

    async fn commit_offset(&self, partition: &Partition, offset: i64) -> Result<(), SinkError> {
        self.state
            .commits
            .lock()
            .unwrap()
            .push((partition.clone(), offset));
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), SinkError> {
        self.state.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum StoreMode {
    Healthy,
    /// `connect` fails.
    Unreachable,
    /// Every bulk request fails to connect.
    Down,
    /// Every bulk request is refused as a whole.
    Unauthorized,
    /// Bulk requests never answer.
    Stalled,
}

#[derive(Default)]
struct StoreState {
    indexed: Mutex<Vec<(String, String)>>,
    documents: Mutex<HashMap<String, Vec<u8>>>,
    seen: Mutex<HashSet<String>>,
}

/// In-memory store. Ids in `flaky` fail once, ids in `rejected` always fail,
/// requests carrying an id in `unreachable_for` fail to connect.
#[derive(Clone)]
struct FakeStore {
    mode: StoreMode,
    flaky: Arc<HashSet<String>>,
    rejected: Arc<HashSet<String>>,
    unreachable_for: Arc<HashSet<String>>,
    state: Arc<StoreState>,
}

impl FakeStore {
    fn new(mode: StoreMode) -> Self {
        Self {
            mode,
            flaky: Arc::default(),
            rejected: Arc::default(),
            unreachable_for: Arc::default(),
            state: Arc::default(),
        }
    }

    fn with_unreachable_for(mut self, ids: &[&str]) -> Self {
        self.unreachable_for = Arc::new(ids.iter().map(|id| id.to_string()).collect());
        self
    }

    fn document(&self, id: &str) -> Option<String> {
        self.state
            .documents
            .lock()
            .unwrap()
            .get(id)
            .map(|body| String::from_utf8_lossy(body).into_owned())
    }

    fn with_flaky(mut self, ids: &[&str]) -> Self {
        self.flaky = Arc::new(ids.iter().map(|id| id.to_string()).collect());
        self
    }

    fn with_rejected(mut self, ids: &[&str]) -> Self {
        self.rejected = Arc::new(ids.iter().map(|id| id.to_string()).collect());
        self
    }

    fn indexed(&self) -> Vec<(String, String)> {
        self.state.indexed.lock().unwrap().clone()
    }
}

#[async_trait]
impl BulkClient for FakeStore {
    async fn connect(&self) -> Result<(), SinkError> {
        match self.mode {
            StoreMode::Unreachable => Err(SinkError::Connection {
                reason: "connection refused".to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn bulk_write(
        &self,
        index: &str,
        documents: &[Document],
    ) -> Result<Vec<ItemOutcome>, SinkError> {
        match self.mode {
            StoreMode::Down => {
                return Err(SinkError::Connection {
                    reason: "connection reset".to_string(),
                });
            }
            StoreMode::Unauthorized => {
                return Err(SinkError::FatalDelivery {
                    reason: "401 Unauthorized".to_string(),
                });
            }
            StoreMode::Stalled => tokio::time::sleep(Duration::from_secs(3600)).await,
            StoreMode::Healthy | StoreMode::Unreachable => {}
        }
        if documents
            .iter()
            .any(|doc| self.unreachable_for.contains(&doc.id))
        {
            return Err(SinkError::Connection {
                reason: "connection reset".to_string(),
            });
        }

        let mut seen = self.state.seen.lock().unwrap();
        let mut indexed = self.state.indexed.lock().unwrap();
        let mut stored = self.state.documents.lock().unwrap();
        let outcomes = documents
            .iter()
            .map(|doc| {
                let first_attempt = seen.insert(doc.id.clone());
                if self.rejected.contains(&doc.id) {
                    ItemOutcome::FatalFailure("mapper_parsing_exception: bad field".to_string())
                } else if first_attempt && self.flaky.contains(&doc.id) {
                    ItemOutcome::RetryableFailure("es_rejected_execution_exception".to_string())
                } else {
                    indexed.push((index.to_string(), doc.id.clone()));
                    stored.insert(doc.id.clone(), doc.body.clone());
                    ItemOutcome::Success
                }
            })
            .collect();
        Ok(outcomes)
    }
}

fn record(partition: i32, offset: i64) -> Record {
    Record {
        partition: Partition::new(TOPIC, partition),
        offset,
        stream: TOPIC.to_string(),
        key: None,
        value: format!(r#"{{"order":{offset}}}"#).into_bytes(),
        timestamp: None,
    }
}

fn keyed(partition: i32, offset: i64, key: &str, body: &str) -> Record {
    Record {
        key: Some(key.as_bytes().to_vec()),
        value: body.as_bytes().to_vec(),
        ..record(partition, offset)
    }
}

fn records(partition: i32, count: i64) -> Vec<Record> {
    (0..count).map(|offset| record(partition, offset)).collect()
}

fn config(extra: &[(&str, &str)]) -> SinkConfig {
    let mut props = HashMap::from([
        (HOSTS.to_string(), "http://localhost:9200".to_string()),
        (BULK_SIZE.to_string(), "5".to_string()),
        (TOPICS.to_string(), TOPIC.to_string()),
        (INDEXES.to_string(), "orders-idx".to_string()),
        (FLUSH_INTERVAL_MS.to_string(), "50".to_string()),
        (COMMIT_INTERVAL_MS.to_string(), "100".to_string()),
        (MAX_RETRIES.to_string(), "3".to_string()),
        (RETRY_BACKOFF_MS.to_string(), "10".to_string()),
        (MAX_RETRY_BACKOFF_MS.to_string(), "50".to_string()),
    ]);
    for (key, value) in extra {
        props.insert(key.to_string(), value.to_string());
    }
    SinkConfig::from_properties(&props).unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn test_records_are_indexed_and_committed() {
    let mut all = records(0, 10);
    all.extend(records(1, 10));
    let source = FakeSource::with_records(all, 4);
    let store = FakeStore::new(StoreMode::Healthy);
    let pipeline = Arc::new(SinkPipeline::new(
        config(&[]),
        source.clone(),
        store.clone(),
    ));

    let running = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.run().await }
    });
    wait_until(|| store.indexed().len() == 20).await;
    assert_eq!(pipeline.state(), PipelineState::Running);

    pipeline.stop();
    let report = running.await.unwrap().unwrap();

    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(report.metrics.records_received, 20);
    assert_eq!(report.metrics.documents_indexed, 20);
    assert_eq!(report.metrics.documents_failed, 0);
    assert!(report.fatal_items.is_empty());

    let p0 = Partition::new(TOPIC, 0);
    let p1 = Partition::new(TOPIC, 1);
    assert_eq!(report.committed.get(&p0), Some(&9));
    assert_eq!(report.committed.get(&p1), Some(&9));
    assert_eq!(source.last_commit(&p0), Some(9));
    assert_eq!(source.last_commit(&p1), Some(9));
    assert!(source.state.shut_down.load(Ordering::SeqCst));

    let indexed = store.indexed();
    assert!(indexed.iter().all(|(index, _)| index == "orders-idx"));
    let ids: HashSet<_> = indexed.iter().map(|(_, id)| id.as_str()).collect();
    assert_eq!(ids.len(), 20);
    assert!(ids.contains("orders+1+7"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_item_failures_are_retried() {
    let source = FakeSource::with_records(records(0, 10), 10);
    let store = FakeStore::new(StoreMode::Healthy).with_flaky(&["orders+0+2", "orders+0+7"]);
    let pipeline = Arc::new(SinkPipeline::new(
        config(&[]),
        source.clone(),
        store.clone(),
    ));

    let running = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.run().await }
    });
    wait_until(|| store.indexed().len() == 10).await;
    pipeline.stop();
    let report = running.await.unwrap().unwrap();

    assert_eq!(report.metrics.documents_indexed, 10);
    assert_eq!(report.metrics.bulk_retries, 2);
    assert_eq!(report.metrics.bulk_requests, 4);
    assert_eq!(source.last_commit(&Partition::new(TOPIC, 0)), Some(9));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_documents_are_reported_and_committed_past() {
    let source = FakeSource::with_records(records(0, 5), 5);
    let store = FakeStore::new(StoreMode::Healthy).with_rejected(&["orders+0+1"]);
    let pipeline = Arc::new(SinkPipeline::new(
        config(&[]),
        source.clone(),
        store.clone(),
    ));

    let running = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.run().await }
    });
    let p0 = Partition::new(TOPIC, 0);
    wait_until(|| source.last_commit(&p0) == Some(4)).await;
    pipeline.stop();
    let report = running.await.unwrap().unwrap();

    assert_eq!(report.metrics.documents_indexed, 4);
    assert_eq!(report.metrics.documents_failed, 1);
    assert_eq!(report.fatal_items.len(), 1);
    let fatal = &report.fatal_items[0];
    assert_eq!(fatal.partition, p0);
    assert_eq!(fatal.offset, 1);
    assert_eq!(fatal.index, "orders-idx");
    assert!(fatal.reason.contains("mapper_parsing_exception"));
}

#[tokio::test(start_paused = true)]
async fn test_partial_batches_flush_on_interval() {
    let source = FakeSource::with_records(records(0, 3), 3);
    let store = FakeStore::new(StoreMode::Healthy);
    let pipeline = Arc::new(SinkPipeline::new(
        config(&[(BULK_SIZE, "100")]),
        source.clone(),
        store.clone(),
    ));

    let running = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.run().await }
    });
    let p0 = Partition::new(TOPIC, 0);
    wait_until(|| source.last_commit(&p0) == Some(2)).await;
    assert_eq!(store.indexed().len(), 3);
    assert_eq!(pipeline.state(), PipelineState::Running);

    pipeline.stop();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_drains_buffered_records() {
    let source = FakeSource::with_records(records(0, 7), 7);
    let store = FakeStore::new(StoreMode::Healthy);
    let pipeline = Arc::new(SinkPipeline::new(
        config(&[(BULK_SIZE, "100"), (FLUSH_INTERVAL_MS, "600000")]),
        source.clone(),
        store.clone(),
    ));

    let running = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.run().await }
    });
    wait_until(|| pipeline.tracker().outstanding() == 7).await;
    assert!(store.indexed().is_empty());

    pipeline.stop();
    let report = running.await.unwrap().unwrap();

    assert_eq!(store.indexed().len(), 7);
    assert_eq!(report.metrics.batches_dispatched, 1);
    assert_eq!(source.last_commit(&Partition::new(TOPIC, 0)), Some(6));
    assert_eq!(pipeline.tracker().outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timestamped_records_go_to_dated_indexes() {
    let mut first = record(0, 0);
    first.timestamp = Some(Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap());
    let mut second = record(0, 1);
    second.timestamp = Some(Utc.with_ymd_and_hms(2024, 1, 16, 23, 59, 0).unwrap());
    let source = FakeSource::with_records(vec![first, second], 2);
    let store = FakeStore::new(StoreMode::Healthy);
    let pipeline = Arc::new(SinkPipeline::new(
        config(&[(DATE_FORMAT, "yyyy.MM.dd")]),
        source.clone(),
        store.clone(),
    ));

    let running = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.run().await }
    });
    wait_until(|| store.indexed().len() == 2).await;
    pipeline.stop();
    running.await.unwrap().unwrap();

    let mut indexes: Vec<_> = store.indexed().into_iter().map(|(index, _)| index).collect();
    indexes.sort();
    assert_eq!(indexes, vec!["orders-idx-2024.01.15", "orders-idx-2024.01.16"]);
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_fails_without_committing() {
    let source = FakeSource::with_records(records(0, 5), 5);
    let store = FakeStore::new(StoreMode::Down);
    let pipeline = SinkPipeline::new(config(&[]), source.clone(), store);

    let result = pipeline.run().await;

    assert!(
        matches!(result, Err(SinkError::RetriesExhausted { attempts: 4, .. })),
        "unexpected result: {result:?}"
    );
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert_eq!(source.commit_count(), 0);
    assert_eq!(pipeline.tracker().safe_offset(&Partition::new(TOPIC, 0)), None);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_store_fails_start() {
    let source = FakeSource::with_records(records(0, 5), 5);
    let pipeline = SinkPipeline::new(
        config(&[]),
        source.clone(),
        FakeStore::new(StoreMode::Unreachable),
    );

    let result = pipeline.run().await;

    assert!(matches!(result, Err(SinkError::RetriesExhausted { .. })));
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert_eq!(source.state.pulls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_config_fails_start() {
    let mut bad = config(&[]);
    bad.hosts.clear();
    let source = FakeSource::default();
    let pipeline = SinkPipeline::new(bad, source.clone(), FakeStore::new(StoreMode::Healthy));

    let result = pipeline.run().await;

    assert!(matches!(result, Err(SinkError::Config(_))));
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert_eq!(source.state.pulls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retried_document_never_overwrites_newer_version() {
    let source = FakeSource::with_records(
        vec![
            keyed(0, 0, "order-42", r#"{"state":"v1"}"#),
            keyed(0, 1, "order-42", r#"{"state":"v2"}"#),
        ],
        2,
    );
    let store = FakeStore::new(StoreMode::Healthy).with_flaky(&["order-42"]);
    let pipeline = Arc::new(SinkPipeline::new(
        config(&[
            (BULK_SIZE, "1"),
            (RETRY_BACKOFF_MS, "200"),
            (MAX_RETRY_BACKOFF_MS, "1000"),
        ]),
        source.clone(),
        store.clone(),
    ));

    let running = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.run().await }
    });
    let p0 = Partition::new(TOPIC, 0);
    wait_until(|| source.last_commit(&p0) == Some(1)).await;
    pipeline.stop();
    let report = running.await.unwrap().unwrap();

    assert_eq!(store.document("order-42").as_deref(), Some(r#"{"state":"v2"}"#));
    assert_eq!(report.metrics.batches_dispatched, 2);
    assert_eq!(report.metrics.bulk_retries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_bulk_request_fails_without_committing() {
    let source = FakeSource::with_records(records(0, 5), 5);
    let store = FakeStore::new(StoreMode::Unauthorized);
    let pipeline = SinkPipeline::new(config(&[]), source.clone(), store.clone());

    let result = pipeline.run().await;

    assert!(
        matches!(result, Err(SinkError::FatalDelivery { ref reason }) if reason == "401 Unauthorized"),
        "unexpected result: {result:?}"
    );
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert_eq!(source.commit_count(), 0);
    assert!(store.indexed().is_empty());
    assert_eq!(pipeline.tracker().safe_offset(&Partition::new(TOPIC, 0)), None);
}

#[tokio::test(start_paused = true)]
async fn test_failure_commits_only_acknowledged_partitions() {
    let mut all = records(0, 5);
    all.extend(records(1, 5));
    let source = FakeSource::with_records(all, 5);
    let store = FakeStore::new(StoreMode::Healthy).with_unreachable_for(&["orders+1+0"]);
    let pipeline = SinkPipeline::new(config(&[]), source.clone(), store.clone());

    let result = pipeline.run().await;

    assert!(
        matches!(result, Err(SinkError::RetriesExhausted { attempts: 4, .. })),
        "unexpected result: {result:?}"
    );
    assert_eq!(pipeline.state(), PipelineState::Failed);
    let p0 = Partition::new(TOPIC, 0);
    let p1 = Partition::new(TOPIC, 1);
    assert_eq!(source.last_commit(&p0), Some(4));
    assert_eq!(source.last_commit(&p1), None);
    assert_eq!(pipeline.tracker().safe_offset(&p1), None);
    assert_eq!(store.indexed().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_timeout_abandons_unfinished_writes() {
    let source = FakeSource::with_records(records(0, 5), 5);
    let store = FakeStore::new(StoreMode::Stalled);
    let pipeline = Arc::new(SinkPipeline::new(
        config(&[(SHUTDOWN_TIMEOUT_MS, "200")]),
        source.clone(),
        store.clone(),
    ));

    let running = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.run().await }
    });
    wait_until(|| pipeline.tracker().outstanding() == 5).await;
    pipeline.stop();
    let report = running.await.unwrap().unwrap();

    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(report.metrics.documents_indexed, 0);
    assert!(report.committed.is_empty());
    assert_eq!(source.commit_count(), 0);
    assert_eq!(pipeline.tracker().outstanding(), 5);
    assert!(source.state.shut_down.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_intake_pauses_at_in_flight_bound() {
    let source = FakeSource::with_records(records(0, 6), 6);
    let store = FakeStore::new(StoreMode::Stalled);
    let pipeline = Arc::new(SinkPipeline::new(
        config(&[
            (BULK_SIZE, "1"),
            (MAX_IN_FLIGHT_REQUESTS, "2"),
            (SHUTDOWN_TIMEOUT_MS, "100"),
        ]),
        source.clone(),
        store,
    ));

    let running = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.run().await }
    });
    wait_until(|| pipeline.tracker().outstanding() == 2).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(pipeline.tracker().outstanding(), 2);

    pipeline.stop();
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.metrics.records_received, 6);
    assert_eq!(source.commit_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pipeline_runs_only_once() {
    let pipeline = SinkPipeline::new(
        config(&[]),
        FakeSource::default(),
        FakeStore::new(StoreMode::Healthy),
    );
    pipeline.stop();
    pipeline.run().await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Stopped);

    let second = pipeline.run().await;

    assert!(matches!(second, Err(SinkError::Generic(_))));
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}
