use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sink_core=info,search_sink=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct PipelineMetrics {
    pub records_received: usize,
    pub bytes_received: u64,
    pub batches_dispatched: usize,
    pub avg_batch_size: f64,
    pub bulk_requests: u64,
    pub bulk_retries: u64,
    pub documents_indexed: usize,
    pub documents_failed: usize,
    pub offset_commits: usize,
}

impl PipelineMetrics {
    pub(crate) fn record_batch(&mut self, size: usize) {
        self.batches_dispatched += 1;
        let total = self.avg_batch_size * (self.batches_dispatched - 1) as f64 + size as f64;
        self.avg_batch_size = total / self.batches_dispatched as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_batch_size() {
        let mut metrics = PipelineMetrics::default();
        metrics.record_batch(10);
        metrics.record_batch(20);
        metrics.record_batch(30);

        assert_eq!(metrics.batches_dispatched, 3);
        assert_eq!(metrics.avg_batch_size, 20.0);
    }
}
