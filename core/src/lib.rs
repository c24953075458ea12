pub mod backoff;
pub mod batcher;
pub mod config;
pub mod connector;
pub mod dispatcher;
pub mod errors;
pub mod index_namer;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod telemetry;
pub mod tracker;

pub use config::SinkConfig;
pub use connector::SinkConnector;
pub use errors::{ConfigError, Result, SinkError};
pub use pipeline::{PipelineReport, PipelineState, SinkPipeline};
pub use sink::elasticsearch::ElasticsearchClient;
pub use sink::{BulkClient, Document, ItemOutcome};
pub use source::kafka::KafkaSource;
pub use source::{Partition, Record, RecordSource};
