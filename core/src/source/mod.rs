pub mod kafka;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::SinkError;

/// A topic partition, the unit of ordering and of offset commits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    pub topic: String,
    pub partition: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A record received from the queue. Never mutated after it is pulled.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub partition: Partition,
    pub offset: i64,
    /// Logical stream name, used to pick the target index.
    pub stream: String,
    pub key: Option<Vec<u8>>,
    /// Document body.
    pub value: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Record {
    /// Bytes the record contributes to a bulk request body.
    pub fn size(&self) -> usize {
        self.key.as_ref().map_or(0, Vec::len) + self.value.len()
    }

    /// Stable document id. Replays of the same record overwrite the same document.
    pub fn document_id(&self) -> String {
        match self.key.as_deref().map(std::str::from_utf8) {
            Some(Ok(key)) if !key.is_empty() => key.to_string(),
            _ => format!(
                "{}+{}+{}",
                self.partition.topic, self.partition.partition, self.offset
            ),
        }
    }
}

/// The queue client the pipeline pulls from and commits to.
#[async_trait]
pub trait RecordSource: Send + Sync + 'static {
    /// Waits for the next records. An empty vector means the poll timed out.
    /// Records of one partition are returned in offset order.
    async fn pull_records(&self) -> Result<Vec<Record>, SinkError>;

    /// Marks every record of `partition` up to and including `offset` as processed.
    async fn commit_offset(&self, partition: &Partition, offset: i64) -> Result<(), SinkError>;

    /// Releases the client during graceful shutdown.
    async fn shutdown(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: Option<&str>) -> Record {
        Record {
            partition: Partition::new("orders", 3),
            offset: 42,
            stream: "orders".to_string(),
            key: key.map(|k| k.as_bytes().to_vec()),
            value: br#"{"id":1}"#.to_vec(),
            timestamp: None,
        }
    }

    #[test]
    fn test_document_id_prefers_key() {
        assert_eq!(record(Some("order-1")).document_id(), "order-1");
    }

    #[test]
    fn test_document_id_falls_back_to_coordinates() {
        assert_eq!(record(None).document_id(), "orders+3+42");
        assert_eq!(record(Some("")).document_id(), "orders+3+42");
    }

    #[test]
    fn test_size_counts_key_and_value() {
        assert_eq!(record(Some("abc")).size(), 3 + 8);
        assert_eq!(record(None).size(), 8);
    }
}
