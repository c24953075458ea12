use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::KafkaOptions;
use crate::errors::{KafkaError, SinkError};
use crate::source::{Partition, Record, RecordSource};

const DEFAULT_MAX_POLL_RECORDS: usize = 500;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;

pub struct KafkaSource {
    consumer: StreamConsumer,
    topics: Vec<String>,
    max_poll_records: usize,
    poll_timeout: Duration,
}

impl KafkaSource {
    pub fn new(
        options: &KafkaOptions,
        topics: &[String],
    ) -> std::result::Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &options.bootstrap_servers)
            .set("group.id", &options.consumer_group)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .set(
                "auto.offset.reset",
                options.auto_offset_reset.as_deref().unwrap_or("earliest"),
            );

        if let Some(timeout) = options.session_timeout_ms {
            client_config.set("session.timeout.ms", timeout.to_string());
        }

        if let Some(heartbeat) = options.heartbeat_interval_ms {
            client_config.set("heartbeat.interval.ms", heartbeat.to_string());
        }

        if let Some(security_protocol) = &options.security_protocol {
            client_config.set("security.protocol", security_protocol);
        }

        if let Some(sasl_mechanisms) = &options.sasl_mechanisms {
            client_config.set("sasl.mechanisms", sasl_mechanisms);
        }

        if let Some(sasl_username) = &options.sasl_username {
            client_config.set("sasl.username", sasl_username);
        }

        if let Some(sasl_password) = &options.sasl_password {
            client_config.set("sasl.password", sasl_password);
        }

        if let Some(ssl_ca_location) = &options.ssl_ca_location {
            client_config.set("ssl.ca.location", ssl_ca_location);
        }

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|e| KafkaError::ConsumerCreation {
                reason: e.to_string(),
            })?;

        Ok(Self {
            consumer,
            topics: topics.to_vec(),
            max_poll_records: options
                .max_poll_records
                .map_or(DEFAULT_MAX_POLL_RECORDS, |n| n as usize),
            poll_timeout: Duration::from_millis(
                options.poll_timeout_ms.unwrap_or(DEFAULT_POLL_TIMEOUT_MS),
            ),
        })
    }

    pub fn subscribe(&self) -> std::result::Result<(), KafkaError> {
        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topics)
            .map_err(|e| KafkaError::Subscription {
                topics: self.topics.join(","),
                reason: e.to_string(),
            })?;

        info!("Subscribed to Kafka topics: {}", self.topics.join(","));
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        for topic in &self.topics {
            let metadata = self
                .consumer
                .fetch_metadata(Some(topic), Duration::from_secs(10))
                .context("Failed to fetch metadata for health check")?;

            let partitions = metadata
                .topics()
                .first()
                .map_or(0, |t| t.partitions().len());
            if partitions == 0 {
                return Err(anyhow::anyhow!("No partitions found for topic {}", topic));
            }
            info!(
                "Health check passed for topic {} with {} partitions",
                topic, partitions
            );
        }
        Ok(())
    }

    fn convert_message(message: &BorrowedMessage<'_>) -> Option<Record> {
        let Some(payload) = message.payload() else {
            debug!(
                "Skipping tombstone at partition {} offset {}",
                message.partition(),
                message.offset()
            );
            return None;
        };

        Some(Record {
            partition: Partition::new(message.topic(), message.partition()),
            offset: message.offset(),
            stream: message.topic().to_string(),
            key: message.key().map(<[u8]>::to_vec),
            value: payload.to_vec(),
            timestamp: message
                .timestamp()
                .to_millis()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        })
    }
}

#[async_trait]
impl RecordSource for KafkaSource {
    async fn pull_records(&self) -> std::result::Result<Vec<Record>, SinkError> {
        let mut records = Vec::new();
        let started = Instant::now();

        while records.len() < self.max_poll_records {
            let remaining = self.poll_timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(message)) => {
                    if let Some(record) = Self::convert_message(&message) {
                        records.push(record);
                    }
                }
                Ok(Err(e)) => {
                    if records.is_empty() {
                        return Err(KafkaError::Consumption {
                            reason: e.to_string(),
                        }
                        .into());
                    }
                    warn!("Error receiving message, returning partial poll: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }

        if !records.is_empty() {
            debug!("Pulled {} records from Kafka", records.len());
        }
        Ok(records)
    }

    async fn commit_offset(
        &self,
        partition: &Partition,
        offset: i64,
    ) -> std::result::Result<(), SinkError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &partition.topic,
            partition.partition,
            Offset::Offset(offset + 1),
        )
        .map_err(|e| KafkaError::OffsetCommit {
            reason: e.to_string(),
        })?;

        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| KafkaError::OffsetCommit {
                reason: e.to_string(),
            })?;

        debug!("Committed offset {} for partition {}", offset + 1, partition);
        Ok(())
    }

    async fn shutdown(&self) -> std::result::Result<(), SinkError> {
        self.consumer.unsubscribe();
        info!("Unsubscribed from Kafka topics");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::producer::{FutureProducer, FutureRecord};

    const TEST_TOPIC: &str = "search-sink-test";
    const KAFKA_BOOTSTRAP_SERVERS: &str = "localhost:9092";

    fn options() -> KafkaOptions {
        KafkaOptions {
            bootstrap_servers: KAFKA_BOOTSTRAP_SERVERS.to_string(),
            consumer_group: "search-sink-test-group".to_string(),
            security_protocol: None,
            sasl_mechanisms: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            auto_offset_reset: Some("earliest".to_string()),
            session_timeout_ms: Some(6000),
            heartbeat_interval_ms: None,
            max_poll_records: Some(5),
            poll_timeout_ms: Some(2000),
        }
    }

    #[tokio::test]
    #[ignore = "requires a Kafka broker on localhost:9092"]
    async fn test_kafka_source_pull_and_commit() {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", KAFKA_BOOTSTRAP_SERVERS)
            .set("message.timeout.ms", "5000")
            .create()
            .expect("Failed to create producer");
        for i in 0..10 {
            let payload = format!(r#"{{"n":{i}}}"#);
            let key = i.to_string();
            producer
                .send(
                    FutureRecord::to(TEST_TOPIC).payload(&payload).key(&key),
                    Duration::from_secs(5),
                )
                .await
                .expect("Failed to send message");
        }

        let source = KafkaSource::new(&options(), &[TEST_TOPIC.to_string()]).unwrap();
        source.subscribe().unwrap();

        let mut total = 0;
        let deadline = Instant::now() + Duration::from_secs(30);
        while total < 10 && Instant::now() < deadline {
            let records = source.pull_records().await.unwrap();
            assert!(records.len() <= 5);
            for record in &records {
                assert_eq!(record.stream, TEST_TOPIC);
                assert!(record.timestamp.is_some());
                source
                    .commit_offset(&record.partition, record.offset)
                    .await
                    .unwrap();
            }
            total += records.len();
        }
        assert!(total >= 10, "Should have pulled all produced records");
    }

    #[test]
    fn test_invalid_client_option_fails_creation() {
        let mut bad = options();
        bad.security_protocol = Some("carrier-pigeon".to_string());

        let error = KafkaSource::new(&bad, &[TEST_TOPIC.to_string()])
            .err()
            .expect("consumer creation should fail");
        assert!(matches!(error, KafkaError::ConsumerCreation { .. }));
    }
}
