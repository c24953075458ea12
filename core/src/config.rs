use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::backoff::Exponential;
use crate::errors::ConfigError;
use crate::index_namer::IndexNamer;

pub const CLUSTER_NAME: &str = "elasticsearch.cluster.name";
pub const HOSTS: &str = "elasticsearch.hosts";
pub const BULK_SIZE: &str = "elasticsearch.bulk.size";
pub const BULK_MAX_BYTES: &str = "elasticsearch.bulk.max.bytes";
pub const INDEXES: &str = "elasticsearch.indexes";
pub const DOCUMENT_NAME: &str = "elasticsearch.document.name";
pub const TOPICS: &str = "topics";
pub const DATE_FORMAT: &str = "date.format";
pub const SUFFIX_SEPARATOR: &str = "suffix.separator";
pub const INDEX_NAME_TEMPLATE: &str = "index.name.template";
pub const FLUSH_INTERVAL_MS: &str = "flush.interval.ms";
pub const COMMIT_INTERVAL_MS: &str = "commit.interval.ms";
pub const MAX_RETRIES: &str = "max.retries";
pub const RETRY_BACKOFF_MS: &str = "retry.backoff.ms";
pub const MAX_RETRY_BACKOFF_MS: &str = "max.retry.backoff.ms";
pub const RETRY_JITTER: &str = "retry.jitter";
pub const MAX_IN_FLIGHT_REQUESTS: &str = "max.in.flight.requests";
pub const SHUTDOWN_TIMEOUT_MS: &str = "shutdown.timeout.ms";
pub const REQUEST_TIMEOUT_MS: &str = "request.timeout.ms";

/// Environment variable holding the YAML configuration.
pub const CONFIG_ENV_VAR: &str = "SINK_CONFIG";

pub const DEFAULT_SUFFIX_SEPARATOR: &str = "-";
pub const DEFAULT_INDEX_NAME_TEMPLATE: &str = "{topic}";
pub const DEFAULT_BULK_MAX_BYTES: usize = 5 * 1024 * 1024;

/// Immutable settings of one sink task. Every task of a connector receives an
/// identical copy.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub cluster_name: Option<String>,
    pub hosts: Vec<String>,
    /// Maximum number of documents per bulk request.
    pub bulk_size: usize,
    #[serde(default = "default_bulk_max_bytes")]
    pub bulk_max_bytes: usize,
    pub topics: Vec<String>,
    /// Target index per topic, matched by position.
    pub indexes: Vec<String>,
    #[serde(default)]
    pub document_name: String,
    #[serde(default)]
    pub date_format: Option<String>,
    #[serde(default = "default_suffix_separator")]
    pub suffix_separator: String,
    #[serde(default = "default_index_name_template")]
    pub index_name_template: String,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub kafka: Option<KafkaOptions>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct KafkaOptions {
    pub bootstrap_servers: String,
    pub consumer_group: String,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub auto_offset_reset: Option<String>,
    pub session_timeout_ms: Option<u32>,
    pub heartbeat_interval_ms: Option<u32>,
    pub max_poll_records: Option<u32>,
    pub poll_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub flush_interval_ms: u64,
    pub commit_interval_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
    pub retry_jitter: f64,
    pub max_in_flight_requests: usize,
    pub shutdown_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1000,
            commit_interval_ms: 5000,
            max_retries: 5,
            retry_backoff_ms: 100,
            max_retry_backoff_ms: 10_000,
            retry_jitter: 0.5,
            max_in_flight_requests: 5,
            shutdown_timeout_ms: 30_000,
            request_timeout_ms: 30_000,
        }
    }
}

fn default_bulk_max_bytes() -> usize {
    DEFAULT_BULK_MAX_BYTES
}

fn default_suffix_separator() -> String {
    DEFAULT_SUFFIX_SEPARATOR.to_string()
}

fn default_index_name_template() -> String {
    DEFAULT_INDEX_NAME_TEMPLATE.to_string()
}

pub async fn load_config(config_path: Option<&str>) -> Result<SinkConfig, ConfigError> {
    match config_path {
        Some(path) => SinkConfig::from_file(path),
        None => SinkConfig::from_env(),
    }
}

impl SinkConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| load_failed(path, e))?;
        serde_yaml::from_str(&content).map_err(|e| load_failed(path, e))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let config_str = std::env::var(CONFIG_ENV_VAR).map_err(|e| load_failed(CONFIG_ENV_VAR, e))?;
        serde_yaml::from_str(&config_str).map_err(|e| load_failed(CONFIG_ENV_VAR, e))
    }

    /// Builds a config from connector properties as handed over by the host.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = ProcessingConfig::default();
        let processing = ProcessingConfig {
            flush_interval_ms: parse_or(props, FLUSH_INTERVAL_MS, defaults.flush_interval_ms)?,
            commit_interval_ms: parse_or(props, COMMIT_INTERVAL_MS, defaults.commit_interval_ms)?,
            max_retries: parse_or(props, MAX_RETRIES, defaults.max_retries)?,
            retry_backoff_ms: parse_or(props, RETRY_BACKOFF_MS, defaults.retry_backoff_ms)?,
            max_retry_backoff_ms: parse_or(
                props,
                MAX_RETRY_BACKOFF_MS,
                defaults.max_retry_backoff_ms,
            )?,
            retry_jitter: parse_or(props, RETRY_JITTER, defaults.retry_jitter)?,
            max_in_flight_requests: parse_or(
                props,
                MAX_IN_FLIGHT_REQUESTS,
                defaults.max_in_flight_requests,
            )?,
            shutdown_timeout_ms: parse_or(props, SHUTDOWN_TIMEOUT_MS, defaults.shutdown_timeout_ms)?,
            request_timeout_ms: parse_or(props, REQUEST_TIMEOUT_MS, defaults.request_timeout_ms)?,
        };

        let config = SinkConfig {
            cluster_name: props
                .get(CLUSTER_NAME)
                .filter(|name| !name.is_empty())
                .cloned(),
            hosts: split_list(required(props, HOSTS)?),
            bulk_size: parse_required(props, BULK_SIZE)?,
            bulk_max_bytes: parse_or(props, BULK_MAX_BYTES, DEFAULT_BULK_MAX_BYTES)?,
            topics: split_list(required(props, TOPICS)?),
            indexes: split_list(required(props, INDEXES)?),
            document_name: props.get(DOCUMENT_NAME).cloned().unwrap_or_default(),
            date_format: props.get(DATE_FORMAT).cloned(),
            suffix_separator: props
                .get(SUFFIX_SEPARATOR)
                .cloned()
                .unwrap_or_else(default_suffix_separator),
            index_name_template: props
                .get(INDEX_NAME_TEMPLATE)
                .cloned()
                .unwrap_or_else(default_index_name_template),
            processing,
            kafka: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// Renders the config back into connector properties. Feeding the result to
    /// [`SinkConfig::from_properties`] yields an equal config (minus `kafka`).
    pub fn to_properties(&self) -> HashMap<String, String> {
        let mut props = HashMap::new();
        if let Some(cluster_name) = &self.cluster_name {
            props.insert(CLUSTER_NAME.to_string(), cluster_name.clone());
        }
        props.insert(HOSTS.to_string(), self.hosts.join(","));
        props.insert(BULK_SIZE.to_string(), self.bulk_size.to_string());
        props.insert(BULK_MAX_BYTES.to_string(), self.bulk_max_bytes.to_string());
        props.insert(DOCUMENT_NAME.to_string(), self.document_name.clone());
        props.insert(INDEXES.to_string(), self.indexes.join(","));
        props.insert(TOPICS.to_string(), self.topics.join(","));
        if let Some(date_format) = &self.date_format {
            props.insert(DATE_FORMAT.to_string(), date_format.clone());
        }
        props.insert(SUFFIX_SEPARATOR.to_string(), self.suffix_separator.clone());
        props.insert(
            INDEX_NAME_TEMPLATE.to_string(),
            self.index_name_template.clone(),
        );

        let p = &self.processing;
        props.insert(FLUSH_INTERVAL_MS.to_string(), p.flush_interval_ms.to_string());
        props.insert(COMMIT_INTERVAL_MS.to_string(), p.commit_interval_ms.to_string());
        props.insert(MAX_RETRIES.to_string(), p.max_retries.to_string());
        props.insert(RETRY_BACKOFF_MS.to_string(), p.retry_backoff_ms.to_string());
        props.insert(RETRY_JITTER.to_string(), p.retry_jitter.to_string());
        props.insert(
            MAX_RETRY_BACKOFF_MS.to_string(),
            p.max_retry_backoff_ms.to_string(),
        );
        props.insert(
            MAX_IN_FLIGHT_REQUESTS.to_string(),
            p.max_in_flight_requests.to_string(),
        );
        props.insert(SHUTDOWN_TIMEOUT_MS.to_string(), p.shutdown_timeout_ms.to_string());
        props.insert(REQUEST_TIMEOUT_MS.to_string(), p.request_timeout_ms.to_string());
        props
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() || self.hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(invalid("Elasticsearch hosts cannot be empty"));
        }
        if self.bulk_size == 0 {
            return Err(invalid("Bulk size must be a positive number of documents"));
        }
        if self.bulk_max_bytes == 0 {
            return Err(invalid("Bulk max bytes must be positive"));
        }
        if self.topics.is_empty() {
            return Err(invalid("At least one topic must be configured"));
        }
        if self.indexes.is_empty() {
            return Err(invalid("At least one index must be configured"));
        }
        if self.indexes.len() != self.topics.len() {
            return Err(invalid(&format!(
                "Got {} indexes for {} topics, each topic needs exactly one index",
                self.indexes.len(),
                self.topics.len()
            )));
        }
        if self.processing.flush_interval_ms == 0 {
            return Err(invalid("Flush interval must be positive"));
        }
        if self.processing.commit_interval_ms == 0 {
            return Err(invalid("Commit interval must be positive"));
        }
        if self.processing.max_in_flight_requests == 0 {
            return Err(invalid("Max in-flight requests must be positive"));
        }
        if !(0.0..=1.0).contains(&self.processing.retry_jitter) {
            return Err(invalid("Retry jitter must be between 0.0 and 1.0"));
        }
        // rejects empty separators and malformed date patterns
        IndexNamer::from_config(self)?;
        Ok(())
    }

    /// Topic to index mapping, pairing `topics` and `indexes` by position.
    pub fn stream_to_index(&self) -> HashMap<String, String> {
        self.topics
            .iter()
            .cloned()
            .zip(self.indexes.iter().cloned())
            .collect()
    }

    pub fn retry_backoff(&self) -> Exponential {
        Exponential::from_millis(
            self.processing.retry_backoff_ms,
            self.processing.max_retry_backoff_ms,
            2.0,
            self.processing.retry_jitter,
            Some(self.processing.max_retries),
        )
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.processing.flush_interval_ms)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.processing.commit_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.processing.shutdown_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.processing.request_timeout_ms)
    }
}

fn load_failed(
    origin: &str,
    error: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> ConfigError {
    ConfigError::LoadFailed {
        origin: origin.to_string(),
        error: error.into(),
    }
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::ValidationFailed {
        reason: reason.to_string(),
    }
}

fn required<'a>(props: &'a HashMap<String, String>, key: &str) -> Result<&'a str, ConfigError> {
    match props.get(key) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingField {
            field: key.to_string(),
        }),
    }
}

fn parse_required<T: std::str::FromStr>(
    props: &HashMap<String, String>,
    key: &str,
) -> Result<T, ConfigError> {
    let raw = required(props, key)?;
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        message: format!("'{key}' must be a number, got '{raw}'"),
    })
}

fn parse_or<T: std::str::FromStr>(
    props: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match props.get(key) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            message: format!("'{key}' must be a number, got '{raw}'"),
        }),
        _ => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
