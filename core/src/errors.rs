use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transient store-side failure (throttling, timeout, temporary unavailability).
    #[error("Retryable delivery error: {reason}")]
    RetryableDelivery { reason: String },

    /// Permanent failure, retrying will never succeed.
    #[error("Fatal delivery error: {reason}")]
    FatalDelivery { reason: String },

    /// The bulk request could not reach the store at all.
    #[error("Connection error: {reason}")]
    Connection { reason: String },

    #[error("Gave up after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Error, Debug)]
pub enum KafkaError {
    #[error("Failed to create consumer: {reason}")]
    ConsumerCreation { reason: String },

    #[error("Failed to subscribe to topics {topics}: {reason}")]
    Subscription { topics: String, reason: String },

    #[error("Failed to consume messages: {reason}")]
    Consumption { reason: String },

    #[error("Failed to commit offsets: {reason}")]
    OffsetCommit { reason: String },
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {reason}")]
    Json { reason: String },
}

pub type Result<T> = std::result::Result<T, SinkError>;

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        SinkError::Serialization(SerializationError::Json {
            reason: err.to_string(),
        })
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SinkError::RetryableDelivery {
                reason: format!("undecodable bulk response: {err}"),
            }
        } else {
            SinkError::Connection {
                reason: err.to_string(),
            }
        }
    }
}

impl SinkError {
    /// Whether a whole-request failure is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::RetryableDelivery { .. } => true,
            SinkError::Connection { .. } => true,
            SinkError::Kafka(KafkaError::Consumption { .. }) => true,
            SinkError::Kafka(KafkaError::OffsetCommit { .. }) => true,
            SinkError::Config(_) => false,
            SinkError::FatalDelivery { .. } => false,
            SinkError::RetriesExhausted { .. } => false,
            SinkError::Serialization(_) => false,
            _ => false,
        }
    }
}
