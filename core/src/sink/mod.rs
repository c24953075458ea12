pub mod elasticsearch;

use async_trait::async_trait;

use crate::errors::SinkError;
use crate::source::Record;

/// A document as handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub body: Vec<u8>,
}

impl From<&Record> for Document {
    fn from(record: &Record) -> Self {
        Document {
            id: record.document_id(),
            body: record.value.clone(),
        }
    }
}

/// Outcome of writing one document of a bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Success,
    RetryableFailure(String),
    FatalFailure(String),
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Success)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ItemOutcome::RetryableFailure(_))
    }
}

/// The document store's bulk endpoint.
#[async_trait]
pub trait BulkClient: Send + Sync + 'static {
    /// Checks that the store is reachable and usable.
    async fn connect(&self) -> Result<(), SinkError>;

    /// Writes `documents` into `index` in one request.
    ///
    /// On `Ok`, the returned outcomes line up one to one with `documents`. An
    /// `Err` means the request as a whole failed and nothing is known about the
    /// individual documents.
    async fn bulk_write(
        &self,
        index: &str,
        documents: &[Document],
    ) -> Result<Vec<ItemOutcome>, SinkError>;
}
