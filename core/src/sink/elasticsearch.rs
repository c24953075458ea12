use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url, header};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{BulkClient, Document, ItemOutcome};
use crate::config::SinkConfig;
use crate::errors::{ConfigError, SinkError};

const RETRYABLE_ITEM_STATUS: [u16; 5] = [429, 500, 502, 503, 504];
const REJECTED_EXECUTION: &str = "es_rejected_execution_exception";

/// Bulk client for the Elasticsearch `_bulk` HTTP API.
///
/// Requests are spread round-robin over the configured hosts, so a retried
/// request goes to a different node than the one that failed.
pub struct ElasticsearchClient {
    hosts: Vec<Url>,
    next_host: AtomicUsize,
    client: Client,
    cluster_name: Option<String>,
    document_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

impl ElasticsearchClient {
    pub fn new(config: &SinkConfig) -> Result<Self, SinkError> {
        if config.hosts.is_empty() {
            return Err(ConfigError::MissingField {
                field: crate::config::HOSTS.to_string(),
            }
            .into());
        }
        let hosts = config
            .hosts
            .iter()
            .map(|host| parse_host(host))
            .collect::<Result<Vec<_>, _>>()?;
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SinkError::Connection {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            hosts,
            next_host: AtomicUsize::new(0),
            client,
            cluster_name: config.cluster_name.clone(),
            document_type: Some(config.document_name.clone()).filter(|name| !name.is_empty()),
        })
    }

    fn host(&self) -> &Url {
        let n = self.next_host.fetch_add(1, Ordering::Relaxed);
        &self.hosts[n % self.hosts.len()]
    }

    fn action_line(&self, index: &str, id: &str) -> Value {
        let mut meta = json!({ "_index": index, "_id": id });
        if let Some(document_type) = &self.document_type {
            meta["_type"] = json!(document_type);
        }
        json!({ "index": meta })
    }

    async fn check_cluster(&self, host: &Url) -> Result<(), SinkError> {
        let response = self
            .client
            .get(host.clone())
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SinkError::Connection {
                reason: format!("{host} answered {}", response.status()),
            });
        }
        let info: Value = response.json().await?;
        let actual = info["cluster_name"].as_str().unwrap_or_default();

        if let Some(expected) = &self.cluster_name {
            if actual != expected.as_str() {
                return Err(ConfigError::ValidationFailed {
                    reason: format!(
                        "host {host} belongs to cluster '{actual}', expected '{expected}'"
                    ),
                }
                .into());
            }
        }
        info!(
            "Connected to Elasticsearch cluster '{}' version {} via {}",
            actual,
            info["version"]["number"].as_str().unwrap_or("unknown"),
            host
        );
        Ok(())
    }
}

#[async_trait]
impl BulkClient for ElasticsearchClient {
    async fn connect(&self) -> Result<(), SinkError> {
        let mut last_error = None;
        for host in &self.hosts {
            match self.check_cluster(host).await {
                Ok(()) => return Ok(()),
                Err(e @ SinkError::Config(_)) => return Err(e),
                Err(e) => {
                    warn!("Elasticsearch host {} is not reachable: {}", host, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| SinkError::Connection {
            reason: "no Elasticsearch hosts configured".to_string(),
        }))
    }

    async fn bulk_write(
        &self,
        index: &str,
        documents: &[Document],
    ) -> Result<Vec<ItemOutcome>, SinkError> {
        let mut outcomes = vec![ItemOutcome::Success; documents.len()];
        let mut sent = Vec::with_capacity(documents.len());
        let mut payload = Vec::new();

        for (position, document) in documents.iter().enumerate() {
            // bulk bodies are newline delimited, re-serializing compacts the source
            let body: Value = match serde_json::from_slice(&document.body) {
                Ok(body) => body,
                Err(e) => {
                    outcomes[position] =
                        ItemOutcome::FatalFailure(format!("document is not valid JSON: {e}"));
                    continue;
                }
            };
            serde_json::to_writer(&mut payload, &self.action_line(index, &document.id))?;
            payload.push(b'\n');
            serde_json::to_writer(&mut payload, &body)?;
            payload.push(b'\n');
            sent.push(position);
        }

        if sent.is_empty() {
            return Ok(outcomes);
        }

        let url = self
            .host()
            .join("_bulk")
            .map_err(|e| SinkError::Connection {
                reason: format!("invalid bulk URL: {e}"),
            })?;
        let payload_len = payload.len();
        let response = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "application/x-ndjson")
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_request_failure(status, &text));
        }

        let bulk: BulkResponse = response.json().await?;
        if bulk.items.len() != sent.len() {
            return Err(SinkError::RetryableDelivery {
                reason: format!(
                    "bulk response has {} items for {} documents",
                    bulk.items.len(),
                    sent.len()
                ),
            });
        }

        for (position, item) in sent.into_iter().zip(&bulk.items) {
            outcomes[position] = match item.values().next() {
                Some(result) => classify_item(result),
                None => ItemOutcome::RetryableFailure("empty bulk item".to_string()),
            };
        }

        debug!(
            index,
            documents = documents.len(),
            bytes = payload_len,
            errors = bulk.errors,
            "bulk request completed"
        );
        Ok(outcomes)
    }
}

fn parse_host(host: &str) -> Result<Url, SinkError> {
    let host = host.trim();
    let with_scheme = if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{host}")
    };
    let with_slash = if with_scheme.ends_with('/') {
        with_scheme
    } else {
        format!("{with_scheme}/")
    };
    Url::parse(&with_slash).map_err(|e| {
        ConfigError::Invalid {
            message: format!("invalid Elasticsearch host '{host}': {e}"),
        }
        .into()
    })
}

fn classify_request_failure(status: StatusCode, body: &str) -> SinkError {
    let reason = format!("bulk request failed with {status}: {body}");
    match status {
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT
        | StatusCode::REQUEST_TIMEOUT => SinkError::RetryableDelivery { reason },
        s if s.is_server_error() => SinkError::RetryableDelivery { reason },
        _ => SinkError::FatalDelivery { reason },
    }
}

fn classify_item(item: &BulkItem) -> ItemOutcome {
    if (200..300).contains(&item.status) {
        return ItemOutcome::Success;
    }

    let error_type = item
        .error
        .as_ref()
        .and_then(|e| e["type"].as_str())
        .unwrap_or("unknown");
    let error_reason = item
        .error
        .as_ref()
        .and_then(|e| e["reason"].as_str())
        .unwrap_or("");
    let reason = format!("{} {}: {}", item.status, error_type, error_reason);

    if RETRYABLE_ITEM_STATUS.contains(&item.status) || error_type == REJECTED_EXECUTION {
        ItemOutcome::RetryableFailure(reason)
    } else {
        ItemOutcome::FatalFailure(reason)
    }
}
