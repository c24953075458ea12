use std::collections::HashMap;

use tracing::{info, warn};

use crate::config::SinkConfig;
use crate::errors::ConfigError;

/// Entry point the host framework talks to. Validates the connector properties
/// once and hands every task an identical copy of them.
#[derive(Debug, Default)]
pub struct SinkConnector {
    config: Option<SinkConfig>,
}

impl SinkConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates `props`. On error the connector stays unstarted.
    pub fn start(&mut self, props: HashMap<String, String>) -> Result<(), ConfigError> {
        match SinkConfig::from_properties(&props) {
            Ok(config) => {
                info!(
                    topics = ?config.topics,
                    hosts = ?config.hosts,
                    "search sink connector started"
                );
                self.config = Some(config);
                Ok(())
            }
            Err(e) => {
                warn!("Rejected connector configuration: {}", e);
                self.config = None;
                Err(e)
            }
        }
    }

    pub fn stop(&mut self) {
        if self.config.take().is_some() {
            info!("search sink connector stopped");
        }
    }

    pub fn config(&self) -> Option<&SinkConfig> {
        self.config.as_ref()
    }

    /// One property map per task, all equal. Empty when not started.
    pub fn task_configs(&self, max_tasks: usize) -> Vec<HashMap<String, String>> {
        match &self.config {
            Some(config) => vec![config.to_properties(); max_tasks],
            None => Vec::new(),
        }
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}
