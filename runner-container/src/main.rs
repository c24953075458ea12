use std::sync::Arc;

use anyhow::{Context, Result};
use sink_core::config::load_config;
use sink_core::telemetry::init_tracing;
use sink_core::{ElasticsearchClient, KafkaSource, SinkPipeline};
use tracing::{error, info};

/// Entry point for running the sink as a long-lived job on container hosting
/// services like AWS EKS, ECS, etc.
///
/// Loads the YAML config from the path given as first argument, or from the
/// `SINK_CONFIG` environment variable, then runs the pipeline until Ctrl-C or
/// SIGTERM asks it to drain.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref())
        .await
        .context("Failed to load sink configuration")?;
    config.validate().context("Invalid sink configuration")?;

    let kafka = config
        .kafka
        .as_ref()
        .context("Configuration has no kafka section")?;
    let source =
        KafkaSource::new(kafka, &config.topics).context("Failed to create Kafka consumer")?;
    source
        .health_check()
        .await
        .context("Kafka health check failed")?;
    source.subscribe().context("Failed to subscribe to topics")?;
    let client = ElasticsearchClient::new(&config)?;

    let pipeline = Arc::new(SinkPipeline::new(config, source, client));
    tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, draining");
            pipeline.stop();
        }
    });

    match pipeline.run().await {
        Ok(report) => {
            info!(
                indexed = report.metrics.documents_indexed,
                failed = report.metrics.documents_failed,
                "search sink finished"
            );
            Ok(())
        }
        Err(e) => {
            error!("search sink failed: {}", e);
            Err(e).context("Pipeline failed")
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            error!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
