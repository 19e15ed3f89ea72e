//! # MQ Node
//!
//! Runs a responder and a requestor against one in-memory broker:
//!
//! ```text
//! Producer ──request──► queue://<MQ_DESTINATION> ──► Consumer (echo, upper-cased)
//!     ▲                                                   │
//!     └──────────── temp-queue://<uuid> ◄────reply────────┘
//! ```
//!
//! Every `MQ_REQUESTS` request is sent, the replies and timeouts are logged,
//! then both endpoints stop. Ctrl+C stops early.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mq_endpoint::{
    processor_fn, BrokerTransport, ConcurrencyBounds, Endpoint, EndpointConfig, Exchange,
    Message,
};
use mq_telemetry::{encode_metrics, init_telemetry, TelemetryConfig};
use shared_broker::InMemoryBroker;
use tracing::{info, warn};

/// Demo settings read from the environment.
#[derive(Debug, Clone)]
struct NodeConfig {
    destination: String,
    request_timeout: Duration,
    requests: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            destination: "requests".to_string(),
            request_timeout: Duration::from_millis(2000),
            requests: 10,
        }
    }
}

/// Load configuration from environment.
fn load_config() -> Result<NodeConfig> {
    let mut config = NodeConfig::default();

    if let Ok(destination) = std::env::var("MQ_DESTINATION") {
        config.destination = destination;
    }
    if let Ok(ms) = std::env::var("MQ_REQUEST_TIMEOUT_MS") {
        let ms: u64 = ms
            .parse()
            .with_context(|| format!("MQ_REQUEST_TIMEOUT_MS is not a number: {ms}"))?;
        config.request_timeout = Duration::from_millis(ms);
    }
    if let Ok(requests) = std::env::var("MQ_REQUESTS") {
        config.requests = requests
            .parse()
            .with_context(|| format!("MQ_REQUESTS is not a number: {requests}"))?;
    }

    Ok(config)
}

/// Send the configured number of requests, logging each outcome.
async fn run_requests(endpoint: &Endpoint, config: &NodeConfig) -> Result<(usize, usize)> {
    let producer = endpoint
        .create_producer()
        .context("failed to create producer")?;
    let (mut replies, mut timeouts) = (0, 0);

    for i in 0..config.requests {
        match producer.request(Message::text(format!("request {i}"))).await {
            Ok(reply) => {
                replies += 1;
                info!(
                    correlation_id = ?reply.correlation_id,
                    body = ?reply.body.as_text(),
                    "Reply received"
                );
            }
            Err(e) if e.is_timeout() => {
                timeouts += 1;
                warn!(error = %e, "Request timed out");
            }
            Err(e) => return Err(e).context("request failed"),
        }
    }
    Ok((replies, timeouts))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = init_telemetry(TelemetryConfig::for_component("node"))
        .context("failed to initialize telemetry")?;
    let config = load_config()?;
    info!(?config, "Starting MQ node");

    let broker = Arc::new(InMemoryBroker::new());
    let transport = Arc::new(BrokerTransport::new(broker.clone()));

    // Responder side
    let responder = Endpoint::builder(transport.clone())
        .destination_name(config.destination.clone())
        .config(EndpointConfig {
            concurrency: ConcurrencyBounds::new(1, 4),
            receive_timeout: Duration::from_millis(250),
            ..Default::default()
        })
        .build()?;
    responder.start()?;
    let consumer = responder.create_consumer(processor_fn(|exchange: &mut Exchange| {
        let body = exchange
            .message()
            .body
            .as_text()
            .unwrap_or_default()
            .to_uppercase();
        exchange.set_out(Message::text(body));
        Ok(())
    }))?;
    consumer.start().await.context("failed to start consumer")?;

    // Requesting side
    let requester = Endpoint::builder(transport)
        .destination_name(config.destination.clone())
        .config(EndpointConfig {
            request_timeout: config.request_timeout,
            ..Default::default()
        })
        .build()?;
    requester.start()?;

    let outcome = tokio::select! {
        outcome = run_requests(&requester, &config) => Some(outcome),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            None
        }
    };

    requester.stop().await;
    responder.stop().await;

    let stats = requester.stats();
    info!(
        completed = stats.completed,
        timeouts = stats.timeouts,
        dropped_replies = stats.dropped_replies,
        processed = consumer.processed(),
        peak_workers = consumer.peak_workers(),
        published = broker.stats().published.load(std::sync::atomic::Ordering::Relaxed),
        "MQ node stopped"
    );
    match encode_metrics() {
        Ok(metrics) => info!(bytes = metrics.len(), "Metrics snapshot rendered"),
        Err(e) => warn!(error = %e, "Failed to render metrics"),
    }

    if let Some(outcome) = outcome {
        let (replies, timeouts) = outcome?;
        info!(replies, timeouts, "Requests finished");
        if timeouts > 0 {
            anyhow::bail!("{timeouts} of {} requests timed out", config.requests);
        }
    }
    Ok(())
}
