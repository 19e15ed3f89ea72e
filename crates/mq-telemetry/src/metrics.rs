//! Prometheus metrics for endpoints.
//!
//! All metrics follow the naming convention: `mq_<component>_<metric>_<unit>`
//!
//! Counters are labelled with the endpoint destination (`queue://orders`).

use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // REQUESTOR METRICS
    // =========================================================================

    /// Requests waiting for a reply
    pub static ref REQUESTOR_PENDING_REQUESTS: GaugeVec = GaugeVec::new(
        Opts::new("mq_requestor_pending_requests", "Correlated requests awaiting a reply"),
        &["destination"]
    ).expect("metric creation failed");

    /// Requests that ended in a timeout (caller or purge)
    pub static ref REQUESTOR_TIMEOUTS: CounterVec = CounterVec::new(
        Opts::new("mq_requestor_timeouts_total", "Correlated requests that timed out"),
        &["destination"]
    ).expect("metric creation failed");

    /// Replies that matched no pending request
    pub static ref REQUESTOR_REPLIES_DROPPED: CounterVec = CounterVec::new(
        Opts::new(
            "mq_requestor_replies_dropped_total",
            "Replies discarded because no request was waiting for them"
        ),
        &["destination"]
    ).expect("metric creation failed");

    // =========================================================================
    // LISTENER METRICS
    // =========================================================================

    /// Listener workers currently running
    pub static ref LISTENER_ACTIVE_WORKERS: GaugeVec = GaugeVec::new(
        Opts::new("mq_listener_active_workers", "Listener workers currently running"),
        &["destination"]
    ).expect("metric creation failed");

    /// Messages processed successfully by listener workers
    pub static ref LISTENER_MESSAGES_PROCESSED: CounterVec = CounterVec::new(
        Opts::new("mq_listener_messages_processed_total", "Messages processed by listeners"),
        &["destination"]
    ).expect("metric creation failed");

    /// Messages whose processing failed and were negatively acknowledged
    pub static ref LISTENER_MESSAGES_FAILED: CounterVec = CounterVec::new(
        Opts::new("mq_listener_messages_failed_total", "Messages whose processing failed"),
        &["destination"]
    ).expect("metric creation failed");

    // =========================================================================
    // PRODUCER METRICS
    // =========================================================================

    /// Messages sent by producers (in-only and in-out)
    pub static ref PRODUCER_MESSAGES_SENT: CounterVec = CounterVec::new(
        Opts::new("mq_producer_messages_sent_total", "Messages sent by producers"),
        &["destination"]
    ).expect("metric creation failed");
}

/// Handle for the registered metrics
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

/// Register all metrics with the global registry.
///
/// Calling this more than once is harmless.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Requestor
        Box::new(REQUESTOR_PENDING_REQUESTS.clone()),
        Box::new(REQUESTOR_TIMEOUTS.clone()),
        Box::new(REQUESTOR_REPLIES_DROPPED.clone()),
        // Listener
        Box::new(LISTENER_ACTIVE_WORKERS.clone()),
        Box::new(LISTENER_MESSAGES_PROCESSED.clone()),
        Box::new(LISTENER_MESSAGES_FAILED.clone()),
        // Producer
        Box::new(PRODUCER_MESSAGES_SENT.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
