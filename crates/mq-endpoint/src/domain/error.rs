//! Endpoint error types.
//!
//! [`EndpointError`] is `Clone` so a single failure can be recorded on an
//! [`Exchange`](crate::Exchange) and returned to the caller.

use crate::domain::config::ConfigError;
use crate::domain::correlation::CorrelationId;
use std::time::Duration;
use thiserror::Error;

/// Destination resolution failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("unknown destination: '{0}'")]
    UnknownDestination(String),

    #[error("destination resolver failed for '{name}': {reason}")]
    ResolverFailed { name: String, reason: String },
}

/// Failure reported by the transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("destination deleted: {0}")]
    DestinationDeleted(String),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("transport closed")]
    Closed,
}

/// Conversion failure between the endpoint message model and the transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BindingError {
    #[error("invalid JSON body: {0}")]
    InvalidJson(String),

    #[error("unsupported body type: {0}")]
    UnsupportedBody(String),
}

/// Application processing failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("processing failed: {message}")]
pub struct ProcessingError {
    pub message: String,
}

impl ProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors surfaced by endpoint operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EndpointError {
    /// The endpoint cannot operate with its current configuration.
    #[error("configuration error: {reason}")]
    Configuration {
        reason: String,
        #[source]
        cause: Option<ResolutionError>,
    },

    /// Configuration rejected by validation.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("no reply for correlation id {correlation_id} within {timeout:?}")]
    Timeout {
        correlation_id: CorrelationId,
        timeout: Duration,
    },

    #[error("endpoint is shutting down")]
    Shutdown,

    #[error("request {0} was cancelled")]
    Cancelled(CorrelationId),

    #[error("correlation id {0} is already in flight")]
    DuplicateCorrelationId(CorrelationId),

    #[error("binding error: {0}")]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),
}

impl EndpointError {
    /// Configuration error without an underlying cause.
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
            cause: None,
        }
    }

    /// Configuration error caused by a failed destination resolution.
    pub fn unresolvable(cause: ResolutionError) -> Self {
        Self::Configuration {
            reason: format!("destination could not be resolved: {cause}"),
            cause: Some(cause),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}
