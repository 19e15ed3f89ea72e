//! Messages and exchanges.
//!
//! An [`Exchange`] is one unit of work flowing through an endpoint: the
//! inbound message, an optional reply and an optional terminal failure.

use crate::domain::correlation::CorrelationId;
use crate::domain::destination::ResolvedDestination;
use crate::domain::error::EndpointError;
use crate::REQUEST_TIMEOUT_HEADER;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A typed header value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view; numeric strings are accepted.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    #[default]
    Empty,
    Text(String),
    Bytes(Bytes),
    Json(serde_json::Value),
}

impl Body {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Endpoint-side message model.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    /// Transport-assigned id, present on received messages
    pub message_id: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<ResolvedDestination>,
    pub message_type: Option<String>,
    pub headers: BTreeMap<String, HeaderValue>,
    pub body: Body,
    /// Set when the transport delivers the message again after a failure
    pub redelivered: bool,
}

impl Message {
    pub fn new(body: Body) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::new(Body::Text(body.into()))
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::new(Body::Json(value))
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }
}

/// Message exchange pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangePattern {
    /// Fire-and-forget.
    InOnly,
    /// Request with a correlated reply.
    InOut,
}

/// One unit of work: inbound message, reply slot and failure slot.
#[derive(Debug, Clone)]
pub struct Exchange {
    pattern: ExchangePattern,
    message: Message,
    out: Option<Message>,
    failure: Option<EndpointError>,
}

impl Exchange {
    pub fn new(pattern: ExchangePattern, message: Message) -> Self {
        Self {
            pattern,
            message,
            out: None,
            failure: None,
        }
    }

    pub fn in_only(message: Message) -> Self {
        Self::new(ExchangePattern::InOnly, message)
    }

    pub fn in_out(message: Message) -> Self {
        Self::new(ExchangePattern::InOut, message)
    }

    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn is_in_out(&self) -> bool {
        self.pattern == ExchangePattern::InOut
    }

    /// The inbound message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    /// Fill the reply slot.
    pub fn set_out(&mut self, message: Message) {
        self.out = Some(message);
    }

    pub fn out(&self) -> Option<&Message> {
        self.out.as_ref()
    }

    pub fn take_out(&mut self) -> Option<Message> {
        self.out.take()
    }

    /// Mark the exchange as failed.
    pub fn set_failure(&mut self, error: EndpointError) {
        self.failure = Some(error);
    }

    pub fn failure(&self) -> Option<&EndpointError> {
        self.failure.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Per-exchange request timeout from the `MqRequestTimeout` header.
    ///
    /// Non-positive or unparsable values are ignored.
    pub fn request_timeout_override(&self) -> Option<Duration> {
        self.message
            .header(REQUEST_TIMEOUT_HEADER)
            .and_then(HeaderValue::as_i64)
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64))
    }
}
