//! # Broker Messages
//!
//! The broker-native message and destination representation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Delivery domain and lifetime of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationKind {
    /// Durable point-to-point queue.
    Queue,
    /// Durable publish/subscribe topic.
    Topic,
    /// Queue that lives until explicitly deleted.
    TemporaryQueue,
    /// Topic that lives until explicitly deleted.
    TemporaryTopic,
}

impl DestinationKind {
    /// Whether messages fan out to every subscription.
    #[must_use]
    pub fn is_topic(self) -> bool {
        matches!(self, Self::Topic | Self::TemporaryTopic)
    }

    /// Whether the destination was created through `create_temporary`.
    #[must_use]
    pub fn is_temporary(self) -> bool {
        matches!(self, Self::TemporaryQueue | Self::TemporaryTopic)
    }

    fn scheme(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Topic => "topic",
            Self::TemporaryQueue => "temp-queue",
            Self::TemporaryTopic => "temp-topic",
        }
    }
}

/// An addressable channel on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerDestination {
    /// Destination name, unique per domain.
    pub name: String,
    /// Domain and lifetime.
    pub kind: DestinationKind,
}

impl BrokerDestination {
    /// A durable queue.
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Queue,
        }
    }

    /// A durable topic.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Topic,
        }
    }
}

impl fmt::Display for BrokerDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind.scheme(), self.name)
    }
}

/// A typed message property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Payload {
    #[default]
    Empty,
    Text(String),
    Bytes(Bytes),
}

/// A message as stored and delivered by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    /// Broker-assigned identifier (`ID:<uuid>`).
    pub message_id: String,
    /// Correlation identifier set by the sender.
    pub correlation_id: Option<String>,
    /// Where replies to this message should be sent.
    pub reply_to: Option<BrokerDestination>,
    /// Application-defined message type.
    pub message_type: Option<String>,
    /// Application properties, visible to selectors.
    pub properties: BTreeMap<String, PropertyValue>,
    /// Message body.
    pub payload: Payload,
    /// Milliseconds since the Unix epoch at creation.
    pub timestamp_ms: u64,
    /// Set once the message has been nacked at least once.
    pub redelivered: bool,
    /// Number of times the message was handed to a receiver.
    pub delivery_count: u32,
}

impl BrokerMessage {
    /// Create a message with a fresh identifier.
    pub fn new(payload: Payload) -> Self {
        Self {
            message_id: format!("ID:{}", Uuid::new_v4()),
            correlation_id: None,
            reply_to: None,
            message_type: None,
            properties: BTreeMap::new(),
            payload,
            timestamp_ms: now_ms(),
            redelivered: false,
            delivery_count: 0,
        }
    }

    /// Create a text message.
    pub fn text(body: impl Into<String>) -> Self {
        Self::new(Payload::Text(body.into()))
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, reply_to: BrokerDestination) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Look up a property by name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
