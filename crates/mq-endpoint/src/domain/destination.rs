//! Resolved destinations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// Point-to-point: each message goes to one consumer.
    Queue,
    /// Publish/subscribe: each subscriber gets a copy.
    Topic,
}

impl Domain {
    /// Domain selected by an endpoint's `pub_sub_domain` flag.
    pub fn from_pub_sub(pub_sub_domain: bool) -> Self {
        if pub_sub_domain {
            Self::Topic
        } else {
            Self::Queue
        }
    }
}

/// Destination lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifetime {
    /// Exists independently of any connection.
    Durable,
    /// Created on demand and deleted by its owner.
    Temporary,
}

/// A concrete transport address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedDestination {
    pub name: String,
    pub domain: Domain,
    pub lifetime: Lifetime,
}

impl ResolvedDestination {
    /// A durable queue.
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: Domain::Queue,
            lifetime: Lifetime::Durable,
        }
    }

    /// A durable topic.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: Domain::Topic,
            lifetime: Lifetime::Durable,
        }
    }

    /// A temporary destination created by the transport.
    pub fn temporary(name: impl Into<String>, domain: Domain) -> Self {
        Self {
            name: name.into(),
            domain,
            lifetime: Lifetime::Temporary,
        }
    }

    pub fn is_topic(&self) -> bool {
        self.domain == Domain::Topic
    }

    pub fn is_temporary(&self) -> bool {
        self.lifetime == Lifetime::Temporary
    }
}

impl fmt::Display for ResolvedDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match (self.domain, self.lifetime) {
            (Domain::Queue, Lifetime::Durable) => "queue",
            (Domain::Topic, Lifetime::Durable) => "topic",
            (Domain::Queue, Lifetime::Temporary) => "temp-queue",
            (Domain::Topic, Lifetime::Temporary) => "temp-topic",
        };
        write!(f, "{}://{}", scheme, self.name)
    }
}
