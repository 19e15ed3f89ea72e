//! # Shared Broker - In-Memory Message Broker
//!
//! A single-process message broker offering the two classic delivery domains:
//!
//! - **Queues (point-to-point):** competing receivers, each message is handed
//!   to exactly one receiver.
//! - **Topics (publish/subscribe):** every live subscription receives its own
//!   copy of each published message.
//!
//! ```text
//!   publish()                         create_receiver()
//! ──────────┐                      ┌──────────────────────
//!           ▼                      │
//!   ┌──────────────────────────────┴──┐
//!   │           InMemoryBroker        │
//!   │  queue://orders    [m3 m2 m1] ──┼──► receiver A / receiver B (compete)
//!   │  topic://prices ─┬► sub 1 [..] ─┼──► receiver C
//!   │                  └► sub 2 [..] ─┼──► receiver D
//!   │  temp-queue://<uuid>  [..]      │
//!   │  DLQ                  [..]      │
//!   └─────────────────────────────────┘
//! ```
//!
//! ## Delivery Guarantees
//!
//! - **Acknowledgement:** a received message is settled with `ack()` or
//!   `nack()`. A nack re-queues the message at the head of its queue with the
//!   redelivered flag set.
//! - **Dead Letter Queue:** a message nacked more than `max_redeliveries`
//!   times is moved to [`DLQ_QUEUE`].
//! - **Selectors:** receivers may filter with a SQL-92 style expression
//!   (see [`selector`]).
//! - **Temporary destinations:** live until deleted; publishing to a deleted
//!   temporary destination fails.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]
#![deny(unsafe_code)]

pub mod broker;
pub mod message;
mod queue;
pub mod receiver;
pub mod selector;

// Re-export main types
pub use broker::{BrokerConfig, BrokerError, BrokerStats, InMemoryBroker, MessagePublisher};
pub use message::{BrokerDestination, BrokerMessage, DestinationKind, Payload, PropertyValue};
pub use receiver::{BrokerDelivery, Receiver};
pub use selector::{Selector, SelectorError};

/// Name of the dead letter queue.
pub const DLQ_QUEUE: &str = "DLQ";

/// Default number of redeliveries before a message is dead-lettered.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 6;

/// Prefix of generated temporary queue names.
pub const TEMP_QUEUE_PREFIX: &str = "temp-queue-";

/// Prefix of generated temporary topic names.
pub const TEMP_TOPIC_PREFIX: &str = "temp-topic-";
