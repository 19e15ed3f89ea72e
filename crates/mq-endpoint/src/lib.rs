//! # MQ Endpoint - Message-Oriented Middleware Bridge
//!
//! Adapts an application processing pipeline to a queue/topic transport.
//! An [`Endpoint`] owns the configuration and hands out the components that
//! talk to the transport:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              Endpoint                               │
//! │  config · DestinationResolver (resolved once) · MessageBinding      │
//! ├──────────────┬───────────────┬──────────────────┬───────────────────┤
//! │   Producer   │   Consumer    │ PollingConsumer  │    Requestor      │
//! │  InOnly ───► │ ListenerCont. │  receive(t)      │ PendingRequest    │
//! │  InOut ──────┼───────────────┼──────────────────┼► Store (DashMap)  │
//! │              │ elastic pool  │                  │ reply listener    │
//! │              │ min..=max     │                  │ purge task        │
//! └──────┬───────┴───────┬───────┴────────┬─────────┴─────────┬─────────┘
//!        │               │                │                   │
//!        ▼               ▼                ▼                   ▼
//!   ┌──────────────────────── Transport (port) ──────────────────────┐
//!   │ publish · create_receiver · subscribe · temporary destinations │
//!   └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Request/Reply
//!
//! A correlated send registers a oneshot slot keyed by correlation id, then
//! publishes. The reply listener, the caller's timeout, the purge task,
//! cancellation and shutdown all race to remove the entry; removal is atomic,
//! so exactly one of them decides the outcome.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mq_endpoint::{Endpoint, EndpointConfig, BrokerTransport};
//!
//! let transport = Arc::new(BrokerTransport::new(broker));
//! let endpoint = Endpoint::builder(transport)
//!     .destination_name("orders")
//!     .config(EndpointConfig::default())
//!     .build()?;
//! endpoint.start()?;
//!
//! let producer = endpoint.create_producer()?;
//! let reply = producer.request(Message::text("ping")).await?;
//! ```

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]
#![deny(unsafe_code)]

pub mod adapters;
pub mod binding;
pub mod consumer;
pub mod domain;
pub mod endpoint;
pub mod listener;
pub mod polling;
pub mod ports;
pub mod producer;
pub mod requestor;
pub mod resolver;

// Re-export main types
pub use adapters::broker::BrokerTransport;
pub use binding::DefaultBinding;
pub use consumer::Consumer;
pub use domain::config::{
    AcknowledgementMode, ConcurrencyBounds, ConfigError, EndpointConfig, ReplyToPolicy,
};
pub use domain::correlation::CorrelationId;
pub use domain::destination::{Domain, Lifetime, ResolvedDestination};
pub use domain::error::{
    BindingError, EndpointError, ProcessingError, ResolutionError, TransportError,
};
pub use domain::exchange::{Body, Exchange, ExchangePattern, HeaderValue, Message};
pub use domain::pending::{PendingRequestStore, PendingStats};
pub use endpoint::{Endpoint, EndpointBuilder, EndpointStats};
pub use listener::{ListenerContainer, ListenerSettings, MessageListener};
pub use polling::PollingConsumer;
pub use ports::outbound::{
    processor_fn, Delivery, MessageBinding, MessageHandler, MessageReceiver, Processor,
    ResolveDestination, SubscriptionHandle, Transport, TransportMessage, TransportPayload,
};
pub use producer::Producer;
pub use requestor::Requestor;
pub use resolver::{DestinationRef, DestinationResolver};

/// Header carrying a per-exchange request timeout override, in milliseconds.
pub const REQUEST_TIMEOUT_HEADER: &str = "MqRequestTimeout";

/// Transport property marking a text payload as serialized JSON.
pub const BODY_TYPE_PROPERTY: &str = "MqBodyType";
