//! # In-Memory Broker
//!
//! Destination registry, publishing and receiver creation.

use crate::message::{BrokerDestination, BrokerMessage, DestinationKind};
use crate::queue::MessageQueue;
use crate::receiver::Receiver;
use crate::selector::Selector;
use crate::{DEFAULT_MAX_REDELIVERIES, DLQ_QUEUE, TEMP_QUEUE_PREFIX, TEMP_TOPIC_PREFIX};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors from broker operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The destination was deleted (or a temporary destination never existed).
    #[error("destination deleted: {0}")]
    DestinationDeleted(String),

    /// The destination name is not usable.
    #[error("invalid destination name: '{0}'")]
    InvalidName(String),
}

/// Trait for publishing messages to the broker.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish a message.
    ///
    /// # Returns
    ///
    /// The number of queues the message was written to: 1 for a queue, the
    /// number of matching subscriptions for a topic.
    async fn publish(
        &self,
        destination: &BrokerDestination,
        message: BrokerMessage,
    ) -> Result<usize, BrokerError>;

    /// Get the total number of messages published.
    fn messages_published(&self) -> u64;
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Redeliveries allowed before a message is dead-lettered.
    pub max_redeliveries: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
        }
    }
}

/// Cumulative broker counters.
#[derive(Debug, Default)]
pub struct BrokerStats {
    pub published: AtomicU64,
    pub delivered: AtomicU64,
    pub acknowledged: AtomicU64,
    pub redelivered: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub temporary_created: AtomicU64,
    pub temporary_deleted: AtomicU64,
}

impl BrokerStats {
    /// Temporary destinations created and not yet deleted.
    #[must_use]
    pub fn live_temporaries(&self) -> u64 {
        self.temporary_created
            .load(Ordering::Relaxed)
            .saturating_sub(self.temporary_deleted.load(Ordering::Relaxed))
    }
}

/// One receiver's private view of a topic.
pub(crate) struct TopicSubscription {
    pub(crate) queue: Arc<MessageQueue>,
    pub(crate) selector: Option<Selector>,
}

#[derive(Default)]
struct TopicState {
    subscriptions: Mutex<Vec<Weak<TopicSubscription>>>,
}

impl TopicState {
    fn fan_out(&self, message: &BrokerMessage) -> usize {
        let mut subscriptions = self.subscriptions.lock();
        // Dropped receivers leave dead weak references behind
        subscriptions.retain(|weak| weak.strong_count() > 0);

        let mut delivered = 0;
        for subscription in subscriptions.iter().filter_map(Weak::upgrade) {
            let accepted = subscription
                .selector
                .as_ref()
                .map_or(true, |selector| selector.matches(message));
            if accepted && subscription.queue.push_back(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn close(&self) {
        for subscription in self.subscriptions.lock().drain(..).filter_map(|w| w.upgrade()) {
            subscription.queue.close();
        }
    }
}

/// In-memory implementation of the broker.
///
/// Durable destinations are created on first use; temporary destinations
/// only through [`InMemoryBroker::create_temporary`].
pub struct InMemoryBroker {
    queues: DashMap<String, Arc<MessageQueue>>,
    topics: DashMap<String, Arc<TopicState>>,
    dead_letter: Arc<MessageQueue>,
    config: BrokerConfig,
    stats: Arc<BrokerStats>,
}

impl InMemoryBroker {
    /// Create a broker with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// Create a broker with the given configuration.
    #[must_use]
    pub fn with_config(config: BrokerConfig) -> Self {
        let dead_letter = Arc::new(MessageQueue::new(DLQ_QUEUE));
        let queues = DashMap::new();
        queues.insert(DLQ_QUEUE.to_string(), dead_letter.clone());
        Self {
            queues,
            topics: DashMap::new(),
            dead_letter,
            config,
            stats: Arc::new(BrokerStats::default()),
        }
    }

    fn queue(&self, destination: &BrokerDestination) -> Result<Arc<MessageQueue>, BrokerError> {
        validate_name(&destination.name)?;
        if destination.kind.is_temporary() {
            return self
                .queues
                .get(&destination.name)
                .map(|q| q.clone())
                .ok_or_else(|| BrokerError::DestinationDeleted(destination.to_string()));
        }
        Ok(self
            .queues
            .entry(destination.name.clone())
            .or_insert_with(|| Arc::new(MessageQueue::new(destination.name.clone())))
            .clone())
    }

    fn topic(&self, destination: &BrokerDestination) -> Result<Arc<TopicState>, BrokerError> {
        validate_name(&destination.name)?;
        if destination.kind.is_temporary() {
            return self
                .topics
                .get(&destination.name)
                .map(|t| t.clone())
                .ok_or_else(|| BrokerError::DestinationDeleted(destination.to_string()));
        }
        Ok(self
            .topics
            .entry(destination.name.clone())
            .or_default()
            .clone())
    }

    /// Create a receiver for a destination.
    ///
    /// For topics, the receiver only sees messages published after this call.
    pub fn create_receiver(
        &self,
        destination: &BrokerDestination,
        selector: Option<Selector>,
    ) -> Result<Receiver, BrokerError> {
        if destination.kind.is_topic() {
            let topic = self.topic(destination)?;
            let subscription = Arc::new(TopicSubscription {
                queue: Arc::new(MessageQueue::new(destination.name.clone())),
                selector,
            });
            topic.subscriptions.lock().push(Arc::downgrade(&subscription));
            debug!(destination = %destination, "New topic subscription created");
            Ok(Receiver::for_topic(
                destination.clone(),
                subscription,
                self.dead_letter.clone(),
                self.config.max_redeliveries,
                self.stats.clone(),
            ))
        } else {
            let queue = self.queue(destination)?;
            Ok(Receiver::for_queue(
                destination.clone(),
                queue,
                selector,
                self.dead_letter.clone(),
                self.config.max_redeliveries,
                self.stats.clone(),
            ))
        }
    }

    /// Create a uniquely named temporary queue or topic.
    pub fn create_temporary(&self, topic: bool) -> BrokerDestination {
        let destination = if topic {
            let name = format!("{TEMP_TOPIC_PREFIX}{}", Uuid::new_v4());
            self.topics.insert(name.clone(), Arc::new(TopicState::default()));
            BrokerDestination {
                name,
                kind: DestinationKind::TemporaryTopic,
            }
        } else {
            let name = format!("{TEMP_QUEUE_PREFIX}{}", Uuid::new_v4());
            self.queues
                .insert(name.clone(), Arc::new(MessageQueue::new(name.clone())));
            BrokerDestination {
                name,
                kind: DestinationKind::TemporaryQueue,
            }
        };
        self.stats.temporary_created.fetch_add(1, Ordering::Relaxed);
        debug!(destination = %destination, "Temporary destination created");
        destination
    }

    /// Delete a destination, dropping buffered messages.
    ///
    /// Returns `false` if the destination did not exist.
    pub fn delete(&self, destination: &BrokerDestination) -> bool {
        let removed = if destination.kind.is_topic() {
            self.topics
                .remove(&destination.name)
                .map(|(_, topic)| topic.close())
                .is_some()
        } else {
            if destination.name == DLQ_QUEUE {
                warn!("Refusing to delete the dead letter queue");
                return false;
            }
            match self.queues.remove(&destination.name) {
                Some((_, queue)) => {
                    let dropped = queue.close();
                    if dropped > 0 {
                        info!(destination = %destination, dropped, "Deleted destination with buffered messages");
                    }
                    true
                }
                None => false,
            }
        };

        if removed && destination.kind.is_temporary() {
            self.stats.temporary_deleted.fetch_add(1, Ordering::Relaxed);
        }
        debug!(destination = %destination, removed, "Destination deleted");
        removed
    }

    /// Whether a destination currently exists.
    #[must_use]
    pub fn exists(&self, destination: &BrokerDestination) -> bool {
        if destination.kind.is_topic() {
            self.topics.contains_key(&destination.name)
        } else {
            self.queues.contains_key(&destination.name)
        }
    }

    /// Number of messages buffered in a queue (0 for unknown queues).
    #[must_use]
    pub fn queue_depth(&self, name: &str) -> usize {
        self.queues.get(name).map_or(0, |q| q.len())
    }

    /// Number of messages in the dead letter queue.
    #[must_use]
    pub fn dead_letter_depth(&self) -> usize {
        self.dead_letter.len()
    }

    /// Broker counters.
    #[must_use]
    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }

    /// Broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBroker {
    async fn publish(
        &self,
        destination: &BrokerDestination,
        message: BrokerMessage,
    ) -> Result<usize, BrokerError> {
        let message_id = message.message_id.clone();

        let written = if destination.kind.is_topic() {
            self.topic(destination)?.fan_out(&message)
        } else {
            self.queue(destination)?.push_back(message)?;
            1
        };

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        debug!(
            destination = %destination,
            message_id = %message_id,
            written,
            "Message published"
        );
        Ok(written)
    }

    fn messages_published(&self) -> u64 {
        self.stats.published.load(Ordering::Relaxed)
    }
}

fn validate_name(name: &str) -> Result<(), BrokerError> {
    if name.trim().is_empty() {
        return Err(BrokerError::InvalidName(name.to_string()));
    }
    Ok(())
}
