//! # Receivers
//!
//! The consuming side of the broker: pull-style receive with acknowledgement.

use crate::broker::{BrokerError, BrokerStats, TopicSubscription};
use crate::message::{BrokerDestination, BrokerMessage};
use crate::queue::MessageQueue;
use crate::selector::Selector;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

enum Source {
    /// Competing receiver on a queue; the selector is applied on receive.
    Queue {
        queue: Arc<MessageQueue>,
        selector: Option<Selector>,
    },
    /// Private subscription on a topic; the selector was applied on publish.
    Topic(Arc<TopicSubscription>),
}

/// A message consumer bound to one destination.
///
/// Dropping a topic receiver ends its subscription.
pub struct Receiver {
    destination: BrokerDestination,
    source: Source,
    dead_letter: Arc<MessageQueue>,
    max_redeliveries: u32,
    stats: Arc<BrokerStats>,
}

impl Receiver {
    pub(crate) fn for_queue(
        destination: BrokerDestination,
        queue: Arc<MessageQueue>,
        selector: Option<Selector>,
        dead_letter: Arc<MessageQueue>,
        max_redeliveries: u32,
        stats: Arc<BrokerStats>,
    ) -> Self {
        Self {
            destination,
            source: Source::Queue { queue, selector },
            dead_letter,
            max_redeliveries,
            stats,
        }
    }

    pub(crate) fn for_topic(
        destination: BrokerDestination,
        subscription: Arc<TopicSubscription>,
        dead_letter: Arc<MessageQueue>,
        max_redeliveries: u32,
        stats: Arc<BrokerStats>,
    ) -> Self {
        Self {
            destination,
            source: Source::Topic(subscription),
            dead_letter,
            max_redeliveries,
            stats,
        }
    }

    /// The destination this receiver consumes from.
    #[must_use]
    pub fn destination(&self) -> &BrokerDestination {
        &self.destination
    }

    /// Receive the next message, waiting up to `timeout`.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(delivery))` - a message that must be settled
    /// - `Ok(None)` - nothing arrived in time
    /// - `Err(BrokerError::DestinationDeleted)` - the destination is gone
    pub async fn receive(&self, timeout: Duration) -> Result<Option<BrokerDelivery>, BrokerError> {
        let (queue, selector) = match &self.source {
            Source::Queue { queue, selector } => (queue, selector.as_ref()),
            Source::Topic(subscription) => (&subscription.queue, None),
        };

        let Some(mut message) = queue.take(selector, timeout).await? else {
            return Ok(None);
        };

        message.delivery_count += 1;
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);

        Ok(Some(BrokerDelivery {
            message,
            origin: queue.clone(),
            dead_letter: self.dead_letter.clone(),
            max_redeliveries: self.max_redeliveries,
            stats: self.stats.clone(),
        }))
    }

    /// Receive without waiting.
    pub async fn try_receive(&self) -> Result<Option<BrokerDelivery>, BrokerError> {
        self.receive(Duration::ZERO).await
    }
}

/// A received, not yet settled message.
///
/// Dropping a delivery without settling it counts as an acknowledgement.
pub struct BrokerDelivery {
    message: BrokerMessage,
    origin: Arc<MessageQueue>,
    dead_letter: Arc<MessageQueue>,
    max_redeliveries: u32,
    stats: Arc<BrokerStats>,
}

impl BrokerDelivery {
    /// The delivered message.
    #[must_use]
    pub fn message(&self) -> &BrokerMessage {
        &self.message
    }

    /// Take the message out of the delivery, acknowledging it.
    #[must_use]
    pub fn into_message(self) -> BrokerMessage {
        self.stats.acknowledged.fetch_add(1, Ordering::Relaxed);
        self.message
    }

    /// Settle the message as processed.
    pub fn ack(self) {
        self.stats.acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    /// Reject the message so it is delivered again.
    ///
    /// After `max_redeliveries` redeliveries the message moves to the dead
    /// letter queue instead.
    pub fn nack(self) {
        let mut message = self.message;
        // delivery_count counts the first delivery too
        if message.delivery_count > self.max_redeliveries {
            warn!(
                message_id = %message.message_id,
                queue = self.origin.name(),
                deliveries = message.delivery_count,
                "Redelivery limit reached, moving message to dead letter queue"
            );
            self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.dead_letter.push_back(message) {
                warn!(error = %e, "Dead letter queue unavailable, message dropped");
            }
            return;
        }

        message.redelivered = true;
        match self.origin.push_front(message) {
            Ok(()) => {
                self.stats.redelivered.fetch_add(1, Ordering::Relaxed);
                debug!(queue = self.origin.name(), "Message re-queued for redelivery");
            }
            Err(e) => {
                debug!(error = %e, "Origin deleted, nacked message dropped");
            }
        }
    }
}
