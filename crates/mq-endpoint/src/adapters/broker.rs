//! [`Transport`] over the in-process [`InMemoryBroker`].
//!
//! Maps endpoint destinations, messages and errors to their broker
//! counterparts.

use crate::domain::destination::{Domain, Lifetime, ResolvedDestination};
use crate::domain::error::TransportError;
use crate::domain::exchange::HeaderValue;
use crate::ports::outbound::{
    Delivery, MessageReceiver, Transport, TransportMessage, TransportPayload,
};
use async_trait::async_trait;
use shared_broker::{
    BrokerDelivery, BrokerDestination, BrokerError, BrokerMessage, DestinationKind,
    InMemoryBroker, MessagePublisher, Payload, PropertyValue, Receiver, Selector,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Transport backed by an [`InMemoryBroker`].
#[derive(Clone)]
pub struct BrokerTransport {
    broker: Arc<InMemoryBroker>,
}

impl BrokerTransport {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self { broker }
    }

    /// The underlying broker.
    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }

    pub fn to_broker_destination(destination: &ResolvedDestination) -> BrokerDestination {
        let kind = match (destination.domain, destination.lifetime) {
            (Domain::Queue, Lifetime::Durable) => DestinationKind::Queue,
            (Domain::Topic, Lifetime::Durable) => DestinationKind::Topic,
            (Domain::Queue, Lifetime::Temporary) => DestinationKind::TemporaryQueue,
            (Domain::Topic, Lifetime::Temporary) => DestinationKind::TemporaryTopic,
        };
        BrokerDestination {
            name: destination.name.clone(),
            kind,
        }
    }

    pub fn from_broker_destination(destination: &BrokerDestination) -> ResolvedDestination {
        let (domain, lifetime) = match destination.kind {
            DestinationKind::Queue => (Domain::Queue, Lifetime::Durable),
            DestinationKind::Topic => (Domain::Topic, Lifetime::Durable),
            DestinationKind::TemporaryQueue => (Domain::Queue, Lifetime::Temporary),
            DestinationKind::TemporaryTopic => (Domain::Topic, Lifetime::Temporary),
        };
        ResolvedDestination {
            name: destination.name.clone(),
            domain,
            lifetime,
        }
    }
}

fn to_broker_message(message: TransportMessage) -> BrokerMessage {
    let payload = match message.payload {
        TransportPayload::Empty => Payload::Empty,
        TransportPayload::Text(text) => Payload::Text(text),
        TransportPayload::Bytes(bytes) => Payload::Bytes(bytes),
    };
    let mut broker_message = BrokerMessage::new(payload);
    // The broker assigns ids; an id carried over from a received message is
    // not reused.
    broker_message.correlation_id = message.correlation_id;
    broker_message.reply_to = message.reply_to.as_ref().map(BrokerTransport::to_broker_destination);
    broker_message.message_type = message.message_type;
    broker_message.properties = message
        .properties
        .into_iter()
        .map(|(name, value)| {
            let value = match value {
                HeaderValue::Bool(v) => PropertyValue::Bool(v),
                HeaderValue::Int(v) => PropertyValue::Int(v),
                HeaderValue::Double(v) => PropertyValue::Double(v),
                HeaderValue::String(v) => PropertyValue::String(v),
            };
            (name, value)
        })
        .collect();
    broker_message
}

fn from_broker_message(message: &BrokerMessage) -> TransportMessage {
    let payload = match &message.payload {
        Payload::Empty => TransportPayload::Empty,
        Payload::Text(text) => TransportPayload::Text(text.clone()),
        Payload::Bytes(bytes) => TransportPayload::Bytes(bytes.clone()),
    };
    TransportMessage {
        message_id: Some(message.message_id.clone()),
        correlation_id: message.correlation_id.clone(),
        reply_to: message
            .reply_to
            .as_ref()
            .map(BrokerTransport::from_broker_destination),
        message_type: message.message_type.clone(),
        properties: message
            .properties
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    PropertyValue::Bool(v) => HeaderValue::Bool(*v),
                    PropertyValue::Int(v) => HeaderValue::Int(*v),
                    PropertyValue::Double(v) => HeaderValue::Double(*v),
                    PropertyValue::String(v) => HeaderValue::String(v.clone()),
                };
                (name.clone(), value)
            })
            .collect(),
        payload,
        redelivered: message.redelivered,
    }
}

fn map_broker_error(error: BrokerError) -> TransportError {
    match error {
        BrokerError::DestinationDeleted(name) => TransportError::DestinationDeleted(name),
        BrokerError::InvalidName(name) => TransportError::InvalidDestination(name),
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    async fn publish(
        &self,
        destination: &ResolvedDestination,
        message: TransportMessage,
    ) -> Result<(), TransportError> {
        let destination = Self::to_broker_destination(destination);
        self.broker
            .publish(&destination, to_broker_message(message))
            .await
            .map(|_| ())
            .map_err(map_broker_error)
    }

    async fn create_receiver(
        &self,
        destination: &ResolvedDestination,
        selector: Option<&str>,
    ) -> Result<Box<dyn MessageReceiver>, TransportError> {
        let selector = selector
            .map(Selector::parse)
            .transpose()
            .map_err(|e| TransportError::InvalidSelector(e.to_string()))?;
        let receiver = self
            .broker
            .create_receiver(&Self::to_broker_destination(destination), selector)
            .map_err(map_broker_error)?;
        Ok(Box::new(BrokerReceiver { receiver }))
    }

    async fn create_temporary_destination(
        &self,
        domain: Domain,
    ) -> Result<ResolvedDestination, TransportError> {
        let created = self.broker.create_temporary(domain == Domain::Topic);
        Ok(Self::from_broker_destination(&created))
    }

    async fn delete_destination(
        &self,
        destination: &ResolvedDestination,
    ) -> Result<(), TransportError> {
        if !self.broker.delete(&Self::to_broker_destination(destination)) {
            debug!(destination = %destination, "Destination already deleted");
        }
        Ok(())
    }
}

struct BrokerReceiver {
    receiver: Receiver,
}

#[async_trait]
impl MessageReceiver for BrokerReceiver {
    async fn receive(
        &self,
        timeout: Duration,
    ) -> Result<Option<Box<dyn Delivery>>, TransportError> {
        let delivery = self
            .receiver
            .receive(timeout)
            .await
            .map_err(map_broker_error)?;
        Ok(delivery.map(|delivery| {
            let message = from_broker_message(delivery.message());
            Box::new(BrokerDeliveryAdapter { delivery, message }) as Box<dyn Delivery>
        }))
    }
}

struct BrokerDeliveryAdapter {
    delivery: BrokerDelivery,
    message: TransportMessage,
}

impl Delivery for BrokerDeliveryAdapter {
    fn message(&self) -> &TransportMessage {
        &self.message
    }

    fn ack(self: Box<Self>) {
        self.delivery.ack();
    }

    fn nack(self: Box<Self>) {
        self.delivery.nack();
    }
}
