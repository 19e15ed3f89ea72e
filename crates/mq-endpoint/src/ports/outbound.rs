//! Outbound ports for the endpoint.
//!
//! The transport, the message binding, destination resolvers and the
//! application processor are supplied from outside; the endpoint only talks
//! to them through these traits.

use crate::domain::destination::{Domain, ResolvedDestination};
use crate::domain::error::{BindingError, ProcessingError, ResolutionError, TransportError};
use crate::domain::exchange::{Exchange, HeaderValue, Message};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Poll period of subscription loops; shutdown interrupts the wait.
const SUBSCRIPTION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Pause after a failed receive before polling again.
const SUBSCRIPTION_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Payload as carried by the transport.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TransportPayload {
    #[default]
    Empty,
    Text(String),
    Bytes(Bytes),
}

/// Message as carried by the transport.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransportMessage {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<ResolvedDestination>,
    pub message_type: Option<String>,
    pub properties: BTreeMap<String, HeaderValue>,
    pub payload: TransportPayload,
    pub redelivered: bool,
}

impl TransportMessage {
    pub fn property(&self, name: &str) -> Option<&HeaderValue> {
        self.properties.get(name)
    }
}

/// A received message awaiting settlement.
pub trait Delivery: Send {
    fn message(&self) -> &TransportMessage;

    /// Settle as processed.
    fn ack(self: Box<Self>);

    /// Reject so the transport redelivers.
    fn nack(self: Box<Self>);
}

/// Pull-style consumer bound to one destination.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Wait up to `timeout` for the next message.
    async fn receive(&self, timeout: Duration)
        -> Result<Option<Box<dyn Delivery>>, TransportError>;
}

/// Push-style callback used by [`Transport::subscribe`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: TransportMessage);
}

/// The message-oriented middleware primitive.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Transmit a message.
    async fn publish(
        &self,
        destination: &ResolvedDestination,
        message: TransportMessage,
    ) -> Result<(), TransportError>;

    /// Create a pull receiver, optionally filtered by a selector expression.
    async fn create_receiver(
        &self,
        destination: &ResolvedDestination,
        selector: Option<&str>,
    ) -> Result<Box<dyn MessageReceiver>, TransportError>;

    /// Deliver every message to `handler` until the handle is dropped.
    ///
    /// The default implementation runs a receive loop on a spawned task and
    /// acknowledges each message once the handler returns.
    async fn subscribe(
        &self,
        destination: &ResolvedDestination,
        selector: Option<&str>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, TransportError> {
        let receiver = self.create_receiver(destination, selector).await?;
        Ok(SubscriptionHandle::spawn(destination.clone(), receiver, handler))
    }

    /// Create a uniquely named temporary destination.
    async fn create_temporary_destination(
        &self,
        domain: Domain,
    ) -> Result<ResolvedDestination, TransportError>;

    /// Delete a destination; deleting an unknown destination is not an error.
    async fn delete_destination(
        &self,
        destination: &ResolvedDestination,
    ) -> Result<(), TransportError>;
}

/// Running subscription. Dropping it stops delivery.
pub struct SubscriptionHandle {
    destination: ResolvedDestination,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Spawn a receive loop feeding `handler`.
    pub fn spawn(
        destination: ResolvedDestination,
        receiver: Box<dyn MessageReceiver>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(subscription_loop(
            destination.clone(),
            receiver,
            handler,
            shutdown_rx,
        ));
        Self {
            destination,
            shutdown,
            task: Some(task),
        }
    }

    pub fn destination(&self) -> &ResolvedDestination {
        &self.destination
    }

    /// Stop delivery and wait for the loop to finish its current message.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn subscription_loop(
    destination: ResolvedDestination,
    receiver: Box<dyn MessageReceiver>,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(destination = %destination, "Subscription started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let received = tokio::select! {
            received = receiver.receive(SUBSCRIPTION_POLL_INTERVAL) => received,
            _ = shutdown.changed() => break,
        };
        match received {
            Ok(Some(delivery)) => {
                handler.on_message(delivery.message().clone()).await;
                delivery.ack();
            }
            Ok(None) => {}
            Err(TransportError::DestinationDeleted(_)) => {
                debug!(destination = %destination, "Subscribed destination deleted");
                break;
            }
            Err(e) => {
                warn!(destination = %destination, error = %e, "Subscription receive failed");
                tokio::time::sleep(SUBSCRIPTION_RETRY_DELAY).await;
            }
        }
    }
    debug!(destination = %destination, "Subscription stopped");
}

/// Conversion between the endpoint message model and the transport.
pub trait MessageBinding: Send + Sync {
    fn to_transport(&self, message: &Message) -> Result<TransportMessage, BindingError>;

    fn from_transport(&self, message: &TransportMessage) -> Result<Message, BindingError>;
}

/// Resolves a destination name at endpoint start.
pub trait ResolveDestination: Send + Sync {
    fn resolve(
        &self,
        name: &str,
        pub_sub_domain: bool,
    ) -> Result<ResolvedDestination, ResolutionError>;
}

impl<F> ResolveDestination for F
where
    F: Fn(&str, bool) -> Result<ResolvedDestination, ResolutionError> + Send + Sync,
{
    fn resolve(
        &self,
        name: &str,
        pub_sub_domain: bool,
    ) -> Result<ResolvedDestination, ResolutionError> {
        self(name, pub_sub_domain)
    }
}

/// Application processing of an exchange.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError>;
}

/// [`Processor`] backed by a synchronous closure.
pub struct FnProcessor<F>(F);

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), ProcessingError> + Send + Sync,
{
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        (self.0)(exchange)
    }
}

/// Wrap a closure as a shareable [`Processor`].
pub fn processor_fn<F>(f: F) -> Arc<dyn Processor>
where
    F: Fn(&mut Exchange) -> Result<(), ProcessingError> + Send + Sync + 'static,
{
    Arc::new(FnProcessor(f))
}
