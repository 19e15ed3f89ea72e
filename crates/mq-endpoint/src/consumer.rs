//! Consumer - push delivery of endpoint messages to a [`Processor`].

use crate::domain::correlation::CorrelationId;
use crate::domain::destination::ResolvedDestination;
use crate::domain::error::EndpointError;
use crate::domain::exchange::{Exchange, ExchangePattern};
use crate::endpoint::Endpoint;
use crate::listener::{ListenerContainer, ListenerSettings, MessageListener};
use crate::ports::outbound::{MessageBinding, Processor, Transport, TransportMessage};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// Turns received messages into exchanges and sends replies.
struct ConsumerListener {
    transport: Arc<dyn Transport>,
    binding: Arc<dyn MessageBinding>,
    processor: Arc<dyn Processor>,
    disable_reply_to: bool,
    correlation_property: String,
}

#[async_trait]
impl MessageListener for ConsumerListener {
    async fn on_message(&self, message: TransportMessage) -> Result<(), EndpointError> {
        let inbound = self.binding.from_transport(&message)?;
        let reply_to = inbound
            .reply_to
            .clone()
            .filter(|_| !self.disable_reply_to);
        let pattern = if reply_to.is_some() {
            ExchangePattern::InOut
        } else {
            ExchangePattern::InOnly
        };

        let mut exchange = Exchange::new(pattern, inbound);
        self.processor.process(&mut exchange).await?;
        if let Some(failure) = exchange.failure() {
            return Err(failure.clone());
        }

        let (Some(reply_to), Some(mut reply)) = (reply_to, exchange.take_out()) else {
            return Ok(());
        };

        let inbound = exchange.message();
        reply.correlation_id = inbound
            .correlation_id
            .clone()
            .or_else(|| inbound.message_id.clone().map(CorrelationId::from));
        // Lets the requestor's selector pick the reply off a shared queue
        if let Some(token) = inbound.header(&self.correlation_property) {
            reply
                .headers
                .insert(self.correlation_property.clone(), token.clone());
        }

        let outbound = self.binding.to_transport(&reply)?;
        self.transport.publish(&reply_to, outbound).await?;
        debug!(
            reply_to = %reply_to,
            correlation_id = ?reply.correlation_id,
            "Reply sent"
        );
        Ok(())
    }
}

/// Push consumer over an elastic [`ListenerContainer`].
pub struct Consumer {
    endpoint: Endpoint,
    destination: ResolvedDestination,
    processor: Arc<dyn Processor>,
    container: OnceCell<ListenerContainer>,
}

impl Consumer {
    pub(crate) fn new(
        endpoint: Endpoint,
        destination: ResolvedDestination,
        processor: Arc<dyn Processor>,
    ) -> Self {
        Self {
            endpoint,
            destination,
            processor,
            container: OnceCell::new(),
        }
    }

    pub fn destination(&self) -> &ResolvedDestination {
        &self.destination
    }

    /// Start the listener workers. Calling it again has no effect.
    pub async fn start(&self) -> Result<(), EndpointError> {
        self.container
            .get_or_try_init(|| async {
                let config = self.endpoint.config();
                let listener = Arc::new(ConsumerListener {
                    transport: self.endpoint.transport().clone(),
                    binding: self.endpoint.binding(),
                    processor: self.processor.clone(),
                    disable_reply_to: config.disable_reply_to,
                    correlation_property: config.correlation_property.clone(),
                });
                let settings = ListenerSettings::from_config(self.destination.clone(), config);
                let container = ListenerContainer::start(
                    self.endpoint.transport().as_ref(),
                    settings,
                    listener,
                )
                .await?;

                if let Err(e) = self.endpoint.register_container(container.clone()) {
                    container.stop().await;
                    return Err(e);
                }
                Ok(container)
            })
            .await?;
        Ok(())
    }

    /// Stop the workers, letting in-flight messages finish.
    pub async fn stop(&self) {
        if let Some(container) = self.container.get() {
            container.stop().await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.container
            .get()
            .is_some_and(ListenerContainer::is_running)
    }

    pub fn active_workers(&self) -> usize {
        self.container
            .get()
            .map_or(0, ListenerContainer::active_workers)
    }

    pub fn peak_workers(&self) -> usize {
        self.container
            .get()
            .map_or(0, ListenerContainer::peak_workers)
    }

    pub fn processed(&self) -> u64 {
        self.container.get().map_or(0, ListenerContainer::processed)
    }

    pub fn failed(&self) -> u64 {
        self.container.get().map_or(0, ListenerContainer::failed)
    }
}
