//! Polling consumer - pull delivery, one message per call.

use crate::domain::destination::ResolvedDestination;
use crate::domain::error::EndpointError;
use crate::domain::exchange::Exchange;
use crate::endpoint::Endpoint;
use crate::ports::outbound::MessageReceiver;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::warn;

/// Pull consumer on the endpoint destination.
///
/// The transport receiver is created on the first receive and reused.
pub struct PollingConsumer {
    endpoint: Endpoint,
    destination: ResolvedDestination,
    receiver: OnceCell<Box<dyn MessageReceiver>>,
}

impl PollingConsumer {
    pub(crate) fn new(endpoint: Endpoint, destination: ResolvedDestination) -> Self {
        Self {
            endpoint,
            destination,
            receiver: OnceCell::new(),
        }
    }

    pub fn destination(&self) -> &ResolvedDestination {
        &self.destination
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` when nothing arrived. A message that cannot be
    /// decoded is negatively acknowledged and its error returned.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Exchange>, EndpointError> {
        if self.endpoint.is_stopped() {
            return Err(EndpointError::Shutdown);
        }
        let receiver = self
            .receiver
            .get_or_try_init(|| {
                self.endpoint.transport().create_receiver(
                    &self.destination,
                    self.endpoint.config().selector.as_deref(),
                )
            })
            .await?;

        let Some(delivery) = receiver.receive(timeout).await? else {
            return Ok(None);
        };
        match self.endpoint.binding().from_transport(delivery.message()) {
            Ok(message) => {
                delivery.ack();
                Ok(Some(self.endpoint.create_exchange_from(message)))
            }
            Err(e) => {
                warn!(destination = %self.destination, error = %e, "Received message could not be decoded");
                delivery.nack();
                Err(e.into())
            }
        }
    }

    /// Take a message only if one is already waiting.
    pub async fn receive_no_wait(&self) -> Result<Option<Exchange>, EndpointError> {
        self.receive(Duration::ZERO).await
    }

    /// Wait until a message arrives or the endpoint stops.
    pub async fn receive_blocking(&self) -> Result<Exchange, EndpointError> {
        let poll = self.endpoint.config().receive_timeout;
        loop {
            if let Some(exchange) = self.receive(poll).await? {
                return Ok(exchange);
            }
        }
    }
}
