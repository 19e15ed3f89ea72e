//! Producer - sends exchanges to the endpoint destination.

use crate::domain::correlation::CorrelationId;
use crate::domain::destination::ResolvedDestination;
use crate::domain::error::EndpointError;
use crate::domain::exchange::{Exchange, Message};
use crate::endpoint::Endpoint;
use mq_telemetry::{log_exchange_event, metric_inc, PRODUCER_MESSAGES_SENT};
use tracing::debug;

/// Sends to one destination.
///
/// In-only exchanges are published and forgotten; in-out exchanges go
/// through the endpoint's [`Requestor`](crate::Requestor) and wait for the
/// correlated reply.
pub struct Producer {
    endpoint: Endpoint,
    destination: ResolvedDestination,
    /// Metrics label
    label: String,
}

impl Producer {
    pub(crate) fn new(endpoint: Endpoint, destination: ResolvedDestination) -> Self {
        Self {
            label: destination.to_string(),
            endpoint,
            destination,
        }
    }

    pub fn destination(&self) -> &ResolvedDestination {
        &self.destination
    }

    /// Send an exchange.
    ///
    /// On success an in-out exchange carries the reply in its out slot. On
    /// failure the error is recorded on the exchange and returned; nothing is
    /// retried.
    pub async fn send(&self, exchange: &mut Exchange) -> Result<(), EndpointError> {
        let result = self.dispatch(exchange).await;
        if let Err(e) = &result {
            exchange.set_failure(e.clone());
        }
        result
    }

    /// Fire-and-forget send of a single message.
    pub async fn send_message(&self, message: Message) -> Result<(), EndpointError> {
        let mut exchange = Exchange::in_only(message);
        self.send(&mut exchange).await
    }

    /// Correlated send of a single message, returning the reply.
    pub async fn request(&self, message: Message) -> Result<Message, EndpointError> {
        let mut exchange = Exchange::in_out(message);
        self.send(&mut exchange).await?;
        exchange
            .take_out()
            .ok_or_else(|| EndpointError::configuration("reply-to is disabled on this endpoint"))
    }

    async fn dispatch(&self, exchange: &mut Exchange) -> Result<(), EndpointError> {
        if self.endpoint.is_stopped() {
            return Err(EndpointError::Shutdown);
        }
        let config = self.endpoint.config();

        if !exchange.is_in_out() || config.disable_reply_to {
            let message = self.endpoint.binding().to_transport(exchange.message())?;
            self.endpoint
                .transport()
                .publish(&self.destination, message)
                .await?;
            metric_inc!(PRODUCER_MESSAGES_SENT, &[&self.label]);
            debug!(destination = %self.destination, "Sent in-only message");
            return Ok(());
        }

        let timeout = exchange
            .request_timeout_override()
            .unwrap_or(config.request_timeout);
        // Assigned here so the caller can read it from the exchange
        let correlation_id = exchange
            .message_mut()
            .correlation_id
            .get_or_insert_with(CorrelationId::new)
            .clone();

        let requestor = self.endpoint.requestor().await?;
        let reply = requestor
            .request(&self.destination, exchange.message().clone(), timeout)
            .await
            .inspect_err(|e| {
                log_exchange_event!(
                    warn,
                    "producer",
                    "Correlated request failed",
                    correlation_id,
                    destination = %self.destination,
                    error = %e
                );
            })?;
        metric_inc!(PRODUCER_MESSAGES_SENT, &[&self.label]);
        exchange.set_out(reply);
        Ok(())
    }
}
