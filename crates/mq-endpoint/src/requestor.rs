//! Requestor - the request/reply correlation engine.
//!
//! ```text
//!   request() ──► register(id) ──► publish ──► await slot ◄── ReplyListener.complete(id)
//!                     │                            │
//!                     │                 deadline ──┴─► expire(id)
//!                     └──────────── purge task ──────► purge_expired(grace)
//! ```
//!
//! Every path ends in one atomic removal from the [`PendingRequestStore`];
//! the remover fulfils the caller's oneshot slot.

use crate::domain::config::{EndpointConfig, ReplyToPolicy};
use crate::domain::correlation::CorrelationId;
use crate::domain::destination::{Domain, ResolvedDestination};
use crate::domain::error::EndpointError;
use crate::domain::exchange::{HeaderValue, Message};
use crate::domain::pending::{purge_task, PendingRequestStore, PendingStats};
use crate::ports::outbound::{
    MessageBinding, MessageHandler, SubscriptionHandle, Transport, TransportMessage,
};
use async_trait::async_trait;
use mq_telemetry::log_event;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Completes pending requests from received replies.
struct ReplyListener {
    pending: Arc<PendingRequestStore>,
    binding: Arc<dyn MessageBinding>,
}

#[async_trait]
impl MessageHandler for ReplyListener {
    async fn on_message(&self, message: TransportMessage) {
        let Some(correlation_id) = message.correlation_id.clone().map(CorrelationId::from) else {
            self.pending.record_dropped_reply(None);
            return;
        };

        match self.binding.from_transport(&message) {
            Ok(reply) => {
                self.pending.complete(&correlation_id, reply);
            }
            Err(e) => {
                warn!(correlation_id = %correlation_id, error = %e, "Reply could not be decoded");
                if !self.pending.fail(&correlation_id, EndpointError::Binding(e)) {
                    self.pending.record_dropped_reply(Some(&correlation_id));
                }
            }
        }
    }
}

#[derive(Default)]
struct RequestorTasks {
    subscription: Option<SubscriptionHandle>,
    purge: Option<JoinHandle<()>>,
}

/// Correlated request/reply over a [`Transport`].
///
/// Created once per endpoint (see [`Endpoint::requestor`](crate::Endpoint::requestor))
/// and shared by all its producers.
pub struct Requestor {
    transport: Arc<dyn Transport>,
    binding: Arc<dyn MessageBinding>,
    pending: Arc<PendingRequestStore>,
    listener: Arc<ReplyListener>,
    policy: ReplyToPolicy,
    /// Shared reply channel; `None` under `PerRequestTemporary`
    reply_to: Option<ResolvedDestination>,
    token: String,
    /// Property stamped on requests for an externally shared reply queue
    token_property: Option<String>,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<RequestorTasks>,
}

impl Requestor {
    /// Set up the reply channel and start the reply listener and purge task.
    ///
    /// `label` tags metrics and logs, normally the endpoint destination.
    pub async fn start(
        config: &EndpointConfig,
        transport: Arc<dyn Transport>,
        binding: Arc<dyn MessageBinding>,
        label: &str,
    ) -> Result<Arc<Self>, EndpointError> {
        let pending = Arc::new(PendingRequestStore::new(label));
        let listener = Arc::new(ReplyListener {
            pending: pending.clone(),
            binding: binding.clone(),
        });
        let token = Uuid::new_v4().simple().to_string();

        let mut token_property = None;
        let (reply_to, subscription) = match &config.reply_to {
            ReplyToPolicy::Shared {
                destination,
                externally_shared,
            } => {
                let reply_to = ResolvedDestination::queue(destination.clone());
                let selector = if *externally_shared {
                    token_property = Some(config.correlation_property.clone());
                    Some(format!("{} = '{}'", config.correlation_property, token))
                } else {
                    None
                };
                let subscription = transport
                    .subscribe(&reply_to, selector.as_deref(), listener.clone())
                    .await?;
                (Some(reply_to), Some(subscription))
            }
            ReplyToPolicy::SharedTemporary => {
                let reply_to = transport.create_temporary_destination(Domain::Queue).await?;
                match transport.subscribe(&reply_to, None, listener.clone()).await {
                    Ok(subscription) => (Some(reply_to), Some(subscription)),
                    Err(e) => {
                        delete_temporary(transport.as_ref(), &reply_to).await;
                        return Err(e.into());
                    }
                }
            }
            ReplyToPolicy::PerRequestTemporary => (None, None),
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let purge = tokio::spawn(purge_task(
            pending.clone(),
            config.request_map_purge_interval,
            config.purge_grace,
            shutdown_rx,
        ));

        log_event!(
            info,
            "requestor",
            "Requestor started",
            endpoint = label,
            reply_to = ?reply_to.as_ref().map(ToString::to_string),
            policy = ?config.reply_to
        );

        Ok(Arc::new(Self {
            transport,
            binding,
            pending,
            listener,
            policy: config.reply_to.clone(),
            reply_to,
            token,
            token_property,
            stopped: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(RequestorTasks {
                subscription,
                purge: Some(purge),
            }),
        }))
    }

    /// Send `message` to `destination` and wait up to `timeout` for the reply.
    ///
    /// The message's correlation id is reused when set, otherwise a fresh one
    /// is assigned.
    ///
    /// # Errors
    ///
    /// - `DuplicateCorrelationId` if the id is already in flight
    /// - `Transport` if publishing fails (nothing stays registered)
    /// - `Timeout` if no reply arrives in time
    /// - `Shutdown` if the requestor stops first
    pub async fn request(
        &self,
        destination: &ResolvedDestination,
        mut message: Message,
        timeout: Duration,
    ) -> Result<Message, EndpointError> {
        if self.is_stopped() {
            return Err(EndpointError::Shutdown);
        }

        let correlation_id = message.correlation_id.clone().unwrap_or_default();
        message.correlation_id = Some(correlation_id.clone());

        let mut guard = RequestGuard {
            pending: self.pending.clone(),
            transport: self.transport.clone(),
            correlation_id,
            registered: false,
            temporary: None,
            subscription: None,
        };
        let result = self
            .send_and_wait(&mut guard, destination, message, timeout)
            .await;
        guard.release().await;
        result
    }

    async fn send_and_wait(
        &self,
        guard: &mut RequestGuard,
        destination: &ResolvedDestination,
        mut message: Message,
        timeout: Duration,
    ) -> Result<Message, EndpointError> {
        let correlation_id = guard.correlation_id.clone();

        let reply_to = match &self.reply_to {
            Some(reply_to) => reply_to.clone(),
            None => {
                let temporary = self
                    .transport
                    .create_temporary_destination(Domain::Queue)
                    .await?;
                guard.temporary = Some(temporary.clone());
                let subscription = self
                    .transport
                    .subscribe(&temporary, None, self.listener.clone())
                    .await?;
                guard.subscription = Some(subscription);
                temporary
            }
        };

        message.reply_to = Some(reply_to.clone());
        if let Some(property) = &self.token_property {
            message
                .headers
                .insert(property.clone(), HeaderValue::String(self.token.clone()));
        }
        let transport_message = self.binding.to_transport(&message)?;

        let mut rx = self.pending.register(correlation_id.clone(), timeout)?;
        guard.registered = true;
        // stop() may have drained the store between the first check and register
        if self.is_stopped() {
            return Err(EndpointError::Shutdown);
        }

        if let Err(e) = self.transport.publish(destination, transport_message).await {
            error!(
                correlation_id = %correlation_id,
                destination = %destination,
                error = %e,
                "Failed to publish request"
            );
            return Err(EndpointError::Transport(e));
        }
        debug!(
            correlation_id = %correlation_id,
            destination = %destination,
            reply_to = %reply_to,
            "Sent correlated request"
        );

        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        let outcome = tokio::select! {
            biased;
            outcome = &mut rx => outcome,
            () = &mut sleep => {
                // Whoever removes the entry fulfils the slot
                self.pending.expire(&correlation_id);
                (&mut rx).await
            }
        };
        guard.registered = false;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(EndpointError::Cancelled(correlation_id)),
        }
    }

    /// Stop the reply listener and purge task and fail every outstanding
    /// request with `Shutdown`.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let failed = self.pending.fail_all(EndpointError::Shutdown);
        let _ = self.shutdown.send(true);

        let (subscription, purge) = {
            let mut tasks = self.tasks.lock();
            (tasks.subscription.take(), tasks.purge.take())
        };
        if let Some(subscription) = subscription {
            subscription.stop().await;
        }
        if let Some(purge) = purge {
            let _ = purge.await;
        }
        if let (ReplyToPolicy::SharedTemporary, Some(reply_to)) = (&self.policy, &self.reply_to) {
            delete_temporary(self.transport.as_ref(), reply_to).await;
        }

        log_event!(info, "requestor", "Requestor stopped", failed_requests = failed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.pending_count()
    }

    pub fn stats(&self) -> &PendingStats {
        self.pending.stats()
    }

    pub fn pending(&self) -> &Arc<PendingRequestStore> {
        &self.pending
    }

    pub fn policy(&self) -> &ReplyToPolicy {
        &self.policy
    }

    /// The shared reply channel, if the policy has one.
    pub fn reply_to(&self) -> Option<&ResolvedDestination> {
        self.reply_to.as_ref()
    }

    /// Token identifying this requestor on an externally shared reply queue.
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Releases what one request holds, on every exit path.
///
/// `release()` cleans up inline; if the request future is dropped instead,
/// `Drop` cancels the entry and deletes the temporary destination on a
/// spawned task.
struct RequestGuard {
    pending: Arc<PendingRequestStore>,
    transport: Arc<dyn Transport>,
    correlation_id: CorrelationId,
    registered: bool,
    temporary: Option<ResolvedDestination>,
    subscription: Option<SubscriptionHandle>,
}

impl RequestGuard {
    async fn release(mut self) {
        if self.registered {
            self.pending.cancel(&self.correlation_id);
            self.registered = false;
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.stop().await;
        }
        if let Some(temporary) = self.temporary.take() {
            delete_temporary(self.transport.as_ref(), &temporary).await;
        }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.registered {
            self.pending.cancel(&self.correlation_id);
        }
        drop(self.subscription.take());
        if let Some(temporary) = self.temporary.take() {
            let transport = self.transport.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        delete_temporary(transport.as_ref(), &temporary).await;
                    });
                }
                Err(_) => warn!(
                    destination = %temporary,
                    "No runtime available, temporary reply destination not deleted"
                ),
            }
        }
    }
}

async fn delete_temporary(transport: &dyn Transport, destination: &ResolvedDestination) {
    match transport.delete_destination(destination).await {
        Ok(()) => debug!(destination = %destination, "Temporary reply destination deleted"),
        Err(e) => warn!(
            destination = %destination,
            error = %e,
            "Failed to delete temporary reply destination"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::broker::BrokerTransport;
    use crate::binding::DefaultBinding;
    use crate::domain::exchange::Body;
    use shared_broker::InMemoryBroker;
    use std::sync::atomic::Ordering;

    const REQUESTS: &str = "requests";

    fn config(policy: ReplyToPolicy) -> EndpointConfig {
        EndpointConfig {
            reply_to: policy,
            request_map_purge_interval: Duration::from_millis(20),
            purge_grace: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn requestor(
        transport: &Arc<BrokerTransport>,
        policy: ReplyToPolicy,
    ) -> Arc<Requestor> {
        Requestor::start(
            &config(policy),
            transport.clone(),
            Arc::new(DefaultBinding::new()),
            "queue://requestor-tests",
        )
        .await
        .unwrap()
    }

    /// Echo responder copying the correlation id and routing property.
    fn spawn_responder(transport: Arc<BrokerTransport>, replies: usize) -> JoinHandle<()> {
        tokio::spawn(async move {
            let queue = ResolvedDestination::queue(REQUESTS);
            let receiver = transport.create_receiver(&queue, None).await.unwrap();
            for _ in 0..replies {
                let Some(delivery) = receiver.receive(Duration::from_secs(5)).await.unwrap() else {
                    return;
                };
                let request = delivery.message().clone();
                delivery.ack();
                let mut reply = TransportMessage {
                    correlation_id: request.correlation_id.clone(),
                    payload: request.payload.clone(),
                    ..Default::default()
                };
                if let Some(token) = request.property("MqRequestorToken") {
                    reply
                        .properties
                        .insert("MqRequestorToken".into(), token.clone());
                }
                if let Some(reply_to) = request.reply_to {
                    transport.publish(&reply_to, reply).await.unwrap();
                }
            }
        })
    }

    #[tokio::test]
    async fn test_shared_temporary_round_trip() {
        let transport = Arc::new(BrokerTransport::new(Arc::new(InMemoryBroker::new())));
        let requestor = requestor(&transport, ReplyToPolicy::SharedTemporary).await;
        let responder = spawn_responder(transport.clone(), 1);

        let reply = requestor
            .request(
                &ResolvedDestination::queue(REQUESTS),
                Message::text("ping"),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(reply.body, Body::Text("ping".into()));
        assert!(reply.correlation_id.is_some());
        assert_eq!(requestor.pending_count(), 0);
        responder.await.unwrap();

        let reply_to = requestor.reply_to().cloned().unwrap();
        assert!(reply_to.is_temporary());
        requestor.stop().await;
        assert!(!transport.broker().exists(&BrokerTransport::to_broker_destination(&reply_to)));
    }

    #[tokio::test]
    async fn test_timeout_leaves_registry_empty() {
        let transport = Arc::new(BrokerTransport::new(Arc::new(InMemoryBroker::new())));
        let requestor = requestor(
            &transport,
            ReplyToPolicy::Shared {
                destination: "replies".into(),
                externally_shared: false,
            },
        )
        .await;

        let started = tokio::time::Instant::now();
        let err = requestor
            .request(
                &ResolvedDestination::queue(REQUESTS),
                Message::text("unanswered").with_correlation_id("B1"),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();

        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(
            err,
            EndpointError::Timeout {
                correlation_id: CorrelationId::from("B1"),
                timeout: Duration::from_millis(100),
            }
        );
        assert_eq!(requestor.pending_count(), 0);
        assert_eq!(requestor.stats().timeouts(), 1);
        requestor.stop().await;
    }

    #[tokio::test]
    async fn test_publish_failure_removes_entry() {
        let transport = Arc::new(BrokerTransport::new(Arc::new(InMemoryBroker::new())));
        let requestor = requestor(&transport, ReplyToPolicy::SharedTemporary).await;

        let gone = ResolvedDestination::temporary("temp-queue-gone", Domain::Queue);
        let err = requestor
            .request(&gone, Message::text("x"), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, EndpointError::Transport(_)));
        assert_eq!(requestor.pending_count(), 0);
        requestor.stop().await;
    }

    #[tokio::test]
    async fn test_per_request_temporaries_released() {
        let broker = Arc::new(InMemoryBroker::new());
        let transport = Arc::new(BrokerTransport::new(broker.clone()));
        let requestor = requestor(&transport, ReplyToPolicy::PerRequestTemporary).await;
        let responder = spawn_responder(transport.clone(), 3);
        let destination = ResolvedDestination::queue(REQUESTS);

        for i in 0..3 {
            let reply = requestor
                .request(&destination, Message::text(format!("m{i}")), Duration::from_secs(2))
                .await
                .unwrap();
            assert_eq!(reply.body.as_text(), Some(format!("m{i}").as_str()));
        }
        responder.await.unwrap();

        // No responder left: this one times out
        let err = requestor
            .request(&destination, Message::text("late"), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let stats = broker.stats();
        assert_eq!(stats.temporary_created.load(Ordering::Relaxed), 4);
        assert_eq!(stats.temporary_deleted.load(Ordering::Relaxed), 4);
        requestor.stop().await;
    }

    #[tokio::test]
    async fn test_cancelled_request_releases_temporary() {
        let broker = Arc::new(InMemoryBroker::new());
        let transport = Arc::new(BrokerTransport::new(broker.clone()));
        let requestor = requestor(&transport, ReplyToPolicy::PerRequestTemporary).await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(30),
            requestor.request(
                &ResolvedDestination::queue(REQUESTS),
                Message::text("abandoned"),
                Duration::from_secs(10),
            ),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(requestor.pending_count(), 0);

        // Deletion runs on a spawned task
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.stats().live_temporaries(), 0);
        assert_eq!(requestor.stats().cancelled(), 1);
        requestor.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_rejected() {
        let transport = Arc::new(BrokerTransport::new(Arc::new(InMemoryBroker::new())));
        let requestor = requestor(&transport, ReplyToPolicy::SharedTemporary).await;
        let destination = ResolvedDestination::queue(REQUESTS);

        let first = {
            let requestor = requestor.clone();
            let destination = destination.clone();
            tokio::spawn(async move {
                requestor
                    .request(&destination, Message::text("a").with_correlation_id("same"), Duration::from_millis(200))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = requestor
            .request(&destination, Message::text("b").with_correlation_id("same"), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err, EndpointError::DuplicateCorrelationId(CorrelationId::from("same")));
        assert!(first.await.unwrap().unwrap_err().is_timeout());
        requestor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_fails_outstanding_requests() {
        let transport = Arc::new(BrokerTransport::new(Arc::new(InMemoryBroker::new())));
        let requestor = requestor(&transport, ReplyToPolicy::SharedTemporary).await;

        let waiting = {
            let requestor = requestor.clone();
            tokio::spawn(async move {
                requestor
                    .request(&ResolvedDestination::queue(REQUESTS), Message::text("x"), Duration::from_secs(30))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(requestor.pending_count(), 1);

        requestor.stop().await;
        assert_eq!(waiting.await.unwrap(), Err(EndpointError::Shutdown));
        assert_eq!(
            requestor
                .request(&ResolvedDestination::queue(REQUESTS), Message::text("y"), Duration::from_secs(1))
                .await,
            Err(EndpointError::Shutdown)
        );
    }

    #[tokio::test]
    async fn test_externally_shared_reply_queue_routes_by_token() {
        let transport = Arc::new(BrokerTransport::new(Arc::new(InMemoryBroker::new())));
        let policy = ReplyToPolicy::Shared {
            destination: "shared-replies".into(),
            externally_shared: true,
        };
        let first = requestor(&transport, policy.clone()).await;
        let second = requestor(&transport, policy).await;
        assert_ne!(first.token(), second.token());
        let responder = spawn_responder(transport.clone(), 2);
        let destination = ResolvedDestination::queue(REQUESTS);

        let (a, b) = tokio::join!(
            first.request(&destination, Message::text("from-first"), Duration::from_secs(2)),
            second.request(&destination, Message::text("from-second"), Duration::from_secs(2)),
        );
        assert_eq!(a.unwrap().body.as_text(), Some("from-first"));
        assert_eq!(b.unwrap().body.as_text(), Some("from-second"));
        assert_eq!(first.stats().dropped_replies(), 0);
        assert_eq!(second.stats().dropped_replies(), 0);
        responder.await.unwrap();
        first.stop().await;
        second.stop().await;
    }
}
