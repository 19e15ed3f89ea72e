//! Endpoint - configuration holder and component factory.

use crate::binding::DefaultBinding;
use crate::consumer::Consumer;
use crate::domain::config::EndpointConfig;
use crate::domain::destination::{Domain, Lifetime, ResolvedDestination};
use crate::domain::error::EndpointError;
use crate::domain::exchange::{Exchange, ExchangePattern, Message};
use crate::listener::ListenerContainer;
use crate::polling::PollingConsumer;
use crate::ports::outbound::{MessageBinding, Processor, ResolveDestination, Transport};
use crate::producer::Producer;
use crate::requestor::Requestor;
use crate::resolver::{DestinationRef, DestinationResolver};
use mq_telemetry::log_event;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;
use tracing::debug;

/// Label used for metrics when the endpoint has no destination.
const UNBOUND_LABEL: &str = "unbound";

struct EndpointInner {
    config: EndpointConfig,
    resolver: Option<DestinationResolver>,
    transport: Arc<dyn Transport>,
    custom_binding: Option<Arc<dyn MessageBinding>>,
    binding: OnceLock<Arc<dyn MessageBinding>>,
    requestor: OnceCell<Arc<Requestor>>,
    containers: Mutex<Vec<ListenerContainer>>,
    stopped: AtomicBool,
}

/// A destination on a transport plus everything needed to talk to it.
///
/// Cheap to clone; clones share the resolved destination, the binding and
/// the requestor.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

/// Read-only endpoint counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Requests awaiting a reply
    pub pending_requests: usize,
    /// Listener workers across all consumers
    pub active_listeners: usize,
    pub timeouts: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub purged: u64,
    pub dropped_replies: u64,
}

/// Builder for [`Endpoint`].
pub struct EndpointBuilder {
    transport: Arc<dyn Transport>,
    config: EndpointConfig,
    destination: Option<DestinationRef>,
    binding: Option<Arc<dyn MessageBinding>>,
}

impl EndpointBuilder {
    #[must_use]
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Destination name interpreted in the configured domain.
    #[must_use]
    pub fn destination_name(mut self, name: impl Into<String>) -> Self {
        self.destination = Some(DestinationRef::Named(name.into()));
        self
    }

    /// Already resolved destination, used as-is.
    #[must_use]
    pub fn destination(mut self, destination: ResolvedDestination) -> Self {
        self.destination = Some(DestinationRef::Explicit(destination));
        self
    }

    /// Resolve `name` through `resolver` when the endpoint starts.
    #[must_use]
    pub fn resolver(
        mut self,
        name: impl Into<String>,
        resolver: Arc<dyn ResolveDestination>,
    ) -> Self {
        self.destination = Some(DestinationRef::Resolved {
            name: name.into(),
            resolver,
        });
        self
    }

    /// Replace the default binding.
    #[must_use]
    pub fn binding(mut self, binding: Arc<dyn MessageBinding>) -> Self {
        self.binding = Some(binding);
        self
    }

    /// Validate the configuration and create the endpoint.
    ///
    /// A destination set on the builder takes precedence over
    /// `config.destination_name`.
    pub fn build(self) -> Result<Endpoint, EndpointError> {
        self.config.validate()?;

        let reference = self.destination.or_else(|| {
            self.config
                .destination_name
                .clone()
                .map(DestinationRef::Named)
        });
        let resolver =
            reference.map(|r| DestinationResolver::new(r, self.config.pub_sub_domain));

        Ok(Endpoint {
            inner: Arc::new(EndpointInner {
                config: self.config,
                resolver,
                transport: self.transport,
                custom_binding: self.binding,
                binding: OnceLock::new(),
                requestor: OnceCell::new(),
                containers: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }),
        })
    }
}

impl Endpoint {
    pub fn builder(transport: Arc<dyn Transport>) -> EndpointBuilder {
        EndpointBuilder {
            transport,
            config: EndpointConfig::default(),
            destination: None,
            binding: None,
        }
    }

    /// Endpoint bound to an already resolved destination.
    ///
    /// The domain flag follows the destination kind.
    pub fn for_destination(
        destination: ResolvedDestination,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, EndpointError> {
        let pub_sub_domain = match (destination.domain, destination.lifetime) {
            (Domain::Queue, Lifetime::Durable) | (Domain::Queue, Lifetime::Temporary) => false,
            (Domain::Topic, Lifetime::Durable) | (Domain::Topic, Lifetime::Temporary) => true,
        };
        let config = EndpointConfig {
            pub_sub_domain,
            ..Default::default()
        };
        Self::builder(transport)
            .config(config)
            .destination(destination)
            .build()
    }

    /// Resolve the destination.
    ///
    /// # Errors
    ///
    /// `Configuration` if the destination cannot be resolved; the failure is
    /// cached and every later call returns it again.
    pub fn start(&self) -> Result<ResolvedDestination, EndpointError> {
        let destination = self.destination()?;
        log_event!(
            info,
            "endpoint",
            "Endpoint started",
            destination = %destination,
            reply_to = ?self.inner.config.reply_to
        );
        Ok(destination)
    }

    /// The resolved destination.
    pub fn destination(&self) -> Result<ResolvedDestination, EndpointError> {
        match &self.inner.resolver {
            Some(resolver) => resolver.resolve().map_err(EndpointError::unresolvable),
            None => Err(EndpointError::configuration("destination not specified")),
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// The message binding, created on first use unless one was supplied.
    pub fn binding(&self) -> Arc<dyn MessageBinding> {
        self.inner
            .binding
            .get_or_init(|| {
                self.inner
                    .custom_binding
                    .clone()
                    .unwrap_or_else(|| Arc::new(DefaultBinding::new()))
            })
            .clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn create_producer(&self) -> Result<Producer, EndpointError> {
        self.ensure_running()?;
        Ok(Producer::new(self.clone(), self.destination()?))
    }

    /// Push consumer feeding `processor`; call [`Consumer::start`] to begin.
    pub fn create_consumer(&self, processor: Arc<dyn Processor>) -> Result<Consumer, EndpointError> {
        self.ensure_running()?;
        Ok(Consumer::new(self.clone(), self.destination()?, processor))
    }

    pub fn create_polling_consumer(&self) -> Result<PollingConsumer, EndpointError> {
        self.ensure_running()?;
        Ok(PollingConsumer::new(self.clone(), self.destination()?))
    }

    /// The endpoint's requestor, started on first call.
    ///
    /// Concurrent first callers wait for a single initialization.
    pub async fn requestor(&self) -> Result<Arc<Requestor>, EndpointError> {
        self.ensure_running()?;
        let requestor = self
            .inner
            .requestor
            .get_or_try_init(|| async {
                let label = self
                    .destination()
                    .map(|d| d.to_string())
                    .unwrap_or_else(|_| UNBOUND_LABEL.to_string());
                Requestor::start(
                    &self.inner.config,
                    self.inner.transport.clone(),
                    self.binding(),
                    &label,
                )
                .await
            })
            .await?
            .clone();

        // stop() cannot see a requestor that was still initializing
        if self.is_stopped() {
            requestor.stop().await;
            return Err(EndpointError::Shutdown);
        }
        Ok(requestor)
    }

    /// Empty exchange with the given pattern.
    pub fn create_exchange(&self, pattern: ExchangePattern) -> Exchange {
        Exchange::new(pattern, Message::default())
    }

    /// Exchange for a received message; in-out when it asks for a reply.
    pub fn create_exchange_from(&self, message: Message) -> Exchange {
        let pattern = if message.reply_to.is_some() && !self.inner.config.disable_reply_to {
            ExchangePattern::InOut
        } else {
            ExchangePattern::InOnly
        };
        Exchange::new(pattern, message)
    }

    /// Stop every consumer and the requestor.
    ///
    /// Outstanding requests fail with `Shutdown`.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let containers = std::mem::take(&mut *self.inner.containers.lock());
        let consumers = containers.len();
        for container in containers {
            container.stop().await;
        }
        if let Some(requestor) = self.inner.requestor.get() {
            requestor.stop().await;
        }

        log_event!(
            info,
            "endpoint",
            "Endpoint stopped",
            destination = ?self.destination().ok().map(|d| d.to_string()),
            consumers = consumers
        );
    }

    pub fn stats(&self) -> EndpointStats {
        let active_listeners = self
            .inner
            .containers
            .lock()
            .iter()
            .map(ListenerContainer::active_workers)
            .sum();

        let mut stats = EndpointStats {
            active_listeners,
            ..Default::default()
        };
        if let Some(requestor) = self.inner.requestor.get() {
            let pending = requestor.stats();
            stats.pending_requests = requestor.pending_count();
            stats.timeouts = pending.timeouts();
            stats.completed = pending.completed();
            stats.cancelled = pending.cancelled();
            stats.purged = pending.purged();
            stats.dropped_replies = pending.dropped_replies();
        }
        stats
    }

    /// Track a consumer's container so `stop()` reaches it.
    pub(crate) fn register_container(
        &self,
        container: ListenerContainer,
    ) -> Result<(), EndpointError> {
        let mut containers = self.inner.containers.lock();
        // Checked under the lock: stop() drains the list after setting the flag
        self.ensure_running()?;
        containers.retain(ListenerContainer::is_running);
        containers.push(container);
        debug!(consumers = containers.len(), "Listener container registered");
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), EndpointError> {
        if self.is_stopped() {
            Err(EndpointError::Shutdown)
        } else {
            Ok(())
        }
    }
}
