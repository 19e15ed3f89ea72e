//! Listener container - elastic pool of receive workers.
//!
//! ```text
//!             ┌── worker ──┐
//!  receiver ──┼── worker ──┼──► MessageListener::on_message ──► ack / nack
//!             └── worker ──┘
//!      min ≤ active ≤ max
//! ```
//!
//! - A worker that takes a message while no other worker is idle spawns a
//!   new worker (up to `max`).
//! - A worker above `min` retires after `idle_task_execution_limit`
//!   consecutive empty polls. The last worker always stays.
//! - A worker that handled `max_messages_per_task` messages is replaced by a
//!   fresh one.

use crate::domain::config::{AcknowledgementMode, ConcurrencyBounds, EndpointConfig};
use crate::domain::destination::ResolvedDestination;
use crate::domain::error::{EndpointError, ProcessingError, TransportError};
use crate::ports::outbound::{Delivery, MessageReceiver, Transport, TransportMessage};
use async_trait::async_trait;
use futures::FutureExt;
use mq_telemetry::{
    log_event, LISTENER_ACTIVE_WORKERS, LISTENER_MESSAGES_FAILED, LISTENER_MESSAGES_PROCESSED,
};
use parking_lot::Mutex;
use prometheus::{Counter, Gauge};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Pause after a failed receive before polling again.
const RECOVERY_INTERVAL: Duration = Duration::from_millis(500);

/// Callback invoked by listener workers for each received message.
///
/// An `Err` is a processing failure: the message is negatively acknowledged.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: TransportMessage) -> Result<(), EndpointError>;
}

/// Listener container settings.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub destination: ResolvedDestination,
    pub selector: Option<String>,
    pub concurrency: ConcurrencyBounds,
    pub acknowledgement_mode: AcknowledgementMode,
    pub receive_timeout: Duration,
    /// 0 = unlimited
    pub max_messages_per_task: u32,
    pub idle_task_execution_limit: u32,
}

impl ListenerSettings {
    /// Settings for `destination` taken from an endpoint configuration.
    ///
    /// Topics get exactly one worker: every worker would otherwise receive
    /// its own copy of each message.
    pub fn from_config(destination: ResolvedDestination, config: &EndpointConfig) -> Self {
        let concurrency = if destination.is_topic() {
            ConcurrencyBounds::single()
        } else {
            config.concurrency
        };
        Self {
            destination,
            selector: config.selector.clone(),
            concurrency,
            acknowledgement_mode: config.acknowledgement_mode,
            receive_timeout: config.receive_timeout,
            max_messages_per_task: config.max_messages_per_task,
            idle_task_execution_limit: config.idle_task_execution_limit.max(1),
        }
    }
}

/// Why a worker left its loop.
enum WorkerExit {
    Shutdown,
    Retired,
    Recycled,
    DestinationGone,
}

struct ContainerShared {
    settings: ListenerSettings,
    receiver: Box<dyn MessageReceiver>,
    listener: Arc<dyn MessageListener>,
    active: AtomicUsize,
    idle: AtomicUsize,
    peak: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    active_gauge: Gauge,
    processed_counter: Counter,
    failed_counter: Counter,
}

impl ContainerShared {
    fn label(&self) -> String {
        self.settings.destination.to_string()
    }

    fn update_gauge(&self) {
        self.active_gauge
            .set(self.active.load(Ordering::SeqCst) as f64);
    }

    /// Give up a worker slot if the pool is above `min`.
    ///
    /// The last worker never retires: only a running worker spawns others.
    fn try_retire(&self) -> bool {
        let floor = self.settings.concurrency.min.max(1);
        let mut current = self.active.load(Ordering::SeqCst);
        loop {
            if current <= floor {
                return false;
            }
            match self.active.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release_slot(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn dispatch(&self, delivery: Box<dyn Delivery>) {
        let message = delivery.message().clone();
        let message_id = message.message_id.clone().unwrap_or_default();
        let pending = match self.settings.acknowledgement_mode {
            AcknowledgementMode::Auto => Some(delivery),
            AcknowledgementMode::DupsOk => {
                delivery.ack();
                None
            }
        };

        let outcome = AssertUnwindSafe(self.listener.on_message(message))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(ProcessingError::new("listener panicked while processing message").into())
            });

        match outcome {
            Ok(()) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                self.processed_counter.inc();
                if let Some(delivery) = pending {
                    delivery.ack();
                }
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.failed_counter.inc();
                warn!(
                    destination = %self.settings.destination,
                    message_id = %message_id,
                    error = %e,
                    "Message processing failed"
                );
                if let Some(delivery) = pending {
                    delivery.nack();
                }
            }
        }
    }
}

/// Reserve a worker slot and spawn a worker; false at `max` or after stop.
fn try_spawn_worker(shared: &Arc<ContainerShared>) -> bool {
    let max = shared.settings.concurrency.max;
    let mut current = shared.active.load(Ordering::SeqCst);
    loop {
        if current >= max || shared.stopped.load(Ordering::SeqCst) {
            return false;
        }
        match shared.active.compare_exchange_weak(
            current,
            current + 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
    shared.peak.fetch_max(current + 1, Ordering::SeqCst);
    shared.update_gauge();

    // Subscribed before spawning so a stop issued before the worker first
    // runs is still observed
    let shutdown = shared.shutdown.subscribe();
    let handle = tokio::spawn(worker(shared.clone(), shutdown));
    let mut handles = shared.handles.lock();
    handles.retain(|h| !h.is_finished());
    handles.push(handle);
    debug!(
        destination = %shared.settings.destination,
        active = current + 1,
        "Listener worker spawned"
    );
    true
}

// Boxed so the worker future does not contain its own type.
fn worker(
    shared: Arc<ContainerShared>,
    shutdown: watch::Receiver<bool>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(run_worker(shared, shutdown))
}

async fn run_worker(shared: Arc<ContainerShared>, mut shutdown: watch::Receiver<bool>) {
    let idle_limit = shared.settings.idle_task_execution_limit;
    let max_messages = shared.settings.max_messages_per_task;
    let mut idle_polls = 0u32;
    let mut handled = 0u32;

    let exit = loop {
        if *shutdown.borrow() {
            break WorkerExit::Shutdown;
        }

        shared.idle.fetch_add(1, Ordering::SeqCst);
        let received = tokio::select! {
            received = shared.receiver.receive(shared.settings.receive_timeout) => Some(received),
            _ = shutdown.changed() => None,
        };
        shared.idle.fetch_sub(1, Ordering::SeqCst);

        let Some(received) = received else {
            break WorkerExit::Shutdown;
        };

        match received {
            Ok(Some(delivery)) => {
                idle_polls = 0;
                // Nobody left waiting for the next message: grow the pool
                if shared.idle.load(Ordering::SeqCst) == 0 {
                    try_spawn_worker(&shared);
                }
                shared.dispatch(delivery).await;
                handled += 1;
                if max_messages > 0 && handled >= max_messages {
                    break WorkerExit::Recycled;
                }
            }
            Ok(None) => {
                idle_polls += 1;
                if idle_polls >= idle_limit && shared.try_retire() {
                    break WorkerExit::Retired;
                }
            }
            Err(TransportError::DestinationDeleted(_)) => break WorkerExit::DestinationGone,
            Err(e) => {
                warn!(
                    destination = %shared.settings.destination,
                    error = %e,
                    "Listener receive failed"
                );
                tokio::select! {
                    _ = tokio::time::sleep(RECOVERY_INTERVAL) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    };

    match exit {
        WorkerExit::Retired => {
            debug!(destination = %shared.settings.destination, "Idle listener worker retired");
        }
        WorkerExit::Recycled => {
            shared.release_slot();
            debug!(destination = %shared.settings.destination, handled, "Listener worker recycled");
            try_spawn_worker(&shared);
        }
        WorkerExit::DestinationGone => {
            shared.release_slot();
            warn!(destination = %shared.settings.destination, "Destination deleted, listener worker stopped");
        }
        WorkerExit::Shutdown => shared.release_slot(),
    }
    shared.update_gauge();
}

/// Elastic pool of workers consuming one destination.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct ListenerContainer {
    shared: Arc<ContainerShared>,
}

impl ListenerContainer {
    /// Create the receiver and start `min` workers (at least one).
    pub async fn start(
        transport: &dyn Transport,
        settings: ListenerSettings,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Self, EndpointError> {
        let receiver = transport
            .create_receiver(&settings.destination, settings.selector.as_deref())
            .await?;
        let label = settings.destination.to_string();
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(ContainerShared {
            active_gauge: LISTENER_ACTIVE_WORKERS.with_label_values(&[&label]),
            processed_counter: LISTENER_MESSAGES_PROCESSED.with_label_values(&[&label]),
            failed_counter: LISTENER_MESSAGES_FAILED.with_label_values(&[&label]),
            settings,
            receiver,
            listener,
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            shutdown,
            handles: Mutex::new(Vec::new()),
        });

        let initial = shared.settings.concurrency.min.max(1);
        for _ in 0..initial {
            try_spawn_worker(&shared);
        }

        log_event!(
            info,
            "listener",
            "Listener container started",
            destination = %label,
            min = shared.settings.concurrency.min,
            max = shared.settings.concurrency.max
        );
        Ok(Self { shared })
    }

    /// Stop every worker and wait for in-flight messages to finish.
    pub async fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // send() is a no-op while no worker holds a receiver
        self.shared.shutdown.send_replace(true);

        // Workers may still be spawning replacements while we drain
        loop {
            let handles = std::mem::take(&mut *self.shared.handles.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
        self.shared.update_gauge();

        log_event!(
            info,
            "listener",
            "Listener container stopped",
            destination = %self.shared.label(),
            processed = self.processed(),
            failed = self.failed()
        );
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Workers currently running.
    pub fn active_workers(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Highest number of workers seen at once.
    pub fn peak_workers(&self) -> usize {
        self.shared.peak.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.shared.failed.load(Ordering::Relaxed)
    }

    pub fn settings(&self) -> &ListenerSettings {
        &self.shared.settings
    }
}
