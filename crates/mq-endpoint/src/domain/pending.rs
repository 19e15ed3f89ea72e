//! Pending Request Store - the correlation registry.
//!
//! Maps correlation ids to callers waiting for a reply. Every way an entry can
//! end (reply, caller timeout, purge, cancellation, shutdown) goes through an
//! atomic `remove`/`remove_if` on the map, so exactly one of them takes the
//! entry and fulfils its oneshot slot.

use crate::domain::correlation::CorrelationId;
use crate::domain::error::EndpointError;
use crate::domain::exchange::Message;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mq_telemetry::{REQUESTOR_PENDING_REQUESTS, REQUESTOR_REPLIES_DROPPED, REQUESTOR_TIMEOUTS};
use prometheus::{Counter, Gauge};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome delivered to a waiting caller.
pub type ReplyResult = Result<Message, EndpointError>;

/// A pending request waiting for its reply
struct PendingRequest {
    /// Channel to deliver the outcome
    sender: oneshot::Sender<ReplyResult>,
    /// When the request was registered
    created_at: Instant,
    /// When the caller stops waiting
    deadline: Instant,
}

impl PendingRequest {
    fn timeout(&self) -> Duration {
        self.deadline.saturating_duration_since(self.created_at)
    }
}

/// Statistics for the pending request store
#[derive(Debug, Default)]
pub struct PendingStats {
    /// Total requests registered
    pub total_registered: AtomicU64,
    /// Total requests completed by a reply
    pub total_completed: AtomicU64,
    /// Total requests that timed out (caller or purge)
    pub total_timeouts: AtomicU64,
    /// Timeouts decided by the purge task
    pub total_purged: AtomicU64,
    /// Total requests cancelled
    pub total_cancelled: AtomicU64,
    /// Requests failed by shutdown
    pub total_shutdown: AtomicU64,
    /// Replies that matched no pending request
    pub total_dropped_replies: AtomicU64,
}

impl PendingStats {
    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        Self::get(&self.total_timeouts)
    }

    pub fn completed(&self) -> u64 {
        Self::get(&self.total_completed)
    }

    pub fn cancelled(&self) -> u64 {
        Self::get(&self.total_cancelled)
    }

    pub fn purged(&self) -> u64 {
        Self::get(&self.total_purged)
    }

    pub fn dropped_replies(&self) -> u64 {
        Self::get(&self.total_dropped_replies)
    }
}

/// Pending request store for request/reply correlation.
///
/// Flow:
/// 1. Requestor calls `register()` to get a oneshot receiver
/// 2. Requestor publishes the request carrying the correlation id
/// 3. Reply listener receives the reply and calls `complete()`
/// 4. Requestor awaits the receiver, calling `expire()` at its deadline
pub struct PendingRequestStore {
    /// Map of correlation ID to pending request
    pending: DashMap<CorrelationId, PendingRequest>,
    /// Statistics
    stats: Arc<PendingStats>,
    pending_gauge: Gauge,
    timeouts_counter: Counter,
    dropped_counter: Counter,
}

impl PendingRequestStore {
    /// Create a store; `label` tags its metrics (normally the endpoint destination).
    pub fn new(label: &str) -> Self {
        Self {
            pending: DashMap::new(),
            stats: Arc::new(PendingStats::default()),
            pending_gauge: REQUESTOR_PENDING_REQUESTS.with_label_values(&[label]),
            timeouts_counter: REQUESTOR_TIMEOUTS.with_label_values(&[label]),
            dropped_counter: REQUESTOR_REPLIES_DROPPED.with_label_values(&[label]),
        }
    }

    /// Register a pending request and get a receiver for its outcome.
    ///
    /// Fails with `DuplicateCorrelationId` if the id is already in flight.
    pub fn register(
        &self,
        correlation_id: CorrelationId,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<ReplyResult>, EndpointError> {
        match self.pending.entry(correlation_id) {
            Entry::Occupied(entry) => Err(EndpointError::DuplicateCorrelationId(
                entry.key().clone(),
            )),
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                let now = Instant::now();
                debug!(
                    correlation_id = %entry.key(),
                    timeout_ms = timeout.as_millis(),
                    "Registered pending request"
                );
                entry.insert(PendingRequest {
                    sender: tx,
                    created_at: now,
                    deadline: now + timeout,
                });
                self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
                self.pending_gauge.inc();
                Ok(rx)
            }
        }
    }

    fn take(&self, correlation_id: &CorrelationId) -> Option<PendingRequest> {
        let (_, request) = self.pending.remove(correlation_id)?;
        self.pending_gauge.dec();
        Some(request)
    }

    /// Complete a pending request with its reply.
    ///
    /// Returns false if no request was waiting (unknown, expired or already
    /// completed); the reply is then dropped.
    pub fn complete(&self, correlation_id: &CorrelationId, reply: Message) -> bool {
        let Some(pending) = self.take(correlation_id) else {
            self.record_dropped_reply(Some(correlation_id));
            return false;
        };

        let response_time = pending.created_at.elapsed();
        if pending.sender.send(Ok(reply)).is_err() {
            // Receiver was dropped (caller went away)
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %correlation_id, "Pending request receiver dropped");
            return true;
        }

        self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
        debug!(
            correlation_id = %correlation_id,
            response_time_ms = response_time.as_millis(),
            "Completed pending request"
        );
        true
    }

    /// Fail a pending request with an error other than a timeout.
    pub fn fail(&self, correlation_id: &CorrelationId, error: EndpointError) -> bool {
        match self.take(correlation_id) {
            Some(pending) => {
                let _ = pending.sender.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Count a reply nobody was waiting for.
    pub fn record_dropped_reply(&self, correlation_id: Option<&CorrelationId>) {
        self.stats
            .total_dropped_replies
            .fetch_add(1, Ordering::Relaxed);
        self.dropped_counter.inc();
        match correlation_id {
            Some(id) => warn!(
                correlation_id = %id,
                "Reply for unknown or expired correlation ID dropped"
            ),
            None => warn!("Reply without correlation ID dropped"),
        }
    }

    /// Time out a request at the caller's deadline.
    ///
    /// Returns true if this call removed the entry.
    pub fn expire(&self, correlation_id: &CorrelationId) -> bool {
        let Some(pending) = self.take(correlation_id) else {
            return false;
        };
        let timeout = pending.timeout();
        self.record_timeout();
        warn!(
            correlation_id = %correlation_id,
            timeout_ms = timeout.as_millis(),
            "Request timed out waiting for reply"
        );
        let _ = pending.sender.send(Err(EndpointError::Timeout {
            correlation_id: correlation_id.clone(),
            timeout,
        }));
        true
    }

    /// Cancel a pending request.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        let Some(pending) = self.take(correlation_id) else {
            return false;
        };
        self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
        let _ = pending
            .sender
            .send(Err(EndpointError::Cancelled(correlation_id.clone())));
        debug!(correlation_id = %correlation_id, "Cancelled pending request");
        true
    }

    /// Evict entries whose deadline passed more than `grace` ago.
    ///
    /// Returns the number of entries this call removed; entries removed
    /// concurrently by someone else are skipped.
    pub fn purge_expired(&self, grace: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline + grace <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for correlation_id in expired {
            let Some((_, pending)) = self
                .pending
                .remove_if(&correlation_id, |_, request| request.deadline + grace <= now)
            else {
                continue;
            };
            self.pending_gauge.dec();
            self.record_timeout();
            self.stats.total_purged.fetch_add(1, Ordering::Relaxed);
            warn!(
                correlation_id = %correlation_id,
                overdue_ms = now.saturating_duration_since(pending.deadline).as_millis(),
                "Purging expired pending request"
            );
            let timeout = pending.timeout();
            let _ = pending.sender.send(Err(EndpointError::Timeout {
                correlation_id,
                timeout,
            }));
            removed += 1;
        }
        removed
    }

    /// Fail every outstanding request with `error`.
    pub fn fail_all(&self, error: EndpointError) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for correlation_id in ids {
            if let Some(pending) = self.take(&correlation_id) {
                let _ = pending.sender.send(Err(error.clone()));
                failed += 1;
            }
        }
        if error.is_shutdown() {
            self.stats
                .total_shutdown
                .fetch_add(failed as u64, Ordering::Relaxed);
        }
        failed
    }

    fn record_timeout(&self) {
        self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
        self.timeouts_counter.inc();
    }

    /// Get number of currently pending requests
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check if a correlation ID is pending
    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    /// Get statistics
    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }
}

/// Background task evicting expired requests until `shutdown` flips to true.
pub async fn purge_task(
    store: Arc<PendingRequestStore>,
    interval: Duration,
    grace: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut purge_interval = tokio::time::interval(interval);
    purge_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = purge_interval.tick() => {
                let removed = store.purge_expired(grace);
                if removed > 0 {
                    debug!(removed = removed, "Purged expired pending requests");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Purge task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PendingRequestStore {
        PendingRequestStore::new("queue://pending-tests")
    }

    #[tokio::test]
    async fn test_register_and_complete() {
        let store = store();
        let id = CorrelationId::new();

        let rx = store.register(id.clone(), Duration::from_secs(30)).unwrap();
        assert!(store.is_pending(&id));
        assert_eq!(store.pending_count(), 1);

        assert!(store.complete(&id, Message::text("pong")));
        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.body.as_text(), Some("pong"));
        assert_eq!(store.pending_count(), 0);
        assert_eq!(store.stats().completed(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let store = store();
        let id = CorrelationId::from("dup");
        let _rx = store.register(id.clone(), Duration::from_secs(1)).unwrap();

        let err = store.register(id.clone(), Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, EndpointError::DuplicateCorrelationId(id));
        assert_eq!(store.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_complete_unknown_id() {
        let store = store();
        assert!(!store.complete(&CorrelationId::new(), Message::default()));
        assert_eq!(store.stats().dropped_replies(), 1);
    }

    #[tokio::test]
    async fn test_expire_then_late_reply() {
        let store = store();
        let id = CorrelationId::from("late");
        let rx = store.register(id.clone(), Duration::from_millis(10)).unwrap();

        assert!(store.expire(&id));
        assert!(!store.expire(&id));
        assert!(!store.complete(&id, Message::text("too late")));

        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(EndpointError::Timeout { .. })));
        assert_eq!(store.stats().timeouts(), 1);
        assert_eq!(store.stats().dropped_replies(), 1);
    }

    #[tokio::test]
    async fn test_cancel() {
        let store = store();
        let id = CorrelationId::new();
        let _rx = store.register(id.clone(), Duration::from_secs(30)).unwrap();

        assert!(store.cancel(&id));
        assert!(!store.is_pending(&id));
        // Cancel again should return false
        assert!(!store.cancel(&id));
        assert_eq!(store.stats().cancelled(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_respects_grace() {
        let store = store();
        let id = CorrelationId::new();
        let rx = store.register(id.clone(), Duration::from_millis(100)).unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(store.purge_expired(Duration::from_millis(100)), 0);

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(store.purge_expired(Duration::from_millis(100)), 1);
        assert!(matches!(rx.await.unwrap(), Err(EndpointError::Timeout { .. })));
        assert_eq!(store.stats().purged(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_of_removed_entry_is_noop() {
        let store = store();
        let id = CorrelationId::new();
        let rx = store.register(id.clone(), Duration::from_millis(10)).unwrap();
        assert!(store.complete(&id, Message::text("in time")));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.purge_expired(Duration::ZERO), 0);
        assert!(rx.await.unwrap().is_ok());
        assert_eq!(store.stats().timeouts(), 0);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let store = store();
        let rx1 = store.register(CorrelationId::new(), Duration::from_secs(30)).unwrap();
        let rx2 = store.register(CorrelationId::new(), Duration::from_secs(30)).unwrap();

        assert_eq!(store.fail_all(EndpointError::Shutdown), 2);
        assert_eq!(store.pending_count(), 0);
        assert_eq!(rx1.await.unwrap(), Err(EndpointError::Shutdown));
        assert_eq!(rx2.await.unwrap(), Err(EndpointError::Shutdown));
        assert_eq!(store.stats().total_shutdown.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_task_stops_on_shutdown() {
        let store = Arc::new(store());
        let (tx, rx) = watch::channel(false);
        let _pending = store.register(CorrelationId::new(), Duration::from_millis(10)).unwrap();

        let task = tokio::spawn(purge_task(
            store.clone(),
            Duration::from_millis(50),
            Duration::from_millis(10),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.pending_count(), 0);

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_single_winner_under_race() {
        let store = Arc::new(store());
        for _ in 0..200 {
            let id = CorrelationId::new();
            let rx = store.register(id.clone(), Duration::from_millis(1)).unwrap();

            let completer = {
                let store = store.clone();
                let id = id.clone();
                tokio::spawn(async move { store.complete(&id, Message::text("r")) })
            };
            let expirer = {
                let store = store.clone();
                let id = id.clone();
                tokio::spawn(async move { store.expire(&id) })
            };
            let canceller = {
                let store = store.clone();
                let id = id.clone();
                tokio::spawn(async move { store.cancel(&id) })
            };

            let wins = [
                completer.await.unwrap(),
                expirer.await.unwrap(),
                canceller.await.unwrap(),
            ]
            .iter()
            .filter(|won| **won)
            .count();
            assert_eq!(wins, 1);
            assert!(rx.await.is_ok());
        }
        assert_eq!(store.pending_count(), 0);
    }
}
