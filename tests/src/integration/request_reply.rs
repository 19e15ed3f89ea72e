//! # Request/Reply Integration
//!
//! Producer → queue → Consumer → reply channel → Requestor, end to end over
//! the in-memory broker.
//!
//! ## Covered
//!
//! 1. **Shared reply queue**: a late-enough reply completes, a missing one
//!    times out and the registry drains
//! 2. **Exactly-once outcome**: replies racing caller timeouts and the purge task
//! 3. **Per-request temporaries**: every created reply queue is deleted
//! 4. **Shutdown**: outstanding requests fail with `Shutdown`
//! 5. **Externally shared reply queue**: replies routed by requestor token

#[cfg(test)]
mod tests {
    use super::super::{broker, endpoint};
    use async_trait::async_trait;
    use mq_endpoint::{
        Body, CorrelationId, EndpointConfig, EndpointError, Exchange, Message, ProcessingError,
        Processor, ReplyToPolicy,
    };
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::{timeout, Instant};

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    /// Echoes the request body after a delay; requests whose correlation id
    /// starts with `B` get no reply.
    struct DelayedEcho {
        delay: Duration,
    }

    #[async_trait]
    impl Processor for DelayedEcho {
        async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
            let silent = exchange
                .message()
                .correlation_id
                .as_ref()
                .is_some_and(|id| id.as_str().starts_with('B'));
            if silent {
                return Ok(());
            }
            tokio::time::sleep(self.delay).await;
            let body = exchange.message().body.clone();
            exchange.set_out(Message::new(body));
            Ok(())
        }
    }

    /// Echo whose delay cycles through 0..max_delay_ms by request number.
    struct StaggeredEcho {
        counter: AtomicU64,
        max_delay_ms: u64,
    }

    #[async_trait]
    impl Processor for StaggeredEcho {
        async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(n * 7 % self.max_delay_ms)).await;
            let body = exchange.message().body.clone();
            exchange.set_out(Message::new(body));
            Ok(())
        }
    }

    fn shared_reply_config(request_timeout: Duration) -> EndpointConfig {
        EndpointConfig {
            request_timeout,
            reply_to: ReplyToPolicy::Shared {
                destination: "replies".into(),
                externally_shared: false,
            },
            receive_timeout: Duration::from_millis(20),
            request_map_purge_interval: Duration::from_millis(25),
            purge_grace: Duration::from_millis(25),
            ..Default::default()
        }
    }

    // =============================================================================
    // SHARED REPLY QUEUE
    // =============================================================================

    /// Reply to A1 after 50ms arrives inside a 100ms timeout; B1 never gets
    /// one and times out no earlier than 100ms.
    #[tokio::test]
    async fn test_shared_reply_completes_and_times_out() {
        let (_broker, transport) = broker();
        let config = shared_reply_config(Duration::from_millis(100));

        let responder = endpoint(&transport, "orders", config.clone());
        let consumer = responder
            .create_consumer(Arc::new(DelayedEcho {
                delay: Duration::from_millis(50),
            }))
            .unwrap();
        consumer.start().await.unwrap();

        let requester = endpoint(&transport, "orders", config);
        let producer = requester.create_producer().unwrap();

        let reply = producer
            .request(Message::text("payload-a").with_correlation_id("A1"))
            .await
            .unwrap();
        assert_eq!(reply.body, Body::Text("payload-a".into()));
        assert_eq!(reply.correlation_id, Some(CorrelationId::from("A1")));

        let started = Instant::now();
        let err = producer
            .request(Message::text("payload-b").with_correlation_id("B1"))
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

        let stats = requester.stats();
        assert_eq!(stats.pending_requests, 0);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.timeouts, 1);

        requester.stop().await;
        responder.stop().await;
    }

    // =============================================================================
    // EXACTLY-ONCE OUTCOME
    // =============================================================================

    /// Replies land on both sides of the deadline; each request must end
    /// exactly once and the counters must add up.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_resolve_exactly_once() {
        const REQUESTS: u64 = 200;
        let (_broker, transport) = broker();
        let mut config = shared_reply_config(Duration::from_millis(40));
        config.concurrency = mq_endpoint::ConcurrencyBounds::new(4, 16);

        let responder = endpoint(&transport, "stress", config.clone());
        let consumer = responder
            .create_consumer(Arc::new(StaggeredEcho {
                counter: AtomicU64::new(0),
                max_delay_ms: 80,
            }))
            .unwrap();
        consumer.start().await.unwrap();

        let requester = endpoint(&transport, "stress", config);
        let producer = Arc::new(requester.create_producer().unwrap());

        let handles: Vec<_> = (0..REQUESTS)
            .map(|i| {
                let producer = producer.clone();
                tokio::spawn(async move { producer.request(Message::text(format!("r{i}"))).await })
            })
            .collect();

        let (mut ok, mut timed_out) = (0u64, 0u64);
        for handle in handles {
            match timeout(Duration::from_secs(10), handle).await.unwrap().unwrap() {
                Ok(_) => ok += 1,
                Err(e) => {
                    assert!(e.is_timeout(), "unexpected error: {e}");
                    timed_out += 1;
                }
            }
        }

        assert_eq!(ok + timed_out, REQUESTS);
        let stats = requester.stats();
        assert_eq!(stats.pending_requests, 0);
        assert_eq!(stats.completed, ok);
        assert_eq!(stats.timeouts, timed_out);
        assert!(stats.purged <= stats.timeouts);

        requester.stop().await;
        responder.stop().await;
    }

    /// A correlation id already in flight is rejected before publishing.
    #[tokio::test]
    async fn test_duplicate_correlation_id_rejected() {
        let (broker, transport) = broker();
        let requester = endpoint(&transport, "dup", shared_reply_config(Duration::from_millis(200)));
        let producer = Arc::new(requester.create_producer().unwrap());

        let first = {
            let producer = producer.clone();
            tokio::spawn(async move {
                producer
                    .request(Message::text("first").with_correlation_id("same"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let err = producer
            .request(Message::text("second").with_correlation_id("same"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EndpointError::DuplicateCorrelationId(CorrelationId::from("same"))
        );
        assert_eq!(broker.queue_depth("dup"), 1);

        assert!(first.await.unwrap().unwrap_err().is_timeout());
        requester.stop().await;
    }

    // =============================================================================
    // PER-REQUEST TEMPORARY REPLY QUEUES
    // =============================================================================

    /// Completed, timed out and cancelled requests all release their
    /// temporary reply queue.
    #[tokio::test]
    async fn test_per_request_temporaries_created_equals_deleted() {
        let (broker, transport) = broker();
        let config = EndpointConfig {
            request_timeout: Duration::from_millis(100),
            reply_to: ReplyToPolicy::PerRequestTemporary,
            receive_timeout: Duration::from_millis(20),
            ..Default::default()
        };

        let responder = endpoint(&transport, "temp-replies", config.clone());
        let consumer = responder
            .create_consumer(Arc::new(DelayedEcho {
                delay: Duration::from_millis(10),
            }))
            .unwrap();
        consumer.start().await.unwrap();

        let requester = endpoint(&transport, "temp-replies", config);
        let producer = requester.create_producer().unwrap();

        // Completed
        for i in 0..3 {
            producer
                .request(Message::text(format!("ok-{i}")).with_correlation_id(format!("A{i}")))
                .await
                .unwrap();
        }
        // Timed out
        let err = producer
            .request(Message::text("silent").with_correlation_id("B-timeout"))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        // Cancelled by dropping the request future
        let cancelled = timeout(
            Duration::from_millis(20),
            producer.request(Message::text("dropped").with_correlation_id("B-cancel")),
        )
        .await;
        assert!(cancelled.is_err());

        // Deletion after cancellation runs on a spawned task
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = broker.stats();
        let created = stats.temporary_created.load(Ordering::Relaxed);
        let deleted = stats.temporary_deleted.load(Ordering::Relaxed);
        assert_eq!(created, 5);
        assert_eq!(deleted, created);
        assert_eq!(requester.stats().pending_requests, 0);
        assert_eq!(requester.stats().cancelled, 1);

        requester.stop().await;
        responder.stop().await;
    }

    // =============================================================================
    // SHUTDOWN
    // =============================================================================

    #[tokio::test]
    async fn test_stop_fails_outstanding_requests() {
        let (_broker, transport) = broker();
        let requester = endpoint(
            &transport,
            "nobody-listens",
            EndpointConfig {
                request_timeout: Duration::from_secs(30),
                ..Default::default()
            },
        );
        let producer = Arc::new(requester.create_producer().unwrap());

        let waiting: Vec<_> = (0..5)
            .map(|i| {
                let producer = producer.clone();
                tokio::spawn(async move { producer.request(Message::text(format!("w{i}"))).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(requester.stats().pending_requests, 5);

        requester.stop().await;
        for handle in waiting {
            let err = timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap()
                .unwrap_err();
            assert_eq!(err, EndpointError::Shutdown);
        }
        assert_eq!(requester.stats().pending_requests, 0);
    }

    // =============================================================================
    // EXTERNALLY SHARED REPLY QUEUE
    // =============================================================================

    /// Two requestors share one reply queue; the token selector keeps each
    /// requestor's replies apart.
    #[tokio::test]
    async fn test_externally_shared_reply_queue_routes_by_token() {
        let (_broker, transport) = broker();
        let config = EndpointConfig {
            request_timeout: Duration::from_secs(2),
            reply_to: ReplyToPolicy::Shared {
                destination: "common-replies".into(),
                externally_shared: true,
            },
            receive_timeout: Duration::from_millis(20),
            ..Default::default()
        };

        let responder = endpoint(&transport, "shared", config.clone());
        let consumer = responder
            .create_consumer(Arc::new(DelayedEcho {
                delay: Duration::from_millis(5),
            }))
            .unwrap();
        consumer.start().await.unwrap();

        let left = endpoint(&transport, "shared", config.clone());
        let right = endpoint(&transport, "shared", config);
        let left_producer = left.create_producer().unwrap();
        let right_producer = right.create_producer().unwrap();

        let (l, r) = tokio::join!(
            left_producer.request(Message::text("left")),
            right_producer.request(Message::text("right")),
        );
        assert_eq!(l.unwrap().body, Body::Text("left".into()));
        assert_eq!(r.unwrap().body, Body::Text("right".into()));

        assert_ne!(
            left.requestor().await.unwrap().token(),
            right.requestor().await.unwrap().token()
        );
        assert_eq!(left.stats().dropped_replies, 0);
        assert_eq!(right.stats().dropped_replies, 0);

        left.stop().await;
        right.stop().await;
        responder.stop().await;
    }
}
