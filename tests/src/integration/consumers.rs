//! # Consumer Integration
//!
//! Listener pool scaling, polling, topic fan-out, dead-lettering and the
//! message binding as seen through a real transport.

#[cfg(test)]
mod tests {
    use super::super::{broker, endpoint};
    use async_trait::async_trait;
    use bytes::Bytes;
    use mq_endpoint::{
        processor_fn, Body, ConcurrencyBounds, Endpoint, EndpointConfig, Exchange, HeaderValue,
        Message, ProcessingError, Processor,
    };
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    /// Records every message it sees, taking `delay` per message.
    struct Recorder {
        delay: Duration,
        seen: Mutex<Vec<Message>>,
    }

    impl Recorder {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.seen.lock().len()
        }
    }

    #[async_trait]
    impl Processor for Recorder {
        async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
            tokio::time::sleep(self.delay).await;
            self.seen.lock().push(exchange.message().clone());
            Ok(())
        }
    }

    fn pool_config(min: usize, max: usize) -> EndpointConfig {
        EndpointConfig {
            concurrency: ConcurrencyBounds::new(min, max),
            receive_timeout: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    // =============================================================================
    // ELASTIC LISTENER POOL
    // =============================================================================

    /// min=1/max=3 with 10 messages injected faster than one worker drains:
    /// the pool grows past one worker and never beyond three.
    #[tokio::test]
    async fn test_pool_scales_between_bounds() {
        let (_broker, transport) = broker();
        let endpoint = endpoint(&transport, "backlog", pool_config(1, 3));
        let recorder = Recorder::new(Duration::from_millis(50));
        let consumer = endpoint.create_consumer(recorder.clone()).unwrap();
        consumer.start().await.unwrap();
        assert_eq!(consumer.active_workers(), 1);

        let producer = endpoint.create_producer().unwrap();
        for i in 0..10 {
            producer
                .send_message(Message::text(format!("job-{i}")))
                .await
                .unwrap();
        }

        let mut observed_max = 0;
        timeout(Duration::from_secs(5), async {
            while recorder.count() < 10 {
                let active = consumer.active_workers();
                assert!(active <= 3, "pool exceeded max: {active}");
                observed_max = observed_max.max(active);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(observed_max > 1, "pool never grew");
        assert!(consumer.peak_workers() <= 3);
        assert_eq!(consumer.processed(), 10);

        // Surplus workers retire once idle
        wait_for(|| consumer.active_workers() == 1).await;
        endpoint.stop().await;
    }

    /// A failing processor does not stop the worker; the message ends up in
    /// the dead letter queue after the redelivery limit.
    #[tokio::test]
    async fn test_poison_message_dead_lettered() {
        let (broker, transport) = broker();
        let endpoint = endpoint(&transport, "poison", pool_config(1, 1));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counted = attempts.clone();
        let consumer = endpoint
            .create_consumer(processor_fn(move |exchange: &mut Exchange| {
                counted.fetch_add(1, Ordering::SeqCst);
                if exchange.message().body.as_text() == Some("poison") {
                    Err(ProcessingError::new("cannot handle poison"))
                } else {
                    Ok(())
                }
            }))
            .unwrap();
        consumer.start().await.unwrap();

        let producer = endpoint.create_producer().unwrap();
        producer.send_message(Message::text("poison")).await.unwrap();
        producer.send_message(Message::text("fine")).await.unwrap();

        wait_for(|| broker.dead_letter_depth() == 1 && consumer.processed() == 1).await;
        // First delivery plus the default six redeliveries
        assert_eq!(consumer.failed(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 8);
        assert!(consumer.is_running());
        endpoint.stop().await;
    }

    /// Stopping the endpoint right after its consumers start must return even
    /// though the workers have not run yet, and again once they are busy.
    #[tokio::test]
    async fn test_endpoint_stop_completes_with_running_pool() {
        let (_broker, transport) = broker();
        let endpoint = endpoint(&transport, "shutdown", pool_config(2, 4));
        let recorder = Recorder::new(Duration::from_millis(20));
        let first = endpoint.create_consumer(recorder.clone()).unwrap();
        first.start().await.unwrap();
        let second = endpoint.create_consumer(recorder.clone()).unwrap();
        second.start().await.unwrap();

        let producer = endpoint.create_producer().unwrap();
        for i in 0..4 {
            producer
                .send_message(Message::text(format!("drain-{i}")))
                .await
                .unwrap();
        }

        timeout(Duration::from_secs(2), endpoint.stop())
            .await
            .expect("endpoint stop did not complete");
        assert!(!first.is_running());
        assert!(!second.is_running());
        assert_eq!(endpoint.stats().active_listeners, 0);
    }

    // =============================================================================
    // TOPICS
    // =============================================================================

    /// Every consumer on a topic gets its own copy of each message.
    #[tokio::test]
    async fn test_topic_fan_out() {
        let (_broker, transport) = broker();
        let config = EndpointConfig {
            pub_sub_domain: true,
            ..pool_config(2, 4)
        };
        let endpoint = endpoint(&transport, "prices", config);

        let first = Recorder::new(Duration::ZERO);
        let second = Recorder::new(Duration::ZERO);
        let first_consumer = endpoint.create_consumer(first.clone()).unwrap();
        let second_consumer = endpoint.create_consumer(second.clone()).unwrap();
        first_consumer.start().await.unwrap();
        second_consumer.start().await.unwrap();
        assert_eq!(endpoint.stats().active_listeners, 2);

        let producer = endpoint.create_producer().unwrap();
        for price in [100i64, 101, 102] {
            producer
                .send_message(Message::text("tick").with_header("price", price))
                .await
                .unwrap();
        }

        wait_for(|| first.count() == 3 && second.count() == 3).await;
        let prices: Vec<_> = first
            .seen
            .lock()
            .iter()
            .filter_map(|m| m.header("price").and_then(HeaderValue::as_i64))
            .collect();
        assert_eq!(prices, vec![100, 101, 102]);
        endpoint.stop().await;
    }

    // =============================================================================
    // POLLING
    // =============================================================================

    #[tokio::test]
    async fn test_polling_consumer_drains_in_order() {
        let (_broker, transport) = broker();
        let endpoint = endpoint(&transport, "inbox", pool_config(1, 1));
        let producer = endpoint.create_producer().unwrap();
        let poller = endpoint.create_polling_consumer().unwrap();

        assert!(poller
            .receive(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());

        for i in 0..3 {
            producer
                .send_message(Message::text(format!("m{i}")))
                .await
                .unwrap();
        }
        for i in 0..3 {
            let exchange = poller.receive_no_wait().await.unwrap().unwrap();
            assert_eq!(exchange.message().body, Body::Text(format!("m{i}")));
        }
        assert!(poller.receive_no_wait().await.unwrap().is_none());
        endpoint.stop().await;
    }

    // =============================================================================
    // BINDING THROUGH THE TRANSPORT
    // =============================================================================

    /// Bodies and headers survive the trip through the broker unchanged.
    #[tokio::test]
    async fn test_binding_round_trip_through_broker() {
        let (_broker, transport) = broker();
        let endpoint = endpoint(&transport, "binding", pool_config(1, 1));
        let producer = endpoint.create_producer().unwrap();
        let poller = endpoint.create_polling_consumer().unwrap();

        let sent = vec![
            Message::json(json!({"order": 42, "items": ["a", "b"]}))
                .with_correlation_id("json-1")
                .with_message_type("order.created"),
            Message::new(Body::Bytes(Bytes::from_static(&[0, 1, 2, 255])))
                .with_header("retries", 3i64)
                .with_header("urgent", true)
                .with_header("ratio", 0.5),
            Message::text("plain").with_header("region", "eu"),
            Message::new(Body::Empty),
        ];
        for message in &sent {
            producer.send_message(message.clone()).await.unwrap();
        }

        for expected in sent {
            let received = poller.receive_no_wait().await.unwrap().unwrap();
            let mut message = received.message().clone();
            assert!(message.message_id.take().is_some());
            assert_eq!(message, expected);
        }
        endpoint.stop().await;
    }
}
