//! Buffered message queue with async waiting.

use crate::broker::BrokerError;
use crate::message::BrokerMessage;
use crate::selector::Selector;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub(crate) struct MessageQueue {
    name: String,
    messages: Mutex<VecDeque<BrokerMessage>>,
    notify: Notify,
    closed: AtomicBool,
}

impl MessageQueue {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn push_back(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::DestinationDeleted(self.name.clone()));
        }
        self.messages.lock().push_back(message);
        // Every waiter re-checks: with selectors, a single wake-up could land
        // on a receiver that does not match.
        self.notify.notify_waiters();
        Ok(())
    }

    pub(crate) fn push_front(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::DestinationDeleted(self.name.clone()));
        }
        self.messages.lock().push_front(message);
        self.notify.notify_waiters();
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop all buffered messages and wake every waiter.
    pub(crate) fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let dropped = {
            let mut messages = self.messages.lock();
            let n = messages.len();
            messages.clear();
            n
        };
        self.notify.notify_waiters();
        dropped
    }

    fn take_matching(&self, selector: Option<&Selector>) -> Option<BrokerMessage> {
        let mut messages = self.messages.lock();
        let index = match selector {
            None => (!messages.is_empty()).then_some(0),
            Some(selector) => messages.iter().position(|m| selector.matches(m)),
        }?;
        messages.remove(index)
    }

    /// Wait up to `timeout` for a message accepted by `selector`.
    pub(crate) async fn take(
        &self,
        selector: Option<&Selector>,
        timeout: Duration,
    ) -> Result<Option<BrokerMessage>, BrokerError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await is not missed.
            notified.as_mut().enable();

            if self.is_closed() {
                return Err(BrokerError::DestinationDeleted(self.name.clone()));
            }
            if let Some(message) = self.take_matching(selector) {
                return Ok(Some(message));
            }
            if timeout.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}
