//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-process pub/sub backend recording acknowledgements."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! In-memory backend.
//!
//! Published messages fan out to every live subscription on the same topic; a
//! subscription on the empty topic receives everything. Each delivery's settlement is
//! recorded so callers can assert ack/nack behaviour.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::backend::{AckOutcome, Delivery, Publisher, Subscriber};
use crate::envelope::TransportMessage;
use crate::{EdgewireError, Result};

const DEFAULT_BUFFER: usize = 64;

struct Subscription {
    topic: String,
    sender: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
}

impl Subscription {
    fn matches(&self, topic: &str) -> bool {
        self.topic.is_empty() || self.topic == topic
    }

    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.sender.is_closed()
    }
}

#[derive(Default)]
struct BrokerState {
    subscriptions: Mutex<Vec<Subscription>>,
    published: Mutex<Vec<(String, TransportMessage)>>,
    outcomes: Mutex<Vec<(String, AckOutcome)>>,
    failing_topics: Mutex<HashSet<String>>,
    publish_failure: Mutex<Option<String>>,
    settled: Notify,
    closed: AtomicBool,
}

/// Topic fan-out broker implementing both [`Publisher`] and [`Subscriber`].
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
    buffer: usize,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    /// Broker whose per-subscription channels hold `buffer` undelivered messages.
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            state: Arc::new(BrokerState::default()),
            buffer: buffer.max(1),
        }
    }

    /// Make every subsequent publish fail with a transport error.
    pub fn fail_publish(&self, reason: impl Into<String>) {
        *self.state.publish_failure.lock() = Some(reason.into());
    }

    /// Make subscribing to `topic` fail with a transport error.
    pub fn fail_subscribe(&self, topic: impl Into<String>) {
        self.state.failing_topics.lock().insert(topic.into());
    }

    /// Every message published so far, with its topic.
    pub fn published(&self) -> Vec<(String, TransportMessage)> {
        self.state.published.lock().clone()
    }

    /// Messages published to one topic.
    pub fn published_to(&self, topic: &str) -> Vec<TransportMessage> {
        self.state
            .published
            .lock()
            .iter()
            .filter(|(published_topic, _)| published_topic == topic)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Settlements recorded for a message id, in order.
    pub fn outcomes_for(&self, uuid: &str) -> Vec<AckOutcome> {
        self.state
            .outcomes
            .lock()
            .iter()
            .filter(|(id, _)| id == uuid)
            .map(|(_, outcome)| *outcome)
            .collect()
    }

    /// Number of settled deliveries with the given outcome.
    pub fn count(&self, outcome: AckOutcome) -> usize {
        self.state
            .outcomes
            .lock()
            .iter()
            .filter(|(_, recorded)| *recorded == outcome)
            .count()
    }

    /// Wait until at least `count` deliveries have been settled.
    pub async fn wait_for_settled(&self, count: usize) {
        loop {
            let notified = self.state.settled.notified();
            if self.state.outcomes.lock().len() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        let mut subscriptions = self.state.subscriptions.lock();
        subscriptions.retain(Subscription::is_live);
        subscriptions.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(EdgewireError::Closed)
        } else {
            Ok(())
        }
    }

    fn track(&self, uuid: String, settled: tokio::sync::oneshot::Receiver<AckOutcome>) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            if let Ok(outcome) = settled.await {
                trace!(message_id = %uuid, ?outcome, "delivery settled");
                state.outcomes.lock().push((uuid, outcome));
                state.settled.notify_waiters();
            }
        });
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, topic: &str, messages: Vec<TransportMessage>) -> Result<()> {
        self.ensure_open()?;
        let failure = self.state.publish_failure.lock().clone();
        if let Some(reason) = failure {
            return Err(EdgewireError::Transport(reason));
        }

        let targets: Vec<mpsc::Sender<Delivery>> = {
            let mut subscriptions = self.state.subscriptions.lock();
            subscriptions.retain(Subscription::is_live);
            subscriptions
                .iter()
                .filter(|subscription| subscription.matches(topic))
                .map(|subscription| subscription.sender.clone())
                .collect()
        };

        for message in messages {
            self.state
                .published
                .lock()
                .push((topic.to_owned(), message.clone()));
            for target in &targets {
                let (delivery, settled) = Delivery::new(message.clone());
                match target.send(delivery).await {
                    Ok(()) => self.track(message.uuid.clone(), settled),
                    Err(returned) => {
                        // subscription went away between snapshot and send
                        drop(returned.0.into_message());
                    }
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            debug!("closing in-memory broker");
            self.state.subscriptions.lock().clear();
        }
        Ok(())
    }
}

#[async_trait]
impl Subscriber for MemoryBroker {
    async fn subscribe(
        &self,
        cancel: CancellationToken,
        topic: &str,
    ) -> Result<mpsc::Receiver<Delivery>> {
        self.ensure_open()?;
        if self.state.failing_topics.lock().contains(topic) {
            return Err(EdgewireError::Transport(format!(
                "subscription to '{topic}' refused"
            )));
        }

        let (sender, receiver) = mpsc::channel(self.buffer);
        self.state.subscriptions.lock().push(Subscription {
            topic: topic.to_owned(),
            sender,
            cancel: cancel.clone(),
        });

        // drop the sender on cancellation so the receiver terminates
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            cancel.cancelled().await;
            state.subscriptions.lock().retain(Subscription::is_live);
        });

        Ok(receiver)
    }

    async fn close(&self) -> Result<()> {
        Publisher::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn fans_out_to_matching_and_catch_all_subscriptions() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let mut events = broker.subscribe(cancel.clone(), "events").await.unwrap();
        let mut everything = broker.subscribe(cancel.clone(), "").await.unwrap();
        let mut other = broker.subscribe(cancel.clone(), "other").await.unwrap();

        broker
            .publish("events", vec![TransportMessage::new("m1", b"OK".to_vec())])
            .await
            .unwrap();

        assert_eq!(events.recv().await.unwrap().message().uuid, "m1");
        assert_eq!(everything.recv().await.unwrap().message().uuid, "m1");
        assert!(other.try_recv().is_err());
        assert_eq!(broker.published_to("events").len(), 1);
    }

    #[tokio::test]
    async fn records_settlements() {
        let broker = MemoryBroker::new();
        let mut rx = broker
            .subscribe(CancellationToken::new(), "t")
            .await
            .unwrap();
        broker
            .publish(
                "t",
                vec![
                    TransportMessage::new("a", Vec::new()),
                    TransportMessage::new("b", Vec::new()),
                ],
            )
            .await
            .unwrap();

        rx.recv().await.unwrap().ack();
        rx.recv().await.unwrap().nack();
        tokio::time::timeout(Duration::from_secs(1), broker.wait_for_settled(2))
            .await
            .expect("settled in time");

        assert_eq!(broker.outcomes_for("a"), vec![AckOutcome::Ack]);
        assert_eq!(broker.outcomes_for("b"), vec![AckOutcome::Nack]);
        assert_eq!(broker.count(AckOutcome::Ack), 1);
    }

    #[tokio::test]
    async fn cancellation_ends_the_subscription() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let mut rx = broker.subscribe(cancel.clone(), "t").await.unwrap();
        cancel.cancel();
        let ended = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("receiver terminates");
        assert!(ended.is_none());
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn injected_failures_and_close() {
        let broker = MemoryBroker::new();
        broker.fail_subscribe("bad");
        assert!(matches!(
            broker.subscribe(CancellationToken::new(), "bad").await,
            Err(EdgewireError::Transport(_))
        ));

        broker.fail_publish("broker down");
        assert!(broker.publish("t", Vec::new()).await.is_err());

        Subscriber::close(&broker).await.unwrap();
        Publisher::close(&broker).await.unwrap();
        assert!(broker.is_closed());
        assert!(matches!(
            broker.subscribe(CancellationToken::new(), "t").await,
            Err(EdgewireError::Closed)
        ));
    }
}
