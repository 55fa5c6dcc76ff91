//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Publish/subscribe client applying wire format and encryption."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::backend::{SharedPublisher, SharedSubscriber};
use crate::config::WatermillConfig;
use crate::envelope::Envelope;
use crate::modifier::BinaryModifier;
use crate::protection::modifiers_for;
use crate::wire::WireFormat;
use crate::{EdgewireError, Result};

/// Topic paired with the channel its envelopes are delivered to.
#[derive(Debug, Clone)]
pub struct TopicChannel {
    pub topic: String,
    pub messages: mpsc::Sender<Envelope>,
}

impl TopicChannel {
    pub fn new(topic: impl Into<String>, messages: mpsc::Sender<Envelope>) -> Self {
        Self {
            topic: topic.into(),
            messages,
        }
    }
}

/// Message client over a backend publisher/subscriber pair.
pub struct Client {
    publisher: SharedPublisher,
    subscriber: SharedSubscriber,
    format: WireFormat,
    encrypt: BinaryModifier,
    decrypt: BinaryModifier,
    cancel: CancellationToken,
}

impl Client {
    /// Client scoped to `cancel`; subscriptions stop when it fires.
    pub fn new(
        cancel: CancellationToken,
        publisher: SharedPublisher,
        subscriber: SharedSubscriber,
        format: WireFormat,
    ) -> Self {
        Self {
            publisher,
            subscriber,
            format,
            encrypt: BinaryModifier::Noop,
            decrypt: BinaryModifier::Noop,
            cancel: cancel.child_token(),
        }
    }

    /// Client using the wire format and encryption selected by `config`.
    pub fn from_config(
        cancel: CancellationToken,
        publisher: SharedPublisher,
        subscriber: SharedSubscriber,
        config: &WatermillConfig,
    ) -> Result<Self> {
        let (encrypt, decrypt) = modifiers_for(config)?;
        Ok(Self::new(cancel, publisher, subscriber, config.wire_format())
            .with_modifiers(encrypt, decrypt))
    }

    /// Replace the encrypt/decrypt pair.
    pub fn with_modifiers(mut self, encrypt: BinaryModifier, decrypt: BinaryModifier) -> Self {
        self.encrypt = encrypt;
        self.decrypt = decrypt;
        self
    }

    /// Wire format applied to every published and received message.
    pub fn wire_format(&self) -> WireFormat {
        self.format
    }

    /// The connection is established by the backend at construction.
    pub async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Marshal and publish one envelope.
    pub async fn publish(&self, envelope: &Envelope, topic: &str) -> Result<()> {
        let message = self.format.marshal(envelope, &self.encrypt)?;
        let correlation_id = message.uuid.clone();
        self.publisher.publish(topic, vec![message]).await?;
        trace!(topic, correlation_id = %correlation_id, "published message");
        Ok(())
    }

    /// Start one receive loop per topic.
    ///
    /// Decoded envelopes go to the topic's channel and are then acknowledged. Decode
    /// failures and subscription failures are sent to `errors`.
    pub async fn subscribe(
        &self,
        topics: Vec<TopicChannel>,
        errors: mpsc::Sender<EdgewireError>,
    ) -> Result<()> {
        for topic in topics {
            let subscriber = self.subscriber.clone();
            let format = self.format;
            let decrypt = self.decrypt.clone();
            let cancel = self.cancel.clone();
            let errors = errors.clone();

            tokio::spawn(async move {
                let mut deliveries = match subscriber.subscribe(cancel.clone(), &topic.topic).await
                {
                    Ok(deliveries) => deliveries,
                    Err(err) => {
                        error!(topic = %topic.topic, error = %err, "subscription failed");
                        let _ = errors.send(err).await;
                        return;
                    }
                };
                debug!(topic = %topic.topic, "client subscribed");

                loop {
                    let delivery = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = deliveries.recv() => match next {
                            Some(delivery) => delivery,
                            None => break,
                        },
                    };

                    match format.unmarshal(delivery.message(), &decrypt) {
                        Ok(mut envelope) => {
                            envelope.received_topic = topic.topic.clone();
                            let forwarded = tokio::select! {
                                _ = cancel.cancelled() => false,
                                sent = topic.messages.send(envelope) => sent.is_ok(),
                            };
                            if !forwarded {
                                delivery.nack();
                                break;
                            }
                            delivery.ack();
                        }
                        Err(err) => {
                            delivery.nack();
                            let reported = tokio::select! {
                                _ = cancel.cancelled() => false,
                                sent = errors.send(err) => sent.is_ok(),
                            };
                            if !reported {
                                break;
                            }
                        }
                    }
                }
                debug!(topic = %topic.topic, "client receive loop exited");
            });
        }
        Ok(())
    }

    /// Close publisher and subscriber, reporting both failures if both fail.
    pub async fn disconnect(&self) -> Result<()> {
        info!("disconnecting client");
        self.cancel.cancel();

        let mut failures = Vec::new();
        if let Err(err) = self.publisher.close().await {
            error!(error = %err, "unable to close publisher");
            failures.push(err);
        }
        if let Err(err) = self.subscriber.close().await {
            error!(error = %err, "unable to close subscriber");
            failures.push(err);
        }
        EdgewireError::aggregate(failures).map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::backend::{AckOutcome, Delivery, Publisher, Subscriber};
    use crate::envelope::{ContentType, TransportMessage};
    use crate::memory::MemoryBroker;

    struct FailingClose(&'static str);

    #[async_trait]
    impl Publisher for FailingClose {
        async fn publish(&self, _topic: &str, _messages: Vec<TransportMessage>) -> Result<()> {
            Err(EdgewireError::Transport(self.0.into()))
        }

        async fn close(&self) -> Result<()> {
            Err(EdgewireError::Transport(format!("{} close", self.0)))
        }
    }

    #[async_trait]
    impl Subscriber for FailingClose {
        async fn subscribe(
            &self,
            _cancel: CancellationToken,
            _topic: &str,
        ) -> Result<mpsc::Receiver<Delivery>> {
            Err(EdgewireError::Transport(self.0.into()))
        }

        async fn close(&self) -> Result<()> {
            Err(EdgewireError::Transport(format!("{} close", self.0)))
        }
    }

    fn memory_client(broker: &MemoryBroker, format: WireFormat) -> Client {
        Client::new(
            CancellationToken::new(),
            Arc::new(broker.clone()),
            Arc::new(broker.clone()),
            format,
        )
    }

    async fn subscribed(broker: &MemoryBroker, count: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.subscription_count() < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("subscriptions registered");
    }

    #[tokio::test]
    async fn publish_then_subscribe_roundtrip() {
        let broker = MemoryBroker::new();
        let client = memory_client(&broker, WireFormat::EdgeX);
        let (tx, mut rx) = mpsc::channel(4);
        let (err_tx, _err_rx) = mpsc::channel(4);

        client.connect().await.unwrap();
        client
            .subscribe(vec![TopicChannel::new("events", tx)], err_tx)
            .await
            .unwrap();
        subscribed(&broker, 1).await;

        let envelope = Envelope::new("cid", b"OK".to_vec(), ContentType::Json);
        client.publish(&envelope, "events").await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delivered")
            .expect("channel open");
        assert_eq!(received.correlation_id, "cid");
        assert_eq!(received.received_topic, "events");

        broker.wait_for_settled(1).await;
        assert_eq!(broker.outcomes_for("cid"), vec![AckOutcome::Ack]);
    }

    #[tokio::test]
    async fn undecodable_message_goes_to_error_sink() {
        let broker = MemoryBroker::new();
        let client = memory_client(&broker, WireFormat::EdgeX);
        let (tx, mut rx) = mpsc::channel(4);
        let (err_tx, mut err_rx) = mpsc::channel(4);
        client
            .subscribe(vec![TopicChannel::new("events", tx)], err_tx)
            .await
            .unwrap();
        subscribed(&broker, 1).await;

        broker
            .publish("events", vec![TransportMessage::new("bad", b"{nope".to_vec())])
            .await
            .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(1), err_rx.recv())
            .await
            .expect("error reported")
            .expect("sink open");
        assert!(matches!(err, EdgewireError::Codec(_)));
        assert!(rx.try_recv().is_err());
        broker.wait_for_settled(1).await;
        assert_eq!(broker.outcomes_for("bad"), vec![AckOutcome::Nack]);
    }

    #[tokio::test]
    async fn subscribe_failure_is_reported_to_error_sink() {
        let backend = Arc::new(FailingClose("refused"));
        let client = Client::new(
            CancellationToken::new(),
            backend.clone(),
            backend,
            WireFormat::Raw,
        );
        let (tx, _rx) = mpsc::channel(1);
        let (err_tx, mut err_rx) = mpsc::channel(1);
        client
            .subscribe(vec![TopicChannel::new("t", tx)], err_tx)
            .await
            .unwrap();
        let err = err_rx.recv().await.expect("error reported");
        assert!(err.to_string().contains("refused"));
    }

    #[tokio::test]
    async fn publish_error_is_returned_unchanged() {
        let backend = Arc::new(FailingClose("broker down"));
        let client = Client::new(
            CancellationToken::new(),
            backend.clone(),
            backend,
            WireFormat::Raw,
        );
        let err = client
            .publish(&Envelope::new("cid", b"OK".to_vec(), ContentType::Json), "t")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "transport error: broker down");
    }

    #[tokio::test]
    async fn disconnect_reports_both_close_errors() {
        let client = Client::new(
            CancellationToken::new(),
            Arc::new(FailingClose("pub")),
            Arc::new(FailingClose("sub")),
            WireFormat::EdgeX,
        );
        let err = client.disconnect().await.unwrap_err();
        match err {
            EdgewireError::Aggregate(errors) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate, got {other}"),
        }
    }

    #[tokio::test]
    async fn disconnect_releases_loop_blocked_on_full_channel() {
        let broker = MemoryBroker::new();
        let client = memory_client(&broker, WireFormat::EdgeX);
        // room for one envelope, never drained
        let (tx, _rx) = mpsc::channel(1);
        let (err_tx, _err_rx) = mpsc::channel(1);
        client
            .subscribe(vec![TopicChannel::new("events", tx)], err_tx)
            .await
            .unwrap();
        subscribed(&broker, 1).await;

        for id in ["m1", "m2"] {
            client
                .publish(&Envelope::new(id, b"OK".to_vec(), ContentType::Json), "events")
                .await
                .unwrap();
        }
        tokio::time::timeout(Duration::from_secs(1), broker.wait_for_settled(1))
            .await
            .expect("first envelope forwarded");
        assert_eq!(broker.outcomes_for("m1"), vec![AckOutcome::Ack]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.disconnect().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), broker.wait_for_settled(2))
            .await
            .expect("blocked envelope settled after disconnect");
        assert_eq!(broker.outcomes_for("m2"), vec![AckOutcome::Nack]);
    }

    #[tokio::test]
    async fn disconnect_closes_memory_backend() {
        let broker = MemoryBroker::new();
        let client = memory_client(&broker, WireFormat::Raw);
        client.disconnect().await.unwrap();
        assert!(broker.is_closed());
    }
}
