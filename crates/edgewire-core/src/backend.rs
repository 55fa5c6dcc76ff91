//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Publisher/subscriber abstraction over pub/sub backends."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::envelope::TransportMessage;
use crate::Result;

/// Settlement of a delivered message reported back to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckOutcome {
    Ack,
    Nack,
}

/// A received transport message together with its acknowledger.
///
/// `ack` and `nack` consume the delivery so it is settled at most once. Dropping an
/// unsettled delivery negatively acknowledges it.
#[derive(Debug)]
pub struct Delivery {
    message: TransportMessage,
    acknowledger: Option<oneshot::Sender<AckOutcome>>,
}

impl Delivery {
    /// Wrap a message; the receiver resolves once the delivery is settled.
    pub fn new(message: TransportMessage) -> (Self, oneshot::Receiver<AckOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                message,
                acknowledger: Some(tx),
            },
            rx,
        )
    }

    /// Wrap a message whose backend does not track acknowledgements.
    pub fn untracked(message: TransportMessage) -> Self {
        Self {
            message,
            acknowledger: None,
        }
    }

    pub fn message(&self) -> &TransportMessage {
        &self.message
    }

    /// Acknowledge; returns `false` when the backend no longer listens.
    pub fn ack(mut self) -> bool {
        self.settle(AckOutcome::Ack)
    }

    /// Negatively acknowledge; returns `false` when the backend no longer listens.
    pub fn nack(mut self) -> bool {
        self.settle(AckOutcome::Nack)
    }

    /// Give the message back without settling it.
    pub fn into_message(mut self) -> TransportMessage {
        self.acknowledger.take();
        std::mem::take(&mut self.message)
    }

    fn settle(&mut self, outcome: AckOutcome) -> bool {
        match self.acknowledger.take() {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.settle(AckOutcome::Nack);
    }
}

/// Outbound half of a backend.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish messages to a topic.
    async fn publish(&self, topic: &str, messages: Vec<TransportMessage>) -> Result<()>;
    /// Release backend resources.
    async fn close(&self) -> Result<()>;
}

/// Inbound half of a backend.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Provision a topic before subscribing; backends without provisioning keep the default.
    async fn subscribe_initialize(&self, _topic: &str) -> Result<()> {
        Ok(())
    }

    /// Start receiving from a topic until `cancel` fires or the subscriber closes.
    async fn subscribe(
        &self,
        cancel: CancellationToken,
        topic: &str,
    ) -> Result<mpsc::Receiver<Delivery>>;

    /// Release backend resources.
    async fn close(&self) -> Result<()>;
}

pub type SharedPublisher = Arc<dyn Publisher>;
pub type SharedSubscriber = Arc<dyn Subscriber>;
