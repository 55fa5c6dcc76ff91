//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Pipeline function publishing data straight to the backend."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::Serialize;
use tracing::{error, trace};

use crate::backend::SharedPublisher;
use crate::config::WatermillConfig;
use crate::envelope::TransportMessage;
use crate::host::ProcessingContext;
use crate::modifier::BinaryModifier;
use crate::protection::modifiers_for;
use crate::Result;

/// Data handed to a pipeline function.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineData {
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl PipelineData {
    /// Serialize any value as JSON data.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(PipelineData::Json(serde_json::to_value(value)?))
    }

    /// Bytes to put on the wire; JSON values are serialized.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            PipelineData::Bytes(bytes) => Ok(bytes),
            PipelineData::Text(text) => Ok(text.into_bytes()),
            PipelineData::Json(value) => Ok(serde_json::to_vec(&value)?),
        }
    }
}

impl From<Vec<u8>> for PipelineData {
    fn from(value: Vec<u8>) -> Self {
        PipelineData::Bytes(value)
    }
}

impl From<&[u8]> for PipelineData {
    fn from(value: &[u8]) -> Self {
        PipelineData::Bytes(value.to_vec())
    }
}

impl From<String> for PipelineData {
    fn from(value: String) -> Self {
        PipelineData::Text(value)
    }
}

impl From<&str> for PipelineData {
    fn from(value: &str) -> Self {
        PipelineData::Text(value.to_owned())
    }
}

impl From<serde_json::Value> for PipelineData {
    fn from(value: serde_json::Value) -> Self {
        PipelineData::Json(value)
    }
}

/// Pipeline function that encrypts data and publishes it to a templated topic.
pub struct WatermillSender {
    publisher: SharedPublisher,
    encrypt: BinaryModifier,
    base_topic: String,
    continue_pipeline: bool,
}

impl WatermillSender {
    /// Sender publishing to the configured publish topic with the configured encryption.
    pub fn new(
        publisher: SharedPublisher,
        continue_pipeline: bool,
        config: &WatermillConfig,
    ) -> Result<Self> {
        let (encrypt, _) = modifiers_for(config)?;
        Ok(Self {
            publisher,
            encrypt,
            base_topic: config.publish_topic.clone(),
            continue_pipeline,
        })
    }

    /// Publish `data`, returning whether the pipeline should continue.
    ///
    /// Conversion, encryption and topic resolution failures are errors; a failed
    /// publish stops the pipeline without one.
    pub async fn send(&self, context: &ProcessingContext, data: impl Into<PipelineData>) -> Result<bool> {
        let data: PipelineData = data.into();
        let payload = self.encrypt.apply(data.into_bytes()?)?;
        let topic = context.apply_values(&self.base_topic)?;

        let message = TransportMessage::new(context.correlation_id(), payload);
        if let Err(err) = self.publisher.publish(&topic, vec![message]).await {
            error!(
                topic = %topic,
                correlation_id = %context.correlation_id(),
                error = %err,
                "sender failed to publish"
            );
            return Ok(false);
        }
        trace!(topic = %topic, correlation_id = %context.correlation_id(), "sender published");
        Ok(self.continue_pipeline)
    }
}
