//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Host framework seams: processing context, callback, context builder."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use async_trait::async_trait;
use indexmap::IndexMap;

use crate::envelope::{ContentType, Envelope};
use crate::{EdgewireError, Result};

/// Context value key holding the topic a message arrived on.
pub const RECEIVED_TOPIC_KEY: &str = "receivedtopic";

/// Per-message state handed to the host callback.
///
/// The callback stages a response through [`ProcessingContext::set_response_data`];
/// the trigger publishes it once the callback returns successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingContext {
    correlation_id: String,
    input_content_type: ContentType,
    response_data: Option<Vec<u8>>,
    response_content_type: Option<ContentType>,
    values: IndexMap<String, String>,
}

impl ProcessingContext {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ..Self::default()
        }
    }

    /// Context seeded from an inbound envelope.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let mut context = Self::new(envelope.correlation_id.clone());
        context.input_content_type = envelope.content_type.clone();
        context.add_value(RECEIVED_TOPIC_KEY, envelope.received_topic.clone());
        context
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn input_content_type(&self) -> &ContentType {
        &self.input_content_type
    }

    pub fn received_topic(&self) -> &str {
        self.value(RECEIVED_TOPIC_KEY).unwrap_or("")
    }

    pub fn set_response_data(&mut self, data: impl Into<Vec<u8>>) {
        self.response_data = Some(data.into());
    }

    pub fn response_data(&self) -> Option<&[u8]> {
        self.response_data.as_deref()
    }

    pub fn set_response_content_type(&mut self, content_type: ContentType) {
        self.response_content_type = Some(content_type);
    }

    /// Response content type, defaulting to JSON when the callback did not set one.
    pub fn response_content_type(&self) -> ContentType {
        self.response_content_type.clone().unwrap_or_default()
    }

    /// Staged response as an outbound envelope, if any.
    pub fn response_envelope(&self) -> Option<Envelope> {
        self.response_data.as_ref().map(|data| {
            Envelope::new(
                self.correlation_id.clone(),
                data.clone(),
                self.response_content_type(),
            )
        })
    }

    /// Store a value; keys are case-insensitive.
    pub fn add_value(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.values
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn values(&self) -> &IndexMap<String, String> {
        &self.values
    }

    /// Replace `{key}` placeholders in `template` with context values.
    ///
    /// Fails if any placeholder is left without a value.
    pub fn apply_values(&self, template: &str) -> Result<String> {
        let mut resolved = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}') else {
                break;
            };
            let key = &rest[open + 1..open + close];
            let value = self.value(key).ok_or_else(|| {
                EdgewireError::Processing(format!(
                    "failed to replace all context placeholders in '{template}': no value for '{key}'"
                ))
            })?;
            resolved.push_str(&rest[..open]);
            resolved.push_str(value);
            rest = &rest[open + close + 1..];
        }
        resolved.push_str(rest);
        Ok(resolved)
    }
}

/// Host message-processing callback.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Process one envelope, optionally staging a response on `context`.
    async fn process(&self, context: &mut ProcessingContext, envelope: &Envelope) -> Result<()>;
}

/// Builds the per-message [`ProcessingContext`].
pub trait ContextBuilder: Send + Sync {
    fn build(&self, envelope: &Envelope) -> ProcessingContext {
        ProcessingContext::from_envelope(envelope)
    }
}

/// Context builder seeding correlation id, content type, and received topic.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultContextBuilder;

impl ContextBuilder for DefaultContextBuilder {}

/// Adapter turning a synchronous closure into a [`MessageProcessor`].
pub struct ProcessorFn<F>(pub F);

#[async_trait]
impl<F> MessageProcessor for ProcessorFn<F>
where
    F: Fn(&mut ProcessingContext, &Envelope) -> Result<()> + Send + Sync,
{
    async fn process(&self, context: &mut ProcessingContext, envelope: &Envelope) -> Result<()> {
        (self.0)(context, envelope)
    }
}

/// Out-of-band message the host wants published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundMessage {
    /// Destination; the configured publish topic is used when absent.
    pub topic: Option<String>,
    pub envelope: Envelope,
}

impl BackgroundMessage {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            topic: None,
            envelope,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }
}
