//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Envelope transcoding, encryption, and trigger lifecycle for pub/sub backends."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Adapter between EdgeX-style message envelopes and generic pub/sub backends.

pub mod backend;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod factory;
pub mod host;
pub mod memory;
pub mod metrics;
pub mod modifier;
pub mod protection;
pub mod sender;
pub mod trigger;
pub mod wire;

pub use backend::{AckOutcome, Delivery, Publisher, SharedPublisher, SharedSubscriber, Subscriber};
pub use client::{Client, TopicChannel};
pub use config::{parse_topics, LoadedConfig, WatermillConfig, WatermillConfigWrapper};
pub use envelope::{
    new_id, ContentType, Envelope, Metadata, TransportMessage, CHECKSUM_KEY, CONTENT_TYPE_KEY,
    CORRELATION_ID_KEY,
};
pub use error::{EdgewireError, Result};
pub use factory::{BackendConnector, BackendPair, BackendRegistry, MemoryConnector};
pub use host::{
    BackgroundMessage, ContextBuilder, DefaultContextBuilder, MessageProcessor,
    ProcessingContext, ProcessorFn,
};
pub use memory::MemoryBroker;
pub use metrics::{TriggerMetrics, TriggerMetricsExporter, TriggerSnapshot};
pub use modifier::BinaryModifier;
pub use protection::{modifiers_for, DataProtection, EncryptionAlgorithm};
pub use sender::{PipelineData, WatermillSender};
pub use trigger::{Deferred, Trigger, TriggerOptions, TriggerState};
pub use wire::WireFormat;
