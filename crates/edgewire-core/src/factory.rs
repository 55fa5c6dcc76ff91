//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Backend connector registry and trigger/client construction."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::{SharedPublisher, SharedSubscriber};
use crate::client::Client;
use crate::config::WatermillConfig;
use crate::host::MessageProcessor;
use crate::memory::MemoryBroker;
use crate::trigger::Trigger;
use crate::{EdgewireError, Result};

/// Backend type names understood by EdgeX service configuration.
pub const BROKER_BACKENDS: [&str; 5] = ["nats", "jetstream", "kafka", "amqp", "googlecloud"];

/// Name of the built-in in-process backend.
pub const MEMORY_BACKEND: &str = "memory";

/// Publisher and subscriber connected to the same backend.
#[derive(Clone)]
pub struct BackendPair {
    pub publisher: SharedPublisher,
    pub subscriber: SharedSubscriber,
}

/// Builds backend handles from configuration.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, config: &WatermillConfig) -> Result<BackendPair>;
}

/// Connector handing out a shared [`MemoryBroker`].
#[derive(Clone, Default)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl BackendConnector for MemoryConnector {
    async fn connect(&self, _config: &WatermillConfig) -> Result<BackendPair> {
        Ok(BackendPair {
            publisher: Arc::new(self.broker.clone()),
            subscriber: Arc::new(self.broker.clone()),
        })
    }
}

/// Connectors keyed by case-insensitive backend type name.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    connectors: IndexMap<String, Arc<dyn BackendConnector>>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.connectors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BackendRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the in-memory backend registered.
    pub fn with_memory(broker: MemoryBroker) -> Self {
        let mut registry = Self::new();
        registry.register(MEMORY_BACKEND, Arc::new(MemoryConnector::new(broker)));
        registry
    }

    /// Register or replace the connector for a backend type.
    pub fn register(&mut self, name: &str, connector: Arc<dyn BackendConnector>) {
        self.connectors.insert(name.to_ascii_lowercase(), connector);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.connectors.contains_key(&name.to_ascii_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.connectors.keys().map(String::as_str)
    }

    /// Connect the backend selected by `config.backend_type`.
    pub async fn connect(&self, config: &WatermillConfig) -> Result<BackendPair> {
        let name = config.backend_type.trim().to_ascii_lowercase();
        let connector = self.connectors.get(&name).ok_or_else(|| {
            EdgewireError::Configuration(format!(
                "invalid trigger type specified: {}",
                config.backend_type
            ))
        })?;
        info!(backend = %name, broker_url = %config.broker_url, "connecting backend");
        connector.connect(config).await
    }

    /// Connect the configured backend and wrap it in a [`Trigger`].
    pub async fn build_trigger(
        &self,
        config: &WatermillConfig,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<Trigger> {
        config.validate()?;
        let backend = self.connect(config).await?;
        Trigger::new(config.clone(), backend.publisher, backend.subscriber, processor)
    }

    /// Connect the configured backend and wrap it in a [`Client`].
    pub async fn build_client(
        &self,
        cancel: CancellationToken,
        config: &WatermillConfig,
    ) -> Result<Client> {
        config.validate()?;
        let backend = self.connect(config).await?;
        Client::from_config(cancel, backend.publisher, backend.subscriber, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ProcessingContext, ProcessorFn};
    use crate::Envelope;

    fn config(backend: &str) -> WatermillConfig {
        WatermillConfig {
            backend_type: backend.into(),
            subscribe_topics: "events".into(),
            ..WatermillConfig::default()
        }
    }

    fn noop() -> Arc<dyn MessageProcessor> {
        Arc::new(ProcessorFn(|_: &mut ProcessingContext, _: &Envelope| Ok(())))
    }

    #[tokio::test]
    async fn unknown_backend_is_a_configuration_error() {
        let registry = BackendRegistry::with_memory(MemoryBroker::new());
        let err = registry
            .build_trigger(&config("zeromq"), noop())
            .await
            .err()
            .expect("unknown backend");
        assert_eq!(
            err.to_string(),
            "configuration error: invalid trigger type specified: zeromq"
        );
    }

    #[tokio::test]
    async fn broker_backends_need_a_registered_connector() {
        let registry = BackendRegistry::with_memory(MemoryBroker::new());
        for name in BROKER_BACKENDS {
            assert!(!registry.contains(name));
            assert!(registry.connect(&config(name)).await.is_err());
        }
    }

    #[tokio::test]
    async fn names_are_case_insensitive() {
        let mut registry = BackendRegistry::new();
        registry.register("NATS", Arc::new(MemoryConnector::default()));
        assert!(registry.contains("nats"));
        let trigger = registry.build_trigger(&config("Nats"), noop()).await.unwrap();
        assert_eq!(trigger.name(), "nats");
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["nats"]);
    }

    #[tokio::test]
    async fn memory_backend_builds_client_sharing_broker() {
        let broker = MemoryBroker::new();
        let registry = BackendRegistry::with_memory(broker.clone());
        let client = registry
            .build_client(CancellationToken::new(), &config("memory"))
            .await
            .unwrap();
        client.disconnect().await.unwrap();
        assert!(broker.is_closed());
    }

    #[tokio::test]
    async fn invalid_encryption_is_rejected_before_connecting() {
        let registry = BackendRegistry::with_memory(MemoryBroker::new());
        let mut cfg = config("memory");
        cfg.encryption_algorithm = "aes128-sha256".into();
        cfg.encryption_key = "zz".into();
        assert!(matches!(
            registry.build_client(CancellationToken::new(), &cfg).await,
            Err(EdgewireError::Configuration(_))
        ));
    }
}
