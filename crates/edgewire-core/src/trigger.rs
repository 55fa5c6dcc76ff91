//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Message trigger: subscribe, dispatch, publish, acknowledge."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Message-driven entry point for the host framework.
//!
//! [`Trigger::initialize`] subscribes to every configured topic and starts one
//! dispatch loop per topic plus a loop draining background messages, all scoped to a
//! child of the caller's cancellation token and tracked by the caller's
//! [`TaskTracker`]. Each inbound message is handled on its own task:
//! unmarshal, build context, process, publish response, then ack. Any failure along
//! the way nacks instead. In-flight message tasks are not interrupted by
//! [`Trigger::stop`]; they settle their delivery before exiting.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use edgewire_logging::{
    ewm_debug, ewm_error, ewm_info, ewm_trace, log_lifecycle_event, LifecycleOutcome, LogContext,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::backend::{Delivery, SharedPublisher, SharedSubscriber};
use crate::config::WatermillConfig;
use crate::envelope::{Envelope, CORRELATION_ID_KEY};
use crate::host::{BackgroundMessage, ContextBuilder, DefaultContextBuilder, MessageProcessor};
use crate::metrics::TriggerMetrics;
use crate::modifier::BinaryModifier;
use crate::protection::modifiers_for;
use crate::wire::WireFormat;
use crate::{EdgewireError, Result};

/// Lifecycle of a [`Trigger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Uninitialized,
    Initializing,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TriggerState::Uninitialized => "uninitialized",
            TriggerState::Initializing => "initializing",
            TriggerState::Running => "running",
            TriggerState::Stopping => "stopping",
            TriggerState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Tuning knobs for message dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerOptions {
    /// Upper bound on concurrently processed messages per topic; unbounded when `None`.
    pub max_in_flight: Option<usize>,
}

/// Subscribes to configured topics and drives the host callback for each message.
pub struct Trigger {
    name: String,
    config: WatermillConfig,
    publisher: SharedPublisher,
    subscriber: SharedSubscriber,
    processor: Arc<dyn MessageProcessor>,
    context_builder: Arc<dyn ContextBuilder>,
    format: WireFormat,
    encrypt: BinaryModifier,
    decrypt: BinaryModifier,
    options: TriggerOptions,
    metrics: Arc<TriggerMetrics>,
    state: Arc<Mutex<TriggerState>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Trigger {
    /// Trigger using the wire format and encryption selected by `config`.
    ///
    /// Fails with a configuration error when the encryption settings are invalid.
    pub fn new(
        config: WatermillConfig,
        publisher: SharedPublisher,
        subscriber: SharedSubscriber,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<Self> {
        let (encrypt, decrypt) = modifiers_for(&config)?;
        let name = if config.backend_type.is_empty() {
            "watermill".to_owned()
        } else {
            config.backend_type.to_ascii_lowercase()
        };
        Ok(Self {
            name,
            format: config.wire_format(),
            config,
            publisher,
            subscriber,
            processor,
            context_builder: Arc::new(DefaultContextBuilder),
            encrypt,
            decrypt,
            options: TriggerOptions::default(),
            metrics: Arc::new(TriggerMetrics::new()),
            state: Arc::new(Mutex::new(TriggerState::Uninitialized)),
            cancel: Mutex::new(None),
        })
    }

    pub fn with_context_builder(mut self, builder: Arc<dyn ContextBuilder>) -> Self {
        self.context_builder = builder;
        self
    }

    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    /// Replace the encrypt/decrypt pair derived from configuration.
    pub fn with_modifiers(mut self, encrypt: BinaryModifier, decrypt: BinaryModifier) -> Self {
        self.encrypt = encrypt;
        self.decrypt = decrypt;
        self
    }

    pub fn with_options(mut self, options: TriggerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<TriggerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TriggerState {
        *self.state.lock()
    }

    pub fn metrics(&self) -> Arc<TriggerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Subscribe to every configured topic and start dispatching.
    ///
    /// All subscriptions are established before any dispatch loop starts; if one
    /// fails, the partial set is cancelled and the error returned. If [`Trigger::stop`]
    /// is called while subscribing, no dispatch loop is started and the trigger stays
    /// `Stopping`. The returned [`Deferred`] closes the backend once the caller has
    /// finished shutting down.
    pub async fn initialize(
        &self,
        tracker: &TaskTracker,
        parent: CancellationToken,
        background: mpsc::Receiver<BackgroundMessage>,
    ) -> Result<Deferred> {
        {
            let mut state = self.state.lock();
            if *state != TriggerState::Uninitialized {
                return Err(EdgewireError::Configuration(format!(
                    "trigger cannot be initialized while {}",
                    *state
                )));
            }
            *state = TriggerState::Initializing;
        }

        let cancel = parent.child_token();
        *self.cancel.lock() = Some(cancel.clone());

        let ctx = LogContext::new().with_pipeline(&self.name);
        ewm_info!(context = ctx, "initializing trigger for '{}'", self.config.backend_type);
        ewm_info!(
            context = ctx,
            "subscribing to topic: '{}' @ {}",
            self.config.subscribe_topics,
            self.config.broker_url
        );

        let mut subscriptions = Vec::new();
        for topic in self.config.subscribe_topic_list() {
            if cancel.is_cancelled() {
                break;
            }
            match self.subscribe(&cancel, &topic).await {
                Ok(deliveries) => subscriptions.push((topic, deliveries)),
                Err(err) => {
                    cancel.cancel();
                    *self.state.lock() = TriggerState::Stopped;
                    log_lifecycle_event(
                        Some(&ctx.clone().with_topic(&topic)),
                        "trigger.initialize",
                        &err.to_string(),
                        LifecycleOutcome::Fault,
                    );
                    return Err(err);
                }
            }
        }

        // a stop() issued while subscribing wins over the transition to Running
        let running = {
            let mut state = self.state.lock();
            if *state == TriggerState::Initializing && !cancel.is_cancelled() {
                *state = TriggerState::Running;
                true
            } else {
                false
            }
        };
        if !running {
            drop(subscriptions);
            log_lifecycle_event(
                Some(&ctx),
                "trigger.initialize",
                "stopped before dispatch started",
                LifecycleOutcome::Fault,
            );
            return Ok(self.deferred());
        }

        let dispatch = self.dispatcher();
        let limit = self.options.max_in_flight.map(|limit| limit.max(1));
        for (topic, deliveries) in subscriptions {
            let limiter = limit.map(|limit| Arc::new(Semaphore::new(limit)));
            tracker.spawn(dispatch.clone().run_topic(
                topic,
                deliveries,
                cancel.clone(),
                tracker.clone(),
                limiter,
            ));
        }
        tracker.spawn(dispatch.run_background(background, cancel.clone(), tracker.clone()));

        log_lifecycle_event(
            Some(&ctx),
            "trigger.initialize",
            "trigger running",
            LifecycleOutcome::Success,
        );
        Ok(self.deferred())
    }

    /// Cancel the dispatch loops. Safe to call more than once or before initialization.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().as_ref() {
            cancel.cancel();
            let mut state = self.state.lock();
            if *state == TriggerState::Running || *state == TriggerState::Initializing {
                *state = TriggerState::Stopping;
            }
        }
    }

    async fn subscribe(
        &self,
        cancel: &CancellationToken,
        topic: &str,
    ) -> Result<mpsc::Receiver<Delivery>> {
        self.subscriber.subscribe_initialize(topic).await?;
        let deliveries = self.subscriber.subscribe(cancel.clone(), topic).await?;
        ewm_debug!(
            context = LogContext::new().with_topic(topic).with_pipeline(&self.name),
            "subscribed"
        );
        Ok(deliveries)
    }

    fn deferred(&self) -> Deferred {
        Deferred {
            name: self.name.clone(),
            publisher: Arc::clone(&self.publisher),
            subscriber: Arc::clone(&self.subscriber),
            state: Arc::clone(&self.state),
        }
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            name: Arc::from(self.name.as_str()),
            publish_topic: Arc::from(self.config.publish_topic.as_str()),
            publisher: Arc::clone(&self.publisher),
            processor: Arc::clone(&self.processor),
            context_builder: Arc::clone(&self.context_builder),
            format: self.format,
            encrypt: self.encrypt.clone(),
            decrypt: self.decrypt.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

/// Cleanup returned by [`Trigger::initialize`]: closes the subscriber, then the publisher.
pub struct Deferred {
    name: String,
    publisher: SharedPublisher,
    subscriber: SharedSubscriber,
    state: Arc<Mutex<TriggerState>>,
}

impl Deferred {
    /// Close both backend halves. Each failure is logged; both are returned together.
    pub async fn run(self) -> Result<()> {
        let ctx = LogContext::new().with_pipeline(&self.name);
        ewm_info!(context = ctx, "disconnecting trigger");

        let mut failures = Vec::new();
        if let Err(err) = self.subscriber.close().await {
            ewm_error!(context = ctx, "unable to disconnect trigger subscriber: {err}");
            failures.push(err);
        }
        if let Err(err) = self.publisher.close().await {
            ewm_error!(context = ctx, "unable to disconnect trigger publisher: {err}");
            failures.push(err);
        }
        *self.state.lock() = TriggerState::Stopped;

        match EdgewireError::aggregate(failures) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// Shared, immutable per-message state cloned into every task.
#[derive(Clone)]
struct Dispatcher {
    name: Arc<str>,
    publish_topic: Arc<str>,
    publisher: SharedPublisher,
    processor: Arc<dyn MessageProcessor>,
    context_builder: Arc<dyn ContextBuilder>,
    format: WireFormat,
    encrypt: BinaryModifier,
    decrypt: BinaryModifier,
    metrics: Arc<TriggerMetrics>,
}

impl Dispatcher {
    async fn run_topic(
        self,
        topic: String,
        mut deliveries: mpsc::Receiver<Delivery>,
        cancel: CancellationToken,
        tracker: TaskTracker,
        limiter: Option<Arc<Semaphore>>,
    ) {
        let ctx = LogContext::new().with_topic(&topic).with_pipeline(&self.name);
        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                next = deliveries.recv() => match next {
                    Some(delivery) => delivery,
                    None => {
                        ewm_debug!(context = ctx, "subscription closed by backend");
                        break;
                    }
                },
            };
            self.metrics.record_received();

            let permit = match &limiter {
                Some(semaphore) => tokio::select! {
                    _ = cancel.cancelled() => {
                        self.nack(delivery, &topic, "");
                        break;
                    }
                    permit = Arc::clone(semaphore).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            let dispatch = self.clone();
            let topic = topic.clone();
            tracker.spawn(async move {
                let _permit = permit;
                dispatch.input(delivery, &topic).await;
            });
        }
        ewm_debug!(context = ctx, "dispatch loop exited");
    }

    async fn run_background(
        self,
        mut background: mpsc::Receiver<BackgroundMessage>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                next = background.recv() => match next {
                    Some(message) => message,
                    None => break,
                },
            };
            let dispatch = self.clone();
            tracker.spawn(async move { dispatch.background(message).await });
        }
        ewm_debug!(
            context = LogContext::new().with_pipeline(&self.name),
            "background loop exited"
        );
    }

    async fn input(&self, delivery: Delivery, topic: &str) {
        let started = Instant::now();

        let mut envelope = match self.format.unmarshal(delivery.message(), &self.decrypt) {
            Ok(envelope) => envelope,
            Err(err) => {
                let correlation_id = inbound_reference(&delivery);
                ewm_error!(
                    context = LogContext::new()
                        .with_topic(topic)
                        .with_correlation_id(&correlation_id)
                        .with_pipeline(&self.name),
                    "failed to unmarshal message: {err}"
                );
                self.nack(delivery, topic, &correlation_id);
                return;
            }
        };
        envelope.received_topic = topic.to_owned();

        let mut context = self.context_builder.build(&envelope);
        let correlation_id = context.correlation_id().to_owned();
        let ctx = LogContext::new()
            .with_topic(topic)
            .with_correlation_id(&correlation_id)
            .with_pipeline(&self.name);
        ewm_trace!(context = ctx, "received message");

        if let Err(err) = self.processor.process(&mut context, &envelope).await {
            ewm_error!(context = ctx, "failed to process message: {err}");
            self.nack(delivery, topic, &correlation_id);
            return;
        }

        if let Some(response) = context.response_envelope() {
            if let Err(err) = self.publish(&response, &*self.publish_topic).await {
                ewm_error!(context = ctx, "failed to publish response: {err}");
                self.nack(delivery, topic, &correlation_id);
                return;
            }
            self.metrics.record_published();
        }

        delivery.ack();
        self.metrics.record_ack(started.elapsed());
        ewm_debug!(context = ctx, "message acknowledged");
    }

    async fn background(&self, message: BackgroundMessage) {
        let topic = message
            .topic
            .as_deref()
            .filter(|topic| !topic.is_empty())
            .unwrap_or(&*self.publish_topic);
        let result = self.publish(&message.envelope, topic).await;
        self.metrics.record_background(result.is_ok());
        if let Err(err) = result {
            ewm_error!(
                context = LogContext::new()
                    .with_topic(topic)
                    .with_correlation_id(&message.envelope.correlation_id)
                    .with_pipeline(&self.name),
                "failed to publish background message: {err}"
            );
        }
    }

    /// Marshal (encrypting once) and publish an envelope.
    async fn publish(&self, envelope: &Envelope, topic: &str) -> Result<()> {
        let message = self.format.marshal(envelope, &self.encrypt)?;
        let correlation_id = message.uuid.clone();
        self.publisher.publish(topic, vec![message]).await?;
        ewm_trace!(
            context = LogContext::new()
                .with_topic(topic)
                .with_correlation_id(&correlation_id)
                .with_pipeline(&self.name),
            "published message"
        );
        Ok(())
    }

    fn nack(&self, delivery: Delivery, topic: &str, correlation_id: &str) {
        let correlation_id = if correlation_id.is_empty() {
            inbound_reference(&delivery)
        } else {
            correlation_id.to_owned()
        };
        delivery.nack();
        self.metrics.record_nack();
        ewm_error!(
            context = LogContext::new()
                .with_topic(topic)
                .with_correlation_id(&correlation_id)
                .with_pipeline(&self.name),
            "message nacked"
        );
    }
}

/// Best available identifier of an undecoded message for logging.
fn inbound_reference(delivery: &Delivery) -> String {
    let message = delivery.message();
    match message.metadata_value(CORRELATION_ID_KEY) {
        "" => message.uuid.clone(),
        correlation_id => correlation_id.to_owned(),
    }
}
