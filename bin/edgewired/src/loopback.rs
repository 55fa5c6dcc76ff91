//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-process trigger service and request feeder for the edgewire daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Trigger hosted on the in-process backend.
//!
//! Broker connectors are registered by embedding applications, so the daemon runs
//! the trigger on the memory backend. Requests reach it through [`Service::feed`],
//! which publishes each input line with a client using the configured wire format
//! and encryption and collects the responses from the publish topic.

use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use edgewire_core::{
    new_id, BackendRegistry, BackgroundMessage, ContentType, Deferred, Envelope, MemoryBroker,
    MessageProcessor, ProcessingContext, ProcessorFn, TopicChannel, Trigger, TriggerMetrics,
    TriggerOptions, WatermillConfig,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Upper bound on waiting for in-flight work and for each response.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Echo the inbound payload back with its content type.
pub fn echo_pipeline() -> Arc<dyn MessageProcessor> {
    Arc::new(ProcessorFn(
        |context: &mut ProcessingContext, envelope: &Envelope| {
            context.set_response_data(envelope.payload.clone());
            context.set_response_content_type(envelope.content_type.clone());
            Ok(())
        },
    ))
}

/// Read request lines from a file, or from stdin when `source` is `-`. Blank lines are skipped.
pub fn read_input(source: &Path) -> Result<Vec<String>> {
    let raw = if source == Path::new("-") {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read requests from stdin")?;
        buffer
    } else {
        fs::read_to_string(source)
            .with_context(|| format!("failed to read requests from {}", source.display()))?
    };
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Running trigger and the handles needed to feed and stop it.
pub struct Service {
    config: WatermillConfig,
    broker: MemoryBroker,
    registry: BackendRegistry,
    trigger: Trigger,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    deferred: Deferred,
    _background: mpsc::Sender<BackgroundMessage>,
}

impl Service {
    /// Build and initialize the trigger on a fresh memory backend.
    pub async fn start(
        config: WatermillConfig,
        processor: Arc<dyn MessageProcessor>,
        options: TriggerOptions,
        metrics: Arc<TriggerMetrics>,
    ) -> Result<Self> {
        let broker = MemoryBroker::new();
        let registry = BackendRegistry::with_memory(broker.clone());
        let trigger = registry
            .build_trigger(&config, processor)
            .await
            .context("building trigger")?
            .with_metrics(metrics)
            .with_options(options);

        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let (background, background_rx) = mpsc::channel(16);
        let deferred = trigger
            .initialize(&tracker, shutdown.clone(), background_rx)
            .await
            .context("initializing trigger")?;
        info!(trigger = %trigger.name(), "trigger running");

        Ok(Self {
            config,
            broker,
            registry,
            trigger,
            tracker,
            shutdown,
            deferred,
            _background: background,
        })
    }

    /// Publish each line as a request to the first subscribe topic and wait for one
    /// response per request on the publish topic. Responses arrive in completion order.
    pub async fn feed(&self, lines: &[String]) -> Result<Vec<Envelope>> {
        check_loopback_topics(&self.config)?;
        let topics = self.config.subscribe_topic_list();
        let request_topic = topics
            .first()
            .ok_or_else(|| anyhow!("no subscribe topic configured"))?;

        let client = self
            .registry
            .build_client(self.shutdown.clone(), &self.config)
            .await
            .context("building client")?;
        let capacity = lines.len().max(1);
        let (responses_tx, mut responses_rx) = mpsc::channel(capacity);
        let (errors_tx, mut errors_rx) = mpsc::channel(capacity);

        let before = self.broker.subscription_count();
        client
            .subscribe(
                vec![TopicChannel::new(self.config.publish_topic.clone(), responses_tx)],
                errors_tx,
            )
            .await?;
        tokio::time::timeout(DRAIN_TIMEOUT, async {
            while self.broker.subscription_count() <= before {
                tokio::task::yield_now().await;
            }
        })
        .await
        .context("response subscription not established")?;

        info!(
            topic = %request_topic,
            wire_format = %client.wire_format(),
            requests = lines.len(),
            "feeding requests"
        );
        for line in lines {
            let payload = line.as_bytes().to_vec();
            let content_type = ContentType::infer(&payload);
            let request = Envelope::new(new_id(), payload, content_type);
            client
                .publish(&request, request_topic)
                .await
                .with_context(|| format!("publishing request {}", request.correlation_id))?;
        }

        let mut responses = Vec::with_capacity(lines.len());
        while responses.len() < lines.len() {
            tokio::select! {
                next = responses_rx.recv() => match next {
                    Some(response) => responses.push(response),
                    None => break,
                },
                Some(err) = errors_rx.recv() => {
                    warn!(error = %err, "discarding undecodable response");
                }
                _ = tokio::time::sleep(DRAIN_TIMEOUT) => {
                    bail!(
                        "received {} of {} responses before timing out",
                        responses.len(),
                        lines.len()
                    );
                }
            }
        }
        Ok(responses)
    }

    /// Wait for a termination signal; used when no request input is configured.
    pub async fn serve_until<F: std::future::Future<Output = ()>>(&self, signal: F) {
        info!(trigger = %self.trigger.name(), "serving until termination signal");
        signal.await;
        info!("termination signal received; shutting down");
    }

    /// Stop dispatch, drain in-flight messages and close the backend.
    pub async fn shutdown(self) {
        self.trigger.stop();
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "in-flight messages still running at shutdown"
            );
        }
        if let Err(err) = self.deferred.run().await {
            warn!(error = %err, "backend close reported errors");
        }
    }
}

/// Responses must not land on a topic the trigger itself consumes.
fn check_loopback_topics(config: &WatermillConfig) -> Result<()> {
    if config.publish_topic.trim().is_empty() {
        bail!("a publish topic is required to collect responses");
    }
    for topic in config.subscribe_topic_list() {
        if topic.is_empty() || topic == config.publish_topic {
            bail!(
                "subscribe topic '{topic}' would feed responses on '{}' back into the trigger",
                config.publish_topic
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Write;

    fn config(wire_format: &str) -> WatermillConfig {
        WatermillConfig {
            backend_type: "memory".into(),
            subscribe_topics: "requests".into(),
            publish_topic: "responses".into(),
            wire_format: wire_format.into(),
            ..WatermillConfig::default()
        }
    }

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[tokio::test]
    async fn feed_echoes_every_request() {
        let metrics = Arc::new(TriggerMetrics::new());
        let service = Service::start(
            config("raw"),
            echo_pipeline(),
            TriggerOptions::default(),
            Arc::clone(&metrics),
        )
        .await
        .unwrap();

        let requests = lines(&["hello", r#"{"reading":7}"#, "[1,2]"]);
        let responses = service.feed(&requests).await.unwrap();
        service.shutdown().await;

        let mut payloads: Vec<String> = responses
            .iter()
            .map(|response| String::from_utf8_lossy(&response.payload).into_owned())
            .collect();
        payloads.sort();
        let mut expected = requests.clone();
        expected.sort();
        assert_eq!(payloads, expected);

        let ids: HashSet<&str> = responses
            .iter()
            .map(|response| response.correlation_id.as_str())
            .collect();
        assert_eq!(ids.len(), requests.len());
        assert!(responses.iter().all(|r| r.received_topic == "responses"));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.acked, 3);
        assert_eq!(snapshot.published, 3);
    }

    #[tokio::test]
    async fn feed_works_with_encrypted_edgex_format() {
        let mut cfg = config("edgex");
        cfg.encryption_algorithm = "aes256-sha512".into();
        cfg.encryption_key = "ab".repeat(64);
        let service = Service::start(
            cfg,
            echo_pipeline(),
            TriggerOptions {
                max_in_flight: Some(1),
            },
            Arc::new(TriggerMetrics::new()),
        )
        .await
        .unwrap();

        let responses = service.feed(&lines(&["ping"])).await.unwrap();
        service.shutdown().await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].payload, b"ping");
        assert_eq!(responses[0].content_type, ContentType::Cbor);
    }

    #[tokio::test]
    async fn feed_refuses_topics_that_loop_back() {
        let mut cfg = config("raw");
        cfg.subscribe_topics = "requests, responses".into();
        let service = Service::start(
            cfg,
            echo_pipeline(),
            TriggerOptions::default(),
            Arc::new(TriggerMetrics::new()),
        )
        .await
        .unwrap();
        let err = service.feed(&lines(&["x"])).await.unwrap_err();
        service.shutdown().await;
        assert!(err.to_string().contains("back into the trigger"));
    }

    #[tokio::test]
    async fn non_memory_backend_is_rejected_at_start() {
        let mut cfg = config("raw");
        cfg.backend_type = "kafka".into();
        let result = Service::start(
            cfg,
            echo_pipeline(),
            TriggerOptions::default(),
            Arc::new(TriggerMetrics::new()),
        )
        .await;
        let err = result.err().expect("kafka has no built-in connector");
        assert!(format!("{err:#}").contains("invalid trigger type specified: kafka"));
    }

    #[test]
    fn read_input_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "first\n\n  second  \n").unwrap();
        assert_eq!(read_input(file.path()).unwrap(), lines(&["first", "second"]));
    }
}
