//! ---
//! ems_section: "08-observability-telemetry"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Per-trigger counters and prometheus exporter."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};

/// Point-in-time view of a trigger's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TriggerSnapshot {
    /// Transport messages taken off subscriptions.
    pub received: u64,
    /// Messages acknowledged after processing.
    pub acked: u64,
    /// Messages negatively acknowledged.
    pub nacked: u64,
    /// Responses published to the publish topic.
    pub published: u64,
    /// Background messages published.
    pub background_published: u64,
    /// Background messages that failed to marshal or publish.
    pub background_failed: u64,
}

/// Counters owned by one trigger instance.
#[derive(Default)]
pub struct TriggerMetrics {
    received: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    published: AtomicU64,
    background_published: AtomicU64,
    background_failed: AtomicU64,
    exporter: Option<Arc<TriggerMetricsExporter>>,
}

impl TriggerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters that also feed a prometheus exporter.
    pub fn with_exporter(exporter: Arc<TriggerMetricsExporter>) -> Self {
        Self {
            exporter: Some(exporter),
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> TriggerSnapshot {
        TriggerSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            background_published: self.background_published.load(Ordering::Relaxed),
            background_failed: self.background_failed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.received.inc();
        }
    }

    pub(crate) fn record_ack(&self, elapsed: Duration) {
        self.acked.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.acked.inc();
            exporter.processing.observe(elapsed.as_secs_f64());
        }
    }

    pub(crate) fn record_nack(&self) {
        self.nacked.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.nacked.inc();
        }
    }

    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.published.inc();
        }
    }

    pub(crate) fn record_background(&self, ok: bool) {
        let counter = if ok {
            &self.background_published
        } else {
            &self.background_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            if ok {
                exporter.background_published.inc();
            } else {
                exporter.background_failed.inc();
            }
        }
    }
}

/// Prometheus metric handles for trigger activity.
pub struct TriggerMetricsExporter {
    received: IntCounter,
    acked: IntCounter,
    nacked: IntCounter,
    published: IntCounter,
    background_published: IntCounter,
    background_failed: IntCounter,
    processing: Histogram,
}

impl TriggerMetricsExporter {
    /// Register trigger metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let received = counter(
            "edgewire_messages_received_total",
            "Transport messages received from subscriptions",
        )?;
        let acked = counter("edgewire_messages_acked_total", "Messages acknowledged")?;
        let nacked = counter(
            "edgewire_messages_nacked_total",
            "Messages negatively acknowledged",
        )?;
        let published = counter(
            "edgewire_responses_published_total",
            "Pipeline responses published",
        )?;
        let background_published = counter(
            "edgewire_background_published_total",
            "Background messages published",
        )?;
        let background_failed = counter(
            "edgewire_background_failed_total",
            "Background messages that could not be published",
        )?;
        let processing = Histogram::with_opts(HistogramOpts::new(
            "edgewire_processing_seconds",
            "Time from receipt to acknowledgement",
        ))?;
        registry.register(Box::new(processing.clone()))?;

        Ok(Self {
            received,
            acked,
            nacked,
            published,
            background_published,
            background_failed,
            processing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let metrics = TriggerMetrics::new();
        metrics.record_received();
        metrics.record_received();
        metrics.record_ack(Duration::from_millis(1));
        metrics.record_nack();
        metrics.record_background(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.acked, 1);
        assert_eq!(snapshot.nacked, 1);
        assert_eq!(snapshot.background_failed, 1);
        assert_eq!(snapshot.published, 0);
    }

    #[test]
    fn exporter_receives_events() {
        let registry = Registry::new();
        let exporter =
            Arc::new(TriggerMetricsExporter::register(&registry).expect("register metrics"));
        let metrics = TriggerMetrics::with_exporter(exporter);
        metrics.record_published();
        metrics.record_ack(Duration::from_millis(5));

        let families = registry.gather();
        let published = families
            .iter()
            .find(|f| f.get_name() == "edgewire_responses_published_total")
            .expect("published counter registered");
        assert_eq!(published.get_metric()[0].get_counter().get_value() as u64, 1);
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry = Registry::new();
        TriggerMetricsExporter::register(&registry).expect("first registration");
        assert!(TriggerMetricsExporter::register(&registry).is_err());
    }
}
