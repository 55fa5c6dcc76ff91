//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Structured logging adapters and sinks."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Tracing setup and message-context logging for edgewire services.

use std::path::PathBuf;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

pub mod macros;

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "EDGEWIRE_LOG";

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Failure while preparing log sinks.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// The log directory could not be created.
    #[error("unable to create log directory {path}: {source}")]
    Directory {
        /// Directory that was requested.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
}

/// Console output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    StructuredJson,
    /// Human readable lines.
    Pretty,
}

/// Options for [`init_tracing`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingOptions {
    /// Console output format.
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for a daily rolling JSON log file; console only when absent.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Initialize a baseline tracing subscriber suitable for development and tests.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(fmt::layer())
        .try_init();
}

/// Filter from `EDGEWIRE_LOG`, then `RUST_LOG`, defaulting to `info`.
pub fn env_filter() -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive ({err}); defaulting to info logging");
            EnvFilter::new("info")
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Install the global subscriber for a service.
///
/// Calling this more than once keeps the first subscriber.
pub fn init_tracing(service_name: &str, options: &LoggingOptions) -> Result<(), LoggingError> {
    let console = match options.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .boxed(),
    };

    let file = match &options.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory).map_err(|source| LoggingError::Directory {
                path: directory.clone(),
                source,
            })?;
            let appender = daily(directory, format!("{service_name}.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .json()
                    .with_writer(writer)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(console)
        .with(file)
        .try_init()
        .ok();

    tracing::info!(service = %service_name, format = ?options.format, "tracing initialised");
    Ok(())
}

/// Message context attached to events by the `ewm_*` macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Topic the message was received on or published to.
    pub topic: Option<&'a str>,
    /// Correlation identifier of the message.
    pub correlation_id: Option<&'a str>,
    /// Pipeline or trigger name handling the message.
    pub pipeline: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a topic.
    pub fn with_topic(mut self, topic: &'a str) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Attach a correlation identifier.
    pub fn with_correlation_id(mut self, correlation_id: &'a str) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Attach a pipeline name.
    pub fn with_pipeline(mut self, pipeline: &'a str) -> Self {
        self.pipeline = Some(pipeline);
        self
    }
}

/// Outcome of a lifecycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The step completed.
    Success,
    /// The step failed or was aborted.
    Fault,
}

impl LifecycleOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            LifecycleOutcome::Success => "success",
            LifecycleOutcome::Fault => "fault",
        }
    }
}

/// Emit a lifecycle event (initialize, stop, cleanup) with its outcome.
pub fn log_lifecycle_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: LifecycleOutcome,
) {
    let ctx = context.cloned().unwrap_or_default();
    let topic = ctx.topic.unwrap_or("");
    let pipeline = ctx.pipeline.unwrap_or("");
    match outcome {
        LifecycleOutcome::Success => tracing::info!(
            event,
            outcome = outcome.as_str(),
            topic,
            pipeline,
            message = %message
        ),
        LifecycleOutcome::Fault => tracing::error!(
            event,
            outcome = outcome.as_str(),
            topic,
            pipeline,
            message = %message
        ),
    }
}
