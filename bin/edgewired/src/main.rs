//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the edgewire daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
mod loopback;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use edgewire_core::{
    DataProtection, TriggerMetrics, TriggerMetricsExporter, TriggerOptions, WatermillConfig,
};
use edgewire_logging::{init_tracing, LogFormat, LoggingOptions};
use loopback::{echo_pipeline, read_input, Service};
use prometheus::Registry;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "edgewire message trigger daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = CliLogFormat::Json, help = "Console log format")]
    log_format: CliLogFormat,

    #[arg(long, value_name = "DIR", help = "Write a daily rolling JSON log to this directory")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Json,
    Pretty,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::Json => LogFormat::StructuredJson,
            CliLogFormat::Pretty => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(
        about = "Run the echo trigger on the in-process backend",
        long_about = "Run the echo trigger on the in-process memory backend. With --input, each \
non-empty line is published as a request and the responses are printed as \
<correlation id> TAB <payload>; otherwise the trigger serves until ctrl-c or SIGTERM."
    )]
    Run {
        #[arg(long, help = "Bound concurrently processed messages per topic")]
        max_in_flight: Option<usize>,
        #[arg(long, value_name = "FILE", help = "Feed requests from FILE, or stdin when '-'")]
        input: Option<PathBuf>,
    },
    #[command(about = "Validate the configuration and print a summary")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(
        "edgewired",
        &LoggingOptions {
            format: cli.log_format.into(),
            directory: cli.log_dir.clone(),
        },
    )?;

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("res/configuration.toml"));
    candidates.push(PathBuf::from("configs/edgewire.toml"));

    let loaded = WatermillConfig::load_with_source(&candidates)?;
    info!(config_path = %loaded.source.display(), backend = %loaded.config.backend_type, "configuration loaded");

    let command = cli.command.unwrap_or(Commands::Run {
        max_in_flight: None,
        input: None,
    });
    match command {
        Commands::Run {
            max_in_flight,
            input,
        } => run_daemon(loaded.config, max_in_flight, input).await,
        Commands::CheckConfig => {
            render_summary(&loaded.config)?;
            Ok(())
        }
    }
}

async fn run_daemon(
    config: WatermillConfig,
    max_in_flight: Option<usize>,
    input: Option<PathBuf>,
) -> Result<()> {
    let registry = Registry::new();
    let exporter = Arc::new(TriggerMetricsExporter::register(&registry)?);
    let metrics = Arc::new(TriggerMetrics::with_exporter(exporter));

    // read before starting so a bad path fails fast
    let requests = input.as_deref().map(read_input).transpose()?;

    let service = Service::start(
        config,
        echo_pipeline(),
        TriggerOptions { max_in_flight },
        Arc::clone(&metrics),
    )
    .await?;

    let responses = match requests {
        Some(requests) => {
            let fed = service.feed(&requests).await;
            service.shutdown().await;
            fed?
        }
        None => {
            service.serve_until(shutdown_signal()).await;
            service.shutdown().await;
            Vec::new()
        }
    };
    for response in &responses {
        println!(
            "{}\t{}",
            response.correlation_id,
            String::from_utf8_lossy(&response.payload)
        );
    }

    let snapshot = metrics.snapshot();
    info!(
        received = snapshot.received,
        acked = snapshot.acked,
        nacked = snapshot.nacked,
        published = snapshot.published,
        "trigger stopped"
    );
    Ok(())
}

fn render_summary(config: &WatermillConfig) -> Result<()> {
    let protection = DataProtection::from_config(config)?;
    println!("Type: {}", config.backend_type);
    println!("Broker: {}", config.broker_url);
    println!("Subscribe: {:?}", config.subscribe_topic_list());
    println!("Publish: {}", config.publish_topic);
    println!("Wire format: {}", config.wire_format());
    match protection {
        Some(protection) => println!(
            "Encryption: {} (key {})",
            protection.algorithm(),
            protection.fingerprint()
        ),
        None => println!("Encryption: disabled"),
    }
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "unable to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        },
        _ = terminate() => {},
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => {
            warn!(error = %err, "unable to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
