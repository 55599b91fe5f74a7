//! Entry point: parses the CLI flags, loads layered configuration, wires
//! up the processor registry, admission controller, session manager, and
//! dispatcher, then runs until a termination signal drains the agent.

use clap::Parser;
use postprocess_agent::admission::AdmissionController;
use postprocess_agent::broker::stomp_client::StompBroker;
use postprocess_agent::config::{make_config_loader, AgentConfig, TracingConfig};
use postprocess_agent::dispatcher::Dispatcher;
use postprocess_agent::error::SafeDisplay;
use postprocess_agent::metrics::Metrics;
use postprocess_agent::processors::catalog::CatalogProcessor;
use postprocess_agent::processors::reduction::ReductionProcessor;
use postprocess_agent::processors::script_writer::ScriptWriterProcessor;
use postprocess_agent::registry::ProcessorRegistry;
use postprocess_agent::session::{spawn_heartbeat_task, SessionManager};
use postprocess_agent::signal::Shutdown;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Post-processing dispatch agent. Takes no flags beyond the documented
/// configuration-file override (§6 "Process model").
#[derive(Parser, Debug)]
#[command(name = "postprocess-agent", about = "Broker-driven post-processing dispatch agent")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Print the fully-resolved configuration (secrets redacted) and exit.
    #[arg(long)]
    dump_config: bool,

    /// Print the built-in default configuration and exit.
    #[arg(long)]
    dump_default_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.dump_default_config {
        println!("{}", AgentConfig::default().to_safe_string());
        return Ok(());
    }

    let config = make_config_loader(cli.config.as_deref())
        .load()
        .map_err(|e| postprocess_agent::error::AgentError::Config(e.to_string()))?;

    if cli.dump_config {
        println!("{}", config.to_safe_string());
        return Ok(());
    }

    init_tracing(&config.tracing);

    let hostname = gethostname::gethostname().to_string_lossy().into_owned();

    let ignorable_patterns: Vec<Regex> = config
        .resource_limits
        .ignorable_error_patterns
        .iter()
        .map(|pattern| Regex::new(pattern))
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow::anyhow!("invalid ignorable error pattern: {e}"))?;

    let metrics = Metrics::new();

    let mut registry = ProcessorRegistry::new(config.destinations.ping.clone());
    registry.register(Arc::new(ReductionProcessor::new(
        config.destinations.reduction_request.clone(),
        config.destinations.reduction_started.clone(),
        config.destinations.reduction_complete.clone(),
        config.destinations.reduction_error.clone(),
        config.destinations.reduction_disabled.clone(),
        config.filesystem.clone(),
        config.resource_limits.clone(),
        ignorable_patterns,
        config.communication_only,
    )));
    registry.register(Arc::new(ScriptWriterProcessor::new(
        config.destinations.create_script.clone(),
        config.destinations.script_status_topic_template.clone(),
        config.destinations.error.clone(),
        config.filesystem.clone(),
    )));
    if let Some(catalog) = &config.catalog {
        registry.register(Arc::new(CatalogProcessor::new(
            catalog.input_destination.clone(),
            catalog.started_destination.clone(),
            catalog.complete_destination.clone(),
            catalog.error_destination.clone(),
            catalog.endpoint.clone(),
        )));
    }

    let admission = Arc::new(AdmissionController::new(
        config.admission.jobs_per_instrument,
        config.admission.max_concurrent_workers,
        config.admission.slot_poll_interval,
    ));

    let broker = Box::new(StompBroker::new(
        config.broker.url.clone(),
        config.broker.user.clone(),
        config.broker.password.clone(),
    ));
    let session = Arc::new(SessionManager::new(
        broker,
        config.broker.clone(),
        hostname.clone(),
        config.destinations.heartbeat.clone(),
        config.destinations.ping.clone(),
        metrics.clone(),
    ));

    let shutdown = Arc::new(Shutdown::new());
    postprocess_agent::signal::install(shutdown.clone());

    let heartbeat_task = spawn_heartbeat_task(
        session.clone(),
        config.broker.heartbeat_interval,
        shutdown.stop_flag(),
    );

    let metrics_server_task = config
        .metrics
        .enabled
        .then(|| postprocess_agent::metrics_server::spawn(metrics.clone(), config.metrics.bind_address));

    let dispatcher = Dispatcher::new(
        registry,
        admission.clone(),
        session.clone(),
        config.destinations.error.clone(),
        hostname,
        metrics,
    );

    dispatcher.run(&shutdown).await;

    postprocess_agent::signal::drain(
        &admission,
        config.shutdown_drain_timeout,
        Duration::from_secs(1),
    )
    .await;

    heartbeat_task.abort();
    if let Some(task) = metrics_server_task {
        task.abort();
    }
    session.disconnect().await;

    Ok(())
}

fn init_tracing(config: &TracingConfig) {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
