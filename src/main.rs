//! herald - notification rule matching and dispatch for bus messages.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use herald::cli::{Cli, LogFormat};
use herald::config::{Config, RuntimeConfig};
use herald::error::ConfigError;
use herald::metrics::initialize_metrics;
use herald::notify::{ChannelSendQueue, NotificationWorker, SinkRegistry};
use herald::requester::Requester;
use herald::rules::{PredicateRegistry, RuleSetLoader, YamlRuleRepository};
use herald::source::{JsonLinesSource, MessageSource};
use herald::tracked::TrackedCache;
use herald::{Consumer, Dispatcher, MetricsServer, Pipeline};

/// How long the worker may keep delivering queued notifications after input ends.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Initialize the tracing subscriber with the specified log format.
fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    match format {
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .flatten_event(true)
                .with_env_filter(filter)
                .init();
        }
    }
}

fn log_errors(errors: &[ConfigError], what: &str) {
    for e in errors {
        error!(error = %e, "{} error", what);
    }
    error!(error_count = errors.len(), "{} failed", what);
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    info!(config_path = %cli.config.display(), "Loading configuration");

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, path = %cli.config.display(), "Failed to load configuration");
            std::process::exit(1);
        }
    };

    info!("Validating configuration");
    if let Err(errors) = config.validate() {
        log_errors(&errors, "Configuration validation");
        std::process::exit(1);
    }

    let runtime_config = config.compile(&cli.config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    if cli.validate {
        let ok = runtime.block_on(validate_rules(&runtime_config));
        if !ok {
            std::process::exit(1);
        }
        println!("Configuration is valid: {}", cli.config.display());
        println!("  Rules file: {}", runtime_config.rules_path.display());
        println!("  Services: {}", runtime_config.services.len());
        println!("  Templates: {}", runtime_config.templates.len());
        println!("  Sinks: {}", runtime_config.sinks.len());
        println!(
            "  Metrics: {} (port {})",
            if runtime_config.metrics.enabled {
                "enabled"
            } else {
                "disabled"
            },
            runtime_config.metrics.port
        );
        return Ok(());
    }

    info!(config_path = %cli.config.display(), "herald starting");
    runtime.block_on(run(runtime_config, cli))
}

/// Check every rule of the rules file, disabled ones included.
async fn validate_rules(runtime_config: &RuntimeConfig) -> bool {
    let repository = YamlRuleRepository::new(&runtime_config.rules_path);
    let rules = match repository.load_all().await {
        Ok(rules) => rules,
        Err(e) => {
            error!(error = %e, "Failed to load rules");
            return false;
        }
    };

    let loader = RuleSetLoader::new(
        Arc::new(repository),
        Arc::new(PredicateRegistry::default()),
    );
    let errors = loader.validate(&rules);
    if !errors.is_empty() {
        log_errors(&errors, "Rule validation");
        return false;
    }

    println!(
        "Rules are valid: {} ({} enabled)",
        rules.len(),
        rules.iter().filter(|r| r.enabled).count()
    );
    true
}

async fn run(runtime_config: RuntimeConfig, cli: Cli) -> Result<()> {
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let requester = match Requester::from_config(
        runtime_config.requester.clone(),
        &runtime_config.services,
        http_client.clone(),
    ) {
        Ok(r) => Arc::new(r),
        Err(errors) => {
            log_errors(&errors, "Service configuration");
            anyhow::bail!("invalid service configuration");
        }
    };

    let sinks = match SinkRegistry::from_config(&runtime_config.sinks, http_client) {
        Ok(s) => Arc::new(s),
        Err(errors) => {
            log_errors(&errors, "Sink configuration");
            anyhow::bail!("invalid sink configuration");
        }
    };
    if sinks.is_empty() {
        warn!("No sinks configured, notifications will be dropped by the worker");
    }

    let cancel = CancellationToken::new();

    let metrics_handle = if runtime_config.metrics.enabled {
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let server = MetricsServer::with_ready_signal(runtime_config.metrics.port, ready_tx);
        let cancel_metrics = cancel.clone();
        info!(port = runtime_config.metrics.port, "Starting metrics server");
        let handle = tokio::spawn(async move {
            if let Err(e) = server.run(cancel_metrics).await {
                error!(error = %e, "Metrics server error");
            }
        });
        if ready_rx.await.is_ok() {
            let protocols: Vec<&str> = sinks.protocols().collect();
            initialize_metrics(&protocols);
        }
        Some(handle)
    } else {
        info!("Metrics server disabled");
        None
    };

    let (queue, rx) = ChannelSendQueue::new(runtime_config.dispatch.queue_capacity);
    let mut worker = NotificationWorker::new(rx, sinks);
    let worker_cancel = cancel.clone();
    let worker_handle = tokio::spawn(async move {
        worker.run(worker_cancel).await;
    });

    let loader = RuleSetLoader::new(
        Arc::new(YamlRuleRepository::new(&runtime_config.rules_path)),
        Arc::new(PredicateRegistry::default()),
    );
    let cache = Arc::new(TrackedCache::new(loader, runtime_config.tracked.clone()));

    // Build the first snapshot before reading messages.
    if let Err(e) = cache.get_tracked(&requester).await {
        warn!(error = %e, "Initial rule load failed, retrying on first message");
    }

    let dispatcher = Arc::new(Dispatcher::new(
        requester,
        cache,
        Pipeline::from_config(&runtime_config),
        Arc::new(queue),
    ));
    let consumer = Consumer::new(dispatcher);

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c signal");
            return;
        }
        info!("Received shutdown signal, initiating graceful shutdown");
        cancel_clone.cancel();
    });

    let mut source: Box<dyn MessageSource> = match &cli.input {
        Some(path) => {
            info!(path = %path.display(), "Reading messages from file");
            let file = tokio::fs::File::open(path).await?;
            Box::new(JsonLinesSource::new(BufReader::new(file)))
        }
        None => {
            info!("Reading messages from stdin");
            Box::new(JsonLinesSource::new(BufReader::new(tokio::io::stdin())))
        }
    };

    let consumer_result = consumer.run(source.as_mut(), cancel.clone()).await;

    // Dropping the consumer closes the queue so the worker drains and exits.
    drop(consumer);
    info!("Waiting for notification worker to drain queue...");
    if tokio::time::timeout(DRAIN_TIMEOUT, worker_handle).await.is_err() {
        warn!("Notification worker did not drain in time");
    }

    cancel.cancel();
    if let Some(handle) = metrics_handle {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    match consumer_result {
        Ok(stats) => {
            info!(
                received = stats.received,
                enqueued = stats.enqueued,
                failed = stats.failed,
                "herald shutdown complete"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Consumer error");
            Err(anyhow::anyhow!("Consumer error: {}", e))
        }
    }
}
