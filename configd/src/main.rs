use clap::{Parser, Subcommand};
use configmap::config::BuildError;
use configmap::{ConfigMapLoader, ConfigMapWatcher, ConfigServer, LoadError, LoadOutcome};
use metrics_exporter_statsd::StatsdBuilder;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

mod config;

use config::{Config, LoggingConfig, MetricsConfig};

#[derive(Parser)]
#[command(version, about = "Toolchain config distribution daemon")]
struct Cli {
    #[arg(long, default_value = "configd.yaml")]
    config_file: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Watch the config bucket and keep the served configs up to date.
    Serve,
    /// Load every runtime once and print the resulting configs as JSON.
    Load,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("invalid log filter: {0}")]
    LogFilter(#[from] tracing_subscriber::filter::ParseError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("could not encode configs: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn init_logging(logging: &LoggingConfig) -> Result<Option<sentry::ClientInitGuard>, CliError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level)?,
    };

    let guard = logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(sentry_layer)
        .init();
    Ok(guard)
}

fn init_metrics(metrics_config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(&metrics_config.statsd_host, metrics_config.statsd_port)
        .build(Some(metrics_config.prefix.as_str()))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;
    shared::metrics_defs::describe_all(configmap::metrics_defs::ALL_METRICS);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config_file) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}: {err}", cli.config_file.display());
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = config.validate() {
        eprintln!("{}: {err}", cli.config_file.display());
        return ExitCode::FAILURE;
    }

    let _sentry = match init_logging(&config.logging) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let result = run(cli.command, config);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "configd failed");
            ExitCode::FAILURE
        }
    }
}

fn run(command: CliCommand, config: Config) -> Result<(), CliError> {
    if let Some(metrics_config) = &config.metrics {
        init_metrics(metrics_config)?;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(async move {
        match command {
            CliCommand::Serve => serve(config).await,
            CliCommand::Load => load_once(config).await,
        }
    })
}

async fn load_once(config: Config) -> Result<(), CliError> {
    let storage = config.configmap.storage_client().await?;
    let bucket = config.configmap.config_map_bucket(storage.clone())?;
    let loader = ConfigMapLoader::new(Arc::new(bucket), config.configmap.config_loader(storage));

    if let LoadOutcome::Updated(resp) = loader.load(&CancellationToken::new(), true).await? {
        println!("{}", serde_json::to_string_pretty(&resp)?);
    }
    Ok(())
}

async fn serve(config: Config) -> Result<(), CliError> {
    let storage = config.configmap.storage_client().await?;
    let bucket = Arc::new(config.configmap.config_map_bucket(storage.clone())?);
    let loader = ConfigMapLoader::new(bucket.clone(), config.configmap.config_loader(storage));
    let server = ConfigServer::new(Arc::new(loader), config.configmap.retry_delay());
    let cancel = CancellationToken::new();

    let watcher = bucket.watcher().await;

    let versions = server.subscribe();
    let admin = AdminService::<_, std::io::Error>::new(move || {
        versions.borrow().as_ref().map(|resp| resp.version_id.clone())
    });
    let listener = config.admin_listener;
    let admin_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            run_http_service(&listener.host, listener.port, admin, cancel.cancelled()).await
        })
    };

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutting down");
                    cancel.cancel();
                }
                Err(err) => error!(error = %err, "could not listen for ctrl-c"),
            }
        });
    }

    server.run(&cancel, watcher.as_ref()).await;
    cancel.cancel();

    if let Err(err) = watcher.close().await {
        error!(error = %err, "failed to close watcher");
    }
    match admin_task.await {
        Ok(result) => result?,
        Err(err) => error!(error = %err, "admin listener task failed"),
    }
    Ok(())
}
