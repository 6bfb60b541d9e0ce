use clap::{Parser, Subcommand};
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use ingest::IngestError;
use ingest::auth::RequestSigner;
use metrics_exporter_statsd::StatsdBuilder;
use queue::config::QueueConfig;
use queue::{Queue, QueueError};
use salt_store::SaltStoreError;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use worker::WorkerError;
use worker::sink::{HttpSink, SinkError};

mod config;

#[derive(Parser)]
#[command(name = "pageview", about = "Privacy-preserving pageview ingestion")]
struct Cli {
    #[arg(long)]
    config_file: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Accept events over HTTP and publish them to the queue
    Ingest,
    /// Consume the queue and deliver batches to the sink
    Worker,
    /// Ingest and worker in one process over an in-memory queue
    Standalone,
    /// Print a signed URL for the ingest endpoint
    Sign {
        #[arg(long)]
        path: String,
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
        /// Unix seconds; defaults to now
        #[arg(long)]
        timestamp: Option<i64>,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    SaltStore(#[from] SaltStoreError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("the memory queue only works with the standalone command")]
    MemoryQueueOutsideStandalone,
    #[error("could not sign URL: {0}")]
    Sign(#[from] ingest::auth::AuthError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected name=value, got {s:?}")),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config_file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Sign is an offline helper and skips the service bootstrap
    if let CliCommand::Sign {
        path,
        params,
        timestamp,
    } = &cli.command
    {
        return match sign(&config, path, params, *timestamp) {
            Ok(url) => {
                println!("{url}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{e}");
                ExitCode::FAILURE
            }
        };
    }

    let _sentry = init_logging(&config.logging);
    if let Some(metrics_config) = &config.metrics {
        if let Err(e) = init_metrics(metrics_config) {
            tracing::error!(error = %e, "Metrics disabled");
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Could not start runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        let shutdown = shutdown_on_signal();
        match cli.command {
            CliCommand::Ingest => run_ingest(config, shutdown).await,
            CliCommand::Worker => run_worker(config, shutdown).await,
            CliCommand::Standalone => run_standalone(config, shutdown).await,
            CliCommand::Sign { .. } => Ok(()),
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Exiting with error");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let guard = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some(&config.prefix))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder)
        .map_err(|_| CliError::Metrics("a global recorder is already installed".into()))?;

    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "Sending metrics to statsd"
    );
    Ok(())
}

/// Cancels the returned token on Ctrl-C or SIGTERM.
fn shutdown_on_signal() -> CancellationToken {
    let token = CancellationToken::new();

    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            ctrl_c_token.cancel();
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let sigterm_token = token.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM");
                    sigterm_token.cancel();
                }
                Err(e) => tracing::warn!(error = %e, "Could not install SIGTERM handler"),
            }
        });
    }

    token
}

fn connect_queue(config: &Config) -> Result<Queue, CliError> {
    let queue_config = config
        .queue
        .as_ref()
        .ok_or(ConfigError::MissingSection("queue"))?;
    if *queue_config == QueueConfig::Memory {
        return Err(CliError::MemoryQueueOutsideStandalone);
    }
    Ok(queue::connect(queue_config)?)
}

async fn run_ingest(config: Config, shutdown: CancellationToken) -> Result<(), CliError> {
    let ingest_config = config
        .ingest
        .clone()
        .ok_or(ConfigError::MissingSection("ingest"))?;
    let publisher = connect_queue(&config)?
        .publisher
        .ok_or(ConfigError::MissingSection("queue.topic"))?;

    ingest::run(ingest_config, publisher, shutdown).await?;
    Ok(())
}

async fn run_worker(config: Config, shutdown: CancellationToken) -> Result<(), CliError> {
    let worker_config = config
        .worker
        .clone()
        .ok_or(ConfigError::MissingSection("worker"))?;
    let salt_store_config = config
        .salt_store
        .as_ref()
        .ok_or(ConfigError::MissingSection("salt_store"))?;
    let subscription = connect_queue(&config)?
        .subscription
        .ok_or(ConfigError::MissingSection("queue.subscription"))?;

    let salt_store = salt_store::get_store(salt_store_config).await?;
    let sink = Arc::new(HttpSink::new(&worker_config.sink)?);

    worker::run(worker_config, subscription, salt_store, sink, shutdown).await?;
    Ok(())
}

/// Stops accepting events first so every event ingest accepted reaches the
/// worker, then drains the worker.
async fn run_standalone(config: Config, shutdown: CancellationToken) -> Result<(), CliError> {
    let ingest_config = config
        .ingest
        .ok_or(ConfigError::MissingSection("ingest"))?;
    let mut worker_config = config
        .worker
        .ok_or(ConfigError::MissingSection("worker"))?;
    // The memory queue goes away with the process
    worker_config.drain_on_shutdown = true;
    let salt_store_config = config
        .salt_store
        .ok_or(ConfigError::MissingSection("salt_store"))?;
    if matches!(config.queue, Some(QueueConfig::PubSub(_))) {
        tracing::warn!("Ignoring queue section, standalone mode uses the memory queue");
    }

    let Queue {
        publisher,
        subscription,
    } = queue::connect(&QueueConfig::Memory)?;
    let publisher = publisher.ok_or(ConfigError::MissingSection("queue"))?;
    let subscription = subscription.ok_or(ConfigError::MissingSection("queue"))?;

    let salt_store = salt_store::get_store(&salt_store_config).await?;
    let sink = Arc::new(HttpSink::new(&worker_config.sink)?);

    let worker_shutdown = CancellationToken::new();
    let worker_task = tokio::spawn(worker::run(
        worker_config,
        subscription,
        salt_store,
        sink,
        worker_shutdown.clone(),
    ));

    let ingest_result = ingest::run(ingest_config, publisher, shutdown).await;
    worker_shutdown.cancel();
    let worker_result = worker_task.await?;

    ingest_result?;
    worker_result?;
    Ok(())
}

fn sign(
    config: &Config,
    path: &str,
    params: &[(String, String)],
    timestamp: Option<i64>,
) -> Result<String, CliError> {
    let secret = config
        .ingest
        .as_ref()
        .and_then(|ingest| ingest.auth.secret.as_deref())
        .ok_or(ConfigError::MissingSection("ingest.auth.secret"))?;

    let params: Vec<(&str, &str)> = params
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect();
    let t = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());

    Ok(RequestSigner::new(secret).sign(path, &params, t)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_sign_command() {
        let cli = Cli::try_parse_from([
            "pageview",
            "--config-file",
            "pageview.yaml",
            "sign",
            "--path",
            "/api/event",
            "--param",
            "site=a",
            "--param",
            "ref=x=y",
            "--timestamp",
            "1700000000",
        ])
        .unwrap();

        let CliCommand::Sign {
            path,
            params,
            timestamp,
        } = cli.command
        else {
            panic!("expected sign command");
        };
        assert_eq!(path, "/api/event");
        assert_eq!(
            params,
            vec![
                ("site".to_string(), "a".to_string()),
                ("ref".to_string(), "x=y".to_string())
            ]
        );
        assert_eq!(timestamp, Some(1_700_000_000));
    }

    #[test]
    fn rejects_malformed_param() {
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=value").is_err());
        assert_eq!(
            parse_param("empty=").unwrap(),
            ("empty".to_string(), String::new())
        );
    }

    #[test]
    fn sign_uses_configured_secret() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(
            tmp,
            r#"
ingest:
    listener:
        host: 127.0.0.1
        port: 8080
    auth:
        secret: s3cret
"#
        )
        .unwrap();
        let config = Config::from_file(tmp.path()).unwrap();

        let url = sign(
            &config,
            "/api/event",
            &[("site".to_string(), "a".to_string())],
            Some(1_700_000_000),
        )
        .unwrap();
        let expected = RequestSigner::new("s3cret")
            .sign("/api/event", &[("site", "a")], 1_700_000_000)
            .unwrap();
        assert_eq!(url, expected);
        assert!(url.starts_with("/api/event?site=a&t=1700000000&mac="));
    }

    #[test]
    fn sign_requires_secret() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert!(matches!(
            sign(&config, "/api/event", &[], Some(0)),
            Err(CliError::Config(ConfigError::MissingSection(_)))
        ));
    }
}
