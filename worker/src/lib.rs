//! The batch worker: consumes raw page hits from the queue, attaches a daily
//! rotating session signature and device/referrer classification, and delivers
//! them to the sink in batches with at-least-once semantics.
pub mod batch;
pub mod config;
pub mod errors;
pub mod metrics_defs;
pub mod session;
pub mod sink;
pub mod transform;
pub mod worker;

#[cfg(test)]
mod testutils;

pub use errors::WorkerError;

use config::WorkerConfig;
use metrics_defs::SALTS_CLEANED;
use queue::Subscription;
use salt_store::SaltStore;
use session::SessionSignatureGenerator;
use shared::admin_service::AdminService;
use shared::counter;
use shared::http::run_http_service;
use sink::Sink;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use worker::{BatchSettings, BatchWorker};

/// Runs the worker until `shutdown` is cancelled and every pending batch has
/// been settled. The admin listener, when configured, keeps serving until then
/// and reports not ready while draining.
pub async fn run(
    config: WorkerConfig,
    subscription: Arc<dyn Subscription>,
    salt_store: Arc<dyn SaltStore>,
    sink: Arc<dyn Sink>,
    shutdown: CancellationToken,
) -> Result<(), WorkerError> {
    config.validate()?;

    let ready = Arc::new(AtomicBool::new(false));
    let admin_shutdown = CancellationToken::new();
    let admin_task = config.admin_listener.clone().map(|listener| {
        let service = AdminService::<WorkerError>::new(ready.clone());
        let admin_shutdown = admin_shutdown.clone();
        tokio::spawn(async move {
            run_http_service(&listener.host, listener.port, service, admin_shutdown).await
        })
    });

    let cleanup_task = config.salt_cleanup_interval_secs.map(|secs| {
        tokio::spawn(run_salt_cleanup(
            salt_store.clone(),
            Duration::from_secs(secs),
            shutdown.clone(),
        ))
    });

    let worker = BatchWorker::new(
        subscription,
        sink,
        SessionSignatureGenerator::new(salt_store),
        BatchSettings::from_config(&config),
    );

    {
        let ready = ready.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            ready.store(false, Ordering::Relaxed);
        });
    }
    ready.store(true, Ordering::Relaxed);
    tracing::info!(
        max_batch_size = config.max_batch_size,
        flush_interval_ms = config.flush_interval_ms,
        destination = %config.sink.destination,
        "Worker started"
    );

    worker.run(shutdown).await;

    if let Some(task) = cleanup_task {
        task.await?;
    }
    admin_shutdown.cancel();
    if let Some(task) = admin_task {
        task.await??;
    }
    Ok(())
}

/// Removes salts from previous days on every tick, starting immediately.
async fn run_salt_cleanup(
    store: Arc<dyn SaltStore>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => match store.cleanup().await {
                Ok(removed) => {
                    counter!(SALTS_CLEANED).increment(removed as u64);
                    if removed > 0 {
                        tracing::info!(removed, "Removed expired salts");
                    }
                }
                Err(e) => tracing::error!(error = %e, "Salt cleanup failed"),
            },
        }
    }
}
