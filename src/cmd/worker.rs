//! The `worker` subcommand.

use std::sync::Arc;

use clap::Args;
use tokio::sync::mpsc;

use crate::{
    config::Config,
    ocr::provider_for_name,
    paths::PathResolver,
    prelude::*,
    queue::TaskQueue,
    repository::HttpRepository,
    sync::{PushProtocol, Synchronizer},
    worker::Worker,
};

/// Options for `worker`.
#[derive(Debug, Args)]
pub struct WorkerOpts {
    /// OCR provider to use: `tesseract`, or the name of a vision model
    /// served by the configured endpoint.
    #[clap(long, default_value = "tesseract")]
    pub provider: String,

    /// Push protocol to use when synchronizing results.
    #[clap(long, value_enum, default_value_t = PushProtocol::FileFirst)]
    pub protocol: PushProtocol,

    /// Number of workers to run in this process.
    #[clap(short = 'j', long = "jobs", default_value = "4")]
    pub job_count: usize,
}

/// The `worker` subcommand: run a pool of workers until interrupted.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_worker(config: &Config, opts: &WorkerOpts) -> Result<()> {
    let queue = TaskQueue::connect(&config.queue_db_url, config.max_attempts, config.claim_lease)
        .await
        .context("failed to open the task queue")?;
    let resolver = PathResolver::from_config(config);
    let repository = Arc::new(HttpRepository::from_config(config)?);
    let provider = provider_for_name(&opts.provider, config);

    let mut shutdown_senders = Vec::with_capacity(opts.job_count);
    let mut handles = Vec::with_capacity(opts.job_count);
    for _ in 0..opts.job_count.max(1) {
        let (tx, rx) = mpsc::channel::<()>(1);
        shutdown_senders.push(tx);
        let worker = Worker::new(
            queue.clone(),
            resolver.clone(),
            provider.clone(),
            Synchronizer::new(repository.clone()),
            opts.protocol,
            config.call_timeout,
            config.poll_interval,
        );
        handles.push(tokio::spawn(async move { worker.run(rx).await }));
    }
    info!(workers = handles.len(), "worker pool running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("interrupt received, draining workers");
    for tx in &shutdown_senders {
        // A worker that already exited has dropped its receiver.
        let _ = tx.send(()).await;
    }
    for handle in handles {
        handle.await.context("worker task panicked")??;
    }
    Ok(())
}
