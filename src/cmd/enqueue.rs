//! The `enqueue` subcommand.

use clap::Args;

use crate::{config::Config, prelude::*, queue::TaskQueue};

/// Options for `enqueue`.
#[derive(Debug, Args)]
pub struct EnqueueOpts {
    /// Logical paths to enqueue, e.g. `newsletters/RSNLVHZZ002/page1.jpg`.
    #[clap(required_unless_present = "from_file")]
    pub logical_paths: Vec<String>,

    /// Read logical paths from a listing file, one per line.
    #[clap(long, value_name = "FILE")]
    pub from_file: Option<PathBuf>,

    /// Collection to file the resulting objects under.
    #[clap(long)]
    pub collection: Option<String>,
}

/// The `enqueue` subcommand: add OCR tasks to the shared queue.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_enqueue(config: &Config, opts: &EnqueueOpts) -> Result<()> {
    let queue = TaskQueue::connect(&config.queue_db_url, config.max_attempts, config.claim_lease)
        .await
        .context("failed to open the task queue")?;

    let mut logical_paths = opts.logical_paths.clone();
    if let Some(listing) = &opts.from_file {
        let contents = tokio::fs::read_to_string(listing)
            .await
            .with_context(|| format!("failed to read listing file {}", listing.display()))?;
        logical_paths.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_owned),
        );
    }

    for logical_path in &logical_paths {
        let job_id = queue
            .enqueue(logical_path, opts.collection.as_deref())
            .await
            .with_context(|| format!("failed to enqueue {logical_path:?}"))?;
        println!(
            "{}",
            serde_json::json!({ "job_id": job_id, "logical_path": logical_path })
        );
    }
    info!(count = logical_paths.len(), "tasks enqueued");
    Ok(())
}
