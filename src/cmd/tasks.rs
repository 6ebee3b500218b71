//! The `tasks` subcommand.

use clap::{Args, Subcommand};
use uuid::Uuid;

use crate::{config::Config, prelude::*, queue::TaskQueue};

/// Options for `tasks`.
#[derive(Debug, Args)]
pub struct TasksOpts {
    #[clap(subcommand)]
    pub action: TasksAction,
}

/// Queue inspection and control actions.
#[derive(Debug, Subcommand)]
pub enum TasksAction {
    /// Print the number of tasks waiting to be claimed.
    Pending,

    /// List dead-lettered tasks with their attempt histories.
    Dead,

    /// Request cancellation of a task. Best-effort: a worker mid-push
    /// finishes its current phase first.
    Cancel {
        /// The job id to cancel.
        job_id: Uuid,
    },
}

/// The `tasks` subcommand: inspect and control the shared queue.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_tasks(config: &Config, opts: &TasksOpts) -> Result<()> {
    let queue = TaskQueue::connect(&config.queue_db_url, config.max_attempts, config.claim_lease)
        .await
        .context("failed to open the task queue")?;

    match &opts.action {
        TasksAction::Pending => {
            println!("{}", queue.pending_count().await?);
        }
        TasksAction::Dead => {
            for task in queue.dead_letters().await? {
                println!("{}", serde_json::to_string(&task)?);
            }
        }
        TasksAction::Cancel { job_id } => {
            if queue.request_cancel(*job_id).await? {
                println!("cancellation requested for {job_id}");
            } else {
                anyhow::bail!("no task with job id {job_id}");
            }
        }
    }
    Ok(())
}
