//! Durable task queue shared by the worker pool.
//!
//! The queue is the single shared mutable resource: all coordination
//! (claim, ack, requeue, dead-letter, cancellation) goes through it, and
//! workers never talk to each other. Delivery is at-least-once with
//! explicit acknowledgment; the claim operation is a single atomic
//! `UPDATE ... RETURNING`, so no two workers ever hold the same task.

use std::str::FromStr;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use sqlx::{
    Row,
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
};
use uuid::Uuid;

use crate::{
    error::{RelayError, RelayResult},
    prelude::*,
};

/// A unit of work: one logical path to OCR and push.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Task {
    /// Unique job identifier.
    pub job_id: Uuid,

    /// The logical path to resolve and process.
    pub logical_path: String,

    /// The target collection, if any.
    pub collection_id: Option<String>,

    /// How many attempts have already failed.
    pub attempt_count: u32,
}

/// What happened to a task handed back after a transient failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// The task is visible again for another worker to claim.
    Requeued { attempt_count: u32 },

    /// The task exhausted its attempts and was moved aside for manual
    /// inspection. It will never be retried automatically.
    DeadLettered,
}

/// A dead-lettered task, reported with its accumulated attempt history.
#[derive(Clone, Debug, Serialize)]
pub struct DeadLetteredTask {
    pub job_id: Uuid,
    pub logical_path: String,
    pub collection_id: Option<String>,
    pub attempt_count: u32,
    pub attempt_history: Vec<String>,
    pub last_error_kind: String,
}

/// Handle to the shared queue database.
#[derive(Clone)]
pub struct TaskQueue {
    pool: SqlitePool,
    max_attempts: u32,
    claim_lease: Duration,
}

impl TaskQueue {
    /// Open (and if necessary create) the queue database.
    ///
    /// `claim_lease` bounds how long a claim may sit without reaching a
    /// terminal state before another worker may reclaim it.
    pub async fn connect(
        url: &str,
        max_attempts: u32,
        claim_lease: Duration,
    ) -> RelayResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(RelayError::Queue)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        // SQLite serializes writers anyway; a single pooled connection also
        // keeps `sqlite::memory:` databases coherent in tests.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let queue = Self {
            pool,
            max_attempts,
            claim_lease,
        };
        queue.migrate().await?;
        Ok(queue)
    }

    async fn migrate(&self) -> RelayResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                job_id TEXT PRIMARY KEY,
                logical_path TEXT NOT NULL,
                collection_id TEXT,
                state TEXT NOT NULL DEFAULT 'enqueued',
                attempt_count INTEGER NOT NULL DEFAULT 0,
                attempt_history TEXT NOT NULL DEFAULT '[]',
                last_error_kind TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                claimed_by TEXT,
                claimed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks (state, created_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Add a task to the queue. Returns its job id.
    #[instrument(level = "debug", skip(self))]
    pub async fn enqueue(
        &self,
        logical_path: &str,
        collection_id: Option<&str>,
    ) -> RelayResult<Uuid> {
        let job_id = Uuid::new_v4();
        let now = now_timestamp();
        sqlx::query(
            "INSERT INTO tasks (job_id, logical_path, collection_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
        )
        .bind(job_id.to_string())
        .bind(logical_path)
        .bind(collection_id)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        debug!(%job_id, logical_path, "enqueued task");
        Ok(job_id)
    }

    /// Atomically claim the oldest enqueued task, if any. Tasks with a
    /// pending cancellation request are never handed out.
    pub async fn claim_next(&self, worker_id: &str) -> RelayResult<Option<Task>> {
        self.reclaim_expired().await?;
        let now = now_timestamp();
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET state = 'claimed', claimed_by = ?1, claimed_at = ?2, updated_at = ?2
            WHERE job_id = (
                SELECT job_id FROM tasks
                WHERE state = 'enqueued' AND cancel_requested = 0
                ORDER BY created_at, rowid
                LIMIT 1
            )
            RETURNING job_id, logical_path, collection_id, attempt_count
            "#,
        )
        .bind(worker_id)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Task {
                job_id: parse_job_id(row.try_get("job_id")?)?,
                logical_path: row.try_get("logical_path")?,
                collection_id: row.try_get("collection_id")?,
                attempt_count: row.try_get::<i64, _>("attempt_count")? as u32,
            })
        })
        .transpose()
    }

    /// Hand back claims older than the lease. The claiming worker crashed
    /// or lost the task; the claim counts as a failed attempt, so a task
    /// that keeps killing its workers still ends up dead-lettered.
    async fn reclaim_expired(&self) -> RelayResult<()> {
        let now = now_timestamp();
        let lease_secs = self.claim_lease.as_secs() as i64;
        let cutoff = (Utc::now() - chrono::Duration::seconds(lease_secs))
            .to_rfc3339_opts(SecondsFormat::Micros, true);

        sqlx::query(
            "UPDATE tasks
             SET state = 'dead_lettered', claimed_by = NULL,
                 attempt_count = attempt_count + 1,
                 last_error_kind = 'lease_expired', updated_at = ?1
             WHERE state = 'claimed' AND claimed_at <= ?2
               AND attempt_count + 1 >= ?3",
        )
        .bind(&now)
        .bind(&cutoff)
        .bind(self.max_attempts as i64)
        .execute(&self.pool)
        .await?;

        let reclaimed = sqlx::query(
            "UPDATE tasks
             SET state = 'enqueued', claimed_by = NULL,
                 attempt_count = attempt_count + 1,
                 last_error_kind = 'lease_expired', updated_at = ?1
             WHERE state = 'claimed' AND claimed_at <= ?2",
        )
        .bind(&now)
        .bind(&cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if reclaimed > 0 {
            warn!(reclaimed, "reclaimed expired task claims");
        }
        Ok(())
    }

    /// Acknowledge a task after a successful push. The task is permanently
    /// removed.
    pub async fn ack(&self, job_id: Uuid) -> RelayResult<()> {
        sqlx::query("DELETE FROM tasks WHERE job_id = ?1")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Hand a claimed task back after a transient failure. The attempt is
    /// recorded; the task becomes visible again unless it has exhausted its
    /// attempts, in which case it is dead-lettered.
    pub async fn requeue(&self, job_id: Uuid, error: &RelayError) -> RelayResult<RequeueOutcome> {
        let attempt_count = self.record_failure(job_id, error).await?;
        if attempt_count >= self.max_attempts {
            self.mark_dead_lettered(job_id).await?;
            Ok(RequeueOutcome::DeadLettered)
        } else {
            sqlx::query(
                "UPDATE tasks SET state = 'enqueued', claimed_by = NULL, updated_at = ?1
                 WHERE job_id = ?2",
            )
            .bind(now_timestamp())
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;
            Ok(RequeueOutcome::Requeued { attempt_count })
        }
    }

    /// Dead-letter a claimed task immediately (fatal error or cancellation).
    pub async fn dead_letter(&self, job_id: Uuid, error: &RelayError) -> RelayResult<()> {
        self.record_failure(job_id, error).await?;
        self.mark_dead_lettered(job_id).await
    }

    /// Append the error to the attempt history and bump the attempt count.
    async fn record_failure(&self, job_id: Uuid, error: &RelayError) -> RelayResult<u32> {
        let row = sqlx::query(
            "SELECT attempt_count, attempt_history FROM tasks WHERE job_id = ?1",
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RelayError::Internal(format!("unknown task {job_id}")))?;

        let attempt_count = row.try_get::<i64, _>("attempt_count")? as u32 + 1;
        let mut history: Vec<String> =
            serde_json::from_str(row.try_get::<String, _>("attempt_history")?.as_str())
                .unwrap_or_default();
        history.push(error.to_string());
        let history = serde_json::to_string(&history)
            .map_err(|e| RelayError::Internal(format!("failed to encode history: {e}")))?;

        sqlx::query(
            "UPDATE tasks
             SET attempt_count = ?1, attempt_history = ?2, last_error_kind = ?3, updated_at = ?4
             WHERE job_id = ?5",
        )
        .bind(attempt_count as i64)
        .bind(history)
        .bind(error.kind())
        .bind(now_timestamp())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(attempt_count)
    }

    async fn mark_dead_lettered(&self, job_id: Uuid) -> RelayResult<()> {
        sqlx::query(
            "UPDATE tasks SET state = 'dead_lettered', claimed_by = NULL, updated_at = ?1
             WHERE job_id = ?2",
        )
        .bind(now_timestamp())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        warn!(%job_id, "task dead-lettered");
        Ok(())
    }

    /// Request cancellation of a task. Best-effort: a worker already past
    /// its last cancellation check will finish the current phase.
    pub async fn request_cancel(&self, job_id: Uuid) -> RelayResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET cancel_requested = 1, updated_at = ?1 WHERE job_id = ?2",
        )
        .bind(now_timestamp())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Has cancellation been requested for this task?
    pub async fn is_cancel_requested(&self, job_id: Uuid) -> RelayResult<bool> {
        let row = sqlx::query("SELECT cancel_requested FROM tasks WHERE job_id = ?1")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|row| row.try_get::<i64, _>("cancel_requested"))
            .transpose()?
            .unwrap_or(0)
            != 0)
    }

    /// How many tasks are waiting to be claimed.
    pub async fn pending_count(&self) -> RelayResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM tasks WHERE state = 'enqueued'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// All dead-lettered tasks, with attempt history and last error kind.
    pub async fn dead_letters(&self) -> RelayResult<Vec<DeadLetteredTask>> {
        let rows = sqlx::query(
            "SELECT job_id, logical_path, collection_id, attempt_count,
                    attempt_history, last_error_kind
             FROM tasks WHERE state = 'dead_lettered'
             ORDER BY updated_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DeadLetteredTask {
                    job_id: parse_job_id(row.try_get("job_id")?)?,
                    logical_path: row.try_get("logical_path")?,
                    collection_id: row.try_get("collection_id")?,
                    attempt_count: row.try_get::<i64, _>("attempt_count")? as u32,
                    attempt_history: serde_json::from_str(
                        row.try_get::<String, _>("attempt_history")?.as_str(),
                    )
                    .unwrap_or_default(),
                    last_error_kind: row
                        .try_get::<Option<String>, _>("last_error_kind")?
                        .unwrap_or_default(),
                })
            })
            .collect()
    }
}

/// Current time in one fixed-width sortable format, so string comparison
/// in SQL matches chronological order.
fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_job_id(raw: String) -> RelayResult<Uuid> {
    Uuid::parse_str(&raw).map_err(|e| RelayError::Internal(format!("bad job id {raw:?}: {e}")))
}
