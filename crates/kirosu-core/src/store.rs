//! Durable task queue over a single SQLite file.
//!
//! A fixed pool of five connections backs all callers; WAL journaling with
//! `synchronous = NORMAL` keeps commits cheap, and a 3 s busy timeout absorbs
//! write contention. The lease path is a single atomic
//! `UPDATE ... WHERE task_id IN (SELECT ...) RETURNING *` statement, so two
//! concurrent leases can never hand out the same row. No connection is ever
//! held across network I/O; handles live only inside these methods.

use crate::{now_ts, Error, Result, Stats, Task, TaskStatus};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;

const POOL_SIZE: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(3);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
  task_id INTEGER PRIMARY KEY AUTOINCREMENT,
  prompt TEXT NOT NULL,
  system_prompt TEXT,
  type TEXT NOT NULL DEFAULT 'chat',
  status TEXT NOT NULL,
  created_at REAL NOT NULL,
  updated_at REAL NOT NULL,
  leased_until REAL,
  worker_id TEXT,
  result TEXT,
  error TEXT
)
"#;

// Composite index keeping lease() O(log n + k) as the table grows.
const LEASE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_tasks_status_leased_until
ON tasks(status, leased_until)
"#;

#[derive(Debug, Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Open (creating if missing) the store at `path` and ensure the schema.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;
        sqlx::query(LEASE_INDEX).execute(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert a new `queued` row and return its id.
    pub async fn enqueue(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        task_type: &str,
    ) -> Result<i64> {
        let now = now_ts();
        let row = sqlx::query(
            r#"
            INSERT INTO tasks (prompt, system_prompt, type, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'queued', ?4, ?4)
            RETURNING task_id
            "#,
        )
        .bind(prompt)
        .bind(system_prompt)
        .bind(task_type)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("task_id")?)
    }

    /// Atomically lease up to `max_tasks` rows to `worker_id`.
    ///
    /// Eligible rows are `queued` rows plus `leased` rows whose lease has
    /// expired, picked FIFO by `task_id`. Returned rows are sorted ascending
    /// by `task_id`.
    pub async fn lease(
        &self,
        worker_id: &str,
        max_tasks: i64,
        lease_seconds: i64,
    ) -> Result<Vec<Task>> {
        // SQLite reads a negative LIMIT as "unbounded", so a non-positive
        // max_tasks must short-circuit here.
        if max_tasks <= 0 {
            return Ok(Vec::new());
        }

        let now = now_ts();
        let leased_until = now + lease_seconds as f64;
        let rows = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'leased', updated_at = ?1, leased_until = ?2, worker_id = ?3
            WHERE task_id IN (
              SELECT task_id FROM tasks
              WHERE status = 'queued'
                 OR (status = 'leased' AND leased_until IS NOT NULL AND leased_until < ?1)
              ORDER BY task_id ASC
              LIMIT ?4
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(leased_until)
        .bind(worker_id)
        .bind(max_tasks)
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = rows.iter().map(row_to_task).collect::<Result<Vec<_>>>()?;
        // RETURNING does not promise row order.
        tasks.sort_by_key(|task| task.task_id);
        Ok(tasks)
    }

    /// Write a terminal state for `task_id`.
    ///
    /// Unconditional: a late ack from a worker whose lease expired still
    /// lands (last writer wins), and acking an unknown id is a no-op.
    pub async fn ack(
        &self,
        task_id: i64,
        status: &str,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let status = match status.trim().to_ascii_lowercase().as_str() {
            "done" => TaskStatus::Done,
            "failed" => TaskStatus::Failed,
            _ => return Err(Error::BadRequest("status must be done|failed".to_string())),
        };

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?1, updated_at = ?2, leased_until = NULL, result = ?3, error = ?4
            WHERE task_id = ?5
            "#,
        )
        .bind(status.as_str())
        .bind(now_ts())
        .bind(result)
        .bind(error)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Force a non-terminal row to `done` without execution.
    ///
    /// Terminal rows are left untouched so that `done`/`failed` only ever
    /// change through `retry_all_failed`.
    pub async fn approve(&self, task_id: i64, approver: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'done', updated_at = ?1, leased_until = NULL, result = ?2, worker_id = ?3
            WHERE task_id = ?4 AND status NOT IN ('done', 'failed')
            "#,
        )
        .bind(now_ts())
        .bind(format!("Approved by {approver}"))
        .bind(approver)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// List rows newest-first, optionally filtered by status.
    ///
    /// `limit <= 0` means unbounded.
    pub async fn list(&self, status: Option<TaskStatus>, limit: i64) -> Result<Vec<Task>> {
        let limit = if limit <= 0 { -1 } else { limit };
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM tasks WHERE status = ?1 ORDER BY task_id DESC LIMIT ?2",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM tasks ORDER BY task_id DESC LIMIT ?1")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(row_to_task).collect()
    }

    /// Per-status counts plus derived throughput metrics.
    pub async fn stats(&self) -> Result<Stats> {
        let mut stats = Stats::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.as_str() {
                "queued" => stats.queued = n,
                "leased" => stats.leased = n,
                "done" => stats.done = n,
                "failed" => stats.failed = n,
                _ => {}
            }
            stats.total_tasks += n;
        }

        let hour_ago = now_ts() - 3600.0;
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM tasks WHERE status = 'done' AND updated_at > ?1",
        )
        .bind(hour_ago)
        .fetch_one(&self.pool)
        .await?;
        stats.completed_last_hour = row.try_get("n")?;

        let row =
            sqlx::query("SELECT AVG(updated_at - created_at) AS avg_secs FROM tasks WHERE status = 'done'")
                .fetch_one(&self.pool)
                .await?;
        let avg_secs: Option<f64> = row.try_get("avg_secs")?;
        stats.avg_completion_time_sec = round2(avg_secs.unwrap_or(0.0));

        let attempted = stats.done + stats.failed;
        stats.error_rate_percent = if attempted > 0 {
            round2(100.0 * stats.failed as f64 / attempted as f64)
        } else {
            0.0
        };

        Ok(stats)
    }

    /// Reset every `failed` row to `queued`, clearing lease and outcome
    /// columns. Returns the number of rows reset.
    pub async fn retry_all_failed(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'queued', updated_at = ?1, leased_until = NULL,
                worker_id = NULL, result = NULL, error = NULL
            WHERE status = 'failed'
            "#,
        )
        .bind(now_ts())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let status: String = row.try_get("status")?;
    Ok(Task {
        task_id: row.try_get("task_id")?,
        prompt: row.try_get("prompt")?,
        system_prompt: row.try_get("system_prompt")?,
        task_type: row.try_get("type")?,
        status: status.parse()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        leased_until: row.try_get("leased_until")?,
        worker_id: row.try_get("worker_id")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
