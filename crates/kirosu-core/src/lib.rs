//! Shared core of the kirosu swarm: task model, durable task store, and the
//! line-delimited JSON-RPC envelopes spoken between the hub and its clients.
//!
//! # API notes
//! `kirosu-core` is an internal crate (`publish = false`). Its public API uses
//! `serde_json::Value` for wire payloads and `f64` Unix seconds for all
//! timestamps, matching the on-disk schema and the wire format.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod protocol;
pub mod store;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the task store.
///
/// `Busy` is retryable: the caller hit SQLite write contention beyond the
/// busy timeout. Everything else is either the caller's fault (`BadRequest`)
/// or a backend failure the hub logs and reports.
#[derive(Debug)]
pub enum Error {
    /// Store contention beyond the busy timeout; callers should retry.
    Busy,
    /// Malformed parameter (bad status tag, etc.).
    BadRequest(String),
    /// Underlying storage failure.
    Backend(anyhow::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Busy => write!(f, "store busy"),
            Error::BadRequest(message) => write!(f, "{message}"),
            Error::Backend(err) => write!(f, "store error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Backend(err) => err.source(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Error::Backend(value)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Backend(anyhow::Error::from(value))
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &value {
            let message = db.message();
            if message.contains("database is locked") || message.contains("database table is locked")
            {
                return Error::Busy;
            }
        }
        Error::Backend(anyhow::Error::from(value))
    }
}

/// Task lifecycle state.
///
/// `Done` and `Failed` are terminal; only the bulk `retry_all_failed`
/// operation moves a row out of `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Leased,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Leased => "leased",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "leased" => Ok(TaskStatus::Leased),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(Error::BadRequest(format!("unknown status: {other}"))),
        }
    }
}

/// A task row as stored and as returned on the wire.
///
/// `task_id` is assigned on insert and strictly increasing with insertion
/// order. `leased_until` is present iff `status` is `leased`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: i64,
    pub prompt: String,
    pub system_prompt: Option<String>,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    pub created_at: f64,
    pub updated_at: f64,
    pub leased_until: Option<f64>,
    pub worker_id: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Aggregate queue metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub queued: i64,
    pub leased: i64,
    pub done: i64,
    pub failed: i64,
    pub total_tasks: i64,
    pub completed_last_hour: i64,
    pub avg_completion_time_sec: f64,
    pub error_rate_percent: f64,
}

/// Current wall-clock time as floating-point Unix seconds.
pub fn now_ts() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() -> anyhow::Result<()> {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Leased,
            TaskStatus::Done,
            TaskStatus::Failed,
        ] {
            anyhow::ensure!(status.as_str().parse::<TaskStatus>()? == status);
        }
        anyhow::ensure!(" DONE ".parse::<TaskStatus>()? == TaskStatus::Done);
        anyhow::ensure!("running".parse::<TaskStatus>().is_err());
        Ok(())
    }

    #[test]
    fn task_serializes_type_under_its_wire_name() -> anyhow::Result<()> {
        let task = Task {
            task_id: 7,
            prompt: "hi".to_string(),
            system_prompt: None,
            task_type: "python".to_string(),
            status: TaskStatus::Queued,
            created_at: 1.0,
            updated_at: 1.0,
            leased_until: None,
            worker_id: None,
            result: None,
            error: None,
        };
        let value = serde_json::to_value(&task)?;
        anyhow::ensure!(value["type"] == "python");
        anyhow::ensure!(value["status"] == "queued");
        anyhow::ensure!(value.get("task_type").is_none());
        Ok(())
    }
}
