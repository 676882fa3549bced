//! Wire envelopes for the hub's line-delimited JSON-RPC protocol.
//!
//! One request object per `\n`-terminated UTF-8 line, one response line per
//! request, delivered in request order on each connection. The hub never
//! emits unsolicited frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single request line: `{"id": ..., "method": ..., "params": {...}}`.
///
/// `id` is opaque and echoed back verbatim. A `jsonrpc` field is accepted and
/// ignored, as are any other unknown fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// A single response line: exactly one of `result` or `error` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(message.into()),
        }
    }
}

fn default_task_type() -> String {
    "chat".to_string()
}

fn default_max_tasks() -> i64 {
    1
}

fn default_list_limit() -> i64 {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueParams {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(rename = "type", default = "default_task_type")]
    pub task_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaseParams {
    pub worker_id: String,
    #[serde(default = "default_max_tasks")]
    pub max_tasks: i64,
    /// Falls back to the hub's configured default when omitted.
    #[serde(default)]
    pub lease_seconds: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AckParams {
    pub task_id: i64,
    pub status: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApproveParams {
    pub task_id: i64,
    #[serde(default)]
    pub approver: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_list_limit")]
    pub limit: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_accepts_and_ignores_jsonrpc_field() -> anyhow::Result<()> {
        let req: Request = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":"abc","method":"stats","params":{}}"#,
        )?;
        anyhow::ensure!(req.id == json!("abc"));
        anyhow::ensure!(req.method == "stats");
        Ok(())
    }

    #[test]
    fn request_defaults_missing_id_and_params() -> anyhow::Result<()> {
        let req: Request = serde_json::from_str(r#"{"method":"stats"}"#)?;
        anyhow::ensure!(req.id.is_null());
        anyhow::ensure!(req.params.is_null());
        Ok(())
    }

    #[test]
    fn response_serializes_only_the_populated_side() -> anyhow::Result<()> {
        let ok = serde_json::to_value(Response::result(json!(1), json!({"task_id": 5})))?;
        anyhow::ensure!(ok.get("error").is_none());
        anyhow::ensure!(ok["result"]["task_id"] == 5);

        let err = serde_json::to_value(Response::error(json!(1), "nope"))?;
        anyhow::ensure!(err.get("result").is_none());
        anyhow::ensure!(err["error"] == "nope");
        Ok(())
    }

    #[test]
    fn enqueue_params_default_the_task_type() -> anyhow::Result<()> {
        let params: EnqueueParams = serde_json::from_value(json!({"prompt": "hi"}))?;
        anyhow::ensure!(params.task_type == "chat");
        anyhow::ensure!(params.system_prompt.is_none());

        let params: EnqueueParams =
            serde_json::from_value(json!({"prompt": "hi", "type": "python", "auth_token": "k"}))?;
        anyhow::ensure!(params.task_type == "python");
        Ok(())
    }

    #[test]
    fn lease_params_default_max_tasks_and_lease_seconds() -> anyhow::Result<()> {
        let params: LeaseParams = serde_json::from_value(json!({"worker_id": "w1"}))?;
        anyhow::ensure!(params.max_tasks == 1);
        anyhow::ensure!(params.lease_seconds.is_none());
        Ok(())
    }
}
