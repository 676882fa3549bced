//! Client side of the hub protocol: one persistent TCP connection, one
//! request line out, one response line back.

use crate::hub::SWARM_KEY_ENV;
use anyhow::{bail, Context};
use kirosu_core::protocol::{Request, Response};
use kirosu_core::{Stats, Task};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use uuid::Uuid;

pub struct HubClient {
    host: String,
    port: u16,
    auth_token: Option<String>,
    conn: Option<Connection>,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl HubClient {
    /// A client for the hub at `host:port`, sending `KIRO_SWARM_KEY` from the
    /// environment when set.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            auth_token: std::env::var(SWARM_KEY_ENV).ok().filter(|s| !s.is_empty()),
            conn: None,
        }
    }

    /// Override the auth token (tests use this to isolate from the ambient
    /// environment).
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    /// Send one request and read its response, reconnecting once on a dead
    /// socket before surfacing the error. A hub-side `error` is never retried.
    pub async fn call(&mut self, method: &str, params: Value) -> anyhow::Result<Value> {
        let mut params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => bail!("params must be a JSON object, got {other}"),
        };
        if let Some(token) = &self.auth_token {
            params.insert("auth_token".to_string(), Value::String(token.clone()));
        }

        let request = Request {
            id: Value::String(Uuid::new_v4().to_string()),
            method: method.to_string(),
            params: Value::Object(params),
        };
        let mut payload = serde_json::to_string(&request).context("encode request")?;
        payload.push('\n');

        let line = match self.roundtrip(&payload).await {
            Ok(line) => line,
            Err(err) => {
                self.conn = None;
                tracing::debug!(error = %err, "hub connection dropped; retrying once");
                self.roundtrip(&payload).await?
            }
        };

        let response: Response =
            serde_json::from_str(line.trim()).context("decode hub response")?;
        if let Some(error) = response.error {
            bail!("hub error: {error}");
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn roundtrip(&mut self, payload: &str) -> anyhow::Result<String> {
        if self.conn.is_none() {
            let stream = TcpStream::connect((self.host.as_str(), self.port))
                .await
                .with_context(|| format!("connect to hub at {}:{}", self.host, self.port))?;
            let (read_half, write_half) = stream.into_split();
            self.conn = Some(Connection {
                reader: BufReader::new(read_half),
                writer: write_half,
            });
        }
        let conn = self.conn.as_mut().context("hub connection missing")?;

        conn.writer
            .write_all(payload.as_bytes())
            .await
            .context("send request")?;

        let mut line = String::new();
        let read = conn
            .reader
            .read_line(&mut line)
            .await
            .context("read response")?;
        if read == 0 {
            bail!("hub closed the connection");
        }
        Ok(line)
    }

    pub async fn enqueue(
        &mut self,
        prompt: &str,
        system_prompt: Option<&str>,
        task_type: Option<&str>,
    ) -> anyhow::Result<i64> {
        let result = self
            .call(
                "enqueue",
                json!({
                    "prompt": prompt,
                    "system_prompt": system_prompt,
                    "type": task_type.unwrap_or("chat"),
                }),
            )
            .await?;
        result["task_id"]
            .as_i64()
            .context("enqueue response missing task_id")
    }

    pub async fn lease(
        &mut self,
        worker_id: &str,
        max_tasks: i64,
        lease_seconds: i64,
    ) -> anyhow::Result<Vec<Task>> {
        let result = self
            .call(
                "lease",
                json!({
                    "worker_id": worker_id,
                    "max_tasks": max_tasks,
                    "lease_seconds": lease_seconds,
                }),
            )
            .await?;
        serde_json::from_value(result["tasks"].clone()).context("decode leased tasks")
    }

    pub async fn ack(
        &mut self,
        task_id: i64,
        status: &str,
        result: Option<&str>,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        self.call(
            "ack",
            json!({
                "task_id": task_id,
                "status": status,
                "result": result,
                "error": error,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn approve(&mut self, task_id: i64) -> anyhow::Result<()> {
        self.call("approve", json!({ "task_id": task_id })).await?;
        Ok(())
    }

    pub async fn list(
        &mut self,
        status: Option<&str>,
        limit: i64,
    ) -> anyhow::Result<(Vec<Task>, Stats)> {
        let result = self
            .call("list", json!({ "status": status, "limit": limit }))
            .await?;
        let tasks = serde_json::from_value(result["tasks"].clone()).context("decode tasks")?;
        let stats = serde_json::from_value(result["stats"].clone()).context("decode stats")?;
        Ok((tasks, stats))
    }

    pub async fn stats(&mut self) -> anyhow::Result<Stats> {
        let result = self.call("stats", Value::Null).await?;
        serde_json::from_value(result["stats"].clone()).context("decode stats")
    }

    pub async fn retry_all_failed(&mut self) -> anyhow::Result<u64> {
        let result = self.call("retry_all_failed", Value::Null).await?;
        result["retried"]
            .as_u64()
            .context("retry_all_failed response missing count")
    }
}
