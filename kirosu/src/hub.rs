//! The hub RPC server: a TCP listener speaking line-delimited JSON-RPC,
//! dispatching queue operations onto the task store.
//!
//! Connections are long-lived and may pipeline requests; responses go out in
//! request order on each connection. Every error short of a socket failure is
//! reported as an `error` line and the connection stays open.

use crate::config::HubConfig;
use anyhow::Context;
use kirosu_core::protocol::{
    AckParams, ApproveParams, EnqueueParams, LeaseParams, ListParams, Request, Response,
};
use kirosu_core::store::TaskStore;
use kirosu_core::{Error as StoreError, TaskStatus};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// Shared-secret env var. When set on the hub, every request must carry a
/// matching `params.auth_token`; when set on a client, it is sent with every
/// request.
pub const SWARM_KEY_ENV: &str = "KIRO_SWARM_KEY";

struct HubState {
    store: TaskStore,
    secret: Option<String>,
    default_lease_seconds: i64,
    shutdown_tx: watch::Sender<bool>,
}

/// A running hub bound to `addr`. Tests bind port 0 and read the real port
/// back from here.
pub struct HubServer {
    pub addr: SocketAddr,
    state: Arc<HubState>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl HubServer {
    pub async fn start(
        store: TaskStore,
        secret: Option<String>,
        default_lease_seconds: i64,
        bind: SocketAddr,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind hub to {bind}"))?;
        let addr = listener.local_addr().context("hub local_addr")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(HubState {
            store,
            secret: secret.filter(|s| !s.is_empty()),
            default_lease_seconds,
            shutdown_tx,
        });

        let join = tokio::spawn(run_hub(listener, state.clone(), shutdown_rx));

        Ok(Self { addr, state, join })
    }

    /// Stop accepting, let in-flight handlers drain, and join the accept loop.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.state.shutdown_tx.send(true);
        self.join.await.context("join hub task")??;
        Ok(())
    }
}

/// CLI entry point: serve until ctrl-c or a `shutdown` RPC.
pub async fn run(cfg: &HubConfig, db_path: &Path) -> anyhow::Result<()> {
    let store = TaskStore::connect(db_path)
        .await
        .with_context(|| format!("open task store at {}", db_path.display()))?;

    let secret = std::env::var(SWARM_KEY_ENV).ok();
    let bind: SocketAddr = format!("{}:{}", cfg.endpoint.host, cfg.endpoint.port)
        .parse()
        .with_context(|| {
            format!(
                "parse hub bind address {}:{}",
                cfg.endpoint.host, cfg.endpoint.port
            )
        })?;

    let server = HubServer::start(store, secret, cfg.lease_seconds, bind).await?;
    tracing::info!(addr = %server.addr, db = %db_path.display(), "hub listening");

    let mut shutdown_rx = server.state.shutdown_tx.subscribe();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("hub shutting down");
        }
        _ = wait_shutdown(&mut shutdown_rx) => {
            tracing::info!("hub stopped by shutdown request");
        }
    }

    server.shutdown().await
}

async fn run_hub(
    listener: TcpListener,
    state: Arc<HubState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            res = listener.accept() => {
                let (socket, peer) = res.context("accept connection")?;
                tracing::debug!(peer = %peer, "client connected");
                handlers.spawn(handle_connection(socket, peer, state.clone()));
            }
            _ = wait_shutdown(&mut shutdown_rx) => break,
        }
    }

    drop(listener);
    while handlers.join_next().await.is_some() {}
    Ok(())
}

async fn wait_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn handle_connection(socket: TcpStream, peer: SocketAddr, state: Arc<HubState>) {
    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::select! {
            res = reader.read_line(&mut line) => res,
            _ = wait_shutdown(&mut shutdown_rx) => break,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(peer = %peer, error = %err, "read error");
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => dispatch(&state, request).await,
            Err(err) => Response::error(Value::Null, format!("bad request: {err}")),
        };

        let mut payload = match serde_json::to_string(&response) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(peer = %peer, error = %err, "encode response");
                break;
            }
        };
        payload.push('\n');

        if let Err(err) = write_half.write_all(payload.as_bytes()).await {
            tracing::debug!(peer = %peer, error = %err, "write error");
            break;
        }
    }

    tracing::debug!(peer = %peer, "client disconnected");
}

async fn dispatch(state: &HubState, request: Request) -> Response {
    if let Some(secret) = &state.secret {
        let token = request.params.get("auth_token").and_then(Value::as_str);
        if token != Some(secret.as_str()) {
            return Response::error(request.id, format!("Invalid {SWARM_KEY_ENV}"));
        }
    }

    let id = request.id.clone();
    match handle_method(state, &request).await {
        Ok(result) => Response::result(id, result),
        Err(message) => Response::error(id, message),
    }
}

async fn handle_method(state: &HubState, request: &Request) -> Result<Value, String> {
    match request.method.as_str() {
        "enqueue" => {
            let params: EnqueueParams = parse_params(&request.params)?;
            let task_id = state
                .store
                .enqueue(
                    &params.prompt,
                    params.system_prompt.as_deref(),
                    &params.task_type,
                )
                .await
                .map_err(store_error)?;
            tracing::info!(task_id, task_type = %params.task_type, "task enqueued");
            Ok(json!({ "task_id": task_id }))
        }
        "lease" => {
            let params: LeaseParams = parse_params(&request.params)?;
            let lease_seconds = params
                .lease_seconds
                .unwrap_or(state.default_lease_seconds);
            let tasks = state
                .store
                .lease(&params.worker_id, params.max_tasks, lease_seconds)
                .await
                .map_err(store_error)?;
            if !tasks.is_empty() {
                tracing::debug!(worker_id = %params.worker_id, count = tasks.len(), "tasks leased");
            }
            Ok(json!({ "tasks": tasks }))
        }
        "ack" => {
            let params: AckParams = parse_params(&request.params)?;
            state
                .store
                .ack(
                    params.task_id,
                    &params.status,
                    params.result.as_deref(),
                    params.error.as_deref(),
                )
                .await
                .map_err(store_error)?;
            tracing::info!(task_id = params.task_id, status = %params.status, "task acked");
            Ok(json!({ "ok": true }))
        }
        "approve" => {
            let params: ApproveParams = parse_params(&request.params)?;
            let approver = params.approver.as_deref().unwrap_or("human");
            state
                .store
                .approve(params.task_id, approver)
                .await
                .map_err(store_error)?;
            tracing::info!(task_id = params.task_id, approver, "task approved");
            Ok(json!({ "ok": true }))
        }
        "list" => {
            let params: ListParams = parse_params(&request.params)?;
            let status = params
                .status
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(str::parse::<TaskStatus>)
                .transpose()
                .map_err(|err| err.to_string())?;
            let tasks = state
                .store
                .list(status, params.limit)
                .await
                .map_err(store_error)?;
            let stats = state.store.stats().await.map_err(store_error)?;
            Ok(json!({ "tasks": tasks, "stats": stats }))
        }
        "stats" => {
            let stats = state.store.stats().await.map_err(store_error)?;
            Ok(json!({ "stats": stats }))
        }
        "retry_all_failed" => {
            let retried = state.store.retry_all_failed().await.map_err(store_error)?;
            tracing::info!(retried, "failed tasks requeued");
            Ok(json!({ "retried": retried }))
        }
        "shutdown" => {
            // The response still goes out on this connection before the
            // accept loop observes the signal.
            let _ = state.shutdown_tx.send(true);
            Ok(json!({ "ok": true }))
        }
        other => Err(format!("unknown method: {other}")),
    }
}

fn parse_params<T: DeserializeOwned>(params: &Value) -> Result<T, String> {
    let value = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params.clone()
    };
    serde_json::from_value(value).map_err(|err| format!("bad request: {err}"))
}

fn store_error(err: StoreError) -> String {
    match &err {
        StoreError::Busy => tracing::warn!("store busy"),
        StoreError::BadRequest(_) => {}
        StoreError::Backend(inner) => tracing::error!(error = %inner, "store failure"),
    }
    err.to_string()
}
