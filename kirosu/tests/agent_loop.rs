use anyhow::Context;
use async_trait::async_trait;
use kirosu::agent::{KiroAgent, PYTHON_BIN_ENV};
use kirosu::client::HubClient;
use kirosu::hub::HubServer;
use kirosu::provider::Provider;
use kirosu_core::store::TaskStore;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// In-process stand-in for the external LLM CLI.
struct FakeProvider {
    reply: Result<String, String>,
    seen: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl FakeProvider {
    fn replying(reply: &str) -> (Self, Arc<Mutex<Vec<(String, Option<String>)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                reply: Ok(reply.to_string()),
                seen: seen.clone(),
            },
            seen,
        )
    }

    fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn run(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        _workdir: Option<&Path>,
    ) -> anyhow::Result<String> {
        self.seen
            .lock()
            .unwrap()
            .push((prompt.to_string(), system_prompt.map(str::to_string)));
        match &self.reply {
            Ok(reply) => Ok(reply.clone()),
            Err(message) => anyhow::bail!("{message}"),
        }
    }
}

async fn start_hub() -> anyhow::Result<(TempDir, HubServer)> {
    let dir = TempDir::new().context("create temp dir")?;
    let store = TaskStore::connect(&dir.path().join("kirosu.db"))
        .await
        .context("connect store")?;
    let server = HubServer::start(store, None, 300, "127.0.0.1:0".parse()?)
        .await
        .context("start hub")?;
    Ok((dir, server))
}

fn client_for(server: &HubServer) -> HubClient {
    HubClient::new("127.0.0.1", server.addr.port()).with_auth_token(None)
}

#[tokio::test]
async fn tick_executes_a_chat_task_and_acks_done() -> anyhow::Result<()> {
    let (_dir, server) = start_hub().await?;
    let mut submitter = client_for(&server);
    let task_id = submitter.enqueue("say hi", None, None).await?;

    let (provider, seen) = FakeProvider::replying("hello from fake");
    let mut agent = KiroAgent::new(client_for(&server), Box::new(provider), None);
    let worker_id = agent.worker_id().to_string();

    anyhow::ensure!(agent.tick().await?, "expected the tick to find work");

    let (tasks, _) = submitter.list(Some("done"), 10).await?;
    anyhow::ensure!(tasks.len() == 1);
    anyhow::ensure!(tasks[0].task_id == task_id);
    anyhow::ensure!(tasks[0].result.as_deref() == Some("hello from fake"));
    anyhow::ensure!(tasks[0].worker_id.as_deref() == Some(worker_id.as_str()));

    let calls = seen.lock().unwrap().clone();
    anyhow::ensure!(calls == vec![("say hi".to_string(), None)]);

    // Queue drained: the next tick is idle.
    anyhow::ensure!(!agent.tick().await?);

    server.shutdown().await
}

#[tokio::test]
async fn tick_records_provider_failure_as_task_failure() -> anyhow::Result<()> {
    let (_dir, server) = start_hub().await?;
    let mut submitter = client_for(&server);
    let task_id = submitter.enqueue("doomed", None, None).await?;

    let provider = FakeProvider::failing("model unavailable");
    let mut agent = KiroAgent::new(client_for(&server), Box::new(provider), None);

    anyhow::ensure!(agent.tick().await?);

    let (tasks, stats) = submitter.list(Some("failed"), 10).await?;
    anyhow::ensure!(tasks.len() == 1);
    anyhow::ensure!(tasks[0].task_id == task_id);
    anyhow::ensure!(
        tasks[0]
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("model unavailable"),
        "got {:?}",
        tasks[0].error
    );
    anyhow::ensure!(stats.error_rate_percent == 100.0);

    server.shutdown().await
}

#[tokio::test]
async fn tick_injects_workdir_context_into_the_system_prompt() -> anyhow::Result<()> {
    let (_dir, server) = start_hub().await?;
    let workdir = TempDir::new()?;
    tokio::fs::create_dir_all(workdir.path().join(".kiro")).await?;
    tokio::fs::write(workdir.path().join(".kiro").join("context.md"), "project context").await?;

    let mut submitter = client_for(&server);
    submitter
        .enqueue("say hi", Some("be terse"), None)
        .await?;

    let (provider, seen) = FakeProvider::replying("ok");
    let mut agent = KiroAgent::new(
        client_for(&server),
        Box::new(provider),
        Some(PathBuf::from(workdir.path())),
    );

    anyhow::ensure!(agent.tick().await?);

    let calls = seen.lock().unwrap().clone();
    anyhow::ensure!(calls.len() == 1);
    anyhow::ensure!(
        calls[0].1.as_deref() == Some("project context\n\nbe terse"),
        "got {:?}",
        calls[0].1
    );

    server.shutdown().await
}

#[tokio::test]
async fn tick_runs_python_tasks_through_the_interpreter() -> anyhow::Result<()> {
    let (_dir, server) = start_hub().await?;
    // /bin/sh doubles as the interpreter: `sh -c` has the same argv shape as
    // `python3 -c`, which keeps this test hermetic.
    std::env::set_var(PYTHON_BIN_ENV, "/bin/sh");

    let mut submitter = client_for(&server);
    let ok_id = submitter
        .enqueue("printf computed", None, Some("python"))
        .await?;
    let bad_id = submitter
        .enqueue("echo broken >&2; exit 1", None, Some("python"))
        .await?;

    let (provider, seen) = FakeProvider::replying("unused");
    let mut agent = KiroAgent::new(client_for(&server), Box::new(provider), None);
    anyhow::ensure!(agent.tick().await?);
    anyhow::ensure!(agent.tick().await?);
    std::env::remove_var(PYTHON_BIN_ENV);

    let (done, _) = submitter.list(Some("done"), 10).await?;
    anyhow::ensure!(done.len() == 1 && done[0].task_id == ok_id);
    anyhow::ensure!(done[0].result.as_deref() == Some("computed"));

    let (failed, _) = submitter.list(Some("failed"), 10).await?;
    anyhow::ensure!(failed.len() == 1 && failed[0].task_id == bad_id);
    anyhow::ensure!(
        failed[0]
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("broken"),
        "got {:?}",
        failed[0].error
    );

    // Python tasks never touch the provider.
    anyhow::ensure!(seen.lock().unwrap().is_empty());

    server.shutdown().await
}
