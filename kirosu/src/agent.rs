//! The worker agent: lease one task, execute it, ack the outcome, repeat.
//!
//! RPC failures never kill the loop; they are logged and retried on the next
//! tick. A crashed worker simply lets its lease expire, after which the hub
//! hands the task to someone else.

use crate::client::HubClient;
use crate::provider::Provider;
use anyhow::{bail, Context};
use kirosu_core::Task;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Interpreter used for `python`-typed tasks; overridable for environments
/// where `python3` is not on PATH.
pub const PYTHON_BIN_ENV: &str = "KIRO_PYTHON_BIN";

pub const DEFAULT_LEASE_SECONDS: i64 = 300;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct KiroAgent {
    client: HubClient,
    worker_id: String,
    provider: Box<dyn Provider>,
    workdir: Option<PathBuf>,
    lease_seconds: i64,
}

impl KiroAgent {
    pub fn new(client: HubClient, provider: Box<dyn Provider>, workdir: Option<PathBuf>) -> Self {
        let worker_id = format!("kiro-{}", &Uuid::new_v4().simple().to_string()[..8]);
        Self {
            client,
            worker_id,
            provider,
            workdir,
            lease_seconds: DEFAULT_LEASE_SECONDS,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Poll until ctrl-c.
    pub async fn run(mut self, poll_interval: Duration) -> anyhow::Result<()> {
        tracing::info!(worker_id = %self.worker_id, "agent started");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!(worker_id = %self.worker_id, "agent shutting down");
                    return Ok(());
                }
                res = self.tick() => {
                    match res {
                        Ok(true) => {}
                        Ok(false) => tokio::time::sleep(poll_interval).await,
                        Err(err) => {
                            let message = format!("{err:#}");
                            tracing::warn!(error = %message, "agent tick failed");
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                }
            }
        }
    }

    /// One lease/execute/ack round. Returns whether a task was processed.
    pub async fn tick(&mut self) -> anyhow::Result<bool> {
        let tasks = self
            .client
            .lease(&self.worker_id, 1, self.lease_seconds)
            .await?;
        let Some(task) = tasks.into_iter().next() else {
            return Ok(false);
        };

        let task_id = task.task_id;
        tracing::info!(
            task_id,
            task_type = %task.task_type,
            prompt = %truncate(&task.prompt, 50),
            "leased task"
        );

        match self.execute(&task).await {
            Ok(result) => {
                self.client.ack(task_id, "done", Some(&result), None).await?;
                tracing::info!(task_id, "task done");
                tracing::debug!(task_id, result = %result, "task result");
            }
            Err(err) => {
                let message = format!("{err:#}");
                self.client
                    .ack(task_id, "failed", None, Some(&message))
                    .await?;
                tracing::error!(task_id, error = %message, "task failed");
            }
        }

        Ok(true)
    }

    async fn execute(&self, task: &Task) -> anyhow::Result<String> {
        if task.task_type == "python" {
            return run_python(&task.prompt, self.workdir.as_deref()).await;
        }
        let system_prompt = self.inject_context(task.system_prompt.as_deref()).await;
        self.provider
            .run(&task.prompt, system_prompt.as_deref(), self.workdir.as_deref())
            .await
    }

    /// Prepend `<workdir>/.kiro/context.md` to the system prompt when it
    /// exists. Unreadable files are logged and skipped.
    async fn inject_context(&self, system_prompt: Option<&str>) -> Option<String> {
        let base = self
            .workdir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let context_file = base.join(".kiro").join("context.md");
        if !context_file.exists() {
            return system_prompt.map(str::to_string);
        }

        match tokio::fs::read_to_string(&context_file).await {
            Ok(context) => {
                tracing::info!(path = %context_file.display(), "injected context");
                Some(compose_system_prompt(&context, system_prompt))
            }
            Err(err) => {
                tracing::warn!(
                    path = %context_file.display(),
                    error = %err,
                    "failed to read context file"
                );
                system_prompt.map(str::to_string)
            }
        }
    }
}

fn compose_system_prompt(context: &str, system_prompt: Option<&str>) -> String {
    match system_prompt {
        Some(system) if !system.is_empty() => format!("{context}\n\n{system}"),
        _ => context.to_string(),
    }
}

/// Run the prompt as source code in an external interpreter and return its
/// stdout. Non-zero exit surfaces stderr (or stdout) as the failure message.
pub async fn run_python(code: &str, workdir: Option<&Path>) -> anyhow::Result<String> {
    tracing::warn!("executing untrusted python task");

    let python = std::env::var(PYTHON_BIN_ENV).unwrap_or_else(|_| "python3".to_string());
    let mut cmd = tokio::process::Command::new(&python);
    cmd.arg("-c").arg(code);
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .await
        .with_context(|| format!("spawn {python}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let message = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        let code = output.status.code().unwrap_or(-1);
        bail!("python execution failed (code {code}): {message}");
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_prepends_context_with_blank_line() {
        assert_eq!(
            compose_system_prompt("ctx", Some("persona")),
            "ctx\n\npersona"
        );
        assert_eq!(compose_system_prompt("ctx", None), "ctx");
        assert_eq!(compose_system_prompt("ctx", Some("")), "ctx");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 50), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("äöüäöü", 3), "äöü...");
    }

    #[tokio::test]
    async fn run_python_returns_stdout_and_surfaces_failures() -> anyhow::Result<()> {
        // Point the interpreter override at /bin/sh so the test stays
        // hermetic; `sh -c` has the same argv shape as `python3 -c`.
        std::env::set_var(PYTHON_BIN_ENV, "/bin/sh");
        let out = run_python("printf ok", None).await?;
        anyhow::ensure!(out == "ok", "got: {out:?}");

        let err = run_python("echo boom >&2; exit 2", None).await.unwrap_err();
        let message = format!("{err:#}");
        anyhow::ensure!(message.contains("code 2"), "got: {message}");
        anyhow::ensure!(message.contains("boom"), "got: {message}");
        std::env::remove_var(PYTHON_BIN_ENV);
        Ok(())
    }
}
