//! LLM providers: external processes that turn a prompt into text.

use anyhow::{bail, Context};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

/// Provider selection env var; `codex` picks the codex CLI, anything else
/// falls back to kiro-cli.
pub const PROVIDER_ENV: &str = "KIRO_PROVIDER";

const DEFAULT_CODEX_MODEL: &str = "gpt-5.1-codex-mini";

/// Turns a prompt into a text result. Implementations may take minutes; the
/// agent invokes `run` exactly once per chat-class task and records any error
/// as the task's failure.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn run(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        workdir: Option<&Path>,
    ) -> anyhow::Result<String>;
}

/// Shells out to `kiro-cli chat` in non-interactive mode.
pub struct KiroCliProvider {
    model: Option<String>,
}

impl KiroCliProvider {
    pub fn new(model: Option<String>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Provider for KiroCliProvider {
    async fn run(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        workdir: Option<&Path>,
    ) -> anyhow::Result<String> {
        let mut cmd = Command::new("kiro-cli");
        cmd.args(["chat", "--no-interactive", "--wrap", "never"]);
        if let Some(model) = &self.model {
            cmd.args(["--model", model]);
        }
        cmd.arg("--trust-all-tools");
        cmd.arg(full_prompt(prompt, system_prompt));
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }
        run_command(cmd, "kiro-cli").await
    }
}

/// Shells out to `codex exec`. Extra flags (e.g. `--search`) can be injected
/// via `KIRO_CODEX_EXTRA_ARGS`.
pub struct CodexProvider {
    model: String,
}

impl CodexProvider {
    pub fn new(model: Option<String>) -> Self {
        Self {
            model: model.unwrap_or_else(|| DEFAULT_CODEX_MODEL.to_string()),
        }
    }
}

#[async_trait]
impl Provider for CodexProvider {
    async fn run(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        workdir: Option<&Path>,
    ) -> anyhow::Result<String> {
        let mut cmd = Command::new("codex");
        cmd.args(["exec", "--dangerously-bypass-approvals-and-sandbox"]);
        cmd.args(["--model", &self.model]);
        if let Ok(extra) = std::env::var("KIRO_CODEX_EXTRA_ARGS") {
            cmd.args(extra.split_whitespace());
        }
        cmd.arg(full_prompt(prompt, system_prompt));
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }
        run_command(cmd, "codex").await
    }
}

/// Pick a provider by explicit name, falling back to `KIRO_PROVIDER`, then to
/// kiro-cli.
pub fn get_provider(name: Option<&str>, model: Option<String>) -> Box<dyn Provider> {
    let name = name
        .map(str::to_string)
        .or_else(|| std::env::var(PROVIDER_ENV).ok())
        .unwrap_or_else(|| "kiro".to_string());

    match name.as_str() {
        "codex" => {
            tracing::info!(model = model.as_deref().unwrap_or(DEFAULT_CODEX_MODEL), "using codex provider");
            Box::new(CodexProvider::new(model))
        }
        _ => Box::new(KiroCliProvider::new(model)),
    }
}

fn full_prompt(prompt: &str, system_prompt: Option<&str>) -> String {
    match system_prompt {
        Some(system) if !system.is_empty() => format!("System: {system}\n\nUser: {prompt}"),
        _ => prompt.to_string(),
    }
}

async fn run_command(mut cmd: Command, label: &str) -> anyhow::Result<String> {
    let output = cmd
        .output()
        .await
        .with_context(|| format!("spawn {label}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let message = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        let code = output.status.code().unwrap_or(-1);
        bail!("{label} failed (code {code}): {message}");
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
