//! Configuration: CLI flags with env-var defaults, overlaid TOML config
//! files, and the database path default.
//!
//! Parse once at startup; pass the parsed structs through.

use clap::Args;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Model default env var consulted when neither the CLI flag nor the config
/// file names a model.
pub const MODEL_ENV: &str = "MITTELO_KIRO_MODEL";

/// Shared hub endpoint flags.
#[derive(Args, Debug, Clone)]
pub struct EndpointConfig {
    /// Hub host.
    #[arg(long, env = "KIRO_SWARM_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Hub port.
    #[arg(long, env = "KIRO_SWARM_PORT", default_value_t = 8765)]
    pub port: u16,
}

#[derive(Args, Debug, Clone)]
pub struct HubConfig {
    #[command(flatten)]
    pub endpoint: EndpointConfig,

    /// Database path (defaults to `database.path` from config.toml, then
    /// ~/.kiro/kirosu.db).
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Default task lease duration in seconds, applied when a lease request
    /// omits `lease_seconds`.
    #[arg(long, default_value_t = 300)]
    pub lease_seconds: i64,
}

#[derive(Args, Debug, Clone)]
pub struct AgentConfig {
    #[command(flatten)]
    pub endpoint: EndpointConfig,

    /// Override the provider model.
    #[arg(long)]
    pub model: Option<String>,

    /// Working directory for task execution and context injection.
    #[arg(long)]
    pub workdir: Option<PathBuf>,

    /// Also append logs to this file.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(long)]
    pub verbose: bool,
}

/// Options recognized in `config.toml`. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FileConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl FileConfig {
    /// Global `~/.kiro/config.toml` overlaid by `<cwd>/.kiro/config.toml`;
    /// the local file wins field by field.
    pub fn load() -> Self {
        let mut config = FileConfig::default();
        if let Some(home) = dirs::home_dir() {
            config = config.overlay(Self::read(&home.join(".kiro").join("config.toml")));
        }
        config.overlay(Self::read(&Path::new(".kiro").join("config.toml")))
    }

    fn read(path: &Path) -> FileConfig {
        if !path.exists() {
            return FileConfig::default();
        }
        let parsed = std::fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|text| toml::from_str(&text).map_err(anyhow::Error::from));
        match parsed {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to load config file");
                FileConfig::default()
            }
        }
    }

    fn overlay(self, local: FileConfig) -> FileConfig {
        FileConfig {
            model: local.model.or(self.model),
            workdir: local.workdir.or(self.workdir),
            database: DatabaseConfig {
                path: local.database.path.or(self.database.path),
            },
        }
    }

    pub fn database_path(&self) -> PathBuf {
        match &self.database.path {
            Some(path) => expand_user(path),
            None => default_db_path(),
        }
    }
}

pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kiro")
        .join("kirosu.db")
}

fn expand_user(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognized_options_and_ignores_unknown_keys() -> anyhow::Result<()> {
        let config: FileConfig = toml::from_str(
            r#"
            model = "claude-haiku-4.5"
            workdir = "/tmp/work"
            unknown = "ignored"

            [database]
            path = "~/custom/tasks.db"
            "#,
        )?;
        anyhow::ensure!(config.model.as_deref() == Some("claude-haiku-4.5"));
        anyhow::ensure!(config.workdir.as_deref() == Some(Path::new("/tmp/work")));
        anyhow::ensure!(config.database.path.as_deref() == Some(Path::new("~/custom/tasks.db")));
        Ok(())
    }

    #[test]
    fn overlay_prefers_local_values_field_by_field() {
        let global = FileConfig {
            model: Some("global-model".to_string()),
            workdir: Some(PathBuf::from("/global")),
            database: DatabaseConfig {
                path: Some(PathBuf::from("/global/db")),
            },
        };
        let local = FileConfig {
            model: Some("local-model".to_string()),
            workdir: None,
            database: DatabaseConfig { path: None },
        };
        let merged = global.overlay(local);
        assert_eq!(merged.model.as_deref(), Some("local-model"));
        assert_eq!(merged.workdir.as_deref(), Some(Path::new("/global")));
        assert_eq!(
            merged.database.path.as_deref(),
            Some(Path::new("/global/db"))
        );
    }

    #[test]
    fn expand_user_rewrites_tilde_prefix() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_user(Path::new("~/x/y.db")),
                home.join("x").join("y.db")
            );
        }
        assert_eq!(expand_user(Path::new("/abs/y.db")), Path::new("/abs/y.db"));
    }
}
