//! Configuration file management for overseer.
//!
//! Provides a TOML-based config file at `~/.config/overseer/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use overseer_core::backlog::{Backlog, BeansBacklog, NoBacklog};
use overseer_core::supervisor::SupervisorConfig;
use overseer_db::config::DbConfig;

/// Environment variable naming the agent executable.
pub const AGENT_BIN_ENV: &str = "OVERSEER_AGENT_BIN";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub agent: AgentSection,
    pub history: HistorySection,
    pub backlog: BacklogSection,
    pub server: ServerSection,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Agent executable; `None` falls back to the built-in default.
    pub binary: Option<String>,
    /// Arguments placed before the per-run flags.
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub grace_period_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        let defaults = SupervisorConfig::default();
        Self {
            binary: None,
            args: defaults.agent_args,
            working_dir: None,
            grace_period_secs: defaults.grace_period.as_secs(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    /// SQLite URL of the history ledger.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacklogSection {
    /// Set to false to run without a backlog (pending counts come only
    /// from agent events).
    pub enabled: bool,
    pub command: String,
    pub tag: String,
    pub timeout_secs: u64,
}

impl Default for BacklogSection {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "beans".to_string(),
            tag: "autoclaude".to_string(),
            timeout_secs: BeansBacklog::DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

impl BacklogSection {
    pub fn to_backlog(&self) -> BeansBacklog {
        BeansBacklog::new(&self.command, &self.tag)
            .with_timeout(Duration::from_secs(self.timeout_secs.max(1)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the overseer config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/overseer` or `~/.config/overseer`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("overseer");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("overseer")
}

/// Return the path to the overseer config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

pub fn parse_config(contents: &str) -> Result<ConfigFile> {
    toml::from_str(contents).context("failed to parse config file")
}

/// Load the config file, or `None` when there is none. A file that exists
/// but does not parse is an error.
pub fn load_config() -> Result<Option<ConfigFile>> {
    let path = config_path();
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    parse_config(&contents).map(Some)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(path)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct OverseerConfig {
    pub db_config: DbConfig,
    pub supervisor: SupervisorConfig,
    pub backlog: BacklogSection,
    pub server: ServerSection,
}

impl OverseerConfig {
    /// Backlog for the supervisor. When disabled, by flag or config, it
    /// never answers and only agent-reported counts are used.
    pub fn build_backlog(&self, no_backlog: bool) -> Arc<dyn Backlog> {
        if no_backlog || !self.backlog.enabled {
            return Arc::new(NoBacklog);
        }
        let mut backlog = self.backlog.to_backlog();
        if let Some(dir) = &self.supervisor.working_dir {
            backlog = backlog.with_working_dir(dir);
        }
        Arc::new(backlog)
    }

    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    pub fn resolve(cli_db_url: Option<&str>, cli_agent_bin: Option<&str>) -> Result<Self> {
        let file_config = load_config()?;
        Ok(Self::from_sources(
            file_config.unwrap_or_default(),
            cli_db_url,
            cli_agent_bin,
        ))
    }

    /// Apply CLI flags and environment variables on top of `file`.
    ///
    /// - DB URL: `cli_db_url` > `OVERSEER_DATABASE_URL` > `history.url` > `DbConfig::default_url()`
    /// - Agent: `cli_agent_bin` > `OVERSEER_AGENT_BIN` > `agent.binary` > `autoclaude`
    pub fn from_sources(
        file: ConfigFile,
        cli_db_url: Option<&str>,
        cli_agent_bin: Option<&str>,
    ) -> Self {
        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var(DbConfig::URL_ENV) {
            url
        } else if let Some(url) = file.history.url {
            url
        } else {
            DbConfig::default_url()
        };

        let mut supervisor = SupervisorConfig::default();
        if let Some(bin) = cli_agent_bin {
            supervisor.agent_binary = bin.to_string();
        } else if let Ok(bin) = std::env::var(AGENT_BIN_ENV) {
            supervisor.agent_binary = bin;
        } else if let Some(bin) = file.agent.binary {
            supervisor.agent_binary = bin;
        }
        supervisor.agent_args = file.agent.args;
        supervisor.working_dir = file.agent.working_dir;
        supervisor.grace_period = Duration::from_secs(file.agent.grace_period_secs);

        Self {
            db_config: DbConfig::new(db_url),
            supervisor,
            backlog: file.backlog,
            server: file.server,
        }
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
