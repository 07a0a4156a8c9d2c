use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::{flog_debug, Error, Result};

/// Default engineer roster, in allocation order.
pub const DEFAULT_ROSTER: &[&str] = &["Alex", "Betty", "Cleo", "Dany", "Eddy"];

/// Default timeout for a single agent invocation (10 minutes).
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 600;

/// Default timeout for a waited external event (30 minutes).
pub const DEFAULT_EVENT_TIMEOUT_SECS: u64 = 1800;

/// Default time without a progress update before a workflow is stuck.
pub const DEFAULT_STUCK_THRESHOLD_SECS: u64 = 600;

/// Default grace period before idle allocated agents are flagged.
pub const DEFAULT_IDLE_GRACE_SECS: u64 = 300;

/// Default bound on compile-fix iterations within one workflow.
pub const DEFAULT_MAX_FIX_ITERATIONS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Named worker roster. Order is allocation order.
    #[serde(default = "default_roster")]
    pub roster: Vec<String>,
    /// Override for the agent command line (binary plus flags).
    pub command: Option<String>,
    /// Per-invocation agent timeout in seconds.
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,
    /// Timeout for waited external events in seconds.
    #[serde(default = "default_event_timeout")]
    pub event_timeout_secs: u64,
    /// Seconds without a progress update before a workflow is stuck.
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold_secs: u64,
    /// Seconds an allocated agent may sit idle before being flagged.
    #[serde(default = "default_idle_grace")]
    pub idle_grace_secs: u64,
    /// Maximum compile-fix iterations per workflow.
    #[serde(default = "default_max_fix_iterations")]
    pub max_fix_iterations: u32,
    /// Override for the agent log directory.
    pub log_dir: Option<String>,
}

fn default_roster() -> Vec<String> {
    DEFAULT_ROSTER.iter().map(|s| s.to_string()).collect()
}

fn default_agent_timeout() -> u64 {
    DEFAULT_AGENT_TIMEOUT_SECS
}

fn default_event_timeout() -> u64 {
    DEFAULT_EVENT_TIMEOUT_SECS
}

fn default_stuck_threshold() -> u64 {
    DEFAULT_STUCK_THRESHOLD_SECS
}

fn default_idle_grace() -> u64 {
    DEFAULT_IDLE_GRACE_SECS
}

fn default_max_fix_iterations() -> u32 {
    DEFAULT_MAX_FIX_ITERATIONS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            roster: default_roster(),
            command: None,
            agent_timeout_secs: DEFAULT_AGENT_TIMEOUT_SECS,
            event_timeout_secs: DEFAULT_EVENT_TIMEOUT_SECS,
            stuck_threshold_secs: DEFAULT_STUCK_THRESHOLD_SECS,
            idle_grace_secs: DEFAULT_IDLE_GRACE_SECS,
            max_fix_iterations: DEFAULT_MAX_FIX_ITERATIONS,
            log_dir: None,
        }
    }
}

impl Config {
    pub fn foreman_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".foreman"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::foreman_dir()?.join("foreman.toml"))
    }

    pub fn agent_log_dir(&self) -> Result<PathBuf> {
        match &self.log_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::foreman_dir()?.join("logs")),
        }
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("claude")
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_secs(self.event_timeout_secs)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_secs)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        flog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            flog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        flog_debug!(
            "Config loaded: roster={:?}, command={:?}, agent_timeout={}s",
            config.roster,
            config.command,
            config.agent_timeout_secs
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::foreman_dir()?;
        flog_debug!("Config::save dir={}", dir.display());
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        flog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let dir = Self::foreman_dir()?;
        let logs = self.agent_log_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        if !logs.exists() {
            fs::create_dir_all(&logs)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
