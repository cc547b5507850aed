//! Host configuration: TOML file + CLI overrides.

use std::path::{Path, PathBuf};

use anyhow::Context;
use conductor_pty::{LaunchConfig, ManagerConfig};
use serde::Deserialize;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub launch: LaunchConfig,
}

/// `[sessions]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default)]
    pub coalesce_by_path: bool,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_read_buffer")]
    pub read_buffer: usize,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            coalesce_by_path: false,
            event_capacity: default_event_capacity(),
            read_buffer: default_read_buffer(),
        }
    }
}

fn default_max_sessions() -> usize {
    ManagerConfig::default().max_sessions
}
fn default_event_capacity() -> usize {
    ManagerConfig::default().event_capacity
}
fn default_read_buffer() -> usize {
    ManagerConfig::default().read_buffer
}

/// Values given on the command line. Each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub max_sessions: Option<usize>,
    pub command: Option<String>,
    pub executable: Option<PathBuf>,
    pub coalesce: bool,
    pub log_level: Option<String>,
}

/// Resolved host configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub manager: ManagerConfig,
    pub log_level: String,
    /// The config file that was read, if one existed.
    pub source: Option<PathBuf>,
}

impl HostConfig {
    /// Load config from a TOML file, then apply CLI overrides. A missing file
    /// means defaults.
    pub fn load(config_path: &str, overrides: Overrides) -> anyhow::Result<Self> {
        let path = expand_tilde(config_path);
        let (file, source) = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read config {}", path.display()))?;
            let file = toml::from_str::<ConfigFile>(&content)
                .with_context(|| format!("config parse error in {}", path.display()))?;
            (file, Some(path))
        } else {
            (ConfigFile::default(), None)
        };
        Ok(Self::merge(file, overrides, source))
    }

    fn merge(file: ConfigFile, overrides: Overrides, source: Option<PathBuf>) -> Self {
        let mut launch = file.launch;
        if let Some(command) = overrides.command {
            launch.command = command;
        }
        if let Some(executable) = overrides.executable.or(launch.executable.take()) {
            launch.executable = Some(expand_tilde_path(&executable));
        }

        let manager = ManagerConfig {
            max_sessions: overrides.max_sessions.unwrap_or(file.sessions.max_sessions),
            coalesce_by_path: overrides.coalesce || file.sessions.coalesce_by_path,
            event_capacity: file.sessions.event_capacity.max(1),
            read_buffer: file.sessions.read_buffer.max(1),
            launch,
        };

        Self {
            manager,
            log_level: overrides
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
            source,
        }
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

fn expand_tilde_path(path: &Path) -> PathBuf {
    expand_tilde(&path.to_string_lossy())
}
