//! Configuration for the session manager and the process launcher.
//!
//! Every field has a serde default so a partial config file (or none at all)
//! yields a working manager.

use std::path::PathBuf;

use serde::Deserialize;

/// Default number of concurrently live sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 3;

/// Initial pty geometry for every spawned session.
pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 30;

/// Tunables for [`LifecycleController`](crate::LifecycleController).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Maximum number of live sessions.
    pub max_sessions: usize,
    /// Reuse the live session bound to a working directory instead of
    /// spawning a second one for the same path.
    pub coalesce_by_path: bool,
    /// Capacity of the UI-facing event channel.
    pub event_capacity: usize,
    /// Size of each pty read buffer.
    pub read_buffer: usize,
    pub launch: LaunchConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            coalesce_by_path: false,
            event_capacity: 256,
            read_buffer: 65536,
            launch: LaunchConfig::default(),
        }
    }
}

/// How session processes are resolved and spawned.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Command name looked up on PATH and in well-known install locations.
    pub command: String,
    /// Explicit executable; skips candidate resolution entirely.
    pub executable: Option<PathBuf>,
    /// Arguments passed to every session process.
    pub args: Vec<String>,
    /// Variable stripped from the child environment so the tool does not
    /// believe it is nested inside another session.
    pub nested_marker: String,
    /// Value of `TERM` in the child environment.
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            executable: None,
            args: vec!["--dangerously-skip-permissions".to_string()],
            nested_marker: "CLAUDECODE".to_string(),
            term: "xterm-256color".to_string(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}
