//! Executable resolution and pty process spawning for sessions.
//!
//! Resolution and environment construction are plain functions over their
//! inputs (command, platform, an environment lookup, a filesystem probe) so
//! they can be tested without launching anything. [`ProcessLauncher`] wires
//! them to the real environment and spawns through [`PtyHandle`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use portable_pty::CommandBuilder;

use crate::config::LaunchConfig;
use crate::error::{Result, SessionError};
use crate::pty::{PtyHandle, PtyOutput};
use crate::session::SessionId;

/// Platform family, for picking well-known install locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Unix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

/// Ordered list of places `command` may be installed.
///
/// The bare command name always comes first. Locations derived from an
/// environment variable are skipped when the variable is unset or empty.
pub fn candidate_locations<F>(command: &str, platform: Platform, env: F) -> Vec<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| env(name).filter(|v| !v.is_empty()).map(PathBuf::from);
    let mut candidates = vec![PathBuf::from(command)];

    match platform {
        Platform::Windows => {
            let exe = format!("{command}.exe");
            if let Some(profile) = var("USERPROFILE") {
                candidates.push(profile.join(".local").join("bin").join(&exe));
            }
            if let Some(local) = var("LOCALAPPDATA") {
                candidates.push(local.join("npm").join(&exe));
            }
            if let Some(roaming) = var("APPDATA") {
                candidates.push(roaming.join("npm").join(&exe));
                candidates.push(roaming.join("npm").join(format!("{command}.cmd")));
            }
        }
        Platform::Unix => {
            if let Some(home) = var("HOME") {
                candidates.push(home.join(".local").join("bin").join(command));
                candidates.push(home.join(".claude").join("local").join(command));
                candidates.push(home.join(".npm-global").join("bin").join(command));
            }
            candidates.push(Path::new("/usr/local/bin").join(command));
            candidates.push(Path::new("/opt/homebrew/bin").join(command));
        }
    }

    candidates
}

/// Pick the first candidate the probe accepts, falling back to the bare
/// command name. Never fails; a bad executable surfaces at spawn time.
pub fn resolve_executable<P>(command: &str, candidates: &[PathBuf], probe: P) -> PathBuf
where
    P: Fn(&Path) -> Option<PathBuf>,
{
    candidates
        .iter()
        .find_map(|candidate| probe(candidate.as_path()))
        .unwrap_or_else(|| PathBuf::from(command))
}

/// Filesystem probe: a bare name is looked up on `PATH`, anything with a
/// directory component must be an existing file.
pub fn probe_filesystem(candidate: &Path) -> Option<PathBuf> {
    let bare = !candidate.is_absolute() && candidate.components().count() == 1;
    if bare {
        which::which(candidate).ok()
    } else if candidate.is_file() {
        Some(candidate.to_path_buf())
    } else {
        None
    }
}

/// The parent's environment minus the nested-session marker.
pub fn child_environment<I, K, V>(parent: I, marker: &str) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<OsString>,
    V: Into<OsString>,
{
    parent
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .filter(|(k, _)| !is_marker(k, marker))
        .collect()
}

fn is_marker(key: &OsString, marker: &str) -> bool {
    if cfg!(windows) {
        key.to_str()
            .map(|k| k.eq_ignore_ascii_case(marker))
            .unwrap_or(false)
    } else {
        key == marker
    }
}

/// A process spawned for a new session, not yet registered anywhere.
pub struct LaunchedProcess {
    pub id: SessionId,
    pub program: PathBuf,
    pub pty: PtyHandle,
    pub output: PtyOutput,
}

/// Spawns session processes according to a [`LaunchConfig`].
pub struct ProcessLauncher {
    config: LaunchConfig,
}

impl ProcessLauncher {
    pub fn new(config: LaunchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// The executable a session would run right now.
    pub fn resolve(&self) -> PathBuf {
        if let Some(executable) = &self.config.executable {
            return executable.clone();
        }
        let candidates = candidate_locations(&self.config.command, Platform::current(), |name| {
            std::env::var(name).ok()
        });
        resolve_executable(&self.config.command, &candidates, probe_filesystem)
    }

    fn build_command(&self, program: &Path, working_dir: &Path) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(program);
        cmd.args(&self.config.args);
        cmd.cwd(working_dir);
        cmd.env_clear();
        for (key, value) in child_environment(std::env::vars_os(), &self.config.nested_marker) {
            cmd.env(key, value);
        }
        cmd.env("TERM", &self.config.term);
        cmd
    }

    /// Spawn a session process in `working_dir`, which the caller has
    /// already validated.
    pub fn launch(&self, working_dir: &Path) -> Result<LaunchedProcess> {
        let program = self.resolve();
        let cmd = self.build_command(&program, working_dir);

        let (pty, output) = PtyHandle::spawn(cmd, self.config.cols, self.config.rows)
            .map_err(|e| SessionError::SpawnFailure(format!("{}: {e}", program.display())))?;

        let id = SessionId::generate();
        log::debug!(
            "spawned {} (pid {:?}) for session {id} in {}",
            program.display(),
            pty.process_id(),
            working_dir.display()
        );

        Ok(LaunchedProcess {
            id,
            program,
            pty,
            output,
        })
    }
}
