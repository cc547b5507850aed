use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::OwnedSemaphorePermit;
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::pty::PtyHandle;

/// Unique identifier for a session. Generated at spawn time, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Where a session is in its lifecycle.
///
/// `Starting -> Running -> {Exited, Killed}`. `Exited` and `Killed` are
/// terminal. A session torn down before it is marked running may also go
/// straight from `Starting` to `Exited` or `Killed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Exited(i32),
    Killed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Exited(_) | SessionState::Killed)
    }

    /// Whether moving from `self` to `next` follows the state machine.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Running | Exited(_) | Killed) | (Running, Exited(_) | Killed)
        )
    }
}

struct SessionInner {
    state: SessionState,
    pty: PtyHandle,
}

/// A running CLI-agent process bound to a working directory.
///
/// The session is the only owner of its [`PtyHandle`]. Every operation on
/// the process goes through the session's lock, so a `stop` racing a
/// `write` on the same session is serialized.
pub struct Session {
    id: SessionId,
    working_dir: PathBuf,
    created_at: SystemTime,
    inner: Mutex<SessionInner>,
    // Returned to the capacity pool when the session is dropped.
    _permit: Option<OwnedSemaphorePermit>,
}

impl Session {
    /// Wrap a freshly spawned pty. The session starts in `Starting`.
    pub fn new(
        id: SessionId,
        working_dir: PathBuf,
        pty: PtyHandle,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            id,
            working_dir,
            created_at: SystemTime::now(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Starting,
                pty,
            }),
            _permit: permit,
        }
    }

    /// Returns the session's unique identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Current terminal size as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        self.lock().pty.size()
    }

    pub fn process_id(&self) -> Option<u32> {
        self.lock().pty.process_id()
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the session and fail unless it is `Running`.
    fn lock_running(&self) -> Result<MutexGuard<'_, SessionInner>> {
        let inner = self.lock();
        if inner.state != SessionState::Running {
            return Err(SessionError::SessionNotFound(self.id));
        }
        Ok(inner)
    }

    /// `Starting -> Running`. Returns `false` if the process already exited.
    pub fn mark_running(&self) -> bool {
        self.transition(SessionState::Running)
    }

    /// Record that the process exited on its own. Ignored once the session
    /// is already terminal (an explicit kill wins).
    pub fn mark_exited(&self, code: i32) -> bool {
        self.transition(SessionState::Exited(code))
    }

    fn transition(&self, next: SessionState) -> bool {
        let mut inner = self.lock();
        if inner.state.can_transition_to(next) {
            inner.state = next;
            true
        } else {
            false
        }
    }

    /// Write user input to the PTY.
    pub fn write_input(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.lock_running()?;
        inner.pty.write(data)?;
        Ok(())
    }

    /// Resize the PTY. Output keeps flowing; only the geometry changes.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidGeometry { cols, rows });
        }
        let mut inner = self.lock_running()?;
        inner.pty.resize(cols, rows)?;
        Ok(())
    }

    /// Terminate the process and move to `Killed`.
    ///
    /// Fails with `SessionNotFound` if the session already exited or was
    /// killed. A signal that cannot be delivered is logged; the session is
    /// considered killed either way.
    pub fn kill(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return Err(SessionError::SessionNotFound(self.id));
        }
        if let Err(e) = inner.pty.kill() {
            log::warn!("session {}: {e}", self.id);
        }
        inner.state = SessionState::Killed;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !inner.state.is_terminal() {
            log::debug!("session {} dropped while live, killing", self.id);
            if let Err(e) = inner.pty.kill() {
                log::warn!("session {}: {e}", self.id);
            }
            inner.state = SessionState::Killed;
        }
    }
}
