//! conductor-pty: concurrent pty-backed CLI-agent sessions.
//!
//! Each session is one CLI-agent process running in a pseudo-terminal,
//! bound to a working directory. The crate spawns them, routes input and
//! geometry changes to them, fans their output into a single event stream
//! and makes sure none outlive the host.
//!
//! # Architecture
//!
//! - [`PtyHandle`]: low-level pty process management (spawn, write, resize, kill).
//! - [`ProcessLauncher`]: resolves the executable and builds the child environment.
//! - [`Session`]: one process plus its lifecycle state, behind a per-session lock.
//! - [`SessionRegistry`]: the live sessions, keyed by [`SessionId`].
//! - [`StreamMultiplexer`]: one reader thread per session feeding [`SessionEvent`]s.
//! - [`LifecycleController`]: start / stop / write / resize.
//! - [`ShutdownCoordinator`]: terminates everything on window close or quit.

pub mod config;
pub mod error;
pub mod launcher;
pub mod lifecycle;
pub mod multiplexer;
pub mod pty;
pub mod registry;
pub mod session;
pub mod shutdown;

pub use config::{LaunchConfig, ManagerConfig};
pub use error::{Result, SessionError};
pub use launcher::{Platform, ProcessLauncher};
pub use lifecycle::LifecycleController;
pub use multiplexer::{ExitObserver, SessionEvent, StreamMultiplexer, Subscription};
pub use pty::{PtyError, PtyHandle};
pub use registry::{SessionInfo, SessionRegistry};
pub use session::{Session, SessionId, SessionState};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
