//! Commands for session management.
//!
//! Each request line names one command. The handlers wrap the controller
//! and report failures as strings, which go back to the UI verbatim.

use std::path::{Path, PathBuf};

use conductor_pty::{LifecycleController, SessionId};
use serde::Deserialize;

use crate::ipc::{ActiveSession, Reply};

/// One request line from stdin.
#[derive(Deserialize, Debug, PartialEq)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    StartSession {
        working_directory: PathBuf,
    },
    SendInput {
        session_id: SessionId,
        text: String,
    },
    /// Without an id, every live session is killed.
    KillSession {
        #[serde(default)]
        session_id: Option<SessionId>,
    },
    Resize {
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },
    ListActiveSessions,
}

impl Command {
    /// The session this command acts on, if it targets exactly one.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Command::SendInput { session_id, .. } | Command::Resize { session_id, .. } => {
                Some(*session_id)
            }
            Command::KillSession { session_id } => *session_id,
            Command::StartSession { .. } | Command::ListActiveSessions => None,
        }
    }
}

/// Start a CLI-agent session in `working_directory`.
pub fn start_session(
    controller: &LifecycleController,
    working_directory: &Path,
) -> Result<SessionId, String> {
    controller
        .start(working_directory)
        .map_err(|e| e.to_string())
}

/// Write user input to a session.
pub fn send_input(
    controller: &LifecycleController,
    session_id: SessionId,
    text: &str,
) -> Result<(), String> {
    controller
        .write(session_id, text.as_bytes())
        .map_err(|e| e.to_string())
}

/// Kill one session, or all of them.
pub fn kill_session(
    controller: &LifecycleController,
    session_id: Option<SessionId>,
) -> Result<(), String> {
    match session_id {
        Some(id) => controller.stop(id).map_err(|e| e.to_string()),
        None => {
            let stopped = controller.stop_all();
            log::info!("killed all sessions ({stopped})");
            Ok(())
        }
    }
}

/// Resize a session's terminal.
pub fn resize(
    controller: &LifecycleController,
    session_id: SessionId,
    cols: u16,
    rows: u16,
) -> Result<(), String> {
    controller
        .resize(session_id, cols, rows)
        .map_err(|e| e.to_string())
}

pub fn list_active_sessions(controller: &LifecycleController) -> Vec<ActiveSession> {
    controller
        .list()
        .into_iter()
        .map(|info| ActiveSession {
            id: info.id,
            working_directory: info.working_dir,
        })
        .collect()
}

/// Run one request to completion. Blocks on pty I/O.
pub fn dispatch(controller: &LifecycleController, request: Request) -> Reply {
    let id = request.id;
    let result = match request.command {
        Command::StartSession { working_directory } => {
            start_session(controller, &working_directory).map(|session| Reply::ok(id).with_session(session))
        }
        Command::SendInput { session_id, text } => {
            send_input(controller, session_id, &text).map(|()| Reply::ok(id))
        }
        Command::KillSession { session_id } => {
            kill_session(controller, session_id).map(|()| Reply::ok(id))
        }
        Command::Resize {
            session_id,
            cols,
            rows,
        } => resize(controller, session_id, cols, rows).map(|()| Reply::ok(id)),
        Command::ListActiveSessions => {
            Ok(Reply::ok(id).with_sessions(list_active_sessions(controller)))
        }
    };
    result.unwrap_or_else(|error| {
        log::debug!("request {id} failed: {error}");
        Reply::failed(id, error)
    })
}
