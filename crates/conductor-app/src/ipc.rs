//! Wire types for the stdio protocol.
//!
//! Every line on stdout is one [`Frame`]: either the reply to a request or a
//! session event, both tagged with `type`.

use std::path::PathBuf;

use conductor_pty::{SessionEvent, SessionId};
use serde::Serialize;

#[derive(Serialize, Debug)]
#[serde(untagged)]
pub enum Frame {
    Reply(Reply),
    Event(SessionEvent),
}

/// The answer to one request, matched to it by `id`.
#[derive(Serialize, Debug, PartialEq)]
#[serde(tag = "type", rename = "reply")]
pub struct Reply {
    pub id: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<ActiveSession>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(id: u64) -> Self {
        Self {
            id,
            success: true,
            session_id: None,
            sessions: None,
            error: None,
        }
    }

    pub fn failed(id: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::ok(id)
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_sessions(mut self, sessions: Vec<ActiveSession>) -> Self {
        self.sessions = Some(sessions);
        self
    }
}

/// One entry of `list_active_sessions`.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ActiveSession {
    pub id: SessionId,
    pub working_directory: PathBuf,
}
