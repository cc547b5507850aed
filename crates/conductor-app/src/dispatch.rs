//! Request routing.
//!
//! Commands aimed at one session go through that session's lane, a FIFO
//! drained by a single task, so input reaches the pty in the order it was
//! sent. Commands not tied to a session, and lanes of different sessions,
//! run concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use conductor_pty::{LifecycleController, SessionEvent, SessionId};
use tokio::sync::mpsc;

use crate::commands::{self, Request};
use crate::ipc::{Frame, Reply};

pub struct Dispatcher {
    controller: Arc<LifecycleController>,
    frames: mpsc::Sender<Frame>,
    lanes: Mutex<HashMap<SessionId, mpsc::UnboundedSender<Request>>>,
}

impl Dispatcher {
    pub fn new(controller: Arc<LifecycleController>, frames: mpsc::Sender<Frame>) -> Self {
        Self {
            controller,
            frames,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<SessionId, mpsc::UnboundedSender<Request>>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Parse one request line and queue it. Must run inside the runtime.
    pub async fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        match serde_json::from_str::<Request>(line) {
            Ok(request) => self.submit(request),
            Err(e) => {
                log::warn!("malformed request: {e}");
                let event = SessionEvent::Error {
                    session_id: None,
                    message: format!("malformed request: {e}"),
                };
                let _ = self.frames.send(Frame::Event(event)).await;
            }
        }
    }

    fn submit(&self, request: Request) {
        let Some(session_id) = request.command.session_id() else {
            let controller = Arc::clone(&self.controller);
            let frames = self.frames.clone();
            tokio::spawn(run_request(controller, frames, request));
            return;
        };

        let mut lanes = self.lanes();
        let lane = lanes
            .entry(session_id)
            .or_insert_with(|| self.open_lane(session_id));
        if let Err(mpsc::error::SendError(request)) = lane.send(request) {
            // The lane's task is gone (runtime shutting down); replace it.
            let lane = self.open_lane(session_id);
            let _ = lane.send(request);
            lanes.insert(session_id, lane);
        }
    }

    fn open_lane(&self, session_id: SessionId) -> mpsc::UnboundedSender<Request> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Request>();
        let controller = Arc::clone(&self.controller);
        let frames = self.frames.clone();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                run_request(Arc::clone(&controller), frames.clone(), request).await;
            }
            log::debug!("session {session_id}: request lane closed");
        });
        tx
    }

    /// Drop a session's lane once the session is gone. Queued requests still
    /// run; later ones open a fresh lane.
    pub fn close_lane(&self, session_id: SessionId) {
        self.lanes().remove(&session_id);
    }

    pub fn open_lanes(&self) -> usize {
        self.lanes().len()
    }
}

/// Run one request on the blocking pool and send its reply.
async fn run_request(controller: Arc<LifecycleController>, frames: mpsc::Sender<Frame>, request: Request) {
    let id = request.id;
    let reply = tokio::task::spawn_blocking(move || commands::dispatch(&controller, request))
        .await
        .unwrap_or_else(|e| {
            log::error!("request {id} panicked: {e}");
            Reply::failed(id, "internal error")
        });
    let _ = frames.send(Frame::Reply(reply)).await;
}
