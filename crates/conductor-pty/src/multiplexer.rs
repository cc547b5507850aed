use std::collections::HashSet;
use std::io::{ErrorKind, Read};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{Result, SessionError};
use crate::pty::{ExitWatch, PtyError, PtyOutput};
use crate::session::SessionId;

/// Events sent to the UI collaborator, tagged with the session they belong to.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Raw bytes read from the session's pty, exactly as the OS delivered them.
    Output { session_id: SessionId, data: Vec<u8> },
    /// The session's process terminated. Sent once, after all output.
    Exit { session_id: SessionId, exit_code: i32 },
    /// An asynchronous failure the UI should surface.
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        message: String,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            SessionEvent::Output { session_id, .. } | SessionEvent::Exit { session_id, .. } => {
                Some(*session_id)
            }
            SessionEvent::Error { session_id, .. } => *session_id,
        }
    }
}

/// Told about a session's exit by its output thread.
///
/// `process_exited` runs before the exit event is emitted, `exit_delivered`
/// right after it, both on the session's output thread.
pub trait ExitObserver: Send + Sync {
    fn process_exited(&self, id: SessionId, exit_code: i32);
    fn exit_delivered(&self, id: SessionId);
}

/// Handle to one session's output thread.
pub struct Subscription {
    session_id: SessionId,
    thread: JoinHandle<()>,
}

impl Subscription {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Whether the exit event has been emitted and the thread is done.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the session's output stream has been fully forwarded.
    pub fn join(self) {
        if self.thread.join().is_err() {
            log::warn!("session {}: output thread panicked", self.session_id);
        }
    }
}

/// Fans the output of every session into one event channel.
///
/// Each subscription gets a dedicated OS thread, because pty reads block.
/// An id holds at most one subscription at a time; it is released once the
/// exit event has been delivered.
pub struct StreamMultiplexer {
    events: mpsc::Sender<SessionEvent>,
    subscribed: Arc<Mutex<HashSet<SessionId>>>,
    read_buffer: usize,
}

impl StreamMultiplexer {
    pub fn new(events: mpsc::Sender<SessionEvent>, read_buffer: usize) -> Self {
        Self {
            events,
            subscribed: Arc::new(Mutex::new(HashSet::new())),
            read_buffer: read_buffer.max(1),
        }
    }

    fn subscribed(&self) -> MutexGuard<'_, HashSet<SessionId>> {
        lock_ids(&self.subscribed)
    }

    pub fn is_subscribed(&self, id: &SessionId) -> bool {
        self.subscribed().contains(id)
    }

    /// Start forwarding a session's output and exit to the event channel.
    pub fn subscribe(
        &self,
        id: SessionId,
        output: PtyOutput,
        observer: Arc<dyn ExitObserver>,
    ) -> Result<Subscription> {
        if !self.subscribed().insert(id) {
            return Err(SessionError::AlreadySubscribed(id));
        }

        let (reader, exit) = output.into_parts();
        let pump = OutputPump {
            id,
            events: self.events.clone(),
            observer,
            subscribed: Arc::clone(&self.subscribed),
            buf: vec![0u8; self.read_buffer],
        };

        let thread = std::thread::Builder::new()
            .name(format!("pty-io-{id}"))
            .spawn(move || pump.run(reader, exit))
            .map_err(|e| {
                self.subscribed().remove(&id);
                PtyError::from(e)
            })?;

        log::debug!("session {id}: output subscription opened");
        Ok(Subscription {
            session_id: id,
            thread,
        })
    }
}

struct OutputPump {
    id: SessionId,
    events: mpsc::Sender<SessionEvent>,
    observer: Arc<dyn ExitObserver>,
    subscribed: Arc<Mutex<HashSet<SessionId>>>,
    buf: Vec<u8>,
}

fn lock_ids(ids: &Mutex<HashSet<SessionId>>) -> MutexGuard<'_, HashSet<SessionId>> {
    ids.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OutputPump {
    fn run(mut self, mut reader: Box<dyn Read + Send>, exit: ExitWatch) {
        let mut consumer_gone = false;

        loop {
            // Blocks until data is available or the pty closes.
            let n = match reader.read(&mut self.buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break, // EIO once the child side of the pty is gone
            };

            // Keep draining after the consumer leaves so the child never
            // stalls on a full terminal buffer.
            if consumer_gone {
                continue;
            }
            let event = SessionEvent::Output {
                session_id: self.id,
                data: self.buf[..n].to_vec(),
            };
            if self.events.blocking_send(event).is_err() {
                log::debug!("session {}: event consumer gone, discarding output", self.id);
                consumer_gone = true;
            }
        }
        drop(reader);

        let exit_code = match exit.wait() {
            Ok(code) => i32::try_from(code).unwrap_or(-1),
            Err(e) => {
                log::warn!("session {}: failed to reap process: {e}", self.id);
                self.emit(SessionEvent::Error {
                    session_id: Some(self.id),
                    message: format!("failed to reap session process: {e}"),
                });
                -1
            }
        };

        self.observer.process_exited(self.id, exit_code);
        self.emit(SessionEvent::Exit {
            session_id: self.id,
            exit_code,
        });
        self.observer.exit_delivered(self.id);
        lock_ids(&self.subscribed).remove(&self.id);
        log::debug!("session {}: output subscription closed", self.id);
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.blocking_send(event).is_err() {
            log::debug!("session {}: event consumer gone", self.id);
        }
    }
}

/// Receive the next event, giving up after `timeout`.
#[cfg(test)]
pub(crate) fn recv_timeout(
    rx: &mut mpsc::Receiver<SessionEvent>,
    timeout: std::time::Duration,
) -> Option<SessionEvent> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        match rx.try_recv() {
            Ok(event) => return Some(event),
            Err(mpsc::error::TryRecvError::Disconnected) => return None,
            Err(mpsc::error::TryRecvError::Empty) => {}
        }
        if std::time::Instant::now() > deadline {
            return None;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}
