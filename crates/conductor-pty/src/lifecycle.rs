//! The session manager's front door.
//!
//! [`LifecycleController`] validates requests, reserves capacity, launches
//! the process, registers the session and hooks its output up to the
//! [`StreamMultiplexer`]. Sessions leave the registry on `stop`, or on their
//! own once the multiplexer has delivered their exit event.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, Semaphore, TryAcquireError};

use crate::config::ManagerConfig;
use crate::error::{Result, SessionError};
use crate::launcher::{LaunchedProcess, ProcessLauncher};
use crate::multiplexer::{ExitObserver, SessionEvent, StreamMultiplexer, Subscription};
use crate::registry::{SessionInfo, SessionRegistry};
use crate::session::{Session, SessionId, SessionState};
use crate::shutdown::ShutdownCoordinator;

/// Keeps the registry in step with exits reported by the multiplexer.
struct RegistryPurger {
    registry: Arc<SessionRegistry>,
}

impl ExitObserver for RegistryPurger {
    fn process_exited(&self, id: SessionId, exit_code: i32) {
        if let Some(session) = self.registry.get(&id) {
            if session.mark_exited(exit_code) {
                log::info!("session {id} exited with code {exit_code}");
            }
        }
    }

    fn exit_delivered(&self, id: SessionId) {
        if self.registry.remove(&id).is_some() {
            log::debug!("session {id} purged");
        }
    }
}

pub struct LifecycleController {
    config: ManagerConfig,
    registry: Arc<SessionRegistry>,
    launcher: ProcessLauncher,
    multiplexer: StreamMultiplexer,
    capacity: Arc<Semaphore>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl LifecycleController {
    /// Build a controller whose session events go to `events`.
    ///
    /// `max_sessions` is capped at what a semaphore can count.
    pub fn new(mut config: ManagerConfig, events: mpsc::Sender<SessionEvent>) -> Self {
        if config.max_sessions > Semaphore::MAX_PERMITS {
            log::warn!(
                "max_sessions {} capped at {}",
                config.max_sessions,
                Semaphore::MAX_PERMITS
            );
            config.max_sessions = Semaphore::MAX_PERMITS;
        }
        Self {
            registry: Arc::new(SessionRegistry::new()),
            launcher: ProcessLauncher::new(config.launch.clone()),
            multiplexer: StreamMultiplexer::new(events, config.read_buffer),
            capacity: Arc::new(Semaphore::new(config.max_sessions)),
            subscriptions: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Start a session in `path` and return its id.
    ///
    /// Fails with `ShuttingDown` once the shutdown coordinator has run,
    /// including when shutdown lands while the process is being spawned.
    pub fn start(&self, path: impl AsRef<Path>) -> Result<SessionId> {
        if self.capacity.is_closed() {
            return Err(SessionError::ShuttingDown);
        }
        let path = path.as_ref();
        let working_dir = match path.canonicalize() {
            Ok(dir) if dir.is_dir() => dir,
            _ => return Err(SessionError::PathNotFound(path.to_path_buf())),
        };

        if self.config.coalesce_by_path {
            if let Some(existing) = self.registry.find_by_path(&working_dir) {
                if existing.state() == SessionState::Running {
                    log::info!(
                        "reusing session {} for {}",
                        existing.id(),
                        working_dir.display()
                    );
                    return Ok(existing.id());
                }
            }
        }

        let permit = Arc::clone(&self.capacity)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::Closed => SessionError::ShuttingDown,
                TryAcquireError::NoPermits => {
                    log::warn!(
                        "rejecting session for {}: {} live sessions",
                        working_dir.display(),
                        self.config.max_sessions
                    );
                    SessionError::CapacityExceeded {
                        max: self.config.max_sessions,
                    }
                }
            })?;

        let LaunchedProcess {
            id,
            program,
            pty,
            output,
        } = self.launcher.launch(&working_dir)?;

        let session = Arc::new(Session::new(id, working_dir, pty, Some(permit)));
        // On failure the session is dropped here, which kills its process.
        self.registry.insert(Arc::clone(&session))?;

        // Shutdown closes capacity before draining. Seeing it open here means
        // the drain, if any, comes later and will find this entry.
        if self.capacity.is_closed() {
            log::info!("session {id} abandoned: shutdown in progress");
            self.discard(&session);
            return Err(SessionError::ShuttingDown);
        }

        let observer = Arc::new(RegistryPurger {
            registry: Arc::clone(&self.registry),
        });
        match self.multiplexer.subscribe(id, output, observer) {
            Ok(subscription) => self.track(subscription),
            Err(e) => {
                self.discard(&session);
                return Err(e);
            }
        }

        // A process that already exited stays Exited.
        session.mark_running();
        log::info!(
            "session {id} started in {} ({})",
            session.working_dir().display(),
            program.display()
        );
        Ok(id)
    }

    /// Terminate a session and drop it from the registry.
    pub fn stop(&self, id: SessionId) -> Result<()> {
        let session = self
            .registry
            .remove(&id)
            .ok_or(SessionError::SessionNotFound(id))?;
        session.kill()?;
        log::info!("session {id} stopped");
        Ok(())
    }

    /// Stop every live session. Returns how many were stopped.
    pub fn stop_all(&self) -> usize {
        self.registry
            .list()
            .into_iter()
            .filter(|info| self.stop(info.id).is_ok())
            .count()
    }

    pub fn write(&self, id: SessionId, data: &[u8]) -> Result<()> {
        self.session(id)?.write_input(data)
    }

    pub fn resize(&self, id: SessionId, cols: u16, rows: u16) -> Result<()> {
        self.session(id)?.resize(cols, rows)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.registry.get(&id)
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.registry.list()
    }

    pub fn shutdown_coordinator(&self) -> ShutdownCoordinator {
        ShutdownCoordinator::new(Arc::clone(&self.registry), Arc::clone(&self.capacity))
    }

    /// Number of sessions whose output thread has not yet reported an exit.
    pub fn pending_streams(&self) -> usize {
        let mut subscriptions = self.subscriptions();
        subscriptions.retain(|s| !s.is_finished());
        subscriptions.len()
    }

    /// Undo a half-finished `start`.
    fn discard(&self, session: &Session) {
        // Already drained (and killed) by shutdown.
        if self.registry.remove(&session.id()).is_none() {
            return;
        }
        if let Err(e) = session.kill() {
            log::warn!("session {}: failed to discard: {e}", session.id());
        }
    }

    fn session(&self, id: SessionId) -> Result<Arc<Session>> {
        self.registry
            .get(&id)
            .ok_or(SessionError::SessionNotFound(id))
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, subscription: Subscription) {
        let mut subscriptions = self.subscriptions();
        subscriptions.retain(|s| !s.is_finished());
        subscriptions.push(subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaunchConfig;
    use crate::multiplexer::recv_timeout;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::thread;
    use std::time::{Duration, Instant};

    fn shell_config(args: &[&str], max_sessions: usize) -> ManagerConfig {
        ManagerConfig {
            max_sessions,
            launch: LaunchConfig {
                executable: Some(PathBuf::from("/bin/sh")),
                args: args.iter().map(|a| a.to_string()).collect(),
                ..LaunchConfig::default()
            },
            ..ManagerConfig::default()
        }
    }

    fn controller(args: &[&str], max_sessions: usize) -> (LifecycleController, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(256);
        (LifecycleController::new(shell_config(args, max_sessions), tx), rx)
    }

    /// Read events until output for `id` contains `needle`.
    fn wait_for_output(rx: &mut mpsc::Receiver<SessionEvent>, id: SessionId, needle: &str) -> bool {
        let mut collected = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match recv_timeout(rx, Duration::from_millis(200)) {
                Some(SessionEvent::Output { session_id, data }) if session_id == id => {
                    collected.extend_from_slice(&data);
                    if String::from_utf8_lossy(&collected).contains(needle) {
                        return true;
                    }
                }
                Some(SessionEvent::Exit { session_id, .. }) if session_id == id => return false,
                _ => {}
            }
        }
        false
    }

    /// Read events until `id` reports its exit code.
    fn wait_for_exit(rx: &mut mpsc::Receiver<SessionEvent>, id: SessionId) -> Option<i32> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(SessionEvent::Exit {
                session_id,
                exit_code,
            }) = recv_timeout(rx, Duration::from_millis(200))
            {
                if session_id == id {
                    return Some(exit_code);
                }
            }
        }
        None
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        condition()
    }

    #[test]
    fn test_start_missing_path() {
        let (controller, _rx) = controller(&[], 3);
        let result = controller.start("/nonexistent/conductor/workspace");
        assert!(matches!(result, Err(SessionError::PathNotFound(_))));
        assert!(controller.list().is_empty());
    }

    #[test]
    fn test_start_file_is_not_a_directory() {
        let (controller, _rx) = controller(&[], 3);
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = controller.start(file.path());
        assert!(matches!(result, Err(SessionError::PathNotFound(_))));
        assert!(controller.list().is_empty());
    }

    #[test]
    fn test_start_write_stop() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, mut rx) = controller(&[], 3);

        let id = controller.start(dir.path()).unwrap();
        let session = controller.get(id).unwrap();
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.working_dir(), dir.path().canonicalize().unwrap());
        drop(session);

        controller.write(id, b"echo CONDUCTOR_S1\n").unwrap();
        assert!(wait_for_output(&mut rx, id, "CONDUCTOR_S1"));

        controller.stop(id).unwrap();
        assert!(controller.get(id).is_none());
        assert!(matches!(
            controller.write(id, b"pwd\n"),
            Err(SessionError::SessionNotFound(missing)) if missing == id
        ));
        assert!(matches!(controller.stop(id), Err(SessionError::SessionNotFound(_))));

        // The killed process still reports exactly one exit.
        assert!(wait_for_exit(&mut rx, id).is_some());
    }

    #[test]
    fn test_capacity_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _rx) = controller(&["-c", "sleep 30"], 2);

        let first = controller.start(dir.path()).unwrap();
        controller.start(dir.path()).unwrap();
        let result = controller.start(dir.path());
        assert!(matches!(result, Err(SessionError::CapacityExceeded { max: 2 })));
        assert_eq!(controller.list().len(), 2);

        controller.stop(first).unwrap();
        assert!(controller.start(dir.path()).is_ok());

        assert_eq!(controller.shutdown_coordinator().shutdown().terminated, 2);
    }

    #[test]
    fn test_spawn_failure_leaves_no_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let mut config = shell_config(&[], 1);
        config.launch.executable = Some(PathBuf::from("/nonexistent/claude"));
        let controller = LifecycleController::new(config, tx);

        // The permit is returned each time, so the cap never trips.
        for _ in 0..2 {
            let result = controller.start(dir.path());
            assert!(matches!(result, Err(SessionError::SpawnFailure(_))));
        }
        assert!(controller.list().is_empty());
    }

    #[test]
    fn test_exited_session_is_purged() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, mut rx) = controller(&["-c", "exit 5"], 1);

        let id = controller.start(dir.path()).unwrap();
        assert_eq!(wait_for_exit(&mut rx, id), Some(5));
        assert!(wait_until(|| controller.get(id).is_none()));
        assert!(wait_until(|| controller.pending_streams() == 0));

        // The slot is free again.
        let next = controller.start(dir.path()).unwrap();
        assert_ne!(next, id);
        assert_eq!(wait_for_exit(&mut rx, next), Some(5));
    }

    #[test]
    fn test_concurrent_starts() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let (controller, _rx) = controller(&["-c", "sleep 30"], 3);
        let controller = Arc::new(controller);

        let handles: Vec<_> = [a.path().to_path_buf(), b.path().to_path_buf()]
            .into_iter()
            .map(|path| {
                let controller = Arc::clone(&controller);
                thread::spawn(move || controller.start(path).unwrap())
            })
            .collect();
        let ids: HashSet<SessionId> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(ids.len(), 2);
        for id in &ids {
            assert_eq!(controller.get(*id).unwrap().state(), SessionState::Running);
        }
        assert_eq!(controller.list().len(), 2);
        assert_eq!(controller.stop_all(), 2);
        assert!(controller.list().is_empty());
    }

    #[test]
    fn test_resize_keeps_output_flowing() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, mut rx) = controller(&[], 3);
        let id = controller.start(dir.path()).unwrap();
        assert_eq!(controller.get(id).unwrap().size(), (120, 30));

        controller.resize(id, 80, 24).unwrap();
        assert_eq!(controller.get(id).unwrap().size(), (80, 24));
        controller.write(id, b"stty size\n").unwrap();
        assert!(wait_for_output(&mut rx, id, "24 80"));

        assert!(matches!(
            controller.resize(id, 80, 0),
            Err(SessionError::InvalidGeometry { .. })
        ));
        assert!(matches!(
            controller.resize(SessionId::generate(), 80, 24),
            Err(SessionError::SessionNotFound(_))
        ));
        controller.stop(id).unwrap();
    }

    #[test]
    fn test_shutdown_twice_leaves_no_processes() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, mut rx) = controller(&["-c", "sleep 30"], 3);
        let first = controller.start(dir.path()).unwrap();
        let second = controller.start(dir.path()).unwrap();

        let coordinator = controller.shutdown_coordinator();
        assert_eq!(coordinator.shutdown().terminated, 2);
        assert_eq!(coordinator.shutdown().terminated, 0);
        assert!(controller.list().is_empty());

        let mut exited = HashSet::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while exited.len() < 2 && Instant::now() < deadline {
            if let Some(SessionEvent::Exit { session_id, .. }) =
                recv_timeout(&mut rx, Duration::from_millis(200))
            {
                exited.insert(session_id);
            }
        }
        assert_eq!(exited, HashSet::from([first, second]));
        assert!(wait_until(|| controller.pending_streams() == 0));
    }

    #[test]
    fn test_start_after_shutdown_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _rx) = controller(&["-c", "sleep 30"], 3);

        controller.shutdown_coordinator().shutdown();
        assert!(matches!(controller.start(dir.path()), Err(SessionError::ShuttingDown)));
        assert!(controller.list().is_empty());
        assert_eq!(controller.pending_streams(), 0);
    }

    #[test]
    fn test_shutdown_racing_starts_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(4096);
        let controller = Arc::new(LifecycleController::new(shell_config(&["-c", "sleep 30"], 1024), tx));

        let starters: Vec<_> = (0..2)
            .map(|_| {
                let controller = Arc::clone(&controller);
                let path = dir.path().to_path_buf();
                thread::spawn(move || loop {
                    if let Err(e) = controller.start(&path) {
                        return e;
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        controller.shutdown_coordinator().shutdown();

        for starter in starters {
            let err = starter.join().unwrap();
            assert!(matches!(err, SessionError::ShuttingDown), "unexpected error: {err}");
        }
        assert!(controller.list().is_empty(), "a session registered after shutdown");
        assert!(wait_until(|| controller.pending_streams() == 0));
    }

    #[test]
    fn test_max_sessions_is_capped() {
        let (controller, _rx) = controller(&[], usize::MAX);
        assert_eq!(controller.config().max_sessions, Semaphore::MAX_PERMITS);
    }

    #[test]
    fn test_coalesce_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let mut config = shell_config(&["-c", "sleep 30"], 1);
        config.coalesce_by_path = true;
        let controller = LifecycleController::new(config, tx);

        let first = controller.start(dir.path()).unwrap();
        let again = controller.start(dir.path()).unwrap();
        assert_eq!(first, again);
        assert_eq!(controller.list().len(), 1);

        controller.stop(first).unwrap();
    }

    #[test]
    fn test_without_coalescing_each_start_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _rx) = controller(&["-c", "sleep 30"], 3);

        let first = controller.start(dir.path()).unwrap();
        let second = controller.start(dir.path()).unwrap();
        assert_ne!(first, second);
        assert_eq!(controller.stop_all(), 2);
    }
}
