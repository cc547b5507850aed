use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::registry::SessionRegistry;

/// Outcome of a [`ShutdownCoordinator::shutdown`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions whose process was still live and got terminated.
    pub terminated: usize,
}

/// Terminates every registered session when the host goes away.
///
/// Safe to call any number of times and from any thread. Capacity is closed
/// before the registry is drained, so no `start` can register a session the
/// drain misses, and only the first call finds anything to do.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    registry: Arc<SessionRegistry>,
    capacity: Arc<Semaphore>,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<SessionRegistry>, capacity: Arc<Semaphore>) -> Self {
        Self { registry, capacity }
    }

    pub fn is_shut_down(&self) -> bool {
        self.capacity.is_closed()
    }

    pub fn shutdown(&self) -> ShutdownReport {
        self.capacity.close();
        let sessions = self.registry.drain();
        if sessions.is_empty() {
            log::debug!("shutdown: no live sessions");
            return ShutdownReport::default();
        }

        let mut report = ShutdownReport::default();
        for session in sessions {
            // Already exited sessions are only awaiting purge.
            if session.kill().is_ok() {
                report.terminated += 1;
            }
        }
        log::info!("shutdown: terminated {} session(s)", report.terminated);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::{shell_command, PtyHandle};
    use crate::session::{Session, SessionId, SessionState};
    use std::path::PathBuf;
    use std::thread;
    use std::time::{Duration, Instant};

    fn running_session(script: &str) -> (Arc<Session>, crate::pty::ExitWatch) {
        let (pty, output) = PtyHandle::spawn(shell_command(script), 80, 24).unwrap();
        let session = Arc::new(Session::new(SessionId::generate(), PathBuf::from("/tmp"), pty, None));
        session.mark_running();
        let (_reader, exit) = output.into_parts();
        (session, exit)
    }

    fn wait_exited(exit: crate::pty::ExitWatch) -> bool {
        let waiter = thread::spawn(move || exit.wait());
        let deadline = Instant::now() + Duration::from_secs(5);
        while !waiter.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        waiter.is_finished()
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let registry = Arc::new(SessionRegistry::new());
        let (first, first_exit) = running_session("sleep 30");
        let (second, second_exit) = running_session("sleep 30");
        registry.insert(Arc::clone(&first)).unwrap();
        registry.insert(Arc::clone(&second)).unwrap();

        let coordinator = ShutdownCoordinator::new(Arc::clone(&registry), Arc::new(Semaphore::new(3)));
        assert!(!coordinator.is_shut_down());
        assert_eq!(coordinator.shutdown(), ShutdownReport { terminated: 2 });
        assert!(coordinator.is_shut_down());
        assert!(registry.is_empty());
        assert_eq!(first.state(), SessionState::Killed);
        assert_eq!(second.state(), SessionState::Killed);

        assert_eq!(coordinator.clone().shutdown(), ShutdownReport { terminated: 0 });

        assert!(wait_exited(first_exit), "first process outlived shutdown");
        assert!(wait_exited(second_exit), "second process outlived shutdown");
    }

    #[test]
    fn test_shutdown_skips_exited_sessions() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, exit) = running_session("exit 0");
        assert!(wait_exited(exit));
        session.mark_exited(0);
        registry.insert(session).unwrap();

        let report = ShutdownCoordinator::new(Arc::clone(&registry), Arc::new(Semaphore::new(3))).shutdown();
        assert_eq!(report.terminated, 0);
        assert!(registry.is_empty());
    }
}
