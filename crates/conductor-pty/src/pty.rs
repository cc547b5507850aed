use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtyPair, PtySize,
};

/// Interval between reap attempts once the output stream has closed.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Errors from PTY operations.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("PTY spawn failed: {0}")]
    SpawnFailed(String),
    #[error("PTY I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("PTY resize failed: {0}")]
    ResizeFailed(String),
    #[error("PTY kill failed: {0}")]
    KillFailed(String),
}

type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

fn lock_child(child: &SharedChild) -> MutexGuard<'_, Box<dyn Child + Send + Sync>> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The controlling side of a spawned pty: input, geometry, and termination.
///
/// Owned by exactly one [`Session`](crate::Session). The output side is
/// handed out separately as a [`PtyOutput`] so reads can block on their own
/// thread without holding the session lock.
pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: SharedChild,
    pid: Option<u32>,
    size: (u16, u16),
}

/// The output side of a spawned pty: the byte stream and a wait-only view of
/// the child process.
pub struct PtyOutput {
    reader: Box<dyn Read + Send>,
    exit: ExitWatch,
}

/// Waits for a pty child to terminate. Cannot signal the process.
pub struct ExitWatch {
    child: SharedChild,
}

impl PtyHandle {
    /// Open a pty of the given size and spawn `cmd` attached to it.
    pub fn spawn(cmd: CommandBuilder, cols: u16, rows: u16) -> Result<(Self, PtyOutput), PtyError> {
        let pty_system = native_pty_system();

        let PtyPair { master, slave } = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let child = slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("failed to spawn command: {e}")))?;

        // The child holds its own copy of the slave; ours must go so the
        // reader sees EOF once the child is gone.
        drop(slave);

        let pid = child.process_id();
        let child: SharedChild = Arc::new(Mutex::new(child));

        let reader = master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to clone reader: {e}")))?;

        let writer = master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to take writer: {e}")))?;

        let handle = Self {
            master,
            writer,
            child: Arc::clone(&child),
            pid,
            size: (cols, rows),
        };
        let output = PtyOutput {
            reader,
            exit: ExitWatch { child },
        };
        Ok((handle, output))
    }

    /// Resize the PTY to new dimensions.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(format!("{e}")))?;
        self.size = (cols, rows);
        Ok(())
    }

    /// Write bytes to the PTY master (user input -> child).
    pub fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Terminate the child process.
    ///
    /// Sends SIGHUP first and escalates to a hard kill if the child is still
    /// around after a short grace period. A child that has already been
    /// reaped is left alone so a recycled pid is never signalled.
    pub fn kill(&self) -> Result<(), PtyError> {
        let mut child = lock_child(&self.child);
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }
        child
            .kill()
            .map_err(|e| PtyError::KillFailed(e.to_string()))
    }

    /// Check if the child process is still alive.
    pub fn is_alive(&self) -> bool {
        matches!(lock_child(&self.child).try_wait(), Ok(None))
    }

    /// OS process id of the child, if the platform reports one.
    pub fn process_id(&self) -> Option<u32> {
        self.pid
    }

    /// Current terminal size as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        self.size
    }
}

impl PtyOutput {
    pub fn into_parts(self) -> (Box<dyn Read + Send>, ExitWatch) {
        (self.reader, self.exit)
    }
}

impl ExitWatch {
    /// Block until the child has exited and return its exit code.
    ///
    /// Meant to be called after the output stream reports EOF, at which
    /// point the child is gone or about to be.
    pub fn wait(self) -> std::io::Result<u32> {
        loop {
            if let Some(status) = lock_child(&self.child).try_wait()? {
                return Ok(status.exit_code());
            }
            std::thread::sleep(REAP_POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
pub(crate) fn shell_command(script: &str) -> CommandBuilder {
    let mut cmd = CommandBuilder::new("/bin/sh");
    cmd.args(["-c", script]);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    /// Drain `reader` on a background thread until EOF.
    fn drain(mut reader: Box<dyn Read + Send>) -> thread::JoinHandle<Vec<u8>> {
        thread::spawn(move || {
            let mut output = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => return output,
                    Ok(n) => output.extend_from_slice(&buf[..n]),
                }
            }
        })
    }

    #[test]
    fn test_spawn_pty() {
        let result = PtyHandle::spawn(CommandBuilder::new("/bin/sh"), 80, 24);
        assert!(result.is_ok(), "Failed to spawn PTY: {:?}", result.err().map(|e| e.to_string()));
        let (handle, _output) = result.unwrap();
        assert!(handle.is_alive());
        assert_eq!(handle.size(), (80, 24));
        handle.kill().unwrap();
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        let cmd = CommandBuilder::new("/nonexistent/conductor-test-binary");
        let result = PtyHandle::spawn(cmd, 80, 24);
        assert!(matches!(result, Err(PtyError::SpawnFailed(_))));
    }

    #[test]
    fn test_write_read_echo() {
        let (mut handle, output) = PtyHandle::spawn(CommandBuilder::new("/bin/sh"), 80, 24).unwrap();
        let (reader, exit) = output.into_parts();
        let drained = drain(reader);

        handle.write(b"echo CONDUCTOR_TEST_OK\n").unwrap();
        handle.write(b"exit 0\n").unwrap();

        let text = String::from_utf8_lossy(&drained.join().unwrap()).to_string();
        assert!(
            text.contains("CONDUCTOR_TEST_OK"),
            "Expected output to contain CONDUCTOR_TEST_OK, got: {text}"
        );
        assert_eq!(exit.wait().unwrap(), 0);
    }

    #[test]
    fn test_resize() {
        let (mut handle, _output) = PtyHandle::spawn(CommandBuilder::new("/bin/sh"), 80, 24).unwrap();
        let result = handle.resize(120, 40);
        assert!(result.is_ok(), "Resize failed: {:?}", result.err().map(|e| e.to_string()));
        assert_eq!(handle.size(), (120, 40));
        handle.kill().unwrap();
    }

    #[test]
    fn test_child_exit_code() {
        let (_handle, output) = PtyHandle::spawn(shell_command("exit 3"), 80, 24).unwrap();
        let (reader, exit) = output.into_parts();
        drain(reader).join().unwrap();
        assert_eq!(exit.wait().unwrap(), 3);
    }

    #[test]
    fn test_kill_terminates_child() {
        let (handle, output) = PtyHandle::spawn(shell_command("sleep 30"), 80, 24).unwrap();
        let (reader, exit) = output.into_parts();
        let drained = drain(reader);

        handle.kill().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert!(!handle.is_alive(), "Child should have been killed");
        drained.join().unwrap();
        assert!(exit.wait().is_ok());
    }

    #[test]
    fn test_kill_after_exit_is_noop() {
        let (handle, output) = PtyHandle::spawn(shell_command("exit 0"), 80, 24).unwrap();
        let (reader, exit) = output.into_parts();
        drain(reader).join().unwrap();
        exit.wait().unwrap();

        assert!(handle.kill().is_ok());
    }
}
