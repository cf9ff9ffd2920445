//! Process handle for worker subprocesses.
//!
//! Workers publish their results through the shared state database, so
//! the handle only carries process control: liveness polling, reaping,
//! and escalating shutdown.

use crate::error::{MbxError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::Duration;

/// Handle to a worker subprocess.
pub struct Proc {
    /// Process ID
    pid: Pid,
    /// Whether the process has been reaped
    reaped: bool,
}

impl Proc {
    /// Create from a spawned `std::process::Child`.
    ///
    /// The child's stdio was redirected at spawn time; only the pid is
    /// kept. Reaping happens through `waitpid`, never through the
    /// `Child` handle.
    pub fn from_child(child: &std::process::Child) -> Self {
        Self {
            pid: Pid::from_raw(child.id() as i32),
            reaped: false,
        }
    }

    /// Get the process ID.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        if self.reaped {
            return false;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(_) => {
                self.reaped = true;
                false
            }
            Err(_) => {
                self.reaped = true;
                false
            }
        }
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if self.reaped {
            return Err(MbxError::Worker("Process already reaped".into()));
        }
        match waitpid(self.pid, None) {
            Ok(status) => {
                self.reaped = true;
                Ok(status)
            }
            Err(e) => Err(MbxError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// Try to wait for the process (non-blocking).
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if self.reaped {
            return Err(MbxError::Worker("Process already reaped".into()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.reaped = true;
                Ok(Some(status))
            }
            Err(e) => Err(MbxError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| MbxError::Worker(format!("Failed to send SIGTERM: {}", e)))
    }

    /// Send SIGKILL to the process and wait for it to exit.
    pub fn kill(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| MbxError::Worker(format!("Failed to send SIGKILL: {}", e)))?;
        self.wait()?;
        Ok(())
    }

    /// Gracefully stop the worker: SIGTERM, wait up to `timeout`, then
    /// SIGKILL if it refuses to die.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        if self.reaped {
            return Ok(());
        }

        let _ = self.terminate();

        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if let Ok(Some(_)) = self.try_wait() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        // Still running: SIGKILL
        self.kill()
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.terminate();
            std::thread::sleep(Duration::from_millis(10));

            if let Ok(Some(_)) = self.try_wait() {
                return;
            }

            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.reaped = true;
        }
    }
}

impl std::fmt::Debug for Proc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proc")
            .field("pid", &self.pid)
            .field("reaped", &self.reaped)
            .finish()
    }
}

/// Signal-0 liveness probe for an arbitrary pid.
///
/// EPERM means the process exists but belongs to someone else, which
/// still counts as alive.
pub fn process_alive(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}
