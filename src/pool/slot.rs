//! One worker slot in the pool.
//!
//! A slot is a named position that is either empty or occupied by a
//! worker process. The supervisor restarts occupants in place, so the
//! slot name (and its log file) outlives any single process.

use super::proc::Proc;
use crate::config::RunConfig;
use crate::error::Result;
use crate::store::RecordStore;
use nix::sys::wait::WaitStatus;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{info, warn};

/// Grace period between SIGTERM and SIGKILL when stopping a slot.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a slot.
#[derive(Debug)]
pub enum SlotState {
    /// No process; nothing to restart.
    Stopped,
    /// Spawn in progress.
    Starting,
    /// Occupied by a live (or not-yet-reaped) process.
    Running(Proc),
    /// The occupant died without a clean exit.
    Failed,
}

pub struct Slot {
    name: String,
    state: SlotState,
    log_path: PathBuf,
    /// Pid of the current or most recent occupant. Needed after death,
    /// when the Proc is already gone.
    last_pid: Option<u32>,
}

/// Argument vector for the hidden `worker` subcommand.
fn worker_args(config: &RunConfig, slot_name: &str) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "worker".into(),
        "--db".into(),
        config.db_path.clone().into(),
        "--mail-root".into(),
        config.mail_root.clone().into(),
        "--export-root".into(),
        config.export_root.clone().into(),
        "--slot".into(),
        slot_name.into(),
        "--retry-backoff".into(),
        config.retry_backoff.as_secs().to_string().into(),
    ];
    if !config.mail_suffix.is_empty() {
        args.push("--mail-suffix".into());
        args.push(config.mail_suffix.clone().into());
    }
    if let Some(date) = config.start_date {
        args.push("--start-date".into());
        args.push(date.to_string().into());
    }
    args
}

impl Slot {
    pub fn new(index: usize, config: &RunConfig) -> Self {
        let name = format!("worker-{}", index);
        let log_path = config.log_dir.join(format!("{}.log", name));
        Self {
            name,
            state: SlotState::Stopped,
            log_path,
            last_pid: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &SlotState {
        &self.state
    }

    /// Pid of the current or most recent occupant.
    pub fn last_pid(&self) -> Option<u32> {
        self.last_pid
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SlotState::Running(_))
    }

    /// Spawn a worker process into this slot. The worker re-executes the
    /// current binary with the hidden `worker` subcommand; its stdout
    /// and stderr both go to the slot's log file.
    pub fn start(&mut self, config: &RunConfig) -> Result<()> {
        self.state = SlotState::Starting;
        std::fs::create_dir_all(&config.log_dir)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        let log_err = log.try_clone()?;

        let exe = std::env::current_exe()?;
        let child = Command::new(exe)
            .args(worker_args(config, &self.name))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()?;

        let pid = child.id();
        info!(slot = %self.name, pid, log = %self.log_path.display(), "Worker spawned");
        self.last_pid = Some(pid);
        self.state = SlotState::Running(Proc::from_child(&child));
        Ok(())
    }

    /// Poll the occupant and fold a finished process into the slot
    /// state: clean exit becomes Stopped, anything else Failed.
    pub fn check(&mut self) -> &SlotState {
        if let SlotState::Running(proc) = &mut self.state {
            match proc.try_wait() {
                Ok(None) => {}
                Ok(Some(WaitStatus::Exited(_, 0))) => {
                    info!(slot = %self.name, "Worker exited cleanly");
                    self.state = SlotState::Stopped;
                }
                Ok(Some(status)) => {
                    warn!(slot = %self.name, ?status, "Worker died");
                    self.state = SlotState::Failed;
                }
                Err(e) => {
                    warn!(slot = %self.name, error = %e, "Worker poll failed");
                    self.state = SlotState::Failed;
                }
            }
        }
        &self.state
    }

    /// Stop the occupant and fail over its claimed queue items so a
    /// later run can pick them up.
    pub fn stop(&mut self, store: &RecordStore) -> Result<()> {
        if let SlotState::Running(proc) = &mut self.state {
            let pid = proc.pid().as_raw() as u32;
            proc.stop(STOP_TIMEOUT)?;
            let failed = store.fail_owned_by(pid)?;
            if failed > 0 {
                warn!(slot = %self.name, pid, failed, "Reassigned items from stopped worker");
            }
        }
        self.state = SlotState::Stopped;
        Ok(())
    }

    /// Stop (if needed) and spawn a fresh occupant.
    pub fn restart(&mut self, config: &RunConfig, store: &RecordStore) -> Result<()> {
        self.stop(store)?;
        self.start(config)
    }

    /// Adopt an already-spawned child as this slot's occupant.
    #[cfg(test)]
    pub(crate) fn occupy(&mut self, child: &std::process::Child) {
        self.last_pid = Some(child.id());
        self.state = SlotState::Running(Proc::from_child(child));
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("last_pid", &self.last_pid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_args_minimal() {
        let config = RunConfig {
            db_path: PathBuf::from("/tmp/state.db"),
            mail_root: PathBuf::from("/tmp/mail"),
            export_root: PathBuf::from("/tmp/export"),
            ..Default::default()
        };
        let args = worker_args(&config, "worker-0");
        assert_eq!(args[0], "worker");
        assert!(args.contains(&OsString::from("--db")));
        assert!(args.contains(&OsString::from("/tmp/state.db")));
        assert!(args.contains(&OsString::from("worker-0")));
        assert!(!args.contains(&OsString::from("--start-date")));
        assert!(!args.contains(&OsString::from("--mail-suffix")));
    }

    #[test]
    fn test_worker_args_with_resume_and_suffix() {
        let config = RunConfig {
            start_date: Some(chrono::NaiveDate::from_ymd_opt(2015, 6, 1).unwrap()),
            mail_suffix: "@example.org".to_string(),
            ..Default::default()
        };
        let args = worker_args(&config, "worker-1");
        assert!(args.contains(&OsString::from("--start-date")));
        assert!(args.contains(&OsString::from("2015-06-01")));
        assert!(args.contains(&OsString::from("--mail-suffix")));
        assert!(args.contains(&OsString::from("@example.org")));
    }

    #[test]
    fn test_new_slot_is_stopped() {
        let slot = Slot::new(3, &RunConfig::default());
        assert_eq!(slot.name(), "worker-3");
        assert!(!slot.is_running());
        assert!(slot.last_pid().is_none());
        assert!(matches!(slot.state(), SlotState::Stopped));
    }
}
