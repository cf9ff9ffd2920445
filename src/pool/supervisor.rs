//! Pool supervisor: keeps worker slots occupied until the queue drains.
//!
//! The supervisor polls on a fixed interval. Each pass folds dead
//! processes into slot state, fails over their claimed queue items,
//! detects items stuck in PROCESSING past the timeout, reconciles job
//! records against OS liveness, and samples progress. SIGTERM and
//! SIGINT flip a flag that the next pass turns into an orderly stop.

use super::proc::process_alive;
use super::slot::{Slot, SlotState};
use crate::config::RunConfig;
use crate::error::{MbxError, Result};
use crate::progress::ProgressReporter;
use crate::queue::WorkQueue;
use crate::store::RecordStore;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_sig: nix::libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Route SIGTERM and SIGINT to the shutdown flag.
pub fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        signal::sigaction(Signal::SIGTERM, &action)
            .map_err(|e| MbxError::Worker(format!("sigaction SIGTERM failed: {}", e)))?;
        signal::sigaction(Signal::SIGINT, &action)
            .map_err(|e| MbxError::Worker(format!("sigaction SIGINT failed: {}", e)))?;
    }
    Ok(())
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Supervises a pool of worker slots against the shared state database.
pub struct Supervisor {
    config: RunConfig,
    slots: Vec<Slot>,
    store: RecordStore,
    queue: WorkQueue,
    reporter: ProgressReporter,
}

impl Supervisor {
    pub fn new(config: RunConfig) -> Result<Self> {
        let store = RecordStore::open(&config.db_path)?;
        let queue = WorkQueue::open(&config.db_path)?;
        let slots = (0..config.pool_size)
            .map(|i| Slot::new(i, &config))
            .collect();
        let reporter = ProgressReporter::new(config.export_root.clone()).with_spinner();
        Ok(Self {
            config,
            slots,
            store,
            queue,
            reporter,
        })
    }

    /// Run the pool to completion.
    ///
    /// Returns when the queue is drained and every worker has exited,
    /// or when a shutdown signal arrives.
    pub fn run(&mut self) -> Result<()> {
        install_signal_handlers()?;
        info!(
            pool_size = self.config.pool_size,
            queued = self.queue.len()?,
            "Starting worker pool"
        );
        for slot in &mut self.slots {
            slot.start(&self.config)?;
        }

        loop {
            if shutdown_requested() {
                info!("Shutdown requested, stopping workers");
                break;
            }

            self.poll_slots()?;
            self.reap_stale_items()?;
            self.store.reconcile_jobs(process_alive)?;

            let live_pids: Vec<u32> = self
                .slots
                .iter()
                .filter(|s| s.is_running())
                .filter_map(|s| s.last_pid())
                .collect();
            self.reporter.sample(self.queue.len()?, &live_pids);

            if self.queue.is_empty()? && live_pids.is_empty() {
                info!("Queue drained and all workers exited");
                break;
            }

            self.sleep_poll_interval();
        }

        self.reporter.finish();
        self.stop_all()
    }

    /// Fold finished processes into slot state. A dead slot's claimed
    /// items become FAILED; the slot is refilled while work remains.
    fn poll_slots(&mut self) -> Result<()> {
        let queue_empty = self.queue.is_empty()?;
        for slot in &mut self.slots {
            if !matches!(slot.check(), SlotState::Failed) {
                continue;
            }
            if let Some(pid) = slot.last_pid() {
                let failed = self.store.fail_owned_by(pid)?;
                if failed > 0 {
                    warn!(slot = %slot.name(), pid, failed, "Failed items of dead worker");
                }
            }
            if queue_empty {
                slot.stop(&self.store)?;
            } else {
                warn!(slot = %slot.name(), "Restarting dead worker");
                slot.restart(&self.config, &self.store)?;
            }
        }
        Ok(())
    }

    /// Items stuck in PROCESSING past the timeout get failed; a still
    /// running owner is presumed hung and restarted.
    fn reap_stale_items(&mut self) -> Result<()> {
        let stale = self.store.stale_processing(self.config.processing_timeout)?;
        for item in stale {
            warn!(
                unit = %item.unit,
                id = item.id,
                pid = ?item.process_id,
                "Queue item stuck in PROCESSING, failing it"
            );
            self.store.mark_failed(item.id)?;
            if let Some(pid) = item.process_id {
                let owner = self
                    .slots
                    .iter_mut()
                    .find(|s| s.last_pid() == Some(pid) && s.is_running());
                if let Some(slot) = owner {
                    warn!(slot = %slot.name(), pid, "Restarting hung worker");
                    slot.restart(&self.config, &self.store)?;
                }
            }
        }
        Ok(())
    }

    fn stop_all(&mut self) -> Result<()> {
        for slot in &mut self.slots {
            slot.stop(&self.store)?;
        }
        Ok(())
    }

    /// Sleep one poll interval, waking early on the shutdown flag.
    fn sleep_poll_interval(&self) {
        let chunk = Duration::from_millis(100);
        let mut remaining = self.config.poll_interval;
        while !remaining.is_zero() && !shutdown_requested() {
            let step = remaining.min(chunk);
            std::thread::sleep(step);
            remaining -= step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ItemStatus;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> RunConfig {
        RunConfig {
            pool_size: 2,
            db_path: dir.join("state.db"),
            export_root: dir.join("export"),
            log_dir: dir.join("logs"),
            mail_root: dir.join("mail"),
            poll_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_shutdown_flag() {
        SHUTDOWN.store(false, Ordering::SeqCst);
        assert!(!shutdown_requested());
        SHUTDOWN.store(true, Ordering::SeqCst);
        assert!(shutdown_requested());
        SHUTDOWN.store(false, Ordering::SeqCst);
    }

    #[test]
    fn test_new_supervisor_has_stopped_slots() {
        let tmp = tempdir().unwrap();
        let supervisor = Supervisor::new(test_config(tmp.path())).unwrap();
        assert_eq!(supervisor.slots.len(), 2);
        assert!(supervisor.slots.iter().all(|s| !s.is_running()));
    }

    #[test]
    fn test_poll_slots_noop_without_processes() {
        let tmp = tempdir().unwrap();
        let mut supervisor = Supervisor::new(test_config(tmp.path())).unwrap();
        supervisor.poll_slots().unwrap();
        assert!(supervisor
            .slots
            .iter()
            .all(|s| matches!(s.state(), SlotState::Stopped)));
    }

    #[test]
    fn test_reap_stale_items_fails_stuck_item() {
        let tmp = tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.processing_timeout = Duration::ZERO;
        let mut supervisor = Supervisor::new(config).unwrap();

        let id = supervisor.store.dispatch("alice").unwrap();
        supervisor.store.claim(id, 424242).unwrap();

        // Zero timeout still needs the start timestamp to fall behind
        std::thread::sleep(Duration::from_millis(1100));
        supervisor.reap_stale_items().unwrap();

        let item = supervisor.store.get_item(id).unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
    }

    #[test]
    fn test_stale_item_restarts_hung_owner() {
        use std::process::{Command, Stdio};

        let tmp = tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.processing_timeout = Duration::ZERO;
        let mut supervisor = Supervisor::new(config).unwrap();

        // A long-lived child stands in for a worker stuck mid-export
        let child = Command::new("sleep")
            .arg("60")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let hung_pid = child.id();
        supervisor.slots[0].occupy(&child);

        let id = supervisor.store.dispatch("alice").unwrap();
        supervisor.store.claim(id, hung_pid).unwrap();

        // Zero timeout still needs the start timestamp to fall behind
        std::thread::sleep(Duration::from_millis(1100));
        supervisor.reap_stale_items().unwrap();

        let item = supervisor.store.get_item(id).unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);

        // The hung occupant was replaced within the same pass
        assert!(supervisor.slots[0].is_running());
        assert_ne!(supervisor.slots[0].last_pid(), Some(hung_pid));

        supervisor.stop_all().unwrap();
    }

    #[test]
    fn test_fresh_items_are_not_stale() {
        let tmp = tempdir().unwrap();
        let mut supervisor = Supervisor::new(test_config(tmp.path())).unwrap();

        let id = supervisor.store.dispatch("alice").unwrap();
        supervisor.store.claim(id, 424242).unwrap();
        supervisor.reap_stale_items().unwrap();

        let item = supervisor.store.get_item(id).unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Processing);
    }
}
