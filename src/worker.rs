//! Worker loop run inside each pool process.
//!
//! A worker pulls units from the shared queue until it drains, exporting
//! each one and recording the outcome as a persisted queue item. The
//! exporter behind each unit is abstracted so the loop can be driven by
//! fakes in tests.

use crate::config::RunConfig;
use crate::error::Result;
use crate::export::MailboxExport;
use crate::mailbox::MailStore;
use crate::queue::{WorkQueue, WorkUnit};
use crate::store::RecordStore;
use tracing::{info, warn};

/// One unit's worth of export work.
pub trait UnitExporter {
    /// Total item count, for logging and progress only.
    fn total_content_count(&self) -> Result<u64>;

    /// Run the export. Returns false if the mailbox does not exist,
    /// which completes the unit without writing anything.
    fn check_mailbox(&self, total_count: u64) -> Result<bool>;
}

impl UnitExporter for MailboxExport {
    fn total_content_count(&self) -> Result<u64> {
        MailboxExport::total_content_count(self)
    }

    fn check_mailbox(&self, total_count: u64) -> Result<bool> {
        MailboxExport::check_mailbox(self, total_count)
    }
}

/// Builds an exporter per work unit.
pub trait ExporterFactory {
    type Exporter: UnitExporter;

    fn create(&self, unit: &WorkUnit) -> Result<Self::Exporter>;
}

/// Production factory: opens the configured mail store per unit. A
/// unit-level resume date overrides the run-wide start date.
pub struct MailboxExportFactory<S: MailStore> {
    store: S,
    config: RunConfig,
}

impl<S: MailStore> MailboxExportFactory<S> {
    pub fn new(store: S, config: RunConfig) -> Self {
        Self { store, config }
    }
}

impl<S: MailStore> ExporterFactory for MailboxExportFactory<S> {
    type Exporter = MailboxExport;

    fn create(&self, unit: &WorkUnit) -> Result<MailboxExport> {
        let mut config = self.config.clone();
        config.start_date = unit.resume.or(config.start_date);
        MailboxExport::new(&self.store, &unit.user, &config)
    }
}

/// Pull units until the queue drains.
///
/// Every pulled unit gets a queue-item record: claimed before the export
/// starts, DONE on success (including a missing mailbox), FAILED on
/// error. A failed unit is re-pushed at the tail of the queue so it gets
/// another shot after everything else.
pub fn run_worker<F: ExporterFactory>(
    queue: &mut WorkQueue,
    store: &mut RecordStore,
    factory: &F,
    slot_name: &str,
) -> Result<()> {
    let pid = std::process::id();
    info!(slot = slot_name, pid, "Worker started");

    loop {
        let Some(unit) = queue.pull()? else {
            if queue.is_empty()? {
                info!(slot = slot_name, "Queue drained, worker exiting");
                return Ok(());
            }
            continue;
        };

        let item_id = store.dispatch(&unit.user)?;
        if !store.claim(item_id, pid)? {
            warn!(user = %unit.user, item_id, "Freshly dispatched item was not claimable");
            continue;
        }

        let outcome = (|| -> Result<bool> {
            let exporter = factory.create(&unit)?;
            let total = exporter.total_content_count()?;
            info!(user = %unit.user, total, "Starting export");
            exporter.check_mailbox(total)
        })();

        match outcome {
            Ok(true) => {
                store.mark_done(item_id)?;
                info!(user = %unit.user, "Export complete");
            }
            Ok(false) => {
                // Nonexistent mailbox counts as handled, not failed
                store.mark_done(item_id)?;
            }
            Err(e) => {
                store.mark_failed(item_id)?;
                queue.push(&unit)?;
                warn!(user = %unit.user, error = %e, "Export failed, unit requeued");
            }
        }
    }
}
