//! Chunked, resumable mailbox export.
//!
//! One `MailboxExport` drives the export of a single mailbox: every
//! non-empty folder is exported into its own destination directory,
//! chunked into bounded time ranges so each upstream retrieval stays
//! small, with a fixed retry budget per range. A folder whose export
//! completed is marked by renaming its directory with a `_done` suffix;
//! that marker is the idempotency witness checked before any re-export.

pub mod items;
pub mod ranges;

use crate::config::RunConfig;
use crate::error::{MbxError, Result};
use crate::mailbox::{FolderInfo, MailStore, Mailbox, StoreError};
use chrono::NaiveDate;
use ranges::TimeRange;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Suffix marking a fully exported folder directory.
pub const DONE_SUFFIX: &str = "_done";

/// Outcome of one sub-range attempt. An empty range is a legitimate
/// `Exported(0)`, never conflated with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    Exported(u64),
    Retry,
}

fn sanitize_folder(name: &str) -> String {
    name.replace(' ', "_").replace('/', "_")
}

/// Exports one mailbox to the filesystem, folder by folder.
pub struct MailboxExport {
    address: String,
    mailbox: Option<Box<dyn Mailbox>>,
    export_path: PathBuf,
    start_date: Option<NaiveDate>,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl MailboxExport {
    /// Open the mailbox for `user` and bind the destination tree.
    ///
    /// A missing mailbox is not an error: the export stays inert and
    /// `check_mailbox` reports `false`.
    pub fn new(store: &dyn MailStore, user: &str, config: &RunConfig) -> Result<Self> {
        let address = config.address(user);
        let mailbox = store.open(&address).map_err(MbxError::from)?;
        if mailbox.is_some() {
            info!(%address, "Mailbox opened");
        } else {
            warn!(%address, "No such mailbox");
        }
        Ok(Self {
            address,
            mailbox,
            export_path: config.user_export_path(user),
            start_date: config.start_date,
            max_attempts: config.max_attempts,
            retry_backoff: config.retry_backoff,
        })
    }

    /// Whether the mailbox exists.
    pub fn exists(&self) -> bool {
        self.mailbox.is_some()
    }

    /// Total item count across every folder, for progress reporting only.
    /// Returns 0 for a missing mailbox.
    pub fn total_content_count(&self) -> Result<u64> {
        let Some(mailbox) = self.mailbox.as_ref() else {
            return Ok(0);
        };
        let folders = mailbox.folders().map_err(MbxError::from)?;
        Ok(folders.iter().map(|f| f.total_count).sum())
    }

    /// Every folder with at least one item.
    pub fn list_non_empty_folders(&self) -> Result<Vec<FolderInfo>> {
        let Some(mailbox) = self.mailbox.as_ref() else {
            return Ok(Vec::new());
        };
        let folders = mailbox.folders().map_err(MbxError::from)?;
        Ok(folders.into_iter().filter(|f| f.total_count > 0).collect())
    }

    /// Export one folder, idempotently.
    ///
    /// If the completion marker already exists the folder's reported total
    /// is returned without touching upstream. Otherwise any leftover
    /// partial directory is cleared, every sub-range of the partition is
    /// exported through the retry wrapper, and on success the directory is
    /// atomically renamed to carry the marker. Losing the final rename
    /// race to a concurrent run of the same owner is logged and swallowed.
    pub fn export_folder(&self, folder: &FolderInfo) -> Result<u64> {
        let name = sanitize_folder(&folder.name);
        let current = self.export_path.join(&name);
        let done = self.export_path.join(format!("{}{}", name, DONE_SUFFIX));
        if done.exists() {
            info!(path = %current.display(), "Already done");
            return Ok(folder.total_count);
        }
        if current.exists() {
            info!(path = %current.display(), "Cleaning up partial export");
            std::fs::remove_dir_all(&current)?;
        }
        std::fs::create_dir_all(&current)?;

        let mut exported = 0;
        for range in ranges::partition(self.start_date) {
            exported += self.export_single_range_with_retry(&folder.name, &current, &range)?;
        }

        if let Err(e) = std::fs::rename(&current, &done) {
            if done.exists() {
                // Lost the race against a concurrent run of the same
                // owner; the content is already safe.
                warn!(path = %done.display(), "Completion marker already present");
            } else {
                return Err(e.into());
            }
        }
        Ok(exported)
    }

    /// One attempt at one sub-range.
    ///
    /// Transient upstream faults abandon the attempt and signal `Retry`;
    /// faults local to a single item are logged and skipped without
    /// aborting the range.
    fn export_single_range(
        &self,
        folder: &str,
        dir: &Path,
        range: &TimeRange,
    ) -> Result<RangeOutcome> {
        let Some(mailbox) = self.mailbox.as_ref() else {
            return Err(MbxError::NoSuchMailbox(self.address.clone()));
        };
        let batch = match mailbox.items_in_range(folder, range) {
            Ok(batch) => batch,
            Err(StoreError::Transient(msg)) => {
                warn!(folder, %range, msg, "Transient upstream error, will retry range");
                return Ok(RangeOutcome::Retry);
            }
            Err(e) => {
                // Anything else at range level is treated as retry-worthy
                warn!(folder, %range, error = %e, "Upstream error, will retry range");
                return Ok(RangeOutcome::Retry);
            }
        };

        let mut exported = 0;
        for item in batch {
            match item {
                Ok(item) => match items::export_item(dir, &item) {
                    Ok(count) => exported += count,
                    Err(e) => {
                        warn!(folder, error = %e, "Item export failed, skipping item");
                    }
                },
                Err(e) => {
                    warn!(folder, error = %e, "Malformed item, skipping");
                }
            }
        }
        Ok(RangeOutcome::Exported(exported))
    }

    /// Retry wrapper: up to `max_attempts` total attempts with a fixed
    /// backoff in between. Exhaustion is fatal for the folder export.
    fn export_single_range_with_retry(
        &self,
        folder: &str,
        dir: &Path,
        range: &TimeRange,
    ) -> Result<u64> {
        debug!(folder, %range, "Exporting range");
        for attempt in 1..=self.max_attempts {
            match self.export_single_range(folder, dir, range)? {
                RangeOutcome::Exported(count) => return Ok(count),
                RangeOutcome::Retry => {
                    warn!(folder, %range, attempt, "Range attempt failed");
                    if attempt < self.max_attempts && !self.retry_backoff.is_zero() {
                        std::thread::sleep(self.retry_backoff);
                    }
                }
            }
        }
        Err(MbxError::ExportFailed {
            folder: folder.to_string(),
            attempts: self.max_attempts,
        })
    }

    /// Run the full export of the mailbox.
    ///
    /// Returns `Ok(false)` without touching the destination store when the
    /// mailbox does not exist. Only non-empty folders enter the loop.
    pub fn check_mailbox(&self, total_count: u64) -> Result<bool> {
        if self.mailbox.is_none() {
            return Ok(false);
        }
        std::fs::create_dir_all(&self.export_path)?;
        let mut attachments = 0;
        let mut total_scanned = 0;
        for folder in self.list_non_empty_folders()? {
            info!(
                path = %self.export_path.display(),
                folder = %folder.name,
                items = folder.total_count,
                "Exporting folder"
            );
            attachments += self.export_folder(&folder)?;
            total_scanned += folder.total_count;
            info!(
                path = %self.export_path.display(),
                scanned = total_scanned,
                total = total_count,
                attachments,
                "Folder exported"
            );
        }
        Ok(true)
    }
}
