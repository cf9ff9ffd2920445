//! Mailbox API boundary.
//!
//! The mail protocol client is an external collaborator: the exporter only
//! needs an existence check, folder enumeration with per-folder counts, and
//! range-filtered item iteration. `MailStore`/`Mailbox` capture exactly
//! that surface. `JsonMailStore` is the shipped implementation, reading a
//! directory tree of serde-encoded items so the binary and the integration
//! tests run end-to-end without a mail server.

use crate::export::ranges::TimeRange;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Faults reported by a mail store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Timeout or transient server fault. The enclosing sub-range attempt
    /// is abandoned and retried.
    #[error("transient store error: {0}")]
    Transient(String),

    /// A single item is malformed. Logged and skipped; the rest of the
    /// range proceeds.
    #[error("content fault: {0}")]
    Content(String),

    /// Anything else. Treated as retry-worthy at the range level.
    #[error("store error: {0}")]
    Other(String),
}

impl From<StoreError> for crate::error::MbxError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Transient(msg) => crate::error::MbxError::Transient(msg),
            StoreError::Content(msg) => crate::error::MbxError::Content(msg),
            StoreError::Other(msg) => crate::error::MbxError::Worker(msg),
        }
    }
}

/// One attachment of a mail item. A closed set: kinds the exporter does
/// not know are a hard error for the owning item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attachment {
    /// Raw bytes written to a uniquely named file.
    File {
        name: Option<String>,
        #[serde(default)]
        content: Vec<u8>,
    },
    /// A nested item (e.g. a forwarded message), written as text.
    Item {
        name: Option<String>,
        subject: Option<String>,
        body: Option<String>,
    },
    /// Unsupported upstream kind.
    #[serde(other)]
    Unknown,
}

impl Attachment {
    /// The attachment's name, if it has one.
    pub fn name(&self) -> Option<&str> {
        match self {
            Attachment::File { name, .. } | Attachment::Item { name, .. } => name.as_deref(),
            Attachment::Unknown => None,
        }
    }
}

/// One mail item yielded by range-filtered iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailItem {
    pub subject: Option<String>,
    pub body: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Folder name plus its reported item count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderInfo {
    pub name: String,
    pub total_count: u64,
}

/// Per-item result of range iteration: item-level content faults surface
/// here without aborting the batch.
pub type ItemResult = std::result::Result<MailItem, StoreError>;

/// One opened mailbox.
pub trait Mailbox {
    /// Every folder reachable from the mailbox root, with counts.
    fn folders(&self) -> std::result::Result<Vec<FolderInfo>, StoreError>;

    /// Items in `folder` whose creation time falls in `range`.
    fn items_in_range(
        &self,
        folder: &str,
        range: &TimeRange,
    ) -> std::result::Result<Vec<ItemResult>, StoreError>;
}

/// Mailbox lookup by address. `Ok(None)` means no such mailbox.
pub trait MailStore {
    fn open(
        &self,
        address: &str,
    ) -> std::result::Result<Option<Box<dyn Mailbox>>, StoreError>;
}

/// Filesystem-backed mail store: `<root>/<address>/<folder>/*.json`.
#[derive(Debug, Clone)]
pub struct JsonMailStore {
    root: PathBuf,
}

impl JsonMailStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

impl MailStore for JsonMailStore {
    fn open(
        &self,
        address: &str,
    ) -> std::result::Result<Option<Box<dyn Mailbox>>, StoreError> {
        let dir = self.root.join(address);
        if dir.is_dir() {
            Ok(Some(Box::new(JsonMailbox { dir })))
        } else {
            Ok(None)
        }
    }
}

struct JsonMailbox {
    dir: PathBuf,
}

impl JsonMailbox {
    fn item_files(&self, folder: &str) -> std::result::Result<Vec<PathBuf>, StoreError> {
        let folder_dir = self.dir.join(folder);
        let mut files: Vec<PathBuf> = std::fs::read_dir(&folder_dir)
            .map_err(|e| StoreError::Other(format!("{}: {}", folder_dir.display(), e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect();
        files.sort();
        Ok(files)
    }
}

impl Mailbox for JsonMailbox {
    fn folders(&self) -> std::result::Result<Vec<FolderInfo>, StoreError> {
        let mut folders = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| StoreError::Other(format!("{}: {}", self.dir.display(), e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Other(e.to_string()))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let total_count = self.item_files(&name)?.len() as u64;
            folders.push(FolderInfo { name, total_count });
        }
        folders.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(folders)
    }

    fn items_in_range(
        &self,
        folder: &str,
        range: &TimeRange,
    ) -> std::result::Result<Vec<ItemResult>, StoreError> {
        let mut items = Vec::new();
        for path in self.item_files(folder)? {
            let parsed = read_item(&path);
            match parsed {
                Ok(item) => {
                    if range.contains(item.created) {
                        items.push(Ok(item));
                    }
                }
                // A malformed file is an item-level fault, not a range fault
                Err(e) => items.push(Err(e)),
            }
        }
        Ok(items)
    }
}

fn read_item(path: &Path) -> std::result::Result<MailItem, StoreError> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| StoreError::Content(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&data)
        .map_err(|e| StoreError::Content(format!("{}: {}", path.display(), e)))
}
