//! Path utilities for mbxport data storage.

use std::path::PathBuf;

/// Default database filename (queue, queue items, and job records).
pub const STATE_DB_FILENAME: &str = "state.db";

/// Get the data directory for mbxport.
///
/// Uses XDG base directory specification on Linux/macOS:
/// - Linux: `~/.local/share/mbxport`
/// - macOS: `~/Library/Application Support/mbxport`
pub fn get_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("mbxport"))
        .unwrap_or_else(|| {
            // Fallback to current directory if data_dir is not available
            PathBuf::from(".mbxport")
        })
}

/// Get the path to the shared SQLite state database.
pub fn get_state_db_path() -> PathBuf {
    get_data_dir().join(STATE_DB_FILENAME)
}

/// Get the default root for exported mailbox content.
pub fn get_export_root() -> PathBuf {
    get_data_dir().join("export")
}

/// Get the directory for per-slot worker log files.
pub fn get_log_dir() -> PathBuf {
    get_data_dir().join("logs")
}
