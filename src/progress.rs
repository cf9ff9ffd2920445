//! Throughput reporting for an export run.
//!
//! Progress is measured from the outside: the total byte size of the
//! export tree, sampled once per supervisor pass. Workers rename
//! directories while we walk, so missing entries are normal and are
//! simply skipped.

use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;

/// Total size in bytes of everything under `path`.
///
/// Entries that vanish mid-walk (completion renames) contribute zero. A
/// missing root also counts as zero, not an error.
pub fn dir_size(path: &Path) -> u64 {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            total += dir_size(&entry.path());
        } else {
            total += meta.len();
        }
    }
    total
}

/// Read RSS (Resident Set Size) of a process in MiB.
///
/// Uses /proc/<pid>/statm which has format:
/// size resident shared text lib data dt
/// All values are in pages (usually 4KB).
#[cfg(target_os = "linux")]
fn read_process_rss_mib(pid: u32) -> Option<u64> {
    let contents = std::fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
    let resident_pages: u64 = contents.split_whitespace().nth(1)?.parse().ok()?;
    // Assume 4KB pages (most common)
    let rss_kb = resident_pages * 4;
    Some(rss_kb / 1024)
}

#[cfg(not(target_os = "linux"))]
fn read_process_rss_mib(_pid: u32) -> Option<u64> {
    // Not supported on non-Linux
    None
}

/// Samples export throughput and surfaces it as a log line plus an
/// optional terminal spinner.
pub struct ProgressReporter {
    export_root: PathBuf,
    started: Instant,
    last_sample: Instant,
    last_bytes: u64,
    spinner: Option<ProgressBar>,
}

impl ProgressReporter {
    pub fn new(export_root: PathBuf) -> Self {
        Self {
            export_root,
            started: Instant::now(),
            last_sample: Instant::now(),
            last_bytes: 0,
            spinner: None,
        }
    }

    /// Attach a terminal spinner. Skipped when stderr is not a tty so
    /// redirected output stays clean.
    pub fn with_spinner(mut self) -> Self {
        if !std::io::stderr().is_terminal() {
            return self;
        }
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(250));
        self.spinner = Some(spinner);
        self
    }

    /// Take one sample and report it. `worker_pids` are the live pool
    /// members; their summed resident memory is part of the status line.
    pub fn sample(&mut self, queue_depth: u64, worker_pids: &[u32]) {
        let live_workers = worker_pids.len();
        let memory_mib: u64 = worker_pids
            .iter()
            .filter_map(|&pid| read_process_rss_mib(pid))
            .sum();
        let bytes = dir_size(&self.export_root);
        let now = Instant::now();
        let interval = now.duration_since(self.last_sample).as_secs_f64();
        let rate_mb_s = if interval > 0.0 {
            bytes.saturating_sub(self.last_bytes) as f64 / 1_000_000.0 / interval
        } else {
            0.0
        };
        let exported_mb = bytes as f64 / 1_000_000.0;
        let elapsed = self.started.elapsed().as_secs();

        info!(
            exported_mb = format_args!("{:.1}", exported_mb),
            rate_mb_s = format_args!("{:.2}", rate_mb_s),
            memory_mib,
            queue = queue_depth,
            workers = live_workers,
            elapsed_s = elapsed,
            "Export progress"
        );
        if let Some(spinner) = &self.spinner {
            spinner.set_message(format!(
                "{:.1} MB exported, {:.2} MB/s, {} MiB resident, {} queued, {} workers",
                exported_mb, rate_mb_s, memory_mib, queue_depth, live_workers
            ));
        }

        self.last_sample = now;
        self.last_bytes = bytes;
    }

    pub fn finish(&self) {
        if let Some(spinner) = &self.spinner {
            spinner.finish_and_clear();
        }
    }
}
