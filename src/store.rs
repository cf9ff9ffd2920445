//! Durable record store for queue items and job records.
//!
//! One SQLite database is shared by every worker process and the
//! supervisor. Status transitions are read-modify-write sequences, so
//! each runs inside an immediate transaction: two actors can never both
//! believe they own the same record. The job-liveness reconciliation
//! additionally uses a non-waiting lock so concurrently running
//! supervisors skip instead of double-processing.

use crate::error::Result;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Default timeout for the SQLite busy handler. Claims and ordinary
/// transitions retry for this long before surfacing SQLITE_BUSY.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Status of one persisted queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    New,
    Processing,
    Failed,
    Done,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::New => "NEW",
            ItemStatus::Processing => "PROCESSING",
            ItemStatus::Failed => "FAILED",
            ItemStatus::Done => "DONE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(ItemStatus::New),
            "PROCESSING" => Some(ItemStatus::Processing),
            "FAILED" => Some(ItemStatus::Failed),
            "DONE" => Some(ItemStatus::Done),
            _ => None,
        }
    }
}

/// Status of one higher-level job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Started,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Started => "STARTED",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
        }
    }
}

/// One persisted queue item row.
///
/// Invariant: `status == Processing` implies both `process_id` and
/// `process_start_time` are set (the claim writes all three together).
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub unit: String,
    pub status: ItemStatus,
    pub process_id: Option<u32>,
    pub process_start_time: Option<i64>,
}

/// Open a connection to the shared state database, creating the schema
/// if needed. Used by both the record store and the work queue.
pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;

    // WAL keeps readers from blocking writers across processes
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA temp_store = MEMORY;
        "#,
    )?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    // AUTOINCREMENT keeps queue order stable across delete/re-push
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS work_units (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user TEXT NOT NULL,
            resume TEXT
        );

        CREATE TABLE IF NOT EXISTS queue_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            unit TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'NEW',
            process_id INTEGER,
            process_start_time INTEGER
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'STARTED',
            pid INTEGER
        );
        "#,
    )?;
    Ok(())
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

fn now() -> i64 {
    Utc::now().timestamp()
}

/// Handle on the shared record store. Each process opens its own.
pub struct RecordStore {
    conn: Connection,
}

impl RecordStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path.as_ref())?,
        })
    }

    /// Create a queue-item row for a dispatched unit, status NEW.
    pub fn dispatch(&self, unit: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO queue_items (unit, status) VALUES (?1, 'NEW')",
            [unit],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Claim a NEW item for `pid`.
    ///
    /// The conditional update inside an immediate transaction guarantees
    /// at most one live process ever holds an item in PROCESSING.
    /// Returns false if the item was not NEW anymore (someone else owns
    /// or finished it).
    pub fn claim(&mut self, id: i64, pid: u32) -> Result<bool> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE queue_items
             SET status = 'PROCESSING', process_id = ?1, process_start_time = ?2
             WHERE id = ?3 AND status = 'NEW'",
            rusqlite::params![pid, now(), id],
        )?;
        tx.commit()?;
        Ok(changed == 1)
    }

    pub fn mark_done(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE queue_items SET status = 'DONE' WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    pub fn mark_failed(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE queue_items SET status = 'FAILED' WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    /// Reassign every PROCESSING item owned by `pid` to FAILED. Called
    /// when a worker slot is stopped or found dead.
    pub fn fail_owned_by(&self, pid: u32) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE queue_items SET status = 'FAILED'
             WHERE status = 'PROCESSING' AND process_id = ?1",
            [pid],
        )?;
        Ok(changed)
    }

    /// Items PROCESSING for longer than `timeout`, presumed abandoned.
    pub fn stale_processing(&self, timeout: Duration) -> Result<Vec<QueueItem>> {
        let cutoff = now() - timeout.as_secs() as i64;
        let mut stmt = self.conn.prepare(
            "SELECT id, unit, status, process_id, process_start_time
             FROM queue_items
             WHERE status = 'PROCESSING' AND process_start_time < ?1",
        )?;
        let items = stmt
            .query_map([cutoff], |row| {
                Ok(QueueItem {
                    id: row.get(0)?,
                    unit: row.get(1)?,
                    status: ItemStatus::parse(&row.get::<_, String>(2)?)
                        .unwrap_or(ItemStatus::Failed),
                    process_id: row.get(3)?,
                    process_start_time: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Count of queue items per status, for the status display.
    pub fn item_counts(&self) -> Result<Vec<(String, u64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM queue_items GROUP BY status ORDER BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    /// Register a job record for this run.
    pub fn create_job(&self, name: &str, pid: u32) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO jobs (name, status, pid) VALUES (?1, 'STARTED', ?2)",
            rusqlite::params![name, pid],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn finish_job(&self, id: i64, status: JobStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE jobs SET status = ?1 WHERE id = ?2",
            rusqlite::params![status.as_str(), id],
        )?;
        Ok(())
    }

    /// Jobs with name, status, and pid, newest first, for the status
    /// display.
    pub fn list_jobs(&self) -> Result<Vec<(i64, String, String, Option<u32>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, status, pid FROM jobs ORDER BY id DESC")?;
        let jobs = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Reconcile STARTED jobs against OS process liveness.
    ///
    /// Runs under a non-waiting lock: if another supervisor instance
    /// holds the write lock the whole pass silently no-ops (`Ok(None)`),
    /// performing zero status mutations. Otherwise every STARTED job
    /// whose pid fails `probe` is marked FAILED; returns how many.
    pub fn reconcile_jobs<F: Fn(u32) -> bool>(&mut self, probe: F) -> Result<Option<usize>> {
        self.conn.busy_timeout(Duration::ZERO)?;
        let outcome = Self::reconcile_under_lock(&mut self.conn, &probe);
        self.conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        match outcome {
            Ok(failed) => Ok(Some(failed)),
            Err(crate::error::MbxError::Database(ref e)) if is_busy(e) => {
                debug!("Job reconciliation lock contended, skipping pass");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// The transactional half of `reconcile_jobs`. Any BUSY surfacing
    /// here rolls back, so a contended pass performs zero mutations.
    fn reconcile_under_lock<F: Fn(u32) -> bool>(
        conn: &mut Connection,
        probe: &F,
    ) -> Result<usize> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let started: Vec<(i64, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT id, pid FROM jobs WHERE status = 'STARTED' AND pid IS NOT NULL",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        let mut failed = 0;
        for (id, pid) in started {
            if !probe(pid) {
                tx.execute("UPDATE jobs SET status = 'FAILED' WHERE id = ?1", [id])?;
                failed += 1;
            }
        }
        tx.commit()?;
        Ok(failed)
    }

    /// Look up one queue item (status pages, tests).
    pub fn get_item(&self, id: i64) -> Result<Option<QueueItem>> {
        let item = self
            .conn
            .query_row(
                "SELECT id, unit, status, process_id, process_start_time
                 FROM queue_items WHERE id = ?1",
                [id],
                |row| {
                    Ok(QueueItem {
                        id: row.get(0)?,
                        unit: row.get(1)?,
                        status: ItemStatus::parse(&row.get::<_, String>(2)?)
                            .unwrap_or(ItemStatus::Failed),
                        process_id: row.get(3)?,
                        process_start_time: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(item)
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_dispatch_and_claim() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("state.db");
        let mut store = RecordStore::open(&path).unwrap();
        let id = store.dispatch("alice").unwrap();

        assert!(store.claim(id, 4242).unwrap());
        let item = store.get_item(id).unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Processing);
        assert_eq!(item.process_id, Some(4242));
        assert!(item.process_start_time.is_some());

        // A second claim finds the item no longer NEW
        assert!(!store.claim(id, 4343).unwrap());
        let item = store.get_item(id).unwrap().unwrap();
        assert_eq!(item.process_id, Some(4242));
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("state.db");
        let store = RecordStore::open(&path).unwrap();
        let id = store.dispatch("alice").unwrap();
        drop(store);

        let mut handles = Vec::new();
        for pid in 0..8u32 {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                let mut store = RecordStore::open(&path).unwrap();
                store.claim(id, 1000 + pid).unwrap()
            }));
        }
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_mark_done_and_failed() {
        let tmp = tempdir().unwrap();
        let mut store = RecordStore::open(tmp.path().join("state.db")).unwrap();
        let a = store.dispatch("a").unwrap();
        let b = store.dispatch("b").unwrap();
        store.claim(a, 1).unwrap();
        store.claim(b, 2).unwrap();
        store.mark_done(a).unwrap();
        store.mark_failed(b).unwrap();
        assert_eq!(store.get_item(a).unwrap().unwrap().status, ItemStatus::Done);
        assert_eq!(store.get_item(b).unwrap().unwrap().status, ItemStatus::Failed);
    }

    #[test]
    fn test_fail_owned_by_only_hits_processing_rows() {
        let tmp = tempdir().unwrap();
        let mut store = RecordStore::open(tmp.path().join("state.db")).unwrap();
        let a = store.dispatch("a").unwrap();
        let b = store.dispatch("b").unwrap();
        let c = store.dispatch("c").unwrap();
        store.claim(a, 7).unwrap();
        store.claim(b, 7).unwrap();
        store.mark_done(b).unwrap();
        store.claim(c, 8).unwrap();

        assert_eq!(store.fail_owned_by(7).unwrap(), 1);
        assert_eq!(store.get_item(a).unwrap().unwrap().status, ItemStatus::Failed);
        assert_eq!(store.get_item(b).unwrap().unwrap().status, ItemStatus::Done);
        assert_eq!(
            store.get_item(c).unwrap().unwrap().status,
            ItemStatus::Processing
        );
    }

    #[test]
    fn test_stale_processing_detection() {
        let tmp = tempdir().unwrap();
        let mut store = RecordStore::open(tmp.path().join("state.db")).unwrap();
        let fresh = store.dispatch("fresh").unwrap();
        let stuck = store.dispatch("stuck").unwrap();
        store.claim(fresh, 1).unwrap();
        store.claim(stuck, 2).unwrap();

        // Backdate the stuck item past the timeout
        store
            .conn
            .execute(
                "UPDATE queue_items SET process_start_time = ?1 WHERE id = ?2",
                rusqlite::params![now() - 600, stuck],
            )
            .unwrap();

        let stale = store.stale_processing(Duration::from_secs(180)).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, stuck);
        assert_eq!(stale[0].process_id, Some(2));
    }

    #[test]
    fn test_reconcile_jobs_fails_dead_pids() {
        let tmp = tempdir().unwrap();
        let mut store = RecordStore::open(tmp.path().join("state.db")).unwrap();
        let own = store.create_job("live", std::process::id()).unwrap();
        // A pid that cannot exist
        let dead = store.create_job("dead", 0).unwrap();

        let failed = store
            .reconcile_jobs(|pid| pid == std::process::id())
            .unwrap();
        assert_eq!(failed, Some(1));

        let jobs = store.list_jobs().unwrap();
        let status_of = |id: i64| {
            jobs.iter()
                .find(|(jid, ..)| *jid == id)
                .map(|(_, _, status, _)| status.clone())
                .unwrap()
        };
        assert_eq!(status_of(own), "STARTED");
        assert_eq!(status_of(dead), "FAILED");
    }

    #[test]
    fn test_reconcile_jobs_skips_silently_on_lock_contention() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("state.db");
        let mut store = RecordStore::open(&path).unwrap();
        store.create_job("dead", 0).unwrap();

        // Another supervisor holds the write lock
        let blocker = open_connection(&path).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

        let result = store.reconcile_jobs(|_| false).unwrap();
        assert_eq!(result, None);

        blocker.execute_batch("COMMIT").unwrap();

        // Zero mutations happened while contended
        let jobs = store.list_jobs().unwrap();
        assert!(jobs.iter().all(|(_, _, status, _)| status == "STARTED"));

        // The next pass runs normally once the lock clears
        let failed = store.reconcile_jobs(|_| false).unwrap();
        assert_eq!(failed, Some(1));
    }

    #[test]
    fn test_item_status_roundtrip() {
        for status in [
            ItemStatus::New,
            ItemStatus::Processing,
            ItemStatus::Failed,
            ItemStatus::Done,
        ] {
            assert_eq!(ItemStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ItemStatus::parse("BOGUS"), None);
    }
}
