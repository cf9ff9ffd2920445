//! Cross-process work queue.
//!
//! Worker processes cannot share memory, so the queue is a SQLite table
//! in the shared state database. A pull removes the head row inside an
//! immediate transaction; concurrent pullers therefore always receive
//! distinct units. Re-pushed units land at the tail (AUTOINCREMENT ids
//! are never reused).

use crate::error::{MbxError, Result};
use crate::store::open_connection;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use tracing::debug;

/// One unit of work: a user whose mailbox should be exported, with an
/// optional per-unit resume date overriding the run-wide one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub user: String,
    pub resume: Option<NaiveDate>,
}

impl WorkUnit {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            resume: None,
        }
    }
}

/// Handle on the shared queue. Each process opens its own.
pub struct WorkQueue {
    conn: Connection,
}

impl WorkQueue {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path.as_ref())?,
        })
    }

    /// Append a unit at the tail.
    pub fn push(&self, unit: &WorkUnit) -> Result<()> {
        self.conn.execute(
            "INSERT INTO work_units (user, resume) VALUES (?1, ?2)",
            rusqlite::params![unit.user, unit.resume.map(|d| d.to_string())],
        )?;
        Ok(())
    }

    /// Remove and return the head unit, or None if the queue is empty.
    pub fn pull(&mut self) -> Result<Option<WorkUnit>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let head: Option<(i64, String, Option<String>)> = tx
            .query_row(
                "SELECT id, user, resume FROM work_units ORDER BY id LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let unit = match head {
            Some((id, user, resume)) => {
                tx.execute("DELETE FROM work_units WHERE id = ?1", [id])?;
                let resume = match resume {
                    Some(s) => Some(s.parse::<NaiveDate>().map_err(|e| {
                        MbxError::Worker(format!("bad resume date {s:?} in queue: {e}"))
                    })?),
                    None => None,
                };
                Some(WorkUnit { user, resume })
            }
            None => None,
        };
        tx.commit()?;
        Ok(unit)
    }

    pub fn len(&self) -> Result<u64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM work_units", [], |row| row.get(0))?;
        Ok(n)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Seed the queue from a user-list file, one user per line. Blank
    /// lines (including a trailing newline) are discarded, never
    /// enqueued. Returns how many units were added.
    pub fn seed_from_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| MbxError::InvalidUserList {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut added = 0;
        for line in content.lines() {
            let user = line.trim();
            if user.is_empty() {
                continue;
            }
            self.push(&WorkUnit::new(user))?;
            added += 1;
        }
        debug!(added, path = %path.display(), "Seeded work queue");
        Ok(added)
    }

    /// Seed directly from an in-memory list. Blank entries are
    /// discarded the same way as file lines.
    pub fn seed<I, S>(&self, users: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = 0;
        for user in users {
            let user = user.as_ref().trim();
            if user.is_empty() {
                continue;
            }
            self.push(&WorkUnit::new(user))?;
            added += 1;
        }
        Ok(added)
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue").finish_non_exhaustive()
    }
}
