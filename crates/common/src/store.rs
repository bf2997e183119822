//! Persisted run store
//!
//! The durable copy of every run, keyed by run id. Once a run is terminal the
//! stored document is write-once: later upserts of the same id are ignored.

use parking_lot::RwLock;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::db::Database;
use crate::types::{now_millis, Run};
use crate::Result;

/// Point reads and idempotent upserts of [`Run`] documents
pub trait RunStore: Send + Sync {
    fn get(&self, run_id: &str) -> Result<Option<Run>>;

    /// Idempotent upsert. A stored terminal run is never overwritten.
    fn put(&self, run: &Run) -> Result<()>;

    /// Insert only if no run with this id exists. Returns whether it was created.
    fn create_if_absent(&self, run: &Run) -> Result<bool>;

    /// Most recently created runs first
    fn list(&self, limit: usize) -> Result<Vec<Run>>;
}

/// SQLite-backed run store
#[derive(Clone)]
pub struct SqliteRunStore {
    db: Database,
}

impl SqliteRunStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl RunStore for SqliteRunStore {
    fn get(&self, run_id: &str) -> Result<Option<Run>> {
        let conn = self.db.conn();
        let doc: Option<String> = conn
            .query_row("SELECT doc FROM runs WHERE id = ?1", params![run_id], |row| row.get(0))
            .optional()?;

        match doc {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    fn put(&self, run: &Run) -> Result<()> {
        let conn = self.db.conn();
        let now = now_millis();

        let rows = conn.execute(
            "INSERT INTO runs (id, scenario_id, status, doc, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 scenario_id = excluded.scenario_id,
                 status = excluded.status,
                 doc = excluded.doc,
                 updated_at = excluded.updated_at
             WHERE runs.status NOT IN ('PASSED', 'FAILED', 'ERROR')",
            params![
                run.id,
                run.scenario_id,
                run.status.as_str(),
                serde_json::to_string(run)?,
                now,
            ],
        )?;

        if rows == 0 {
            debug!("Run {} already terminal, upsert ignored", run.id);
        }
        Ok(())
    }

    fn create_if_absent(&self, run: &Run) -> Result<bool> {
        let conn = self.db.conn();
        let now = now_millis();

        let rows = conn.execute(
            "INSERT OR IGNORE INTO runs (id, scenario_id, status, doc, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                run.id,
                run.scenario_id,
                run.status.as_str(),
                serde_json::to_string(run)?,
                now,
            ],
        )?;
        Ok(rows > 0)
    }

    fn list(&self, limit: usize) -> Result<Vec<Run>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT doc FROM runs ORDER BY created_at DESC, rowid DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;

        let mut runs = Vec::new();
        for doc in rows {
            runs.push(serde_json::from_str(&doc?)?);
        }
        Ok(runs)
    }
}

/// In-memory run store with the same write-once semantics
#[derive(Default)]
pub struct MemoryRunStore {
    /// Run by id, with its creation sequence number
    runs: RwLock<HashMap<String, (u64, Run)>>,
    next_seq: AtomicU64,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for MemoryRunStore {
    fn get(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(self.runs.read().get(run_id).map(|(_, run)| run.clone()))
    }

    fn put(&self, run: &Run) -> Result<()> {
        let mut runs = self.runs.write();
        let seq = match runs.get(&run.id) {
            Some((_, stored)) if stored.is_terminal() => {
                debug!("Run {} already terminal, upsert ignored", run.id);
                return Ok(());
            }
            Some((seq, _)) => *seq,
            None => self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        runs.insert(run.id.clone(), (seq, run.clone()));
        Ok(())
    }

    fn create_if_absent(&self, run: &Run) -> Result<bool> {
        let mut runs = self.runs.write();
        if runs.contains_key(&run.id) {
            return Ok(false);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        runs.insert(run.id.clone(), (seq, run.clone()));
        Ok(true)
    }

    fn list(&self, limit: usize) -> Result<Vec<Run>> {
        let runs = self.runs.read();
        let mut all: Vec<&(u64, Run)> = runs.values().collect();
        all.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(all.into_iter().take(limit).map(|(_, run)| run.clone()).collect())
    }
}
