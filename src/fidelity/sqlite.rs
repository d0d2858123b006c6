//! SQLite Outcome Ledger
//!
//! Persistent, insert-only ledger. Timestamps are stored as unix
//! milliseconds so window queries stay on the index.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::ledger::{LedgerError, LedgerResult, OutcomeLedger};
use super::types::SkillOutcome;

/// Ledger backed by a single SQLite connection
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open or create the ledger database
    pub fn open(path: &Path) -> LedgerResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let ledger = Self::from_connection(conn)?;

        info!("Outcome ledger opened: {}", path.display());
        Ok(ledger)
    }

    /// Ephemeral ledger, mostly for tests
    pub fn open_in_memory() -> LedgerResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> LedgerResult<Self> {
        // Other processes may append at the same time
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Ledger journal mode: {}", mode);

        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn init_schema(&self) -> LedgerResult<()> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS skill_outcomes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                skill_name TEXT NOT NULL,
                fidelity REAL NOT NULL,
                success INTEGER NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_outcomes_skill_time
                ON skill_outcomes(skill_name, timestamp);
            "#,
        )?;
        Ok(())
    }

    /// Total number of rows, across all skills
    pub fn len(&self) -> LedgerResult<u64> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM skill_outcomes", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> LedgerResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove outcomes older than `cutoff`.
    ///
    /// Exists for an external retention policy; the engine never calls it.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> LedgerResult<usize> {
        let removed = self.conn.lock().execute(
            "DELETE FROM skill_outcomes WHERE timestamp < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        info!("Pruned {} outcomes older than {}", removed, cutoff);
        Ok(removed)
    }
}

impl OutcomeLedger for SqliteLedger {
    fn record_outcome(&self, outcome: &SkillOutcome) -> LedgerResult<()> {
        self.conn.lock().execute(
            r#"
            INSERT INTO skill_outcomes (skill_name, fidelity, success, timestamp)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                outcome.skill_name,
                outcome.fidelity,
                outcome.success,
                outcome.timestamp.timestamp_millis()
            ],
        )?;

        debug!(
            "Recorded outcome: skill={}, fidelity={:.2}, success={}",
            outcome.skill_name, outcome.fidelity, outcome.success
        );
        Ok(())
    }

    fn outcomes_since(&self, skill_name: &str, since: DateTime<Utc>) -> LedgerResult<Vec<SkillOutcome>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT skill_name, fidelity, success, timestamp
            FROM skill_outcomes
            WHERE skill_name = ?1 AND timestamp >= ?2
            ORDER BY timestamp ASC, id ASC
            "#,
        )?;

        let rows = stmt.query_map(params![skill_name, since.timestamp_millis()], |row| {
            let millis: i64 = row.get(3)?;
            Ok(SkillOutcome {
                skill_name: row.get(0)?,
                fidelity: row.get(1)?,
                success: row.get(2)?,
                timestamp: DateTime::from_timestamp_millis(millis).unwrap_or_default(),
            })
        })?;

        let mut outcomes = Vec::new();
        for row in rows {
            outcomes.push(row?);
        }
        Ok(outcomes)
    }

    fn skill_names(&self) -> LedgerResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT DISTINCT skill_name FROM skill_outcomes ORDER BY skill_name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerError::from)?;
        Ok(names)
    }
}
