//! Outcome ledger contract

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::types::SkillOutcome;

/// Ledger errors. Any of these means the learning loop itself is broken.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("Ledger I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Append-only store of skill outcomes.
///
/// Appends must be safe under concurrent writers. Reads may run alongside
/// writes and need not observe rows committed after the read started.
pub trait OutcomeLedger: Send + Sync {
    /// Append one outcome. There is no update or delete-by-id.
    fn record_outcome(&self, outcome: &SkillOutcome) -> LedgerResult<()>;

    /// Outcomes for `skill_name` with `timestamp >= since`, oldest first
    fn outcomes_since(&self, skill_name: &str, since: DateTime<Utc>) -> LedgerResult<Vec<SkillOutcome>>;

    /// Distinct skill names present in the ledger
    fn skill_names(&self) -> LedgerResult<Vec<String>>;

    /// Convenience wrapper around [`OutcomeLedger::record_outcome`]
    fn record(
        &self,
        skill_name: &str,
        fidelity: f64,
        success: bool,
        timestamp: DateTime<Utc>,
    ) -> LedgerResult<()> {
        self.record_outcome(&SkillOutcome::new(skill_name, fidelity, success, timestamp))
    }
}
