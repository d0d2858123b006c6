//! In-memory Outcome Ledger

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeSet;

use super::ledger::{LedgerResult, OutcomeLedger};
use super::types::SkillOutcome;

/// Volatile ledger. Useful for tests and one-shot runs.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    outcomes: RwLock<Vec<SkillOutcome>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.outcomes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.read().is_empty()
    }
}

impl OutcomeLedger for InMemoryLedger {
    fn record_outcome(&self, outcome: &SkillOutcome) -> LedgerResult<()> {
        self.outcomes.write().push(outcome.clone());
        Ok(())
    }

    fn outcomes_since(&self, skill_name: &str, since: DateTime<Utc>) -> LedgerResult<Vec<SkillOutcome>> {
        let mut matching: Vec<SkillOutcome> = self
            .outcomes
            .read()
            .iter()
            .filter(|o| o.skill_name == skill_name && o.timestamp >= since)
            .cloned()
            .collect();
        // Appends can arrive out of timestamp order
        matching.sort_by_key(|o| o.timestamp);
        Ok(matching)
    }

    fn skill_names(&self) -> LedgerResult<Vec<String>> {
        let names: BTreeSet<String> = self
            .outcomes
            .read()
            .iter()
            .map(|o| o.skill_name.clone())
            .collect();
        Ok(names.into_iter().collect())
    }
}
