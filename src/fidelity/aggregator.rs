//! Fidelity Aggregator
//!
//! Rolling statistics over the ledger. Pure reads, recomputed per call.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use super::ledger::{LedgerResult, OutcomeLedger};
use super::types::{FidelityStats, SkillOutcome, SUCCESS_THRESHOLD, TREND_WINDOW_DAYS};

/// Anything that can report per-skill statistics to the selector
pub trait FidelityStatsSource: Send + Sync {
    fn stats(&self, skill_name: &str, window_days: u32) -> LedgerResult<FidelityStats>;
}

/// Precomputed stats; unknown skills are cold.
impl FidelityStatsSource for HashMap<String, FidelityStats> {
    fn stats(&self, skill_name: &str, _window_days: u32) -> LedgerResult<FidelityStats> {
        Ok(self.get(skill_name).copied().unwrap_or_default())
    }
}

/// Computes [`FidelityStats`] from an [`OutcomeLedger`]
#[derive(Clone)]
pub struct FidelityAggregator {
    ledger: Arc<dyn OutcomeLedger>,
}

impl FidelityAggregator {
    pub fn new(ledger: Arc<dyn OutcomeLedger>) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &Arc<dyn OutcomeLedger> {
        &self.ledger
    }

    /// Stats as of an explicit instant
    pub fn stats_at(
        &self,
        skill_name: &str,
        window_days: u32,
        now: DateTime<Utc>,
    ) -> LedgerResult<FidelityStats> {
        let since = days_before(now, window_days);
        let outcomes = self.ledger.outcomes_since(skill_name, since)?;
        Ok(compute_stats(&outcomes, now))
    }
}

impl FidelityStatsSource for FidelityAggregator {
    fn stats(&self, skill_name: &str, window_days: u32) -> LedgerResult<FidelityStats> {
        self.stats_at(skill_name, window_days, Utc::now())
    }
}

/// Aggregate outcomes already filtered to the window.
///
/// The trend compares the last 7 days against the rest of the window; it is
/// zero when either side is empty.
pub fn compute_stats(outcomes: &[SkillOutcome], now: DateTime<Utc>) -> FidelityStats {
    if outcomes.is_empty() {
        return FidelityStats::cold_start();
    }

    let total = outcomes.len() as f64;
    let avg_fidelity = outcomes.iter().map(|o| o.fidelity).sum::<f64>() / total;
    let successes = outcomes
        .iter()
        .filter(|o| o.fidelity >= SUCCESS_THRESHOLD)
        .count() as f64;

    let recent_cutoff = days_before(now, TREND_WINDOW_DAYS);
    let (recent, older): (Vec<&SkillOutcome>, Vec<&SkillOutcome>) =
        outcomes.iter().partition(|o| o.timestamp >= recent_cutoff);

    let recent_trend = match (mean(&recent), mean(&older)) {
        (Some(r), Some(o)) => r - o,
        _ => 0.0,
    };

    FidelityStats {
        total_executions: outcomes.len() as u64,
        avg_fidelity,
        success_rate: (successes / total).clamp(0.0, 1.0),
        recent_trend,
    }
}

/// `now - days`, saturating at the earliest representable instant
fn days_before(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    now.checked_sub_signed(Duration::days(i64::from(days)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn mean(outcomes: &[&SkillOutcome]) -> Option<f64> {
    if outcomes.is_empty() {
        None
    } else {
        Some(outcomes.iter().map(|o| o.fidelity).sum::<f64>() / outcomes.len() as f64)
    }
}
