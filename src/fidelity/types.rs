//! Fidelity data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fidelity at or above which an execution counts as a success
pub const SUCCESS_THRESHOLD: f64 = 0.7;

/// Average fidelity reported for a skill with no history
pub const COLD_START_FIDELITY: f64 = 0.5;

/// Default rolling window for statistics
pub const DEFAULT_WINDOW_DAYS: u32 = 30;

/// Length of the "recent" sub-window used for the trend
pub const TREND_WINDOW_DAYS: u32 = 7;

/// One recorded skill execution. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillOutcome {
    pub skill_name: String,
    /// Post-hoc quality score in [0, 1]
    pub fidelity: f64,
    /// Whether the execution itself completed without failing
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl SkillOutcome {
    /// Create an outcome, clamping fidelity into [0, 1]
    pub fn new(skill_name: &str, fidelity: f64, success: bool, timestamp: DateTime<Utc>) -> Self {
        let fidelity = if fidelity.is_finite() {
            fidelity.clamp(0.0, 1.0)
        } else {
            0.0
        };

        Self {
            skill_name: skill_name.to_string(),
            fidelity,
            success,
            timestamp,
        }
    }

    /// Outcome stamped with the current time
    pub fn now(skill_name: &str, fidelity: f64, success: bool) -> Self {
        Self::new(skill_name, fidelity, success, Utc::now())
    }
}

/// Rolling statistics for one skill, derived on demand
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FidelityStats {
    pub total_executions: u64,
    pub avg_fidelity: f64,
    /// Fraction of executions with fidelity >= 0.7
    pub success_rate: f64,
    /// Recent 7 day average minus the average of the rest of the window
    pub recent_trend: f64,
}

impl FidelityStats {
    /// Stats for a skill that has never been recorded
    pub fn cold_start() -> Self {
        Self {
            total_executions: 0,
            avg_fidelity: COLD_START_FIDELITY,
            success_rate: 0.0,
            recent_trend: 0.0,
        }
    }

    pub fn is_cold(&self) -> bool {
        self.total_executions == 0
    }
}

impl Default for FidelityStats {
    fn default() -> Self {
        Self::cold_start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_clamps_fidelity() {
        let high = SkillOutcome::now("deploy", 1.7, true);
        assert_eq!(high.fidelity, 1.0);

        let low = SkillOutcome::now("deploy", -0.2, false);
        assert_eq!(low.fidelity, 0.0);

        let nan = SkillOutcome::now("deploy", f64::NAN, false);
        assert_eq!(nan.fidelity, 0.0);
    }

    #[test]
    fn test_cold_start_defaults() {
        let stats = FidelityStats::default();
        assert!(stats.is_cold());
        assert_eq!(stats.avg_fidelity, 0.5);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.recent_trend, 0.0);
    }
}
