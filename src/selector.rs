//! Tree-of-Thought Skill Selection
//!
//! Scores every candidate skill independently from its fidelity history and
//! the request context, then commits to the best one.
//!
//! ```text
//! score = 0.6·fidelity + 0.2·success_rate + 0.1·trend_bonus + 0.1·context_match
//! ```
//!
//! The weights live in [`ScoringWeights`] and can be swapped per selector.
//! Candidates beyond `max_branches` are dropped in list order before any
//! scoring happens, so callers should pre-filter by coarse relevance.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::fidelity::{FidelityStats, FidelityStatsSource, LedgerError, DEFAULT_WINDOW_DAYS};
use crate::telemetry::Telemetry;
use crate::Context;

/// Context keys scanned for keywords
const KEYWORD_KEYS: [&str; 5] = ["intent", "action", "query", "task", "command"];

/// Score gap that saturates the gap term of the confidence
const CONFIDENCE_GAP_SCALE: f64 = 0.2;

/// Execution count that saturates the maturity term of the confidence
const CONFIDENCE_MATURITY_SCALE: f64 = 20.0;

/// Selection errors
#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Storage(#[from] LedgerError),
}

/// Relative weight of each scoring term
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub fidelity: f64,
    pub success_rate: f64,
    pub trend: f64,
    pub context: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            fidelity: 0.6,
            success_rate: 0.2,
            trend: 0.1,
            context: 0.1,
        }
    }
}

impl ScoringWeights {
    /// Parse `"fidelity,success,trend,context"`, e.g. `"0.6,0.2,0.1,0.1"`
    pub fn parse(raw: &str) -> Result<Self, SelectionError> {
        let parts: Vec<f64> = raw
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|e| SelectionError::InvalidInput(format!("weights '{}': {}", raw, e)))?;

        if parts.len() != 4 {
            return Err(SelectionError::InvalidInput(format!(
                "expected 4 weights, got {}",
                parts.len()
            )));
        }
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(SelectionError::InvalidInput(format!(
                "weights must be finite and non-negative: '{}'",
                raw
            )));
        }

        Ok(Self {
            fidelity: parts[0],
            success_rate: parts[1],
            trend: parts[2],
            context: parts[3],
        })
    }

    fn score(&self, fidelity: f64, success_rate: f64, trend_bonus: f64, context_match: f64) -> f64 {
        self.fidelity * fidelity
            + self.success_rate * success_rate
            + self.trend * trend_bonus
            + self.context * context_match
    }
}

/// Selector configuration
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub weights: ScoringWeights,
    /// Candidates considered per call (list order)
    pub max_branches: usize,
    /// Executions a lone candidate needs for the warm confidence
    pub min_executions_for_confidence: u64,
    /// Stats window in days
    pub window_days: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            max_branches: 5,
            min_executions_for_confidence: 5,
            window_days: DEFAULT_WINDOW_DAYS,
        }
    }
}

/// One ranked candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillCandidate {
    pub skill_name: String,
    pub score: f64,
    pub fidelity: f64,
    pub success_rate: f64,
    pub trend_bonus: f64,
    pub context_match: f64,
    pub total_executions: u64,
}

/// Outcome of one selection call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToTSelection {
    pub selected: SkillCandidate,
    /// All evaluated candidates, best first
    pub candidates: Vec<SkillCandidate>,
    pub selection_reason: String,
    /// In [0, 1]
    pub confidence: f64,
    /// Candidates dropped by the `max_branches` bound, never scored
    pub truncated: Vec<String>,
}

/// Ranks candidate skills against their history
pub struct SkillSelector {
    stats: Arc<dyn FidelityStatsSource>,
    config: SelectorConfig,
    telemetry: Option<Arc<Telemetry>>,
}

impl SkillSelector {
    pub fn new(stats: Arc<dyn FidelityStatsSource>) -> Self {
        Self::with_config(stats, SelectorConfig::default())
    }

    pub fn with_config(stats: Arc<dyn FidelityStatsSource>, config: SelectorConfig) -> Self {
        Self {
            stats,
            config,
            telemetry: None,
        }
    }

    /// Attach telemetry counters
    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Select using the configured `max_branches`
    pub fn select<S: AsRef<str>>(
        &self,
        candidates: &[S],
        context: &Context,
    ) -> Result<ToTSelection, SelectionError> {
        self.select_with_branches(candidates, context, self.config.max_branches)
    }

    /// Rank at most `max_branches` candidates, in list order, and pick the best
    pub fn select_with_branches<S: AsRef<str>>(
        &self,
        candidates: &[S],
        context: &Context,
        max_branches: usize,
    ) -> Result<ToTSelection, SelectionError> {
        if candidates.is_empty() {
            return Err(SelectionError::InvalidInput(
                "candidate list is empty".to_string(),
            ));
        }

        let limit = max_branches.max(1);
        let (considered, dropped) = candidates.split_at(candidates.len().min(limit));
        let truncated: Vec<String> = dropped.iter().map(|c| c.as_ref().to_string()).collect();
        if !truncated.is_empty() {
            warn!(
                "Selection truncated to {} candidates; not scored: {}",
                limit,
                truncated.join(", ")
            );
        }

        let keywords = extract_keywords(context);

        let mut ranked = Vec::with_capacity(considered.len());
        for name in considered {
            ranked.push(self.evaluate(name.as_ref(), &keywords)?);
        }

        // Stable: equal scores keep candidate-list order
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

        let confidence = self.confidence(&ranked);
        let selection_reason = selection_reason(&ranked);
        let selected = ranked[0].clone();

        debug!(
            "Selected skill '{}' (score={:.3}, confidence={:.2}) from {} candidates",
            selected.skill_name,
            selected.score,
            confidence,
            ranked.len()
        );

        if let Some(ref telemetry) = self.telemetry {
            telemetry.record_selection(confidence);
        }

        Ok(ToTSelection {
            selected,
            candidates: ranked,
            selection_reason,
            confidence,
            truncated,
        })
    }

    fn evaluate(&self, skill_name: &str, keywords: &[String]) -> Result<SkillCandidate, SelectionError> {
        let mut stats = self.stats.stats(skill_name, self.config.window_days)?;
        if !(stats.avg_fidelity.is_finite() && stats.success_rate.is_finite() && stats.recent_trend.is_finite()) {
            warn!("Non-finite stats for '{}', scoring it as cold", skill_name);
            stats = FidelityStats::cold_start();
        }

        let trend_bonus = (0.5 + stats.recent_trend).clamp(0.0, 1.0);
        let context_match = context_match(skill_name, keywords);
        let score = self
            .config
            .weights
            .score(stats.avg_fidelity, stats.success_rate, trend_bonus, context_match);

        Ok(SkillCandidate {
            skill_name: skill_name.to_string(),
            score,
            fidelity: stats.avg_fidelity,
            success_rate: stats.success_rate,
            trend_bonus,
            context_match,
            total_executions: stats.total_executions,
        })
    }

    fn confidence(&self, ranked: &[SkillCandidate]) -> f64 {
        let best = &ranked[0];

        let Some(second) = ranked.get(1) else {
            // Lone candidate: discount unless it has a track record
            return if best.total_executions >= self.config.min_executions_for_confidence {
                0.9
            } else {
                0.5
            };
        };

        let gap = ((best.score - second.score) / CONFIDENCE_GAP_SCALE).clamp(0.0, 1.0);
        let maturity = (best.total_executions as f64 / CONFIDENCE_MATURITY_SCALE).min(1.0);
        let fidelity = best.fidelity.clamp(0.0, 1.0);

        (0.4 * gap + 0.3 * maturity + 0.3 * fidelity).clamp(0.0, 1.0)
    }
}

/// Keywords from the well-known context keys plus an explicit `keywords` list.
///
/// Splits on whitespace, `-` and `_`, lower-cases, drops tokens of two
/// characters or fewer, de-duplicates in first-seen order.
pub fn extract_keywords(context: &Context) -> Vec<String> {
    let mut sources: Vec<&str> = KEYWORD_KEYS
        .iter()
        .filter_map(|key| context.get(*key).and_then(Value::as_str))
        .collect();

    match context.get("keywords") {
        Some(Value::Array(items)) => sources.extend(items.iter().filter_map(Value::as_str)),
        Some(Value::String(s)) => sources.push(s.as_str()),
        _ => {}
    }

    let mut keywords: Vec<String> = Vec::new();
    for source in sources {
        for token in source.split(|c: char| c.is_whitespace() || c == '-' || c == '_') {
            let token = token.to_lowercase();
            if token.chars().count() > 2 && !keywords.contains(&token) {
                keywords.push(token);
            }
        }
    }
    keywords
}

/// Fraction of keywords found (case-insensitively) inside the skill name
pub fn context_match(skill_name: &str, keywords: &[String]) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let name = skill_name.to_lowercase();
    let hits = keywords.iter().filter(|k| name.contains(k.as_str())).count();
    hits as f64 / keywords.len() as f64
}

/// Human-readable justification. Never feeds back into the numbers.
fn selection_reason(ranked: &[SkillCandidate]) -> String {
    let best = &ranked[0];
    let mut reasons = Vec::new();

    if best.fidelity >= 0.8 {
        reasons.push(format!("high fidelity ({:.2})", best.fidelity));
    }
    if best.success_rate >= 0.8 {
        reasons.push(format!("strong success rate ({:.0}%)", best.success_rate * 100.0));
    }
    if best.trend_bonus > 0.6 {
        reasons.push("improving trend".to_string());
    }
    if best.context_match > 0.5 {
        reasons.push(format!("context match ({:.0}%)", best.context_match * 100.0));
    }
    if best.total_executions >= 20 {
        reasons.push(format!("well established ({} runs)", best.total_executions));
    } else if best.total_executions < 5 {
        reasons.push(format!("limited history ({} runs)", best.total_executions));
    }
    if let Some(second) = ranked.get(1) {
        let gap = best.score - second.score;
        if gap > 0.1 {
            reasons.push(format!("clear lead over '{}' (+{:.2})", second.skill_name, gap));
        }
    }

    if reasons.is_empty() {
        format!("'{}' ranked highest (score {:.3})", best.skill_name, best.score)
    } else {
        format!("'{}': {}", best.skill_name, reasons.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn stats(avg: f64, rate: f64, trend: f64, runs: u64) -> FidelityStats {
        FidelityStats {
            total_executions: runs,
            avg_fidelity: avg,
            success_rate: rate,
            recent_trend: trend,
        }
    }

    fn selector(table: &[(&str, FidelityStats)]) -> SkillSelector {
        let map: HashMap<String, FidelityStats> =
            table.iter().map(|(n, s)| (n.to_string(), *s)).collect();
        SkillSelector::new(Arc::new(map))
    }

    fn ctx(value: Value) -> Context {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_empty_candidates_rejected() {
        let selector = selector(&[]);
        let empty: [&str; 0] = [];
        let err = selector.select(&empty, &Context::new()).unwrap_err();
        assert!(matches!(err, SelectionError::InvalidInput(_)));
    }

    #[test]
    fn test_keyword_extraction() {
        let context = ctx(json!({
            "intent": "git-push to_origin",
            "task": "Deploy the app",
            "keywords": ["Release", "ok"],
            "ignored": "nothing here"
        }));

        let keywords = extract_keywords(&context);
        assert_eq!(keywords, vec!["git", "push", "origin", "deploy", "the", "app", "release"]);
    }

    #[test]
    fn test_context_match_fraction() {
        let keywords = vec!["git".to_string(), "push".to_string(), "deploy".to_string(), "zzz".to_string()];
        assert_eq!(context_match("Git_Push", &keywords), 0.5);
        assert_eq!(context_match("anything", &[]), 0.0);
    }

    #[test]
    fn test_score_formula() {
        let selector = selector(&[("git_push", stats(0.8, 0.5, 0.2, 10))]);
        let context = ctx(json!({ "intent": "push" }));

        let selection = selector.select(&["git_push"], &context).unwrap();
        let c = &selection.selected;

        assert!((c.trend_bonus - 0.7).abs() < 1e-9);
        assert_eq!(c.context_match, 1.0);
        let expected = 0.6 * 0.8 + 0.2 * 0.5 + 0.1 * 0.7 + 0.1 * 1.0;
        assert!((c.score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_trend_bonus_clamped() {
        let selector = selector(&[
            ("rising", stats(0.5, 0.5, 0.9, 10)),
            ("falling", stats(0.5, 0.5, -0.9, 10)),
        ]);
        let selection = selector.select(&["rising", "falling"], &Context::new()).unwrap();

        assert_eq!(selection.candidates[0].trend_bonus, 1.0);
        assert_eq!(selection.candidates[1].trend_bonus, 0.0);
    }

    #[test]
    fn test_ties_keep_candidate_order() {
        let same = stats(0.7, 0.7, 0.0, 8);
        let selector = selector(&[("beta", same), ("alpha", same), ("gamma", same)]);

        for _ in 0..5 {
            let selection = selector
                .select(&["beta", "alpha", "gamma"], &Context::new())
                .unwrap();
            let order: Vec<&str> = selection
                .candidates
                .iter()
                .map(|c| c.skill_name.as_str())
                .collect();
            assert_eq!(order, vec!["beta", "alpha", "gamma"]);
            assert_eq!(selection.selected.skill_name, "beta");
        }
    }

    #[test]
    fn test_non_finite_stats_score_as_cold() {
        let broken = stats(f64::NAN, 0.9, f64::NAN, 12);
        let selector = selector(&[("broken", broken), ("steady", stats(0.8, 0.9, 0.0, 12))]);

        let selection = selector.select(&["broken", "steady"], &Context::new()).unwrap();
        assert_eq!(selection.selected.skill_name, "steady");
        assert_eq!(selection.candidates[1].skill_name, "broken");
        assert_eq!(selection.candidates[1].fidelity, 0.5);
        assert!(selection.candidates.iter().all(|c| c.score.is_finite()));
        assert!((0.0..=1.0).contains(&selection.confidence));
    }

    #[test]
    fn test_truncation_is_list_order() {
        let selector = selector(&[
            ("weak_a", stats(0.1, 0.0, 0.0, 3)),
            ("weak_b", stats(0.2, 0.0, 0.0, 3)),
            ("strong", stats(0.95, 1.0, 0.0, 30)),
        ]);

        let selection = selector
            .select_with_branches(&["weak_a", "weak_b", "strong"], &Context::new(), 2)
            .unwrap();

        assert_eq!(selection.candidates.len(), 2);
        assert_eq!(selection.selected.skill_name, "weak_b");
        assert_eq!(selection.truncated, vec!["strong"]);
    }

    #[test]
    fn test_single_candidate_confidence() {
        let selector = selector(&[("warm", stats(0.3, 0.0, 0.0, 5)), ("cold", stats(0.9, 1.0, 0.0, 4))]);

        let warm = selector.select(&["warm"], &Context::new()).unwrap();
        assert_eq!(warm.confidence, 0.9);

        let cold = selector.select(&["cold"], &Context::new()).unwrap();
        assert_eq!(cold.confidence, 0.5);

        let unknown = selector.select(&["never_seen"], &Context::new()).unwrap();
        assert_eq!(unknown.confidence, 0.5);
        assert_eq!(unknown.selected.fidelity, 0.5);
    }

    #[test]
    fn test_confidence_components() {
        let selector = selector(&[
            ("first", stats(1.0, 1.0, 0.0, 40)),
            ("second", stats(0.0, 0.0, 0.0, 0)),
        ]);
        let selection = selector.select(&["first", "second"], &Context::new()).unwrap();
        assert!((selection.confidence - 1.0).abs() < 1e-9);

        let close = self::selector(&[
            ("first", stats(0.5, 0.5, 0.0, 10)),
            ("second", stats(0.5, 0.5, 0.0, 10)),
        ]);
        let selection = close.select(&["first", "second"], &Context::new()).unwrap();
        // no gap, half maturity, 0.5 fidelity
        assert!((selection.confidence - (0.3 * 0.5 + 0.3 * 0.5)).abs() < 1e-9);
    }

    #[test]
    fn test_custom_weights() {
        let table = [
            ("reliable", stats(0.9, 0.9, 0.0, 10)),
            ("match_me", stats(0.1, 0.1, 0.0, 10)),
        ];
        let map: HashMap<String, FidelityStats> =
            table.iter().map(|(n, s)| (n.to_string(), *s)).collect();
        let config = SelectorConfig {
            weights: ScoringWeights {
                fidelity: 0.0,
                success_rate: 0.0,
                trend: 0.0,
                context: 1.0,
            },
            ..Default::default()
        };
        let selector = SkillSelector::with_config(Arc::new(map), config);

        let context = ctx(json!({ "query": "match" }));
        let selection = selector.select(&["reliable", "match_me"], &context).unwrap();
        assert_eq!(selection.selected.skill_name, "match_me");
    }

    #[test]
    fn test_weights_parse() {
        let weights = ScoringWeights::parse("0.5, 0.3, 0.1, 0.1").unwrap();
        assert_eq!(weights.success_rate, 0.3);

        assert!(ScoringWeights::parse("0.5,0.5").is_err());
        assert!(ScoringWeights::parse("a,b,c,d").is_err());
        assert!(ScoringWeights::parse("-1,0,0,0").is_err());
    }

    #[test]
    fn test_reason_mentions_strengths() {
        let selector = selector(&[
            ("deploy_app", stats(0.9, 0.9, 0.3, 25)),
            ("other", stats(0.2, 0.1, 0.0, 2)),
        ]);
        let context = ctx(json!({ "intent": "deploy" }));
        let selection = selector.select(&["deploy_app", "other"], &context).unwrap();

        let reason = &selection.selection_reason;
        assert!(reason.contains("high fidelity"));
        assert!(reason.contains("strong success rate"));
        assert!(reason.contains("improving trend"));
        assert!(reason.contains("well established"));
        assert!(reason.contains("clear lead"));
    }

    #[test]
    fn test_telemetry_counts_selections() {
        let telemetry = Arc::new(Telemetry::new());
        let selector = selector(&[("warm", stats(0.9, 1.0, 0.0, 10))]).with_telemetry(telemetry.clone());

        selector.select(&["warm"], &Context::new()).unwrap();
        selector.select(&["cold"], &Context::new()).unwrap();

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.tot_selections, 2);
        assert_eq!(snapshot.tot_high_confidence, 1);
    }
}
