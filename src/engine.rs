//! Skill Engine
//!
//! Closes the learning loop: select a skill for an intent, execute it, score
//! the execution and append the outcome to the ledger that the next
//! selection will read.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::executor::{ExecutionResult, HybridExecutor};
use crate::fidelity::types::SUCCESS_THRESHOLD;
use crate::fidelity::{FidelityAggregator, FidelityStats, FidelityStatsSource, LedgerError, OutcomeLedger};
use crate::selector::{SelectionError, SelectorConfig, SkillSelector, ToTSelection};
use crate::skill::{SkillCatalog, SkillSpecification};
use crate::telemetry::Telemetry;
use crate::Context;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The ledger failed; outcomes are no longer being learned from
    #[error(transparent)]
    Storage(#[from] LedgerError),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Unknown skill: {0}")]
    UnknownSkill(String),
    #[error("Fidelity must be within [0, 1], got {0}")]
    InvalidFidelity(f64),
}

impl From<SelectionError> for EngineError {
    fn from(e: SelectionError) -> Self {
        match e {
            SelectionError::InvalidInput(msg) => EngineError::InvalidInput(msg),
            SelectionError::Storage(e) => EngineError::Storage(e),
        }
    }
}

/// Turns a finished execution into a fidelity score for the ledger
pub trait OutcomeScorer: Send + Sync {
    fn score(&self, spec: &SkillSpecification, result: &ExecutionResult) -> f64;
}

/// 1.0 on success, 0.0 on failure
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryScorer;

impl OutcomeScorer for BinaryScorer {
    fn score(&self, _spec: &SkillSpecification, result: &ExecutionResult) -> f64 {
        if result.success {
            1.0
        } else {
            0.0
        }
    }
}

/// One select-and-execute round
#[derive(Debug, Clone, Serialize)]
pub struct EngineRun {
    pub selection: ToTSelection,
    pub result: ExecutionResult,
    /// Score recorded for this execution
    pub fidelity: f64,
}

pub struct SkillEngine {
    catalog: SkillCatalog,
    ledger: Arc<dyn OutcomeLedger>,
    aggregator: Arc<FidelityAggregator>,
    selector: SkillSelector,
    executor: HybridExecutor,
    scorer: Arc<dyn OutcomeScorer>,
    telemetry: Arc<Telemetry>,
    deadline: Option<Duration>,
}

impl SkillEngine {
    pub fn new(catalog: SkillCatalog, ledger: Arc<dyn OutcomeLedger>) -> Self {
        let telemetry = Arc::new(Telemetry::new());
        let aggregator = Arc::new(FidelityAggregator::new(ledger.clone()));
        let selector = SkillSelector::new(aggregator.clone()).with_telemetry(telemetry.clone());
        let executor = HybridExecutor::new().with_telemetry(telemetry.clone());

        Self {
            catalog,
            ledger,
            aggregator,
            selector,
            executor,
            scorer: Arc::new(BinaryScorer),
            telemetry,
            deadline: None,
        }
    }

    pub fn with_selector_config(mut self, config: SelectorConfig) -> Self {
        self.selector = SkillSelector::with_config(self.aggregator.clone(), config)
            .with_telemetry(self.telemetry.clone());
        self
    }

    /// Replace the executor; engine telemetry is attached to it
    pub fn with_executor(mut self, executor: HybridExecutor) -> Self {
        self.executor = executor.with_telemetry(self.telemetry.clone());
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn OutcomeScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Overall wall-clock bound for each execution
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn catalog(&self) -> &SkillCatalog {
        &self.catalog
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn selector(&self) -> &SkillSelector {
        &self.selector
    }

    pub fn stats(&self, skill_name: &str) -> Result<FidelityStats, EngineError> {
        Ok(self
            .aggregator
            .stats(skill_name, self.selector.config().window_days)?)
    }

    pub fn select<S: AsRef<str>>(
        &self,
        candidates: &[S],
        context: &Context,
    ) -> Result<ToTSelection, EngineError> {
        Ok(self.selector.select(candidates, context)?)
    }

    /// Select among `candidates`, execute the winner with `input`, record the outcome.
    ///
    /// Every candidate must exist in the catalog. Execution failures are
    /// reported inside the returned [`ExecutionResult`]; only selection and
    /// storage problems are `Err`.
    pub async fn run<S: AsRef<str>>(
        &self,
        candidates: &[S],
        context: &Context,
        input: Context,
    ) -> Result<EngineRun, EngineError> {
        if let Some(missing) = candidates
            .iter()
            .map(|c| c.as_ref())
            .find(|name| self.catalog.get(name).is_none())
        {
            return Err(EngineError::UnknownSkill(missing.to_string()));
        }

        let selection = self.select(candidates, context)?;
        let skill = selection.selected.skill_name.clone();
        let spec = self
            .catalog
            .get(&skill)
            .ok_or_else(|| EngineError::UnknownSkill(skill.clone()))?;

        info!(
            "Selected {} (confidence {:.2}): {}",
            skill, selection.confidence, selection.selection_reason
        );

        let (result, fidelity) = self.execute_and_record(spec, input).await?;
        Ok(EngineRun {
            selection,
            result,
            fidelity,
        })
    }

    /// Execute a catalog skill by name and record the outcome
    pub async fn run_skill(&self, skill_name: &str, input: Context) -> Result<ExecutionResult, EngineError> {
        let spec = self
            .catalog
            .get(skill_name)
            .ok_or_else(|| EngineError::UnknownSkill(skill_name.to_string()))?;
        Ok(self.execute_and_record(spec, input).await?.0)
    }

    /// Execute any specification, catalogued or not, and record the outcome
    pub async fn execute(&self, spec: &SkillSpecification, input: Context) -> Result<ExecutionResult, EngineError> {
        Ok(self.execute_and_record(spec, input).await?.0)
    }

    /// Record an externally scored outcome, e.g. user feedback
    pub fn record_feedback(&self, skill_name: &str, fidelity: f64) -> Result<(), EngineError> {
        if skill_name.is_empty() {
            return Err(EngineError::InvalidInput("skill name is empty".to_string()));
        }
        if !(0.0..=1.0).contains(&fidelity) {
            return Err(EngineError::InvalidFidelity(fidelity));
        }

        self.ledger
            .record(skill_name, fidelity, fidelity >= SUCCESS_THRESHOLD, Utc::now())?;
        debug!("Recorded feedback for {}: {:.2}", skill_name, fidelity);
        Ok(())
    }

    async fn execute_and_record(
        &self,
        spec: &SkillSpecification,
        input: Context,
    ) -> Result<(ExecutionResult, f64), EngineError> {
        let result = match self.deadline {
            Some(deadline) => {
                self.executor
                    .execute_with_deadline(spec, input, None, deadline)
                    .await
            }
            None => self.executor.execute(spec, input, None).await,
        };

        let fidelity = self.scorer.score(spec, &result).clamp(0.0, 1.0);
        self.ledger
            .record(&spec.name, fidelity, result.success, Utc::now())?;
        debug!(
            "Recorded outcome for {}: fidelity {:.2}, success {}",
            spec.name, fidelity, result.success
        );

        Ok((result, fidelity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fidelity::InMemoryLedger;
    use crate::skill::{Action, Branch, Conditional};
    use serde_json::{json, Value};

    fn catalog() -> SkillCatalog {
        let mut catalog = SkillCatalog::new();
        catalog.insert(SkillSpecification::new("deploy_app", Action::evaluate("'deployed ' + target", "status")));
        catalog.insert(
            SkillSpecification::new("noop", Action::evaluate("1", "x")).with_conditional(Conditional {
                condition: "true".to_string(),
                then: Branch::Return {
                    value: json!({ "skipped": true }),
                },
                otherwise: None,
            }),
        );
        catalog.insert(SkillSpecification::new("broken", Action::evaluate("missing", "x")));
        catalog
    }

    fn ctx(value: serde_json::Value) -> Context {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_run_records_outcome() {
        let ledger = Arc::new(InMemoryLedger::new());
        let engine = SkillEngine::new(catalog(), ledger.clone());

        let run = engine
            .run(&["deploy_app"], &ctx(json!({ "intent": "deploy" })), ctx(json!({ "target": "prod" })))
            .await
            .unwrap();

        assert!(run.result.success);
        assert_eq!(run.result.outputs["status"], json!("deployed prod"));
        assert_eq!(run.fidelity, 1.0);
        assert_eq!(ledger.len(), 1);

        let stats = engine.stats("deploy_app").unwrap();
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.avg_fidelity, 1.0);
    }

    #[tokio::test]
    async fn test_failed_execution_scores_zero() {
        let ledger = Arc::new(InMemoryLedger::new());
        let engine = SkillEngine::new(catalog(), ledger.clone());

        let result = engine.run_skill("broken", Context::new()).await.unwrap();
        assert!(!result.success);

        let stats = engine.stats("broken").unwrap();
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.avg_fidelity, 0.0);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_unknown_candidates_rejected() {
        let engine = SkillEngine::new(catalog(), Arc::new(InMemoryLedger::new()));

        let err = engine
            .run(&["deploy_app", "ghost"], &Context::new(), Context::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownSkill(name) if name == "ghost"));

        let empty: [&str; 0] = [];
        let err = engine.run(&empty, &Context::new(), Context::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_custom_scorer() {
        struct Half;
        impl OutcomeScorer for Half {
            fn score(&self, _: &SkillSpecification, _: &ExecutionResult) -> f64 {
                0.5
            }
        }

        let ledger = Arc::new(InMemoryLedger::new());
        let engine = SkillEngine::new(catalog(), ledger).with_scorer(Arc::new(Half));
        let result = engine.run_skill("noop", Context::new()).await.unwrap();

        assert_eq!(Value::Object(result.outputs), json!({ "skipped": true }));
        assert_eq!(engine.stats("noop").unwrap().avg_fidelity, 0.5);
    }

    #[tokio::test]
    async fn test_telemetry_shared_across_components() {
        let engine = SkillEngine::new(catalog(), Arc::new(InMemoryLedger::new()));
        engine.run(&["deploy_app", "noop"], &Context::new(), ctx(json!({ "target": "x" }))).await.unwrap();

        let snapshot = engine.telemetry().snapshot();
        assert_eq!(snapshot.tot_selections, 1);
        assert_eq!(snapshot.codeact_executions, 1);
    }

    #[test]
    fn test_record_feedback_validates() {
        let ledger = Arc::new(InMemoryLedger::new());
        let engine = SkillEngine::new(catalog(), ledger.clone());

        engine.record_feedback("deploy_app", 0.9).unwrap();
        assert!(matches!(
            engine.record_feedback("deploy_app", 1.5),
            Err(EngineError::InvalidFidelity(_))
        ));
        assert!(engine.record_feedback("", 0.5).is_err());
        assert_eq!(ledger.len(), 1);
        assert_eq!(engine.stats("deploy_app").unwrap().success_rate, 1.0);
    }
}
