//! Skillflow
//!
//! Adaptive skill selection and hybrid execution engine.
//!
//! # Features
//!
//! - **Outcome Ledger**: append-only execution history (SQLite or in-memory)
//! - **Fidelity Aggregation**: rolling 30 day stats with a 7 day trend
//! - **Tree-of-Thought Selection**: weighted ranking with confidence and reasons
//! - **Safety Gates**: anchored glob allow/block/confirm policy per skill
//! - **Hybrid Execution**: pre-actions, conditionals, main and post actions
//!   over shell, generation and sandboxed evaluation
//! - **Telemetry**: selection and execution counters, Prometheus text output
//!
//! # Architecture
//!
//! ```text
//! intent + candidates ──► SkillSelector ◄── FidelityAggregator ◄── OutcomeLedger
//!                              │                                        ▲
//!                              ▼                                        │
//!                       SkillSpecification                              │
//!                              │                                        │
//!                              ▼                                        │
//!                        HybridExecutor ──► SafetyGate ──► sh -c        │
//!                              │         ├─► Generator                  │
//!                              │         └─► expr (sandboxed)           │
//!                              ▼                                        │
//!                       ExecutionResult ──► OutcomeScorer ──────────────┘
//!                              │
//!                              └──► Telemetry
//! ```
//!
//! [`SkillEngine`] wires the loop together.

pub mod capability;
pub mod config;
pub mod engine;
pub mod executor;
pub mod expr;
pub mod fidelity;
pub mod gate;
pub mod selector;
pub mod skill;
pub mod telemetry;
pub mod template;

/// Variable mapping threaded through selection and execution
pub type Context = serde_json::Map<String, serde_json::Value>;

pub use capability::{AutoApprove, Confirmer, FnConfirmer, FnGenerator, Generator};
pub use config::EngineConfig;
pub use engine::{BinaryScorer, EngineError, EngineRun, OutcomeScorer, SkillEngine};
pub use executor::{ActionError, ErrorKind, ExecutionResult, HybridExecutor, Phase, ShellConfig};
pub use fidelity::{
    FidelityAggregator, FidelityStats, FidelityStatsSource, InMemoryLedger, LedgerError, OutcomeLedger,
    SkillOutcome, SqliteLedger,
};
pub use gate::{GateDecision, GateError, SafetyGate, SafetyGates};
pub use selector::{ScoringWeights, SelectionError, SelectorConfig, SkillCandidate, SkillSelector, ToTSelection};
pub use skill::{Action, Branch, CodeSection, Conditional, PromptSection, SkillCatalog, SkillSpecification, SpecError};
pub use telemetry::{Telemetry, TelemetrySnapshot};
pub use template::TemplateError;
