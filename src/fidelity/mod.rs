//! Outcome Ledger & Fidelity Aggregation
//!
//! Append-only history of skill executions and the rolling statistics the
//! selector ranks candidates with.
//!
//! # Architecture
//!
//! ```text
//! HybridExecutor ──► OutcomeLedger::record_outcome ──► SQLite / in-memory
//!                                                          │
//! SkillSelector ◄── FidelityStatsSource ◄── FidelityAggregator
//!                    (30 day window, 7 day trend)
//! ```
//!
//! Storage is pluggable: anything implementing [`OutcomeLedger`] works.
//! Reads are not required to observe writes that commit after they begin.

pub mod aggregator;
pub mod ledger;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use aggregator::{FidelityAggregator, FidelityStatsSource};
pub use ledger::{LedgerError, OutcomeLedger};
pub use memory::InMemoryLedger;
pub use sqlite::SqliteLedger;
pub use types::{FidelityStats, SkillOutcome, DEFAULT_WINDOW_DAYS};
