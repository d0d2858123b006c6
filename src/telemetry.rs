//! Selection & Execution Telemetry
//!
//! Write-only counters shared by the selector and executor. An external
//! dashboard scrapes them through [`Telemetry::snapshot`] or
//! [`Telemetry::render_prometheus`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Confidence at or above which a selection counts as high-confidence
pub const HIGH_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Lock-free event counters
#[derive(Debug, Default)]
pub struct Telemetry {
    tot_selections: AtomicU64,
    tot_high_confidence: AtomicU64,
    codeact_executions: AtomicU64,
    codeact_gate_triggers: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub tot_selections: u64,
    pub tot_high_confidence: u64,
    pub codeact_executions: u64,
    pub codeact_gate_triggers: u64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one selection call
    pub fn record_selection(&self, confidence: f64) {
        self.tot_selections.fetch_add(1, Ordering::Relaxed);
        if confidence >= HIGH_CONFIDENCE_THRESHOLD {
            self.tot_high_confidence.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count one executor run and the gates it tripped
    pub fn record_execution(&self, gates_triggered: usize) {
        self.codeact_executions.fetch_add(1, Ordering::Relaxed);
        self.codeact_gate_triggers
            .fetch_add(gates_triggered as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            tot_selections: self.tot_selections.load(Ordering::Relaxed),
            tot_high_confidence: self.tot_high_confidence.load(Ordering::Relaxed),
            codeact_executions: self.codeact_executions.load(Ordering::Relaxed),
            codeact_gate_triggers: self.codeact_gate_triggers.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition format
    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let counters = [
            ("tot_selections", "Skill selection calls", snapshot.tot_selections),
            (
                "tot_high_confidence",
                "Selections with confidence >= 0.7",
                snapshot.tot_high_confidence,
            ),
            ("codeact_executions", "Hybrid skill executions", snapshot.codeact_executions),
            (
                "codeact_gate_triggers",
                "Safety gate triggers during execution",
                snapshot.codeact_gate_triggers,
            ),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, value));
        }
        output
    }
}
