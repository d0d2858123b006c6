//! Configuration management

use anyhow::{Context as _, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::executor::{ShellConfig, DEFAULT_MAX_OUTPUT_BYTES};
use crate::fidelity::DEFAULT_WINDOW_DAYS;
use crate::gate::DEFAULT_MAX_EXECUTION_SECS;
use crate::selector::{ScoringWeights, SelectorConfig};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite outcome ledger
    pub db_path: PathBuf,

    /// Directory of skill specifications
    pub skills_dir: PathBuf,

    /// Rolling stats window in days
    pub window_days: u32,

    /// Candidates considered per selection
    pub max_branches: usize,

    /// Executions a lone candidate needs for the warm confidence
    pub min_executions: u64,

    /// Default shell action timeout
    pub default_timeout: Duration,

    /// Selector scoring weights
    pub weights: ScoringWeights,

    /// Stdout capture cap per shell action
    pub max_output_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            skills_dir: PathBuf::from("skills"),
            window_days: DEFAULT_WINDOW_DAYS,
            max_branches: 5,
            min_executions: 5,
            default_timeout: Duration::from_secs(DEFAULT_MAX_EXECUTION_SECS),
            weights: ScoringWeights::default(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let db_path = std::env::var("SKILLFLOW_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let skills_dir = std::env::var("SKILLFLOW_SKILLS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.skills_dir);

        let weights = match std::env::var("SKILLFLOW_WEIGHTS") {
            Ok(raw) => ScoringWeights::parse(&raw).context("Invalid SKILLFLOW_WEIGHTS")?,
            Err(_) => defaults.weights,
        };

        Ok(Self {
            db_path,
            skills_dir,
            window_days: env_number("SKILLFLOW_WINDOW_DAYS", defaults.window_days),
            max_branches: env_number("SKILLFLOW_MAX_BRANCHES", defaults.max_branches),
            min_executions: env_number("SKILLFLOW_MIN_EXECUTIONS", defaults.min_executions),
            default_timeout: Duration::from_secs(env_number(
                "SKILLFLOW_DEFAULT_TIMEOUT",
                DEFAULT_MAX_EXECUTION_SECS,
            )),
            weights,
            max_output_bytes: env_number("SKILLFLOW_MAX_OUTPUT_BYTES", defaults.max_output_bytes),
        })
    }

    pub fn selector_config(&self) -> SelectorConfig {
        SelectorConfig {
            weights: self.weights,
            max_branches: self.max_branches,
            min_executions_for_confidence: self.min_executions,
            window_days: self.window_days,
        }
    }

    pub fn shell_config(&self) -> ShellConfig {
        ShellConfig {
            max_output_bytes: self.max_output_bytes,
            default_timeout: self.default_timeout,
            ..ShellConfig::default()
        }
    }
}

/// Parse a numeric variable; unset keeps the default, garbage warns and keeps it
fn env_number<T: FromStr + Copy + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}, using {}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("skillflow")
        .join("outcomes.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_db_path_under_platform_data_dir() {
        let path = EngineConfig::default().db_path;
        assert!(path.ends_with("skillflow/outcomes.db"));
        if let Some(data_dir) = dirs::data_local_dir() {
            assert!(path.starts_with(data_dir));
        }
    }

    // Env vars are process-global; keep every from_env assertion in one test.
    #[test]
    fn test_from_env() {
        for var in [
            "SKILLFLOW_DB_PATH",
            "SKILLFLOW_WINDOW_DAYS",
            "SKILLFLOW_MAX_BRANCHES",
            "SKILLFLOW_WEIGHTS",
        ] {
            std::env::remove_var(var);
        }

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.window_days, 30);
        assert_eq!(config.max_branches, 5);
        assert!(config.db_path.ends_with("skillflow/outcomes.db"));

        std::env::set_var("SKILLFLOW_DB_PATH", "/tmp/ledger.db");
        std::env::set_var("SKILLFLOW_WINDOW_DAYS", "14");
        std::env::set_var("SKILLFLOW_MAX_BRANCHES", "many");
        std::env::set_var("SKILLFLOW_WEIGHTS", "0.5,0.3,0.1,0.1");

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/ledger.db"));
        assert_eq!(config.window_days, 14);
        assert_eq!(config.max_branches, 5);
        assert_eq!(config.selector_config().weights.fidelity, 0.5);

        std::env::set_var("SKILLFLOW_WEIGHTS", "0.5,0.3");
        assert!(EngineConfig::from_env().is_err());

        for var in [
            "SKILLFLOW_DB_PATH",
            "SKILLFLOW_WINDOW_DAYS",
            "SKILLFLOW_MAX_BRANCHES",
            "SKILLFLOW_WEIGHTS",
        ] {
            std::env::remove_var(var);
        }
    }
}
