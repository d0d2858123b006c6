//! Safety Gate
//!
//! Pure policy evaluator for external commands.
//!
//! # Security Model
//!
//! 1. **Block patterns** are checked first and always veto
//! 2. **Allow patterns**, when configured, must match (otherwise default-allow)
//! 3. **Confirmation patterns** mark allowed commands that need a human yes
//!
//! Patterns are globs (`*`, `?`, `[abc]`, `[!abc]`) translated to anchored,
//! case-insensitive regexes. A command must match the *whole* pattern:
//! `git *` matches `git status` but neither `mygit status` nor `git`.
//!
//! The gate only decides. The executor enforces.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default hard timeout for a shell action, in seconds
pub const DEFAULT_MAX_EXECUTION_SECS: u64 = 30;

/// Gate construction errors
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Invalid gate pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Safety policy as authored in a skill specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyGates {
    /// If non-empty, commands must match one of these
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// Commands matching any of these never run
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    /// Hard wall-clock limit per shell action, in seconds
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time: u64,
    /// Commands matching any of these need confirmation
    #[serde(default)]
    pub require_confirmation: Vec<String>,
}

fn default_max_execution_time() -> u64 {
    DEFAULT_MAX_EXECUTION_SECS
}

impl Default for SafetyGates {
    fn default() -> Self {
        Self {
            allowed_commands: Vec::new(),
            blocked_patterns: Vec::new(),
            max_execution_time: DEFAULT_MAX_EXECUTION_SECS,
            require_confirmation: Vec::new(),
        }
    }
}

impl SafetyGates {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.max_execution_time)
    }
}

/// What the gate says about one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    /// Allowed, but only after confirmation
    RequireConfirmation,
    /// Matched a block pattern
    Blocked { pattern: String },
    /// An allow-list exists and nothing in it matched
    NotAllowListed,
}

impl GateDecision {
    pub fn is_permitted(&self) -> bool {
        matches!(self, GateDecision::Allow | GateDecision::RequireConfirmation)
    }
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    source: String,
    regex: Regex,
}

impl CompiledPattern {
    fn new(pattern: &str) -> Result<Self, GateError> {
        let regex = Regex::new(&glob_to_regex(pattern)).map_err(|source| GateError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    fn matches(&self, command: &str) -> bool {
        self.regex.is_match(command)
    }
}

/// Compiled, stateless policy. Cheap to share across threads.
#[derive(Debug, Clone)]
pub struct SafetyGate {
    allowed: Vec<CompiledPattern>,
    blocked: Vec<CompiledPattern>,
    confirm: Vec<CompiledPattern>,
    timeout: Duration,
}

impl SafetyGate {
    pub fn new(gates: &SafetyGates) -> Result<Self, GateError> {
        let compile = |patterns: &[String]| -> Result<Vec<CompiledPattern>, GateError> {
            patterns.iter().map(|p| CompiledPattern::new(p)).collect()
        };

        Ok(Self {
            allowed: compile(&gates.allowed_commands)?,
            blocked: compile(&gates.blocked_patterns)?,
            confirm: compile(&gates.require_confirmation)?,
            timeout: gates.timeout(),
        })
    }

    /// Gate with no patterns: everything allowed, nothing confirmed
    pub fn permissive() -> Self {
        Self {
            allowed: Vec::new(),
            blocked: Vec::new(),
            confirm: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_MAX_EXECUTION_SECS),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Full decision, block first
    pub fn evaluate(&self, command: &str) -> GateDecision {
        if let Some(hit) = self.blocked.iter().find(|p| p.matches(command)) {
            return GateDecision::Blocked {
                pattern: hit.source.clone(),
            };
        }

        if !self.allowed.is_empty() && !self.allowed.iter().any(|p| p.matches(command)) {
            return GateDecision::NotAllowListed;
        }

        if self.requires_confirmation(command) {
            GateDecision::RequireConfirmation
        } else {
            GateDecision::Allow
        }
    }

    pub fn is_command_allowed(&self, command: &str) -> bool {
        self.evaluate(command).is_permitted()
    }

    pub fn requires_confirmation(&self, command: &str) -> bool {
        self.confirm.iter().any(|p| p.matches(command))
    }
}

/// Translate a glob into an anchored, case-insensitive regex
pub fn glob_to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("(?is)^");
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => match class_end(&chars, i) {
                Some(end) => {
                    out.push('[');
                    let mut j = i + 1;
                    if chars[j] == '!' {
                        out.push('^');
                        j += 1;
                    }
                    for &c in &chars[j..end] {
                        // Keep ranges, escape everything else regex treats specially
                        if c == '\\' || c == '[' || c == ']' || c == '^' || c == '&' || c == '~' {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                    out.push(']');
                    i = end;
                }
                None => out.push_str(&regex::escape("[")),
            },
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    out.push('$');
    out
}

/// Index of the `]` closing a class opened at `start`, if any
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut j = start + 1;
    if chars.get(j) == Some(&'!') {
        j += 1;
    }
    // A leading ']' is a literal member
    if chars.get(j) == Some(&']') {
        j += 1;
    }
    while j < chars.len() {
        if chars[j] == ']' {
            return if j > start + 1 { Some(j) } else { None };
        }
        j += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(allowed: &[&str], blocked: &[&str], confirm: &[&str]) -> SafetyGate {
        SafetyGate::new(&SafetyGates {
            allowed_commands: allowed.iter().map(|s| s.to_string()).collect(),
            blocked_patterns: blocked.iter().map(|s| s.to_string()).collect(),
            require_confirmation: confirm.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_glob_anchoring() {
        let gate = gate(&["git *"], &[], &[]);

        assert!(gate.is_command_allowed("git status"));
        assert!(gate.is_command_allowed("git push origin main"));
        assert!(!gate.is_command_allowed("mygit status"));
        assert!(!gate.is_command_allowed("git"));
        assert!(!gate.is_command_allowed("echo git status"));
    }

    #[test]
    fn test_case_insensitive() {
        let gate = gate(&["git *"], &["*--force*"], &[]);
        assert!(gate.is_command_allowed("GIT Status"));
        assert!(!gate.is_command_allowed("git push --FORCE"));
    }

    #[test]
    fn test_block_precedence() {
        let gate = gate(&["git *"], &["git push*"], &[]);

        assert!(!gate.is_command_allowed("git push origin"));
        assert_eq!(
            gate.evaluate("git push origin"),
            GateDecision::Blocked {
                pattern: "git push*".to_string()
            }
        );
        assert!(gate.is_command_allowed("git status"));
    }

    #[test]
    fn test_default_allow_without_allowlist() {
        let gate = gate(&[], &["rm -rf *"], &[]);

        assert!(gate.is_command_allowed("ls -la"));
        assert!(!gate.is_command_allowed("rm -rf /"));
        assert_eq!(gate.evaluate("curl example.com"), GateDecision::Allow);
    }

    #[test]
    fn test_allowlist_rejects_unlisted() {
        let gate = gate(&["echo *", "ls"], &[], &[]);

        assert!(gate.is_command_allowed("ls"));
        assert!(!gate.is_command_allowed("ls -la"));
        assert_eq!(gate.evaluate("whoami"), GateDecision::NotAllowListed);
    }

    #[test]
    fn test_requires_confirmation() {
        let gate = gate(&[], &[], &["git push*"]);

        assert!(gate.requires_confirmation("git push origin main"));
        assert!(!gate.requires_confirmation("git status"));
        assert_eq!(gate.evaluate("git push"), GateDecision::RequireConfirmation);
        assert!(gate.is_command_allowed("git push"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let gate = gate(&["echo (a+b).txt"], &[], &[]);
        assert!(gate.is_command_allowed("echo (a+b).txt"));
        assert!(!gate.is_command_allowed("echo aab.txt"));
    }

    #[test]
    fn test_question_mark_and_classes() {
        let gate = gate(&["make test?", "cargo [bt]*"], &[], &[]);

        assert!(gate.is_command_allowed("make test1"));
        assert!(!gate.is_command_allowed("make test12"));
        assert!(gate.is_command_allowed("cargo build"));
        assert!(gate.is_command_allowed("cargo test --all"));
        assert!(!gate.is_command_allowed("cargo run"));

        let negated = self::gate(&["tool [!x]"], &[], &[]);
        assert!(negated.is_command_allowed("tool a"));
        assert!(!negated.is_command_allowed("tool x"));
    }

    #[test]
    fn test_unterminated_class_is_literal() {
        let gate = gate(&["echo [oops"], &[], &[]);
        assert!(gate.is_command_allowed("echo [oops"));
        assert!(!gate.is_command_allowed("echo o"));
    }

    #[test]
    fn test_star_spans_newlines() {
        let gate = gate(&[], &["*rm -rf*"], &[]);
        assert!(!gate.is_command_allowed("echo hi\nrm -rf /tmp/x"));
    }

    #[test]
    fn test_default_timeout() {
        let gates: SafetyGates = serde_json::from_str("{}").unwrap();
        assert_eq!(gates.max_execution_time, 30);
        assert_eq!(SafetyGate::new(&gates).unwrap().timeout(), Duration::from_secs(30));
    }
}
