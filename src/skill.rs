//! Hybrid Skill Specifications
//!
//! A skill pairs descriptive prompt metadata with an explicit action
//! sequence and a safety policy:
//!
//! ```toml
//! name = "git_push"
//!
//! [prompt_section]
//! description = "Commit and push pending changes"
//!
//! [[code_section.pre_actions]]
//! type = "shell"
//! command = "git diff"
//! capture = "diff"
//!
//! [[code_section.conditionals]]
//! if = "len(diff) == 0"
//! then = { type = "return", value = { error = "no changes" } }
//!
//! [code_section.main_action]
//! type = "generate"
//! prompt = "Write a commit message for:\n{{diff}}"
//! output = "message"
//!
//! [[code_section.post_actions]]
//! type = "shell"
//! command = "git commit -am {{message}}"
//!
//! [safety_gates]
//! allowed_commands = ["git *"]
//! blocked_patterns = ["*--force*"]
//! max_execution_time = 30
//! ```
//!
//! Values substituted into a shell `command` arrive already quoted as a
//! single shell word, so templates leave placeholders bare.
//!
//! Specifications are authored outside the engine and treated as read-only.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::expr::{parse_expression, parse_program, ExprError};
use crate::gate::{GateError, SafetyGate, SafetyGates};

/// Specification loading and validation errors
#[derive(Error, Debug)]
pub enum SpecError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to parse {path} as TOML or JSON")]
    UnknownFormat { path: PathBuf },
    #[error("Invalid skill '{skill}': {message}")]
    Invalid { skill: String, message: String },
    #[error("Skill '{skill}', {location}: {source}")]
    Expression {
        skill: String,
        location: String,
        #[source]
        source: ExprError,
    },
    #[error(transparent)]
    Gate(#[from] GateError),
}

/// Descriptive metadata. Never executed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptSection {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub examples: Vec<String>,
    /// Anything else the author wants to keep with the skill
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// One step of a skill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
    /// External command, gated
    Shell {
        command: String,
        /// Variable receiving trimmed stdout
        #[serde(default)]
        capture: Option<String>,
        /// Tighter limit than the gate's `max_execution_time`
        #[serde(default)]
        timeout_secs: Option<u64>,
        /// Fail on non-zero exit
        #[serde(default = "default_check")]
        check: bool,
    },
    /// Call the injected generation capability
    Generate { prompt: String, output: String },
    /// Sandboxed expression block
    Evaluate { code: String, output: String },
}

fn default_check() -> bool {
    true
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Shell { .. } => "shell",
            Action::Generate { .. } => "generate",
            Action::Evaluate { .. } => "evaluate",
        }
    }

    /// Context variable this action writes, if any
    pub fn output_var(&self) -> Option<&str> {
        match self {
            Action::Shell { capture, .. } => capture.as_deref(),
            Action::Generate { output, .. } | Action::Evaluate { output, .. } => Some(output),
        }
    }

    pub fn shell(command: impl Into<String>) -> Self {
        Action::Shell {
            command: command.into(),
            capture: None,
            timeout_secs: None,
            check: true,
        }
    }

    pub fn shell_capture(command: impl Into<String>, capture: impl Into<String>) -> Self {
        Action::Shell {
            command: command.into(),
            capture: Some(capture.into()),
            timeout_secs: None,
            check: true,
        }
    }

    pub fn generate(prompt: impl Into<String>, output: impl Into<String>) -> Self {
        Action::Generate {
            prompt: prompt.into(),
            output: output.into(),
        }
    }

    pub fn evaluate(code: impl Into<String>, output: impl Into<String>) -> Self {
        Action::Evaluate {
            code: code.into(),
            output: output.into(),
        }
    }
}

/// Outcome of a conditional branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Branch {
    /// Stop the execution successfully with this value as the outputs
    Return {
        #[serde(default)]
        value: Value,
    },
    /// Keep going
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conditional {
    #[serde(rename = "if")]
    pub condition: String,
    pub then: Branch,
    #[serde(rename = "else", default, skip_serializing_if = "Option::is_none")]
    pub otherwise: Option<Branch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeSection {
    #[serde(default)]
    pub pre_actions: Vec<Action>,
    #[serde(default)]
    pub conditionals: Vec<Conditional>,
    pub main_action: Action,
    #[serde(default)]
    pub post_actions: Vec<Action>,
}

/// A complete hybrid skill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillSpecification {
    pub name: String,
    #[serde(default)]
    pub prompt_section: PromptSection,
    pub code_section: CodeSection,
    #[serde(default)]
    pub safety_gates: SafetyGates,
}

impl SkillSpecification {
    /// Minimal skill around a single main action
    pub fn new(name: impl Into<String>, main_action: Action) -> Self {
        Self {
            name: name.into(),
            prompt_section: PromptSection::default(),
            code_section: CodeSection {
                pre_actions: Vec::new(),
                conditionals: Vec::new(),
                main_action,
                post_actions: Vec::new(),
            },
            safety_gates: SafetyGates::default(),
        }
    }

    pub fn with_pre_action(mut self, action: Action) -> Self {
        self.code_section.pre_actions.push(action);
        self
    }

    pub fn with_conditional(mut self, conditional: Conditional) -> Self {
        self.code_section.conditionals.push(conditional);
        self
    }

    pub fn with_post_action(mut self, action: Action) -> Self {
        self.code_section.post_actions.push(action);
        self
    }

    pub fn with_safety_gates(mut self, gates: SafetyGates) -> Self {
        self.safety_gates = gates;
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self, SpecError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json_str(content: &str) -> Result<Self, SpecError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load and validate a spec file. Format follows the extension;
    /// anything else is tried as TOML, then JSON.
    pub fn load(path: &Path) -> Result<Self, SpecError> {
        let content = std::fs::read_to_string(path).map_err(|source| SpecError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let spec = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content)?,
            Some("json") => Self::from_json_str(&content)?,
            _ => Self::from_toml_str(&content)
                .or_else(|_| Self::from_json_str(&content))
                .map_err(|_| SpecError::UnknownFormat {
                    path: path.to_path_buf(),
                })?,
        };

        spec.validate()?;
        debug!("Loaded skill {} from {}", spec.name, path.display());
        Ok(spec)
    }

    /// Every action, in execution order
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        let code = &self.code_section;
        code.pre_actions
            .iter()
            .chain(std::iter::once(&code.main_action))
            .chain(code.post_actions.iter())
    }

    /// Check names, expressions and gate patterns without running anything
    pub fn validate(&self) -> Result<(), SpecError> {
        let invalid = |message: String| SpecError::Invalid {
            skill: self.name.clone(),
            message,
        };

        if self.name.is_empty() {
            return Err(invalid("name is empty".to_string()));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid(format!("bad name '{}'", self.name)));
        }

        for (i, conditional) in self.code_section.conditionals.iter().enumerate() {
            parse_expression(&conditional.condition).map_err(|source| SpecError::Expression {
                skill: self.name.clone(),
                location: format!("conditional {}", i),
                source,
            })?;
        }

        for action in self.actions() {
            if let Some(var) = action.output_var() {
                if !is_identifier(var) {
                    return Err(invalid(format!(
                        "{} action output '{}' is not an identifier",
                        action.kind(),
                        var
                    )));
                }
            }
            match action {
                Action::Shell { command, .. } if command.trim().is_empty() => {
                    return Err(invalid("shell action with empty command".to_string()));
                }
                Action::Evaluate { code, output } => {
                    parse_program(code).map_err(|source| SpecError::Expression {
                        skill: self.name.clone(),
                        location: format!("evaluate -> {}", output),
                        source,
                    })?;
                }
                _ => {}
            }
        }

        SafetyGate::new(&self.safety_gates)?;
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Skills indexed by name
#[derive(Debug, Clone, Default)]
pub struct SkillCatalog {
    specs: BTreeMap<String, SkillSpecification>,
}

impl SkillCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `.toml` / `.json` spec in `dir`. Invalid files are
    /// skipped with a warning; an unreadable directory is an error.
    pub fn load_dir(dir: &Path) -> Result<Self, SpecError> {
        let entries = std::fs::read_dir(dir).map_err(|source| SpecError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut catalog = Self::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_spec = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("toml") | Some("json")
            );
            if !is_spec || !path.is_file() {
                continue;
            }

            match SkillSpecification::load(&path) {
                Ok(spec) => {
                    if catalog.specs.contains_key(&spec.name) {
                        warn!("Duplicate skill {} in {}, keeping first", spec.name, path.display());
                        continue;
                    }
                    catalog.insert(spec);
                }
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }

        info!("Loaded {} skills from {}", catalog.len(), dir.display());
        Ok(catalog)
    }

    pub fn insert(&mut self, spec: SkillSpecification) {
        self.specs.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&SkillSpecification> {
        self.specs.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const GIT_PUSH: &str = r#"
name = "git_push"

[prompt_section]
description = "Commit and push pending changes"
examples = ["push my work"]
owner = "platform"

[[code_section.pre_actions]]
type = "shell"
command = "git diff"
capture = "diff"

[[code_section.conditionals]]
if = "len(diff) == 0"
then = { type = "return", value = { error = "no changes" } }
else = { type = "continue" }

[code_section.main_action]
type = "generate"
prompt = "Write a commit message for:\n{{diff}}"
output = "message"

[[code_section.post_actions]]
type = "shell"
command = "git commit -am {{message}}"
check = false
timeout_secs = 5

[safety_gates]
allowed_commands = ["git *"]
blocked_patterns = ["*--force*"]
max_execution_time = 20
"#;

    #[test]
    fn test_parse_toml() {
        let spec = SkillSpecification::from_toml_str(GIT_PUSH).unwrap();
        spec.validate().unwrap();

        assert_eq!(spec.name, "git_push");
        assert_eq!(spec.prompt_section.extra["owner"], json!("platform"));
        assert_eq!(spec.code_section.pre_actions, vec![Action::shell_capture("git diff", "diff")]);
        assert_eq!(
            spec.code_section.conditionals[0].then,
            Branch::Return {
                value: json!({ "error": "no changes" })
            }
        );
        assert_eq!(spec.code_section.conditionals[0].otherwise, Some(Branch::Continue));
        assert_eq!(spec.code_section.main_action.output_var(), Some("message"));
        assert_eq!(
            spec.code_section.post_actions[0],
            Action::Shell {
                command: "git commit -am {{message}}".to_string(),
                capture: None,
                timeout_secs: Some(5),
                check: false,
            }
        );
        assert_eq!(spec.safety_gates.max_execution_time, 20);
        assert_eq!(spec.actions().count(), 3);
    }

    #[test]
    fn test_parse_json() {
        let spec = SkillSpecification::from_json_str(
            r#"{
                "name": "summarize",
                "code_section": {
                    "main_action": {"type": "evaluate", "code": "len(items)", "output": "count"}
                }
            }"#,
        )
        .unwrap();

        assert_eq!(spec.code_section.main_action, Action::evaluate("len(items)", "count"));
        assert_eq!(spec.safety_gates, SafetyGates::default());
        spec.validate().unwrap();
    }

    #[test]
    fn test_unknown_action_type_rejected() {
        let err = SkillSpecification::from_json_str(
            r#"{"name": "x", "code_section": {"main_action": {"type": "python", "code": "1"}}}"#,
        );
        assert!(matches!(err, Err(SpecError::Json(_))));
    }

    #[test]
    fn test_validate_rejects_bad_expressions() {
        let spec = SkillSpecification::new("bad", Action::evaluate("open('/etc/passwd')", "out"));
        assert!(matches!(spec.validate(), Err(SpecError::Expression { .. })));

        let spec = SkillSpecification::new("bad", Action::shell("true")).with_conditional(Conditional {
            condition: "len(diff ==".to_string(),
            then: Branch::Continue,
            otherwise: None,
        });
        assert!(matches!(spec.validate(), Err(SpecError::Expression { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        assert!(SkillSpecification::new("", Action::shell("true")).validate().is_err());
        assert!(SkillSpecification::new("a b", Action::shell("true")).validate().is_err());
        assert!(SkillSpecification::new("ok", Action::shell("  ")).validate().is_err());
        assert!(SkillSpecification::new("ok", Action::generate("p", "not valid"))
            .validate()
            .is_err());
    }

    #[test]
    fn test_load_dir_skips_invalid_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("git_push.toml"), GIT_PUSH).unwrap();
        std::fs::write(
            dir.path().join("count.json"),
            r#"{"name": "count", "code_section": {"main_action": {"type": "evaluate", "code": "1 + 1", "output": "n"}}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.toml"), "name = ").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let catalog = SkillCatalog::load_dir(dir.path()).unwrap();
        assert_eq!(catalog.names(), vec!["count".to_string(), "git_push".to_string()]);
        assert!(catalog.get("git_push").is_some());
        assert!(catalog.get("broken").is_none());
    }

    #[test]
    fn test_load_dir_missing_directory() {
        let dir = TempDir::new().unwrap();
        let err = SkillCatalog::load_dir(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, SpecError::Io { .. }));
    }
}
