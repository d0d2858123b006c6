//! Hybrid Execution Integration Tests
//!
//! Skills authored as TOML, run end to end through the engine.

use serde_json::{json, Value};
use skillflow::{
    Context, ErrorKind, FnGenerator, HybridExecutor, InMemoryLedger, Phase, SkillCatalog, SkillEngine,
    SkillSpecification,
};
use std::sync::Arc;
use tempfile::TempDir;

const COMMIT_SKILL: &str = r#"
name = "git_commit"

[prompt_section]
description = "Summarize a diff into a commit"

[[code_section.pre_actions]]
type = "evaluate"
code = "len(diff)"
output = "diff_size"

[[code_section.conditionals]]
if = "len(diff) == 0"
then = { type = "return", value = { error = "no changes" } }

[code_section.main_action]
type = "generate"
prompt = "Describe this change in one line:\n{{diff}}"
output = "message"

[[code_section.post_actions]]
type = "evaluate"
code = "{'message': message, 'size': diff_size}"
output = "summary"
"#;

fn ctx(value: Value) -> Context {
    value.as_object().cloned().expect("context must be an object")
}

#[tokio::test]
async fn test_empty_diff_returns_early() {
    let spec = SkillSpecification::from_toml_str(COMMIT_SKILL).unwrap();
    spec.validate().unwrap();

    let result = HybridExecutor::new()
        .execute(&spec, ctx(json!({ "diff": "" })), None)
        .await;

    assert!(result.success);
    assert_eq!(Value::Object(result.outputs), json!({ "error": "no changes" }));
    assert_eq!(result.actions_executed, 1);
}

#[tokio::test]
async fn test_full_commit_flow() {
    let spec = SkillSpecification::from_toml_str(COMMIT_SKILL).unwrap();
    let executor = HybridExecutor::new().with_generator(Arc::new(FnGenerator(|prompt: &str| {
        Ok::<_, anyhow::Error>(format!("{} lines", prompt.lines().count()))
    })));

    let result = executor
        .execute(&spec, ctx(json!({ "diff": "+a\n+b" })), None)
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.actions_executed, 3);
    assert_eq!(result.outputs["message"], json!("3 lines"));
    assert_eq!(result.outputs["summary"], json!({ "message": "3 lines", "size": 5 }));
}

#[tokio::test]
async fn test_engine_learns_from_runs() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("git_commit.toml"), COMMIT_SKILL).unwrap();
    std::fs::write(
        dir.path().join("echo_input.json"),
        r#"{"name": "echo_input", "code_section": {"main_action": {"type": "evaluate", "code": "diff", "output": "echoed"}}}"#,
    )
    .unwrap();

    let catalog = SkillCatalog::load_dir(dir.path()).unwrap();
    assert_eq!(catalog.len(), 2);

    let ledger = Arc::new(InMemoryLedger::new());
    let engine = SkillEngine::new(catalog, ledger.clone());

    // No generator: git_commit fails whenever there is a diff
    let input = ctx(json!({ "diff": "+x" }));
    let first = engine
        .run(&["git_commit", "echo_input"], &ctx(json!({ "intent": "commit" })), input.clone())
        .await
        .unwrap();
    assert_eq!(first.selection.selected.skill_name, "git_commit");
    assert!(!first.result.success);
    assert_eq!(first.result.error_kind, Some(ErrorKind::Configuration));
    assert_eq!(first.fidelity, 0.0);

    // The failure is now history; the other skill wins
    let second = engine
        .run(&["git_commit", "echo_input"], &Context::new(), input)
        .await
        .unwrap();
    assert_eq!(second.selection.selected.skill_name, "echo_input");
    assert!(second.result.success);
    assert_eq!(second.result.outputs["echoed"], json!("+x"));
    assert_eq!(ledger.len(), 2);
}

#[cfg(unix)]
#[tokio::test]
async fn test_blocked_post_action_is_audited() {
    let spec = SkillSpecification::from_toml_str(
        r#"
name = "cleanup"

[code_section.main_action]
type = "shell"
command = "echo {{target}}"
capture = "listed"

[[code_section.post_actions]]
type = "shell"
command = "rm -rf {{target}}"

[safety_gates]
blocked_patterns = ["rm -rf *"]
max_execution_time = 5
"#,
    )
    .unwrap();

    let result = HybridExecutor::new()
        .execute(&spec, ctx(json!({ "target": "build" })), None)
        .await;

    assert!(!result.success);
    assert_eq!(result.gates_triggered, vec!["blocked:rm -rf build".to_string()]);
    assert_eq!(result.error_kind, Some(ErrorKind::Policy));
    assert_eq!(result.failed_phase, Some(Phase::PostActions));
    assert_eq!(result.outputs["listed"], json!("build"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_safety_override_replaces_skill_gates() {
    let spec = SkillSpecification::from_toml_str(
        r#"
name = "greet"

[code_section.main_action]
type = "shell"
command = "echo hi"
capture = "out"
"#,
    )
    .unwrap();

    let strict = skillflow::SafetyGates {
        allowed_commands: vec!["git *".to_string()],
        ..Default::default()
    };

    let executor = HybridExecutor::new();
    let permitted = executor.execute(&spec, Context::new(), None).await;
    assert_eq!(permitted.outputs["out"], json!("hi"));

    let refused = executor.execute(&spec, Context::new(), Some(&strict)).await;
    assert!(!refused.success);
    assert_eq!(refused.gates_triggered, vec!["blocked:echo hi".to_string()]);
}

#[cfg(unix)]
#[tokio::test]
async fn test_substituted_values_cannot_chain_commands() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("marker");
    let spec = SkillSpecification::from_toml_str(
        r#"
name = "announce"

[code_section.main_action]
type = "shell"
command = "echo {{msg}}"
capture = "said"

[safety_gates]
allowed_commands = ["echo *"]
blocked_patterns = ["touch *"]
"#,
    )
    .unwrap();

    let msg = format!("hi; touch {}", marker.display());
    let result = HybridExecutor::new()
        .execute(&spec, ctx(json!({ "msg": msg })), None)
        .await;

    assert!(result.success, "{:?}", result.error);
    assert!(result.gates_triggered.is_empty());
    assert_eq!(result.outputs["said"], json!(msg));
    assert!(!marker.exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_quotes_in_generated_text_stay_literal() {
    let spec = SkillSpecification::from_toml_str(
        r#"
name = "echo_message"

[code_section.main_action]
type = "generate"
prompt = "say something"
output = "message"

[[code_section.post_actions]]
type = "shell"
command = "printf '%s' {{message}}"
capture = "printed"
"#,
    )
    .unwrap();

    let executor = HybridExecutor::new().with_generator(Arc::new(FnGenerator(|_: &str| {
        Ok::<_, anyhow::Error>("it's $HOME `id`".to_string())
    })));
    let result = executor.execute(&spec, Context::new(), None).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.outputs["printed"], json!("it's $HOME `id`"));
}
