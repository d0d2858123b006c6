//! Hybrid Skill Executor
//!
//! Runs one [`SkillSpecification`] against a caller-supplied context:
//!
//! ```text
//! INIT → PRE_ACTIONS → CONDITIONALS → MAIN_ACTION → POST_ACTIONS → DONE
//!            │              │               │              │
//!            └──────────────┴───────────────┴──────────────┴──→ FAILED
//! ```
//!
//! Every shell command is template-substituted, with each value quoted as a
//! single shell word, then judged by the [`SafetyGate`] before anything is
//! spawned. Commands run under `sh -c`
//! with a scrubbed environment in their own process group; on timeout the
//! whole group is killed, not just the shell.
//!
//! Failures never escape as `Err`: the caller always gets an
//! [`ExecutionResult`] with the partial outputs, the failing phase and an
//! [`ErrorKind`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capability::{Confirmer, Generator};
use crate::expr::{eval_condition, parse_program, EvalLimits, Evaluator, ExprError};
use crate::gate::{GateDecision, GateError, SafetyGate, SafetyGates, DEFAULT_MAX_EXECUTION_SECS};
use crate::skill::{Action, Branch, SkillSpecification};
use crate::telemetry::Telemetry;
use crate::template::{substitute, substitute_shell, TemplateError};
use crate::Context;

/// Environment variables passed through to shell actions
pub const DEFAULT_ALLOWED_ENV_VARS: &[&str] = &["PATH", "HOME", "USER", "LANG", "LC_ALL", "TERM", "TZ"];

/// Default stdout capture cap (1 MB)
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// How long pipes may stay open once the shell has exited
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Failure taxonomy surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The skill or the engine wiring is wrong
    Configuration,
    /// A safety gate refused
    Policy,
    /// The outside world failed: timeouts, exits, generation errors
    Transient,
}

/// Execution phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    PreActions,
    Conditionals,
    MainAction,
    PostActions,
    Done,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::PreActions => "pre_actions",
            Phase::Conditionals => "conditionals",
            Phase::MainAction => "main_action",
            Phase::PostActions => "post_actions",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a single action failed
#[derive(Error, Debug)]
pub enum ActionError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("Expression error: {0}")]
    Expression(#[from] ExprError),
    #[error("Invalid safety gates: {0}")]
    Gate(#[from] GateError),
    #[error("No generation capability configured")]
    MissingGenerator,
    #[error("Command blocked ({reason}): {command}")]
    Blocked { command: String, reason: String },
    #[error("Command requires confirmation but none can be obtained: {0}")]
    ConfirmationUnavailable(String),
    #[error("Confirmation denied: {0}")]
    ConfirmationDenied(String),
    #[error("Command timed out after {}s: {command}", secs(.after))]
    Timeout { command: String, after: Duration },
    #[error("Execution deadline exceeded")]
    DeadlineExceeded,
    #[error("Command exited with status {}: {command}{}", exit_label(.code), stderr_suffix(.stderr))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Failed to run command: {0}")]
    Io(#[from] std::io::Error),
    #[error("Generation failed: {0}")]
    Generation(String),
}

fn secs(duration: &Duration) -> f64 {
    duration.as_secs_f64()
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" ({})", stderr)
    }
}

impl ActionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ActionError::Template(_)
            | ActionError::Expression(_)
            | ActionError::Gate(_)
            | ActionError::MissingGenerator => ErrorKind::Configuration,
            ActionError::Blocked { .. }
            | ActionError::ConfirmationUnavailable(_)
            | ActionError::ConfirmationDenied(_) => ErrorKind::Policy,
            ActionError::Timeout { .. }
            | ActionError::DeadlineExceeded
            | ActionError::CommandFailed { .. }
            | ActionError::Io(_)
            | ActionError::Generation(_) => ErrorKind::Transient,
        }
    }
}

/// Result of one `execute()` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub skill_name: String,
    pub success: bool,
    /// `Done` or `Failed`
    pub phase: Phase,
    /// Final context, a `return` branch value, or partial context on failure
    pub outputs: Context,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub failed_phase: Option<Phase>,
    pub execution_time: Duration,
    /// Actions that completed
    pub actions_executed: usize,
    /// Audit trail: `blocked:<cmd>`, `confirmation_required:<cmd>`, `confirmation_denied:<cmd>`
    pub gates_triggered: Vec<String>,
}

/// How shell actions are spawned
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Interpreter invoked as `<shell> -c <command>`
    pub shell: String,
    pub working_dir: Option<PathBuf>,
    pub allowed_env_vars: Vec<String>,
    pub max_output_bytes: usize,
    /// Used when an action sets no `timeout_secs`; still capped by the gate
    pub default_timeout: Duration,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            working_dir: None,
            allowed_env_vars: DEFAULT_ALLOWED_ENV_VARS.iter().map(|s| s.to_string()).collect(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            default_timeout: Duration::from_secs(DEFAULT_MAX_EXECUTION_SECS),
        }
    }
}

struct ShellOutput {
    code: Option<i32>,
    stdout: String,
    stderr: String,
    truncated: bool,
}

/// Stateless across calls; share it freely
#[derive(Clone, Default)]
pub struct HybridExecutor {
    generator: Option<Arc<dyn Generator>>,
    confirmer: Option<Arc<dyn Confirmer>>,
    telemetry: Option<Arc<Telemetry>>,
    shell: ShellConfig,
    limits: EvalLimits,
}

impl HybridExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_confirmer(mut self, confirmer: Arc<dyn Confirmer>) -> Self {
        self.confirmer = Some(confirmer);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_shell_config(mut self, shell: ShellConfig) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_eval_limits(mut self, limits: EvalLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn shell_config(&self) -> &ShellConfig {
        &self.shell
    }

    /// Run a skill. `safety_override` replaces the skill's own gates.
    pub async fn execute(
        &self,
        spec: &SkillSpecification,
        input: Context,
        safety_override: Option<&SafetyGates>,
    ) -> ExecutionResult {
        self.run(spec, input, safety_override, None).await
    }

    /// Like [`execute`](Self::execute), aborting once `deadline` has elapsed
    pub async fn execute_with_deadline(
        &self,
        spec: &SkillSpecification,
        input: Context,
        safety_override: Option<&SafetyGates>,
        deadline: Duration,
    ) -> ExecutionResult {
        self.run(spec, input, safety_override, Some(Instant::now() + deadline))
            .await
    }

    async fn run(
        &self,
        spec: &SkillSpecification,
        input: Context,
        safety_override: Option<&SafetyGates>,
        deadline: Option<Instant>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let execution_id = Uuid::new_v4();
        info!("Executing skill {} ({})", spec.name, execution_id);

        let mut execution = Execution {
            executor: self,
            gate: SafetyGate::permissive(),
            context: input,
            actions_executed: 0,
            gates_triggered: Vec::new(),
            deadline,
            phase: Phase::Init,
        };

        let outcome = match SafetyGate::new(safety_override.unwrap_or(&spec.safety_gates)) {
            Ok(gate) => {
                execution.gate = gate;
                execution.drive(spec).await
            }
            Err(e) => Err(ActionError::from(e)),
        };

        let Execution {
            context,
            actions_executed,
            gates_triggered,
            phase,
            ..
        } = execution;

        let result = match outcome {
            Ok(returned) => {
                let outputs = match returned {
                    Some(value) => wrap_return_value(value),
                    None => context,
                };
                info!(
                    "Skill {} completed: {} actions in {:?}",
                    spec.name,
                    actions_executed,
                    started.elapsed()
                );
                ExecutionResult {
                    execution_id,
                    skill_name: spec.name.clone(),
                    success: true,
                    phase: Phase::Done,
                    outputs,
                    error: None,
                    error_kind: None,
                    failed_phase: None,
                    execution_time: started.elapsed(),
                    actions_executed,
                    gates_triggered,
                }
            }
            Err(e) => {
                warn!("Skill {} failed in {}: {}", spec.name, phase, e);
                ExecutionResult {
                    execution_id,
                    skill_name: spec.name.clone(),
                    success: false,
                    phase: Phase::Failed,
                    outputs: context,
                    error: Some(format!("{}: {}", phase, e)),
                    error_kind: Some(e.kind()),
                    failed_phase: Some(phase),
                    execution_time: started.elapsed(),
                    actions_executed,
                    gates_triggered,
                }
            }
        };

        if let Some(telemetry) = &self.telemetry {
            telemetry.record_execution(result.gates_triggered.len());
        }
        result
    }

    async fn run_shell(&self, command: &str, limit: Duration) -> Result<ShellOutput, ActionError> {
        let mut cmd = Command::new(&self.shell.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .kill_on_drop(true);

        for var in &self.shell.allowed_env_vars {
            if let Ok(value) = std::env::var(var) {
                cmd.env(var, value);
            }
        }
        if let Some(dir) = &self.shell.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let cap = self.shell.max_output_bytes;
        let stdout = tokio::spawn(read_capped(child.stdout.take(), cap));
        let stderr = tokio::spawn(read_capped(child.stderr.take(), cap / 4));

        // The shell's own exit ends the action, even if a background job
        // still holds the pipes open
        let status = match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                kill_process_group(pid);
                // Reap the shell itself
                let _ = child.kill().await;
                stdout.abort();
                stderr.abort();
                return Err(ActionError::Timeout {
                    command: command.to_string(),
                    after: limit,
                });
            }
        };

        // Nothing the command started outlives it
        kill_process_group(pid);
        let status = status?;

        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            let stdout = stdout.await.unwrap_or_default();
            let stderr = stderr.await.unwrap_or_default();
            (stdout, stderr)
        })
        .await;
        let ((stdout, truncated), (stderr, _)) = drained.unwrap_or_else(|_| {
            warn!("Output of '{}' still open {:?} after exit, dropping it", command, DRAIN_GRACE);
            Default::default()
        });

        Ok(ShellOutput {
            code: status.code(),
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            truncated,
        })
    }
}

/// A `return` branch value becomes the outputs; non-objects are wrapped
fn wrap_return_value(value: Value) -> Context {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Context::new();
            map.insert("result".to_string(), other);
            map
        }
    }
}

async fn read_capped<R>(reader: Option<R>, cap: usize) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = Vec::new();
    let mut truncated = false;
    let Some(mut reader) = reader else {
        return (buf, truncated);
    };

    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                // Keep draining past the cap so the child never blocks on a full pipe
                let room = cap.saturating_sub(buf.len());
                if n > room {
                    truncated = true;
                }
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    (buf, truncated)
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            debug!("killpg({}) failed: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Per-call state. Owned by one `execute()` and dropped at its end.
struct Execution<'a> {
    executor: &'a HybridExecutor,
    gate: SafetyGate,
    context: Context,
    actions_executed: usize,
    gates_triggered: Vec<String>,
    deadline: Option<Instant>,
    phase: Phase,
}

impl Execution<'_> {
    /// `Ok(Some(value))` when a `return` branch fired
    async fn drive(&mut self, spec: &SkillSpecification) -> Result<Option<Value>, ActionError> {
        let code = &spec.code_section;

        self.phase = Phase::PreActions;
        for action in &code.pre_actions {
            self.run_action(action).await?;
        }

        self.phase = Phase::Conditionals;
        for conditional in &code.conditionals {
            let holds = eval_condition(&conditional.condition, &self.context)?;
            let branch = if holds {
                Some(&conditional.then)
            } else {
                conditional.otherwise.as_ref()
            };
            debug!("Condition '{}' -> {}", conditional.condition, holds);
            if let Some(Branch::Return { value }) = branch {
                info!("Skill {} returned early from a conditional", spec.name);
                self.phase = Phase::Done;
                return Ok(Some(value.clone()));
            }
        }

        self.phase = Phase::MainAction;
        self.run_action(&code.main_action).await?;

        self.phase = Phase::PostActions;
        for action in &code.post_actions {
            self.run_action(action).await?;
        }

        self.phase = Phase::Done;
        Ok(None)
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    fn check_deadline(&self) -> Result<(), ActionError> {
        match self.remaining() {
            Some(left) if left.is_zero() => Err(ActionError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    async fn run_action(&mut self, action: &Action) -> Result<(), ActionError> {
        self.check_deadline()?;
        debug!("Running {} action in {}", action.kind(), self.phase);

        match action {
            Action::Shell {
                command,
                capture,
                timeout_secs,
                check,
            } => {
                let command = substitute_shell(command, &self.context)?;
                self.authorize(&command).await?;

                let (limit, deadline_bound) = self.shell_timeout(*timeout_secs);
                let output = match self.executor.run_shell(&command, limit).await {
                    Err(ActionError::Timeout { .. }) if deadline_bound => {
                        warn!("Deadline reached while running: {}", command);
                        return Err(ActionError::DeadlineExceeded);
                    }
                    Err(e) => {
                        if matches!(e, ActionError::Timeout { .. }) {
                            warn!("Command timed out after {:?}: {}", limit, command);
                        }
                        return Err(e);
                    }
                    Ok(output) => output,
                };

                if output.truncated {
                    warn!(
                        "Output of '{}' truncated at {} bytes",
                        command, self.executor.shell.max_output_bytes
                    );
                }
                if *check && output.code != Some(0) {
                    return Err(ActionError::CommandFailed {
                        command,
                        code: output.code,
                        stderr: output.stderr,
                    });
                }
                if let Some(var) = capture {
                    self.context
                        .insert(var.clone(), Value::String(output.stdout.trim().to_string()));
                }
            }
            Action::Generate { prompt, output } => {
                let generator = self
                    .executor
                    .generator
                    .clone()
                    .ok_or(ActionError::MissingGenerator)?;
                let prompt = substitute(prompt, &self.context)?;

                let generated = match self.remaining() {
                    Some(left) => tokio::time::timeout(left, generator.generate(&prompt))
                        .await
                        .map_err(|_| ActionError::DeadlineExceeded)?,
                    None => generator.generate(&prompt).await,
                }
                .map_err(|e| ActionError::Generation(e.to_string()))?;

                self.context.insert(output.clone(), Value::String(generated));
            }
            Action::Evaluate { code, output } => {
                let program = parse_program(code)?;
                let value = Evaluator::new(self.executor.limits.clone()).run(&program, &self.context)?;
                self.context.insert(output.clone(), value);
            }
        }

        self.actions_executed += 1;
        Ok(())
    }

    /// Effective limit and whether the caller deadline is what bounds it
    fn shell_timeout(&self, action_secs: Option<u64>) -> (Duration, bool) {
        let requested = action_secs
            .map(Duration::from_secs)
            .unwrap_or(self.executor.shell.default_timeout);
        let limit = requested.min(self.gate.timeout());

        match self.remaining() {
            Some(left) if left < limit => (left, true),
            _ => (limit, false),
        }
    }

    async fn authorize(&mut self, command: &str) -> Result<(), ActionError> {
        match self.gate.evaluate(command) {
            GateDecision::Allow => Ok(()),
            GateDecision::Blocked { pattern } => {
                warn!("Gate blocked command (pattern '{}'): {}", pattern, command);
                self.gates_triggered.push(format!("blocked:{}", command));
                Err(ActionError::Blocked {
                    command: command.to_string(),
                    reason: format!("matches '{}'", pattern),
                })
            }
            GateDecision::NotAllowListed => {
                warn!("Gate blocked command (not allow-listed): {}", command);
                self.gates_triggered.push(format!("blocked:{}", command));
                Err(ActionError::Blocked {
                    command: command.to_string(),
                    reason: "not in allow-list".to_string(),
                })
            }
            GateDecision::RequireConfirmation => {
                let Some(confirmer) = self.executor.confirmer.clone() else {
                    warn!("No confirmer available for: {}", command);
                    self.gates_triggered
                        .push(format!("confirmation_required:{}", command));
                    return Err(ActionError::ConfirmationUnavailable(command.to_string()));
                };

                let approved = match self.remaining() {
                    Some(left) => tokio::time::timeout(left, confirmer.confirm(command))
                        .await
                        .map_err(|_| ActionError::DeadlineExceeded)?,
                    None => confirmer.confirm(command).await,
                };

                if approved {
                    debug!("Confirmed: {}", command);
                    Ok(())
                } else {
                    warn!("Confirmation denied: {}", command);
                    self.gates_triggered
                        .push(format!("confirmation_denied:{}", command));
                    Err(ActionError::ConfirmationDenied(command.to_string()))
                }
            }
        }
    }
}
