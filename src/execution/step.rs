//! Step Executor
//!
//! Runs one job instance's steps strictly sequentially on the instance's
//! worker thread:
//! - Conditional evaluation against the instance's status aggregate
//! - Command interpolation, script generation, and output capture
//! - Output/env writeback files (step outputs and sticky bindings)
//! - Composite action expansion with a nested input scope
//! - Built-in cache restore, with saves deferred to instance completion
//!
//! Cancellation is checked between steps; a running command is never
//! interrupted mid-step.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use once_cell::sync::Lazy;

use crate::context::{EvalContext, NeedsSnapshot, ScopeStack, SecretStore, StepOutputs};
use crate::error::EngineError;
use crate::expr::{self, StatusFlags};
use crate::workflow::action::{ActionRegistry, CACHE_ACTION};
use crate::workflow::graph::InstanceStatus;
use crate::workflow::matrix::Combination;
use crate::workflow::model::{scalar_to_string, EventContext, Job, Step};

use super::cache::CacheResolver;
use super::report::StepReport;

/// Shell used for run steps. Override with `CONVEYOR_SHELL`.
static SHELL_PATH: Lazy<String> =
    Lazy::new(|| std::env::var("CONVEYOR_SHELL").unwrap_or_else(|_| "bash".to_string()));

/// Scratch directory for generated step scripts and writeback files.
static SCRATCH_DIR: Lazy<PathBuf> = Lazy::new(|| std::env::temp_dir().join("conveyor_scratch"));

/// Process-wide sequence for unique scratch file names.
static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Writeback file for step outputs (`name=value` lines).
const OUTPUT_FILE_VAR: &str = "CONVEYOR_OUTPUT";

/// Writeback file for sticky env bindings (`name=value` lines).
const ENV_FILE_VAR: &str = "CONVEYOR_ENV";

/// Composite actions may reference actions; a cycle shows up as depth.
const MAX_ACTION_DEPTH: usize = 8;

/// Everything a worker thread needs to execute one job instance.
pub struct InstanceWork {
    /// Index of the instance in the execution graph
    pub index: usize,
    /// Instance label
    pub instance_id: String,
    /// The declaring job
    pub job: Job,
    /// Resolved matrix combination
    pub matrix: Combination,
    /// Workflow-level env bindings (uninterpolated)
    pub workflow_env: HashMap<String, String>,
    /// Snapshot of needed jobs' results and outputs, taken at dispatch
    pub needs: NeedsSnapshot,
    /// The triggering event
    pub event: EventContext,
    /// Composite actions available to `uses:` steps
    pub actions: Arc<ActionRegistry>,
    /// Run-scoped secrets
    pub secrets: Arc<SecretStore>,
    /// Shared cache resolver
    pub cache: Arc<Mutex<CacheResolver>>,
    /// Set by the scheduler to cancel between steps
    pub cancel: Arc<AtomicBool>,
    /// Log commands instead of executing them
    pub dry_run: bool,
    /// Working directory for run steps and cache paths
    pub working_dir: Option<PathBuf>,
}

/// A cache save captured at instance completion.
#[derive(Debug, Clone)]
pub struct CacheSave {
    /// Primary cache key
    pub key: String,
    /// Path the content came from
    pub path: String,
    /// Content read when the instance completed
    pub content: String,
}

/// What a worker reports back to the scheduler.
pub struct InstanceOutcome {
    /// Terminal status: succeeded, failed, or cancelled
    pub status: InstanceStatus,
    /// Per-step records, in execution order
    pub steps: Vec<StepReport>,
    /// Evaluated job outputs (empty unless the instance succeeded)
    pub outputs: HashMap<String, String>,
    /// Cache saves to commit (empty unless the instance succeeded)
    pub cache_saves: Vec<CacheSave>,
    /// First failure message, when the instance failed
    pub error: Option<String>,
}

/// A pending cache save: key and workspace path, content read at the end.
struct PendingSave {
    key: String,
    path: String,
}

/// One step-output namespace: the job's own, or a composite action's.
struct Frame {
    outputs: StepOutputs,
    inputs: Option<HashMap<String, String>>,
    label_prefix: String,
    depth: usize,
}

impl Frame {
    fn root() -> Self {
        Self {
            outputs: StepOutputs::new(),
            inputs: None,
            label_prefix: String::new(),
            depth: 0,
        }
    }
}

/// Executes one job instance to completion. Never panics on step
/// failure; every failure lands in the outcome.
pub fn run_instance(work: InstanceWork) -> InstanceOutcome {
    info!(
        "Instance '{}' starting ({} steps)",
        work.instance_id,
        work.job.steps.len()
    );

    let mut run = InstanceRun {
        work: &work,
        scopes: ScopeStack::new(),
        reports: Vec::new(),
        pending_saves: Vec::new(),
        failed: false,
        error: None,
    };

    let mut root = Frame::root();

    if let Err(e) = run.prepare_scopes() {
        error!("Instance '{}' env setup failed: {}", work.instance_id, e);
        return InstanceOutcome {
            status: InstanceStatus::Failed,
            steps: run.reports,
            outputs: HashMap::new(),
            cache_saves: Vec::new(),
            error: Some(e.to_string()),
        };
    }

    let work_ref = run.work;
    run.execute_steps(&work_ref.job.steps, &mut root);
    run.finish(root)
}

struct InstanceRun<'a> {
    work: &'a InstanceWork,
    scopes: ScopeStack,
    reports: Vec<StepReport>,
    pending_saves: Vec<PendingSave>,
    failed: bool,
    error: Option<String>,
}

impl<'a> InstanceRun<'a> {
    /// Interpolates workflow and job env layers and builds the instance
    /// scope stack (workflow, job, sticky).
    fn prepare_scopes(&mut self) -> Result<(), EngineError> {
        let work = self.work;

        let mut workflow_env = HashMap::new();
        {
            let ctx = EvalContext::new()
                .with_matrix(&work.matrix)
                .with_needs(&work.needs)
                .with_event(&work.event);
            for (name, raw) in &work.workflow_env {
                workflow_env.insert(name.clone(), expr::interpolate(raw, &ctx)?);
            }
        }

        // Job env may reference the workflow layer.
        let mut job_env = HashMap::new();
        {
            let mut probe = ScopeStack::new();
            probe.push("workflow", workflow_env.clone());
            let ctx = EvalContext::new()
                .with_scopes(&probe)
                .with_matrix(&work.matrix)
                .with_needs(&work.needs)
                .with_event(&work.event);
            for (name, raw) in &work.job.env {
                job_env.insert(name.clone(), expr::interpolate(raw, &ctx)?);
            }
        }

        self.scopes = ScopeStack::for_instance(workflow_env, job_env);
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.work.cancel.load(Ordering::Relaxed)
    }

    fn status_flags(&self) -> StatusFlags {
        let cancelled = self.is_cancelled();
        StatusFlags {
            success: !self.failed && !cancelled,
            failure: self.failed,
            cancelled,
        }
    }

    fn context<'b>(
        &'b self,
        frame: &'b Frame,
        flags: StatusFlags,
        with_secrets: bool,
    ) -> EvalContext<'b> {
        let work = self.work;
        let mut ctx = EvalContext::new()
            .with_scopes(&self.scopes)
            .with_matrix(&work.matrix)
            .with_steps(&frame.outputs)
            .with_needs(&work.needs)
            .with_event(&work.event)
            .with_status(flags);
        if let Some(inputs) = &frame.inputs {
            ctx = ctx.with_inputs(inputs);
        }
        if with_secrets {
            ctx = ctx.with_secrets(&work.secrets);
        }
        ctx
    }

    fn mask(&self, text: &str) -> String {
        self.work.secrets.mask(text)
    }

    /// Marks a step (and the instance) failed.
    fn fail_step(&mut self, frame: &mut Frame, step: &Step, name: &str, message: String) {
        let masked = self.mask(&message);
        error!("Step '{}' failed: {}", name, masked);
        self.failed = true;
        if self.error.is_none() {
            self.error = Some(format!("{}: {}", name, masked));
        }
        self.reports.push(StepReport::failure(name, None, masked));
        if let Some(id) = &step.id {
            frame.outputs.set_result(id, "failure");
        }
    }

    /// Runs a step sequence within one output frame.
    fn execute_steps(&mut self, steps: &[Step], frame: &mut Frame) {
        for step in steps {
            let name = format!("{}{}", frame.label_prefix, step.display_name());
            let flags = self.status_flags();

            let condition = step.if_expr.as_deref().unwrap_or("success()");
            let verdict = {
                let ctx = self.context(frame, flags, false);
                expr::evaluate_condition(condition, &ctx)
            };

            match verdict {
                Err(e) => {
                    self.fail_step(frame, step, &name, e.to_string());
                    continue;
                }
                Ok(false) => {
                    debug!("Step '{}' skipped (condition false)", name);
                    self.reports.push(StepReport::skipped(&name));
                    if let Some(id) = &step.id {
                        frame.outputs.set_result(id, "skipped");
                    }
                    continue;
                }
                Ok(true) => {}
            }

            match step.uses.as_deref() {
                Some(CACHE_ACTION) => self.run_cache_step(step, frame, &name),
                Some(_) => self.run_action_step(step, frame, &name),
                None => self.run_command_step(step, frame, &name),
            }
        }
    }

    /// Executes a run step: interpolate, generate a script, execute,
    /// capture output, and apply the writeback files.
    fn run_command_step(&mut self, step: &Step, frame: &mut Frame, name: &str) {
        let flags = self.status_flags();
        let raw = step.run.as_deref().unwrap_or("");

        let command = {
            let ctx = self.context(frame, flags, false);
            match expr::interpolate(raw, &ctx) {
                Ok(c) => c,
                Err(e) => return self.fail_step(frame, step, name, e.to_string()),
            }
        };

        if self.work.dry_run {
            info!("[dry run] {}: {}", name, command);
            self.reports.push(StepReport::success(name, ""));
            if let Some(id) = &step.id {
                frame.outputs.set_result(id, "success");
            }
            return;
        }

        // Step env is the only position where secrets.* resolves.
        let mut step_env = HashMap::new();
        {
            let ctx = self.context(frame, flags, true);
            for (key, raw_value) in &step.env {
                match expr::interpolate(raw_value, &ctx) {
                    Ok(v) => {
                        step_env.insert(key.clone(), v);
                    }
                    Err(e) => return self.fail_step(frame, step, name, e.to_string()),
                }
            }
        }

        self.scopes.push("step", step_env);
        let executed = self.spawn_command(&command, name);
        self.scopes.pop();

        let run = match executed {
            Ok(run) => run,
            Err(e) => return self.fail_step(frame, step, name, e.to_string()),
        };

        // Writebacks apply regardless of exit status: lines appended
        // before a failure are honored.
        if let Some(id) = &step.id {
            for (output_name, value) in &run.step_outputs {
                frame.outputs.set_output(id, output_name, value);
            }
        } else if !run.step_outputs.is_empty() {
            warn!(
                "Step '{}' wrote outputs but has no id; they are unreachable",
                name
            );
        }
        for (env_name, value) in run.env_writes {
            self.scopes.bind_sticky(env_name, value);
        }

        let log = self.mask(&run.log);
        if run.success {
            debug!("Step '{}' completed successfully", name);
            self.reports.push(StepReport::success(name, log));
            if let Some(id) = &step.id {
                frame.outputs.set_result(id, "success");
            }
        } else {
            let code = run.exit_code;
            error!("Step '{}' failed with exit code {:?}", name, code);
            self.failed = true;
            if self.error.is_none() {
                self.error = Some(
                    EngineError::StepExecution {
                        step: name.to_string(),
                        code,
                    }
                    .to_string(),
                );
            }
            self.reports.push(StepReport::failure(name, code, log));
            if let Some(id) = &step.id {
                frame.outputs.set_result(id, "failure");
            }
        }
    }

    /// Expands a composite action inline under a nested input scope.
    fn run_action_step(&mut self, step: &Step, frame: &mut Frame, name: &str) {
        let work = self.work;
        let action_name = step.uses.as_deref().unwrap_or("");

        if frame.depth >= MAX_ACTION_DEPTH {
            return self.fail_step(
                frame,
                step,
                name,
                format!("action nesting deeper than {}", MAX_ACTION_DEPTH),
            );
        }

        let Some(action) = work.actions.get(action_name) else {
            return self.fail_step(
                frame,
                step,
                name,
                EngineError::UnknownAction(action_name.to_string()).to_string(),
            );
        };

        // Bind declared inputs before any nested step runs.
        let flags = self.status_flags();
        let mut inputs: HashMap<String, String> = HashMap::new();
        for (input_name, decl) in &action.inputs {
            if let Some(raw) = step.with.get(input_name) {
                let text = scalar_to_string(raw);
                let value = {
                    let ctx = self.context(frame, flags, false);
                    match expr::interpolate(&text, &ctx) {
                        Ok(v) => v,
                        Err(e) => return self.fail_step(frame, step, name, e.to_string()),
                    }
                };
                inputs.insert(input_name.clone(), value);
            } else if let Some(default) = &decl.default {
                inputs.insert(input_name.clone(), default.clone());
            } else if decl.required {
                return self.fail_step(
                    frame,
                    step,
                    name,
                    EngineError::MissingInput {
                        action: action_name.to_string(),
                        input: input_name.clone(),
                    }
                    .to_string(),
                );
            }
        }

        // Undeclared bindings pass through with a warning.
        for (key, raw) in &step.with {
            if action.inputs.contains_key(key) {
                continue;
            }
            warn!(
                "Action '{}' does not declare input '{}'",
                action_name, key
            );
            let text = scalar_to_string(raw);
            let value = {
                let ctx = self.context(frame, flags, false);
                match expr::interpolate(&text, &ctx) {
                    Ok(v) => v,
                    Err(e) => return self.fail_step(frame, step, name, e.to_string()),
                }
            };
            inputs.insert(key.clone(), value);
        }

        debug!(
            "Expanding action '{}' ({} steps, {} inputs)",
            action_name,
            action.steps.len(),
            inputs.len()
        );

        let mut nested = Frame {
            outputs: StepOutputs::new(),
            inputs: Some(inputs),
            label_prefix: format!("{} / ", action_name),
            depth: frame.depth + 1,
        };

        let failed_before = self.failed;
        self.execute_steps(&action.steps, &mut nested);
        let nested_failed = self.failed && !failed_before;

        // The action's declared outputs become the calling step's.
        if !nested_failed {
            let flags = self.status_flags();
            for (output_name, expr_text) in &action.outputs {
                let value = {
                    let ctx = self.context(&nested, flags, false);
                    match expr::evaluate(expr_text, &ctx) {
                        Ok(v) => v.render(),
                        Err(e) => return self.fail_step(frame, step, name, e.to_string()),
                    }
                };
                if let Some(id) = &step.id {
                    frame.outputs.set_output(id, output_name, value);
                }
            }
        }

        if nested_failed {
            self.reports
                .push(StepReport::failure(name, None, String::new()));
            if let Some(id) = &step.id {
                frame.outputs.set_result(id, "failure");
            }
        } else {
            self.reports.push(StepReport::success(name, ""));
            if let Some(id) = &step.id {
                frame.outputs.set_result(id, "success");
            }
        }
    }

    /// The built-in cache step: restore now, queue the save for
    /// instance completion.
    fn run_cache_step(&mut self, step: &Step, frame: &mut Frame, name: &str) {
        let flags = self.status_flags();

        let Some(key) = self.cache_input(step, frame, flags, "key") else {
            return self.fail_step(
                frame,
                step,
                name,
                EngineError::MissingInput {
                    action: CACHE_ACTION.to_string(),
                    input: "key".to_string(),
                }
                .to_string(),
            );
        };
        let Some(path) = self.cache_input(step, frame, flags, "path") else {
            return self.fail_step(
                frame,
                step,
                name,
                EngineError::MissingInput {
                    action: CACHE_ACTION.to_string(),
                    input: "path".to_string(),
                }
                .to_string(),
            );
        };
        let restore_keys = self.cache_restore_keys(step, frame, flags);

        if self.work.dry_run {
            info!("[dry run] {}: cache key '{}'", name, key);
            self.reports.push(StepReport::success(name, ""));
            if let Some(id) = &step.id {
                frame.outputs.set_result(id, "success");
            }
            return;
        }

        let hit = {
            let mut cache = self
                .work
                .cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            cache.lookup(&key, &restore_keys)
        };

        let mut exact = false;
        if let Some(hit) = hit {
            exact = hit.exact;
            let target = self.workspace_path(&path);
            if let Some(parent) = target.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    return self.fail_step(frame, step, name, e.to_string());
                }
            }
            if let Err(e) = fs::write(&target, &hit.entry.content) {
                return self.fail_step(frame, step, name, e.to_string());
            }
            info!(
                "Cache restored '{}' -> {} (exact: {})",
                hit.entry.key, path, exact
            );
        }

        // The save happens when the instance completes; an exact hit
        // makes it redundant.
        if !exact {
            self.pending_saves.push(PendingSave {
                key: key.clone(),
                path: path.clone(),
            });
        }

        if let Some(id) = &step.id {
            frame
                .outputs
                .set_output(id, "cache-hit", if exact { "true" } else { "false" });
            frame.outputs.set_result(id, "success");
        }
        self.reports.push(StepReport::success(name, ""));
    }

    /// Interpolates one cache input from the step's `with` block.
    fn cache_input(
        &self,
        step: &Step,
        frame: &Frame,
        flags: StatusFlags,
        input: &str,
    ) -> Option<String> {
        let raw = step.with.get(input)?;
        let text = scalar_to_string(raw);
        let ctx = self.context(frame, flags, false);
        expr::interpolate(&text, &ctx).ok().filter(|v| !v.is_empty())
    }

    /// Restore keys: a list, or a multiline string scanned line by line.
    fn cache_restore_keys(&self, step: &Step, frame: &Frame, flags: StatusFlags) -> Vec<String> {
        let Some(raw) = step.with.get("restore-keys") else {
            return Vec::new();
        };

        let texts: Vec<String> = match raw {
            serde_json::Value::Array(items) => items.iter().map(scalar_to_string).collect(),
            other => scalar_to_string(other)
                .lines()
                .map(str::to_string)
                .collect(),
        };

        let ctx = self.context(frame, flags, false);
        texts
            .iter()
            .filter_map(|t| expr::interpolate(t, &ctx).ok())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Resolves a workspace-relative path against the working directory.
    fn workspace_path(&self, path: &str) -> PathBuf {
        match &self.work.working_dir {
            Some(dir) => dir.join(path),
            None => PathBuf::from(path),
        }
    }

    /// Generates the step script, runs it, and parses the writebacks.
    fn spawn_command(&self, command: &str, name: &str) -> Result<CommandRun, EngineError> {
        fs::create_dir_all(&*SCRATCH_DIR)?;

        let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
        let tag = format!("{}_{}", std::process::id(), seq);

        let script_path = SCRATCH_DIR.join(format!("step_{}.sh", tag));
        let output_path = SCRATCH_DIR.join(format!("out_{}", tag));
        let env_path = SCRATCH_DIR.join(format!("env_{}", tag));

        let mut script = File::create(&script_path)?;
        writeln!(script, "#!/bin/bash")?;
        writeln!(script, "set -e")?;
        writeln!(script, "{}", command)?;
        drop(script);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
        }

        fs::write(&output_path, "")?;
        fs::write(&env_path, "")?;

        let mut cmd = Command::new(&*SHELL_PATH);
        cmd.arg(&script_path)
            .envs(self.scopes.flatten())
            .env(OUTPUT_FILE_VAR, &output_path)
            .env(ENV_FILE_VAR, &env_path);

        if let Some(dir) = &self.work.working_dir {
            cmd.current_dir(dir);
            debug!("Step '{}' executing in {}", name, dir.display());
        }

        let output = cmd.output()?;

        let step_outputs = parse_kv_lines(&fs::read_to_string(&output_path).unwrap_or_default());
        let env_writes = parse_kv_lines(&fs::read_to_string(&env_path).unwrap_or_default());

        for scratch in [&script_path, &output_path, &env_path] {
            if let Err(e) = fs::remove_file(scratch) {
                warn!("Failed to clean up {}: {}", scratch.display(), e);
            }
        }

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !log.is_empty() {
                log.push('\n');
            }
            log.push_str(&stderr);
        }

        Ok(CommandRun {
            success: output.status.success(),
            exit_code: output.status.code(),
            log: log.trim_end().to_string(),
            step_outputs,
            env_writes,
        })
    }

    /// Finalizes the instance: status, job outputs, cache saves.
    fn finish(mut self, root: Frame) -> InstanceOutcome {
        let work = self.work;

        let mut status = if self.failed {
            InstanceStatus::Failed
        } else if self.is_cancelled() {
            InstanceStatus::Cancelled
        } else {
            InstanceStatus::Succeeded
        };

        // Declared job outputs are evaluated once, at completion time.
        let mut outputs = HashMap::new();
        if status == InstanceStatus::Succeeded {
            let flags = self.status_flags();
            for (output_name, expr_text) in &work.job.outputs {
                let evaluated = {
                    let ctx = self.context(&root, flags, false);
                    expr::evaluate(expr_text, &ctx)
                };
                match evaluated {
                    Ok(value) => {
                        outputs.insert(output_name.clone(), value.render());
                    }
                    Err(e) => {
                        error!(
                            "Instance '{}' output '{}' failed: {}",
                            work.instance_id, output_name, e
                        );
                        status = InstanceStatus::Failed;
                        self.error = Some(e.to_string());
                        outputs.clear();
                        break;
                    }
                }
            }
        }

        // Cache saves read the workspace state as the job completes.
        let mut cache_saves = Vec::new();
        if status == InstanceStatus::Succeeded {
            for pending in &self.pending_saves {
                let source = self.workspace_path(&pending.path);
                match fs::read_to_string(&source) {
                    Ok(content) => cache_saves.push(CacheSave {
                        key: pending.key.clone(),
                        path: pending.path.clone(),
                        content,
                    }),
                    Err(e) => {
                        warn!(
                            "Cache save '{}' skipped, cannot read {}: {}",
                            pending.key,
                            source.display(),
                            e
                        );
                    }
                }
            }
        }

        info!("Instance '{}' finished: {}", work.instance_id, status);
        InstanceOutcome {
            status,
            steps: self.reports,
            outputs,
            cache_saves,
            error: self.error,
        }
    }
}

/// Result of one spawned command.
struct CommandRun {
    success: bool,
    exit_code: Option<i32>,
    log: String,
    step_outputs: Vec<(String, String)>,
    env_writes: Vec<(String, String)>,
}

/// Parses `name=value` writeback lines. Blank lines are ignored; lines
/// without `=` are reported and dropped.
fn parse_kv_lines(text: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                pairs.push((name.trim().to_string(), value.to_string()));
            }
            _ => warn!("Ignoring malformed writeback line: '{}'", line),
        }
    }
    pairs
}
