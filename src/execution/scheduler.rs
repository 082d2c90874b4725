//! Job Scheduler
//!
//! The engine's dispatch loop. Walks the execution graph, hands ready
//! instances to worker threads, and enforces the ordering contract:
//! - `needs` predecessors must be terminal before an instance runs
//! - The job conditional (default: all needs succeeded) gates dispatch
//! - Environment gates suspend instances until approved
//! - Fail-fast cancels matrix siblings of a failed instance
//!
//! One mpsc channel carries both worker completions and external
//! approval signals; the loop blocks on it whenever nothing is ready.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};

use crate::context::{EvalContext, NeedsSnapshot, OutputRegistry, SecretStore};
use crate::error::EngineError;
use crate::expr::{self, StatusFlags};
use crate::monitoring::{EventKind, ExecutionTimeline, ResourceMonitor};
use crate::workflow::action::ActionRegistry;
use crate::workflow::graph::{ExecutionGraph, InstanceStatus};
use crate::workflow::model::{EventContext, Job, WorkflowDefinition};
use crate::workflow::validator::validate_definition;

use super::cache::CacheResolver;
use super::gate::{ApprovalSignal, GateRegistry, GateState};
use super::report::{InstanceReport, RunReport};
use super::step::{run_instance, InstanceOutcome, InstanceWork};

/// Interval for resource monitoring samples.
const MONITOR_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Events multiplexed onto the scheduler's channel.
pub enum EngineEvent {
    /// A worker finished an instance
    InstanceDone {
        index: usize,
        outcome: InstanceOutcome,
    },
    /// An external reviewer decision arrived
    Approval(ApprovalSignal),
}

/// Handle for delivering approval signals into a running engine.
/// Clone freely; senders outlive the run harmlessly.
#[derive(Clone)]
pub struct ApprovalSender {
    tx: Sender<EngineEvent>,
}

impl ApprovalSender {
    /// Delivers one reviewer decision.
    pub fn send(&self, signal: ApprovalSignal) -> Result<(), EngineError> {
        self.tx
            .send(EngineEvent::Approval(signal))
            .map_err(|_| EngineError::ChannelClosed)
    }
}

/// Workflow execution engine.
///
/// Owns one run: graph expansion, dispatch, gate handling, output
/// publication, and the final report.
///
/// # Example
///
/// ```rust,no_run
/// use conveyor::execution::Engine;
/// use conveyor::workflow::{load_workflow, EventContext};
///
/// fn main() -> Result<(), conveyor::EngineError> {
///     let def = load_workflow("pipeline.yaml")?;
///     let mut engine = Engine::new(def, EventContext::new("push"));
///     engine.set_max_parallel(4);
///
///     let report = engine.run()?;
///     println!("run ok: {}", report.success());
///     Ok(())
/// }
/// ```
pub struct Engine {
    def: Arc<WorkflowDefinition>,
    event: EventContext,
    actions: Arc<ActionRegistry>,
    secrets: Arc<SecretStore>,
    cache: Arc<Mutex<CacheResolver>>,
    max_parallel: usize,
    dry_run: bool,
    working_dir: Option<PathBuf>,
    gate_timeout: Option<Duration>,
    tx: Sender<EngineEvent>,
    rx: Receiver<EngineEvent>,
}

impl Engine {
    /// Creates an engine for one definition and triggering event.
    pub fn new(def: WorkflowDefinition, event: EventContext) -> Self {
        let (tx, rx) = channel();
        Self {
            def: Arc::new(def),
            event,
            actions: Arc::new(ActionRegistry::new()),
            secrets: Arc::new(SecretStore::new()),
            cache: Arc::new(Mutex::new(CacheResolver::in_memory())),
            max_parallel: num_cpus::get(),
            dry_run: false,
            working_dir: None,
            gate_timeout: None,
            tx,
            rx,
        }
    }

    /// Sets the engine-wide cap on concurrently running instances.
    pub fn set_max_parallel(&mut self, max: usize) {
        self.max_parallel = max.max(1);
    }

    /// Enables or disables dry run mode.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    /// Sets the working directory for run steps and cache paths.
    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) {
        self.working_dir = Some(dir.into());
    }

    /// Installs the composite actions available to `uses:` steps.
    pub fn set_actions(&mut self, actions: ActionRegistry) {
        self.actions = Arc::new(actions);
    }

    /// Installs the run's secrets.
    pub fn set_secrets(&mut self, secrets: SecretStore) {
        self.secrets = Arc::new(secrets);
    }

    /// Installs a cache resolver (e.g. over a persistent backend).
    pub fn set_cache(&mut self, cache: CacheResolver) {
        self.cache = Arc::new(Mutex::new(cache));
    }

    /// Bounds how long the run waits on gate approvals when nothing is
    /// running. No timeout is the default: gates block indefinitely.
    pub fn set_gate_timeout(&mut self, timeout: Duration) {
        self.gate_timeout = Some(timeout);
    }

    /// A handle external reviewers use to deliver gate decisions.
    pub fn approval_sender(&self) -> ApprovalSender {
        ApprovalSender {
            tx: self.tx.clone(),
        }
    }

    /// Executes the run to completion.
    ///
    /// This is the main entry point that:
    /// 1. Checks the trigger predicate against the event
    /// 2. Validates the definition and expands the execution graph
    /// 3. Dispatches ready instances to worker threads
    /// 4. Applies gate decisions, fail-fast, and output publication
    /// 5. Assembles the final run report
    pub fn run(&mut self) -> Result<RunReport, EngineError> {
        let started_at = Utc::now();

        if !self.def.matches_event(&self.event) {
            info!(
                "Workflow '{}' not triggered by {} on {}",
                self.def.name, self.event.event, self.event.ref_name
            );
            return Ok(RunReport {
                workflow: self.def.name.clone(),
                event: self.event.clone(),
                triggered: false,
                started_at,
                finished_at: Utc::now(),
                instances: Vec::new(),
                outputs: Default::default(),
            });
        }

        validate_definition(&self.def)?;
        let mut graph = ExecutionGraph::build(&self.def)?;
        let mut gates = GateRegistry::from_definition(&self.def);
        let mut registry = OutputRegistry::new();
        let mut timeline = ExecutionTimeline::new();

        let cancel_flags: Vec<Arc<AtomicBool>> = (0..graph.len())
            .map(|_| Arc::new(AtomicBool::new(false)))
            .collect();
        let mut outcomes: Vec<Option<InstanceOutcome>> = Vec::new();
        outcomes.resize_with(graph.len(), || None);

        info!(
            "Starting run of '{}': {} instances (max parallel: {}, dry run: {})",
            self.def.name,
            graph.len(),
            self.max_parallel,
            self.dry_run
        );

        // Resource monitoring runs beside the dispatch loop.
        let monitor_running = Arc::new(AtomicBool::new(true));
        let monitor_flag = Arc::clone(&monitor_running);
        let monitor_handle = thread::spawn(move || {
            let mut monitor = ResourceMonitor::new();
            while monitor_flag.load(Ordering::Relaxed) {
                monitor.sample();
                thread::sleep(MONITOR_SAMPLE_INTERVAL);
            }
            monitor
        });

        let mut running = 0usize;
        let mut run_error: Option<EngineError> = None;

        loop {
            self.dispatch_ready(
                &mut graph,
                &mut gates,
                &registry,
                &mut timeline,
                &cancel_flags,
                &mut running,
            );

            if running == 0 && graph.all_terminal() {
                break;
            }

            let blocked_only = running == 0;
            let event = match (blocked_only, self.gate_timeout) {
                (true, Some(timeout)) => match self.rx.recv_timeout(timeout) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => {
                        warn!("Gate approval timed out; cancelling blocked instances");
                        for idx in 0..graph.len() {
                            if graph.instance(idx).status == InstanceStatus::Blocked {
                                graph.set_status(idx, InstanceStatus::Cancelled);
                                timeline.record(
                                    graph.instance(idx).id.clone(),
                                    EventKind::Finished(InstanceStatus::Cancelled.as_str()),
                                );
                            }
                        }
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        run_error = Some(EngineError::ChannelClosed);
                        break;
                    }
                },
                _ => match self.rx.recv() {
                    Ok(event) => event,
                    Err(_) => {
                        run_error = Some(EngineError::ChannelClosed);
                        break;
                    }
                },
            };

            match event {
                EngineEvent::InstanceDone { index, outcome } => {
                    running -= 1;
                    if let Err(e) = self.finish_instance(
                        &mut graph,
                        &mut registry,
                        &mut timeline,
                        &cancel_flags,
                        index,
                        outcome,
                        &mut outcomes,
                    ) {
                        run_error = Some(e);
                        break;
                    }
                }
                EngineEvent::Approval(signal) => {
                    debug!(
                        "Approval signal: gate '{}' {:?} by '{}'",
                        signal.gate, signal.decision, signal.reviewer
                    );
                    gates.record(&signal);
                }
            }
        }

        monitor_running.store(false, Ordering::Relaxed);
        if let Ok(monitor) = monitor_handle.join() {
            info!("{}", monitor.summary());
        }
        info!("Instance timing:\n{}", timeline.summary());

        if let Some(e) = run_error {
            return Err(e);
        }

        let report = self.build_report(started_at, &graph, outcomes, &registry);
        info!(
            "Run of '{}' finished: {}",
            self.def.name,
            if report.success() { "success" } else { "failure" }
        );
        Ok(report)
    }

    /// One dispatch pass. Loops until no instance changes state, so a
    /// skip that unblocks downstream instances cascades immediately.
    fn dispatch_ready(
        &self,
        graph: &mut ExecutionGraph,
        gates: &mut GateRegistry,
        registry: &OutputRegistry,
        timeline: &mut ExecutionTimeline,
        cancel_flags: &[Arc<AtomicBool>],
        running: &mut usize,
    ) {
        let mut progressed = true;
        while progressed {
            progressed = false;

            for idx in 0..graph.len() {
                match graph.instance(idx).status {
                    InstanceStatus::Pending | InstanceStatus::Blocked => {}
                    _ => continue,
                }
                if !graph.deps_terminal(idx) {
                    continue;
                }

                let job_id = graph.instance(idx).job_id.clone();
                let job = self
                    .def
                    .get_job(&job_id)
                    .expect("graph instance references a defined job");

                let flags = needs_flags(graph, job);
                let snapshot = needs_snapshot(graph, registry, job);

                // Job conditional; the default predicate is "all needs
                // succeeded".
                let verdict = match &job.if_expr {
                    None => Ok(flags.success),
                    Some(text) => {
                        let ctx = EvalContext::new()
                            .with_matrix(&graph.instance(idx).matrix)
                            .with_needs(&snapshot)
                            .with_event(&self.event)
                            .with_status(flags);
                        expr::evaluate_condition(text, &ctx)
                    }
                };

                match verdict {
                    Err(e) => {
                        error!("Instance '{}' conditional failed: {}", graph.instance(idx).id, e);
                        graph.set_status(idx, InstanceStatus::Failed);
                        timeline.record(
                            graph.instance(idx).id.clone(),
                            EventKind::Finished(InstanceStatus::Failed.as_str()),
                        );
                        progressed = true;
                        continue;
                    }
                    Ok(false) => {
                        debug!("Instance '{}' skipped", graph.instance(idx).id);
                        graph.set_status(idx, InstanceStatus::Skipped);
                        timeline.record(
                            graph.instance(idx).id.clone(),
                            EventKind::Finished(InstanceStatus::Skipped.as_str()),
                        );
                        progressed = true;
                        continue;
                    }
                    Ok(true) => {}
                }

                // Environment gate.
                if let Some(environment) = &job.environment {
                    match gates.open(environment, &self.event) {
                        GateState::Approved => {}
                        GateState::Rejected => {
                            info!(
                                "Instance '{}' cancelled: gate '{}' rejected",
                                graph.instance(idx).id, environment
                            );
                            graph.set_status(idx, InstanceStatus::Cancelled);
                            timeline.record(
                                graph.instance(idx).id.clone(),
                                EventKind::Finished(InstanceStatus::Cancelled.as_str()),
                            );
                            progressed = true;
                            continue;
                        }
                        GateState::AwaitingApproval | GateState::Idle => {
                            if graph.instance(idx).status != InstanceStatus::Blocked {
                                info!(
                                    "Instance '{}' blocked on gate '{}'",
                                    graph.instance(idx).id, environment
                                );
                                graph.set_status(idx, InstanceStatus::Blocked);
                            }
                            continue;
                        }
                    }
                }

                // Capacity: engine-wide cap, then the job's own.
                if *running >= self.max_parallel {
                    continue;
                }
                if let Some(cap) = job.strategy.as_ref().and_then(|s| s.max_parallel) {
                    let job_running = graph
                        .instances_of(&job_id)
                        .iter()
                        .filter(|&&i| graph.instance(i).status == InstanceStatus::Running)
                        .count();
                    if job_running >= cap {
                        continue;
                    }
                }

                self.dispatch(graph, idx, job, snapshot, cancel_flags, timeline);
                *running += 1;
                progressed = true;
            }
        }
    }

    /// Hands one instance to a worker thread.
    fn dispatch(
        &self,
        graph: &mut ExecutionGraph,
        idx: usize,
        job: &Job,
        needs: NeedsSnapshot,
        cancel_flags: &[Arc<AtomicBool>],
        timeline: &mut ExecutionTimeline,
    ) {
        let instance = graph.instance(idx);
        info!("Dispatching instance '{}'", instance.id);
        timeline.record(instance.id.clone(), EventKind::Dispatched);

        let work = InstanceWork {
            index: idx,
            instance_id: instance.id.clone(),
            job: job.clone(),
            matrix: instance.matrix.clone(),
            workflow_env: self.def.env.clone(),
            needs,
            event: self.event.clone(),
            actions: Arc::clone(&self.actions),
            secrets: Arc::clone(&self.secrets),
            cache: Arc::clone(&self.cache),
            cancel: Arc::clone(&cancel_flags[idx]),
            dry_run: self.dry_run,
            working_dir: self.working_dir.clone(),
        };

        graph.set_status(idx, InstanceStatus::Running);

        let tx = self.tx.clone();
        thread::spawn(move || {
            let index = work.index;
            let outcome = run_instance(work);
            if tx
                .send(EngineEvent::InstanceDone { index, outcome })
                .is_err()
            {
                error!("Failed to send completion for instance {}", index);
            }
        });
    }

    /// Applies a finished instance's outcome: status, published outputs,
    /// committed cache saves, and fail-fast cancellation of siblings.
    fn finish_instance(
        &self,
        graph: &mut ExecutionGraph,
        registry: &mut OutputRegistry,
        timeline: &mut ExecutionTimeline,
        cancel_flags: &[Arc<AtomicBool>],
        index: usize,
        outcome: InstanceOutcome,
        outcomes: &mut [Option<InstanceOutcome>],
    ) -> Result<(), EngineError> {
        let instance_id = graph.instance(index).id.clone();
        let job_id = graph.instance(index).job_id.clone();

        info!("Instance '{}' finished: {}", instance_id, outcome.status);
        graph.set_status(index, outcome.status);
        timeline.record(instance_id.clone(), EventKind::Finished(outcome.status.as_str()));

        if outcome.status == InstanceStatus::Succeeded {
            registry.publish(&job_id, &instance_id, outcome.outputs.clone())?;

            if !outcome.cache_saves.is_empty() {
                let mut cache = self
                    .cache
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                for save in &outcome.cache_saves {
                    cache.store(save.key.clone(), save.path.clone(), save.content.clone());
                }
            }
        }

        // Fail-fast cancels matrix siblings of the same job only.
        if outcome.status == InstanceStatus::Failed {
            let fail_fast = self
                .def
                .get_job(&job_id)
                .map(Job::fail_fast)
                .unwrap_or(true);
            if fail_fast {
                for sibling in graph.siblings_of(index) {
                    match graph.instance(sibling).status {
                        InstanceStatus::Pending | InstanceStatus::Blocked => {
                            info!(
                                "Instance '{}' cancelled (fail-fast)",
                                graph.instance(sibling).id
                            );
                            graph.set_status(sibling, InstanceStatus::Cancelled);
                            timeline.record(
                                graph.instance(sibling).id.clone(),
                                EventKind::Finished(InstanceStatus::Cancelled.as_str()),
                            );
                        }
                        InstanceStatus::Running => {
                            debug!(
                                "Instance '{}' flagged for cancellation (fail-fast)",
                                graph.instance(sibling).id
                            );
                            cancel_flags[sibling].store(true, Ordering::Relaxed);
                        }
                        _ => {}
                    }
                }
            }
        }

        outcomes[index] = Some(outcome);
        Ok(())
    }

    /// Assembles the final report from the graph and worker outcomes.
    fn build_report(
        &self,
        started_at: chrono::DateTime<Utc>,
        graph: &ExecutionGraph,
        mut outcomes: Vec<Option<InstanceOutcome>>,
        registry: &OutputRegistry,
    ) -> RunReport {
        let instances = graph
            .instances()
            .iter()
            .enumerate()
            .map(|(idx, instance)| {
                let outcome = outcomes[idx].take();
                let (steps, error) = match outcome {
                    Some(o) => (o.steps, o.error),
                    None => (Vec::new(), None),
                };
                InstanceReport {
                    instance: instance.id.clone(),
                    job: instance.job_id.clone(),
                    matrix: instance.matrix.clone(),
                    status: instance.status,
                    error,
                    steps,
                }
            })
            .collect();

        RunReport {
            workflow: self.def.name.clone(),
            event: self.event.clone(),
            triggered: true,
            started_at,
            finished_at: Utc::now(),
            instances,
            outputs: registry.all().clone(),
        }
    }
}

/// Status aggregate of a job's needs, feeding the job-level predicates.
fn needs_flags(graph: &ExecutionGraph, job: &Job) -> StatusFlags {
    let mut flags = StatusFlags::healthy();
    for need in &job.needs {
        match graph.job_result(need) {
            "success" => {}
            "failure" => {
                flags.success = false;
                flags.failure = true;
            }
            "cancelled" => {
                flags.success = false;
                flags.cancelled = true;
            }
            // A skipped need is neither a success nor a failure.
            _ => flags.success = false,
        }
    }
    flags
}

/// Read-only view of the needed jobs' results and published outputs.
fn needs_snapshot(graph: &ExecutionGraph, registry: &OutputRegistry, job: &Job) -> NeedsSnapshot {
    let mut snapshot = NeedsSnapshot::new();
    for need in &job.needs {
        let outputs = registry.outputs_of(need).cloned().unwrap_or_default();
        snapshot.insert(need.clone(), graph.job_result(need), outputs);
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::gate::Decision;
    use crate::workflow::model::{
        EnvironmentSpec, Job, Matrix, Step, Strategy, Trigger,
    };
    use std::fs;
    use tempfile::tempdir;

    fn job(id: &str, steps: Vec<Step>) -> Job {
        Job::new(id, steps)
    }

    fn matrix_job(id: &str, values: &[&str], fail_fast: bool) -> Job {
        Job::new(id, vec![Step::run("true")]).with_strategy(Strategy {
            matrix: Some(Matrix {
                axes: vec![(
                    "os".to_string(),
                    values.iter().map(|v| serde_json::json!(v)).collect(),
                )],
                include: Vec::new(),
                exclude: Vec::new(),
            }),
            fail_fast,
            max_parallel: None,
        })
    }

    fn engine_for(def: WorkflowDefinition, dir: &std::path::Path) -> Engine {
        let mut engine = Engine::new(def, EventContext::default());
        engine.set_working_dir(dir);
        engine.set_max_parallel(4);
        engine
    }

    #[test]
    fn test_linear_pipeline_with_outputs() {
        let dir = tempdir().unwrap();
        let def = WorkflowDefinition::from_jobs(vec![
            job(
                "build",
                vec![Step::run("echo version=7 >> \"$CONVEYOR_OUTPUT\"").with_id("compile")],
            )
            .with_output("version", "${{ steps.compile.outputs.version }}"),
            job(
                "deploy",
                vec![Step::run(
                    "echo -n 'v${{ needs.build.outputs.version }}' > deployed.txt",
                )],
            )
            .depends_on("build"),
        ]);

        let report = engine_for(def, dir.path()).run().unwrap();
        assert!(report.success());
        assert_eq!(report.counts(), (2, 0, 0, 0));
        assert_eq!(
            fs::read_to_string(dir.path().join("deployed.txt")).unwrap(),
            "v7"
        );
        assert_eq!(
            report.outputs.get("build").unwrap().get("version").unwrap(),
            "7"
        );
    }

    #[test]
    fn test_failed_need_skips_dependents_transitively() {
        let dir = tempdir().unwrap();
        let def = WorkflowDefinition::from_jobs(vec![
            job("a", vec![Step::run("exit 1")]),
            job("b", vec![Step::run("echo -n b > b.txt")]).depends_on("a"),
            job("c", vec![Step::run("echo -n c > c.txt")]).depends_on("b"),
            job("cleanup", vec![Step::run("echo -n ran > cleanup.txt")])
                .depends_on("a")
                .with_if("failure()"),
        ]);

        let report = engine_for(def, dir.path()).run().unwrap();
        assert_eq!(report.instance("a").unwrap().status, InstanceStatus::Failed);
        assert_eq!(report.instance("b").unwrap().status, InstanceStatus::Skipped);
        assert_eq!(report.instance("c").unwrap().status, InstanceStatus::Skipped);
        assert_eq!(
            report.instance("cleanup").unwrap().status,
            InstanceStatus::Succeeded
        );

        assert!(!dir.path().join("b.txt").exists());
        assert!(!dir.path().join("c.txt").exists());
        assert!(dir.path().join("cleanup.txt").exists());
    }

    #[test]
    fn test_skipped_need_skips_default_and_failure_dependents() {
        let dir = tempdir().unwrap();
        let def = WorkflowDefinition::from_jobs(vec![
            job("a", vec![Step::run("true")]).with_if("false"),
            job("b", vec![Step::run("true")]).depends_on("a"),
            job("c", vec![Step::run("true")])
                .depends_on("a")
                .with_if("failure()"),
            job("d", vec![Step::run("true")])
                .depends_on("a")
                .with_if("always()"),
        ]);

        let report = engine_for(def, dir.path()).run().unwrap();
        assert_eq!(report.instance("a").unwrap().status, InstanceStatus::Skipped);
        assert_eq!(report.instance("b").unwrap().status, InstanceStatus::Skipped);
        assert_eq!(report.instance("c").unwrap().status, InstanceStatus::Skipped);
        assert_eq!(
            report.instance("d").unwrap().status,
            InstanceStatus::Succeeded
        );
    }

    #[test]
    fn test_fail_fast_cancels_pending_siblings() {
        let dir = tempdir().unwrap();
        let mut jobs = matrix_job("build", &["a", "b", "c"], true);
        jobs.steps = vec![Step::run("test \"${{ matrix.os }}\" != \"a\"")];
        let def = WorkflowDefinition::from_jobs(vec![jobs]);

        let mut engine = engine_for(def, dir.path());
        // Serialize dispatch so the failing instance finishes while its
        // siblings are still pending.
        engine.set_max_parallel(1);

        let report = engine.run().unwrap();
        let (succeeded, failed, _, cancelled) = report.counts();
        assert_eq!(failed, 1);
        assert_eq!(cancelled, 2);
        assert_eq!(succeeded, 0);
    }

    #[test]
    fn test_fail_fast_disabled_lets_siblings_finish() {
        let dir = tempdir().unwrap();
        let mut jobs = matrix_job("build", &["a", "b", "c"], false);
        jobs.steps = vec![Step::run("test \"${{ matrix.os }}\" != \"a\"")];
        let def = WorkflowDefinition::from_jobs(vec![jobs]);

        let mut engine = engine_for(def, dir.path());
        engine.set_max_parallel(1);

        let report = engine.run().unwrap();
        let (succeeded, failed, _, cancelled) = report.counts();
        assert_eq!(failed, 1);
        assert_eq!(cancelled, 0);
        assert_eq!(succeeded, 2);
    }

    #[test]
    fn test_fail_fast_does_not_touch_unrelated_jobs() {
        let dir = tempdir().unwrap();
        let def = WorkflowDefinition::from_jobs(vec![
            job("flaky", vec![Step::run("exit 1")]),
            job("steady", vec![Step::run("echo -n ok > steady.txt")]),
        ]);

        let report = engine_for(def, dir.path()).run().unwrap();
        assert_eq!(
            report.instance("steady").unwrap().status,
            InstanceStatus::Succeeded
        );
        assert!(dir.path().join("steady.txt").exists());
    }

    #[test]
    fn test_sticky_vars_are_instance_local() {
        let dir = tempdir().unwrap();
        let mut build = matrix_job("build", &["red", "blue"], true);
        build.steps = vec![
            Step::run("echo COLOR=${{ matrix.os }} >> \"$CONVEYOR_ENV\""),
            Step::run("echo -n \"$COLOR\" > color-${{ matrix.os }}.txt"),
        ];
        let def = WorkflowDefinition::from_jobs(vec![build]);

        let report = engine_for(def, dir.path()).run().unwrap();
        assert!(report.success());
        assert_eq!(
            fs::read_to_string(dir.path().join("color-red.txt")).unwrap(),
            "red"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("color-blue.txt")).unwrap(),
            "blue"
        );
    }

    #[test]
    fn test_gate_blocks_until_approved() {
        let dir = tempdir().unwrap();
        let mut def = WorkflowDefinition::from_jobs(vec![job(
            "deploy",
            vec![Step::run("echo -n deployed > gated.txt")],
        )
        .with_environment("prod")]);
        def.environments.insert(
            "prod".to_string(),
            EnvironmentSpec {
                reviewers: vec!["alice".to_string()],
                approvals: 1,
                branches: Vec::new(),
            },
        );

        let mut engine = engine_for(def, dir.path());
        let sender = engine.approval_sender();
        sender
            .send(ApprovalSignal {
                gate: "prod".to_string(),
                decision: Decision::Approved,
                reviewer: "alice".to_string(),
            })
            .unwrap();

        let report = engine.run().unwrap();
        assert!(report.success());
        assert!(dir.path().join("gated.txt").exists());
    }

    #[test]
    fn test_gate_rejection_cancels_job_and_skips_dependents() {
        let dir = tempdir().unwrap();
        let mut def = WorkflowDefinition::from_jobs(vec![
            job("deploy", vec![Step::run("echo -n no > gated.txt")]).with_environment("prod"),
            job("announce", vec![Step::run("true")]).depends_on("deploy"),
            job("unrelated", vec![Step::run("echo -n yes > free.txt")]),
        ]);
        def.environments
            .insert("prod".to_string(), EnvironmentSpec {
                reviewers: Vec::new(),
                approvals: 1,
                branches: Vec::new(),
            });

        let mut engine = engine_for(def, dir.path());
        let sender = engine.approval_sender();
        sender
            .send(ApprovalSignal {
                gate: "prod".to_string(),
                decision: Decision::Rejected,
                reviewer: "bob".to_string(),
            })
            .unwrap();

        let report = engine.run().unwrap();
        assert_eq!(
            report.instance("deploy").unwrap().status,
            InstanceStatus::Cancelled
        );
        assert_eq!(
            report.instance("announce").unwrap().status,
            InstanceStatus::Skipped
        );
        assert_eq!(
            report.instance("unrelated").unwrap().status,
            InstanceStatus::Succeeded
        );

        // The gated step never ran.
        assert!(!dir.path().join("gated.txt").exists());
        assert!(dir.path().join("free.txt").exists());
    }

    #[test]
    fn test_gate_quorum_not_met_times_out() {
        let dir = tempdir().unwrap();
        let mut def = WorkflowDefinition::from_jobs(vec![job(
            "deploy",
            vec![Step::run("echo -n no > gated.txt")],
        )
        .with_environment("prod")]);
        def.environments.insert(
            "prod".to_string(),
            EnvironmentSpec {
                reviewers: vec!["alice".to_string(), "bob".to_string()],
                approvals: 2,
                branches: Vec::new(),
            },
        );

        let mut engine = engine_for(def, dir.path());
        engine.set_gate_timeout(Duration::from_millis(200));
        let sender = engine.approval_sender();
        // The same reviewer twice does not meet a quorum of two.
        for _ in 0..2 {
            sender
                .send(ApprovalSignal {
                    gate: "prod".to_string(),
                    decision: Decision::Approved,
                    reviewer: "alice".to_string(),
                })
                .unwrap();
        }

        let report = engine.run().unwrap();
        assert_eq!(
            report.instance("deploy").unwrap().status,
            InstanceStatus::Cancelled
        );
        assert!(!dir.path().join("gated.txt").exists());
    }

    #[test]
    fn test_cache_flows_between_jobs() {
        let dir = tempdir().unwrap();
        let def = WorkflowDefinition::from_jobs(vec![
            job(
                "warm",
                vec![
                    Step::uses("cache")
                        .with_input("key", "deps-v1")
                        .with_input("path", "warm.txt"),
                    Step::run("echo -n payload > warm.txt"),
                ],
            ),
            job(
                "reuse",
                vec![
                    Step::uses("cache")
                        .with_id("restore")
                        .with_input("key", "deps-v1")
                        .with_input("path", "reused.txt"),
                    Step::run("echo -n '${{ steps.restore.outputs.cache-hit }}' > hit.txt"),
                ],
            )
            .depends_on("warm"),
        ]);

        let report = engine_for(def, dir.path()).run().unwrap();
        assert!(report.success());
        assert_eq!(
            fs::read_to_string(dir.path().join("reused.txt")).unwrap(),
            "payload"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("hit.txt")).unwrap(),
            "true"
        );
    }

    #[test]
    fn test_trigger_mismatch_runs_nothing() {
        let dir = tempdir().unwrap();
        let mut def =
            WorkflowDefinition::from_jobs(vec![job("a", vec![Step::run("echo -n x > a.txt")])]);
        def.triggers = vec![Trigger {
            event: "release".to_string(),
            branches: Vec::new(),
        }];

        let report = engine_for(def, dir.path()).run().unwrap();
        assert!(!report.triggered);
        assert!(report.instances.is_empty());
        assert!(!dir.path().join("a.txt").exists());
    }

    #[test]
    fn test_cycle_aborts_before_execution() {
        let dir = tempdir().unwrap();
        let def = WorkflowDefinition::from_jobs(vec![
            job("a", vec![Step::run("echo -n x > a.txt")]).depends_on("b"),
            job("b", vec![Step::run("true")]).depends_on("a"),
        ]);

        let result = engine_for(def, dir.path()).run();
        assert!(matches!(result, Err(EngineError::Cycle)));
        assert!(!dir.path().join("a.txt").exists());
    }

    #[test]
    fn test_empty_definition_rejected() {
        let dir = tempdir().unwrap();
        let result = engine_for(WorkflowDefinition::default(), dir.path()).run();
        assert!(matches!(result, Err(EngineError::EmptyWorkflow)));
    }

    #[test]
    fn test_dry_run_reports_success_without_side_effects() {
        let dir = tempdir().unwrap();
        let def = WorkflowDefinition::from_jobs(vec![
            job("a", vec![Step::run("echo -n x > a.txt")]),
            job("b", vec![Step::run("echo -n y > b.txt")]).depends_on("a"),
        ]);

        let mut engine = engine_for(def, dir.path());
        engine.set_dry_run(true);
        let report = engine.run().unwrap();

        assert!(report.success());
        assert_eq!(report.counts().0, 2);
        assert!(!dir.path().join("a.txt").exists());
        assert!(!dir.path().join("b.txt").exists());
    }

    #[test]
    fn test_matrix_instances_all_run() {
        let dir = tempdir().unwrap();
        let mut build = matrix_job("build", &["a", "b"], true);
        build.steps = vec![Step::run("echo -n done > out-${{ matrix.os }}.txt")];
        let def = WorkflowDefinition::from_jobs(vec![build]);

        let report = engine_for(def, dir.path()).run().unwrap();
        assert!(report.success());
        assert_eq!(report.instances.len(), 2);
        assert!(dir.path().join("out-a.txt").exists());
        assert!(dir.path().join("out-b.txt").exists());
    }
}
