//! Conveyor CLI Entry Point
//!
//! Hosts the engine for local runs: loads a workflow and its actions,
//! assembles the event context and secrets, feeds pre-recorded gate
//! decisions, and prints the run summary.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! conveyor pipeline.yaml
//!
//! # Simulate a different trigger
//! conveyor pipeline.yaml --event pull_request --ref refs/heads/feature/x
//!
//! # Preview without executing commands
//! conveyor pipeline.yaml --dry-run
//!
//! # Approve a deployment gate up front
//! conveyor pipeline.yaml --approve production:alice
//!
//! # Write the full JSON report
//! conveyor pipeline.yaml --report run.json
//! ```

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use colored::Colorize;
use log::{error, info};

use conveyor::context::SecretStore;
use conveyor::execution::{ApprovalSignal, Decision, Engine, RunReport};
use conveyor::workflow::graph::InstanceStatus;
use conveyor::workflow::{load_actions, load_workflow, EventContext};
use conveyor::{APP_NAME, VERSION};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    workflow_path: String,
    actions_path: Option<String>,
    event: String,
    ref_name: String,
    actor: String,
    sha: String,
    run_number: u64,
    secrets: Vec<(String, String)>,
    decisions: Vec<(String, String, Decision)>,
    gate_timeout: Option<Duration>,
    parallel: Option<usize>,
    working_dir: Option<PathBuf>,
    dry_run: bool,
    report_path: Option<String>,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflow_path: DEFAULT_WORKFLOW.to_string(),
            actions_path: None,
            event: "push".to_string(),
            ref_name: "refs/heads/main".to_string(),
            actor: "local".to_string(),
            sha: String::new(),
            run_number: 1,
            secrets: Vec::new(),
            decisions: Vec::new(),
            gate_timeout: None,
            parallel: None,
            working_dir: None,
            dry_run: false,
            report_path: None,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: conveyor [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>       Path to workflow YAML file (default: {})", DEFAULT_WORKFLOW);
    println!();
    println!("Options:");
    println!("  --actions FILE        Composite actions YAML file");
    println!("  --event NAME          Triggering event name (default: push)");
    println!("  --ref REF             Git ref for the event (default: refs/heads/main)");
    println!("  --actor NAME          User that caused the event");
    println!("  --sha SHA             Commit id for the event");
    println!("  --run-number N        Run counter (default: 1)");
    println!("  --secret K=V          Add a secret (repeatable)");
    println!("  --approve GATE[:who]  Pre-approve an environment gate (repeatable)");
    println!("  --reject GATE[:who]   Pre-reject an environment gate (repeatable)");
    println!("  --gate-timeout SECS   Cancel gated jobs after waiting this long");
    println!("  --parallel N          Maximum parallel job instances");
    println!("  --working-dir PATH    Working directory for run steps");
    println!("  --dry-run             Log commands without executing them");
    println!("  --report FILE         Write the JSON run report to FILE");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  conveyor pipeline.yaml");
    println!("  conveyor pipeline.yaml --dry-run --parallel 8");
    println!("  conveyor pipeline.yaml --approve production:alice --report run.json");
}

/// Parses a `GATE[:reviewer]` argument.
fn parse_gate_arg(arg: &str, default_reviewer: &str) -> (String, String) {
    match arg.split_once(':') {
        Some((gate, reviewer)) => (gate.to_string(), reviewer.to_string()),
        None => (arg.to_string(), default_reviewer.to_string()),
    }
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    fn value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
        *i += 1;
        args.get(*i)
            .map(String::as_str)
            .ok_or_else(|| format!("{} requires an argument", flag))
    }

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => {
                config.dry_run = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--actions" => {
                config.actions_path = Some(value(args, &mut i, "--actions")?.to_string());
            }
            "--event" => {
                config.event = value(args, &mut i, "--event")?.to_string();
            }
            "--ref" => {
                config.ref_name = value(args, &mut i, "--ref")?.to_string();
            }
            "--actor" => {
                config.actor = value(args, &mut i, "--actor")?.to_string();
            }
            "--sha" => {
                config.sha = value(args, &mut i, "--sha")?.to_string();
            }
            "--run-number" => {
                let raw = value(args, &mut i, "--run-number")?;
                config.run_number = raw
                    .parse()
                    .map_err(|_| format!("Invalid run number: {}", raw))?;
            }
            "--secret" => {
                let raw = value(args, &mut i, "--secret")?;
                let (name, secret) = raw
                    .split_once('=')
                    .ok_or_else(|| format!("Invalid secret (expected K=V): {}", raw))?;
                config.secrets.push((name.to_string(), secret.to_string()));
            }
            "--approve" => {
                let raw = value(args, &mut i, "--approve")?.to_string();
                let (gate, reviewer) = parse_gate_arg(&raw, &config.actor);
                config.decisions.push((gate, reviewer, Decision::Approved));
            }
            "--reject" => {
                let raw = value(args, &mut i, "--reject")?.to_string();
                let (gate, reviewer) = parse_gate_arg(&raw, &config.actor);
                config.decisions.push((gate, reviewer, Decision::Rejected));
            }
            "--gate-timeout" => {
                let raw = value(args, &mut i, "--gate-timeout")?;
                let secs: u64 = raw
                    .parse()
                    .map_err(|_| format!("Invalid gate timeout: {}", raw))?;
                config.gate_timeout = Some(Duration::from_secs(secs));
            }
            "--parallel" => {
                let raw = value(args, &mut i, "--parallel")?;
                config.parallel = Some(
                    raw.parse()
                        .map_err(|_| format!("Invalid parallel value: {}", raw))?,
                );
            }
            "--working-dir" => {
                config.working_dir = Some(PathBuf::from(value(args, &mut i, "--working-dir")?));
            }
            "--report" => {
                config.report_path = Some(value(args, &mut i, "--report")?.to_string());
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                // Positional argument
                match positional_index {
                    0 => config.workflow_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Renders an instance status with color for the terminal summary.
fn colored_status(status: InstanceStatus) -> colored::ColoredString {
    match status {
        InstanceStatus::Succeeded => status.as_str().green(),
        InstanceStatus::Failed => status.as_str().red(),
        InstanceStatus::Cancelled => status.as_str().red(),
        InstanceStatus::Skipped => status.as_str().yellow(),
        _ => status.as_str().normal(),
    }
}

/// Prints the per-instance summary table.
fn print_summary(report: &RunReport) {
    println!();
    println!("Run summary for '{}':", report.workflow);
    for instance in &report.instances {
        println!("  {:40} {}", instance.instance, colored_status(instance.status));
        if let Some(error) = &instance.error {
            println!("    {}", error.red());
        }
    }

    let (succeeded, failed, skipped, cancelled) = report.counts();
    println!();
    println!(
        "  {} succeeded, {} failed, {} skipped, {} cancelled",
        succeeded, failed, skipped, cancelled
    );
    println!();
}

/// Main application entry point.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    if config.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
        println!();
    }

    // Load workflow and actions
    info!("Loading workflow: {}", config.workflow_path);
    let def = load_workflow(&config.workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        e
    })?;

    // Assemble the event context
    let event = EventContext {
        event: config.event.clone(),
        ref_name: config.ref_name.clone(),
        actor: config.actor.clone(),
        sha: config.sha.clone(),
        run_number: config.run_number,
    };

    // Create and configure the engine
    let mut engine = Engine::new(def, event);

    if let Some(path) = &config.actions_path {
        engine.set_actions(load_actions(path)?);
    }
    if !config.secrets.is_empty() {
        engine.set_secrets(SecretStore::from_pairs(config.secrets.clone()));
    }
    if let Some(parallel) = config.parallel {
        engine.set_max_parallel(parallel);
    }
    if let Some(dir) = &config.working_dir {
        engine.set_working_dir(dir.clone());
    }
    if let Some(timeout) = config.gate_timeout {
        engine.set_gate_timeout(timeout);
    }
    engine.set_dry_run(config.dry_run);

    // Feed pre-recorded gate decisions; they are consumed once the
    // referencing jobs become eligible.
    let approvals = engine.approval_sender();
    for (gate, reviewer, decision) in &config.decisions {
        approvals.send(ApprovalSignal {
            gate: gate.clone(),
            decision: *decision,
            reviewer: reviewer.clone(),
        })?;
    }

    // Execute the run
    let report = engine.run()?;

    if !report.triggered {
        println!(
            "Workflow '{}' is not triggered by {} on {}",
            report.workflow, config.event, config.ref_name
        );
        return Ok(true);
    }

    print_summary(&report);

    if let Some(path) = &config.report_path {
        fs::write(path, report.to_json()?)?;
        info!("Report written to {}", path);
    }

    Ok(report.success())
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
