//! PILOT CLI
//!
//! Compile declarative automations, run them, and resume or inspect
//! executions from the command line.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use console::style;
use pilot_calibrate::{CalibrationService, HardcodedValue};
use pilot_core::{ExecutionId, StepId, WorkflowId};
use pilot_log::{EventKind, ExecutionEvent};
use pilot_runtime::{PilotRuntime, Settings, StatusReport};
use pilot_storage::ExecutionStatus;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pilot")]
#[command(about = "PILOT - declarative automation compiler and resumable executor", long_about = None)]
struct Cli {
    /// Settings file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Durable store file, overrides settings
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile an IR document
    Compile {
        /// Path to the IR file
        #[arg(short, long)]
        file: PathBuf,
        /// Write the compiled steps here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Compile, store and run an IR document
    Run {
        /// Path to the IR file
        #[arg(short, long)]
        file: PathBuf,
        /// Workflow name
        #[arg(short, long)]
        name: Option<String>,
        /// Input values as key=value (value may be JSON)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
    },
    /// Resume a failed or paused execution
    Resume {
        /// Execution id
        #[arg(short, long)]
        execution: ExecutionId,
        /// Corrected input values as key=value (value may be JSON)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
    },
    /// Show execution status
    Status {
        /// Execution id
        #[arg(short, long)]
        execution: ExecutionId,
    },
    /// Find hardcoded values in a stored workflow
    Detect {
        /// Workflow id
        #[arg(short, long)]
        workflow: WorkflowId,
        /// Limit the scan to one step
        #[arg(long)]
        step: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut settings = Settings::load(cli.config.as_deref()).wrap_err("loading settings")?;
    if let Some(store) = cli.store {
        settings.store_path = Some(store);
    }
    let runtime = Arc::new(PilotRuntime::from_settings(settings).wrap_err("opening store")?);
    let json = cli.json;

    match cli.command {
        Commands::Compile { file, output } => {
            let ir = read_json(&file)?;
            let compiled = runtime.compiler().compile(&ir, None).await?;
            if let Some(path) = output {
                let text = serde_json::to_string_pretty(&compiled.workflow)?;
                std::fs::write(&path, text).wrap_err_with(|| format!("writing {}", path.display()))?;
            }
            if json {
                return print_json(&compiled);
            }
            println!(
                "{} {} step(s) via {} in {} ms",
                style("compiled").green().bold(),
                compiled.metadata.step_count,
                compiled.metadata.compiler_used,
                compiled.metadata.compilation_time_ms
            );
            for step in &compiled.workflow {
                let deps: Vec<&str> = step.dependencies.iter().map(StepId::as_str).collect();
                println!(
                    "  {} {} {}",
                    style(&step.id).cyan(),
                    style(step.type_name()).dim(),
                    if deps.is_empty() {
                        String::new()
                    } else {
                        format!("<- {}", deps.join(", "))
                    }
                );
            }
            for warning in &compiled.warnings {
                println!("  {} {}", style("warning").yellow(), warning);
            }
            Ok(())
        }
        Commands::Run { file, name, inputs } => {
            let ir = read_json(&file)?;
            let name = name.unwrap_or_else(|| {
                file.file_stem()
                    .map_or_else(|| "workflow".to_string(), |s| s.to_string_lossy().into_owned())
            });
            let (mut workflow, _) = runtime.create_workflow(&name, &ir, None).await?;
            let inputs = parse_assignments(&inputs)?;
            if !inputs.is_empty() {
                workflow.merge_inputs(&inputs);
                runtime.store().save_workflow(&workflow).await?;
            }
            println!("{} {}", style("workflow").bold(), workflow.id);

            let _progress = (!json).then(|| runtime.events().subscribe_all(print_event));
            let summary = runtime.engine().start(&workflow).await?;
            if json {
                return print_json(&summary);
            }
            println!(
                "{} {} ({} completed, {} failed, {} tokens)",
                style("execution").bold(),
                summary.execution_id,
                summary.steps_completed,
                summary.steps_failed,
                summary.total_tokens_used
            );
            finish(summary.status, summary.execution_id)
        }
        Commands::Resume { execution, inputs } => {
            let inputs = parse_assignments(&inputs)?;
            let _progress = (!json).then(|| runtime.events().subscribe(execution, print_event));
            let response = runtime
                .resume()
                .resume(execution, (!inputs.is_empty()).then_some(inputs))
                .await?;
            if json {
                return print_json(&response);
            }
            println!(
                "{} {} completed, {} failed",
                style("resumed").bold(),
                response.result.steps_completed,
                response.result.steps_failed
            );
            finish(response.status, execution)
        }
        Commands::Status { execution } => {
            let report = runtime.status().report(execution).await?;
            if json {
                return print_json(&report);
            }
            print_report(&report);
            Ok(())
        }
        Commands::Detect { workflow, step } => {
            let service = CalibrationService::new(Arc::clone(runtime.store()));
            let step = step.map(StepId::new);
            let report = service.detect(workflow, step.as_ref()).await?;
            if json {
                return print_json(&report);
            }
            if report.findings.is_empty() {
                println!("{}", style("no hardcoded values found").green());
            }
            for finding in report.findings.iter() {
                print_finding(finding);
            }
            if !report.referenced_inputs.is_empty() {
                println!("{} {}", style("inputs in use:").dim(), report.referenced_inputs.join(", "));
            }
            Ok(())
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "pilot=warn",
        1 => "pilot=info",
        _ => "pilot=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path).wrap_err_with(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).wrap_err_with(|| format!("parsing {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse `key=value` pairs; values that parse as JSON keep their type
fn parse_assignments(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| eyre!("expected KEY=VALUE, got '{}'", pair))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("empty input name in '{}'", pair);
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

fn print_event(event: &ExecutionEvent) {
    let step = event.step_id.as_ref().map_or("", StepId::as_str);
    match event.kind {
        EventKind::StepStarted => println!("  {} {}", style("start").dim(), step),
        EventKind::StepCompleted => println!("  {} {}", style("done ").green(), step),
        EventKind::StepFailed => println!(
            "  {} {} {}",
            style("fail ").red(),
            step,
            event.payload.get("error").and_then(Value::as_str).unwrap_or_default()
        ),
        EventKind::ExecutionComplete | EventKind::ExecutionError => {}
    }
}

fn finish(status: ExecutionStatus, execution: ExecutionId) -> Result<()> {
    match status {
        ExecutionStatus::Completed => {
            println!("{}", style("completed").green().bold());
            Ok(())
        }
        ExecutionStatus::Paused => {
            println!(
                "{} fix the inputs, then: pilot resume --execution {} --set NAME=VALUE",
                style("paused").yellow().bold(),
                execution
            );
            Ok(())
        }
        other => bail!("execution {} ended {}", execution, other),
    }
}

fn print_report(report: &StatusReport) {
    println!("{} {}", style(report.status).bold(), report.friendly_summary);
    for step in &report.steps {
        let line = format!("  {:<16} {}", step.step_id.as_str(), step.friendly_status);
        match step.friendly_error.as_deref() {
            Some(error) => println!("{} {}", line, style(error).red()),
            None => println!("{}", line),
        }
    }
    for decision in &report.pending_decisions {
        println!("{} {}", style("?").yellow().bold(), decision.question);
    }
}

fn print_finding(finding: &HardcodedValue) {
    let steps: Vec<&str> = finding.step_ids.iter().map(StepId::as_str).collect();
    let existing = finding
        .existing_input
        .as_deref()
        .map(|name| format!(" (matches input '{}')", name))
        .unwrap_or_default();
    println!(
        "{} {} in {} -> {{{{input.{}}}}}{}",
        style(format!("{:?}", finding.category)).magenta(),
        finding.value,
        steps.join(", "),
        finding.suggested_param,
        existing
    );
}
