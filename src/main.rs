mod callgraph;
mod classpath;
mod config;
mod descriptor;
mod diagnostics;
mod error;
mod hierarchy;
mod ir;
mod opcodes;
mod reflection;
mod report;
mod scan;
mod strategy;
mod telemetry;
#[cfg(test)]
mod test_harness;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, FromArgMatches, Parser};
use tracing::{info, warn};

use crate::callgraph::{BuildOptions, build_call_graph, entry_points};
use crate::classpath::ProgramModel;
use crate::config::{AnalysisConfig, EntryMode, PhantomPolicy};
use crate::error::OutputError;
use crate::hierarchy::TypeHierarchy;
use crate::report::{CallGraphReport, build_report, write_report};
use crate::scan::scan_inputs;
use crate::strategy::{create_strategy, registered_strategies};
use crate::telemetry::{Phase, PhaseTimings, Telemetry, init_logging};

/// CLI arguments for jcallgraph execution.
#[derive(Parser, Debug)]
#[command(
    name = "jcallgraph",
    about = "Deterministic CHA/RTA call graphs for JVM class files, directories and JAR files.",
    version
)]
struct Cli {
    /// Call graph algorithm, case-insensitive.
    #[arg(value_name = "STRATEGY")]
    strategy: String,
    /// Class file, directory, JAR or JSON program model to analyze.
    #[arg(value_name = "TARGET")]
    target: PathBuf,
    /// Class whose `main` is the entry point; empty or `-` for library mode.
    #[arg(value_name = "MAIN_CLASS")]
    main_class: String,
    /// Output file, or `-` for stdout.
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,
    /// Library classes that are resolved against but never used as entry points.
    #[arg(value_name = "CLASSPATH")]
    classpath: Vec<PathBuf>,
    #[arg(long, value_enum, default_value_t = PhantomPolicy::Allow)]
    phantom_refs: PhantomPolicy,
    /// Abort call graph construction after this many milliseconds.
    #[arg(long, value_name = "MILLIS")]
    time_budget_ms: Option<u64>,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
    /// OTLP/HTTP endpoint for trace export.
    #[arg(long, value_name = "URL")]
    otel: Option<String>,
}

impl Cli {
    fn analysis_config(&self) -> AnalysisConfig {
        AnalysisConfig {
            strategy: self.strategy.clone(),
            entry_mode: EntryMode::from_argument(&self.main_class),
            phantom_policy: self.phantom_refs,
            time_budget: self.time_budget_ms.map(Duration::from_millis),
        }
    }
}

fn parse_cli() -> Cli {
    let matches = Cli::command().after_help(strategy_help()).get_matches();
    Cli::from_arg_matches(&matches).unwrap_or_else(|err| err.exit())
}

fn strategy_help() -> String {
    let mut help = String::from("Strategies:");
    for factory in registered_strategies() {
        help.push_str(&format!("\n  {:<6}{}", factory.name, factory.description));
    }
    help
}

fn main() -> Result<()> {
    let cli = parse_cli();
    init_logging(cli.quiet);
    let telemetry = match cli.otel.as_deref() {
        Some(endpoint) => Some(Telemetry::new(endpoint)?),
        None => None,
    };
    let result = run(&cli, telemetry.as_ref());
    if let Some(telemetry) = telemetry {
        telemetry.shutdown()?;
    }
    result.map(|_| ())
}

fn run(cli: &Cli, telemetry: Option<&Telemetry>) -> Result<CallGraphReport> {
    if !cli.target.exists() {
        anyhow::bail!("input not found: {}", cli.target.display());
    }
    for entry in &cli.classpath {
        if !entry.exists() {
            anyhow::bail!("classpath entry not found: {}", entry.display());
        }
    }
    let config = cli.analysis_config();
    let mut strategy = create_strategy(&config.strategy)?;
    let mut timings = PhaseTimings::new(telemetry);

    let model = timings.measure(Phase::Load, || -> Result<ProgramModel> {
        let scan = scan_inputs(&cli.target, &cli.classpath, telemetry)?;
        info!(
            classes = scan.class_count,
            artifacts = scan.artifacts.len(),
            "loaded inputs"
        );
        ProgramModel::new(scan.classes)
    })?;
    let hierarchy = timings.measure(Phase::Hierarchy, || TypeHierarchy::build(&model))?;
    let entries = entry_points(&hierarchy, &config.entry_mode)?;
    info!(
        strategy = strategy.name(),
        entry_points = entries.len(),
        missing_types = model.missing_references().len(),
        "building call graph"
    );

    let options = BuildOptions {
        phantom_policy: config.phantom_policy,
        time_budget: config.time_budget,
    };
    let built = timings.measure(Phase::CallGraph, || {
        build_call_graph(&hierarchy, &entries, strategy.as_mut(), options)
    });
    let graph = match built {
        Ok(graph) => graph,
        Err(err) => {
            let partial = err.partial();
            partial.diagnostics.report();
            warn!(
                reachable = partial.reachable.len(),
                call_sites = partial.call_sites.len(),
                "partial call graph discarded"
            );
            return Err(err.into());
        }
    };

    let written = timings.measure(Phase::Serialize, || -> Result<CallGraphReport> {
        let report = build_report(&graph).context("failed to build call graph report")?;
        Ok(write_report(report, &cli.output)?)
    });
    graph.diagnostics.report();
    let report = match written {
        Ok(report) => report,
        Err(err) => {
            if let Some(output_error) = err.downcast_ref::<OutputError>() {
                warn!(
                    call_sites = output_error.report.document.call_sites.len(),
                    "computed call graph was not written"
                );
            }
            return Err(err);
        }
    };
    info!(
        strategy = report.strategy,
        reachable = report.reachable.len(),
        call_sites = report.document.call_sites.len(),
        edges = report.edge_count,
        warnings = report.warning_count,
        "call graph written"
    );
    if cli.timing && !cli.quiet {
        eprintln!("timing: {timings} classes={}", model.class_count());
    }
    Ok(report)
}
