//! CLI subcommands: init, validate, graph, plan, apply.

use crate::core::engine::{self, CancelToken, RunOptions};
use crate::core::error::{Error, Result};
use crate::core::graph::{self, Graph};
use crate::core::report::RunState;
use crate::core::types::{CairnConfig, FailurePolicy, PlanAction};
use crate::core::{parser, planner};
use crate::providers::ProviderRegistry;
use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new cairn project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate cairn.yaml and its dependency graph without touching anything
    Validate {
        /// Path to cairn.yaml
        #[arg(short, long, default_value = "cairn.yaml")]
        file: PathBuf,
    },

    /// Print the convergence order
    Graph {
        /// Path to cairn.yaml
        #[arg(short, long, default_value = "cairn.yaml")]
        file: PathBuf,
    },

    /// Show what apply would change (inspect and diff only)
    Plan {
        /// Path to cairn.yaml
        #[arg(short, long, default_value = "cairn.yaml")]
        file: PathBuf,

        /// Use in-memory providers instead of the target host and cloud
        #[arg(long)]
        simulate: bool,
    },

    /// Converge resources to their declared state
    Apply {
        /// Path to cairn.yaml
        #[arg(short, long, default_value = "cairn.yaml")]
        file: PathBuf,

        /// Use in-memory providers instead of the target host and cloud
        #[arg(long)]
        simulate: bool,

        /// Keep converging resources independent of a failure
        #[arg(long)]
        best_effort: bool,

        /// Concurrent workers (overrides policy.workers)
        #[arg(long)]
        workers: Option<usize>,

        /// Per provider call timeout in seconds (overrides policy.timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,

        /// State directory for the provenance event log
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands, cancel: CancelToken) -> Result<()> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Graph { file } => cmd_graph(&file),
        Commands::Plan { file, simulate } => cmd_plan(&file, simulate),
        Commands::Apply {
            file,
            simulate,
            best_effort,
            workers,
            timeout,
            state_dir,
        } => {
            let config = parser::parse_and_validate(&file)?;
            let mut options = RunOptions::from_policy(&config.policy);
            if best_effort {
                options.policy = FailurePolicy::BestEffort;
            }
            if let Some(w) = workers {
                options.workers = w.max(1);
            }
            if let Some(t) = timeout {
                options.timeout = Duration::from_secs(t.max(1));
            }
            if config.policy.event_log {
                options.event_log = Some(state_dir);
            }
            options.cancel = cancel;
            cmd_apply(&file, &config, simulate, &options)
        }
    }
}

fn cmd_init(path: &Path) -> Result<()> {
    let config_path = path.join("cairn.yaml");
    if config_path.exists() {
        return Err(Error::config(format!("{} already exists", config_path.display())));
    }

    let templates = path.join("templates");
    std::fs::create_dir_all(&templates)?;

    let template = r#"version: "1.0"
name: my-infrastructure
description: "Managed by cairn"

params: {}

target:
  addr: localhost

templates: templates

resources: []

policy:
  failure: fail_fast
  workers: 1
  timeout_secs: 300
"#;
    std::fs::write(&config_path, template)?;

    println!("Initialized cairn project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", templates.display());
    Ok(())
}

/// Parse, validate, declare and order a config file.
fn load_graph(file: &Path) -> Result<(CairnConfig, Graph)> {
    let config = parser::parse_and_validate(file)?;
    let decls = parser::load_declarations(&config)?;
    let graph = graph::build_graph(&decls)?;
    Ok((config, graph))
}

fn cmd_validate(file: &Path) -> Result<()> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        return Err(Error::config(format!("{} validation error(s)", errors.len())));
    }

    let decls = parser::load_declarations(&config)?;
    let graph = graph::build_graph(&decls)?;
    println!(
        "OK: {} ({} declarations, {} resources, {} kinds)",
        config.name,
        config.resources.len(),
        graph.len(),
        graph.kinds().len()
    );
    Ok(())
}

fn cmd_graph(file: &Path) -> Result<()> {
    let (config, graph) = load_graph(file)?;
    println!("Convergence order for {} ({} resources):", config.name, graph.len());
    for (pos, resource) in graph.resources().iter().enumerate() {
        let after: Vec<&str> = graph
            .predecessors(pos)
            .iter()
            .map(|&p| graph.resource(p).reference())
            .collect();
        if after.is_empty() {
            println!("  {:>3}. {}", pos + 1, resource.reference());
        } else {
            println!("  {:>3}. {}  (after {})", pos + 1, resource.reference(), after.join(", "));
        }
    }
    println!("Fingerprint: {}", graph.fingerprint());
    Ok(())
}

/// Pick providers: in-memory when simulating, the target host otherwise.
fn registry_for(config: &CairnConfig, file: &Path, simulate: bool) -> ProviderRegistry {
    if simulate {
        return ProviderRegistry::simulated();
    }
    let base = file.parent().unwrap_or_else(|| Path::new("."));
    let templates = base.join(config.templates.as_deref().unwrap_or("templates"));
    ProviderRegistry::host(config.target.clone(), templates)
}

fn cmd_plan(file: &Path, simulate: bool) -> Result<()> {
    let (config, graph) = load_graph(file)?;
    let registry = registry_for(&config, file, simulate);
    let timeout = Duration::from_secs(config.policy.timeout_secs);
    let plan = planner::plan(&config.name, &graph, &registry, timeout)?;

    println!("Planning: {} ({} resources)", plan.name, plan.changes.len());
    println!();
    for change in &plan.changes {
        let symbol = match change.action {
            PlanAction::Create => "+",
            PlanAction::Update => "~",
            PlanAction::Destroy => "-",
            PlanAction::NoOp => " ",
            PlanAction::Deferred => "?",
        };
        println!("  {} {}", symbol, change.description);
    }
    println!();
    println!(
        "Plan: {} to add, {} to change, {} to destroy, {} unchanged, {} deferred.",
        plan.to_create, plan.to_update, plan.to_destroy, plan.unchanged, plan.deferred
    );
    Ok(())
}

fn cmd_apply(file: &Path, config: &CairnConfig, simulate: bool, options: &RunOptions) -> Result<()> {
    let decls = parser::load_declarations(config)?;
    let graph = graph::build_graph(&decls)?;
    let registry = registry_for(config, file, simulate);
    info!(config = %config.name, simulate, "applying");

    let report = engine::converge(&graph, &registry, options)?;
    println!("{}", report);

    if report.success() && report.state == RunState::Completed {
        Ok(())
    } else {
        Err(Error::RunFailed {
            failed: report.failed_count(),
            skipped: report.skipped.len(),
        })
    }
}
