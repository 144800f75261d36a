//! Forge CLI - autonomous code-change pipeline
//!
//! Usage:
//!   forge init [path]           Write a default forge.toml
//!   forge plan <goal>           Decompose a goal into steps
//!   forge run <goal>            Run a goal end-to-end against a repository
//!   forge scan <file>           Run the security rule catalog over a file or diff

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use forge_agents::SecurityAnalyzer;
use forge_context::DirSnapshot;
use forge_core::{Goal, Patch, PipelineConfig, StepOutcome};
use forge_orchestrator::{InMemoryRecordStore, Orchestrator};
use forge_provider::{CompletionProvider, HeuristicProvider, ProviderGateway};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

mod runner;

use runner::CommandBuildRunner;

#[derive(Parser)]
#[command(name = "forge")]
#[command(author, version, about = "Autonomous code-change pipeline")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default forge.toml to the repository
    Init {
        /// Repository path (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Decompose a goal into an execution plan without running it
    Plan {
        /// Development goal in natural language
        goal: String,
    },

    /// Run a goal end-to-end against a repository snapshot
    Run {
        /// Development goal in natural language
        goal: String,

        /// Repository path (defaults to current directory)
        #[arg(short, long, default_value = ".")]
        repo: PathBuf,

        /// Path hint to bias context retrieval (repeatable)
        #[arg(long = "hint", value_name = "PATH")]
        hints: Vec<String>,

        /// Write the full execution record as JSON to this file
        #[arg(long, value_name = "FILE")]
        record_out: Option<PathBuf>,
    },

    /// Run the security rule catalog over a source file or a unified diff
    Scan {
        /// File to scan; diffs are scanned as-is, source files as all-new
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG overrides the verbosity flag
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Init { path } => cmd_init(path),
        Commands::Plan { goal } => cmd_plan(goal).await,
        Commands::Run {
            goal,
            repo,
            hints,
            record_out,
        } => cmd_run(goal, repo, hints, record_out).await,
        Commands::Scan { file } => cmd_scan(file).await,
    }
}

fn gateway(config: &PipelineConfig) -> Arc<ProviderGateway> {
    Arc::new(ProviderGateway::new(
        vec![Arc::new(HeuristicProvider::new()) as Arc<dyn CompletionProvider>],
        config.provider.clone(),
    ))
}

fn cmd_init(path: PathBuf) -> Result<()> {
    PipelineConfig::write_default(&path).context("Failed to write forge.toml")?;
    println!("Wrote default configuration to {:?}", path.join("forge.toml"));
    Ok(())
}

async fn cmd_plan(goal_text: String) -> Result<()> {
    let config = PipelineConfig::default();
    let planner = forge_agents::Planner::new(gateway(&config));

    let goal = Goal::new(goal_text, ".");
    let plan = planner.plan(&goal).await?;

    println!("Plan ({} steps):", plan.steps.len());
    for (i, step) in plan.steps.iter().enumerate() {
        let gates: Vec<String> = step.required_gates.iter().map(|g| g.to_string()).collect();
        println!(
            "  {}. {} [risk: {}] [gates: {}]",
            i + 1,
            step.description,
            step.risk_hint,
            gates.join(", ")
        );
    }

    Ok(())
}

async fn cmd_run(
    goal_text: String,
    repo: PathBuf,
    hints: Vec<String>,
    record_out: Option<PathBuf>,
) -> Result<()> {
    info!("Running goal against {:?}", repo);

    let config = PipelineConfig::load_or_default(&repo)?;
    let repo_ref = repo.to_string_lossy().into_owned();

    let orchestrator = Orchestrator::new(
        gateway(&config),
        Arc::new(DirSnapshot::new(&repo)),
        Arc::new(CommandBuildRunner::new(&repo)),
        Arc::new(InMemoryRecordStore::new()),
        config,
    );

    let goal = Goal::new(goal_text, repo_ref).with_path_hints(hints);
    let record = orchestrator.execute(goal).await?;

    println!("Execution {}", record.execution_id);
    println!("Status: {:?}", record.status);
    println!();

    for step_record in &record.steps {
        let outcome = step_record
            .outcome()
            .map(|o| o.to_string())
            .unwrap_or_else(|| "unfinished".to_string());
        println!("Step: {}", step_record.step.description);
        println!("  Outcome: {}", outcome);
        println!("  Attempts: {}", step_record.attempts.len());

        if let Some(risk) = &step_record.risk {
            println!("  Risk score: {:.3}", risk.score);
            for recommendation in &risk.recommendations {
                println!("    - {}", recommendation);
            }
        }

        if let Some(attempt) = step_record.latest_attempt() {
            for finding in &attempt.findings {
                let location = finding
                    .location
                    .as_ref()
                    .map(|l| format!("{}:{}", l.path, l.line.unwrap_or(0)))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  [{}] {} at {}: {}",
                    finding.severity, finding.category, location, finding.message
                );
            }

            if matches!(step_record.outcome(), Some(StepOutcome::Accepted)) {
                println!("  Files: {}", attempt.patch.changed_files().join(", "));
            }
        }
        println!();
    }

    if let Some(path) = record_out {
        let json = serde_json::to_string_pretty(&record)?;
        tokio::fs::write(&path, json).await?;
        println!("Record written to {:?}", path);
    }

    Ok(())
}

async fn cmd_scan(file: PathBuf) -> Result<()> {
    let content = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read {:?}", file))?;

    let diff = if looks_like_diff(&content) {
        content
    } else {
        as_new_file_diff(&file, &content)
    };

    let analyzer = SecurityAnalyzer::new(forge_core::GateConfig::default());
    let patch = Patch::new(forge_core::StepId::new_v4(), diff, "scan");
    let findings = analyzer.analyze(&patch).await?;

    if findings.is_empty() {
        println!("No findings");
        return Ok(());
    }

    println!("Findings ({}):", findings.len());
    for finding in &findings {
        let location = finding
            .location
            .as_ref()
            .map(|l| format!("{}:{}", l.path, l.line.unwrap_or(0)))
            .unwrap_or_else(|| "-".to_string());
        let cwe = finding.cwe.as_deref().unwrap_or("-");
        println!(
            "  [{}] {} at {} ({}): {}",
            finding.severity, finding.category, location, cwe, finding.message
        );
    }

    let blocking = findings.iter().filter(|f| f.blocking).count();
    if blocking > 0 {
        println!("\n{} blocking finding(s)", blocking);
        std::process::exit(1);
    }

    Ok(())
}

fn looks_like_diff(content: &str) -> bool {
    content.lines().any(|l| l.starts_with("+++ "))
        && content.lines().any(|l| l.starts_with("--- "))
}

/// Wrap a plain source file as an all-added diff so the line scanner
/// applies to every line
fn as_new_file_diff(path: &std::path::Path, content: &str) -> String {
    let name = path.to_string_lossy();
    let line_count = content.lines().count();
    let mut diff = format!("--- a/{name}\n+++ b/{name}\n@@ -0,0 +1,{line_count} @@\n");
    for line in content.lines() {
        diff.push('+');
        diff.push_str(line);
        diff.push('\n');
    }
    diff
}
