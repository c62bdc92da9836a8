//! CLI binary for converting manual test cases into automation artifacts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use autoscribe_pipeline::{
    run_bulk, ArtifactStore, AutoscribeConfig, BulkOptions, BulkRequest, EventEmitter,
    FsArtifactStore, JobStatus, PipelineEvent, PipelineOrchestrator, TaskRequest, TestCaseType,
};
use autoscribe_types::{ElementPropertyRecord, Stage, TaskIdentity};

#[derive(Parser)]
#[command(
    name = "autoscribe",
    version,
    about = "Checkpointed manual-to-automated test conversion"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "AUTOSCRIBE_CONFIG", default_value = "autoscribe.toml")]
    config: PathBuf,

    /// Override the checkpoint root
    #[arg(long, global = true, env = "AUTOSCRIBE_ARTIFACT_ROOT")]
    artifact_root: Option<PathBuf>,

    /// Override the manual test-case root
    #[arg(long, global = true, env = "AUTOSCRIBE_MANUAL_ROOT")]
    manual_root: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one test case through every stage, resuming from checkpoints
    Run {
        #[arg(long)]
        story: String,

        #[arg(long)]
        test: String,

        /// Test-case document handed to the planner (default: inferred from the id prefix)
        #[arg(long)]
        test_case_file: Option<String>,

        /// Discard existing checkpoints first
        #[arg(long)]
        fresh: bool,
    },

    /// Run many test cases of one story with bounded retries
    Bulk {
        #[arg(long)]
        story: String,

        /// smoke or regression
        #[arg(long = "type", value_name = "TYPE")]
        test_case_type: String,

        /// Test ids to run (default: every id in the story's test-case document)
        #[arg(long = "test", value_name = "ID")]
        tests: Vec<String>,

        /// Retries per test after the first attempt
        #[arg(long)]
        max_retries: Option<u32>,

        /// Write the run report as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Derive selectors for element records read from a JSON file
    Derive {
        /// JSON array of element records, or a trace payload with `elements`
        input: PathBuf,
    },

    /// Show which stages of a task are checkpointed
    Status {
        #[arg(long)]
        story: String,

        #[arg(long)]
        test: String,
    },

    /// Delete every checkpoint of a task
    Reset {
        #[arg(long)]
        story: String,

        #[arg(long)]
        test: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing; RUST_LOG takes precedence over --verbose.
    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run {
            story,
            test,
            test_case_file,
            fresh,
        } => {
            cmd_run(&config, &story, &test, test_case_file, fresh).await?;
        }
        Commands::Bulk {
            story,
            test_case_type,
            tests,
            max_retries,
            report,
        } => {
            cmd_bulk(&config, &story, &test_case_type, tests, max_retries, report.as_deref())
                .await?;
        }
        Commands::Derive { input } => {
            cmd_derive(&config, &input)?;
        }
        Commands::Status { story, test } => {
            cmd_status(&config, &story, &test).await?;
        }
        Commands::Reset { story, test } => {
            cmd_reset(&config, &story, &test).await?;
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<AutoscribeConfig> {
    let mut config = AutoscribeConfig::load(&cli.config)?;
    if let Some(root) = &cli.artifact_root {
        config.artifact_root = root.clone();
    }
    if let Some(root) = &cli.manual_root {
        config.manual_root = root.clone();
    }
    tracing::debug!(
        config = %cli.config.display(),
        artifact_root = %config.artifact_root.display(),
        manual_root = %config.manual_root.display(),
        "Configuration loaded"
    );
    Ok(config)
}

fn store(config: &AutoscribeConfig) -> Arc<dyn ArtifactStore> {
    Arc::new(FsArtifactStore::new(&config.artifact_root))
}

fn build_orchestrator(config: &AutoscribeConfig) -> anyhow::Result<PipelineOrchestrator> {
    let registry = config.build_registry()?;
    let missing = registry.missing();
    if !missing.is_empty() {
        let names: Vec<&str> = missing.iter().map(|s| s.as_str()).collect();
        anyhow::bail!(
            "No worker configured for stage(s): {}. Add a [workers.<stage>] section per stage to the configuration file",
            names.join(", ")
        );
    }
    Ok(PipelineOrchestrator::new(store(config), registry)?)
}

async fn cmd_run(
    config: &AutoscribeConfig,
    story: &str,
    test: &str,
    test_case_file: Option<String>,
    fresh: bool,
) -> anyhow::Result<()> {
    let task = TaskIdentity::new(story, test)?;
    let test_case_file = match test_case_file {
        Some(name) => name,
        None => TestCaseType::from_test_id(test)
            .map(TestCaseType::file_name)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Cannot infer the test-case document from '{test}'; pass --test-case-file"
                )
            })?,
    };

    let orchestrator = build_orchestrator(config)?;
    if fresh {
        orchestrator.store().clear(&task).await?;
        println!("Cleared checkpoints for {task}");
    }

    println!("Running {task} ({test_case_file})");
    let run = orchestrator
        .run(&TaskRequest::new(task, test_case_file))
        .await;

    for marker in &run.markers {
        println!("{marker}");
    }
    if let Some(manifest) = &run.manifest {
        for file in &manifest.files {
            println!("  {}", file.display());
        }
    }
    println!("{}", run.marker());

    if !run.is_completed() {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_bulk(
    config: &AutoscribeConfig,
    story: &str,
    test_case_type: &str,
    tests: Vec<String>,
    max_retries: Option<u32>,
    report_path: Option<&Path>,
) -> anyhow::Result<()> {
    let request = BulkRequest {
        story_id: story.to_string(),
        test_case_type: test_case_type.parse()?,
        test_ids: tests,
        max_retries_per_test: max_retries,
    };

    let events = EventEmitter::default();
    let mut rx = events.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            match event {
                PipelineEvent::JobRetrying {
                    task,
                    attempt,
                    max_attempts,
                } => println!("[{}] retrying (attempt {attempt}/{max_attempts})", task.test_id),
                PipelineEvent::JobFinished {
                    task,
                    status,
                    attempts,
                } => {
                    let label = match status {
                        JobStatus::Succeeded => "succeeded",
                        JobStatus::Failed => "FAILED",
                        JobStatus::Pending | JobStatus::Running => "unfinished",
                    };
                    println!("[{}] {label} after {attempts} attempt(s)", task.test_id);
                }
                _ => {}
            }
        }
    });

    let orchestrator = build_orchestrator(config)?.with_events(events);
    let report = run_bulk(&orchestrator, &request, &BulkOptions::from(config)).await?;
    drop(orchestrator);
    let _ = printer.await;

    println!("\nRun {}", report.run_id);
    for job in &report.jobs {
        match &job.error {
            Some(error) if job.status == JobStatus::Failed => {
                println!("  {:<16} failed  {error}", job.task.test_id)
            }
            _ => println!("  {:<16} ok", job.task.test_id),
        }
    }
    if let Some(path) = report_path {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        println!("Report: {}", path.display());
    }
    println!("{}", report.marker());

    if !report.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

/// Either a bare list of records or anything carrying an `elements` list.
#[derive(Deserialize)]
#[serde(untagged)]
enum DeriveInput {
    Records(Vec<ElementPropertyRecord>),
    Trace { elements: Vec<ElementPropertyRecord> },
}

fn cmd_derive(config: &AutoscribeConfig, input: &Path) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(input)?;
    let records = match serde_json::from_str::<DeriveInput>(&source)? {
        DeriveInput::Records(records) | DeriveInput::Trace { elements: records } => records,
    };

    let payload = config.selector_engine()?.derive_all(&records);
    println!("{}", serde_json::to_string_pretty(&payload)?);
    for key in &payload.ambiguous {
        eprintln!("warning: only a tag selector could be derived for '{key}'");
    }
    Ok(())
}

async fn cmd_status(config: &AutoscribeConfig, story: &str, test: &str) -> anyhow::Result<()> {
    let task = TaskIdentity::new(story, test)?;
    let store = store(config);

    println!("Task: {task}");
    let mut done = 0;
    for stage in Stage::ALL {
        if !store.exists(&task, stage).await? {
            println!("  {:<18} pending", stage.as_str());
            continue;
        }
        match store.read(&task, stage).await {
            Ok(artifact) => {
                done += 1;
                let at = artifact.created_at.with_timezone(&chrono::Local);
                println!(
                    "  {:<18} done     {}",
                    stage.as_str(),
                    at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Err(e) => println!("  {:<18} CORRUPT  {e}", stage.as_str()),
        }
    }
    println!("{done}/{} stages checkpointed", Stage::ALL.len());
    Ok(())
}

async fn cmd_reset(config: &AutoscribeConfig, story: &str, test: &str) -> anyhow::Result<()> {
    let task = TaskIdentity::new(story, test)?;
    store(config).clear(&task).await?;
    println!("Cleared checkpoints for {task}");
    Ok(())
}
