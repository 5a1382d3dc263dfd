//! Subcommand handlers.

use clap::Args;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use colored::Colorize;
use rd_core::agents::AgentFactory;
use rd_core::config::{load_config, AppConfig, CONFIG_DIR};
use rd_core::init::{generate_project_structure, InitOptions};
use rd_core::store::{FileRunStore, InMemoryRunStore, RunStore};
use rd_core::{DriveOutcome, OrchestrationEngine};
use rd_protocol::config_models::EngineSettings;
use rd_protocol::event_models::{ProgressEvent, ProgressEventType};
use rd_protocol::run_models::{Run, RunContext, RunStatus, OPERATOR_NOTES_KEY};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio_stream::StreamExt;
use uuid::Uuid;

/// Engine settings that can be overridden per invocation.
#[derive(Args, Debug, Default, Clone)]
pub struct EngineOverrides {
    /// Minutes a paused run waits before it is cancelled; 0 disables
    #[arg(long, global = true, env = "REPODOC_PAUSE_TIMEOUT_MINUTES")]
    pub pause_timeout_minutes: Option<u64>,

    /// Hard limit for one stage attempt
    #[arg(long, global = true, env = "REPODOC_STAGE_TIMEOUT_SECONDS")]
    pub stage_timeout_seconds: Option<u64>,

    /// Retries after the first attempt of a stage
    #[arg(long, global = true, env = "REPODOC_MAX_RETRIES")]
    pub max_retries: Option<u32>,
}

impl EngineOverrides {
    fn apply(&self, settings: &mut EngineSettings) {
        if let Some(minutes) = self.pause_timeout_minutes {
            settings.pause_timeout_minutes = minutes;
        }
        if let Some(seconds) = self.stage_timeout_seconds {
            settings.stage_timeout_seconds = seconds;
        }
        if let Some(retries) = self.max_retries {
            settings.max_retries = retries;
        }
    }
}

/// `key=value`, with `value` parsed as JSON and kept as a string otherwise.
pub fn parse_context_entry(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

pub fn initial_context(
    repo_ref: String,
    personas: Vec<String>,
    extra: Vec<(String, Value)>,
) -> RunContext {
    let mut context = RunContext::new();
    context.insert("repo_ref".to_string(), Value::String(repo_ref));
    if !personas.is_empty() {
        context.insert("target_personas".to_string(), json!(personas));
    }
    context.extend(extra);
    context
}

async fn load_project(root: &Path, overrides: &EngineOverrides) -> Result<AppConfig> {
    if !root.join(CONFIG_DIR).exists() {
        return Err(eyre!(
            "no {} directory in {}; run `repodoc init` first",
            CONFIG_DIR,
            root.display()
        ));
    }
    let mut config = load_config(root)
        .await
        .wrap_err_with(|| format!("failed to load {}", root.join(CONFIG_DIR).display()))?;
    overrides.apply(&mut config.global.engine);
    Ok(config)
}

async fn open_engine(root: &Path, overrides: &EngineOverrides) -> Result<OrchestrationEngine> {
    let config = load_project(root, overrides).await?;
    let runs_dir = config.runs_dir(root);
    let store: Arc<dyn RunStore> = Arc::new(
        FileRunStore::open(&runs_dir)
            .wrap_err_with(|| format!("failed to open run store at {}", runs_dir.display()))?,
    );
    Ok(OrchestrationEngine::from_config(&config, root, store)?)
}

pub async fn init(root: &Path, force: bool, minimal: bool) -> Result<()> {
    let created = generate_project_structure(InitOptions {
        target_dir: root.to_path_buf(),
        force,
        minimal,
    })
    .await?;

    println!("{} {}", "Initialized".green().bold(), created.display());
    println!();
    println!("Next steps:");
    println!("  repodoc validate");
    println!("  repodoc run quick-scan --repo-ref <repo>");
    Ok(())
}

pub async fn validate(root: &Path) -> Result<()> {
    let config = load_project(root, &EngineOverrides::default()).await?;
    let engine = OrchestrationEngine::from_config(&config, root, Arc::new(InMemoryRunStore::new()))?;

    println!("{}", "Agents".bold());
    for profile in &config.agents {
        let agent = AgentFactory::create(profile, root);
        let availability = match (&profile.command, agent.check_availability().await) {
            (None, _) => "placeholder".dimmed(),
            (Some(_), true) => "available".green(),
            (Some(command), false) => format!("missing command '{command}'").red(),
        };
        println!("  {:<24} {}", profile.name, availability);
    }

    println!("{}", "Pipelines".bold());
    for name in engine.pipeline_names() {
        if let Some(pipeline) = engine.pipeline(&name) {
            println!(
                "  {:<24} {} stages, entry '{}'",
                name,
                pipeline.stages.len(),
                pipeline.entry
            );
        }
    }
    println!("{}", "Configuration is valid".green());
    Ok(())
}

pub async fn run(
    root: &Path,
    overrides: &EngineOverrides,
    pipeline: &str,
    context: RunContext,
) -> Result<()> {
    let engine = Arc::new(open_engine(root, overrides).await?);
    let run = engine.create_run(pipeline).await?;
    println!("{} run {} of '{}'", "Started".green().bold(), run.run_id, pipeline);
    engine.activate(run.run_id, context).await?;
    drive_with_progress(engine, run.run_id, 1).await
}

pub async fn drive(root: &Path, overrides: &EngineOverrides, run_id: Uuid) -> Result<()> {
    let engine = Arc::new(open_engine(root, overrides).await?);
    let seen = engine.store().events_since(run_id, 1).await?.len() as u64;
    drive_with_progress(engine, run_id, seen + 1).await
}

/// Drive the run in a task while printing its events as they arrive.
async fn drive_with_progress(engine: Arc<OrchestrationEngine>, run_id: Uuid, from: u64) -> Result<()> {
    let mut driver = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.drive(run_id).await })
    };
    let mut events = engine.subscribe(run_id, from);
    let mut next = from;
    let mut pause_requested = false;

    let outcome = loop {
        tokio::select! {
            joined = &mut driver => break joined.wrap_err("driver task failed")??,
            Some(event) = events.next() => {
                let event = event?;
                next = event.sequence_number + 1;
                print_event(&event);
            }
            _ = tokio::signal::ctrl_c(), if !pause_requested => {
                pause_requested = true;
                match engine.controller().request_pause(run_id, None).await {
                    Ok(_) => eprintln!("{}", "Pause requested; waiting for the current stage to finish".yellow()),
                    Err(e) => eprintln!("{} {}", "warning:".yellow(), e),
                }
            }
        }
    };

    for event in engine.store().events_since(run_id, next).await? {
        print_event(&event);
    }

    let run = engine.get_run(run_id).await?;
    match outcome {
        DriveOutcome::Completed => {
            let keys: Vec<&String> = run.context.keys().collect();
            println!("{} context keys: {:?}", "Completed.".green().bold(), keys);
            Ok(())
        }
        DriveOutcome::Paused => {
            println!(
                "{} at stage '{}'. Resume with `repodoc resume {}` and continue with `repodoc drive {}`.",
                "Paused".yellow().bold(),
                run.current_stage,
                run_id,
                run_id
            );
            Ok(())
        }
        DriveOutcome::Cancelled => {
            println!("{} {}", "Cancelled".yellow().bold(), cancel_reason(&run));
            Ok(())
        }
        DriveOutcome::Failed => match &run.failure {
            Some(failure) => Err(eyre!(
                "run failed at stage '{}' after {} attempt(s): {}",
                failure.stage,
                failure.attempts,
                failure.message
            )),
            None => Err(eyre!("run failed")),
        },
    }
}

pub async fn status(root: &Path, overrides: &EngineOverrides, run_id: Uuid, as_json: bool) -> Result<()> {
    let engine = open_engine(root, overrides).await?;
    let run = engine.get_run(run_id).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    println!("{:<12} {}", "run".bold(), run.run_id);
    println!("{:<12} {}", "pipeline".bold(), run.pipeline_name);
    println!("{:<12} {}", "status".bold(), colored_status(run.status));
    println!("{:<12} {}", "stage".bold(), run.current_stage);
    println!("{:<12} {}", "completed".bold(), run.completed_stages.join(" -> "));
    let keys: Vec<&String> = run.context.keys().collect();
    println!("{:<12} {:?}", "context".bold(), keys);
    if run.has_pending_pause() {
        println!("{:<12} pending at next boundary", "pause".bold());
    }
    if let Some(deadline) = run.pause_deadline {
        println!("{:<12} {}", "deadline".bold(), deadline.to_rfc3339());
    }
    if run.status == RunStatus::Cancelled {
        println!("{:<12} {}", "reason".bold(), cancel_reason(&run));
    }
    if let Some(failure) = &run.failure {
        println!(
            "{:<12} {:?} at '{}' after {} attempt(s): {}",
            "failure".bold(),
            failure.kind,
            failure.stage,
            failure.attempts,
            failure.message
        );
    }
    Ok(())
}

pub async fn list(root: &Path, overrides: &EngineOverrides) -> Result<()> {
    let engine = open_engine(root, overrides).await?;
    let mut runs = engine.list_runs().await?;
    if runs.is_empty() {
        println!("No runs");
        return Ok(());
    }
    runs.sort_by_key(|run| run.created_at);
    for run in runs {
        println!(
            "{}  {:<22} {:<10} {:<14} {}",
            run.run_id,
            run.pipeline_name,
            colored_status(run.status),
            run.current_stage,
            run.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub async fn events(
    root: &Path,
    overrides: &EngineOverrides,
    run_id: Uuid,
    from: u64,
    follow: bool,
) -> Result<()> {
    let engine = open_engine(root, overrides).await?;
    if follow {
        let mut stream = engine.subscribe(run_id, from);
        while let Some(event) = stream.next().await {
            print_event(&event?);
        }
    } else {
        for event in engine.store().events_since(run_id, from).await? {
            print_event(&event);
        }
    }
    Ok(())
}

pub async fn pause(
    root: &Path,
    overrides: &EngineOverrides,
    run_id: Uuid,
    timeout_minutes: Option<u64>,
) -> Result<()> {
    let engine = open_engine(root, overrides).await?;
    let run = engine.controller().request_pause(run_id, timeout_minutes).await?;
    if run.status == RunStatus::Paused {
        println!("{} at stage '{}'", "Paused".yellow().bold(), run.current_stage);
    } else {
        println!(
            "{} run will pause after stage '{}' finishes",
            "Pause requested:".yellow().bold(),
            run.current_stage
        );
    }
    if let Some(deadline) = run.pause_deadline {
        println!("Cancelled automatically if not resumed by {}", deadline.to_rfc3339());
    }
    Ok(())
}

pub async fn resume(root: &Path, overrides: &EngineOverrides, run_id: Uuid) -> Result<()> {
    let engine = open_engine(root, overrides).await?;
    let run = engine.controller().request_resume(run_id).await?;
    println!(
        "{} at stage '{}'. Continue with `repodoc drive {}`.",
        "Resumed".green().bold(),
        run.current_stage,
        run_id
    );
    Ok(())
}

pub async fn cancel(root: &Path, overrides: &EngineOverrides, run_id: Uuid) -> Result<()> {
    let engine = open_engine(root, overrides).await?;
    let run = engine.controller().request_cancel(run_id).await?;
    println!("{} at stage '{}'", "Cancelled".yellow().bold(), run.current_stage);
    Ok(())
}

pub async fn restart(root: &Path, overrides: &EngineOverrides, run_id: Uuid) -> Result<()> {
    let engine = Arc::new(open_engine(root, overrides).await?);
    let run = engine.restart_run(run_id).await?;
    println!(
        "{} {} from {} at stage '{}'",
        "Restarted as".green().bold(),
        run.run_id,
        run_id,
        run.current_stage
    );
    drive_with_progress(engine, run.run_id, 1).await
}

pub async fn add_context(
    root: &Path,
    overrides: &EngineOverrides,
    run_id: Uuid,
    text: &str,
    scope: Option<&str>,
) -> Result<()> {
    let engine = open_engine(root, overrides).await?;
    let run = engine.controller().add_context(run_id, text, scope).await?;
    let count = run
        .context
        .get(OPERATOR_NOTES_KEY)
        .and_then(|notes| notes.as_array())
        .map_or(0, Vec::len);
    println!(
        "{} to run {} ({} note(s), status {})",
        "Context added".green().bold(),
        run_id,
        count,
        colored_status(run.status)
    );
    Ok(())
}

fn cancel_reason(run: &Run) -> String {
    run.cancel_reason
        .and_then(|reason| serde_json::to_value(reason).ok())
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn colored_status(status: RunStatus) -> colored::ColoredString {
    let label = status.as_str();
    match status {
        RunStatus::Completed => label.green(),
        RunStatus::Failed => label.red(),
        RunStatus::Cancelled | RunStatus::Paused => label.yellow(),
        RunStatus::Running => label.cyan(),
        RunStatus::Pending => label.normal(),
    }
}

fn print_event(event: &ProgressEvent) {
    let label = event.event_type.as_str();
    let label = match event.event_type {
        ProgressEventType::Completed | ProgressEventType::StageCompleted => label.green(),
        ProgressEventType::StageFailed => label.red(),
        ProgressEventType::Paused | ProgressEventType::Resumed | ProgressEventType::Cancelled => {
            label.yellow()
        }
        ProgressEventType::StageStarted => label.cyan(),
        ProgressEventType::Log => label.dimmed(),
    };
    println!(
        "{:>4} {} {:<16} {:<14} {}",
        event.sequence_number,
        event.timestamp.format("%H:%M:%S"),
        label,
        event.stage().unwrap_or("-"),
        describe(event)
    );
}

fn describe(event: &ProgressEvent) -> String {
    let payload = &event.payload;
    match event.event_type {
        ProgressEventType::Log => payload["message"].as_str().unwrap_or_default().to_string(),
        ProgressEventType::StageStarted => format!(
            "attempt {}/{}",
            payload["attempt"], payload["max_attempts"]
        ),
        ProgressEventType::StageCompleted => format!(
            "outputs {} -> {}",
            payload["outputs"], payload["next"]
        ),
        ProgressEventType::StageFailed => format!(
            "{} after {} attempt(s): {}",
            payload["kind"],
            payload["attempts"],
            payload["message"].as_str().unwrap_or_default()
        ),
        ProgressEventType::Cancelled => format!("reason {}", payload["reason"]),
        ProgressEventType::Paused => match payload.get("deadline") {
            Some(Value::String(deadline)) => format!("until {deadline}"),
            _ => "no deadline".to_string(),
        },
        ProgressEventType::Resumed => String::new(),
        ProgressEventType::Completed => format!("stages {}", payload["stages"]),
    }
}
