//! repodoc - repository analysis orchestrator
//!
//! Scaffolds `.repodoc/` projects, starts analysis runs and controls them.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "repodoc")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Project root containing `.repodoc/`
    #[arg(long, global = true, env = "REPODOC_ROOT", default_value = ".")]
    root: PathBuf,

    #[command(flatten)]
    overrides: commands::EngineOverrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create `.repodoc/` with the default agents and pipelines
    Init {
        /// Overwrite an existing `.repodoc/` directory
        #[arg(long)]
        force: bool,

        /// Only write the quick-scan pipeline and its agents
        #[arg(long)]
        minimal: bool,
    },

    /// Load and validate the project configuration
    Validate,

    /// Start a run and drive it in the foreground
    ///
    /// Ctrl-C requests a pause at the next stage boundary.
    Run {
        /// Pipeline name
        pipeline: String,

        /// Repository reference handed to the first stage
        #[arg(long)]
        repo_ref: String,

        /// Report personas to produce (sde, pm); all when omitted
        #[arg(long = "persona")]
        personas: Vec<String>,

        /// Extra context entries as key=value; values are parsed as JSON when possible
        #[arg(long = "context", value_parser = commands::parse_context_entry)]
        context: Vec<(String, serde_json::Value)>,
    },

    /// Continue driving an existing run (after a resume or a crash)
    Drive {
        run_id: Uuid,
    },

    /// Show one run
    Status {
        run_id: Uuid,

        /// Print the full record as JSON
        #[arg(long)]
        json: bool,
    },

    /// List runs
    #[command(alias = "ls")]
    List,

    /// Print a run's progress events
    Events {
        run_id: Uuid,

        /// First sequence number to print
        #[arg(long, default_value = "1")]
        from: u64,

        /// Keep printing until the run ends
        #[arg(short, long)]
        follow: bool,
    },

    /// Pause a running run at its next stage boundary
    Pause {
        run_id: Uuid,

        /// Auto-cancel after this many minutes paused; 0 disables
        #[arg(long)]
        timeout_minutes: Option<u64>,
    },

    /// Resume a paused run
    Resume {
        run_id: Uuid,
    },

    /// Cancel a run
    Cancel {
        run_id: Uuid,
    },

    /// Start a new run from where a cancelled or failed run stopped, and drive it
    Restart {
        run_id: Uuid,
    },

    /// Give a live run an instruction that later stages can read
    AddContext {
        run_id: Uuid,

        text: String,

        /// What the note is about, e.g. a stage name
        #[arg(long)]
        scope: Option<String>,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "repodoc=info,rd_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let root = cli.root;
    let overrides = cli.overrides;

    match cli.command {
        Commands::Init { force, minimal } => commands::init(&root, force, minimal).await,
        Commands::Validate => commands::validate(&root).await,
        Commands::Run {
            pipeline,
            repo_ref,
            personas,
            context,
        } => {
            let ctx = commands::initial_context(repo_ref, personas, context);
            commands::run(&root, &overrides, &pipeline, ctx).await
        }
        Commands::Drive { run_id } => commands::drive(&root, &overrides, run_id).await,
        Commands::Status { run_id, json } => commands::status(&root, &overrides, run_id, json).await,
        Commands::List => commands::list(&root, &overrides).await,
        Commands::Events {
            run_id,
            from,
            follow,
        } => commands::events(&root, &overrides, run_id, from, follow).await,
        Commands::Pause {
            run_id,
            timeout_minutes,
        } => commands::pause(&root, &overrides, run_id, timeout_minutes).await,
        Commands::Resume { run_id } => commands::resume(&root, &overrides, run_id).await,
        Commands::Cancel { run_id } => commands::cancel(&root, &overrides, run_id).await,
        Commands::Restart { run_id } => commands::restart(&root, &overrides, run_id).await,
        Commands::AddContext {
            run_id,
            text,
            scope,
        } => commands::add_context(&root, &overrides, run_id, &text, scope.as_deref()).await,
    }
}
