use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use analysis_chain::{
    config::{Config, LogFormat},
    error::{AppError, AppResult, PipelineError, PipelineResult},
    langbase::LangbaseClient,
    pipeline::{
        stages, DrainController, DrainOutcome, EvidenceEnforcer, EvidencePolicy, ExecutionTracker,
        PipelineOrchestrator, StepExecutor, TracingNotifier,
    },
    storage::{ChainState, SqliteStorage},
};

/// Durable multi-stage analysis pipeline.
#[derive(Parser, Debug)]
#[command(name = "analysis-chain", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a new analysis request
    Create {
        /// Owner of the analysis
        #[arg(long)]
        owner: String,

        /// The design challenge to analyze
        input: String,

        /// Start running immediately
        #[arg(long)]
        run: bool,
    },

    /// Drive an analysis until it pauses, completes or fails
    Run {
        /// Instance id
        id: String,
    },

    /// Show the state of an analysis
    Status {
        /// Instance id
        id: String,

        /// Print the full chain state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Answer a pending clarification question and resume
    Answer {
        /// Instance id
        id: String,

        /// The answer text
        answer: String,
    },

    /// Cancel an analysis
    Cancel {
        /// Instance id
        id: String,
    },

    /// Resume every analysis interrupted by a shutdown or crash
    Resume,
}

impl Command {
    /// Whether the command may call the reasoning service.
    fn runs_stages(&self) -> bool {
        matches!(
            self,
            Command::Create { run: true, .. }
                | Command::Run { .. }
                | Command::Answer { .. }
                | Command::Resume
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        command = ?cli.command,
        "Analysis chain starting"
    );

    // Initialize storage
    let store = match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            Arc::new(s)
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(AppError::from(e).into());
        }
    };

    // Initialize Langbase client
    let langbase = match LangbaseClient::new(&config.langbase, &config.request) {
        Ok(c) => {
            info!(base_url = %config.langbase.base_url, "Langbase client initialized");
            Arc::new(c)
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize Langbase client");
            return Err(AppError::from(e).into());
        }
    };

    let catalog = stages::builtin_catalog(&config).map_err(AppError::from)?;

    if config.pipeline.ensure_pipes && cli.command.runs_stages() {
        info!("Ensuring stage pipes exist...");
        for stage in catalog.stages() {
            let description = format!("analysis-chain stage: {}", stage.id);
            if let Err(e) = langbase
                .ensure_pipe(&stage.pipe, &description, &stage.prompt)
                .await
            {
                error!(pipe = %stage.pipe, error = %e, "Failed to ensure pipe exists");
                return Err(AppError::from(e).into());
            }
        }
    }

    let tracker = ExecutionTracker::new();
    let executor = StepExecutor::new(
        langbase,
        store.clone(),
        tracker.clone(),
        EvidenceEnforcer::new(EvidencePolicy::from_config(&config.pipeline)),
    );
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        catalog,
        store.clone(),
        executor,
        Arc::new(TracingNotifier),
    ));
    let drain = DrainController::from_config(tracker, &config.pipeline);

    let result = execute(cli.command, orchestrator, drain).await;

    store.close().await;
    info!("Shutdown complete");
    Ok(result?)
}

async fn execute(
    command: Command,
    orchestrator: Arc<PipelineOrchestrator>,
    drain: DrainController,
) -> AppResult<()> {
    match command {
        Command::Create { owner, input, run } => {
            let id = orchestrator.create_analysis(&owner, &input).await?;
            println!("{}", id);
            if run {
                let state = drive(drain, {
                    let orchestrator = orchestrator.clone();
                    async move { orchestrator.run(&id).await }
                })
                .await?;
                print_summary(&orchestrator, &state);
            }
        }
        Command::Run { id } => {
            let state = drive(drain, {
                let orchestrator = orchestrator.clone();
                async move { orchestrator.run(&id).await }
            })
            .await?;
            print_summary(&orchestrator, &state);
        }
        Command::Status { id, json } => {
            let state = orchestrator.get_state(&id).await?;
            if json {
                let json = serde_json::to_string_pretty(&state).map_err(|e| AppError::Internal {
                    message: format!("Failed to render chain state: {}", e),
                })?;
                println!("{}", json);
            } else {
                print_summary(&orchestrator, &state);
            }
        }
        Command::Answer { id, answer } => {
            let state = drive(drain, {
                let orchestrator = orchestrator.clone();
                async move { orchestrator.submit_clarification_answer(&id, &answer).await }
            })
            .await?;
            print_summary(&orchestrator, &state);
        }
        Command::Cancel { id } => {
            let state = orchestrator.cancel_analysis(&id).await?;
            print_summary(&orchestrator, &state);
        }
        Command::Resume => {
            let states = drive(drain, {
                let orchestrator = orchestrator.clone();
                async move { orchestrator.resume_interrupted().await }
            })
            .await?;
            println!("Resumed {} analysis(es)", states.len());
            for state in &states {
                print_summary(&orchestrator, state);
            }
        }
    }
    Ok(())
}

/// Run pipeline work on its own task so a shutdown signal can drain it
/// instead of cancelling the in-flight stage.
async fn drive<T, F>(drain: DrainController, work: F) -> AppResult<T>
where
    T: Send + 'static,
    F: std::future::Future<Output = PipelineResult<T>> + Send + 'static,
{
    let mut handle = tokio::spawn(work);

    tokio::select! {
        joined = &mut handle => Ok(joined.map_err(task_failed)??),
        _ = shutdown_signal() => {
            warn!("Shutdown signal received; draining");
            match drain.drain().await {
                DrainOutcome::Drained => Ok(handle.await.map_err(task_failed)??),
                DrainOutcome::TimedOut { active } => {
                    handle.abort();
                    Err(PipelineError::ShutdownInterrupted { active }.into())
                }
            }
        }
    }
}

fn task_failed(e: tokio::task::JoinError) -> AppError {
    AppError::Internal {
        message: format!("pipeline task failed: {}", e),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn print_summary(orchestrator: &PipelineOrchestrator, state: &ChainState) {
    println!("id:        {}", state.id);
    println!("status:    {}", state.status);
    println!(
        "stage:     {}",
        state.current_stage.as_deref().unwrap_or("-")
    );
    println!(
        "progress:  {}% ({}/{})",
        orchestrator.progress(state),
        state.completed_steps.len(),
        orchestrator.catalog().len()
    );
    if let Some(pending) = state.pending_clarification() {
        println!("question:  {}", pending.question);
    }
    if let Some(err) = &state.last_error {
        println!("error:     [{}] {}", err.kind, err.message);
    }
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
