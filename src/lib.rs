//! # Analysis Chain
//!
//! A durable multi-stage analysis pipeline that runs each stage on a
//! Langbase Pipe, validates the output under uncertainty, calibrates
//! evidence claims and checkpoints every stage into SQLite so that an
//! instance resumes exactly where it stopped.
//!
//! ## Architecture
//!
//! ```text
//! CLI / scheduler → PipelineOrchestrator → StepExecutor → Langbase Pipes (HTTP)
//!                          ↓                   ↓
//!                    ExecutionTracker    schema → evidence
//!                          ↓                   ↓
//!                     DrainController    SQLite (chain state)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use analysis_chain::{Config, PipelineOrchestrator, StepExecutor};
//! use analysis_chain::langbase::LangbaseClient;
//! use analysis_chain::pipeline::{stages, EvidenceEnforcer, EvidencePolicy, ExecutionTracker, TracingNotifier};
//! use analysis_chain::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let store = Arc::new(SqliteStorage::new(&config.database).await?);
//!     let client = Arc::new(LangbaseClient::new(&config.langbase, &config.request)?);
//!     let executor = StepExecutor::new(
//!         client,
//!         store.clone(),
//!         ExecutionTracker::new(),
//!         EvidenceEnforcer::new(EvidencePolicy::from_config(&config.pipeline)),
//!     );
//!     let orchestrator = PipelineOrchestrator::new(
//!         stages::builtin_catalog(&config)?,
//!         store,
//!         executor,
//!         Arc::new(TracingNotifier),
//!     );
//!     let id = orchestrator.create_analysis("owner-1", "Cool a 200W CPU passively").await?;
//!     let state = orchestrator.run(&id).await?;
//!     println!("{}: {}", id, state.status);
//!     Ok(())
//! }
//! ```

/// Configuration loaded from environment variables.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Langbase API client and the reasoning-service seam.
pub mod langbase;
/// Stage execution, validation, evidence checks and orchestration.
pub mod pipeline;
/// System prompts for the built-in stages.
pub mod prompts;
/// Durable chain-state storage.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use pipeline::{
    DrainController, ExecutionTracker, PipelineOrchestrator, StageCatalog, StageDefinition,
    StageOutcome, StageResult, StepExecutor,
};
pub use storage::{ChainState, ChainStatus, ChainStore, SqliteStorage};
