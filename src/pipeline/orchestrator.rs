//! Instance state machine: drives stages in order and maps stage outcomes
//! onto persisted status changes.

use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::executor::StepExecutor;
use super::notify::StageNotifier;
use super::tracker::ExecutionTracker;
use super::{StageCatalog, StageOutcome, StageResult};
use crate::error::{ErrorKind, PipelineError, PipelineResult, StageError};
use crate::storage::{ChainState, ChainStatus, ChainStore, LastError, StatusUpdate};

/// Drives analysis instances through the stage catalog.
///
/// Every decision is derived from the persisted [`ChainState`], so a fresh
/// orchestrator over the same store picks up exactly where a crashed one
/// stopped.
pub struct PipelineOrchestrator {
    catalog: StageCatalog,
    store: Arc<dyn ChainStore>,
    executor: StepExecutor,
    notifier: Arc<dyn StageNotifier>,
}

impl PipelineOrchestrator {
    pub fn new(
        catalog: StageCatalog,
        store: Arc<dyn ChainStore>,
        executor: StepExecutor,
        notifier: Arc<dyn StageNotifier>,
    ) -> Self {
        Self {
            catalog,
            store,
            executor,
            notifier,
        }
    }

    pub fn catalog(&self) -> &StageCatalog {
        &self.catalog
    }

    pub fn tracker(&self) -> &ExecutionTracker {
        self.executor.tracker()
    }

    /// Register a new analysis request and return its instance id.
    pub async fn create_analysis(&self, owner_id: &str, input: &str) -> PipelineResult<String> {
        let id = Uuid::new_v4().to_string();
        let state = self.store.create_if_absent(&id, owner_id, input).await?;
        info!(instance_id = %id, owner_id, "Analysis created");
        self.notifier.status_changed(&state);
        Ok(id)
    }

    pub async fn get_state(&self, id: &str) -> PipelineResult<ChainState> {
        Ok(self.store.load_required(id).await?)
    }

    /// Percentage of catalog stages completed.
    pub fn progress(&self, state: &ChainState) -> u8 {
        self.catalog.progress_percent(state)
    }

    /// Drive an instance until it pauses, completes, fails, or the process
    /// starts draining.
    ///
    /// Terminal and paused instances are returned unchanged.
    pub async fn run(&self, id: &str) -> PipelineResult<ChainState> {
        let mut state = self.store.load_required(id).await?;

        match state.status {
            ChainStatus::Completed | ChainStatus::Failed | ChainStatus::NeedsClarification => {
                debug!(instance_id = %id, status = %state.status, "Nothing to run");
                return Ok(state);
            }
            ChainStatus::Pending => {
                let mut update = StatusUpdate::to(ChainStatus::Running);
                if let Some(first) = self.catalog.next_stage(&state) {
                    update = update.with_stage(&first.id);
                }
                state = self.store.transition(id, update).await?;
                self.notifier.status_changed(&state);
            }
            ChainStatus::Running => {}
        }

        loop {
            if state.is_terminal() {
                return Ok(state);
            }
            if self.tracker().is_draining() {
                return Ok(self.leave_for_resumption(state));
            }

            let Some(stage) = self.catalog.next_stage(&state) else {
                state = self
                    .store
                    .transition(id, StatusUpdate::to(ChainStatus::Completed))
                    .await?;
                info!(instance_id = %id, "Analysis completed");
                self.notifier.status_changed(&state);
                return Ok(state);
            };

            if state.current_stage.as_deref() != Some(stage.id.as_str()) {
                state = self
                    .store
                    .transition(id, StatusUpdate::to(ChainStatus::Running).with_stage(&stage.id))
                    .await?;
                if self.tracker().is_draining() {
                    return Ok(self.leave_for_resumption(state));
                }
            }

            let result = self.executor.execute(&state, stage).await;

            match result.outcome {
                StageOutcome::Success | StageOutcome::SuccessWithWarnings => {
                    state = self.store.load_required(id).await?;
                    self.notifier
                        .stage_completed(id, &result, self.progress(&state));
                }
                StageOutcome::Paused => {
                    self.notifier
                        .stage_completed(id, &result, self.progress(&state));
                    return self.pause(id, &stage.id, &result).await;
                }
                StageOutcome::Deferred => {
                    return Ok(self.leave_for_resumption(state));
                }
                StageOutcome::RetryableFailure | StageOutcome::FatalFailure => {
                    self.notifier
                        .stage_completed(id, &result, self.progress(&state));
                    return self.fail(id, &stage.id, &result).await;
                }
            }
        }
    }

    fn leave_for_resumption(&self, state: ChainState) -> ChainState {
        info!(
            instance_id = %state.id,
            current_stage = state.current_stage.as_deref().unwrap_or("-"),
            "Draining; leaving instance running for resumption"
        );
        state
    }

    /// Persist a clarification pause on the instance.
    async fn pause(&self, id: &str, stage_id: &str, result: &StageResult) -> PipelineResult<ChainState> {
        let question = result
            .clarification()
            .unwrap_or("Please provide more detail about the request.");
        match self.store.pause_for_clarification(id, stage_id, question).await {
            Ok(state) => {
                info!(instance_id = %id, stage = stage_id, "Awaiting clarification");
                self.notifier.status_changed(&state);
                Ok(state)
            }
            Err(e) => {
                // a concurrent cancel may already have closed the instance
                let current = self.store.load_required(id).await?;
                if current.is_terminal() {
                    debug!(
                        instance_id = %id,
                        stage = stage_id,
                        status = %current.status,
                        "Instance closed while stage was asking"
                    );
                    return Ok(current);
                }
                Err(e.into())
            }
        }
    }

    /// Persist a stage failure on the instance.
    async fn fail(&self, id: &str, stage_id: &str, result: &StageResult) -> PipelineResult<ChainState> {
        // a concurrent cancel may already have closed the instance
        let current = self.store.load_required(id).await?;
        if current.is_terminal() {
            return Ok(current);
        }

        let error = result.error.clone().unwrap_or(StageError::Service {
            message: format!("stage ended with {}", result.outcome),
        });
        let last_error = LastError::new(error.kind(), error.to_string()).at_stage(stage_id);
        let state = self
            .store
            .transition(
                id,
                StatusUpdate::to(ChainStatus::Failed)
                    .with_stage(stage_id)
                    .with_error(last_error),
            )
            .await?;
        warn!(
            instance_id = %id,
            stage = stage_id,
            kind = %error.kind(),
            outcome = %result.outcome,
            "Analysis failed"
        );
        self.notifier.status_changed(&state);
        Ok(state)
    }

    /// Record the owner's answer and resume from the paused stage.
    pub async fn submit_clarification_answer(
        &self,
        id: &str,
        answer: &str,
    ) -> PipelineResult<ChainState> {
        let answer = answer.trim();
        if answer.is_empty() {
            return Err(PipelineError::EmptyAnswer);
        }

        let state = self.store.load_required(id).await?;
        if state.status != ChainStatus::NeedsClarification {
            return Err(PipelineError::NotAwaitingClarification {
                instance_id: id.to_string(),
                status: state.status.to_string(),
            });
        }

        let state = self.store.resume_with_answer(id, answer).await?;
        info!(
            instance_id = %id,
            stage = state.current_stage.as_deref().unwrap_or("-"),
            "Clarification answered; resuming"
        );
        self.notifier.status_changed(&state);
        self.run(id).await
    }

    /// Mark an instance failed on the owner's request.
    pub async fn cancel_analysis(&self, id: &str) -> PipelineResult<ChainState> {
        let state = self.store.load_required(id).await?;
        if state.is_terminal() {
            return Err(PipelineError::AlreadyTerminal {
                instance_id: id.to_string(),
                status: state.status.to_string(),
            });
        }

        let mut error = LastError::new(ErrorKind::UserCancelled, "Analysis cancelled by owner");
        if let Some(stage) = &state.current_stage {
            error = error.at_stage(stage);
        }
        let state = self
            .store
            .transition(id, StatusUpdate::to(ChainStatus::Failed).with_error(error))
            .await?;
        info!(instance_id = %id, "Analysis cancelled");
        self.notifier.status_changed(&state);
        Ok(state)
    }

    /// Drive every instance persisted as running, e.g. after a restart.
    ///
    /// An instance that fails to load or run is logged and skipped.
    pub async fn resume_interrupted(&self) -> PipelineResult<Vec<ChainState>> {
        let interrupted = self.store.list_by_status(ChainStatus::Running).await?;
        info!(count = interrupted.len(), "Resuming interrupted analyses");

        let mut resumed = Vec::with_capacity(interrupted.len());
        for summary in interrupted {
            if self.tracker().is_draining() {
                break;
            }
            match self.run(&summary.id).await {
                Ok(state) => resumed.push(state),
                Err(e) => warn!(instance_id = %summary.id, error = %e, "Failed to resume analysis"),
            }
        }
        Ok(resumed)
    }
}
