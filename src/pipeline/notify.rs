//! Progress notifications emitted by the orchestrator.

use tracing::{info, warn};

use super::{StageOutcome, StageResult};
use crate::storage::ChainState;

/// Receives stage-level and instance-level progress events.
///
/// Implementations must not block; they are called inline from the
/// orchestrator loop.
#[cfg_attr(test, mockall::automock)]
pub trait StageNotifier: Send + Sync {
    /// A stage finished with any outcome.
    fn stage_completed(&self, instance_id: &str, result: &StageResult, progress_percent: u8);

    /// The instance reached a status the owner should hear about.
    fn status_changed(&self, state: &ChainState);
}

/// Notifier that emits structured log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl StageNotifier for TracingNotifier {
    fn stage_completed(&self, instance_id: &str, result: &StageResult, progress_percent: u8) {
        match result.outcome {
            StageOutcome::Success | StageOutcome::SuccessWithWarnings => info!(
                instance_id,
                stage = %result.stage_id,
                outcome = %result.outcome,
                flags = result.flags.len(),
                attempts = result.attempts,
                from_checkpoint = result.from_checkpoint,
                progress_percent,
                "Stage completed"
            ),
            StageOutcome::Paused => info!(
                instance_id,
                stage = %result.stage_id,
                question = result.clarification().unwrap_or_default(),
                "Stage paused for clarification"
            ),
            StageOutcome::Deferred => info!(
                instance_id,
                stage = %result.stage_id,
                "Stage deferred by drain"
            ),
            StageOutcome::RetryableFailure | StageOutcome::FatalFailure => warn!(
                instance_id,
                stage = %result.stage_id,
                outcome = %result.outcome,
                attempts = result.attempts,
                error = ?result.error,
                "Stage failed"
            ),
        }
    }

    fn status_changed(&self, state: &ChainState) {
        info!(
            instance_id = %state.id,
            status = %state.status,
            current_stage = state.current_stage.as_deref().unwrap_or("-"),
            completed = state.completed_steps.len(),
            "Analysis status changed"
        );
    }
}
