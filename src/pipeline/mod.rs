//! Durable multi-stage analysis pipeline.
//!
//! This module provides:
//! - [`StageDefinition`] / [`StageCatalog`]: the static dependency graph
//! - [`schema`]: antifragile parsing of raw stage output
//! - [`evidence`]: claim calibration and self-critique checks
//! - [`StepExecutor`]: one stage end-to-end, including the checkpoint
//! - [`PipelineOrchestrator`]: the instance state machine
//! - [`ExecutionTracker`] / [`DrainController`]: graceful shutdown
//!
//! Stage-local failures never surface as `Err`; they are folded into a
//! [`StageResult`] whose [`StageOutcome`] the orchestrator acts on.

pub mod evidence;
mod executor;
mod notify;
mod orchestrator;
pub mod schema;
pub mod stages;
mod tracker;

pub use evidence::{
    ClaimAssessment, Completeness, Confidence, CritiqueAssessment, EnforcedOutput,
    EvidenceClaim, EvidenceEnforcer, EvidencePolicy, EvidenceReport, EvidenceSource,
    SelfCritique,
};
pub use executor::StepExecutor;
pub use notify::{StageNotifier, TracingNotifier};
pub use orchestrator::PipelineOrchestrator;
pub use schema::{FieldKind, FieldRule, FieldSpec, OutputSchema, ValidatedOutput};
pub use tracker::{DrainController, DrainOutcome, ExecutionGuard, ExecutionTracker};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult, StageError};
use crate::storage::{ChainState, StageRecord};

// ============================================================================
// Stage definitions
// ============================================================================

/// Retry policy for transient reasoning-service failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: u32,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Static description of one pipeline stage.
#[derive(Debug, Clone)]
pub struct StageDefinition {
    /// Stage id; also the namespace key in chain state.
    pub id: String,
    /// Execution order; dependencies must have lower ordinals.
    pub ordinal: u32,
    /// Stage ids that must be completed first.
    pub dependencies: Vec<String>,
    /// Reasoning-service pipe that runs the stage.
    pub pipe: String,
    /// System prompt for the pipe.
    pub prompt: String,
    /// Output contract.
    pub schema: OutputSchema,
    /// Transient-failure retry policy.
    pub retry: RetryPolicy,
    /// Bound on a single reasoning-service call.
    pub timeout: Duration,
    /// Whether the stage may pause to ask the owner a question.
    pub allows_clarification: bool,
}

impl StageDefinition {
    /// Create a stage with no dependencies and default policies.
    pub fn new(id: impl Into<String>, ordinal: u32, pipe: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ordinal,
            dependencies: Vec::new(),
            pipe: pipe.into(),
            prompt: String::new(),
            schema: OutputSchema::default(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(120),
            allows_clarification: false,
        }
    }

    /// Declare dependencies.
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Set the system prompt.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Set the output schema.
    pub fn with_schema(mut self, schema: OutputSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Allow the stage to pause for clarification.
    pub fn allow_clarification(mut self) -> Self {
        self.allows_clarification = true;
        self
    }
}

/// A validated, ordinal-sorted set of stage definitions.
#[derive(Debug, Clone)]
pub struct StageCatalog {
    stages: Vec<StageDefinition>,
}

impl StageCatalog {
    /// Validate and sort the definitions.
    ///
    /// Rejects duplicate ids or ordinals, unknown dependencies, and any
    /// dependency whose ordinal is not lower than the dependent's, which
    /// also rules out cycles.
    pub fn new(mut stages: Vec<StageDefinition>) -> PipelineResult<Self> {
        if stages.is_empty() {
            return Err(invalid("catalog has no stages"));
        }
        stages.sort_by_key(|s| s.ordinal);

        let mut ids = HashSet::new();
        let mut ordinals = HashSet::new();
        for stage in &stages {
            if !ids.insert(stage.id.as_str()) {
                return Err(invalid(format!("duplicate stage id '{}'", stage.id)));
            }
            if !ordinals.insert(stage.ordinal) {
                return Err(invalid(format!(
                    "duplicate ordinal {} ('{}')",
                    stage.ordinal, stage.id
                )));
            }
        }

        for stage in &stages {
            for dep in &stage.dependencies {
                let Some(target) = stages.iter().find(|s| &s.id == dep) else {
                    return Err(invalid(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.id, dep
                    )));
                };
                if target.ordinal >= stage.ordinal {
                    return Err(invalid(format!(
                        "stage '{}' (ordinal {}) depends on '{}' (ordinal {})",
                        stage.id, stage.ordinal, target.id, target.ordinal
                    )));
                }
            }
        }

        Ok(Self { stages })
    }

    /// Stages in ordinal order.
    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Look up a stage by id.
    pub fn get(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The lowest-ordinal stage not yet completed.
    ///
    /// Strict ordinal order: a later stage is never chosen while an earlier
    /// one is outstanding, even if its own dependencies are met.
    pub fn next_stage(&self, state: &ChainState) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| !state.is_completed(&s.id))
    }

    /// Percentage of catalog stages completed, 0-100.
    pub fn progress_percent(&self, state: &ChainState) -> u8 {
        let done = self
            .stages
            .iter()
            .filter(|s| state.is_completed(&s.id))
            .count();
        ((done * 100) / self.stages.len().max(1)) as u8
    }
}

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::InvalidDefinition {
        message: message.into(),
    }
}

// ============================================================================
// Stage results
// ============================================================================

/// Result classification of one stage execution, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// Output checkpointed, nothing to report.
    Success,
    /// Output checkpointed with calibration or critique warnings.
    SuccessWithWarnings,
    /// The stage needs an answer from the owner before it can proceed.
    Paused,
    /// Not admitted because the process is draining; nothing ran.
    Deferred,
    /// Transient failures exhausted the retry policy.
    RetryableFailure,
    /// Permanent failure; retrying cannot help.
    FatalFailure,
}

impl StageOutcome {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageOutcome::Success => "success",
            StageOutcome::SuccessWithWarnings => "success_with_warnings",
            StageOutcome::Paused => "paused",
            StageOutcome::Deferred => "deferred",
            StageOutcome::RetryableFailure => "retryable_failure",
            StageOutcome::FatalFailure => "fatal_failure",
        }
    }

    /// Whether the output was checkpointed.
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success | StageOutcome::SuccessWithWarnings)
    }
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of adjustment made to a stage output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    /// An optional field was absent or malformed and got its default.
    Defaulted,
    /// A claim's confidence or completeness was corrected downward.
    CalibrationAdjusted,
    /// The self-critique block did not acknowledge enough real gaps.
    CritiqueInsufficient,
}

/// A recorded adjustment with the field it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFlag {
    pub kind: FlagKind,
    /// Dotted path of the field, e.g. `claims[2].confidence`.
    pub field: String,
    pub reason: String,
}

impl StageFlag {
    pub fn defaulted(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: FlagKind::Defaulted,
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn calibration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: FlagKind::CalibrationAdjusted,
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn critique(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: FlagKind::CritiqueInsufficient,
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// The outcome this flag alone would produce.
    ///
    /// Defaulting is silent; calibration and critique findings surface as
    /// warnings.
    pub fn severity(&self) -> StageOutcome {
        match self.kind {
            FlagKind::Defaulted => StageOutcome::Success,
            FlagKind::CalibrationAdjusted | FlagKind::CritiqueInsufficient => {
                StageOutcome::SuccessWithWarnings
            }
        }
    }
}

/// Worst outcome implied by a set of flags.
pub fn outcome_for_flags(flags: &[StageFlag]) -> StageOutcome {
    flags
        .iter()
        .map(StageFlag::severity)
        .max()
        .unwrap_or(StageOutcome::Success)
}

/// Transient result of executing one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub stage_id: String,
    pub outcome: StageOutcome,
    /// Raw completion text of the last reasoning-service call.
    pub raw_output: Option<String>,
    /// Validated output, present on success.
    pub validated_output: Option<serde_json::Value>,
    pub flags: Vec<StageFlag>,
    pub report: Option<EvidenceReport>,
    /// Stage-local error behind a failure or pause.
    pub error: Option<StageError>,
    /// Reasoning-service calls made.
    pub attempts: u32,
    /// Served from an existing checkpoint without calling the service.
    pub from_checkpoint: bool,
}

impl StageResult {
    /// A result reconstructed from a checkpointed record.
    pub fn from_record(stage_id: impl Into<String>, record: &StageRecord) -> Self {
        Self {
            stage_id: stage_id.into(),
            outcome: outcome_for_flags(&record.flags),
            raw_output: None,
            validated_output: Some(record.output.clone()),
            flags: record.flags.clone(),
            report: record.report.clone(),
            error: None,
            attempts: 0,
            from_checkpoint: true,
        }
    }

    /// A failure or pause carrying a stage-local error.
    pub fn halted(
        stage_id: impl Into<String>,
        outcome: StageOutcome,
        error: StageError,
        attempts: u32,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            outcome,
            raw_output: None,
            validated_output: None,
            flags: Vec::new(),
            report: None,
            error: Some(error),
            attempts,
            from_checkpoint: false,
        }
    }

    /// A stage refused admission by a draining tracker.
    pub fn deferred(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            outcome: StageOutcome::Deferred,
            raw_output: None,
            validated_output: None,
            flags: Vec::new(),
            report: None,
            error: None,
            attempts: 0,
            from_checkpoint: false,
        }
    }

    /// Attach the raw completion.
    pub fn with_raw_output(mut self, raw: Option<String>) -> Self {
        self.raw_output = raw;
        self
    }

    /// The clarification question, when paused.
    pub fn clarification(&self) -> Option<&str> {
        match &self.error {
            Some(StageError::UserInputInsufficient { question }) => Some(question),
            _ => None,
        }
    }
}
