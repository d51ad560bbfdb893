//! Durable chain-state persistence.
//!
//! One [`ChainState`] record exists per analysis instance. Stage outputs are
//! stored in immutable per-stage namespaces; every successful
//! [`ChainStore::append_stage_result`] is a durability checkpoint from which
//! the pipeline can resume after a crash.

mod sqlite;


pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ErrorKind, StorageError, StorageResult};
use crate::pipeline::{EvidenceReport, StageFlag};

/// Overall status of an analysis instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    /// Created, no stage has started yet.
    #[default]
    Pending,
    /// Stages are being executed (or were, before a restart).
    Running,
    /// Paused until the owner answers a clarification question.
    NeedsClarification,
    /// Every stage completed.
    Completed,
    /// Halted with a recorded error.
    Failed,
}

impl ChainStatus {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStatus::Pending => "pending",
            ChainStatus::Running => "running",
            ChainStatus::NeedsClarification => "needs_clarification",
            ChainStatus::Completed => "completed",
            ChainStatus::Failed => "failed",
        }
    }

    /// `Completed` and `Failed` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChainStatus::Completed | ChainStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ChainStatus) -> bool {
        use ChainStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Running)
                | (Running, NeedsClarification)
                | (Running, Completed)
                | (Running, Failed)
                | (NeedsClarification, Running)
                | (NeedsClarification, Failed)
        )
    }
}

impl std::fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ChainStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ChainStatus::Pending),
            "running" => Ok(ChainStatus::Running),
            "needs_clarification" => Ok(ChainStatus::NeedsClarification),
            "completed" => Ok(ChainStatus::Completed),
            "failed" => Ok(ChainStatus::Failed),
            _ => Err(format!("Unknown chain status: {}", s)),
        }
    }
}

/// The error that halted an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Stage that was executing, if any.
    pub stage_id: Option<String>,
    /// When the error was recorded.
    pub occurred_at: DateTime<Utc>,
}

impl LastError {
    /// Create a new error record stamped with the current time.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stage_id: None,
            occurred_at: Utc::now(),
        }
    }

    /// Attach the stage that failed.
    pub fn at_stage(mut self, stage_id: impl Into<String>) -> Self {
        self.stage_id = Some(stage_id.into());
        self
    }
}

/// Contents of one stage namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Validated (and possibly calibrated) stage output.
    pub output: serde_json::Value,
    /// Defaulting and calibration flags raised while producing it.
    #[serde(default)]
    pub flags: Vec<StageFlag>,
    /// Completeness/calibration report for downstream display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<EvidenceReport>,
    /// Reasoning-service attempts spent on this stage.
    pub attempts: u32,
    /// When the namespace was written.
    pub completed_at: DateTime<Utc>,
}

impl StageRecord {
    /// Create a record for a validated output.
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            output,
            flags: Vec::new(),
            report: None,
            attempts: 1,
            completed_at: Utc::now(),
        }
    }

    /// Set the flags raised for this output.
    pub fn with_flags(mut self, flags: Vec<StageFlag>) -> Self {
        self.flags = flags;
        self
    }

    /// Set the evidence report.
    pub fn with_report(mut self, report: EvidenceReport) -> Self {
        self.report = Some(report);
        self
    }

    /// Set the attempt count.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// A clarification question raised by a stage and its eventual answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clarification {
    /// Stage that asked.
    pub stage_id: String,
    /// Question shown to the owner.
    pub question: String,
    /// Owner's answer, once supplied.
    pub answer: Option<String>,
    /// When the stage paused.
    pub asked_at: DateTime<Utc>,
    /// When the answer arrived.
    pub answered_at: Option<DateTime<Utc>>,
}

/// Accumulated state of one analysis instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainState {
    /// Instance identifier.
    pub id: String,
    /// Owning user.
    pub owner_id: String,
    /// The submitted analysis request.
    pub input: String,
    /// Overall status.
    pub status: ChainStatus,
    /// Stage executing, paused, or next to run.
    pub current_stage: Option<String>,
    /// Completed stage ids in completion order.
    pub completed_steps: Vec<String>,
    /// Namespaced stage outputs keyed by stage id.
    pub outputs: BTreeMap<String, StageRecord>,
    /// Error that halted the instance, if any.
    pub last_error: Option<LastError>,
    /// Clarification exchanges in the order they were raised.
    pub clarifications: Vec<Clarification>,
    /// Optimistic-concurrency version, bumped on every write.
    pub version: i64,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the instance was last written.
    pub updated_at: DateTime<Utc>,
}

impl ChainState {
    /// Create a fresh pending state.
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>, input: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            input: input.into(),
            status: ChainStatus::Pending,
            current_stage: None,
            completed_steps: Vec::new(),
            outputs: BTreeMap::new(),
            last_error: None,
            clarifications: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the stage has a checkpointed output.
    pub fn is_completed(&self, stage_id: &str) -> bool {
        self.completed_steps.iter().any(|s| s == stage_id)
    }

    /// The checkpointed record for a stage.
    pub fn record(&self, stage_id: &str) -> Option<&StageRecord> {
        self.outputs.get(stage_id)
    }

    /// Dependencies not yet in `completed_steps`, in declaration order.
    pub fn missing_dependencies<'a>(&self, dependencies: &'a [String]) -> Vec<&'a str> {
        dependencies
            .iter()
            .filter(|d| !self.is_completed(d))
            .map(String::as_str)
            .collect()
    }

    /// The unanswered clarification, if the instance is paused.
    pub fn pending_clarification(&self) -> Option<&Clarification> {
        self.clarifications.iter().rev().find(|c| c.answer.is_none())
    }

    /// Answered clarifications for one stage, oldest first.
    pub fn answered_clarifications<'a>(
        &'a self,
        stage_id: &'a str,
    ) -> impl Iterator<Item = &'a Clarification> + 'a {
        self.clarifications
            .iter()
            .filter(move |c| c.stage_id == stage_id && c.answer.is_some())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a checkpoint. Returns `false` when the stage is already recorded.
    pub(crate) fn apply_stage_record(
        &mut self,
        stage_id: &str,
        record: StageRecord,
    ) -> StorageResult<bool> {
        if self.is_completed(stage_id) {
            return Ok(false);
        }
        if self.is_terminal() {
            return Err(StorageError::TerminalInstance {
                instance_id: self.id.clone(),
                status: self.status.to_string(),
            });
        }
        self.outputs.insert(stage_id.to_string(), record);
        self.completed_steps.push(stage_id.to_string());
        Ok(true)
    }

    /// Apply a status update after validating the transition.
    pub(crate) fn apply_status_update(&mut self, update: StatusUpdate) -> StorageResult<()> {
        if !self.status.can_transition_to(update.status) {
            return Err(StorageError::InvalidTransition {
                instance_id: self.id.clone(),
                from: self.status.to_string(),
                to: update.status.to_string(),
            });
        }
        self.status = update.status;
        if update.status == ChainStatus::Completed {
            self.current_stage = None;
        } else if let Some(stage) = update.current_stage {
            self.current_stage = Some(stage);
        }
        if let Some(error) = update.last_error {
            self.last_error = Some(error);
        }
        Ok(())
    }

    /// Move to `NeedsClarification`, recording the question.
    pub(crate) fn apply_pause(&mut self, stage_id: &str, question: &str) -> StorageResult<()> {
        self.apply_status_update(
            StatusUpdate::to(ChainStatus::NeedsClarification).with_stage(stage_id),
        )?;
        self.clarifications.push(Clarification {
            stage_id: stage_id.to_string(),
            question: question.to_string(),
            answer: None,
            asked_at: Utc::now(),
            answered_at: None,
        });
        Ok(())
    }

    /// Record the answer to the pending question and move back to `Running`.
    pub(crate) fn apply_answer(&mut self, answer: &str) -> StorageResult<()> {
        if self.status != ChainStatus::NeedsClarification {
            return Err(StorageError::InvalidTransition {
                instance_id: self.id.clone(),
                from: self.status.to_string(),
                to: ChainStatus::Running.to_string(),
            });
        }
        self.apply_status_update(StatusUpdate::to(ChainStatus::Running))?;
        if let Some(pending) = self
            .clarifications
            .iter_mut()
            .rev()
            .find(|c| c.answer.is_none())
        {
            pending.answer = Some(answer.to_string());
            pending.answered_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// A status change applied by [`ChainStore::transition`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    /// Target status.
    pub status: ChainStatus,
    /// New current-stage pointer; `None` keeps the existing one.
    pub current_stage: Option<String>,
    /// Error to record; `None` keeps the existing one.
    pub last_error: Option<LastError>,
}

impl StatusUpdate {
    /// Transition to `status`.
    pub fn to(status: ChainStatus) -> Self {
        Self {
            status,
            current_stage: None,
            last_error: None,
        }
    }

    /// Point the instance at a stage.
    pub fn with_stage(mut self, stage_id: impl Into<String>) -> Self {
        self.current_stage = Some(stage_id.into());
        self
    }

    /// Record an error.
    pub fn with_error(mut self, error: LastError) -> Self {
        self.last_error = Some(error);
        self
    }
}

/// Listing row served from the status/current-stage columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSummary {
    pub id: String,
    pub owner_id: String,
    pub status: ChainStatus,
    pub current_stage: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence seam for chain states.
///
/// Every mutating operation is atomic: either the whole change is durably
/// recorded or the stored state is untouched.
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Load an instance, `None` if it does not exist.
    async fn load(&self, id: &str) -> StorageResult<Option<ChainState>>;

    /// Create a pending instance unless one with this id exists; returns the stored state.
    async fn create_if_absent(
        &self,
        id: &str,
        owner_id: &str,
        input: &str,
    ) -> StorageResult<ChainState>;

    /// Checkpoint a stage output into its namespace.
    ///
    /// Appending a stage that is already recorded is a no-op returning the
    /// persisted state; the first write of a namespace always wins.
    async fn append_stage_result(
        &self,
        id: &str,
        stage_id: &str,
        record: StageRecord,
    ) -> StorageResult<ChainState>;

    /// Change status, current-stage pointer and last error.
    async fn transition(&self, id: &str, update: StatusUpdate) -> StorageResult<ChainState>;

    /// Pause on a clarification question raised by `stage_id`.
    async fn pause_for_clarification(
        &self,
        id: &str,
        stage_id: &str,
        question: &str,
    ) -> StorageResult<ChainState>;

    /// Record the owner's answer and move back to `Running`.
    async fn resume_with_answer(&self, id: &str, answer: &str) -> StorageResult<ChainState>;

    /// List instances currently in `status`, oldest update first.
    async fn list_by_status(&self, status: ChainStatus) -> StorageResult<Vec<ChainSummary>>;

    /// Load an instance that must exist.
    async fn load_required(&self, id: &str) -> StorageResult<ChainState> {
        self.load(id)
            .await?
            .ok_or_else(|| StorageError::InstanceNotFound {
                instance_id: id.to_string(),
            })
    }
}
