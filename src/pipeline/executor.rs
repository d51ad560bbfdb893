//! Runs one stage end to end: context assembly, reasoning-service call with
//! retry, validation, evidence enforcement and checkpoint.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::evidence::{EnforcedOutput, EvidenceEnforcer};
use super::schema::{clarification_request, parse_completion_json};
use super::tracker::ExecutionTracker;
use super::{StageDefinition, StageOutcome, StageResult};
use crate::error::{LangbaseError, StageError};
use crate::langbase::{Message, PipeRequest, ReasoningClient};
use crate::storage::{ChainState, ChainStore, StageRecord};

/// Answered questions after which a stage may no longer ask another.
const MAX_CLARIFICATIONS_PER_STAGE: usize = 3;

/// What a single completion turned into.
enum Processed {
    Output(EnforcedOutput),
    Clarify(String),
}

/// Executes stages against the reasoning service and checkpoints results.
#[derive(Clone)]
pub struct StepExecutor {
    client: Arc<dyn ReasoningClient>,
    store: Arc<dyn ChainStore>,
    tracker: ExecutionTracker,
    enforcer: EvidenceEnforcer,
}

impl StepExecutor {
    pub fn new(
        client: Arc<dyn ReasoningClient>,
        store: Arc<dyn ChainStore>,
        tracker: ExecutionTracker,
        enforcer: EvidenceEnforcer,
    ) -> Self {
        Self {
            client,
            store,
            tracker,
            enforcer,
        }
    }

    pub fn tracker(&self) -> &ExecutionTracker {
        &self.tracker
    }

    /// Execute `stage` for the instance `snapshot` was taken from.
    ///
    /// Never returns an error: every failure is classified into the
    /// result's outcome. Checkpoint and dependency checks run against the
    /// persisted state, not the caller's snapshot, so a duplicate trigger
    /// for a completed stage is served from its namespace without calling
    /// the reasoning service.
    pub async fn execute(&self, snapshot: &ChainState, stage: &StageDefinition) -> StageResult {
        let Some(_guard) = self.tracker.try_begin() else {
            debug!(instance_id = %snapshot.id, stage = %stage.id, "Draining; stage not admitted");
            return StageResult::deferred(&stage.id);
        };

        let state = match self.store.load_required(&snapshot.id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(instance_id = %snapshot.id, stage = %stage.id, error = %e, "Failed to reload chain state");
                return StageResult::halted(
                    &stage.id,
                    StageOutcome::RetryableFailure,
                    StageError::Checkpoint {
                        message: e.to_string(),
                    },
                    0,
                );
            }
        };
        let state = &state;

        if let Some(record) = state.record(&stage.id) {
            debug!(instance_id = %state.id, stage = %stage.id, "Stage already checkpointed");
            return StageResult::from_record(&stage.id, record);
        }

        let missing = state.missing_dependencies(&stage.dependencies);
        if !missing.is_empty() {
            let error = StageError::DependencyNotMet {
                stage_id: stage.id.clone(),
                missing: missing.iter().map(|m| m.to_string()).collect(),
            };
            warn!(instance_id = %state.id, stage = %stage.id, error = %error, "Dependency check failed");
            return StageResult::halted(&stage.id, StageOutcome::FatalFailure, error, 0);
        }

        let start = Instant::now();
        let mut messages = build_messages(state, stage);
        let may_clarify = stage.allows_clarification
            && state.answered_clarifications(&stage.id).count() < MAX_CLARIFICATIONS_PER_STAGE;
        let mut attempts = 0u32;
        let mut corrected = false;

        loop {
            let completion = match self.call_with_retry(stage, &messages, &mut attempts).await {
                Ok(completion) => completion,
                Err(error) => {
                    let outcome = match &error {
                        StageError::TransientService { .. } => StageOutcome::RetryableFailure,
                        _ => StageOutcome::FatalFailure,
                    };
                    warn!(
                        instance_id = %state.id,
                        stage = %stage.id,
                        attempts,
                        error = %error,
                        "Reasoning service call failed"
                    );
                    return StageResult::halted(&stage.id, outcome, error, attempts);
                }
            };

            match self.process(stage, &completion, may_clarify) {
                Ok(Processed::Clarify(question)) => {
                    return StageResult::halted(
                        &stage.id,
                        StageOutcome::Paused,
                        StageError::UserInputInsufficient { question },
                        attempts,
                    )
                    .with_raw_output(Some(completion));
                }
                Ok(Processed::Output(enforced)) => {
                    let result = self
                        .checkpoint(state, stage, enforced, attempts)
                        .await
                        .with_raw_output(Some(completion));
                    info!(
                        instance_id = %state.id,
                        stage = %stage.id,
                        outcome = %result.outcome,
                        attempts,
                        latency_ms = start.elapsed().as_millis(),
                        "Stage executed"
                    );
                    return result;
                }
                Err(StageError::Validation { field, reason }) if !corrected => {
                    corrected = true;
                    warn!(
                        instance_id = %state.id,
                        stage = %stage.id,
                        field = %field,
                        reason = %reason,
                        "Anchor validation failed; issuing corrective re-attempt"
                    );
                    messages.push(Message::assistant(completion));
                    messages.push(Message::user(corrective_prompt(&field, &reason)));
                }
                Err(error) => {
                    warn!(instance_id = %state.id, stage = %stage.id, error = %error, "Stage output rejected");
                    return StageResult::halted(&stage.id, StageOutcome::FatalFailure, error, attempts)
                        .with_raw_output(Some(completion));
                }
            }
        }
    }

    /// Call the reasoning service under the stage's timeout and retry policy.
    async fn call_with_retry(
        &self,
        stage: &StageDefinition,
        messages: &[Message],
        attempts: &mut u32,
    ) -> Result<String, StageError> {
        let max_attempts = stage.retry.max_attempts.max(1);
        let mut tries = 0u32;

        loop {
            tries += 1;
            *attempts += 1;

            let request = PipeRequest::new(&stage.pipe, messages.to_vec());
            let error = match tokio::time::timeout(stage.timeout, self.client.complete(request)).await
            {
                Ok(Ok(completion)) => return Ok(completion),
                Ok(Err(error)) => error,
                Err(_) => LangbaseError::Timeout {
                    timeout_ms: u64::try_from(stage.timeout.as_millis()).unwrap_or(u64::MAX),
                },
            };

            if !error.is_transient() {
                return Err(StageError::Service {
                    message: error.to_string(),
                });
            }
            if tries >= max_attempts {
                return Err(StageError::TransientService {
                    message: error.to_string(),
                    attempts: tries,
                });
            }

            let delay = stage.retry.backoff(tries);
            warn!(
                stage = %stage.id,
                attempt = tries,
                max_attempts,
                delay_ms = delay.as_millis(),
                error = %error,
                "Transient reasoning-service failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn process(
        &self,
        stage: &StageDefinition,
        completion: &str,
        may_clarify: bool,
    ) -> Result<Processed, StageError> {
        let raw = parse_completion_json(completion)?;
        if may_clarify {
            if let Some(question) = clarification_request(&raw) {
                return Ok(Processed::Clarify(question));
            }
        }
        let validated = stage.schema.validate(raw)?;
        let enforced = self.enforcer.enforce(&stage.schema, validated)?;
        Ok(Processed::Output(enforced))
    }

    async fn checkpoint(
        &self,
        state: &ChainState,
        stage: &StageDefinition,
        enforced: EnforcedOutput,
        attempts: u32,
    ) -> StageResult {
        let record = StageRecord::new(enforced.value)
            .with_flags(enforced.flags)
            .with_report(enforced.report)
            .with_attempts(attempts);

        match self
            .store
            .append_stage_result(&state.id, &stage.id, record)
            .await
        {
            Ok(persisted) => match persisted.record(&stage.id) {
                // the first write of a namespace wins; report what is stored
                Some(record) => StageResult {
                    attempts,
                    from_checkpoint: false,
                    ..StageResult::from_record(&stage.id, record)
                },
                None => StageResult::halted(
                    &stage.id,
                    StageOutcome::RetryableFailure,
                    StageError::Checkpoint {
                        message: "stage namespace missing after append".to_string(),
                    },
                    attempts,
                ),
            },
            Err(e) => {
                warn!(instance_id = %state.id, stage = %stage.id, error = %e, "Checkpoint failed");
                StageResult::halted(
                    &stage.id,
                    StageOutcome::RetryableFailure,
                    StageError::Checkpoint {
                        message: e.to_string(),
                    },
                    attempts,
                )
            }
        }
    }
}

/// Assemble the stage request: system prompt, the analysis request,
/// dependency outputs and any clarification answers for this stage.
fn build_messages(state: &ChainState, stage: &StageDefinition) -> Vec<Message> {
    let mut messages = Vec::new();

    if !stage.prompt.is_empty() {
        messages.push(Message::system(stage.prompt.clone()));
    }

    messages.push(Message::user(format!("Analysis request:\n{}", state.input)));

    for dep in &stage.dependencies {
        if let Some(record) = state.record(dep) {
            let rendered = serde_json::to_string_pretty(&record.output)
                .unwrap_or_else(|_| record.output.to_string());
            messages.push(Message::user(format!(
                "Output of stage '{}':\n{}",
                dep, rendered
            )));
        }
    }

    let answers: Vec<String> = state
        .answered_clarifications(&stage.id)
        .map(|c| {
            format!(
                "Q: {}\nA: {}",
                c.question,
                c.answer.as_deref().unwrap_or_default()
            )
        })
        .collect();
    if !answers.is_empty() {
        messages.push(Message::user(format!(
            "Clarifications from the requester:\n{}",
            answers.join("\n\n")
        )));
    }

    let anchors: Vec<&str> = stage
        .schema
        .fields
        .iter()
        .filter(|f| f.is_anchor())
        .map(|f| f.name.as_str())
        .collect();
    let mut closing = "Respond with a single JSON object.".to_string();
    if !anchors.is_empty() {
        closing.push_str(&format!(" Required fields: {}.", anchors.join(", ")));
    }
    messages.push(Message::user(closing));

    messages
}

fn corrective_prompt(field: &str, reason: &str) -> String {
    let target = if field == "$" { "the response" } else { field };
    format!(
        "Your previous response was unusable: {} ({}). Reply again with a single JSON object that includes it.",
        target, reason
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::langbase::MockReasoningClient;
    use crate::pipeline::schema::{FieldKind, FieldSpec, OutputSchema};
    use crate::pipeline::{RetryPolicy, StageCatalog};
    use crate::storage::SqliteStorage;
    use mockall::Sequence;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2,
            max_backoff: Duration::from_millis(4),
        }
    }

    fn framing() -> StageDefinition {
        StageDefinition::new("framing", 1, "test-framing")
            .with_prompt("Frame the problem.")
            .with_schema(OutputSchema::new(vec![
                FieldSpec::anchor("problem_statement", FieldKind::String),
                FieldSpec::optional("assumptions", FieldKind::StringArray),
            ]))
            .with_retry(fast_retry(3))
            .allow_clarification()
    }

    fn concepts() -> StageDefinition {
        StageDefinition::new("concepts", 2, "test-concepts")
            .depends_on(["framing"])
            .with_schema(OutputSchema::new(vec![
                FieldSpec::anchor("concepts", FieldKind::Array),
                FieldSpec::optional("novelty_claims", FieldKind::Claims),
            ]))
            .with_retry(fast_retry(2))
    }

    async fn setup(client: MockReasoningClient) -> (StepExecutor, Arc<SqliteStorage>, ChainState) {
        let store = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        let state = store.create_if_absent("inst-1", "owner", "Cool a CPU with graphene").await.unwrap();
        let executor = StepExecutor::new(
            Arc::new(client),
            store.clone(),
            ExecutionTracker::new(),
            EvidenceEnforcer::default(),
        );
        (executor, store, state)
    }

    fn ok(body: &str) -> crate::error::LangbaseResult<String> {
        Ok(body.to_string())
    }

    #[tokio::test]
    async fn test_success_checkpoints_output() {
        let mut client = MockReasoningClient::new();
        client
            .expect_complete()
            .times(1)
            .withf(|req| req.name == "test-framing" && req.messages[0].content == "Frame the problem.")
            .returning(|_| ok(r#"{"problem_statement": "Dissipate 200W"}"#));

        let (executor, store, state) = setup(client).await;
        let result = executor.execute(&state, &framing()).await;

        assert_eq!(result.outcome, StageOutcome::Success);
        assert_eq!(result.attempts, 1);
        assert!(!result.from_checkpoint);
        // assumptions defaulted silently
        assert_eq!(result.flags.len(), 1);

        let stored = store.load_required("inst-1").await.unwrap();
        assert_eq!(stored.completed_steps, vec!["framing".to_string()]);
        assert_eq!(stored.outputs["framing"].output["assumptions"], serde_json::json!([]));
        assert_eq!(executor.tracker().active(), 0);
    }

    #[tokio::test]
    async fn test_completed_stage_is_not_reexecuted() {
        let mut client = MockReasoningClient::new();
        client.expect_complete().times(0);

        let (executor, store, _) = setup(client).await;
        let state = store
            .append_stage_result(
                "inst-1",
                "framing",
                StageRecord::new(serde_json::json!({ "problem_statement": "p" })),
            )
            .await
            .unwrap();

        let result = executor.execute(&state, &framing()).await;
        assert!(result.from_checkpoint);
        assert_eq!(result.outcome, StageOutcome::Success);
        assert_eq!(result.validated_output.unwrap()["problem_statement"], "p");
    }

    #[tokio::test]
    async fn test_duplicate_trigger_with_stale_snapshot_is_served_from_checkpoint() {
        let mut client = MockReasoningClient::new();
        client
            .expect_complete()
            .times(1)
            .returning(|_| ok(r#"{"problem_statement": "Dissipate 200W"}"#));

        let (executor, _, snapshot) = setup(client).await;
        let first = executor.execute(&snapshot, &framing()).await;
        assert_eq!(first.outcome, StageOutcome::Success);
        assert!(!first.from_checkpoint);

        // same pre-completion snapshot, as a duplicate trigger would carry
        assert!(snapshot.record("framing").is_none());
        let second = executor.execute(&snapshot, &framing()).await;
        assert_eq!(second.outcome, StageOutcome::Success);
        assert!(second.from_checkpoint);
        assert_eq!(second.attempts, 0);
        assert_eq!(second.validated_output, first.validated_output);
    }

    #[tokio::test]
    async fn test_dependency_check_uses_persisted_state() {
        let mut client = MockReasoningClient::new();
        client
            .expect_complete()
            .times(1)
            .returning(|_| ok(r#"{"concepts": ["vapor chamber"]}"#));

        let (executor, store, snapshot) = setup(client).await;
        store
            .append_stage_result(
                "inst-1",
                "framing",
                StageRecord::new(serde_json::json!({ "problem_statement": "p" })),
            )
            .await
            .unwrap();

        // the snapshot predates the framing checkpoint
        let result = executor.execute(&snapshot, &concepts()).await;
        assert!(result.outcome.is_success());
    }

    #[tokio::test]
    async fn test_draining_tracker_defers_without_service_call() {
        let mut client = MockReasoningClient::new();
        client.expect_complete().times(0);

        let (executor, store, state) = setup(client).await;
        executor.tracker().start_draining();

        let result = executor.execute(&state, &framing()).await;
        assert_eq!(result.outcome, StageOutcome::Deferred);
        assert!(result.error.is_none());
        assert_eq!(executor.tracker().active(), 0);
        assert_eq!(executor.tracker().total_started(), 0);
        assert!(store.load_required("inst-1").await.unwrap().outputs.is_empty());
    }

    #[tokio::test]
    async fn test_missing_instance_is_retryable_checkpoint_error() {
        let mut client = MockReasoningClient::new();
        client.expect_complete().times(0);

        let (executor, _, _) = setup(client).await;
        let ghost = ChainState::new("ghost", "owner", "input");
        let result = executor.execute(&ghost, &framing()).await;

        assert_eq!(result.outcome, StageOutcome::RetryableFailure);
        assert!(matches!(result.error, Some(StageError::Checkpoint { .. })));
    }

    #[tokio::test]
    async fn test_missing_dependency_is_fatal_without_service_call() {
        let mut client = MockReasoningClient::new();
        client.expect_complete().times(0);

        let (executor, _, state) = setup(client).await;
        let result = executor.execute(&state, &concepts()).await;

        assert_eq!(result.outcome, StageOutcome::FatalFailure);
        assert_eq!(
            result.error,
            Some(StageError::DependencyNotMet {
                stage_id: "concepts".to_string(),
                missing: vec!["framing".to_string()],
            })
        );
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_retries() {
        let mut client = MockReasoningClient::new();
        client.expect_complete().times(3).returning(|_| {
            Err(LangbaseError::Api {
                status: 503,
                message: "overloaded".to_string(),
            })
        });

        let (executor, store, state) = setup(client).await;
        let result = executor.execute(&state, &framing()).await;

        assert_eq!(result.outcome, StageOutcome::RetryableFailure);
        assert_eq!(result.attempts, 3);
        assert!(matches!(
            result.error,
            Some(StageError::TransientService { attempts: 3, .. })
        ));
        assert!(store.load_required("inst-1").await.unwrap().outputs.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let mut seq = Sequence::new();
        let mut client = MockReasoningClient::new();
        client
            .expect_complete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(LangbaseError::Timeout { timeout_ms: 10 }));
        client
            .expect_complete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ok(r#"{"problem_statement": "p", "assumptions": ["a"]}"#));

        let (executor, _, state) = setup(client).await;
        let result = executor.execute(&state, &framing()).await;
        assert_eq!(result.outcome, StageOutcome::Success);
        assert_eq!(result.attempts, 2);
        assert!(result.flags.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_service_error_is_fatal_immediately() {
        let mut client = MockReasoningClient::new();
        client.expect_complete().times(1).returning(|_| {
            Err(LangbaseError::Api {
                status: 401,
                message: "bad key".to_string(),
            })
        });

        let (executor, _, state) = setup(client).await;
        let result = executor.execute(&state, &framing()).await;
        assert_eq!(result.outcome, StageOutcome::FatalFailure);
        assert!(matches!(result.error, Some(StageError::Service { .. })));
    }

    #[tokio::test]
    async fn test_corrective_reattempt_recovers_missing_anchor() {
        let mut seq = Sequence::new();
        let mut client = MockReasoningClient::new();
        client
            .expect_complete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ok(r#"{"assumptions": []}"#));
        client
            .expect_complete()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|req| {
                req.messages
                    .last()
                    .map(|m| m.content.contains("problem_statement"))
                    .unwrap_or(false)
            })
            .returning(|_| ok(r#"{"problem_statement": "p", "assumptions": []}"#));

        let (executor, _, state) = setup(client).await;
        let result = executor.execute(&state, &framing()).await;
        assert_eq!(result.outcome, StageOutcome::Success);
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn test_anchor_still_missing_after_correction_is_fatal() {
        let mut client = MockReasoningClient::new();
        client
            .expect_complete()
            .times(2)
            .returning(|_| ok("I could not think of anything."));

        let (executor, store, state) = setup(client).await;
        let result = executor.execute(&state, &framing()).await;

        assert_eq!(result.outcome, StageOutcome::FatalFailure);
        assert!(matches!(result.error, Some(StageError::Validation { .. })));
        assert!(result.raw_output.is_some());
        assert!(store.load_required("inst-1").await.unwrap().outputs.is_empty());
    }

    #[tokio::test]
    async fn test_clarification_request_pauses() {
        let mut client = MockReasoningClient::new();
        client
            .expect_complete()
            .times(1)
            .returning(|_| ok(r#"{"needs_clarification": {"question": "Which CPU TDP?"}}"#));

        let (executor, _, state) = setup(client).await;
        let result = executor.execute(&state, &framing()).await;

        assert_eq!(result.outcome, StageOutcome::Paused);
        assert_eq!(result.clarification(), Some("Which CPU TDP?"));
    }

    #[tokio::test]
    async fn test_dependency_output_and_answers_reach_the_request() {
        let mut client = MockReasoningClient::new();
        client
            .expect_complete()
            .times(1)
            .withf(|req| {
                let text: Vec<&str> = req.messages.iter().map(|m| m.content.as_str()).collect();
                text.iter().any(|t| t.contains("Output of stage 'framing'") && t.contains("Dissipate 200W"))
                    && text.iter().any(|t| t.contains("Cool a CPU with graphene"))
            })
            .returning(|_| ok(r#"{"concepts": ["vapor chamber"]}"#));

        let (executor, store, _) = setup(client).await;
        let state = store
            .append_stage_result(
                "inst-1",
                "framing",
                StageRecord::new(serde_json::json!({ "problem_statement": "Dissipate 200W" })),
            )
            .await
            .unwrap();

        let catalog = StageCatalog::new(vec![framing(), concepts()]).unwrap();
        let stage = catalog.next_stage(&state).unwrap();
        let result = executor.execute(&state, stage).await;
        assert!(result.outcome.is_success());
    }

    #[test]
    fn test_build_messages_includes_answers() {
        let mut state = ChainState::new("i", "o", "request text");
        state.status = crate::storage::ChainStatus::Running;
        state.apply_pause("framing", "Budget?").unwrap();
        state.apply_answer("Under $50").unwrap();

        let messages = build_messages(&state, &framing());
        let joined: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert!(joined.iter().any(|m| m.contains("Q: Budget?\nA: Under $50")));
        assert!(joined
            .last()
            .unwrap()
            .contains("Required fields: problem_statement."));
    }
}
