//! End-to-end pipeline tests over the built-in catalog.
//!
//! Uses a scripted reasoning client and real SQLite stores (in-memory, or a
//! temp file where restart behaviour matters).

mod common;

use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

use analysis_chain::error::{ErrorKind, LangbaseError};
use analysis_chain::pipeline::{
    stages, EvidenceEnforcer, EvidencePolicy, ExecutionTracker, FlagKind, StageOutcome,
    StepExecutor,
};
use analysis_chain::storage::{ChainStatus, ChainStore, SqliteStorage, StageRecord, StatusUpdate};

use common::{build_orchestrator, good_output, test_config, transient, ScriptedClient};

const ALL_STAGES: [&str; 5] = [
    stages::PROBLEM_FRAMING,
    stages::CONSTRAINT_ANALYSIS,
    stages::PRIOR_ART_SEARCH,
    stages::SOLUTION_CONCEPTS,
    stages::REPORT_SYNTHESIS,
];

async fn memory_store() -> Arc<SqliteStorage> {
    Arc::new(SqliteStorage::new_in_memory().await.unwrap())
}

#[cfg(test)]
mod scenario_tests {
    use super::*;
    #[allow(unused_imports)]
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_transient_failures_then_completion() {
        let config = test_config(std::path::Path::new("unused.db"));
        let client = ScriptedClient::new();
        client.script(stages::CONSTRAINT_ANALYSIS, transient());
        client.script(stages::CONSTRAINT_ANALYSIS, transient());

        let orch = build_orchestrator(&config, memory_store().await, client.clone(), ExecutionTracker::new(), None);
        let id = orch.create_analysis("owner-1", "Cool a CPU passively").await.unwrap();
        let state = orch.run(&id).await.unwrap();

        assert_eq!(state.status, ChainStatus::Completed);
        assert_eq!(state.completed_steps, ALL_STAGES.map(String::from).to_vec());
        assert_eq!(client.calls_for(stages::CONSTRAINT_ANALYSIS), 3);
        assert_eq!(state.outputs[stages::CONSTRAINT_ANALYSIS].attempts, 3);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_unsupported_high_confidence_claim_is_downgraded_and_pipeline_proceeds() {
        let config = test_config(std::path::Path::new("unused.db"));
        let client = ScriptedClient::new();
        client.script(
            stages::PRIOR_ART_SEARCH,
            Ok(json!({
                "findings": [{ "title": "Graphene spreaders" }],
                "claims": [{
                    "claim": "No one has combined graphene spreaders with loop heat pipes",
                    "confidence": "high",
                    "requires_evidence": true,
                    "sources": []
                }]
            })
            .to_string()),
        );

        let orch = build_orchestrator(&config, memory_store().await, client.clone(), ExecutionTracker::new(), None);
        let id = orch.create_analysis("owner-1", "Cool a CPU passively").await.unwrap();
        let state = orch.run(&id).await.unwrap();

        assert_eq!(state.status, ChainStatus::Completed);

        let record = &state.outputs[stages::PRIOR_ART_SEARCH];
        assert_eq!(record.output["claims"][0]["confidence"], json!("low"));
        assert_eq!(record.output["claims"][0]["calibration_adjusted"], json!(true));
        assert!(record
            .flags
            .iter()
            .any(|f| f.kind == FlagKind::CalibrationAdjusted));
        let report = record.report.as_ref().unwrap();
        assert!(report.calibration_adjusted());
    }

    #[tokio::test]
    async fn test_clarification_pauses_and_resumes_at_the_same_stage() {
        let config = test_config(std::path::Path::new("unused.db"));
        let client = ScriptedClient::new();
        client.script(
            stages::PROBLEM_FRAMING,
            Ok(r#"{"needs_clarification": {"question": "What is the CPU's TDP?"}}"#.to_string()),
        );

        let orch = build_orchestrator(&config, memory_store().await, client.clone(), ExecutionTracker::new(), None);
        let id = orch.create_analysis("owner-1", "Cool a CPU").await.unwrap();

        let paused = orch.run(&id).await.unwrap();
        assert_eq!(paused.status, ChainStatus::NeedsClarification);
        assert_eq!(paused.current_stage.as_deref(), Some(stages::PROBLEM_FRAMING));
        assert_eq!(
            paused.pending_clarification().unwrap().question,
            "What is the CPU's TDP?"
        );
        assert!(paused.completed_steps.is_empty());

        // running a paused instance does nothing
        assert_eq!(orch.run(&id).await.unwrap().status, ChainStatus::NeedsClarification);
        assert_eq!(client.total_calls(), 1);

        let done = orch.submit_clarification_answer(&id, "200 watts").await.unwrap();
        assert_eq!(done.status, ChainStatus::Completed);
        assert_eq!(client.calls_for(stages::PROBLEM_FRAMING), 2);

        let resumed_request = &client.requests_for(stages::PROBLEM_FRAMING)[1];
        assert!(resumed_request
            .messages
            .iter()
            .any(|m| m.content.contains("A: 200 watts")));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_with_transient_kind() {
        let config = test_config(std::path::Path::new("unused.db"));
        let client = ScriptedClient::new();
        for _ in 0..3 {
            client.script(stages::PRIOR_ART_SEARCH, transient());
        }

        let orch = build_orchestrator(&config, memory_store().await, client.clone(), ExecutionTracker::new(), None);
        let id = orch.create_analysis("owner-1", "input").await.unwrap();
        let state = orch.run(&id).await.unwrap();

        assert_eq!(state.status, ChainStatus::Failed);
        let error = state.last_error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::TransientServiceError);
        assert_eq!(error.stage_id.as_deref(), Some(stages::PRIOR_ART_SEARCH));
        // earlier checkpoints survive the failure
        assert_eq!(state.completed_steps.len(), 2);
    }

    #[tokio::test]
    async fn test_anchor_missing_twice_fails_with_validation_kind() {
        let config = test_config(std::path::Path::new("unused.db"));
        let client = ScriptedClient::new();
        for _ in 0..2 {
            client.script(stages::CONSTRAINT_ANALYSIS, Ok(r#"{"hard_constraints": []}"#.to_string()));
        }

        let orch = build_orchestrator(&config, memory_store().await, client.clone(), ExecutionTracker::new(), None);
        let id = orch.create_analysis("owner-1", "input").await.unwrap();
        let state = orch.run(&id).await.unwrap();

        assert_eq!(state.status, ChainStatus::Failed);
        assert_eq!(state.last_error.unwrap().kind, ErrorKind::ValidationError);
        assert_eq!(client.calls_for(stages::CONSTRAINT_ANALYSIS), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_without_retry() {
        let config = test_config(std::path::Path::new("unused.db"));
        let client = ScriptedClient::new();
        client.script(
            stages::PROBLEM_FRAMING,
            Err(LangbaseError::Api {
                status: 400,
                message: "pipe not found".to_string(),
            }),
        );

        let orch = build_orchestrator(&config, memory_store().await, client.clone(), ExecutionTracker::new(), None);
        let id = orch.create_analysis("owner-1", "input").await.unwrap();
        let state = orch.run(&id).await.unwrap();

        assert_eq!(state.status, ChainStatus::Failed);
        assert_eq!(state.last_error.unwrap().kind, ErrorKind::ServiceError);
        assert_eq!(client.total_calls(), 1);
    }
}

#[cfg(test)]
mod idempotence_tests {
    use super::*;
    #[allow(unused_imports)]
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_rerun_of_completed_instance_makes_no_calls() {
        let config = test_config(std::path::Path::new("unused.db"));
        let client = ScriptedClient::new();
        let orch = build_orchestrator(&config, memory_store().await, client.clone(), ExecutionTracker::new(), None);

        let id = orch.create_analysis("owner-1", "input").await.unwrap();
        let first = orch.run(&id).await.unwrap();
        let calls = client.total_calls();
        assert_eq!(calls, 5);

        let second = orch.run(&id).await.unwrap();
        assert_eq!(client.total_calls(), calls);
        assert_eq!(second.outputs, first.outputs);
        assert_eq!(second.version, first.version);
    }

    #[tokio::test]
    async fn test_duplicate_stage_trigger_with_same_snapshot_calls_service_once() {
        let config = test_config(std::path::Path::new("unused.db"));
        let store = memory_store().await;
        let client = ScriptedClient::new();
        let executor = StepExecutor::new(
            client.clone(),
            store.clone(),
            ExecutionTracker::new(),
            EvidenceEnforcer::new(EvidencePolicy::from_config(&config.pipeline)),
        );
        let catalog = stages::builtin_catalog(&config).unwrap();
        let framing = catalog.get(stages::PROBLEM_FRAMING).unwrap();

        let snapshot = store.create_if_absent("inst-1", "owner-1", "input").await.unwrap();
        let first = executor.execute(&snapshot, framing).await;
        let second = executor.execute(&snapshot, framing).await;

        assert_eq!(first.outcome, StageOutcome::Success);
        assert_eq!(second.outcome, StageOutcome::Success);
        assert!(second.from_checkpoint);
        assert_eq!(client.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_completed_steps_follow_dependency_order() {
        let config = test_config(std::path::Path::new("unused.db"));
        let orch = build_orchestrator(&config, memory_store().await, ScriptedClient::new(), ExecutionTracker::new(), None);

        let id = orch.create_analysis("owner-1", "input").await.unwrap();
        let state = orch.run(&id).await.unwrap();

        for (position, stage_id) in state.completed_steps.iter().enumerate() {
            let stage = orch.catalog().get(stage_id).unwrap();
            for dep in &stage.dependencies {
                let dep_position = state.completed_steps.iter().position(|s| s == dep).unwrap();
                assert!(dep_position < position, "{} ran before {}", stage_id, dep);
            }
        }
    }

    #[tokio::test]
    async fn test_missing_optional_critique_defaults_silently() {
        let config = test_config(std::path::Path::new("unused.db"));
        let client = ScriptedClient::new();
        // no self_critique and no novelty_claims: both optional
        client.script(
            stages::SOLUTION_CONCEPTS,
            Ok(json!({ "concepts": [{ "name": "Phase-change lid" }] }).to_string()),
        );

        let orch = build_orchestrator(&config, memory_store().await, client, ExecutionTracker::new(), None);
        let id = orch.create_analysis("owner-1", "input").await.unwrap();
        let state = orch.run(&id).await.unwrap();

        assert_eq!(state.status, ChainStatus::Completed);
        let record = &state.outputs[stages::SOLUTION_CONCEPTS];
        assert!(record.flags.iter().any(|f| f.kind == FlagKind::Defaulted && f.field == "self_critique"));
        // an empty defaulted critique still has too few gaps
        assert!(record.flags.iter().any(|f| f.kind == FlagKind::CritiqueInsufficient));
    }
}

#[cfg(test)]
mod restart_tests {
    use super::*;
    #[allow(unused_imports)]
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_restart_resumes_from_last_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir.path().join("analysis.db"));

        // First process: two stages checkpointed, then the process dies.
        let id = {
            let store = SqliteStorage::new(&config.database).await.unwrap();
            let state = store.create_if_absent("inst-crash", "owner-1", "input").await.unwrap();
            store
                .transition(
                    &state.id,
                    StatusUpdate::to(ChainStatus::Running).with_stage(stages::PROBLEM_FRAMING),
                )
                .await
                .unwrap();
            for stage_id in [stages::PROBLEM_FRAMING, stages::CONSTRAINT_ANALYSIS] {
                let output: serde_json::Value = serde_json::from_str(&good_output(stage_id)).unwrap();
                store
                    .append_stage_result(&state.id, stage_id, StageRecord::new(output))
                    .await
                    .unwrap();
            }
            store.close().await;
            state.id
        };

        // Second process over the same file.
        let store = Arc::new(SqliteStorage::new(&config.database).await.unwrap());
        let client = ScriptedClient::new();
        let orch = build_orchestrator(&config, store, client.clone(), ExecutionTracker::new(), None);

        let resumed = orch.resume_interrupted().await.unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].id, id);
        assert_eq!(resumed[0].status, ChainStatus::Completed);

        assert_eq!(client.calls_for(stages::PROBLEM_FRAMING), 0);
        assert_eq!(client.calls_for(stages::CONSTRAINT_ANALYSIS), 0);
        assert_eq!(client.calls_for(stages::PRIOR_ART_SEARCH), 1);
        assert_eq!(client.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_instance_is_not_resumed() {
        let config = test_config(std::path::Path::new("unused.db"));
        let client = ScriptedClient::new();
        let orch = build_orchestrator(&config, memory_store().await, client.clone(), ExecutionTracker::new(), None);

        let id = orch.create_analysis("owner-1", "input").await.unwrap();
        orch.cancel_analysis(&id).await.unwrap();

        assert!(orch.resume_interrupted().await.unwrap().is_empty());
        assert_eq!(orch.run(&id).await.unwrap().status, ChainStatus::Failed);
        assert_eq!(client.total_calls(), 0);
    }
}
