//! Shared fixtures for pipeline integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use analysis_chain::config::{
    Config, DatabaseConfig, LangbaseConfig, LogFormat, LoggingConfig, PipelineConfig,
    RequestConfig,
};
use analysis_chain::error::{LangbaseError, LangbaseResult};
use analysis_chain::langbase::{PipeRequest, ReasoningClient};
use analysis_chain::pipeline::{
    stages, EvidenceEnforcer, EvidencePolicy, ExecutionTracker, PipelineOrchestrator,
    StageNotifier, StepExecutor, TracingNotifier,
};
use analysis_chain::storage::{ChainStore, SqliteStorage};

pub const PREFIX: &str = "test";

/// Pipe name of a built-in stage under the test prefix.
pub fn pipe(stage_id: &str) -> String {
    stages::pipe_name(PREFIX, stage_id)
}

pub fn test_config(db_path: &Path) -> Config {
    Config {
        langbase: LangbaseConfig {
            api_key: "test-api-key".to_string(),
            base_url: "http://localhost:0".to_string(),
        },
        database: DatabaseConfig {
            path: db_path.to_path_buf(),
            max_connections: 2,
        },
        logging: LoggingConfig {
            level: "warn".to_string(),
            format: LogFormat::Pretty,
        },
        request: RequestConfig {
            timeout_ms: 2_000,
            max_attempts: 3,
            retry_delay_ms: 1,
            max_retry_delay_ms: 5,
        },
        pipeline: PipelineConfig {
            drain_poll_interval_ms: 10,
            drain_max_wait_ms: 2_000,
            pipe_prefix: PREFIX.to_string(),
            ..PipelineConfig::default()
        },
    }
}

/// Well-formed output for each built-in stage.
pub fn good_output(stage_id: &str) -> String {
    let value = match stage_id {
        stages::PROBLEM_FRAMING => serde_json::json!({
            "problem_statement": "Passively cool a 200W CPU in a sealed enclosure",
            "success_criteria": ["Junction below 85C"],
            "assumptions": ["Ambient 35C"],
            "domain": "thermal"
        }),
        stages::CONSTRAINT_ANALYSIS => serde_json::json!({
            "contradictions": [
                { "improving": "heat rejection", "worsening": "enclosure volume", "explanation": "fins need area" }
            ],
            "hard_constraints": ["No fans"],
            "soft_constraints": ["Cost under $40"]
        }),
        stages::PRIOR_ART_SEARCH => serde_json::json!({
            "findings": [{ "title": "Loop heat pipes", "summary": "capillary pumped", "relevance": "no moving parts" }],
            "claims": [],
            "coverage_gaps": ["Non-English patents"]
        }),
        stages::SOLUTION_CONCEPTS => serde_json::json!({
            "concepts": [{ "name": "Vapor chamber lid", "mechanism": "two-phase spreading", "resolves": ["volume"], "risks": ["dry-out"] }],
            "novelty_claims": [],
            "self_critique": {
                "acknowledged_gaps": [
                    "Dry-out behaviour above 150W was not modelled",
                    "Enclosure surface emissivity was assumed, not measured"
                ],
                "confidence": "medium"
            }
        }),
        _ => serde_json::json!({
            "executive_summary": "A vapor chamber lid meets the thermal target without fans.",
            "recommended_concept": "Vapor chamber lid",
            "next_steps": ["Build a thermal test vehicle"],
            "key_claims": [],
            "self_critique": {
                "acknowledged_gaps": [
                    "Long-term wick degradation data is missing",
                    "Manufacturing tolerance of the lid seal is unknown"
                ],
                "confidence": "medium"
            }
        }),
    };
    value.to_string()
}

/// Reasoning client driven by per-pipe scripts.
///
/// Scripted responses for a pipe are consumed first; afterwards the pipe
/// answers with [`good_output`] for its stage.
#[derive(Default)]
pub struct ScriptedClient {
    scripts: Mutex<HashMap<String, VecDeque<LangbaseResult<String>>>>,
    calls: Mutex<Vec<PipeRequest>>,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a response for a stage's pipe.
    pub fn script(&self, stage_id: &str, response: LangbaseResult<String>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(pipe(stage_id))
            .or_default()
            .push_back(response);
    }

    pub fn calls_for(&self, stage_id: &str) -> usize {
        let name = pipe(stage_id);
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.name == name)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn requests_for(&self, stage_id: &str) -> Vec<PipeRequest> {
        let name = pipe(stage_id);
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.name == name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ReasoningClient for ScriptedClient {
    async fn complete(&self, request: PipeRequest) -> LangbaseResult<String> {
        self.calls.lock().unwrap().push(request.clone());

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.name)
            .and_then(VecDeque::pop_front);
        if let Some(response) = scripted {
            return response;
        }

        let stage_id = request
            .name
            .strip_prefix(&format!("{}-", PREFIX))
            .unwrap_or(&request.name)
            .replace('-', "_");
        Ok(good_output(&stage_id))
    }
}

pub fn transient() -> LangbaseResult<String> {
    Err(LangbaseError::Api {
        status: 503,
        message: "service overloaded".to_string(),
    })
}

/// Wire an orchestrator the way `main` does, over the given store and client.
pub fn build_orchestrator(
    config: &Config,
    store: Arc<SqliteStorage>,
    client: Arc<ScriptedClient>,
    tracker: ExecutionTracker,
    notifier: Option<Arc<dyn StageNotifier>>,
) -> PipelineOrchestrator {
    let store: Arc<dyn ChainStore> = store;
    let executor = StepExecutor::new(
        client,
        store.clone(),
        tracker,
        EvidenceEnforcer::new(EvidencePolicy::from_config(&config.pipeline)),
    );
    PipelineOrchestrator::new(
        stages::builtin_catalog(config).expect("valid catalog"),
        store,
        executor,
        notifier.unwrap_or_else(|| Arc::new(TracingNotifier)),
    )
}
