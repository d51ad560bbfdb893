//! The built-in five-stage analysis catalog.

use std::time::Duration;

use super::schema::{FieldKind, FieldSpec, OutputSchema};
use super::{RetryPolicy, StageCatalog, StageDefinition};
use crate::config::Config;
use crate::error::PipelineResult;
use crate::prompts::{
    with_evidence_rules, CONSTRAINT_ANALYSIS_PROMPT, PRIOR_ART_PROMPT, PROBLEM_FRAMING_PROMPT,
    REPORT_SYNTHESIS_PROMPT, SOLUTION_CONCEPTS_PROMPT,
};

pub const PROBLEM_FRAMING: &str = "problem_framing";
pub const CONSTRAINT_ANALYSIS: &str = "constraint_analysis";
pub const PRIOR_ART_SEARCH: &str = "prior_art_search";
pub const SOLUTION_CONCEPTS: &str = "solution_concepts";
pub const REPORT_SYNTHESIS: &str = "report_synthesis";

/// Pipe name for a stage, e.g. `analysis-chain-prior-art-search`.
pub fn pipe_name(prefix: &str, stage_id: &str) -> String {
    format!("{}-{}", prefix, stage_id.replace('_', "-"))
}

fn problem_framing_schema() -> OutputSchema {
    OutputSchema::new(vec![
        FieldSpec::anchor("problem_statement", FieldKind::String),
        FieldSpec::optional("success_criteria", FieldKind::StringArray),
        FieldSpec::optional("assumptions", FieldKind::StringArray),
        FieldSpec::optional("domain", FieldKind::String),
    ])
}

fn constraint_analysis_schema() -> OutputSchema {
    OutputSchema::new(vec![
        FieldSpec::anchor(
            "contradictions",
            FieldKind::ObjectArray(vec![
                FieldSpec::anchor("improving", FieldKind::String),
                FieldSpec::optional("worsening", FieldKind::String),
                FieldSpec::optional("explanation", FieldKind::String),
            ]),
        ),
        FieldSpec::optional("hard_constraints", FieldKind::StringArray),
        FieldSpec::optional("soft_constraints", FieldKind::StringArray),
    ])
}

fn prior_art_schema() -> OutputSchema {
    OutputSchema::new(vec![
        FieldSpec::anchor(
            "findings",
            FieldKind::ObjectArray(vec![
                FieldSpec::anchor("title", FieldKind::String),
                FieldSpec::optional("summary", FieldKind::String),
                FieldSpec::optional("relevance", FieldKind::String),
            ]),
        ),
        FieldSpec::optional("claims", FieldKind::Claims),
        FieldSpec::optional("coverage_gaps", FieldKind::StringArray),
    ])
}

fn solution_concepts_schema() -> OutputSchema {
    OutputSchema::new(vec![
        FieldSpec::anchor(
            "concepts",
            FieldKind::ObjectArray(vec![
                FieldSpec::anchor("name", FieldKind::String),
                FieldSpec::optional("mechanism", FieldKind::String),
                FieldSpec::optional("resolves", FieldKind::StringArray),
                FieldSpec::optional("risks", FieldKind::StringArray),
            ]),
        ),
        FieldSpec::optional("novelty_claims", FieldKind::Claims),
        FieldSpec::optional("self_critique", FieldKind::SelfCritique),
    ])
}

fn report_synthesis_schema() -> OutputSchema {
    OutputSchema::new(vec![
        FieldSpec::anchor("executive_summary", FieldKind::String),
        FieldSpec::optional("recommended_concept", FieldKind::String),
        FieldSpec::optional("next_steps", FieldKind::StringArray),
        FieldSpec::optional("key_claims", FieldKind::Claims),
        FieldSpec::optional("self_critique", FieldKind::SelfCritique),
    ])
}

/// Build the built-in catalog with retry and timeout taken from config.
pub fn builtin_catalog(config: &Config) -> PipelineResult<StageCatalog> {
    let retry = RetryPolicy {
        max_attempts: config.request.max_attempts,
        initial_backoff: Duration::from_millis(config.request.retry_delay_ms),
        multiplier: 2,
        max_backoff: Duration::from_millis(config.request.max_retry_delay_ms),
    };
    let timeout = config.request.timeout();
    let prefix = config.pipeline.pipe_prefix.as_str();

    let stage = |id: &str, ordinal: u32, prompt: &str, schema: OutputSchema| {
        let has_claims = schema.claim_fields().next().is_some();
        StageDefinition::new(id, ordinal, pipe_name(prefix, id))
            .with_prompt(with_evidence_rules(prompt, has_claims))
            .with_schema(schema)
            .with_retry(retry.clone())
            .with_timeout(timeout)
    };

    StageCatalog::new(vec![
        stage(PROBLEM_FRAMING, 1, PROBLEM_FRAMING_PROMPT, problem_framing_schema())
            .allow_clarification(),
        stage(
            CONSTRAINT_ANALYSIS,
            2,
            CONSTRAINT_ANALYSIS_PROMPT,
            constraint_analysis_schema(),
        )
        .depends_on([PROBLEM_FRAMING]),
        stage(PRIOR_ART_SEARCH, 3, PRIOR_ART_PROMPT, prior_art_schema())
            .depends_on([PROBLEM_FRAMING, CONSTRAINT_ANALYSIS]),
        stage(
            SOLUTION_CONCEPTS,
            4,
            SOLUTION_CONCEPTS_PROMPT,
            solution_concepts_schema(),
        )
        .depends_on([CONSTRAINT_ANALYSIS, PRIOR_ART_SEARCH]),
        stage(
            REPORT_SYNTHESIS,
            5,
            REPORT_SYNTHESIS_PROMPT,
            report_synthesis_schema(),
        )
        .depends_on([
            PROBLEM_FRAMING,
            CONSTRAINT_ANALYSIS,
            PRIOR_ART_SEARCH,
            SOLUTION_CONCEPTS,
        ]),
    ])
}
