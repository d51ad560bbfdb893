//! Evidence calibration and self-critique checks.
//!
//! Claims are never rejected for being miscalibrated: confidence that the
//! documented sources cannot support is corrected downward and flagged.
//! Self-critique quality is advisory and only ever produces warnings.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;

use super::schema::{OutputSchema, ValidatedOutput};
use super::StageFlag;
use crate::config::PipelineConfig;
use crate::error::StageError;

/// Declared confidence of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How thoroughly a claim's sources document the search behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Completeness {
    None,
    Minimal,
    Partial,
    Thorough,
    Comprehensive,
}

impl Completeness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Completeness::None => "none",
            Completeness::Minimal => "minimal",
            Completeness::Partial => "partial",
            Completeness::Thorough => "thorough",
            Completeness::Comprehensive => "comprehensive",
        }
    }

    /// Compute completeness from documented sources.
    ///
    /// A source is documented when it says what was searched, where, and
    /// what was found.
    pub fn assess(sources: &[EvidenceSource]) -> Self {
        if sources.is_empty() {
            return Completeness::None;
        }
        let documented: Vec<_> = sources.iter().filter(|s| s.is_documented()).collect();
        let with_limits = documented.iter().filter(|s| s.states_limitations()).count();

        match documented.len() {
            0 => Completeness::Minimal,
            n if n >= 3 && with_limits == n => Completeness::Comprehensive,
            n if n >= 2 && with_limits >= 1 => Completeness::Thorough,
            _ => Completeness::Partial,
        }
    }

    /// Highest confidence this completeness can support.
    pub fn confidence_ceiling(&self) -> Confidence {
        match self {
            Completeness::Comprehensive | Completeness::Thorough => Confidence::High,
            Completeness::Partial | Completeness::Minimal => Confidence::Medium,
            Completeness::None => Confidence::Low,
        }
    }
}

impl std::fmt::Display for Completeness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Completeness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(Completeness::None),
            "minimal" => Ok(Completeness::Minimal),
            "partial" => Ok(Completeness::Partial),
            "thorough" => Ok(Completeness::Thorough),
            "comprehensive" => Ok(Completeness::Comprehensive),
            _ => Err(format!("Unknown completeness: {}", s)),
        }
    }
}

/// One documented search behind a claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceSource {
    /// What was searched for.
    #[serde(default)]
    pub searched: String,
    /// Where (database, corpus, site).
    #[serde(default)]
    pub location: String,
    /// What the search turned up.
    #[serde(default)]
    pub findings: String,
    /// Explicit coverage limitations.
    #[serde(default)]
    pub limitations: String,
}

impl EvidenceSource {
    pub fn is_documented(&self) -> bool {
        [&self.searched, &self.location, &self.findings]
            .iter()
            .all(|f| !f.trim().is_empty())
    }

    pub fn states_limitations(&self) -> bool {
        !self.limitations.trim().is_empty()
    }
}

/// A factual or novelty statement inside a stage output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceClaim {
    pub claim: String,
    pub confidence: Confidence,
    pub requires_evidence: bool,
    pub sources: Vec<EvidenceSource>,
}

/// A stage's acknowledgement of its own blind spots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfCritique {
    pub acknowledged_gaps: Vec<String>,
    pub confidence: Confidence,
}

/// Calibration outcome for one claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimAssessment {
    /// Path of the claim, e.g. `novelty_claims[1]`.
    pub field: String,
    pub declared_confidence: Confidence,
    pub final_confidence: Confidence,
    pub completeness: Completeness,
    pub calibration_adjusted: bool,
    /// Why the claim was adjusted, in check order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
}

/// Self-critique gap check outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CritiqueAssessment {
    pub field: String,
    /// Distinct gaps that passed the generic-phrase filter.
    pub distinct_gaps: usize,
    pub required_gaps: usize,
    /// Gaps discarded as generic or duplicate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected_gaps: Vec<String>,
    pub sufficient: bool,
}

/// Completeness/calibration report kept alongside the stage output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceReport {
    pub claims: Vec<ClaimAssessment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critique: Option<CritiqueAssessment>,
}

impl EvidenceReport {
    /// Whether any claim was corrected.
    pub fn calibration_adjusted(&self) -> bool {
        self.claims.iter().any(|c| c.calibration_adjusted)
    }
}

/// Thresholds for the self-critique check.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidencePolicy {
    pub min_critique_gaps: usize,
    pub min_gap_chars: usize,
    /// Phrases that carry no information on their own.
    pub generic_phrases: Vec<String>,
}

const GENERIC_PHRASES: &[&str] = &[
    "more research is needed",
    "more research needed",
    "further research",
    "further investigation",
    "more data is needed",
    "more data needed",
    "limited information",
    "limited data",
    "results may vary",
    "may not be accurate",
    "could be wrong",
    "might be incomplete",
    "some assumptions",
    "various limitations",
    "other factors",
    "not applicable",
    "no gaps",
    "none",
    "n/a",
];

impl Default for EvidencePolicy {
    fn default() -> Self {
        Self {
            min_critique_gaps: 2,
            min_gap_chars: 20,
            generic_phrases: GENERIC_PHRASES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl EvidencePolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            min_critique_gaps: config.critique_min_gaps,
            min_gap_chars: config.critique_min_gap_chars,
            ..Self::default()
        }
    }

    /// A gap is generic when little remains once stock phrases are removed.
    ///
    /// Phrases match whole words only, so "none" leaves "nonexistent" alone.
    fn is_generic(&self, normalized: &str) -> bool {
        let phrases: Vec<Vec<String>> = self
            .generic_phrases
            .iter()
            .map(|p| normalize_gap(p))
            .filter(|p| !p.is_empty())
            .map(|p| p.split(' ').map(str::to_string).collect())
            .collect();
        let words: Vec<&str> = normalized.split_whitespace().collect();

        let mut kept = Vec::with_capacity(words.len());
        let mut i = 0;
        while i < words.len() {
            let matched = phrases.iter().find(|phrase| {
                words.len() - i >= phrase.len()
                    && phrase.iter().zip(&words[i..]).all(|(p, w)| p == w)
            });
            match matched {
                Some(phrase) => i += phrase.len(),
                None => {
                    kept.push(words[i]);
                    i += 1;
                }
            }
        }
        kept.join(" ").chars().count() < self.min_gap_chars
    }
}

fn normalize_gap(gap: &str) -> String {
    gap.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '/' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Output of [`EvidenceEnforcer::enforce`].
#[derive(Debug, Clone, PartialEq)]
pub struct EnforcedOutput {
    /// Output with calibrated claims written back.
    pub value: Value,
    /// Defaulting flags from validation followed by enforcement flags.
    pub flags: Vec<StageFlag>,
    pub report: EvidenceReport,
}

/// Applies claim calibration and self-critique checks to validated output.
#[derive(Debug, Clone, Default)]
pub struct EvidenceEnforcer {
    policy: EvidencePolicy,
}

impl EvidenceEnforcer {
    pub fn new(policy: EvidencePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &EvidencePolicy {
        &self.policy
    }

    /// Calibrate every claim field and check the self-critique block.
    pub fn enforce(
        &self,
        schema: &OutputSchema,
        output: ValidatedOutput,
    ) -> Result<EnforcedOutput, StageError> {
        let mut report = EvidenceReport::default();
        let mut flags = output.flags.clone();
        let mut value = output.value.clone();

        for field in schema.claim_fields() {
            let claims = output.claims(field)?;
            for (index, claim) in claims.iter().enumerate() {
                let path = format!("{}[{}]", field, index);
                let declared_completeness = value
                    .get(field)
                    .and_then(|c| c.get(index))
                    .and_then(|c| c.get("completeness"))
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<Completeness>().ok());

                let assessment = calibrate(&path, claim, declared_completeness);
                if assessment.calibration_adjusted {
                    flags.push(StageFlag::calibration(
                        format!("{}.confidence", path),
                        assessment.reasons.join("; "),
                    ));
                }
                if let Some(slot) = value.get_mut(field).and_then(|c| c.get_mut(index)) {
                    write_back(slot, &assessment);
                }
                report.claims.push(assessment);
            }
        }

        if let Some(field) = schema.self_critique_field() {
            let critique = output.self_critique(field)?;
            let assessment = self.assess_critique(field, &critique);
            if !assessment.sufficient {
                flags.push(StageFlag::critique(
                    field,
                    format!(
                        "{} distinct non-generic gap(s) acknowledged, {} required",
                        assessment.distinct_gaps, assessment.required_gaps
                    ),
                ));
            }
            report.critique = Some(assessment);
        }

        Ok(EnforcedOutput {
            value,
            flags,
            report,
        })
    }

    fn assess_critique(&self, field: &str, critique: &SelfCritique) -> CritiqueAssessment {
        let mut seen = HashSet::new();
        let mut rejected = Vec::new();

        for gap in &critique.acknowledged_gaps {
            let normalized = normalize_gap(gap);
            if self.policy.is_generic(&normalized) || !seen.insert(normalized) {
                rejected.push(gap.clone());
            }
        }

        let distinct = seen.len();

        CritiqueAssessment {
            field: field.to_string(),
            distinct_gaps: distinct,
            required_gaps: self.policy.min_critique_gaps,
            rejected_gaps: rejected,
            sufficient: distinct >= self.policy.min_critique_gaps,
        }
    }
}

/// Apply the calibration checks to one claim, in order.
fn calibrate(
    path: &str,
    claim: &EvidenceClaim,
    declared_completeness: Option<Completeness>,
) -> ClaimAssessment {
    let completeness = Completeness::assess(&claim.sources);
    let mut confidence = claim.confidence;
    let mut reasons = Vec::new();

    if claim.requires_evidence && claim.sources.is_empty() && confidence > Confidence::Low {
        reasons.push(format!(
            "requires evidence but cites no sources; {} -> low",
            confidence
        ));
        confidence = Confidence::Low;
    }

    let ceiling = completeness.confidence_ceiling();
    if confidence > ceiling {
        reasons.push(format!(
            "{} confidence needs stronger evidence than '{}' completeness; {} -> {}",
            confidence, completeness, confidence, ceiling
        ));
        confidence = ceiling;
    }

    if let Some(declared) = declared_completeness {
        if declared > completeness {
            reasons.push(format!(
                "declared completeness '{}' exceeds documented '{}'",
                declared, completeness
            ));
        }
    }

    ClaimAssessment {
        field: path.to_string(),
        declared_confidence: claim.confidence,
        final_confidence: confidence,
        completeness,
        calibration_adjusted: !reasons.is_empty(),
        reasons,
    }
}

fn write_back(slot: &mut Value, assessment: &ClaimAssessment) {
    if let Value::Object(object) = slot {
        object.insert("confidence".to_string(), json!(assessment.final_confidence));
        object.insert("completeness".to_string(), json!(assessment.completeness));
        object.insert(
            "calibration_adjusted".to_string(),
            json!(assessment.calibration_adjusted),
        );
        if assessment.calibration_adjusted {
            object.insert(
                "declared_confidence".to_string(),
                json!(assessment.declared_confidence),
            );
        }
    }
}
