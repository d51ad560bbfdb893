//! Antifragile parsing of raw stage output.
//!
//! Each stage declares an [`OutputSchema`]: a table of [`FieldSpec`]s saying,
//! per field, what JSON kind is expected and whether the field is an anchor
//! (required, never fabricated) or optional with a conservative default.
//!
//! [`OutputSchema::validate`] runs a generic pre-pass over the raw JSON that
//! substitutes defaults for absent or malformed optional fields and records
//! a [`StageFlag`] for each substitution. Only a missing or mistyped anchor
//! fails the stage. Typed views ([`ValidatedOutput::claims`],
//! [`ValidatedOutput::self_critique`]) are then strict `serde`
//! deserializations of the normalized JSON.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::evidence::{EvidenceClaim, SelfCritique};
use super::StageFlag;
use crate::error::StageError;

/// Allowed values of confidence-like enums, strongest first.
pub const CONFIDENCE_LEVELS: &[&str] = &["high", "medium", "low"];

/// Field name a stage uses to ask the owner for more input.
pub const CLARIFICATION_FIELD: &str = "needs_clarification";

/// Expected JSON shape of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    Bool,
    Number,
    Object,
    /// Array of anything.
    Array,
    /// Array of strings; non-string items are dropped.
    StringArray,
    /// One of a fixed set of lowercase strings.
    Enum(&'static [&'static str]),
    /// Array of objects, each walked with the nested table.
    ObjectArray(Vec<FieldSpec>),
    /// Array of evidence claims (subject to calibration).
    Claims,
    /// Self-critique block (subject to gap checks).
    SelfCritique,
}

impl FieldKind {
    fn describe(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Bool => "boolean",
            FieldKind::Number => "number",
            FieldKind::Object | FieldKind::SelfCritique => "object",
            FieldKind::Array
            | FieldKind::StringArray
            | FieldKind::ObjectArray(_)
            | FieldKind::Claims => "array",
            FieldKind::Enum(_) => "enum string",
        }
    }

    /// Conservative default for an optional field of this kind.
    fn conservative_default(&self) -> Value {
        match self {
            FieldKind::String => json!(""),
            FieldKind::Bool => json!(false),
            FieldKind::Number => json!(0),
            FieldKind::Object => json!({}),
            FieldKind::Array
            | FieldKind::StringArray
            | FieldKind::ObjectArray(_)
            | FieldKind::Claims => json!([]),
            // lowest value of a strongest-first enum
            FieldKind::Enum(values) => json!(values.last().copied().unwrap_or_default()),
            FieldKind::SelfCritique => json!({ "acknowledged_gaps": [], "confidence": "low" }),
        }
    }
}

/// Whether a field may be defaulted.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRule {
    /// Required core content; absence fails the stage.
    Anchor,
    /// Substituted with `default` when absent or malformed.
    Optional { default: Value, reason: String },
}

/// One row of the default-policy table.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub rule: FieldRule,
}

impl FieldSpec {
    /// A required anchor field.
    pub fn anchor(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            rule: FieldRule::Anchor,
        }
    }

    /// An optional field with the kind's conservative default.
    pub fn optional(name: impl Into<String>, kind: FieldKind) -> Self {
        let default = kind.conservative_default();
        let reason = format!("conservative default {}", default);
        Self {
            name: name.into(),
            kind,
            rule: FieldRule::Optional { default, reason },
        }
    }

    /// Override the default value and the reason recorded with it.
    pub fn with_default(mut self, default: Value, reason: impl Into<String>) -> Self {
        self.rule = FieldRule::Optional {
            default,
            reason: reason.into(),
        };
        self
    }

    pub fn is_anchor(&self) -> bool {
        matches!(self.rule, FieldRule::Anchor)
    }
}

/// Default-policy table for one evidence claim.
pub fn claim_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::anchor("claim", FieldKind::String),
        FieldSpec::optional("confidence", FieldKind::Enum(CONFIDENCE_LEVELS))
            .with_default(json!("low"), "confidence not stated; assumed low"),
        FieldSpec::optional("requires_evidence", FieldKind::Bool),
        FieldSpec::optional("sources", FieldKind::ObjectArray(source_fields()))
            .with_default(json!([]), "no sources documented"),
    ]
}

/// Default-policy table for one evidence source.
pub fn source_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::optional("searched", FieldKind::String),
        FieldSpec::optional("location", FieldKind::String),
        FieldSpec::optional("findings", FieldKind::String),
        FieldSpec::optional("limitations", FieldKind::String)
            .with_default(json!(""), "coverage limitations not stated"),
    ]
}

/// Default-policy table for a self-critique block.
pub fn self_critique_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::optional("acknowledged_gaps", FieldKind::StringArray),
        FieldSpec::optional("confidence", FieldKind::Enum(CONFIDENCE_LEVELS))
            .with_default(json!("low"), "critique confidence not stated; assumed low"),
    ]
}

/// Output contract of a stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputSchema {
    pub fields: Vec<FieldSpec>,
}

impl OutputSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    /// Names of claim-bearing fields.
    pub fn claim_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.kind == FieldKind::Claims)
            .map(|f| f.name.as_str())
    }

    /// Name of the self-critique block, if the stage declares one.
    pub fn self_critique_field(&self) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.kind == FieldKind::SelfCritique)
            .map(|f| f.name.as_str())
    }

    /// Normalize a parsed stage output against the table.
    ///
    /// Fields not in the table pass through untouched.
    pub fn validate(&self, raw: Value) -> Result<ValidatedOutput, StageError> {
        let mut object = match raw {
            Value::Object(object) => object,
            other => {
                return Err(StageError::Validation {
                    field: "$".to_string(),
                    reason: format!("expected object, found {}", json_kind(&other)),
                })
            }
        };

        let mut flags = Vec::new();
        walk_object(&mut object, &self.fields, "", &mut flags)?;

        Ok(ValidatedOutput {
            value: Value::Object(object),
            flags,
        })
    }
}

/// Normalized stage output plus the defaulting flags raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedOutput {
    pub value: Value,
    pub flags: Vec<StageFlag>,
}

impl ValidatedOutput {
    /// Strictly deserialize a claims field.
    pub fn claims(&self, field: &str) -> Result<Vec<EvidenceClaim>, StageError> {
        typed(&self.value, field)
    }

    /// Strictly deserialize the self-critique block.
    pub fn self_critique(&self, field: &str) -> Result<SelfCritique, StageError> {
        typed(&self.value, field)
    }
}

fn typed<T: serde::de::DeserializeOwned>(value: &Value, field: &str) -> Result<T, StageError> {
    let inner = value.get(field).cloned().unwrap_or(Value::Null);
    serde_json::from_value(inner).map_err(|e| StageError::Validation {
        field: field.to_string(),
        reason: format!("does not match typed schema: {}", e),
    })
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn walk_object(
    object: &mut Map<String, Value>,
    table: &[FieldSpec],
    prefix: &str,
    flags: &mut Vec<StageFlag>,
) -> Result<(), StageError> {
    for field in table {
        let path = join(prefix, &field.name);
        let current = object.remove(&field.name);

        let normalized = match current {
            Some(Value::Null) | None => Err(Problem::Unusable("missing".to_string())),
            Some(value) => normalize(value, &field.kind, &path, flags),
        };

        match (normalized, &field.rule) {
            (Ok(value), _) => {
                object.insert(field.name.clone(), value);
            }
            (Err(Problem::Anchor(err)), _) => return Err(err),
            (Err(Problem::Unusable(reason)), FieldRule::Anchor) => {
                return Err(StageError::Validation {
                    field: path,
                    reason,
                });
            }
            (Err(Problem::Unusable(problem)), FieldRule::Optional { default, reason }) => {
                flags.push(StageFlag::defaulted(
                    path,
                    format!("{}; {}", problem, reason),
                ));
                object.insert(field.name.clone(), default.clone());
            }
        }
    }
    Ok(())
}

/// Why a value could not be kept.
enum Problem {
    /// The field's own value is unusable; optional fields get their default.
    Unusable(String),
    /// A nested item lacks an anchor; fails the stage whatever the rule.
    Anchor(StageError),
}

fn normalize(
    value: Value,
    kind: &FieldKind,
    path: &str,
    flags: &mut Vec<StageFlag>,
) -> Result<Value, Problem> {
    let mismatch = |v: &Value| {
        Problem::Unusable(format!(
            "expected {}, found {}",
            kind.describe(),
            json_kind(v)
        ))
    };

    match kind {
        FieldKind::String => match value {
            Value::String(s) if !s.trim().is_empty() => Ok(Value::String(s)),
            Value::String(_) => Err(Problem::Unusable("empty string".to_string())),
            other => Err(mismatch(&other)),
        },
        FieldKind::Bool => match value {
            Value::Bool(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        FieldKind::Number => match value {
            Value::Number(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        FieldKind::Object => match value {
            Value::Object(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        FieldKind::Array => match value {
            Value::Array(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        FieldKind::Enum(allowed) => match &value {
            Value::String(s) => {
                let lowered = s.trim().to_lowercase();
                if allowed.contains(&lowered.as_str()) {
                    Ok(Value::String(lowered))
                } else {
                    Err(Problem::Unusable(format!(
                        "'{}' is not one of {}",
                        s,
                        allowed.join("|")
                    )))
                }
            }
            other => Err(mismatch(other)),
        },
        FieldKind::StringArray => {
            let items = into_array(value, path, flags).map_err(|v| mismatch(&v))?;
            let total = items.len();
            let kept: Vec<Value> = items
                .into_iter()
                .filter(|item| matches!(item, Value::String(s) if !s.trim().is_empty()))
                .collect();
            if kept.len() < total {
                flags.push(StageFlag::defaulted(
                    path,
                    format!("dropped {} non-string item(s)", total - kept.len()),
                ));
            }
            Ok(Value::Array(kept))
        }
        FieldKind::ObjectArray(table) => {
            let items = into_array(value, path, flags).map_err(|v| mismatch(&v))?;
            walk_items(items, table, path, flags, false)
        }
        FieldKind::Claims => {
            let items = into_array(value, path, flags).map_err(|v| mismatch(&v))?;
            walk_items(items, &claim_fields(), path, flags, true)
        }
        FieldKind::SelfCritique => match value {
            Value::Object(mut object) => {
                walk_object(&mut object, &self_critique_fields(), path, flags)
                    .map_err(Problem::Anchor)?;
                Ok(Value::Object(object))
            }
            other => Err(mismatch(&other)),
        },
    }
}

/// A lone scalar where an array was expected is wrapped rather than lost.
fn into_array(value: Value, path: &str, flags: &mut Vec<StageFlag>) -> Result<Vec<Value>, Value> {
    match value {
        Value::Array(items) => Ok(items),
        scalar @ (Value::String(_) | Value::Object(_)) => {
            flags.push(StageFlag::defaulted(path, "wrapped single value into array"));
            Ok(vec![scalar])
        }
        other => Err(other),
    }
}

fn walk_items(
    items: Vec<Value>,
    table: &[FieldSpec],
    path: &str,
    flags: &mut Vec<StageFlag>,
    claims: bool,
) -> Result<Value, Problem> {
    let mut out = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let item_path = format!("{}[{}]", path, index);
        let mut object = match item {
            Value::Object(object) => object,
            Value::String(text) if claims && !text.trim().is_empty() => {
                flags.push(StageFlag::defaulted(
                    &item_path,
                    "bare claim text promoted to claim object",
                ));
                let mut object = Map::new();
                object.insert("claim".to_string(), Value::String(text));
                object
            }
            other => {
                flags.push(StageFlag::defaulted(
                    &item_path,
                    format!("dropped {} item", json_kind(&other)),
                ));
                continue;
            }
        };
        walk_object(&mut object, table, &item_path, flags).map_err(Problem::Anchor)?;
        out.push(Value::Object(object));
    }
    Ok(Value::Array(out))
}

/// Extract JSON from a completion string, handling markdown code blocks.
///
/// Attempts extraction in this order:
/// 1. Raw JSON (fast path)
/// 2. ```json ... ``` code blocks
/// 3. ``` ... ``` code blocks
/// 4. The outermost `{ ... }` span inside surrounding prose
pub fn extract_json_from_completion(completion: &str) -> Result<&str, String> {
    let trimmed = completion.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    if completion.contains("```json") {
        return completion
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ```json block but content was empty or malformed".to_string());
    }

    if completion.contains("```") {
        return completion
            .split("```")
            .nth(1)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ``` block but content was empty or malformed".to_string());
    }

    if let (Some(start), Some(end)) = (completion.find('{'), completion.rfind('}')) {
        if start < end {
            return Ok(&completion[start..=end]);
        }
    }

    Err(format!(
        "No JSON found in response. First 100 chars: '{}'",
        completion.chars().take(100).collect::<String>()
    ))
}

/// Parse the JSON payload out of a completion.
///
/// A completion without parseable JSON means the primary payload is absent,
/// which is an anchor failure.
pub fn parse_completion_json(completion: &str) -> Result<Value, StageError> {
    let raw = extract_json_from_completion(completion).map_err(|reason| {
        StageError::Validation {
            field: "$".to_string(),
            reason,
        }
    })?;
    serde_json::from_str(raw).map_err(|e| StageError::Validation {
        field: "$".to_string(),
        reason: format!("invalid JSON: {}", e),
    })
}

/// The question a stage asks when it cannot proceed on the given input.
///
/// Recognizes `{"needs_clarification": {"question": "..."}}` and the
/// shorthand `{"needs_clarification": "..."}`.
pub fn clarification_request(value: &Value) -> Option<String> {
    let question = match value.get(CLARIFICATION_FIELD)? {
        Value::String(q) => q.as_str(),
        Value::Object(o) => o.get("question")?.as_str()?,
        _ => return None,
    };
    let question = question.trim();
    (!question.is_empty()).then(|| question.to_string())
}
