//! Evidence validation.
//!
//! Pure functions deciding whether a payload satisfies a transition's schema.
//! The same checks run client-side (fail fast) and inside the atomic
//! procedure, where they are authoritative.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::state_machine::{FieldKind, FieldRule, TransitionSpec};

/// Payload key that, when present, must name the transition being attempted.
pub const TRANSITION_TYPE_FIELD: &str = "transition_type";

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "violation", content = "detail", rename_all = "snake_case")]
pub enum EvidenceViolation {
    #[error("malformed evidence: {0}")]
    Malformed(String),

    #[error("evidence is for `{found}`, expected `{expected}`")]
    TransitionMismatch { expected: String, found: String },

    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("field `{0}` is empty")]
    EmptyField(String),

    #[error("field `{field}` must be {expected}")]
    WrongType { field: String, expected: FieldKind },
}

impl EvidenceViolation {
    /// The offending field, when the violation is about one.
    pub fn field(&self) -> Option<&str> {
        match self {
            EvidenceViolation::MissingField(field)
            | EvidenceViolation::EmptyField(field)
            | EvidenceViolation::WrongType { field, .. } => Some(field),
            EvidenceViolation::TransitionMismatch { .. } => Some(TRANSITION_TYPE_FIELD),
            EvidenceViolation::Malformed(_) => None,
        }
    }

    /// Wire form used in procedure error replies.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.to_string())
    }

    /// Inverse of [`encode`](Self::encode). Unparseable details are kept as text.
    pub fn decode(detail: &str) -> Self {
        serde_json::from_str(detail).unwrap_or_else(|_| EvidenceViolation::Malformed(detail.to_string()))
    }
}

/// Parse raw evidence text. Only JSON objects are well-formed evidence.
pub fn parse(raw: &str) -> Result<Value, EvidenceViolation> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| EvidenceViolation::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(EvidenceViolation::Malformed(
            "evidence must be an object".into(),
        ));
    }
    Ok(value)
}

/// Check `evidence` against the schema of the named transition.
///
/// Fields are checked in schema order, so the first missing field is reported.
pub fn validate(
    transition_type: &str,
    required: &[FieldRule],
    evidence: &Value,
) -> Result<(), EvidenceViolation> {
    let Some(fields) = evidence.as_object() else {
        return Err(EvidenceViolation::Malformed(
            "evidence must be an object".into(),
        ));
    };

    if let Some(declared) = fields.get(TRANSITION_TYPE_FIELD) {
        let found = match declared {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if found != transition_type {
            return Err(EvidenceViolation::TransitionMismatch {
                expected: transition_type.to_string(),
                found,
            });
        }
    }

    for rule in required {
        let value = match fields.get(&rule.field) {
            None | Some(Value::Null) => {
                return Err(EvidenceViolation::MissingField(rule.field.clone()));
            }
            Some(v) => v,
        };
        match (rule.kind, value) {
            (FieldKind::Text, Value::String(s)) if s.trim().is_empty() => {
                return Err(EvidenceViolation::EmptyField(rule.field.clone()));
            }
            (FieldKind::List, Value::Array(items)) if items.is_empty() => {
                return Err(EvidenceViolation::EmptyField(rule.field.clone()));
            }
            (FieldKind::Text, Value::String(_)) | (FieldKind::List, Value::Array(_)) => {}
            (kind, _) => {
                return Err(EvidenceViolation::WrongType {
                    field: rule.field.clone(),
                    expected: kind,
                });
            }
        }
    }

    Ok(())
}

/// [`validate`] against a resolved transition.
pub fn check(transition: &TransitionSpec, evidence: &Value) -> Result<(), EvidenceViolation> {
    validate(&transition.name, &transition.required, evidence)
}
