use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::StateId;
use crate::error::StoreError;
use crate::evidence::EvidenceViolation;
use crate::store::keys;

/// Immutable audit entry written alongside every accepted transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    /// Store key of the record, `evidence:{item}:{micros}`.
    pub id: String,
    pub item_id: String,
    pub transition_type: String,
    pub evidence: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl EvidenceRecord {
    pub fn new(
        item_id: &str,
        seq: u32,
        transition_type: &str,
        evidence: serde_json::Value,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: keys::evidence(item_id, created_at, seq),
            item_id: item_id.to_string(),
            transition_type: transition_type.to_string(),
            evidence,
            created_at,
            expires_at,
        }
    }

    /// Expiry of a record created at `created_at`, or `None` if it is not representable.
    pub fn expiry(created_at: DateTime<Utc>, retention_secs: i64) -> Option<DateTime<Utc>> {
        chrono::Duration::try_seconds(retention_secs)
            .and_then(|retention| created_at.checked_add_signed(retention))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Result of an accepted single promotion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionOutcome {
    pub item_id: String,
    pub new_state: StateId,
    pub evidence_record_id: String,
}

/// Why one member of a batch was not promoted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "violation", rename_all = "snake_case")]
pub enum FailureReason {
    NotFound,
    InvalidEvidence(EvidenceViolation),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NotFound => write!(f, "not found in source queue"),
            FailureReason::InvalidEvidence(v) => write!(f, "invalid evidence: {v}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub item_id: String,
    pub reason: FailureReason,
}

/// Partial-success result of a batch promotion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub success_count: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchOutcome {
    pub fn all_promoted(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Point-in-time view of an item, as returned by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemStatus {
    pub item_id: String,
    pub state: StateId,
    pub created_at: Option<DateTime<Utc>>,
    pub last_transition_at: Option<DateTime<Utc>>,
    pub last_transition_type: Option<String>,
    /// 0-based index within the item's current queue; `None` when unqueued.
    pub queue_position: Option<usize>,
    /// Caller-defined attributes.
    pub metadata: BTreeMap<String, String>,
}

impl ItemStatus {
    /// Build a status from the raw item hash.
    pub fn from_fields(
        item_id: &str,
        mut fields: HashMap<String, String>,
        queue_position: Option<usize>,
    ) -> Result<Self, StoreError> {
        let state = fields
            .remove(keys::FIELD_STATE)
            .map(StateId::new)
            .ok_or_else(|| StoreError::Protocol(format!("item `{item_id}` has no state")))?;
        let created_at = parse_time(fields.remove(keys::FIELD_CREATED_AT))?;
        let last_transition_at = parse_time(fields.remove(keys::FIELD_LAST_TRANSITION_AT))?;
        let last_transition_type = fields.remove(keys::FIELD_LAST_TRANSITION_TYPE);

        Ok(Self {
            item_id: item_id.to_string(),
            state,
            created_at,
            last_transition_at,
            last_transition_type,
            queue_position,
            metadata: fields.into_iter().collect(),
        })
    }
}

fn parse_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::Protocol(format!("bad timestamp `{s}`: {e}")))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn evidence_record_expires_after_retention() {
        let expires_at = EvidenceRecord::expiry(t0(), 2_592_000).unwrap();
        let record = EvidenceRecord::new(
            "X-1",
            0,
            "pending_to_development",
            serde_json::json!({"requirements_analysis": "done"}),
            t0(),
            expires_at,
        );
        assert_eq!(record.id, format!("evidence:X-1:{}:0000", t0().timestamp_micros()));
        assert!(!record.is_expired(t0() + chrono::Duration::days(30) - chrono::Duration::seconds(1)));
        assert!(record.is_expired(t0() + chrono::Duration::days(30)));
    }

    #[test]
    fn unrepresentable_expiry_is_none() {
        assert!(EvidenceRecord::expiry(t0(), 1_000_000_000_000_000).is_none());
        assert!(EvidenceRecord::expiry(t0(), i64::MAX).is_none());
        assert_eq!(
            EvidenceRecord::expiry(t0(), 60),
            Some(t0() + chrono::Duration::seconds(60))
        );
    }

    #[test]
    fn status_splits_reserved_fields_from_metadata() {
        let fields = HashMap::from([
            ("state".to_string(), "development".to_string()),
            ("created_at".to_string(), t0().to_rfc3339()),
            ("last_transition_at".to_string(), t0().to_rfc3339()),
            (
                "last_transition_type".to_string(),
                "pending_to_development".to_string(),
            ),
            ("title".to_string(), "Add login".to_string()),
        ]);

        let status = ItemStatus::from_fields("X-1", fields, Some(2)).unwrap();
        assert_eq!(status.state, StateId::new("development"));
        assert_eq!(status.last_transition_at, Some(t0()));
        assert_eq!(status.last_transition_type.as_deref(), Some("pending_to_development"));
        assert_eq!(status.queue_position, Some(2));
        assert_eq!(status.metadata.len(), 1);
        assert_eq!(status.metadata["title"], "Add login");
    }

    #[test]
    fn status_without_state_is_a_protocol_error() {
        let err = ItemStatus::from_fields("X-1", HashMap::new(), None).unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
    }

    #[test]
    fn batch_outcome_reports_partial_success() {
        let mut outcome = BatchOutcome {
            success_count: 2,
            failures: Vec::new(),
        };
        assert!(outcome.all_promoted());
        outcome.failures.push(BatchFailure {
            item_id: "X-3".into(),
            reason: FailureReason::NotFound,
        });
        assert!(!outcome.all_promoted());
    }

    #[test]
    fn failure_reason_display() {
        assert_eq!(FailureReason::NotFound.to_string(), "not found in source queue");
        let invalid = FailureReason::InvalidEvidence(EvidenceViolation::EmptyField("sign_off".into()));
        assert_eq!(invalid.to_string(), "invalid evidence: field `sign_off` is empty");
    }
}
