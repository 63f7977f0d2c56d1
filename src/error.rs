use std::time::Duration;

use thiserror::Error;

use crate::evidence::EvidenceViolation;
use crate::store::ProcedureHandle;

/// Error reply codes raised by atomic procedures inside the store.
pub mod fault {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const INVALID_EVIDENCE: &str = "INVALID_EVIDENCE";
    pub const UNKNOWN_COMMAND: &str = "UNKNOWN_COMMAND";
    pub const ALREADY_EXISTS: &str = "ALREADY_EXISTS";
}

/// Failures at the coordination-store boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store no longer knows the cached handle (e.g. after a restart).
    #[error("procedure {0} is not registered with the store")]
    ProcedureMissing(ProcedureHandle),

    #[error("store rejected procedure source: {0}")]
    Rejected(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// Structured error reply produced by a procedure body.
    #[error("{code}: {detail}")]
    Fault { code: String, detail: String },

    /// Reply did not have the shape the caller expected.
    #[error("unexpected reply from store: {0}")]
    Protocol(String),
}

impl StoreError {
    pub fn fault(code: &str, detail: impl Into<String>) -> Self {
        StoreError::Fault {
            code: code.to_string(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("item `{item_id}` not found{}", in_queue(.queue))]
    NotFound {
        item_id: String,
        queue: Option<String>,
    },

    #[error("invalid evidence for `{item_id}`: {violation}")]
    InvalidEvidence {
        item_id: String,
        violation: EvidenceViolation,
    },

    #[error("unknown transition `{0}`")]
    UnknownTransition(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("item `{0}` already exists")]
    AlreadyExists(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("procedure registration failed: {0}")]
    Registration(String),

    #[error("config error: {0}")]
    Config(String),
}

fn in_queue(queue: &Option<String>) -> String {
    match queue {
        Some(q) => format!(" in {q}"),
        None => String::new(),
    }
}

impl PromotionError {
    /// Map a store failure into the caller-facing taxonomy.
    ///
    /// `item_id` and `queue` give `NotFound`/`InvalidEvidence` the context the
    /// procedure reply itself does not carry.
    pub fn from_store(err: StoreError, item_id: &str, queue: Option<&str>) -> Self {
        match err {
            StoreError::Fault { code, detail } => match code.as_str() {
                fault::NOT_FOUND => PromotionError::NotFound {
                    item_id: item_id.to_string(),
                    queue: queue.map(str::to_string),
                },
                fault::INVALID_EVIDENCE => PromotionError::InvalidEvidence {
                    item_id: item_id.to_string(),
                    violation: EvidenceViolation::decode(&detail),
                },
                fault::ALREADY_EXISTS => PromotionError::AlreadyExists(item_id.to_string()),
                fault::UNKNOWN_COMMAND => PromotionError::UnknownCommand(detail),
                other => PromotionError::StoreUnavailable(format!("{other}: {detail}")),
            },
            // Only reachable when the retry after re-registration also missed.
            StoreError::ProcedureMissing(handle) => PromotionError::StoreUnavailable(format!(
                "procedure {handle} missing after re-registration"
            )),
            StoreError::Rejected(reason) => PromotionError::Registration(reason),
            StoreError::Unavailable(reason) => PromotionError::StoreUnavailable(reason),
            StoreError::Timeout(after) => PromotionError::Timeout(after),
            StoreError::Protocol(reason) => {
                PromotionError::StoreUnavailable(format!("unexpected reply: {reason}"))
            }
        }
    }

    /// Transport-level failures. The atomic unit guarantees no partial effect,
    /// but callers should re-query `status` before retrying a promotion.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PromotionError::StoreUnavailable(_) | PromotionError::Timeout(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PromotionError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_fault_carries_item_and_queue() {
        let err = PromotionError::from_store(
            StoreError::fault(fault::NOT_FOUND, "queue:pending"),
            "X-1",
            Some("pending"),
        );
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "item `X-1` not found in pending");
    }

    #[test]
    fn invalid_evidence_fault_decodes_violation() {
        let detail = EvidenceViolation::MissingField("acceptance_criteria".into()).encode();
        let err = PromotionError::from_store(
            StoreError::fault(fault::INVALID_EVIDENCE, detail),
            "X-1",
            None,
        );
        match err {
            PromotionError::InvalidEvidence { item_id, violation } => {
                assert_eq!(item_id, "X-1");
                assert_eq!(
                    violation,
                    EvidenceViolation::MissingField("acceptance_criteria".into())
                );
            }
            other => panic!("expected InvalidEvidence, got {other:?}"),
        }
    }

    #[test]
    fn transport_failures_are_retryable() {
        let timeout = PromotionError::from_store(
            StoreError::Timeout(Duration::from_millis(5)),
            "X-1",
            None,
        );
        assert!(timeout.is_retryable());

        let down = PromotionError::from_store(StoreError::Unavailable("down".into()), "X-1", None);
        assert!(down.is_retryable());

        let missing = PromotionError::from_store(
            StoreError::fault(fault::NOT_FOUND, ""),
            "X-1",
            None,
        );
        assert!(!missing.is_retryable());
    }

    #[test]
    fn rejected_source_is_a_registration_failure() {
        let err = PromotionError::from_store(StoreError::Rejected("empty".into()), "X-1", None);
        assert!(matches!(err, PromotionError::Registration(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PromotionError>();
        assert_send_sync::<StoreError>();
    }
}
