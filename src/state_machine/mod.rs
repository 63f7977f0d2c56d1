mod item;
mod state;

pub use item::{BatchFailure, BatchOutcome, EvidenceRecord, FailureReason, ItemStatus, PromotionOutcome};
pub use state::{FieldKind, FieldRule, StateId, StateSpec, TransitionRegistry, TransitionSpec};
