//! Logical key layout shared by the engine and the procedure bodies.

use chrono::{DateTime, SecondsFormat, Utc};

pub const FIELD_STATE: &str = "state";
pub const FIELD_CREATED_AT: &str = "created_at";
pub const FIELD_LAST_TRANSITION_AT: &str = "last_transition_at";
pub const FIELD_LAST_TRANSITION_TYPE: &str = "last_transition_type";

/// Item hash fields owned by the engine; caller metadata may not use them.
pub const RESERVED_FIELDS: [&str; 4] = [
    FIELD_STATE,
    FIELD_CREATED_AT,
    FIELD_LAST_TRANSITION_AT,
    FIELD_LAST_TRANSITION_TYPE,
];

pub fn item(id: &str) -> String {
    format!("item:{id}")
}

pub fn queue(state: &str) -> String {
    format!("queue:{state}")
}

/// Doubles as the evidence record id. `seq` tells apart records written for
/// the same item at the same instant; it is zero-padded so ids sort in write order.
pub fn evidence(id: &str, at: DateTime<Utc>, seq: u32) -> String {
    format!("evidence:{id}:{}:{seq:04}", at.timestamp_micros())
}

pub fn evidence_index(id: &str) -> String {
    format!("evidence_index:{id}")
}

/// Timestamps stored in item hashes.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
