//! Atomic procedures executed inside the coordination store.
//!
//! Each body runs as one indivisible unit. Bodies check everything they need
//! before their first write, so a failed call leaves the keyspace untouched.
//! Item and evidence keys are derived from the item id inside the body; queue
//! keys are passed in.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::{StoreError, fault};
use crate::evidence;
use crate::state_machine::{BatchFailure, EvidenceRecord, FailureReason, FieldRule};
use crate::store::{Arity, Keyspace, ProcedureSource, Reply, keys};

/// keys: `[source_queue, dest_queue?]`;
/// args: `[item_id, evidence, transition, at_micros, dest_state, schema, retention_secs]`.
pub const PROMOTE: ProcedureSource = ProcedureSource {
    name: "promote",
    version: 1,
    keys: Arity::between(1, 2),
    args: Arity::exactly(7),
    body: promote,
};

/// keys: `[source_queue, dest_queue?]`;
/// args: `[transition, at_micros, dest_state, schema, retention_secs, (item_id, evidence)*]`.
pub const BATCH_PROMOTE: ProcedureSource = ProcedureSource {
    name: "batch_promote",
    version: 1,
    keys: Arity::between(1, 2),
    args: Arity::at_least(5),
    body: batch_promote,
};

/// keys: `[item, initial_queue]`; args: `[item_id, initial_state, at_micros, metadata]`.
pub const ENQUEUE: ProcedureSource = ProcedureSource {
    name: "enqueue",
    version: 1,
    keys: Arity::exactly(2),
    args: Arity::exactly(4),
    body: enqueue,
};

/// keys: `[item]`; args: `[item_id]`.
pub const STATUS: ProcedureSource = ProcedureSource {
    name: "status",
    version: 1,
    keys: Arity::exactly(1),
    args: Arity::exactly(1),
    body: status,
};

/// keys: `[evidence_index]`; args: `[limit, now_micros]`.
pub const EVIDENCE_HISTORY: ProcedureSource = ProcedureSource {
    name: "evidence_history",
    version: 1,
    keys: Arity::exactly(1),
    args: Arity::exactly(2),
    body: evidence_history,
};

/// keys: one queue per state; args: none.
pub const QUEUE_DEPTHS: ProcedureSource = ProcedureSource {
    name: "queue_depths",
    version: 1,
    keys: Arity::at_least(0),
    args: Arity::exactly(0),
    body: queue_depths,
};

pub const ALL: [ProcedureSource; 6] = [
    PROMOTE,
    BATCH_PROMOTE,
    ENQUEUE,
    STATUS,
    EVIDENCE_HISTORY,
    QUEUE_DEPTHS,
];

/// Parameters shared by every item of one promotion call.
struct Promotion<'a> {
    transition: &'a str,
    dest_state: &'a str,
    source_queue: &'a str,
    dest_queue: Option<&'a str>,
    at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    required: Vec<FieldRule>,
}

impl<'a> Promotion<'a> {
    fn parse(
        queues: &'a [String],
        transition: &'a str,
        at: &str,
        dest_state: &'a str,
        schema: &str,
        retention_secs: &str,
    ) -> Result<Self, StoreError> {
        let source_queue = nth(queues, 0, "source queue")?;
        let required: Vec<FieldRule> = serde_json::from_str(schema)
            .map_err(|e| StoreError::fault(fault::UNKNOWN_COMMAND, format!("bad schema: {e}")))?;
        let at = parse_micros(at)?;
        let retention = retention_secs
            .parse::<i64>()
            .map_err(|e| StoreError::fault(fault::UNKNOWN_COMMAND, format!("bad retention: {e}")))?;
        if retention <= 0 {
            return Err(StoreError::fault(
                fault::UNKNOWN_COMMAND,
                format!("retention must be positive, got {retention}"),
            ));
        }
        let expires_at = EvidenceRecord::expiry(at, retention).ok_or_else(|| {
            StoreError::fault(
                fault::UNKNOWN_COMMAND,
                format!("retention of {retention}s is out of range"),
            )
        })?;

        Ok(Self {
            transition,
            dest_state,
            source_queue,
            dest_queue: queues.get(1).map(String::as_str),
            at,
            expires_at,
            required,
        })
    }

    /// Check and apply one item's promotion, returning the evidence record id.
    fn apply(
        &self,
        ks: &mut dyn Keyspace,
        item_id: &str,
        raw_evidence: &str,
    ) -> Result<String, FailureReason> {
        if ks.list_position(self.source_queue, item_id).is_none() {
            return Err(FailureReason::NotFound);
        }

        let evidence = evidence::parse(raw_evidence)
            .and_then(|v| evidence::validate(self.transition, &self.required, &v).map(|()| v))
            .map_err(FailureReason::InvalidEvidence)?;
        // Records are never overwritten: a second record at the same instant takes the next seq.
        let mut seq = 0;
        while ks.get_live(&keys::evidence(item_id, self.at, seq), self.at).is_some() {
            seq += 1;
        }
        let record = EvidenceRecord::new(
            item_id,
            seq,
            self.transition,
            evidence,
            self.at,
            self.expires_at,
        );
        let encoded = serde_json::to_string(&record).map_err(|e| {
            FailureReason::InvalidEvidence(evidence::EvidenceViolation::Malformed(e.to_string()))
        })?;

        // All checks passed; from here on every step is a write.
        ks.list_remove(self.source_queue, item_id);
        if let Some(dest) = self.dest_queue {
            ks.list_push(dest, item_id.to_string());
        }
        let item_key = keys::item(item_id);
        ks.hash_set(&item_key, keys::FIELD_STATE, self.dest_state.to_string());
        ks.hash_set(&item_key, keys::FIELD_LAST_TRANSITION_AT, keys::timestamp(self.at));
        ks.hash_set(
            &item_key,
            keys::FIELD_LAST_TRANSITION_TYPE,
            self.transition.to_string(),
        );
        ks.put_expiring(&record.id, encoded, record.expires_at);
        ks.index_add(
            &keys::evidence_index(item_id),
            self.at.timestamp_micros(),
            record.id.clone(),
        );

        Ok(record.id)
    }
}

fn promote(ks: &mut dyn Keyspace, queues: &[String], args: &[String]) -> Result<Reply, StoreError> {
    let item_id = nth(args, 0, "item id")?;
    let raw_evidence = nth(args, 1, "evidence")?;
    let promotion = Promotion::parse(
        queues,
        nth(args, 2, "transition")?,
        nth(args, 3, "timestamp")?,
        nth(args, 4, "destination state")?,
        nth(args, 5, "schema")?,
        nth(args, 6, "retention")?,
    )?;

    match promotion.apply(ks, item_id, raw_evidence) {
        Ok(record_id) => Ok(Reply::List(vec![
            Reply::Text(promotion.dest_state.to_string()),
            Reply::Text(record_id),
        ])),
        Err(FailureReason::NotFound) => Err(StoreError::fault(
            fault::NOT_FOUND,
            promotion.source_queue.to_string(),
        )),
        Err(FailureReason::InvalidEvidence(violation)) => {
            Err(StoreError::fault(fault::INVALID_EVIDENCE, violation.encode()))
        }
    }
}

fn batch_promote(
    ks: &mut dyn Keyspace,
    queues: &[String],
    args: &[String],
) -> Result<Reply, StoreError> {
    let promotion = Promotion::parse(
        queues,
        nth(args, 0, "transition")?,
        nth(args, 1, "timestamp")?,
        nth(args, 2, "destination state")?,
        nth(args, 3, "schema")?,
        nth(args, 4, "retention")?,
    )?;
    let pairs = &args[5..];
    if pairs.len() % 2 != 0 {
        return Err(StoreError::fault(
            fault::UNKNOWN_COMMAND,
            "batch items must come as (item_id, evidence) pairs",
        ));
    }

    // Items are processed in order; one item's failure never undoes another's success.
    let mut promoted = 0_i64;
    let mut failures = Vec::new();
    for pair in pairs.chunks_exact(2) {
        match promotion.apply(ks, &pair[0], &pair[1]) {
            Ok(_) => promoted += 1,
            Err(reason) => failures.push(BatchFailure {
                item_id: pair[0].clone(),
                reason,
            }),
        }
    }

    let failures = serde_json::to_string(&failures)
        .map_err(|e| StoreError::Protocol(format!("encoding failures: {e}")))?;
    Ok(Reply::List(vec![Reply::Int(promoted), Reply::Text(failures)]))
}

fn enqueue(ks: &mut dyn Keyspace, key_args: &[String], args: &[String]) -> Result<Reply, StoreError> {
    let item_key = nth(key_args, 0, "item key")?;
    let queue = nth(key_args, 1, "initial queue")?;
    let item_id = nth(args, 0, "item id")?;
    let initial_state = nth(args, 1, "initial state")?;
    let at = parse_micros(nth(args, 2, "timestamp")?)?;
    let metadata: HashMap<String, String> = serde_json::from_str(nth(args, 3, "metadata")?)
        .map_err(|e| StoreError::fault(fault::UNKNOWN_COMMAND, format!("bad metadata: {e}")))?;

    if let Some(reserved) = metadata
        .keys()
        .find(|k| keys::RESERVED_FIELDS.contains(&k.as_str()))
    {
        return Err(StoreError::fault(
            fault::UNKNOWN_COMMAND,
            format!("metadata field `{reserved}` is reserved"),
        ));
    }
    if ks.hash_exists(item_key) {
        return Err(StoreError::fault(fault::ALREADY_EXISTS, item_id.to_string()));
    }

    for (field, value) in metadata {
        ks.hash_set(item_key, &field, value);
    }
    ks.hash_set(item_key, keys::FIELD_STATE, initial_state.to_string());
    ks.hash_set(item_key, keys::FIELD_CREATED_AT, keys::timestamp(at));
    ks.list_push(queue, item_id.to_string());

    Ok(Reply::Int(ks.list_len(queue) as i64 - 1))
}

fn status(ks: &mut dyn Keyspace, key_args: &[String], args: &[String]) -> Result<Reply, StoreError> {
    let item_key = nth(key_args, 0, "item key")?;
    let item_id = nth(args, 0, "item id")?;

    let fields = ks.hash_get_all(item_key);
    let Some(state) = fields.get(keys::FIELD_STATE) else {
        return Err(StoreError::fault(fault::NOT_FOUND, item_key.to_string()));
    };
    let position = match ks.list_position(&keys::queue(state), item_id) {
        Some(pos) => Reply::Int(pos as i64),
        None => Reply::Nil,
    };

    let mut flat = Vec::with_capacity(fields.len() * 2);
    for (field, value) in fields {
        flat.push(Reply::Text(field));
        flat.push(Reply::Text(value));
    }
    Ok(Reply::List(vec![Reply::List(flat), position]))
}

fn evidence_history(
    ks: &mut dyn Keyspace,
    key_args: &[String],
    args: &[String],
) -> Result<Reply, StoreError> {
    let index_key = nth(key_args, 0, "evidence index")?;
    let limit: usize = nth(args, 0, "limit")?
        .parse()
        .map_err(|e| StoreError::fault(fault::UNKNOWN_COMMAND, format!("bad limit: {e}")))?;
    let now = parse_micros(nth(args, 1, "now")?)?;

    let mut records = Vec::new();
    let mut reclaimed = Vec::new();
    for record_key in ks.index_desc(index_key) {
        if records.len() >= limit {
            break;
        }
        match ks.get_live(&record_key, now) {
            Some(encoded) => records.push(Reply::Text(encoded)),
            None => reclaimed.push(record_key),
        }
    }
    for record_key in reclaimed {
        ks.index_remove(index_key, &record_key);
    }

    Ok(Reply::List(records))
}

fn queue_depths(ks: &mut dyn Keyspace, queues: &[String], _: &[String]) -> Result<Reply, StoreError> {
    Ok(Reply::List(
        queues
            .iter()
            .map(|q| Reply::Int(ks.list_len(q) as i64))
            .collect(),
    ))
}

fn nth<'a>(values: &'a [String], index: usize, what: &str) -> Result<&'a str, StoreError> {
    values
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| StoreError::fault(fault::UNKNOWN_COMMAND, format!("missing {what}")))
}

fn parse_micros(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    raw.parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_micros)
        .ok_or_else(|| StoreError::fault(fault::UNKNOWN_COMMAND, format!("bad timestamp `{raw}`")))
}
