use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::cache::ProcedureCache;
use crate::error::{PromotionError, StoreError};
use crate::evidence::{self, EvidenceViolation};
use crate::procedures;
use crate::state_machine::{
    BatchFailure, BatchOutcome, EvidenceRecord, FailureReason, ItemStatus, PromotionOutcome, StateId,
    TransitionRegistry, TransitionSpec,
};
use crate::store::{CoordinationStore, Reply, keys};

/// 30 days.
pub const DEFAULT_EVIDENCE_RETENTION: Duration = Duration::from_secs(2_592_000);
/// 100 years. Longer retentions are refused at construction.
pub const MAX_EVIDENCE_RETENTION: Duration = Duration::from_secs(100 * 365 * 86_400);

/// Tunables for a [`PromotionEngine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Upper bound on every store round-trip.
    pub call_timeout: Duration,
    /// How long evidence records stay retrievable.
    pub evidence_retention: Duration,
    /// Validate evidence before calling the store. The atomic check runs regardless.
    pub precheck_evidence: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_millis(250),
            evidence_retention: DEFAULT_EVIDENCE_RETENTION,
            precheck_evidence: true,
        }
    }
}

/// Everything a promotion call sends besides the item itself, computed once
/// per transition.
struct TransitionPlan {
    spec: TransitionSpec,
    queues: Vec<String>,
    schema: String,
}

/// Drives items through the pipeline with atomic promotions.
pub struct PromotionEngine<S> {
    cache: ProcedureCache<S>,
    registry: Arc<TransitionRegistry>,
    plans: HashMap<String, TransitionPlan>,
    options: EngineOptions,
}

impl<S: CoordinationStore> PromotionEngine<S> {
    pub fn new(
        store: Arc<S>,
        registry: TransitionRegistry,
        options: EngineOptions,
    ) -> Result<Self, PromotionError> {
        if options.evidence_retention.is_zero()
            || options.evidence_retention > MAX_EVIDENCE_RETENTION
        {
            return Err(PromotionError::Config(format!(
                "evidence retention {}s must be between 1s and {}s",
                options.evidence_retention.as_secs(),
                MAX_EVIDENCE_RETENTION.as_secs()
            )));
        }

        let mut plans = HashMap::new();
        for spec in registry.transitions() {
            let mut queues = vec![keys::queue(spec.from.as_str())];
            if registry.is_queued(&spec.to) {
                queues.push(keys::queue(spec.to.as_str()));
            }
            let schema = serde_json::to_string(&spec.required)
                .map_err(|e| PromotionError::Config(format!("encoding `{}` schema: {e}", spec.name)))?;
            plans.insert(
                spec.name.clone(),
                TransitionPlan {
                    spec: spec.clone(),
                    queues,
                    schema,
                },
            );
        }
        info!(transitions = plans.len(), "promotion engine ready");

        Ok(Self {
            cache: ProcedureCache::new(store, &procedures::ALL, options.call_timeout),
            registry: Arc::new(registry),
            plans,
            options,
        })
    }

    /// Engine over the default pipeline with default options.
    pub fn with_defaults(store: Arc<S>) -> Self {
        Self::new(
            store,
            TransitionRegistry::default_pipeline(),
            EngineOptions::default(),
        )
        .unwrap_or_else(|e| unreachable!("default pipeline failed to plan: {e}"))
    }

    pub fn registry(&self) -> &TransitionRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &ProcedureCache<S> {
        &self.cache
    }

    /// Register every procedure before the first call needs it.
    pub async fn warm_up(&self) -> Result<(), PromotionError> {
        self.cache
            .warm_up()
            .await
            .map_err(|e| PromotionError::from_store(e, "", None))
    }

    /// Place a new item at the back of the initial queue, returning its position.
    #[instrument(skip(self, metadata, at))]
    pub async fn enqueue(
        &self,
        item_id: &str,
        metadata: &BTreeMap<String, String>,
        at: DateTime<Utc>,
    ) -> Result<usize, PromotionError> {
        let initial = self.registry.initial_state();
        let metadata = serde_json::to_string(metadata)
            .map_err(|e| PromotionError::UnknownCommand(format!("metadata: {e}")))?;
        let key_args = [keys::item(item_id), keys::queue(initial.as_str())];
        let args = [
            item_id.to_string(),
            initial.to_string(),
            at.timestamp_micros().to_string(),
            metadata,
        ];

        let position = self
            .cache
            .invoke(procedures::ENQUEUE.name, &key_args, &args)
            .await
            .and_then(Reply::into_int)
            .map_err(|e| PromotionError::from_store(e, item_id, Some(initial.as_str())))?;
        debug!(position, "enqueued");
        Ok(position as usize)
    }

    /// Atomically move one item along `transition_type`, recording its evidence.
    #[instrument(skip(self, evidence, at))]
    pub async fn promote(
        &self,
        item_id: &str,
        evidence: &Value,
        transition_type: &str,
        at: DateTime<Utc>,
    ) -> Result<PromotionOutcome, PromotionError> {
        let plan = self.plan(transition_type)?;
        let invalid = |violation| PromotionError::InvalidEvidence {
            item_id: item_id.to_string(),
            violation,
        };
        if self.options.precheck_evidence {
            evidence::check(&plan.spec, evidence).map_err(invalid)?;
        }
        let encoded = encode_evidence(evidence).map_err(invalid)?;

        let args = [
            item_id.to_string(),
            encoded,
            plan.spec.name.clone(),
            at.timestamp_micros().to_string(),
            plan.spec.to.to_string(),
            plan.schema.clone(),
            self.options.evidence_retention.as_secs().to_string(),
        ];
        let source = plan.spec.from.as_str();
        let reply = self
            .cache
            .invoke(procedures::PROMOTE.name, &plan.queues, &args)
            .await
            .map_err(|e| PromotionError::from_store(e, item_id, Some(source)))?;

        let outcome = parse_promotion(item_id, reply)
            .map_err(|e| PromotionError::from_store(e, item_id, Some(source)))?;
        debug!(new_state = %outcome.new_state, "promoted");
        Ok(outcome)
    }

    /// Promote several items along one transition in a single atomic call.
    ///
    /// `evidence[i]` belongs to `item_ids[i]`. Items that are missing from the
    /// source queue or carry invalid evidence are reported in
    /// [`BatchOutcome::failures`]; the rest are promoted.
    #[instrument(skip_all, fields(transition = transition_type, items = item_ids.len()))]
    pub async fn batch_promote(
        &self,
        transition_type: &str,
        at: DateTime<Utc>,
        evidence: &[Value],
        item_ids: &[String],
    ) -> Result<BatchOutcome, PromotionError> {
        let plan = self.plan(transition_type)?;
        if evidence.len() != item_ids.len() {
            return Err(PromotionError::UnknownCommand(format!(
                "batch has {} evidence payloads for {} items",
                evidence.len(),
                item_ids.len()
            )));
        }
        if item_ids.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let mut args = Vec::with_capacity(5 + item_ids.len() * 2);
        args.push(plan.spec.name.clone());
        args.push(at.timestamp_micros().to_string());
        args.push(plan.spec.to.to_string());
        args.push(plan.schema.clone());
        args.push(self.options.evidence_retention.as_secs().to_string());

        // Unencodable payloads never reach the store; they fail locally like any
        // other invalid evidence.
        let mut sent = Vec::with_capacity(item_ids.len());
        let mut local_failures = Vec::new();
        for (index, (item_id, payload)) in item_ids.iter().zip(evidence).enumerate() {
            match encode_evidence(payload) {
                Ok(encoded) => {
                    args.push(item_id.clone());
                    args.push(encoded);
                    sent.push(index);
                }
                Err(violation) => local_failures.push((
                    index,
                    BatchFailure {
                        item_id: item_id.clone(),
                        reason: FailureReason::InvalidEvidence(violation),
                    },
                )),
            }
        }

        let source = plan.spec.from.as_str();
        let reply = self
            .cache
            .invoke(procedures::BATCH_PROMOTE.name, &plan.queues, &args)
            .await
            .map_err(|e| PromotionError::from_store(e, "", Some(source)))?;
        let mut outcome =
            parse_batch(reply).map_err(|e| PromotionError::from_store(e, "", Some(source)))?;
        outcome.failures = in_input_order(item_ids, &sent, outcome.failures, local_failures);

        debug!(
            promoted = outcome.success_count,
            failed = outcome.failures.len(),
            "batch promoted"
        );
        Ok(outcome)
    }

    /// Current state of an item and its place in its queue.
    #[instrument(skip(self))]
    pub async fn status(&self, item_id: &str) -> Result<ItemStatus, PromotionError> {
        let reply = self
            .cache
            .invoke(
                procedures::STATUS.name,
                &[keys::item(item_id)],
                &[item_id.to_string()],
            )
            .await
            .and_then(|reply| parse_status(item_id, reply))
            .map_err(|e| PromotionError::from_store(e, item_id, None))?;
        Ok(reply)
    }

    /// Up to `limit` of the item's evidence records, newest first.
    pub async fn evidence_history(
        &self,
        item_id: &str,
        limit: usize,
    ) -> Result<Vec<EvidenceRecord>, PromotionError> {
        self.evidence_history_at(item_id, limit, Utc::now()).await
    }

    /// [`evidence_history`](Self::evidence_history) with retention measured at `as_of`.
    #[instrument(skip(self, as_of))]
    pub async fn evidence_history_at(
        &self,
        item_id: &str,
        limit: usize,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<EvidenceRecord>, PromotionError> {
        let args = [limit.to_string(), as_of.timestamp_micros().to_string()];
        self.cache
            .invoke(
                procedures::EVIDENCE_HISTORY.name,
                &[keys::evidence_index(item_id)],
                &args,
            )
            .await
            .and_then(|reply| parse_history(reply, as_of))
            .map_err(|e| PromotionError::from_store(e, item_id, None))
    }

    /// Number of items waiting in every queued state.
    pub async fn queue_depths(&self) -> Result<Vec<(StateId, usize)>, PromotionError> {
        let states: Vec<StateId> = self.registry.queued_states().cloned().collect();
        let queues: Vec<String> = states.iter().map(|s| keys::queue(s.as_str())).collect();
        let depths = self
            .cache
            .invoke(procedures::QUEUE_DEPTHS.name, &queues, &[])
            .await
            .and_then(Reply::into_list)
            .map_err(|e| PromotionError::from_store(e, "", None))?;

        states
            .into_iter()
            .zip(depths)
            .map(|(state, depth)| {
                depth
                    .into_int()
                    .map(|n| (state, n as usize))
                    .map_err(|e| PromotionError::from_store(e, "", None))
            })
            .collect()
    }

    fn plan(&self, transition_type: &str) -> Result<&TransitionPlan, PromotionError> {
        self.plans
            .get(transition_type)
            .ok_or_else(|| PromotionError::UnknownTransition(transition_type.to_string()))
    }
}

/// Interleave store-reported failures with local ones by input position.
///
/// The store reports failures in the order items were sent, and `sent` maps
/// that order back to input indexes.
fn in_input_order(
    item_ids: &[String],
    sent: &[usize],
    remote: Vec<BatchFailure>,
    local: Vec<(usize, BatchFailure)>,
) -> Vec<BatchFailure> {
    let mut positioned = local;
    let mut cursor = sent.iter();
    for failure in remote {
        let index = cursor
            .by_ref()
            .find(|&&i| item_ids[i] == failure.item_id)
            .copied()
            .unwrap_or(item_ids.len());
        positioned.push((index, failure));
    }
    positioned.sort_by_key(|(index, _)| *index);
    positioned.into_iter().map(|(_, failure)| failure).collect()
}

fn encode_evidence(evidence: &Value) -> Result<String, EvidenceViolation> {
    if !evidence.is_object() {
        return Err(EvidenceViolation::Malformed("evidence must be an object".into()));
    }
    serde_json::to_string(evidence).map_err(|e| EvidenceViolation::Malformed(e.to_string()))
}

fn parse_promotion(item_id: &str, reply: Reply) -> Result<PromotionOutcome, StoreError> {
    let mut parts = reply.into_list()?.into_iter();
    let (Some(state), Some(record)) = (parts.next(), parts.next()) else {
        return Err(StoreError::Protocol("promotion reply too short".into()));
    };
    Ok(PromotionOutcome {
        item_id: item_id.to_string(),
        new_state: StateId::new(state.into_text()?),
        evidence_record_id: record.into_text()?,
    })
}

fn parse_batch(reply: Reply) -> Result<BatchOutcome, StoreError> {
    let mut parts = reply.into_list()?.into_iter();
    let (Some(count), Some(failures)) = (parts.next(), parts.next()) else {
        return Err(StoreError::Protocol("batch reply too short".into()));
    };
    let failures: Vec<BatchFailure> = serde_json::from_str(&failures.into_text()?)
        .map_err(|e| StoreError::Protocol(format!("batch failures: {e}")))?;
    Ok(BatchOutcome {
        success_count: count.into_int()? as usize,
        failures,
    })
}

fn parse_status(item_id: &str, reply: Reply) -> Result<ItemStatus, StoreError> {
    let mut parts = reply.into_list()?.into_iter();
    let (Some(fields), Some(position)) = (parts.next(), parts.next()) else {
        return Err(StoreError::Protocol("status reply too short".into()));
    };

    let mut flat = fields.into_list()?.into_iter();
    let mut map = HashMap::new();
    while let (Some(field), Some(value)) = (flat.next(), flat.next()) {
        map.insert(field.into_text()?, value.into_text()?);
    }
    let position = position.into_opt_int()?.map(|p| p as usize);
    ItemStatus::from_fields(item_id, map, position)
}

/// Stores may expire lazily or at a coarser grain, so expiry is checked again here.
fn parse_history(reply: Reply, as_of: DateTime<Utc>) -> Result<Vec<EvidenceRecord>, StoreError> {
    let mut records = Vec::new();
    for entry in reply.into_list()? {
        let record: EvidenceRecord = serde_json::from_str(&entry.into_text()?)
            .map_err(|e| StoreError::Protocol(format!("evidence record: {e}")))?;
        if !record.is_expired(as_of) {
            records.push(record);
        }
    }
    Ok(records)
}
