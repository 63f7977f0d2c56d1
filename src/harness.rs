//! Load harness for the promotion path.
//!
//! Seeds a store with items in the initial state, then promotes all of them
//! along the pipeline's entry transition from several concurrent workers,
//! timing each call.
//!
//! A sample spans the whole `await`, including time the worker spends waiting
//! for the runtime. With more workers than cores that wait dominates the mean,
//! so keep `workers` at or below the available parallelism when checking the
//! latency targets.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::engine::PromotionEngine;
use crate::state_machine::{FieldKind, TransitionRegistry, TransitionSpec};
use crate::store::CoordinationStore;

/// Mean latency ceiling for a single promotion.
pub const MAX_MEAN_LATENCY: Duration = Duration::from_micros(50);
/// Promotions per second the engine must sustain.
pub const MIN_THROUGHPUT: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadPlan {
    pub workers: usize,
    pub operations: usize,
    /// Items per call in [`run_batch_load`]. Ignored by [`run_load`].
    pub batch_size: usize,
}

impl Default for LoadPlan {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            operations: 10_000,
            batch_size: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadReport {
    /// Items the run attempted to promote.
    pub operations: usize,
    pub failures: usize,
    pub elapsed: Duration,
    pub mean: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    /// Promoted items per second of wall-clock time.
    pub throughput: f64,
}

impl LoadReport {
    /// Summarise per-item latency samples.
    pub fn from_samples(
        mut samples: Vec<Duration>,
        operations: usize,
        failures: usize,
        elapsed: Duration,
    ) -> Self {
        samples.sort_unstable();
        let mean = if samples.is_empty() {
            Duration::ZERO
        } else {
            samples.iter().sum::<Duration>() / samples.len() as u32
        };
        let throughput = if elapsed.is_zero() {
            0.0
        } else {
            operations.saturating_sub(failures) as f64 / elapsed.as_secs_f64()
        };

        Self {
            operations,
            failures,
            elapsed,
            mean,
            p50: percentile(&samples, 0.50),
            p95: percentile(&samples, 0.95),
            p99: percentile(&samples, 0.99),
            throughput,
        }
    }

    /// Every way the run misses the latency and throughput targets.
    pub fn violations(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.mean > MAX_MEAN_LATENCY {
            out.push(format!(
                "mean latency {:?} exceeds {:?}",
                self.mean, MAX_MEAN_LATENCY
            ));
        }
        if self.throughput < MIN_THROUGHPUT {
            out.push(format!(
                "throughput {:.0}/s below {MIN_THROUGHPUT:.0}/s",
                self.throughput
            ));
        }
        if self.p95 > self.mean * 2 {
            out.push(format!("p95 {:?} above 2x mean", self.p95));
        }
        if self.p99 > self.mean * 3 {
            out.push(format!("p99 {:?} above 3x mean", self.p99));
        }
        out
    }

    pub fn meets_contract(&self) -> bool {
        self.violations().is_empty()
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} operations, {} failed, in {:?}",
            self.operations, self.failures, self.elapsed
        )?;
        writeln!(
            f,
            "mean {:?}  p50 {:?}  p95 {:?}  p99 {:?}",
            self.mean, self.p50, self.p95, self.p99
        )?;
        write!(f, "{:.0} promotions/s", self.throughput)
    }
}

/// Nearest-rank percentile of sorted samples.
fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Promote `plan.operations` fresh items one call at a time.
///
/// Item ids are `load-000000` onwards, so the engine's store must not already
/// hold them.
pub async fn run_load<S>(engine: Arc<PromotionEngine<S>>, plan: LoadPlan) -> Result<LoadReport>
where
    S: CoordinationStore + 'static,
{
    let transition = entry_transition(engine.registry())?;
    let ids = seed(&engine, plan.operations).await?;
    let evidence = Arc::new(sample_evidence(&transition));
    let name = Arc::new(transition.name);

    let mut tasks = JoinSet::new();
    let started = Instant::now();
    for share in split(ids, plan.workers) {
        let engine = Arc::clone(&engine);
        let evidence = Arc::clone(&evidence);
        let name = Arc::clone(&name);
        tasks.spawn(async move {
            let mut samples = Vec::with_capacity(share.len());
            let mut failures = 0;
            for id in share {
                let call = Instant::now();
                let result = engine.promote(&id, &evidence, &name, Utc::now()).await;
                samples.push(call.elapsed());
                if let Err(e) = result {
                    debug!(item = %id, error = %e, "load promotion failed");
                    failures += 1;
                }
            }
            (samples, failures)
        });
    }

    let (samples, failures) = collect(tasks).await?;
    let report = LoadReport::from_samples(samples, plan.operations, failures, started.elapsed());
    info!(
        operations = report.operations,
        failures = report.failures,
        mean_us = report.mean.as_micros() as u64,
        "load run finished"
    );
    Ok(report)
}

/// Like [`run_load`], but promotes `plan.batch_size` items per call.
///
/// Each batch contributes one sample: its latency divided by its size.
pub async fn run_batch_load<S>(
    engine: Arc<PromotionEngine<S>>,
    plan: LoadPlan,
) -> Result<LoadReport>
where
    S: CoordinationStore + 'static,
{
    let transition = entry_transition(engine.registry())?;
    let ids = seed(&engine, plan.operations).await?;
    let evidence = sample_evidence(&transition);
    let name = Arc::new(transition.name);

    let batches: Vec<Vec<String>> = ids
        .chunks(plan.batch_size.max(1))
        .map(<[String]>::to_vec)
        .collect();

    let mut tasks = JoinSet::new();
    let started = Instant::now();
    for share in split(batches, plan.workers) {
        let engine = Arc::clone(&engine);
        let evidence = evidence.clone();
        let name = Arc::clone(&name);
        tasks.spawn(async move {
            let mut samples = Vec::with_capacity(share.len());
            let mut failures = 0;
            for batch in share {
                let payloads = vec![evidence.clone(); batch.len()];
                let call = Instant::now();
                let result = engine
                    .batch_promote(&name, Utc::now(), &payloads, &batch)
                    .await;
                samples.push(call.elapsed() / batch.len() as u32);
                match result {
                    Ok(outcome) => failures += outcome.failures.len(),
                    Err(e) => {
                        debug!(items = batch.len(), error = %e, "load batch failed");
                        failures += batch.len();
                    }
                }
            }
            (samples, failures)
        });
    }

    let (samples, failures) = collect(tasks).await?;
    let report = LoadReport::from_samples(samples, plan.operations, failures, started.elapsed());
    info!(
        operations = report.operations,
        batch_size = plan.batch_size,
        failures = report.failures,
        "batch load run finished"
    );
    Ok(report)
}

/// The transition leaving the initial state.
fn entry_transition(registry: &TransitionRegistry) -> Result<TransitionSpec> {
    let initial = registry.initial_state();
    registry
        .transitions()
        .find(|t| &t.from == initial)
        .cloned()
        .ok_or_else(|| anyhow!("no transition leaves initial state `{initial}`"))
}

/// Evidence that satisfies every rule of `transition`.
fn sample_evidence(transition: &TransitionSpec) -> Value {
    let mut fields = Map::new();
    for rule in &transition.required {
        let value = match rule.kind {
            FieldKind::Text => Value::String(format!("load test {}", rule.field)),
            FieldKind::List => Value::Array(vec![Value::String("load".into())]),
        };
        fields.insert(rule.field.clone(), value);
    }
    Value::Object(fields)
}

async fn seed<S: CoordinationStore>(
    engine: &PromotionEngine<S>,
    operations: usize,
) -> Result<Vec<String>> {
    engine.warm_up().await.context("registering procedures")?;
    let metadata = BTreeMap::from([("origin".to_string(), "load".to_string())]);
    let mut ids = Vec::with_capacity(operations);
    for n in 0..operations {
        let id = format!("load-{n:06}");
        engine
            .enqueue(&id, &metadata, Utc::now())
            .await
            .with_context(|| format!("seeding {id}"))?;
        ids.push(id);
    }
    Ok(ids)
}

/// Deal `items` round-robin into at most `workers` non-empty shares.
fn split<T>(items: Vec<T>, workers: usize) -> Vec<Vec<T>> {
    let workers = workers.clamp(1, items.len().max(1));
    let mut shares: Vec<Vec<T>> = (0..workers).map(|_| Vec::new()).collect();
    for (i, item) in items.into_iter().enumerate() {
        shares[i % workers].push(item);
    }
    shares.retain(|s| !s.is_empty());
    shares
}

async fn collect(mut tasks: JoinSet<(Vec<Duration>, usize)>) -> Result<(Vec<Duration>, usize)> {
    let mut samples = Vec::new();
    let mut failures = 0;
    while let Some(joined) = tasks.join_next().await {
        let (mut worker_samples, worker_failures) = joined.context("load worker panicked")?;
        samples.append(&mut worker_samples);
        failures += worker_failures;
    }
    Ok((samples, failures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::StateId;
    use crate::store::MemoryStore;

    fn engine() -> Arc<PromotionEngine<MemoryStore>> {
        Arc::new(PromotionEngine::with_defaults(Arc::new(MemoryStore::new())))
    }

    fn micros(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|&v| Duration::from_micros(v)).collect()
    }

    async fn depth(engine: &PromotionEngine<MemoryStore>, state: &str) -> usize {
        engine
            .queue_depths()
            .await
            .unwrap()
            .into_iter()
            .find(|(s, _)| s == &StateId::new(state))
            .map(|(_, n)| n)
            .unwrap()
    }

    #[test]
    fn percentiles_use_nearest_rank() {
        let samples: Vec<Duration> = (1..=100).map(Duration::from_micros).collect();
        let report = LoadReport::from_samples(samples, 100, 0, Duration::from_millis(10));
        assert_eq!(report.p50, Duration::from_micros(50));
        assert_eq!(report.p95, Duration::from_micros(95));
        assert_eq!(report.p99, Duration::from_micros(99));
        assert_eq!(report.mean, Duration::from_nanos(50_500));
        assert!((report.throughput - 10_000.0).abs() < 1e-6);
    }

    #[test]
    fn empty_run_reports_zeroes() {
        let report = LoadReport::from_samples(Vec::new(), 0, 0, Duration::ZERO);
        assert_eq!(report.mean, Duration::ZERO);
        assert_eq!(report.p99, Duration::ZERO);
        assert_eq!(report.throughput, 0.0);
    }

    #[test]
    fn contract_flags_slow_and_spiky_runs() {
        let steady = LoadReport::from_samples(micros(&[10; 100]), 100, 0, Duration::from_millis(5));
        assert!(steady.meets_contract(), "{:?}", steady.violations());

        let mut spiky = micros(&[10; 90]);
        spiky.extend(micros(&[500; 10]));
        let spiky = LoadReport::from_samples(spiky, 100, 0, Duration::from_millis(5));
        let violations = spiky.violations();
        assert!(violations.iter().any(|v| v.starts_with("mean latency")));
        assert!(violations.iter().any(|v| v.starts_with("p95")));

        let slow = LoadReport::from_samples(micros(&[10; 10]), 10, 0, Duration::from_secs(1));
        assert!(slow.violations().iter().any(|v| v.starts_with("throughput")));
    }

    #[test]
    fn split_deals_round_robin() {
        let shares = split((0..7).collect(), 3);
        assert_eq!(shares, vec![vec![0, 3, 6], vec![1, 4], vec![2, 5]]);
        assert_eq!(split((0..2).collect(), 8).len(), 2);
        assert!(split(Vec::<u8>::new(), 4).is_empty());
    }

    #[test]
    fn sample_evidence_satisfies_every_entry_rule() {
        let registry = TransitionRegistry::default_pipeline();
        let entry = entry_transition(&registry).unwrap();
        assert_eq!(entry.name, "pending_to_development");
        assert!(crate::evidence::check(&entry, &sample_evidence(&entry)).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn load_run_promotes_every_item() {
        let engine = engine();
        let plan = LoadPlan {
            workers: 4,
            operations: 200,
            batch_size: 1,
        };
        let report = run_load(Arc::clone(&engine), plan).await.unwrap();

        assert_eq!(report.operations, 200);
        assert_eq!(report.failures, 0);
        assert!(report.p50 <= report.p95 && report.p95 <= report.p99);
        assert_eq!(depth(&engine, "pending").await, 0);
        assert_eq!(depth(&engine, "development").await, 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn batch_load_run_promotes_every_item() {
        let engine = engine();
        let plan = LoadPlan {
            workers: 3,
            operations: 95,
            batch_size: 10,
        };
        let report = run_batch_load(Arc::clone(&engine), plan).await.unwrap();

        assert_eq!(report.operations, 95);
        assert_eq!(report.failures, 0);
        assert_eq!(depth(&engine, "development").await, 95);
    }

    #[tokio::test]
    async fn rerun_on_same_store_fails_to_seed() {
        let engine = engine();
        let plan = LoadPlan {
            workers: 1,
            operations: 3,
            batch_size: 1,
        };
        run_load(Arc::clone(&engine), plan).await.unwrap();
        assert!(run_load(engine, plan).await.is_err());
    }
}
