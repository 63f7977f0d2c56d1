mod cli;
mod ui;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Command};
use promoter::config::PromoterConfig;
use promoter::engine::PromotionEngine;
use promoter::harness::{self, LoadPlan};
use promoter::state_machine::TransitionRegistry;
use promoter::store::MemoryStore;
use ui::{BenchProgress, Terminal};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    let config = match &cli.config {
        Some(path) => PromoterConfig::load_from(path)?,
        None => PromoterConfig::load()?,
    };
    let terminal = Terminal::default();

    match cli.command {
        Command::Demo => demo(&config, &terminal).await,
        Command::Bench {
            workers,
            operations,
            batch_size,
        } => {
            let plan = LoadPlan {
                workers: workers.unwrap_or(config.bench_workers),
                operations: operations.unwrap_or(config.bench_operations),
                batch_size,
            };
            bench(&config, plan, &terminal).await
        }
        Command::Registry => {
            terminal.registry(&config.registry()?);
            Ok(())
        }
    }
}

/// Walks the default pipeline through single, repeated and batch promotions.
async fn demo(config: &PromoterConfig, terminal: &Terminal) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let engine = PromotionEngine::new(
        store,
        TransitionRegistry::default_pipeline(),
        config.engine_options(),
    )?;
    engine.warm_up().await?;

    let t0 = Utc::now();
    let metadata = BTreeMap::from([("owner".to_string(), "demo".to_string())]);
    for id in ["X-1", "X-2"] {
        engine.enqueue(id, &metadata, t0).await?;
    }
    let evidence = json!({
        "requirements_analysis": "login flow needs rate limiting",
        "acceptance_criteria": ["a", "b"],
    });

    terminal.heading("promote X-1");
    let t1 = t0 + Duration::seconds(1);
    terminal.promotion(
        &engine
            .promote("X-1", &evidence, "pending_to_development", t1)
            .await,
    );
    terminal.promotion(
        &engine
            .promote("X-1", &evidence, "pending_to_development", t1)
            .await,
    );
    terminal.status(&engine.status("X-1").await?);

    terminal.heading("promote X-2 with incomplete evidence");
    let partial = json!({ "requirements_analysis": "half done" });
    terminal.promotion(
        &engine
            .promote("X-2", &partial, "pending_to_development", t1)
            .await,
    );

    terminal.heading("batch promote X-2, X-3");
    let t2 = t0 + Duration::seconds(2);
    let batch = engine
        .batch_promote(
            "pending_to_development",
            t2,
            &[evidence.clone(), evidence],
            &["X-2".to_string(), "X-3".to_string()],
        )
        .await?;
    terminal.batch(&batch);
    terminal.status(&engine.status("X-2").await?);

    terminal.heading("evidence history of X-1");
    for record in engine.evidence_history("X-1", 10).await? {
        println!(
            "  {} {} {}",
            record.created_at.to_rfc3339(),
            record.transition_type,
            record.evidence
        );
    }
    Ok(())
}

async fn bench(config: &PromoterConfig, plan: LoadPlan, terminal: &Terminal) -> Result<()> {
    let engine = Arc::new(PromotionEngine::new(
        Arc::new(MemoryStore::new()),
        config.registry()?,
        config.engine_options(),
    )?);

    let progress = BenchProgress::start(&format!(
        "promoting {} items with {} workers",
        plan.operations, plan.workers
    ));
    let report = if plan.batch_size > 1 {
        harness::run_batch_load(engine, plan).await
    } else {
        harness::run_load(engine, plan).await
    };
    progress.finish();

    terminal.report(&report.context("bench run")?);
    Ok(())
}
