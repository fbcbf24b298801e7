//! Simulate command - synthetic load through a local engine
//!
//! Uses the configured engine with the tracing presenter, so presented events
//! show up as log lines. The durable store is replaced by an in-memory one
//! unless the config names a durable path.

use super::load_config;
use super::critical::print_report;
use super::THIN_SEP;
use anyhow::{Context, Result};
use faultline::{ErrorEngine, EventContext, Severity};
use owo_colors::OwoColorize;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone)]
pub struct SimulationPlan {
    pub count: u32,
    pub error_type: String,
    pub component: String,
    pub severity: Option<Severity>,
    pub distinct: bool,
}

impl SimulationPlan {
    fn message(&self, index: u32) -> String {
        if self.distinct {
            format!("simulated {} #{} in '{}'", self.error_type, index, self.component)
        } else {
            format!("simulated {} in '{}'", self.error_type, self.component)
        }
    }
}

pub async fn run(config_path: Option<&Path>, plan: SimulationPlan) -> Result<()> {
    let config = load_config(config_path)?;
    let engine = ErrorEngine::start(config)
        .await
        .context("Failed to start engine")?;

    info!(count = plan.count, error_type = %plan.error_type, component = %plan.component, "Simulating");
    let mut context = EventContext::new();
    context.insert("source".to_string(), "faultlinectl simulate".to_string());
    for i in 0..plan.count {
        engine.submit(
            &plan.error_type,
            &plan.message(i),
            plan.severity,
            &plan.component,
            context.clone(),
        );
    }

    let tick = engine.tick();
    engine.shutdown().await;
    let report = engine.report().await;

    println!();
    println!("{}", "  Simulation report".bold());
    println!("{}", THIN_SEP);
    println!(
        "  Submitted {} x {} at '{}' (severity {})",
        plan.count,
        plan.error_type,
        plan.component,
        engine.classify(plan.severity, &plan.error_type)
    );
    println!(
        "  Janitor pass: {} bucket(s) expired, {} batch(es) flushed",
        tick.expired_buckets, tick.flushed_batches
    );
    println!();
    print_report(&report);
    println!("{}", THIN_SEP);
    println!();
    Ok(())
}
