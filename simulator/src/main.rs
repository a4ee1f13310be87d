//! Vaultline Simulator
//!
//! Runs named back-office scenarios or a randomized load against a simulated
//! payment gateway, then reports client-side and service metrics.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vaultline_backoffice::BackOfficeConfig;
use vaultline_ledger::{LedgerStore, MemoryStore, PgStore};

mod controller;
mod gateway;
mod metrics;
mod scenario;

use controller::SimulationController;
use scenario::Scenario;

/// Vaultline Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Vaultline back-office scenario runner and load simulator")]
struct Args {
    /// Scenario to run; runs a load simulation when omitted
    #[arg(short, long)]
    scenario: Option<String>,

    /// Run every named scenario
    #[arg(long, conflicts_with = "scenario")]
    all: bool,

    /// Customers funded for the load simulation
    #[arg(short, long, default_value = "8")]
    customers: usize,

    /// Operations issued by the load simulation
    #[arg(short, long, default_value = "500")]
    operations: usize,

    /// Operations in flight at once
    #[arg(long, default_value = "16")]
    concurrency: usize,

    /// Share of verifications the gateway declines (0.0 to 1.0)
    #[arg(long, default_value = "0.0")]
    decline_rate: f64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Emit JSON logs
    #[arg(long)]
    json: bool,

    /// Print service metrics in Prometheus text format at the end
    #[arg(long)]
    prometheus: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = BackOfficeConfig::from_env();

    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
    );
    if args.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Vaultline Simulator");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    // Scenarios inject store faults and count audit rows, so they always run in memory.
    let scenarios: Vec<Scenario> = if args.all {
        Scenario::NAMES
            .iter()
            .map(|name| Scenario::load(name))
            .collect::<anyhow::Result<_>>()?
    } else if let Some(name) = &args.scenario {
        vec![Scenario::load(name)?]
    } else {
        Vec::new()
    };

    if !scenarios.is_empty() {
        for scenario in scenarios {
            let store = MemoryStore::new();
            let controller = SimulationController::new(
                config.clone(),
                Arc::new(store.clone()),
                Some(store),
                args.seed,
            );
            controller.start().await?;
            let result = controller.run_scenario(scenario).await;
            controller.stop().await?;
            report(&controller, args.prometheus).await;
            result?;
        }
        return Ok(());
    }

    let (store, memory): (Arc<dyn LedgerStore>, Option<MemoryStore>) = match &config.database_url {
        Some(url) => {
            info!("Using PostgreSQL store");
            let pg = PgStore::connect(url, config.database_max_connections).await?;
            (Arc::new(pg), None)
        }
        None => {
            let store = MemoryStore::new();
            (Arc::new(store.clone()), Some(store))
        }
    };

    let controller = SimulationController::new(config, store, memory, args.seed);
    controller.start().await?;
    controller.set_decline_rate(args.decline_rate);
    let load = controller
        .run_load(args.customers, args.operations, args.concurrency)
        .await;
    controller.stop().await?;
    report(&controller, args.prometheus).await;

    let load = load?;
    info!(
        expected = %load.expected_total,
        actual = %load.actual_total,
        "Load simulation complete"
    );
    if !load.conserved() {
        return Err(anyhow::anyhow!("balances do not match the money that moved in and out"));
    }

    Ok(())
}

async fn report(controller: &SimulationController, prometheus: bool) {
    let metrics = controller.get_metrics().await;
    info!("Total operations: {}", metrics.total_operations);
    info!("Successful: {}", metrics.successful_operations);
    info!("Failed: {}", metrics.failed_operations);
    for (code, count) in metrics.failures() {
        info!("  {}: {}", code, count);
    }
    info!("Success rate: {:.1}%", metrics.success_rate() * 100.0);
    info!(
        "Latency p50/p99: {}us / {}us",
        metrics.p50_latency_us(),
        metrics.p99_latency_us()
    );

    let service = controller.service_metrics();
    info!(
        replays = service.idempotent_replays,
        reconciliations = service.reconciliations,
        rejections = service.rejections,
        duplicate_confirmations = service.duplicate_confirmations,
        audit_failures = service.audit_failures,
        "Service metrics"
    );
    if prometheus {
        println!("{}", controller.prometheus());
    }
}
