//! ShardLedger Simulator
//!
//! Runs partition workers, the identity lookup worker, the coordinator and
//! its gateway in one process over the in-process broker, then drives
//! transfers through them.

use std::time::{Duration, Instant};

use clap::Parser;
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod controller;
mod metrics;
mod scenario;

use controller::{SimulationConfig, SimulationController};
use scenario::Scenario;

/// ShardLedger Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Sharded ledger simulation environment")]
struct Args {
    /// Partition ids to start
    #[arg(short, long, value_delimiter = ',', default_value = "1,2,3")]
    partitions: Vec<u32>,

    /// Number of accounts
    #[arg(short, long, default_value = "20")]
    accounts: usize,

    /// First account number
    #[arg(long, default_value = "1001")]
    first_account: i64,

    /// Opening balance of every in-memory account
    #[arg(long, default_value = "1000.00")]
    balance: Decimal,

    /// Random transfers to submit
    #[arg(short, long, default_value = "200")]
    transfers: usize,

    /// Transfers in flight at once
    #[arg(short, long, default_value = "8")]
    concurrency: usize,

    /// Largest random transfer amount
    #[arg(long, default_value = "1500")]
    max_amount: u64,

    /// Coordinator-to-partition timeout in milliseconds
    #[arg(long, default_value = "2000")]
    participant_timeout_ms: u64,

    /// Scenario to run instead of random transfers ("all" runs every one)
    #[arg(short, long)]
    scenario: Option<String>,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Postgres URL per partition, in partition order
    #[arg(long = "database-url")]
    database_urls: Vec<String>,

    /// Emit JSON logs
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
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

    info!("Starting ShardLedger Simulator");
    info!("Partitions: {:?}", args.partitions);
    info!("Accounts: {}", args.accounts);

    let scenarios = match args.scenario.as_deref() {
        None => Vec::new(),
        Some("all") => Scenario::ALL.to_vec(),
        Some(name) => vec![Scenario::load(name)?],
    };

    let mut controller = SimulationController::new(SimulationConfig {
        partitions: args.partitions,
        first_account: args.first_account,
        accounts: args.accounts,
        initial_balance: args.balance,
        transfers: args.transfers,
        concurrency: args.concurrency,
        max_amount: args.max_amount,
        participant_timeout: Duration::from_millis(args.participant_timeout_ms),
        seed: args.seed,
        database_urls: args.database_urls,
    });

    let mut cluster = controller.start_cluster().await?;
    let started = Instant::now();

    let result = if scenarios.is_empty() {
        controller.run_random(&cluster).await
    } else {
        let mut result = Ok(());
        for scenario in scenarios {
            result = controller.run_scenario(scenario, &mut cluster).await;
            if result.is_err() {
                break;
            }
        }
        result
    };

    let coordinator = cluster.coordinator().metrics().snapshot();
    info!("Simulation complete");
    info!("{}", metrics::summary(controller.metrics(), &coordinator, started.elapsed()));

    cluster.shutdown().await?;
    result
}
