//! ShardHarass - Chaos workload generator for the election manager
//!
//! Drives many concurrent workers through acquire/hold/release cycles
//! across a pool of bases while injecting session expiry and smudges, and
//! asserts the election invariants the whole time. Exits non-zero iff a
//! violation was recorded or convergence exceeded the configured bound.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardlock::config::ShardlockConfig;
use shardlock::harass::{self, HarassConfig};

/// Shardlock harassment driver
#[derive(Parser)]
#[command(name = "shardharass")]
#[command(about = "Harass the election manager and check its invariants", long_about = None)]
struct Cli {
    /// Path to config file (flags override its [harass] section)
    #[arg(long, default_value = "shardlock.toml")]
    config: PathBuf,

    /// Number of bases in the pool
    #[arg(long)]
    bases: Option<usize>,

    /// Number of concurrent workers
    #[arg(long)]
    workers: Option<usize>,

    /// Number of simulated peers
    #[arg(long)]
    peers: Option<usize>,

    /// Run duration in seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Probability in [0,1] that a hold ends in an injected fault
    #[arg(long)]
    churn_rate: Option<f64>,

    /// Upper bound on post-churn convergence in milliseconds
    #[arg(long)]
    convergence_bound: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_config(cli: &Cli) -> anyhow::Result<HarassConfig> {
    let settings = if cli.config.exists() {
        ShardlockConfig::from_file(&cli.config)?.harass
    } else {
        Default::default()
    };
    let mut config = HarassConfig::from_settings(&settings);
    if let Some(bases) = cli.bases {
        config.bases = bases;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(peers) = cli.peers {
        config.peers = peers;
    }
    if let Some(duration) = cli.duration {
        config.duration = Duration::from_secs(duration);
    }
    if let Some(churn_rate) = cli.churn_rate {
        anyhow::ensure!(
            (0.0..=1.0).contains(&churn_rate),
            "--churn-rate must be within [0, 1]"
        );
        config.churn_rate = churn_rate;
    }
    if let Some(bound) = cli.convergence_bound {
        config.convergence_bound = Duration::from_millis(bound);
    }
    anyhow::ensure!(
        config.bases > 0 && config.workers > 0 && config.peers > 0,
        "--bases, --workers and --peers must be at least 1"
    );
    Ok(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let report = match harass::run(config).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    println!("{}", report);
    if report.passed() {
        std::process::exit(0);
    }
    std::process::exit(1);
}
