//! ShardCtl - Administrative tool for per-base election records
//!
//! Usage:
//!   shardctl stat <base>       - Print one election record as JSON
//!   shardctl dump              - Print all known election records as JSON
//!   shardctl reset <base>      - Force a base to NONE, fencing its epoch
//!   shardctl smudge <base>     - Disturb an election (chaos/test use)
//!   shardctl unlock-all        - Resign every locally held leadership
//!   shardctl flush-all         - Force-reset every known base
//!
//! Exit codes: 0 on success, 1 when the base is not found (or a bulk
//! operation partially failed), 2 on coordination error.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardlock::admin::{AdminInterface, BatchOutcome};
use shardlock::config::ShardlockConfig;
use shardlock::coordination::{Coordinator, MemoryEnsemble, RateLimitedCoordinator};
use shardlock::election::{BaseId, ElectionManager, ElectionRecord, PeerId, SmudgeMode};
use shardlock::error::{Error, Result};

/// Shardlock election control tool
#[derive(Parser)]
#[command(name = "shardctl")]
#[command(about = "Inspect and repair per-base election records", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "shardlock.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the election record of a base as JSON
    Stat {
        /// Base identifier
        base: String,
    },
    /// Print all known election records as a JSON array
    Dump,
    /// Force a base back to NONE, advancing its generation
    Reset {
        /// Base identifier
        base: String,
    },
    /// Disturb a base's election (chaos/test use)
    Smudge {
        /// Base identifier
        base: String,
        /// Delete the current leader's candidate node (default mode)
        #[arg(long, conflicts_with = "corrupt")]
        delete_leader: bool,
        /// Corrupt the sequence ordering for one node
        #[arg(long)]
        corrupt: bool,
    },
    /// Resign every locally held leadership or candidacy
    UnlockAll,
    /// Force-reset every locally known base
    FlushAll,
}

fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build an admin interface from configuration
///
/// The process-local ensemble backend serves standalone and test
/// deployments; production ensembles plug their client into the same
/// `Coordinator` seam. Bases listed under `[coordination] bases` are
/// adopted up front so they are inspectable without a local election.
async fn build_admin(config: &ShardlockConfig) -> Result<AdminInterface> {
    let ensemble = MemoryEnsemble::new();
    let client: Arc<dyn Coordinator> = Arc::new(ensemble.client());
    client.connect().await?;
    let governed: Arc<dyn Coordinator> = Arc::new(RateLimitedCoordinator::new(
        client,
        config.coordination.max_outstanding,
        config.retry_backoff(),
        config.retry_window(),
    ));
    let manager = ElectionManager::new(
        PeerId::new(config.peer.id.clone()),
        governed,
        config.peer.lease_ms,
    );
    for base in &config.coordination.bases {
        manager.adopt(&BaseId::new(base.clone())).await?;
    }
    Ok(AdminInterface::new(manager))
}

fn record_json(record: &ElectionRecord) -> serde_json::Value {
    serde_json::json!({
        "base": &record.base,
        "leader": &record.leader,
        "generation": record.generation,
        "state": record.state.to_string(),
        "peers": &record.peers,
    })
}

/// Print a bulk outcome and derive the process exit code
fn finish_batch(name: &str, outcome: &BatchOutcome) -> i32 {
    println!("{}: {} succeeded, {} failed", name, outcome.succeeded, outcome.failures.len());
    for failure in &outcome.failures {
        eprintln!("  {}: {}", failure.base, failure.reason);
    }
    if outcome.all_ok() {
        0
    } else {
        1
    }
}

fn exit_code(err: &Error) -> i32 {
    match err {
        Error::BaseNotFound(_) => 1,
        _ => 2,
    }
}

async fn run(cli: Cli) -> i32 {
    let config = if cli.config.exists() {
        match ShardlockConfig::from_file(&cli.config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: invalid config {}: {}", cli.config.display(), e);
                return 2;
            }
        }
    } else {
        // No config file; operate with a default standalone peer
        match ShardlockConfig::from_str("[peer]\nid = \"shardctl\"\n") {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 2;
            }
        }
    };

    let admin = match build_admin(&config).await {
        Ok(admin) => admin,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_code(&e);
        }
    };

    match cli.command {
        Commands::Stat { base } => {
            let base = BaseId::new(base);
            match admin.stat(&base).await {
                Ok(record) => {
                    println!("{}", serde_json::to_string_pretty(&record_json(&record)).unwrap_or_default());
                    0
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit_code(&e)
                }
            }
        }
        Commands::Dump => {
            let records: Vec<serde_json::Value> =
                admin.dump().await.iter().map(record_json).collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&records).unwrap_or_default()
            );
            0
        }
        Commands::Reset { base } => {
            let base = BaseId::new(base);
            match admin.reset(&base).await {
                Ok(generation) => {
                    println!("reset {} to NONE at generation {}", base, generation);
                    0
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit_code(&e)
                }
            }
        }
        Commands::Smudge {
            base,
            delete_leader: _,
            corrupt,
        } => {
            let base = BaseId::new(base);
            let mode = if corrupt {
                SmudgeMode::Corrupt
            } else {
                SmudgeMode::DeleteLeader
            };
            match admin.smudge(&base, mode).await {
                Ok(()) => {
                    println!("smudged {} ({})", base, mode);
                    0
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit_code(&e)
                }
            }
        }
        Commands::UnlockAll => {
            let outcome = admin.unlock_all().await;
            finish_batch("unlock-all", &outcome)
        }
        Commands::FlushAll => {
            let outcome = admin.flush_all().await;
            finish_batch("flush-all", &outcome)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    let code = run(cli).await;
    std::process::exit(code);
}
