//! ledger-commit: stage, price and submit writes against a local ledger
//!
//! Runs the commit negotiation engine over a JSON-snapshot ledger and a
//! file-backed cache, so flows can be exercised from a shell.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use ledger_commit::{
    prepare::build_commit, CommitCallbacks, CommitExecutor, CommitRequest, CommitState, Config,
    DepositCalculator, DepositTier, FileCacheStore, LedgerClient, LocalLedger, PermissionCache,
    PermissionKey, WritePermission,
};

#[derive(Parser)]
#[command(name = "ledger-commit")]
#[command(about = "Commit negotiation for cost-metered ledger writes")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "ledger-commit.toml")]
    config: PathBuf,

    /// Ledger snapshot file (overrides config file)
    #[arg(long, env = "LEDGER_COMMIT_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Cache file (overrides config file)
    #[arg(long, env = "LEDGER_COMMIT_CACHE")]
    cache_path: Option<PathBuf>,

    /// Storage price per byte, in tokens (overrides config file)
    #[arg(long, env = "LEDGER_COMMIT_COST_PER_BYTE")]
    cost_per_byte: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct Target {
    /// Signed-in account
    #[arg(short, long)]
    account: String,

    /// Resource the write is delegated to
    #[arg(short, long)]
    resource: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Show the diff, deposit and permission for a payload without writing
    Prepare {
        #[command(flatten)]
        target: Target,
        /// JSON payload, or @file to read it from a file
        #[arg(short, long)]
        payload: String,
        /// Write the whole payload, not just its diff
        #[arg(long)]
        force: bool,
    },

    /// Negotiate and submit a payload
    Commit {
        #[command(flatten)]
        target: Target,
        /// JSON payload, or @file to read it from a file
        #[arg(short, long)]
        payload: String,
        #[arg(long)]
        force: bool,
        /// Extra storage to buy, in bytes (0, 5000, 20000 or 100000)
        #[arg(long)]
        tier: Option<u64>,
        /// Let the resource make similar writes without asking
        #[arg(long, conflicts_with = "no_delegate")]
        delegate: bool,
        /// Ask again next time
        #[arg(long)]
        no_delegate: bool,
    },

    /// Show or clear the cached write permission
    Permission {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        clear: bool,
    },

    /// Print ledger values at the given paths (everything when none given)
    State { keys: Vec<String> },

    /// Price a byte count
    Deposit {
        bytes: u64,
        #[arg(long, default_value_t = 0)]
        tier: u64,
    },
}

fn parse_payload(raw: &str) -> anyhow::Result<Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("payload is not valid JSON")
}

fn request(target: &Target, payload: &str, force: bool) -> anyhow::Result<CommitRequest> {
    let mut request = CommitRequest::new(parse_payload(payload)?).account(&target.account);
    if let Some(resource) = &target.resource {
        request = request.resource(resource);
    }
    request.force = force;
    Ok(request)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ledger_commit=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;

    // Apply CLI overrides
    if let Some(state_file) = cli.state_file {
        config.ledger.state_file = state_file;
    }
    if let Some(cache_path) = cli.cache_path {
        config.cache.path = cache_path;
    }
    if let Some(cost) = cli.cost_per_byte {
        config.ledger.cost_per_byte = cost;
    }
    config.validate()?;

    let cost_per_byte = config.ledger.cost_per_byte()?;
    info!(
        state_file = %config.ledger.state_file.display(),
        cache = %config.cache.path.display(),
        cost_per_byte = %cost_per_byte,
        "Starting ledger-commit"
    );

    let ledger = Arc::new(
        LocalLedger::open(&config.ledger.state_file, cost_per_byte)
            .await?
            .with_initial_storage(config.ledger.initial_account_storage_bytes)
            .with_delegate_key(config.ledger.delegate_key.clone()),
    );
    let cache = Arc::new(FileCacheStore::open(&config.cache.path).await?);
    let calculator = DepositCalculator::new(cost_per_byte);

    match cli.command {
        Command::Prepare {
            target,
            payload,
            force,
        } => {
            let request = request(&target, &payload, force)?;
            let prepared = build_commit(ledger.as_ref(), &request).await?;
            let permission = match request.permission_key() {
                Some(key) => PermissionCache::new(cache).get(&key).await,
                None => WritePermission::Denied,
            };

            match &prepared.diff {
                Some(diff) => println!("Diff:\n{}", serde_json::to_string_pretty(diff)?),
                None => println!("No new data to save"),
            }
            println!(
                "Deposit: {} ({} bytes)",
                calculator.total_deposit(prepared.deposit_bytes, DepositTier::None),
                prepared.deposit_bytes
            );
            println!("Delegated key may write: {}", prepared.permission_granted);
            println!("Cached permission: {}", serde_json::to_string(&permission)?);
        }

        Command::Commit {
            target,
            payload,
            force,
            tier,
            delegate,
            no_delegate,
        } => {
            let request = request(&target, &payload, force)?;
            let extra_tier = match tier {
                Some(bytes) => DepositTier::try_from(bytes)?,
                None => config.commit.extra_tier,
            };

            let callbacks = CommitCallbacks::new()
                .on_commit(|diff| println!("Committed:\n{}", serde_json::to_string_pretty(diff).unwrap_or_default()))
                .on_error(|e| eprintln!("Commit failed: {}", e));
            let handle = CommitExecutor::spawn(ledger.clone(), cache, callbacks);

            handle.set_request(request).await?;
            let snapshot = handle
                .wait_for(|s| !s.state.is_busy() && s.permission.is_loaded())
                .await?;

            match snapshot.state {
                CommitState::AwaitingDecision => {
                    let Some(prepared) = &snapshot.prepared else {
                        bail!("executor awaiting decision without a prepared commit");
                    };
                    if prepared.diff.is_none() {
                        println!("No new data to save");
                        return Ok(());
                    }
                    let delegate_future = if delegate {
                        true
                    } else {
                        !no_delegate && config.commit.delegate_future && snapshot.delegate_future
                    };
                    println!(
                        "Deposit: {} + {} extra storage",
                        snapshot.mandatory_deposit, extra_tier
                    );
                    handle.confirm(extra_tier, delegate_future).await?;
                }
                CommitState::Idle => {
                    println!("Payload unchanged");
                    return Ok(());
                }
                CommitState::Failed => {
                    if let Some(e) = snapshot.last_error {
                        return Err(e.into());
                    }
                    bail!("commit failed");
                }
                _ => {}
            }

            let settled = handle.wait_for(|s| s.is_settled()).await?;
            match settled.state {
                CommitState::Submitted => println!("Submitted"),
                state => {
                    if let Some(e) = settled.last_error {
                        return Err(e.into());
                    }
                    bail!("commit ended in state {}", state);
                }
            }
        }

        Command::Permission {
            target,
            clear,
        } => {
            let Some(resource) = target.resource else {
                bail!("--resource is required");
            };
            let permissions = PermissionCache::new(cache);
            let key = PermissionKey::new(resource, target.account);
            if clear {
                permissions.set(&key, &WritePermission::Unknown).await?;
                println!("Cleared permission for {}", key);
            } else {
                let permission = permissions.try_get(&key).await?;
                println!("{}", serde_json::to_string_pretty(&permission)?);
            }
        }

        Command::State { keys } => {
            let value = if keys.is_empty() {
                ledger.snapshot().await.data
            } else {
                ledger.fetch_state(&keys).await?
            };
            println!("{}", serde_json::to_string_pretty(&value)?);
        }

        Command::Deposit { bytes, tier } => {
            let tier = DepositTier::try_from(tier)?;
            println!(
                "{} bytes + {}: {}",
                bytes,
                tier,
                calculator.total_deposit(bytes, tier)
            );
        }
    }

    Ok(())
}
