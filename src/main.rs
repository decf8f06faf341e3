use std::{path::PathBuf, time::Duration};

use bitcoin::{Address, address::NetworkUnchecked};
use clap::{Parser, Subcommand};
use maestro_ledger::{
    error::Error,
    ledger::{BalanceId, BalanceRepository, BalanceView, WalletConfig, WalletRuleEntryCollection},
    shutdown::ShutdownManager,
    storage::{self, kv_store::StorageHandler, stats_logger::start_stats_logger},
    sync::{
        self,
        chain::{HeaderChain, LocalChain},
        checkpoint::{Checkpoint, StoredCheckpoint},
    },
};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_DB_PATH: &str = "./tmp/ledger";
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();

    let config = Config::new(&args.config)?;

    let db_path = config
        .db_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

    info!("using db path: {}", db_path.display());

    match args.command {
        Command::Run => run(config, db_path).await,
        Command::Balances { address } => {
            let db = open_read_only(&config, db_path)?;

            let address = address
                .parse::<Address<NetworkUnchecked>>()
                .and_then(|a| a.require_network(config.sync.network.address_network()))
                .map_err(|e| Error::Custom(format!("invalid address {address}: {e}")))?;

            let balance_id = BalanceId::from_script(&address.script_pubkey());

            print_balance(db, &balance_id)
        }
        Command::Wallet { id } => {
            let db = open_read_only(&config, db_path)?;

            print_balance(db, &BalanceId::from_wallet(id))
        }
        Command::Headers => {
            let db = open_read_only(&config, db_path)?;

            print_headers(&config, db)
        }
    }
}

async fn run(config: Config, db_path: PathBuf) -> Result<(), Error> {
    info!("running ledger with config: {:?}", config.sync);

    let network = config.sync.network.address_network();

    let rules = config
        .wallets
        .into_iter()
        .map(|wallet| wallet.into_entry(network))
        .collect::<Result<WalletRuleEntryCollection, _>>()?;

    let db = StorageHandler::open(
        db_path,
        false,
        config.storage.rocksdb_memory_budget_bytes(),
    )?;

    tokio::spawn(start_stats_logger(db.clone(), STATS_LOG_INTERVAL));

    ShutdownManager::new().exit_on_signal();

    let daemon = sync::pipeline::pipeline(config.sync, db, rules)?;

    daemon.block();

    info!("ledger pipeline finished");

    Ok(())
}

fn open_read_only(config: &Config, db_path: PathBuf) -> Result<StorageHandler, Error> {
    let db = StorageHandler::open(db_path, true, config.storage.rocksdb_memory_budget_bytes())?;
    db.try_refresh_read_only_data()?;

    Ok(db)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Error> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Custom(format!("failed to serialize output: {e}")))?;

    println!("{json}");

    Ok(())
}

fn print_balance(db: StorageHandler, balance_id: &BalanceId) -> Result<(), Error> {
    let changes = BalanceRepository::new(db).query(balance_id)?;

    print_json(&BalanceView::new(balance_id, &changes))
}

#[derive(Serialize)]
struct HeadersView {
    tip_height: u64,
    tip_hash: String,
    checkpoint: String,
    checkpoint_hash: String,
    /// Absent when the checkpointed block is no longer on the local chain
    checkpoint_height: Option<u64>,
}

fn print_headers(config: &Config, db: StorageHandler) -> Result<(), Error> {
    let genesis = config.sync.network.genesis_block()?;
    let chain = LocalChain::load(db.clone(), genesis.header)?;
    let tip = chain.tip();

    let name = config.sync.checkpoint_name();
    let checkpoint = StoredCheckpoint::load(db, name, genesis.block_hash())?;

    // never empty, a fresh checkpoint holds genesis
    let checkpoint_hash = checkpoint
        .locator()
        .first()
        .copied()
        .unwrap_or_else(|| genesis.block_hash());

    print_json(&HeadersView {
        tip_height: tip.height,
        tip_hash: tip.hash.to_string(),
        checkpoint: name.to_string(),
        checkpoint_hash: checkpoint_hash.to_string(),
        checkpoint_height: chain.height_of(&checkpoint_hash),
    })
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sync with the node and index balance changes
    Run,
    /// Balance changes of an address
    Balances { address: String },
    /// Balance changes of a configured wallet
    Wallet { id: String },
    /// Local header chain tip and checkpoint position
    Headers,
}

#[derive(Debug, Parser)]
#[clap(name = "maestro-ledger")]
#[clap(bin_name = "maestro-ledger")]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    config: Option<PathBuf>,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub storage: storage::Config,
    pub sync: sync::Config,
    #[serde(default)]
    pub wallets: Vec<WalletConfig>,
}

impl Config {
    pub fn new(config_path: &Option<PathBuf>) -> Result<Self, config::ConfigError> {
        let mut s = config::Config::builder();

        s = s.add_source(config::File::with_name("ledger.toml").required(false));

        if let Some(explicit) = config_path.as_ref().and_then(|x| x.to_str()) {
            s = s.add_source(config::File::with_name(explicit).required(true));
        }

        s = s.add_source(config::Environment::with_prefix("LEDGER").separator("_"));

        s.build()?.try_deserialize()
    }
}
