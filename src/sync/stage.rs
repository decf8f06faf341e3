use std::{sync::Arc, time::Duration};

use bitcoin::{Transaction, Txid};
use gasket::framework::*;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    colored::CachedColoredRepository,
    error::Error,
    ledger::{
        BalanceRepository, OrderedBalanceChange, StoredTransactionRepository,
        WalletRuleEntryCollection, extract_script_balances, project_wallets,
    },
    storage::kv_store::StorageHandler,
};

use super::{
    BlockInfo, Config, Point,
    chain::{HeaderChain, LocalChain},
    checkpoint::StoredCheckpoint,
    fetcher::{BlockFetcher, FetcherOptions},
    peer::Peer,
};

/*
    Ledger Stage

    Keeps the local header chain in sync with the node, walks the blocks after the checkpoint and
    writes the script and wallet balance changes of each of their transactions, saving the
    checkpoint as it goes. Once caught up it waits for the node to announce a new block.
*/

const SLOW_BLOCK: Duration = Duration::from_secs(5);

type Fetcher = BlockFetcher<Peer, LocalChain, StoredCheckpoint>;
type ColoredRepository = CachedColoredRepository<StoredTransactionRepository>;

#[derive(Stage)]
#[stage(name = "ledger", unit = "BlockInfo", worker = "Worker")]
pub struct Stage {
    config: Config,
    db: StorageHandler,
    rules: Arc<WalletRuleEntryCollection>,
    chain: Arc<LocalChain>,
    // last block written by this process
    last_indexed: Option<Point>,
}

impl Stage {
    pub fn new(
        config: Config,
        db: StorageHandler,
        rules: WalletRuleEntryCollection,
    ) -> Result<Self, Error> {
        let genesis = config.network.genesis_block()?;
        let chain = LocalChain::load(db.clone(), genesis.header)?;

        info!(
            network = ?config.network,
            checkpoint = config.checkpoint_name(),
            wallet_rules = rules.len(),
            header_tip = %chain.tip(),
            "starting ledger stage"
        );

        Ok(Self {
            config,
            db,
            rules: Arc::new(rules),
            chain: Arc::new(chain),
            last_indexed: None,
        })
    }

    fn fetcher_options(&self) -> FetcherOptions {
        let mut options = FetcherOptions::from_config(&self.config);

        // without a checkpoint the next pass starts where this process left off
        if self.config.disable_saving {
            if let Some(last) = self.last_indexed {
                options.from_height = options.from_height.max(last.height + 1);
            }
        }

        options
    }

    fn new_fetcher(&self, peer: Peer) -> Result<Fetcher, Error> {
        let checkpoint = StoredCheckpoint::load(
            self.db.clone(),
            self.config.checkpoint_name(),
            self.chain.genesis().hash,
        )?;

        Ok(BlockFetcher::new(
            peer,
            self.chain.clone(),
            checkpoint,
            self.fetcher_options(),
        ))
    }

    fn reached_end(&self) -> bool {
        self.config
            .to_height
            .is_some_and(|to| self.chain.tip().height >= to)
    }
}

pub struct Worker {
    fetcher: Fetcher,
    transactions: StoredTransactionRepository,
    colored: Option<ColoredRepository>,
}

impl Worker {
    /// Wait until the node has headers past our tip, then start a new pass from the checkpoint
    async fn next_pass(&mut self, stage: &Stage) -> Result<(), WorkerError> {
        let mut peer = self.fetcher.take_node().ok_or(WorkerError::Restart)?;

        let before = stage.chain.tip();
        let mut tip = stage.chain.sync_headers(&mut peer).await.or_restart()?;

        if tip == before {
            debug!(%tip, "caught up, waiting for new blocks");

            peer.new_block_notification.notified().await;
            tip = stage.chain.sync_headers(&mut peer).await.or_restart()?;
        }

        debug!(%tip, "starting next pass");

        self.fetcher = stage.new_fetcher(peer).or_panic()?;

        Ok(())
    }

    async fn index_block(
        &self,
        stage: &Stage,
        unit: &BlockInfo,
    ) -> Result<Vec<OrderedBalanceChange>, Error> {
        let header = &unit.block.header;

        let txs = unit
            .block
            .txdata
            .iter()
            .map(|tx| (tx.compute_txid(), tx.clone()))
            .collect::<Vec<(Txid, Transaction)>>();

        // parents spent within the same block must be resolvable
        let mut task = stage.db.begin_task();
        StoredTransactionRepository::stage(&mut task, &txs)?;
        task.commit()?;

        let mut changes = vec![];

        for (txid, tx) in &txs {
            let scripts = extract_script_balances(
                Some(*txid),
                tx,
                Some(unit.block_id),
                Some(header),
                unit.height,
            );

            let wallets = project_wallets(&scripts, stage.rules.as_ref());

            changes.extend(scripts);
            changes.extend(wallets);
        }

        for change in changes.iter_mut() {
            if !change.ensure_spent_coins(&self.transactions).await? {
                debug!(tx_id = %change.tx_id(), "spent coins left unresolved");
            }

            if let Some(colored) = &self.colored {
                change.ensure_colored(colored).await?;
            }
        }

        let mut task = stage.db.begin_task();

        for change in &changes {
            BalanceRepository::stage(&mut task, change)?;
        }

        task.commit()?;

        Ok(changes)
    }
}

#[async_trait::async_trait(?Send)]
impl gasket::framework::Worker<Stage> for Worker {
    async fn bootstrap(stage: &Stage) -> Result<Self, WorkerError> {
        info!("connecting to node {}...", stage.config.node.p2p_address);

        let mut peer = Peer::connect(&stage.config.node.p2p_address, stage.config.network.magic())
            .await
            .or_retry()?;

        info!(
            node = stage.config.node.p2p_address,
            network = ?stage.config.network,
            "connected to upstream node"
        );

        let tip = stage.chain.sync_headers(&mut peer).await.or_restart()?;

        info!(%tip, "header chain synced");

        let transactions = StoredTransactionRepository::new(stage.db.clone());

        let colored = if stage.config.index_colored {
            let size = stage.config.colored_cache_size_bytes();

            info!(
                "using colored transaction cache with size: {:.2} MB ({} bytes)",
                size as f64 / (1024.0 * 1024.0),
                size
            );

            Some(CachedColoredRepository::new(
                transactions.clone(),
                stage.db.clone(),
                size,
            ))
        } else {
            None
        };

        Ok(Worker {
            fetcher: stage.new_fetcher(peer).or_panic()?,
            transactions,
            colored,
        })
    }

    async fn schedule(
        &mut self,
        stage: &mut Stage,
    ) -> Result<WorkSchedule<BlockInfo>, WorkerError> {
        if let Some(block) = self.fetcher.next().await.or_restart()? {
            return Ok(WorkSchedule::Unit(block));
        }

        self.fetcher.force_save_checkpoint().or_panic()?;

        if stage.reached_end() {
            info!("passed stop height, compacting db then stopping ledger...");
            stage.db.flush_and_compact().or_panic()?;

            return Ok(WorkSchedule::Done);
        }

        self.next_pass(stage).await?;

        Ok(WorkSchedule::Idle)
    }

    async fn execute(&mut self, unit: &BlockInfo, stage: &mut Stage) -> Result<(), WorkerError> {
        let started = Instant::now();

        let changes = self.index_block(stage, unit).await.or_panic()?;

        stage.last_indexed = Some(unit.point());

        let saved = self.fetcher.save_checkpoint().or_panic()?;

        let elapsed = started.elapsed();

        debug!(
            point = %unit.point(),
            txs = unit.block.txdata.len(),
            changes = changes.len(),
            saved,
            ?elapsed,
            "indexed block"
        );

        if elapsed > SLOW_BLOCK {
            warn!(
                point = %unit.point(),
                ?elapsed,
                "block processed slowly, dumping RocksDB metrics..."
            );

            if let Err(e) = stage.db.log_perf_snapshot() {
                warn!("failed to log storage stats: {e}");
            }

            if let Some(colored) = &self.colored {
                debug!(cache = colored.log(), "colored cache");
            }
        }

        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), WorkerError> {
        self.fetcher.force_save_checkpoint().or_panic()?;
        self.fetcher.dispose();

        Ok(())
    }
}
