use bitcoin::{BlockHash, block::Header};
use tracing::debug;

use crate::{
    define_table,
    error::Error,
    storage::{
        kv_store::StorageHandler,
        table::{LedgerTable, Table},
    },
};

define_table! {
    name: CheckpointByNameKV,
    key_type: String,
    value_type: Vec<BlockHash>,
    table: LedgerTable::CheckpointByName
}

/// Named sync progress, stored as a block locator
pub trait Checkpoint: Send {
    fn name(&self) -> &str;

    fn genesis(&self) -> BlockHash;

    /// Newest first, always ending with genesis
    fn locator(&self) -> &[BlockHash];

    /// Record `header` as the last processed block, `locator` being the chain below it
    fn save_progress(&mut self, header: &Header, locator: Vec<BlockHash>) -> Result<(), Error>;
}

/// Locator starting at `tip` and ending at `genesis`, without repeated entries at either end
fn normalize(tip: BlockHash, locator: Vec<BlockHash>, genesis: BlockHash) -> Vec<BlockHash> {
    let mut out = Vec::with_capacity(locator.len() + 2);

    out.push(tip);
    out.extend(locator.into_iter().skip_while(|hash| *hash == tip));

    if out.last() != Some(&genesis) {
        out.push(genesis);
    }

    out
}

/// Checkpoint held in memory only, lost on restart
pub struct InMemoryCheckpoint {
    name: String,
    genesis: BlockHash,
    locator: Vec<BlockHash>,
}

impl InMemoryCheckpoint {
    pub fn new(name: impl Into<String>, genesis: BlockHash) -> Self {
        Self {
            name: name.into(),
            genesis,
            locator: vec![genesis],
        }
    }
}

impl Checkpoint for InMemoryCheckpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn genesis(&self) -> BlockHash {
        self.genesis
    }

    fn locator(&self) -> &[BlockHash] {
        &self.locator
    }

    fn save_progress(&mut self, header: &Header, locator: Vec<BlockHash>) -> Result<(), Error> {
        self.locator = normalize(header.block_hash(), locator, self.genesis);

        Ok(())
    }
}

/// Checkpoint persisted in the ledger database under its name
pub struct StoredCheckpoint {
    storage: StorageHandler,
    inner: InMemoryCheckpoint,
}

impl StoredCheckpoint {
    /// Read the checkpoint saved under `name`, starting from genesis if there is none
    pub fn load(storage: StorageHandler, name: &str, genesis: BlockHash) -> Result<Self, Error> {
        let mut inner = InMemoryCheckpoint::new(name, genesis);

        let stored = storage
            .reader()
            .get::<CheckpointByNameKV>(&name.to_string())?;

        if let Some(locator) = stored.filter(|l| !l.is_empty()) {
            debug!(name, tip = %locator[0], "loaded checkpoint");

            inner.locator = locator;
        }

        Ok(Self { storage, inner })
    }
}

impl Checkpoint for StoredCheckpoint {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn genesis(&self) -> BlockHash {
        self.inner.genesis()
    }

    fn locator(&self) -> &[BlockHash] {
        self.inner.locator()
    }

    fn save_progress(&mut self, header: &Header, locator: Vec<BlockHash>) -> Result<(), Error> {
        let locator = normalize(header.block_hash(), locator, self.inner.genesis);

        let mut task = self.storage.begin_task();
        task.set::<CheckpointByNameKV>(&self.inner.name, &locator)?;
        task.commit()?;

        self.inner.locator = locator;

        Ok(())
    }
}
