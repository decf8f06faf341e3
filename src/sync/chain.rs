use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use bitcoin::{BlockHash, block::Header};
use tracing::{info, warn};

use crate::{
    define_table,
    error::Error,
    storage::{
        kv_store::StorageHandler,
        table::{LedgerTable, Table},
    },
};

use super::{BlockHeight, Point, node::Node};

define_table! {
    name: HeaderByHeightKV,
    key_type: BlockHeight,
    value_type: Header,
    table: LedgerTable::HeaderByHeight
}

/// Max headers a node returns per request
const MAX_HEADERS_PER_MESSAGE: usize = 2_000;

/// Number of most recent heights a locator lists one by one before it starts skipping
const DENSE_LOCATOR_LEN: usize = 10;

/// Best chain of headers known locally, trusted as delivered by the node
pub trait HeaderChain: Send + Sync {
    fn genesis(&self) -> Point;

    fn tip(&self) -> Point;

    fn header_at(&self, height: BlockHeight) -> Option<Header>;

    fn height_of(&self, hash: &BlockHash) -> Option<BlockHeight>;

    /// Up to `limit` headers above `height`, ascending
    fn headers_after(&self, height: BlockHeight, limit: usize) -> Vec<(BlockHeight, Header)>;

    /// Most recent locator entry on this chain, genesis if none is
    fn find_fork(&self, locator: &[BlockHash]) -> Point {
        locator
            .iter()
            .find_map(|hash| {
                self.height_of(hash).map(|height| Point {
                    height,
                    hash: *hash,
                })
            })
            .unwrap_or_else(|| self.genesis())
    }

    /// Hashes from `height` back to genesis, newest first: the 10 most recent heights then
    /// doubling the step each time
    fn locator(&self, height: BlockHeight) -> Vec<BlockHash> {
        let mut out = vec![];
        let mut step = 1;
        let mut index = height.min(self.tip().height);

        loop {
            if let Some(header) = self.header_at(index) {
                out.push(header.block_hash());
            }

            if index == 0 {
                break;
            }

            if out.len() >= DENSE_LOCATOR_LEN {
                step *= 2;
            }

            index = index.saturating_sub(step);
        }

        out
    }
}

#[derive(Default)]
struct ChainState {
    /// Index is the height
    headers: Vec<(BlockHash, Header)>,
    heights: HashMap<BlockHash, BlockHeight>,
}

impl ChainState {
    fn push(&mut self, header: Header) {
        let hash = header.block_hash();

        self.heights.insert(hash, self.headers.len() as BlockHeight);
        self.headers.push((hash, header));
    }

    fn truncate(&mut self, len: usize) {
        for (hash, _) in self.headers.drain(len..) {
            self.heights.remove(&hash);
        }
    }

    fn tip(&self) -> Point {
        let height = self.headers.len().saturating_sub(1);

        Point {
            height: height as BlockHeight,
            hash: self.headers[height].0,
        }
    }
}

/// Result of connecting headers to the local chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainUpdate {
    /// Last header kept from before the update
    pub fork: Point,
    /// Headers dropped from the previous best chain
    pub disconnected: usize,
    pub connected: usize,
}

/// In-memory header chain, optionally persisted to the ledger database
pub struct LocalChain {
    state: RwLock<ChainState>,
    storage: Option<StorageHandler>,
}

impl LocalChain {
    pub fn new(genesis: Header) -> Self {
        let mut state = ChainState::default();
        state.push(genesis);

        Self {
            state: RwLock::new(state),
            storage: None,
        }
    }

    /// Load headers saved by a previous run, keeping them up to date from now on
    pub fn load(storage: StorageHandler, genesis: Header) -> Result<Self, Error> {
        let mut state = ChainState::default();
        state.push(genesis);

        {
            let reader = storage.reader();
            let range = HeaderByHeightKV::encode_range(Some(&1u64), None::<&BlockHeight>);

            for kv in reader.iter_kvs::<HeaderByHeightKV>(range, false)? {
                let (height, header) = kv?;
                let tip = state.tip();

                if height != tip.height + 1 || header.prev_blockhash != tip.hash {
                    warn!(height, "stored headers do not connect, ignoring the rest");
                    break;
                }

                state.push(header);
            }
        }

        info!(tip = %state.tip(), "loaded header chain");

        Ok(Self {
            state: RwLock::new(state),
            storage: Some(storage),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, ChainState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ChainState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().headers.is_empty()
    }

    /// Connect `headers`, the first of which must follow a header already in the chain. Headers
    /// above that one are replaced.
    pub fn connect(&self, headers: &[Header]) -> Result<ChainUpdate, Error> {
        let Some(first) = headers.first() else {
            let tip = self.tip();

            return Ok(ChainUpdate {
                fork: tip,
                disconnected: 0,
                connected: 0,
            });
        };

        for (prev, header) in headers.iter().zip(&headers[1..]) {
            if header.prev_blockhash != prev.block_hash() {
                return Err(Error::fetch(format!(
                    "header {} does not follow {}",
                    header.block_hash(),
                    prev.block_hash()
                )));
            }
        }

        let mut state = self.write();

        let fork_height = *state.heights.get(&first.prev_blockhash).ok_or_else(|| {
            Error::fetch(format!("header {} does not connect", first.block_hash()))
        })?;

        let fork = Point {
            height: fork_height,
            hash: first.prev_blockhash,
        };

        let old_len = state.headers.len();
        let disconnected = old_len - (fork_height as usize + 1);

        if disconnected > 0 {
            warn!(%fork, disconnected, "header chain reorganised");
        }

        state.truncate(fork_height as usize + 1);

        for header in headers {
            state.push(*header);
        }

        if let Some(storage) = &self.storage {
            let mut task = storage.begin_task();

            let connected = state.headers.iter().enumerate().skip(fork_height as usize + 1);

            for (height, (_, header)) in connected {
                task.set::<HeaderByHeightKV>(&(height as BlockHeight), header)?;
            }

            for height in state.headers.len()..old_len {
                task.delete::<HeaderByHeightKV>(&(height as BlockHeight))?;
            }

            task.commit()?;
        }

        Ok(ChainUpdate {
            fork,
            disconnected,
            connected: headers.len(),
        })
    }

    /// Download headers from `node` until it has no more, returns the new tip
    pub async fn sync_headers<N>(&self, node: &mut N) -> Result<Point, Error>
    where
        N: Node + ?Sized,
    {
        loop {
            let locator = self.locator(self.tip().height);
            let headers = node.get_headers(locator).await?;

            let update = self.connect(&headers)?;

            if update.connected > 0 {
                info!(tip = %self.tip(), connected = update.connected, "synced headers");
            }

            if headers.len() < MAX_HEADERS_PER_MESSAGE {
                break;
            }
        }

        Ok(self.tip())
    }
}

impl HeaderChain for LocalChain {
    fn genesis(&self) -> Point {
        Point {
            height: 0,
            hash: self.read().headers[0].0,
        }
    }

    fn tip(&self) -> Point {
        self.read().tip()
    }

    fn header_at(&self, height: BlockHeight) -> Option<Header> {
        self.read()
            .headers
            .get(usize::try_from(height).ok()?)
            .map(|(_, header)| *header)
    }

    fn height_of(&self, hash: &BlockHash) -> Option<BlockHeight> {
        self.read().heights.get(hash).copied()
    }

    fn headers_after(&self, height: BlockHeight, limit: usize) -> Vec<(BlockHeight, Header)> {
        let state = self.read();
        let start = height.saturating_add(1);

        (start..state.headers.len() as BlockHeight)
            .take(limit)
            .map(|h| (h, state.headers[h as usize].1))
            .collect()
    }
}
