use std::{fmt, time::Duration};

use bitcoin::{Block, BlockHash, consensus::Decodable, p2p::Magic};
use serde::Deserialize;

use crate::error::Error;

pub mod chain;
pub mod checkpoint;
pub mod fetcher;
pub mod node;
pub mod peer;
pub mod pipeline;
pub mod progress;
pub mod stage;

pub type BlockHeight = u64;

pub const DEFAULT_CHECKPOINT_NAME: &str = "default";
pub const DEFAULT_CHECKPOINT_INTERVAL_SECS: u64 = 15 * 60;
pub const DEFAULT_BLOCK_PAGE_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub height: BlockHeight,
    pub hash: BlockHash,
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.height, self.hash)
    }
}

/// A block delivered by the fetcher, paired with its height in the local header chain
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub height: BlockHeight,
    pub block_id: BlockHash,
    pub block: Block,
}

impl BlockInfo {
    pub fn point(&self) -> Point {
        Point {
            height: self.height,
            hash: self.block_id,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub network: Network,

    /// Name the sync progress is saved under
    pub checkpoint: Option<String>,
    /// First height to index
    #[serde(default)]
    pub from_height: BlockHeight,
    /// Stop after indexing this height
    pub to_height: Option<BlockHeight>,

    /// Min seconds between two checkpoint saves
    pub checkpoint_interval_secs: Option<u64>,
    /// Index without reading or saving the checkpoint
    #[serde(default)]
    pub disable_saving: bool,

    /// Max number of blocks to request from the node at once
    pub block_page_size: Option<usize>,
    pub stage_timeout_secs: Option<u64>,

    /// Annotate balance changes with Open Assets data
    #[serde(default)]
    pub index_colored: bool,
    /// Size in MB of the colored transaction cache
    pub colored_cache_size: Option<f64>,
}

impl Config {
    pub fn checkpoint_name(&self) -> &str {
        self.checkpoint.as_deref().unwrap_or(DEFAULT_CHECKPOINT_NAME)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(
            self.checkpoint_interval_secs
                .unwrap_or(DEFAULT_CHECKPOINT_INTERVAL_SECS),
        )
    }

    pub fn block_page_size(&self) -> usize {
        self.block_page_size
            .unwrap_or(DEFAULT_BLOCK_PAGE_SIZE)
            .max(1)
    }

    pub fn colored_cache_size_bytes(&self) -> u64 {
        (self.colored_cache_size.unwrap_or(256.0) * 1024.0 * 1024.0) as u64
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct NodeConfig {
    pub p2p_address: String,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet4,
    Regtest,
}

const TESTNET4_GENESIS: &str = "0100000000000000000000000000000000000000000000000000000000000000000000004e7b2b9128fe0291db0693af2ae418b767e657cd407e80cb1434221eaea7a07a046f3566ffff001dbb0c78170101000000010000000000000000000000000000000000000000000000000000000000000000ffffffff5504ffff001d01044c4c30332f4d61792f323032342030303030303030303030303030303030303030303165626435386332343439373062336161396437383362623030313031316662653865613865393865303065ffffffff0100f2052a010000002321000000000000000000000000000000000000000000000000000000000000000000ac00000000";

impl Network {
    pub fn genesis_block(&self) -> Result<Block, Error> {
        match self {
            Self::Mainnet => Ok(bitcoin::constants::genesis_block(
                bitcoin::Network::Bitcoin,
            )),
            Self::Testnet4 => {
                let raw = hex::decode(TESTNET4_GENESIS)
                    .map_err(|e| Error::Custom(format!("testnet4 genesis: {e}")))?;

                Block::consensus_decode_from_finite_reader(&mut &raw[..])
                    .map_err(|e| Error::Custom(format!("testnet4 genesis: {e}")))
            }
            Self::Regtest => Ok(bitcoin::constants::genesis_block(
                bitcoin::Network::Regtest,
            )),
        }
    }

    pub fn magic(&self) -> Magic {
        match self {
            Self::Mainnet => bitcoin::Network::Bitcoin.magic(),
            Self::Testnet4 => Magic::from_bytes([0x1c, 0x16, 0x3f, 0x28]),
            Self::Regtest => bitcoin::Network::Regtest.magic(),
        }
    }

    /// Network addresses are parsed against
    pub fn address_network(&self) -> bitcoin::Network {
        match self {
            Self::Mainnet => bitcoin::Network::Bitcoin,
            Self::Testnet4 => bitcoin::Network::Testnet,
            Self::Regtest => bitcoin::Network::Regtest,
        }
    }
}
