use async_trait::async_trait;
use bitcoin::{Block, BlockHash, block::Header};

use crate::error::Error;

use super::peer::Peer;

/// Source of headers and blocks
#[async_trait]
pub trait Node: Send {
    /// Headers following the first hash of `locator` the node knows
    async fn get_headers(&mut self, locator: Vec<BlockHash>) -> Result<Vec<Header>, Error>;

    /// One block per hash, in request order
    async fn get_blocks(&mut self, hashes: Vec<BlockHash>) -> Result<Vec<Block>, Error>;

    /// Release the connection, calling it more than once is a no-op
    fn disconnect(&mut self);
}

#[async_trait]
impl Node for Peer {
    async fn get_headers(&mut self, locator: Vec<BlockHash>) -> Result<Vec<Header>, Error> {
        Ok(self.get_new_headers(locator).await?)
    }

    async fn get_blocks(&mut self, hashes: Vec<BlockHash>) -> Result<Vec<Block>, Error> {
        Ok(Peer::get_blocks(self, hashes).await?)
    }

    fn disconnect(&mut self) {
        Peer::disconnect(self)
    }
}
