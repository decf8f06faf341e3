use std::{collections::VecDeque, sync::Arc, time::Duration};

use bitcoin::block::Header;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::Error;

use super::{
    BlockHeight, BlockInfo, Config, Point,
    chain::HeaderChain,
    checkpoint::Checkpoint,
    node::Node,
    progress::{ProgressSink, RollingProgress},
};

#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub from_height: BlockHeight,
    /// Inclusive, defaults to the chain tip when the pass starts
    pub to_height: Option<BlockHeight>,
    pub disable_saving: bool,
    pub checkpoint_interval: Duration,
    pub block_page_size: usize,
}

impl FetcherOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            from_height: config.from_height,
            to_height: config.to_height,
            disable_saving: config.disable_saving,
            checkpoint_interval: config.checkpoint_interval(),
            block_page_size: config.block_page_size(),
        }
    }
}

/// Heights still to emit, fixed on the first call to `next`
#[derive(Debug, Clone, Copy)]
struct Window {
    next: BlockHeight,
    end: BlockHeight,
}

/// Single forward pass over the blocks of the local header chain, starting after the checkpoint
pub struct BlockFetcher<N, C, K>
where
    N: Node,
    C: HeaderChain + ?Sized,
    K: Checkpoint,
{
    node: Option<N>,
    chain: Arc<C>,
    checkpoint: K,
    options: FetcherOptions,
    progress: Box<dyn ProgressSink>,

    window: Option<Window>,
    page: VecDeque<BlockInfo>,

    last_processed: Option<(BlockHeight, Header)>,
    last_saved: Instant,
}

impl<N, C, K> BlockFetcher<N, C, K>
where
    N: Node,
    C: HeaderChain + ?Sized,
    K: Checkpoint,
{
    pub fn new(node: N, chain: Arc<C>, checkpoint: K, options: FetcherOptions) -> Self {
        Self {
            node: Some(node),
            chain,
            checkpoint,
            options,
            progress: Box::new(RollingProgress::new()),
            window: None,
            page: VecDeque::new(),
            last_processed: None,
            last_saved: Instant::now(),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn checkpoint(&self) -> &K {
        &self.checkpoint
    }

    /// Position of the last block handed out
    pub fn last_processed(&self) -> Option<Point> {
        self.last_processed.map(|(height, header)| Point {
            height,
            hash: header.block_hash(),
        })
    }

    fn start(&self) -> Window {
        let locator = if self.options.disable_saving {
            vec![self.checkpoint.genesis()]
        } else {
            self.checkpoint.locator().to_vec()
        };

        let fork = self.chain.find_fork(&locator);
        let tip = self.chain.tip();

        let first = (fork.height + 1).max(self.options.from_height);

        let end = self
            .options
            .to_height
            .map_or(tip.height, |to| to.min(tip.height));

        // a pass whose first block is height 1 after a genesis fork also delivers genesis
        let next = if first == 1 && fork.height == 0 && first <= end {
            0
        } else {
            first
        };

        info!(
            checkpoint = self.checkpoint.name(),
            %fork,
            from = next,
            to = end,
            "starting block fetch"
        );

        Window { next, end }
    }

    async fn fetch_page(&mut self, window: &mut Window) -> Result<(), Error> {
        let last = window
            .end
            .min(window.next + self.options.block_page_size as BlockHeight - 1);

        let count = (last - window.next + 1) as usize;
        let mut headers = Vec::with_capacity(count);

        if window.next == 0 {
            let genesis = self
                .chain
                .header_at(0)
                .ok_or_else(|| Error::fetch("no genesis header"))?;
            headers.push((0, genesis));
        }

        headers.extend(
            self.chain
                .headers_after(window.next.saturating_sub(1), count - headers.len()),
        );

        if headers.len() != count {
            return Err(Error::fetch(format!(
                "header chain ends before height {last}"
            )));
        }

        let node = self
            .node
            .as_mut()
            .ok_or_else(|| Error::fetch("block fetcher already disposed"))?;

        let hashes = headers.iter().map(|(_, h)| h.block_hash()).collect::<Vec<_>>();
        let blocks = node.get_blocks(hashes).await?;

        if blocks.len() != headers.len() {
            return Err(Error::fetch(format!(
                "requested {} blocks, node delivered {}",
                headers.len(),
                blocks.len()
            )));
        }

        for ((height, header), block) in headers.into_iter().zip(blocks) {
            let block_id = header.block_hash();

            if block.block_hash() != block_id {
                return Err(Error::fetch(format!(
                    "expected block {block_id} at height {height}, got {}",
                    block.block_hash()
                )));
            }

            self.page.push_back(BlockInfo {
                height,
                block_id,
                block,
            });
        }

        debug!(from = window.next, to = last, "fetched blocks");

        window.next = last + 1;

        Ok(())
    }

    /// Next block in height order, `None` once the window is exhausted
    pub async fn next(&mut self) -> Result<Option<BlockInfo>, Error> {
        let mut window = match self.window {
            Some(window) => window,
            None => self.start(),
        };

        if self.page.is_empty() && window.next <= window.end {
            let fetched = self.fetch_page(&mut window).await;
            self.window = Some(window);
            fetched?;
        } else {
            self.window = Some(window);
        }

        let Some(info) = self.page.pop_front() else {
            return Ok(None);
        };

        // the local chain decides which header a height stands for
        let header = self
            .chain
            .header_at(info.height)
            .filter(|h| h.block_hash() == info.block_id)
            .ok_or_else(|| Error::fetch(format!("header chain changed under {}", info.point())))?;

        self.last_processed = Some((info.height, header));
        self.progress.report(info.height, window.end);

        Ok(Some(info))
    }

    /// Save the last processed position if the checkpoint interval has elapsed
    pub fn save_checkpoint(&mut self) -> Result<bool, Error> {
        if self.last_saved.elapsed() < self.options.checkpoint_interval {
            return Ok(false);
        }

        self.force_save_checkpoint()
    }

    /// Save the last processed position regardless of the interval
    pub fn force_save_checkpoint(&mut self) -> Result<bool, Error> {
        if self.options.disable_saving {
            return Ok(false);
        }

        let Some((height, header)) = self.last_processed else {
            return Ok(false);
        };

        let locator = self.chain.locator(height);
        self.checkpoint.save_progress(&header, locator)?;
        self.last_saved = Instant::now();

        info!(
            checkpoint = self.checkpoint.name(),
            height,
            hash = %header.block_hash(),
            "saved checkpoint"
        );

        Ok(true)
    }

    /// Hand back the node for a later pass, leaving the fetcher unusable
    pub fn take_node(&mut self) -> Option<N> {
        self.node.take()
    }

    /// Disconnect from the node
    pub fn dispose(&mut self) {
        if let Some(mut node) = self.node.take() {
            node.disconnect();
        }
    }
}

impl<N, C, K> Drop for BlockFetcher<N, C, K>
where
    N: Node,
    C: HeaderChain + ?Sized,
    K: Checkpoint,
{
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sync::{chain::LocalChain, checkpoint::InMemoryCheckpoint, progress::NoProgress},
        test_utils::{MockNode, block_chain},
    };

    fn options() -> FetcherOptions {
        FetcherOptions {
            from_height: 0,
            to_height: None,
            disable_saving: false,
            checkpoint_interval: Duration::from_secs(15 * 60),
            block_page_size: 3,
        }
    }

    fn setup(len: usize) -> (Vec<bitcoin::Block>, Arc<LocalChain>, MockNode) {
        let blocks = block_chain(len);
        let headers = blocks.iter().map(|b| b.header).collect::<Vec<_>>();

        let chain = LocalChain::new(headers[0]);
        chain.connect(&headers[1..]).unwrap();

        let node = MockNode::new(headers, blocks.clone());

        (blocks, Arc::new(chain), node)
    }

    async fn drain<N: Node, K: Checkpoint>(
        fetcher: &mut BlockFetcher<N, LocalChain, K>,
    ) -> Vec<BlockHeight> {
        let mut heights = vec![];

        while let Some(info) = fetcher.next().await.unwrap() {
            heights.push(info.height);
        }

        heights
    }

    #[tokio::test]
    async fn fresh_checkpoint_starts_at_genesis() {
        let (blocks, chain, node) = setup(8);
        let checkpoint = InMemoryCheckpoint::new("default", blocks[0].block_hash());

        let mut fetcher = BlockFetcher::new(node, chain, checkpoint, options())
            .with_progress(Box::new(NoProgress));

        let first = fetcher.next().await.unwrap().unwrap();

        assert_eq!(first.height, 0);
        assert_eq!(first.block_id, blocks[0].block_hash());
        assert_eq!(drain(&mut fetcher).await, (1..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn resumes_after_the_checkpoint() {
        let (blocks, chain, node) = setup(10);
        let genesis = blocks[0].block_hash();

        let mut checkpoint = InMemoryCheckpoint::new("default", genesis);
        checkpoint
            .save_progress(&blocks[4].header, chain.locator(4))
            .unwrap();

        let mut fetcher = BlockFetcher::new(node, chain, checkpoint, options())
            .with_progress(Box::new(NoProgress));

        assert_eq!(drain(&mut fetcher).await, vec![5, 6, 7, 8, 9]);
        assert_eq!(fetcher.last_processed().unwrap().hash, blocks[9].block_hash());

        // exhausted passes stay exhausted
        assert!(fetcher.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn window_bounds_are_inclusive() {
        let (blocks, chain, node) = setup(10);
        let checkpoint = InMemoryCheckpoint::new("default", blocks[0].block_hash());

        let options = FetcherOptions {
            from_height: 3,
            to_height: Some(6),
            disable_saving: true,
            ..options()
        };

        let mut fetcher = BlockFetcher::new(node, chain, checkpoint, options)
            .with_progress(Box::new(NoProgress));

        assert_eq!(drain(&mut fetcher).await, vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn genesis_is_delivered_once_the_chain_grows() {
        let blocks = block_chain(3);
        let headers = blocks.iter().map(|b| b.header).collect::<Vec<_>>();
        let genesis = blocks[0].block_hash();

        let chain = Arc::new(LocalChain::new(headers[0]));

        let node = MockNode::new(headers.clone(), blocks.clone());
        let mut fetcher = BlockFetcher::new(
            node,
            chain.clone(),
            InMemoryCheckpoint::new("default", genesis),
            options(),
        )
        .with_progress(Box::new(NoProgress));

        // a chain of only genesis has nothing to deliver yet
        assert!(drain(&mut fetcher).await.is_empty());
        assert!(!fetcher.force_save_checkpoint().unwrap());
        assert_eq!(fetcher.checkpoint().locator(), &[genesis]);

        chain.connect(&headers[1..]).unwrap();

        let node = MockNode::new(headers, blocks);
        let mut fetcher = BlockFetcher::new(
            node,
            chain,
            InMemoryCheckpoint::new("default", genesis),
            options(),
        )
        .with_progress(Box::new(NoProgress));

        assert_eq!(drain(&mut fetcher).await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn starting_at_height_one_includes_genesis() {
        let (blocks, chain, node) = setup(4);
        let checkpoint = InMemoryCheckpoint::new("default", blocks[0].block_hash());

        let options = FetcherOptions {
            from_height: 1,
            ..options()
        };

        let mut fetcher = BlockFetcher::new(node, chain, checkpoint, options)
            .with_progress(Box::new(NoProgress));

        assert_eq!(drain(&mut fetcher).await, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn later_start_heights_skip_genesis() {
        let (blocks, chain, node) = setup(5);
        let checkpoint = InMemoryCheckpoint::new("default", blocks[0].block_hash());

        let options = FetcherOptions {
            from_height: 2,
            ..options()
        };

        let mut fetcher = BlockFetcher::new(node, chain, checkpoint, options)
            .with_progress(Box::new(NoProgress));

        assert_eq!(drain(&mut fetcher).await, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn missing_blocks_fail_the_pass() {
        let (blocks, chain, _) = setup(5);
        let headers = blocks.iter().map(|b| b.header).collect::<Vec<_>>();

        // node knows the headers but only some of the blocks
        let node = MockNode::new(headers, blocks[..2].to_vec());
        let checkpoint = InMemoryCheckpoint::new("default", blocks[0].block_hash());

        let mut fetcher = BlockFetcher::new(node, chain, checkpoint, options())
            .with_progress(Box::new(NoProgress));

        assert!(matches!(fetcher.next().await, Err(Error::Fetch(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoint_is_saved_once_the_interval_elapses() {
        let (blocks, chain, node) = setup(4);
        let genesis = blocks[0].block_hash();
        let checkpoint = InMemoryCheckpoint::new("default", genesis);

        let mut fetcher = BlockFetcher::new(node, chain, checkpoint, options())
            .with_progress(Box::new(NoProgress));

        tokio::time::advance(Duration::from_secs(20 * 60)).await;

        // nothing processed yet
        assert!(!fetcher.save_checkpoint().unwrap());

        fetcher.next().await.unwrap();
        fetcher.next().await.unwrap();

        assert!(fetcher.save_checkpoint().unwrap());
        assert_eq!(fetcher.checkpoint().locator()[0], blocks[1].block_hash());

        fetcher.next().await.unwrap();

        // interval restarts at every save
        assert!(!fetcher.save_checkpoint().unwrap());

        tokio::time::advance(Duration::from_secs(15 * 60)).await;

        assert!(fetcher.save_checkpoint().unwrap());
        assert_eq!(
            fetcher.checkpoint().locator(),
            &[blocks[2].block_hash(), blocks[1].block_hash(), genesis]
        );
    }

    #[tokio::test]
    async fn saving_can_be_disabled() {
        let (blocks, chain, node) = setup(3);
        let checkpoint = InMemoryCheckpoint::new("default", blocks[0].block_hash());

        let options = FetcherOptions {
            disable_saving: true,
            ..options()
        };

        let mut fetcher = BlockFetcher::new(node, chain, checkpoint, options)
            .with_progress(Box::new(NoProgress));

        fetcher.next().await.unwrap();

        assert!(!fetcher.force_save_checkpoint().unwrap());
        assert_eq!(fetcher.checkpoint().locator(), &[blocks[0].block_hash()]);
    }

    #[tokio::test]
    async fn disposal_disconnects_once() {
        let (blocks, chain, node) = setup(3);
        let disconnects = node.disconnects();
        let checkpoint = InMemoryCheckpoint::new("default", blocks[0].block_hash());

        let mut fetcher = BlockFetcher::new(node, chain, checkpoint, options())
            .with_progress(Box::new(NoProgress));

        fetcher.dispose();
        fetcher.dispose();
        drop(fetcher);

        assert_eq!(disconnects.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn taken_node_is_not_disconnected() {
        let (blocks, chain, node) = setup(3);
        let disconnects = node.disconnects();
        let checkpoint = InMemoryCheckpoint::new("default", blocks[0].block_hash());

        let mut fetcher = BlockFetcher::new(node, chain, checkpoint, options())
            .with_progress(Box::new(NoProgress));

        let node = fetcher.take_node();
        drop(fetcher);

        assert!(node.is_some());
        assert_eq!(disconnects.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
