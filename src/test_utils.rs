use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, OutPoint, PublicKey, ScriptBuf, Sequence,
    Transaction, TxIn, TxMerkleNode, TxOut, Txid, Witness,
    absolute::LockTime,
    block::{Header, Version as BlockVersion},
    hashes::{Hash, sha256},
    script::{Builder, PushBytesBuf},
    secp256k1::{Secp256k1, SecretKey},
    transaction::Version,
};
use tempfile::TempDir;

use crate::{error::Error, storage::kv_store::StorageHandler, sync::node::Node};

pub fn temp_storage() -> (TempDir, StorageHandler) {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageHandler::open(dir.path().to_path_buf(), false, 8 * 1024 * 1024).unwrap();

    (dir, storage)
}

/// Deterministic compressed key for `seed`
pub fn public_key(seed: u8) -> PublicKey {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(sha256::Hash::hash(&[seed]).as_byte_array()).unwrap();

    PublicKey::new(secret.public_key(&secp))
}

pub fn p2pkh_script(seed: u8) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&public_key(seed).pubkey_hash())
}

pub fn op_return_script(data: &[u8]) -> ScriptBuf {
    ScriptBuf::new_op_return(PushBytesBuf::try_from(data.to_vec()).unwrap())
}

fn push(bytes: Vec<u8>) -> PushBytesBuf {
    PushBytesBuf::try_from(bytes).unwrap()
}

/// Input spending a P2PKH output of `p2pkh_script(seed)`, signed with a well formed dummy
/// signature
pub fn p2pkh_input(txid: Txid, vout: u32, seed: u8) -> TxIn {
    let mut signature = vec![0x30, 68];
    signature.extend([0x02; 68]);
    signature.push(0x01);

    let script_sig = Builder::new()
        .push_slice(push(signature))
        .push_slice(push(public_key(seed).to_bytes()))
        .into_script();

    TxIn {
        previous_output: OutPoint::new(txid, vout),
        script_sig,
        sequence: Sequence::MAX,
        witness: Witness::new(),
    }
}

fn outputs(outputs: Vec<(ScriptBuf, u64)>) -> Vec<TxOut> {
    outputs
        .into_iter()
        .map(|(script_pubkey, sats)| TxOut {
            value: Amount::from_sat(sats),
            script_pubkey,
        })
        .collect()
}

fn coinbase_with_tag(tag: i64, outs: Vec<(ScriptBuf, u64)>) -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: Builder::new().push_int(tag).push_int(0).into_script(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs(outs),
    }
}

pub fn coinbase_tx(outs: Vec<(ScriptBuf, u64)>) -> Transaction {
    coinbase_with_tag(0, outs)
}

/// Transaction spending `inputs` with empty scriptSigs
pub fn spend_tx(inputs: Vec<(Txid, u32)>, outs: Vec<(ScriptBuf, u64)>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .into_iter()
            .map(|(txid, vout)| TxIn {
                previous_output: OutPoint::new(txid, vout),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs(outs),
    }
}

pub fn header(prev: BlockHash, time: u32) -> Header {
    Header {
        version: BlockVersion::ONE,
        prev_blockhash: prev,
        merkle_root: TxMerkleNode::all_zeros(),
        time,
        bits: CompactTarget::from_consensus(0x207fffff),
        nonce: 0,
    }
}

/// `len` linked blocks with one coinbase each, the first one standing in for genesis
pub fn block_chain(len: usize) -> Vec<Block> {
    let mut prev = BlockHash::all_zeros();
    let mut blocks = Vec::with_capacity(len);

    for height in 0..len {
        let coinbase = coinbase_with_tag(
            height as i64,
            vec![(p2pkh_script(height as u8), 50 * 100_000_000)],
        );

        let mut block = Block {
            header: header(prev, 1_600_000_000 + height as u32 * 600),
            txdata: vec![coinbase],
        };

        if let Some(root) = block.compute_merkle_root() {
            block.header.merkle_root = root;
        }

        prev = block.block_hash();
        blocks.push(block);
    }

    blocks
}

pub fn header_chain(len: usize) -> Vec<Header> {
    block_chain(len).into_iter().map(|b| b.header).collect()
}

/// Node serving a fixed best chain, `headers[0]` being genesis
pub struct MockNode {
    headers: Vec<Header>,
    blocks: HashMap<BlockHash, Block>,
    disconnects: Arc<AtomicUsize>,
}

impl MockNode {
    pub fn new(headers: Vec<Header>, blocks: Vec<Block>) -> Self {
        Self {
            headers,
            blocks: blocks.into_iter().map(|b| (b.block_hash(), b)).collect(),
            disconnects: Default::default(),
        }
    }

    pub fn disconnects(&self) -> Arc<AtomicUsize> {
        self.disconnects.clone()
    }
}

#[async_trait]
impl Node for MockNode {
    async fn get_headers(&mut self, locator: Vec<BlockHash>) -> Result<Vec<Header>, Error> {
        let start = locator
            .iter()
            .find_map(|hash| self.headers.iter().position(|h| h.block_hash() == *hash))
            .map_or(1, |index| index + 1);

        Ok(self.headers.iter().skip(start).take(2_000).copied().collect())
    }

    /// Unknown hashes are left out
    async fn get_blocks(&mut self, hashes: Vec<BlockHash>) -> Result<Vec<Block>, Error> {
        Ok(hashes
            .iter()
            .filter_map(|hash| self.blocks.get(hash).cloned())
            .collect())
    }

    fn disconnect(&mut self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}
