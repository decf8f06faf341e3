//! Open Assets coloring of transactions.
//!
//! A colored transaction records which of its inputs carried assets and which of its outputs
//! received (issued or transferred) assets. It is computed on demand from the transaction, its
//! marker output and the colored data of its parents.

use std::fmt;

use bitcoin::Txid;
use indexmap::IndexMap;
use maestro_ledger_macros::{Decode, Encode};
use thiserror::Error;

pub mod compute;
pub mod marker;
pub mod repository;

pub use compute::fetch_colored;
pub use marker::ColorMarker;
pub use repository::{
    CachedColoredRepository, ColoredTransactionByIdKV, ColoredTransactionRepository,
    InMemoryColoredRepository,
};

#[derive(Debug, Error)]
pub enum ColoredError {
    #[error("transaction {0} not found")]
    TransactionNotFound(Txid),

    #[error("transaction {0} could not be colored")]
    Unrecognized(Txid),
}

/// Open Assets asset id, the hash160 of the issuing script
#[derive(Encode, Decode, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(pub [u8; 20]);

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Encode, Decode, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssetMoney {
    pub asset_id: AssetId,
    pub quantity: u64,
}

/// An asset at an input or output index
#[derive(Encode, Decode, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColoredEntry {
    pub index: u32,
    pub asset: AssetMoney,
}

#[derive(Encode, Decode, Clone, Debug, Default, PartialEq, Eq)]
pub struct ColoredTransaction {
    /// Absent for transactions without a valid marker, whose input assets are all destroyed
    pub marker: Option<ColorMarker>,
    pub inputs: Vec<ColoredEntry>,
    pub issuances: Vec<ColoredEntry>,
    pub transfers: Vec<ColoredEntry>,
}

impl ColoredTransaction {
    /// Asset held by output `vout`, if any
    pub fn output_asset(&self, vout: u32) -> Option<AssetMoney> {
        self.issuances
            .iter()
            .chain(self.transfers.iter())
            .find(|e| e.index == vout)
            .map(|e| e.asset)
    }

    pub fn input_asset(&self, index: u32) -> Option<AssetMoney> {
        self.inputs
            .iter()
            .find(|e| e.index == index)
            .map(|e| e.asset)
    }

    pub fn is_colored(&self) -> bool {
        !self.inputs.is_empty() || !self.issuances.is_empty() || !self.transfers.is_empty()
    }
}

/// Assets moved by a single balance change, derived from its transaction's colored data
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColoredBalanceChangeEntry {
    pub colored: ColoredTransaction,
    pub spent_assets: Vec<AssetMoney>,
    pub received_assets: Vec<AssetMoney>,
}

impl ColoredBalanceChangeEntry {
    /// `spent_indices` are the record's input indices, `received` its output indices
    pub fn new(
        colored: ColoredTransaction,
        spent_indices: &[u32],
        received: impl IntoIterator<Item = u32>,
    ) -> Self {
        let spent_assets = spent_indices
            .iter()
            .filter_map(|i| colored.input_asset(*i))
            .collect();

        let received_assets = received
            .into_iter()
            .filter_map(|vout| colored.output_asset(vout))
            .collect();

        Self {
            colored,
            spent_assets,
            received_assets,
        }
    }

    /// Net quantity per asset, received minus spent
    pub fn balances(&self) -> IndexMap<AssetId, i128> {
        let mut balances = IndexMap::new();

        for asset in &self.received_assets {
            *balances.entry(asset.asset_id).or_default() += asset.quantity as i128;
        }

        for asset in &self.spent_assets {
            *balances.entry(asset.asset_id).or_default() -= asset.quantity as i128;
        }

        balances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::encdec::{Decode, Encode};

    fn money(id: u8, quantity: u64) -> AssetMoney {
        AssetMoney {
            asset_id: AssetId([id; 20]),
            quantity,
        }
    }

    fn sample() -> ColoredTransaction {
        ColoredTransaction {
            marker: Some(ColorMarker {
                quantities: vec![5, 3],
                metadata: b"meta".to_vec(),
            }),
            inputs: vec![ColoredEntry {
                index: 0,
                asset: money(1, 8),
            }],
            issuances: vec![],
            transfers: vec![
                ColoredEntry {
                    index: 1,
                    asset: money(1, 5),
                },
                ColoredEntry {
                    index: 2,
                    asset: money(1, 3),
                },
            ],
        }
    }

    #[test]
    fn colored_transaction_bytes_round_trip() {
        let colored = sample();

        assert_eq!(ColoredTransaction::decode_exact(&colored.encode()).unwrap(), colored);
    }

    #[test]
    fn entry_nets_received_against_spent() {
        let entry = ColoredBalanceChangeEntry::new(sample(), &[0], [2]);

        assert_eq!(entry.spent_assets, vec![money(1, 8)]);
        assert_eq!(entry.received_assets, vec![money(1, 3)]);
        assert_eq!(entry.balances()[&AssetId([1; 20])], -5);
    }
}
