use std::sync::OnceLock;

use bitcoin::{BlockHash, OutPoint, Script, ScriptBuf, SignedAmount, Txid};
use chrono::{DateTime, Utc};

use crate::{
    colored::ColoredBalanceChangeEntry,
    sync::{BlockHeight, Point},
};

use super::{
    BalanceId, BalanceLocator, CoinCollection, MatchLocation, MatchedRule, Resolution, WalletRule,
};

/// Height reported by records not yet in a block
pub const UNCONFIRMED_HEIGHT: BlockHeight = BlockHeight::MAX;

/// Everything a single transaction changed for one balance id.
///
/// Script-level records are produced by extraction, one per script touched by the transaction.
/// Wallet-level records are only ever produced by merging script-level records into them.
#[derive(Debug, Clone)]
pub struct OrderedBalanceChange {
    pub(super) balance_id: BalanceId,
    pub(super) point: Option<Point>,
    pub(super) tx_id: Txid,
    pub(super) seen: DateTime<Utc>,
    pub(super) is_coinbase: bool,
    pub(super) has_op_return: bool,
    /// Parallel to `spent_indices`
    pub(super) spent_outpoints: Vec<OutPoint>,
    pub(super) spent_indices: Vec<u32>,
    pub(super) received_coins: CoinCollection,
    pub(super) spent_coins: Resolution<CoinCollection>,
    pub(super) matched_rules: Vec<MatchedRule>,
    pub(super) colored: Resolution<ColoredBalanceChangeEntry>,
    pub(super) custom_data: Option<String>,
    /// Script carried with the record when the balance id cannot hold it
    pub(super) script: Option<ScriptBuf>,
    pub(super) amount: OnceLock<Option<SignedAmount>>,
}

impl PartialEq for OrderedBalanceChange {
    fn eq(&self, other: &Self) -> bool {
        self.balance_id == other.balance_id
            && self.point == other.point
            && self.tx_id == other.tx_id
            && self.seen == other.seen
            && self.is_coinbase == other.is_coinbase
            && self.has_op_return == other.has_op_return
            && self.spent_outpoints == other.spent_outpoints
            && self.spent_indices == other.spent_indices
            && self.received_coins == other.received_coins
            && self.spent_coins == other.spent_coins
            && self.matched_rules == other.matched_rules
            && self.colored == other.colored
            && self.custom_data == other.custom_data
            && self.script == other.script
    }
}

impl Eq for OrderedBalanceChange {}

impl OrderedBalanceChange {
    pub(super) fn new(
        balance_id: BalanceId,
        tx_id: Txid,
        point: Option<Point>,
        seen: DateTime<Utc>,
    ) -> Self {
        Self {
            balance_id,
            point,
            tx_id,
            seen,
            is_coinbase: false,
            has_op_return: false,
            spent_outpoints: vec![],
            spent_indices: vec![],
            received_coins: CoinCollection::new(),
            spent_coins: Resolution::Unresolved,
            matched_rules: vec![],
            colored: Resolution::Unresolved,
            custom_data: None,
            script: None,
            amount: OnceLock::new(),
        }
    }

    /// Empty script-level record, the script is only carried when too large for the id
    pub(super) fn for_script(
        script: &Script,
        tx_id: Txid,
        point: Option<Point>,
        seen: DateTime<Utc>,
    ) -> Self {
        let mut change = Self::new(BalanceId::from_script(script), tx_id, point, seen);

        if BalanceId::is_oversized(script) {
            change.script = Some(script.to_owned());
        }

        change
    }

    /// Empty wallet-level accumulator positioned like `source`
    pub(super) fn for_wallet(wallet_id: &str, source: &OrderedBalanceChange) -> Self {
        let mut change = Self::new(
            BalanceId::from_wallet(wallet_id),
            source.tx_id,
            source.point,
            source.seen,
        );

        change.is_coinbase = source.is_coinbase;
        change.has_op_return = source.has_op_return;
        change.script = source.script_pubkey().map(Script::to_owned);

        change
    }

    pub fn balance_id(&self) -> &BalanceId {
        &self.balance_id
    }

    pub fn tx_id(&self) -> Txid {
        self.tx_id
    }

    /// Block height, [`UNCONFIRMED_HEIGHT`] when not in a block
    pub fn height(&self) -> BlockHeight {
        self.point.map(|p| p.height).unwrap_or(UNCONFIRMED_HEIGHT)
    }

    pub fn block_id(&self) -> Option<BlockHash> {
        self.point.map(|p| p.hash)
    }

    pub fn point(&self) -> Option<Point> {
        self.point
    }

    pub fn is_mempool_entry(&self) -> bool {
        self.point.is_none()
    }

    pub fn seen(&self) -> DateTime<Utc> {
        self.seen
    }

    pub fn is_coinbase(&self) -> bool {
        self.is_coinbase
    }

    pub fn has_op_return(&self) -> bool {
        self.has_op_return
    }

    pub fn spent_outpoints(&self) -> &[OutPoint] {
        &self.spent_outpoints
    }

    pub fn spent_indices(&self) -> &[u32] {
        &self.spent_indices
    }

    pub fn received_coins(&self) -> &CoinCollection {
        &self.received_coins
    }

    pub fn spent_coins(&self) -> &Resolution<CoinCollection> {
        &self.spent_coins
    }

    pub fn matched_rules(&self) -> &[MatchedRule] {
        &self.matched_rules
    }

    pub fn colored(&self) -> &Resolution<ColoredBalanceChangeEntry> {
        &self.colored
    }

    pub fn custom_data(&self) -> Option<&str> {
        self.custom_data.as_deref()
    }

    /// The script this record tracks, either carried or recovered from the balance id
    pub fn script_pubkey(&self) -> Option<&Script> {
        self.script.as_deref().or_else(|| self.balance_id.script())
    }

    pub fn locator(&self) -> BalanceLocator {
        match self.point {
            Some(point) => BalanceLocator::Confirmed {
                height: point.height,
                block_id: point.hash,
                tx_id: self.tx_id,
            },
            None => BalanceLocator::Unconfirmed {
                seen: self.seen,
                tx_id: self.tx_id,
            },
        }
    }

    pub fn partition_key(&self) -> String {
        self.balance_id.partition_key()
    }

    pub fn row_key(&self) -> String {
        format!("{}-{}", self.balance_id, self.locator())
    }

    /// Received minus spent value, only known once spent coins are resolved
    pub fn amount(&self) -> Option<SignedAmount> {
        *self.amount.get_or_init(|| {
            let spent = self.spent_coins.resolved()?.total().to_sat();
            let received = self.received_coins.total().to_sat();

            let net = i64::try_from(received).ok()? - i64::try_from(spent).ok()?;

            Some(SignedAmount::from_sat(net))
        })
    }

    pub(super) fn invalidate_amount(&mut self) {
        self.amount = OnceLock::new();
    }

    pub fn matched_rules_for(
        &self,
        index: u32,
        location: MatchLocation,
    ) -> impl Iterator<Item = &WalletRule> {
        self.matched_rules
            .iter()
            .filter(move |m| m.index == index && m.location == location)
            .map(|m| &m.rule)
    }

    /// Rules that matched the coin at `outpoint`, whether received or spent by this record
    pub fn matched_rules_for_outpoint(&self, outpoint: &OutPoint) -> Vec<&WalletRule> {
        if outpoint.txid == self.tx_id && self.received_coins.contains(outpoint) {
            return self
                .matched_rules_for(outpoint.vout, MatchLocation::Output)
                .collect();
        }

        self.spent_outpoints
            .iter()
            .zip(&self.spent_indices)
            .filter(|(spent, _)| *spent == outpoint)
            .flat_map(|(_, index)| self.matched_rules_for(*index, MatchLocation::Input))
            .collect()
    }

    /// Fold a script-level record into this wallet-level one, attributing its coins to `rule`
    pub fn merge(&mut self, other: &OrderedBalanceChange, rule: &WalletRule) {
        for coin in other.received_coins.iter() {
            self.received_coins.insert(coin.clone());

            self.matched_rules.push(MatchedRule {
                index: coin.outpoint.vout,
                location: MatchLocation::Output,
                rule: rule.clone(),
            });
        }

        if !other.spent_indices.is_empty() {
            for (outpoint, index) in other.spent_outpoints.iter().zip(&other.spent_indices) {
                let present = self
                    .spent_outpoints
                    .iter()
                    .zip(&self.spent_indices)
                    .any(|(o, i)| o == outpoint && i == index);

                if !present {
                    self.spent_outpoints.push(*outpoint);
                    self.spent_indices.push(*index);
                }

                self.matched_rules.push(MatchedRule {
                    index: *index,
                    location: MatchLocation::Input,
                    rule: rule.clone(),
                });
            }

            self.spent_coins = Resolution::Unresolved;
            self.colored = Resolution::Unresolved;
        }

        if self.custom_data.is_none() {
            self.custom_data = rule.custom_data.clone();
        }

        self.invalidate_amount();
    }

    /// Attach the redeem scripts known by matched rules to the coins they matched
    pub fn add_redeem_info(&mut self) {
        for matched in &self.matched_rules {
            let Some(redeem_script) = &matched.rule.redeem_script else {
                continue;
            };

            let coin = match matched.location {
                MatchLocation::Output => self
                    .received_coins
                    .get_mut(&OutPoint::new(self.tx_id, matched.index)),
                MatchLocation::Input => {
                    let Some(position) = self.spent_indices.iter().position(|i| *i == matched.index)
                    else {
                        continue;
                    };

                    let outpoint = self.spent_outpoints[position];

                    self.spent_coins
                        .resolved_mut()
                        .and_then(|coins| coins.get_mut(&outpoint))
                }
            };

            if let Some(coin) = coin {
                coin.redeem_script = Some(redeem_script.clone());
            }
        }
    }
}
