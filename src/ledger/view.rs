use serde::Serialize;

use super::{BalanceId, Coin, OrderedBalanceChange};

#[derive(Debug, Clone, Serialize)]
pub struct CoinView {
    /// `txid:vout`
    pub outpoint: String,
    pub value: u64,
    pub script_pubkey: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeem_script: Option<String>,
}

impl From<&Coin> for CoinView {
    fn from(coin: &Coin) -> Self {
        Self {
            outpoint: coin.outpoint.to_string(),
            value: coin.txout.value.to_sat(),
            script_pubkey: coin.txout.script_pubkey.to_hex_string(),
            redeem_script: coin.redeem_script.as_ref().map(|s| s.to_hex_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetAmount {
    pub asset_id: String,
    pub amount: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceChangeView {
    pub tx_id: String,
    /// Absent for unconfirmed transactions
    pub block_hash: Option<String>,
    pub block_height: Option<u64>,
    pub seen: String,
    pub is_coinbase: bool,
    pub has_op_return: bool,
    pub spent_outpoints: Vec<String>,
    pub received: Vec<CoinView>,
    /// Absent until the spent coins are resolved
    pub spent: Option<Vec<CoinView>>,
    /// Net satoshis, absent while spent coins are unresolved
    pub amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assets: Option<Vec<AssetAmount>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<String>,
}

impl From<&OrderedBalanceChange> for BalanceChangeView {
    fn from(change: &OrderedBalanceChange) -> Self {
        let point = change.point();

        Self {
            tx_id: change.tx_id().to_string(),
            block_hash: point.map(|p| p.hash.to_string()),
            block_height: point.map(|p| p.height),
            seen: change.seen().to_rfc3339(),
            is_coinbase: change.is_coinbase(),
            has_op_return: change.has_op_return(),
            spent_outpoints: change
                .spent_outpoints()
                .iter()
                .map(|o| o.to_string())
                .collect(),
            received: change.received_coins().iter().map(CoinView::from).collect(),
            spent: change
                .spent_coins()
                .resolved()
                .map(|coins| coins.iter().map(CoinView::from).collect()),
            amount: change.amount().map(|a| a.to_sat()),
            assets: change.colored().resolved().map(|entry| {
                entry
                    .balances()
                    .into_iter()
                    .map(|(asset_id, amount)| AssetAmount {
                        asset_id: asset_id.to_string(),
                        amount: amount.to_string(),
                    })
                    .collect()
            }),
            custom_data: change.custom_data().map(String::from),
        }
    }
}

/// Every change of a balance with the totals that can be computed from them
#[derive(Debug, Clone, Serialize)]
pub struct BalanceView {
    pub balance_id: String,
    /// Sum of the changes whose amount is known
    pub confirmed: i64,
    pub unconfirmed: i64,
    /// Changes left out of the totals
    pub unresolved: usize,
    pub changes: Vec<BalanceChangeView>,
}

impl BalanceView {
    pub fn new(balance_id: &BalanceId, changes: &[OrderedBalanceChange]) -> Self {
        let mut confirmed = 0;
        let mut unconfirmed = 0;
        let mut unresolved = 0;

        for change in changes {
            match change.amount() {
                Some(amount) if change.is_mempool_entry() => unconfirmed += amount.to_sat(),
                Some(amount) => confirmed += amount.to_sat(),
                None => unresolved += 1,
            }
        }

        Self {
            balance_id: balance_id.to_string(),
            confirmed,
            unconfirmed,
            unresolved,
            changes: changes.iter().map(BalanceChangeView::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ledger::extract_script_balances_for,
        test_utils::{coinbase_tx, p2pkh_script},
    };

    #[test]
    fn unresolved_changes_are_left_out_of_totals() {
        let script = p2pkh_script(1);
        let tx = coinbase_tx(vec![(script.clone(), 5_000)]);

        let mut changes = extract_script_balances_for(&tx);
        assert_eq!(changes.len(), 1);

        let balance_id = changes[0].balance_id().clone();
        let view = BalanceView::new(&balance_id, &changes);

        assert_eq!(view.unresolved, 1);
        assert_eq!(view.unconfirmed, 0);
        assert!(view.changes[0].spent.is_none());
        assert_eq!(view.changes[0].block_height, None);

        changes[0].ensure_spent_coins_from(&[], vec![]);
        let view = BalanceView::new(&balance_id, &changes);

        assert_eq!(view.unresolved, 0);
        assert_eq!(view.unconfirmed, 5_000);
        assert_eq!(view.changes[0].received[0].value, 5_000);

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["changes"][0]["amount"], 5_000);
        assert!(json["changes"][0].get("custom_data").is_none());
    }
}
