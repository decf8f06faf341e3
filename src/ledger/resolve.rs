use std::collections::HashMap;

use bitcoin::{Transaction, Txid};
use tracing::{debug, trace};

use crate::{
    colored::{ColoredBalanceChangeEntry, ColoredTransactionRepository, fetch_colored},
    error::Error,
};

use super::{Coin, CoinCollection, OrderedBalanceChange, Resolution, repository::TransactionRepository};

impl OrderedBalanceChange {
    /// Ids of the transactions whose outputs this record spends
    pub fn spent_parent_ids(&self) -> Vec<Txid> {
        let mut ids = vec![];

        for outpoint in &self.spent_outpoints {
            if !outpoint.is_null() && !ids.contains(&outpoint.txid) {
                ids.push(outpoint.txid);
            }
        }

        ids
    }

    /// Resolve the coins spent by this record through `repo`.
    ///
    /// `Ok(false)` when a parent transaction is not known yet, the record then stays unresolved,
    /// or when a parent lacks the spent output, the record is then marked unavailable.
    pub async fn ensure_spent_coins<R>(&mut self, repo: &R) -> Result<bool, Error>
    where
        R: TransactionRepository + ?Sized,
    {
        match self.spent_coins {
            Resolution::Resolved(_) => return Ok(true),
            Resolution::Unavailable => return Ok(false),
            Resolution::Unresolved => (),
        }

        let parent_ids = self.spent_parent_ids();
        let parents = repo.get_many(&parent_ids).await?;

        Ok(self.ensure_spent_coins_from(&parent_ids, parents))
    }

    /// Resolve spent coins from parents fetched by the caller, `parents` parallel to `parent_ids`
    pub fn ensure_spent_coins_from(
        &mut self,
        parent_ids: &[Txid],
        parents: Vec<Option<Transaction>>,
    ) -> bool {
        match self.spent_coins {
            Resolution::Resolved(_) => return true,
            Resolution::Unavailable => return false,
            Resolution::Unresolved => (),
        }

        let mut by_id = HashMap::with_capacity(parents.len());

        for (txid, parent) in parent_ids.iter().zip(parents) {
            let Some(parent) = parent else {
                trace!(tx_id = %self.tx_id, parent = %txid, "spent parent not found");
                return false;
            };

            by_id.insert(*txid, parent);
        }

        let mut coins = CoinCollection::new();

        for outpoint in &self.spent_outpoints {
            if outpoint.is_null() {
                continue;
            }

            let Some(parent) = by_id.get(&outpoint.txid) else {
                trace!(tx_id = %self.tx_id, parent = %outpoint.txid, "spent parent not supplied");
                return false;
            };

            let Some(txout) = parent.output.get(outpoint.vout as usize) else {
                debug!(tx_id = %self.tx_id, %outpoint, "spent output does not exist");
                self.spent_coins = Resolution::Unavailable;
                self.invalidate_amount();
                return false;
            };

            coins.insert(Coin::new(*outpoint, txout.clone()));
        }

        self.spent_coins = Resolution::Resolved(coins);
        self.invalidate_amount();
        self.add_redeem_info();

        true
    }

    /// Annotate the record with the assets it moved.
    ///
    /// `Ok(false)` when the transaction is unknown to `repo` or cannot be colored.
    pub async fn ensure_colored<R>(&mut self, repo: &R) -> Result<bool, Error>
    where
        R: ColoredTransactionRepository + ?Sized,
    {
        match self.colored {
            Resolution::Resolved(_) => return Ok(true),
            Resolution::Unavailable => return Ok(false),
            Resolution::Unresolved => (),
        }

        if repo.transactions().get(&self.tx_id).await?.is_none() {
            return Ok(false);
        }

        let colored = match fetch_colored(self.tx_id, repo).await {
            Ok(colored) => colored,
            Err(Error::Colored(e)) => {
                debug!(tx_id = %self.tx_id, "not colored: {e}");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let received = self.received_coins.iter().map(|c| c.outpoint.vout);
        let entry = ColoredBalanceChangeEntry::new(colored, &self.spent_indices, received);

        self.colored = Resolution::Resolved(entry);

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{Amount, OutPoint, SignedAmount};

    use super::*;
    use crate::{
        colored::InMemoryColoredRepository,
        ledger::{
            extract::extract_script_balances_for, repository::InMemoryTransactionRepository,
        },
        test_utils::{coinbase_tx, p2pkh_input, p2pkh_script, spend_tx},
    };

    async fn spender_of(
        repo: &InMemoryTransactionRepository,
        vout: u32,
    ) -> (Transaction, OrderedBalanceChange) {
        let parent = coinbase_tx(vec![(p2pkh_script(1), 7_000), (p2pkh_script(1), 3_000)]);
        let parent_id = parent.compute_txid();
        repo.put(parent_id, parent).await.unwrap();

        let mut tx = spend_tx(vec![(parent_id, vout)], vec![(p2pkh_script(2), 6_500)]);
        tx.input[0] = p2pkh_input(parent_id, vout, 1);

        let change = extract_script_balances_for(&tx)
            .into_iter()
            .find(|c| !c.spent_outpoints().is_empty())
            .unwrap();

        (tx, change)
    }

    #[tokio::test]
    async fn resolves_spent_coins_from_parents() {
        let repo = InMemoryTransactionRepository::new();
        let (_, mut change) = spender_of(&repo, 1).await;

        assert!(change.ensure_spent_coins(&repo).await.unwrap());
        assert_eq!(
            change.spent_coins().resolved().unwrap().total(),
            Amount::from_sat(3_000)
        );
        assert_eq!(change.amount(), Some(SignedAmount::from_sat(-3_000)));

        // resolved records short circuit
        assert!(change.ensure_spent_coins(&InMemoryTransactionRepository::new()).await.unwrap());
    }

    #[tokio::test]
    async fn missing_parent_leaves_record_unresolved() {
        let (_, mut change) = spender_of(&InMemoryTransactionRepository::new(), 0).await;

        assert!(!change.ensure_spent_coins(&InMemoryTransactionRepository::new()).await.unwrap());
        assert_eq!(change.spent_coins(), &Resolution::Unresolved);
        assert_eq!(change.amount(), None);
    }

    #[tokio::test]
    async fn missing_output_marks_record_unavailable() {
        let repo = InMemoryTransactionRepository::new();
        let (_, mut change) = spender_of(&repo, 5).await;

        assert!(!change.ensure_spent_coins(&repo).await.unwrap());
        assert_eq!(change.spent_coins(), &Resolution::Unavailable);
        assert!(!change.ensure_spent_coins(&repo).await.unwrap());
    }

    #[tokio::test]
    async fn precomputed_parents_must_all_be_present() {
        let repo = InMemoryTransactionRepository::new();
        let (_, mut change) = spender_of(&repo, 0).await;

        let ids = change.spent_parent_ids();
        assert!(!change.ensure_spent_coins_from(&ids, vec![None]));
        assert_eq!(change.spent_coins(), &Resolution::Unresolved);

        let parents = repo.get_many(&ids).await.unwrap();
        assert!(change.ensure_spent_coins_from(&ids, parents));
    }

    /// Spend of one output from each of two parents paying the same script
    fn two_parent_spend() -> (Transaction, Transaction, OrderedBalanceChange) {
        let first = coinbase_tx(vec![(p2pkh_script(1), 7_000)]);
        let second = coinbase_tx(vec![(p2pkh_script(1), 4_000)]);
        let (first_id, second_id) = (first.compute_txid(), second.compute_txid());

        let mut tx = spend_tx(
            vec![(first_id, 0), (second_id, 0)],
            vec![(p2pkh_script(2), 10_000)],
        );
        tx.input[0] = p2pkh_input(first_id, 0, 1);
        tx.input[1] = p2pkh_input(second_id, 0, 1);

        let change = extract_script_balances_for(&tx)
            .into_iter()
            .find(|c| !c.spent_outpoints().is_empty())
            .unwrap();

        (first, second, change)
    }

    #[tokio::test]
    async fn one_missing_parent_of_several_leaves_record_unresolved() {
        let (first, second, mut change) = two_parent_spend();
        assert_eq!(change.spent_parent_ids().len(), 2);

        let repo = InMemoryTransactionRepository::new();
        repo.put(first.compute_txid(), first).await.unwrap();

        assert!(!change.ensure_spent_coins(&repo).await.unwrap());
        assert_eq!(change.spent_coins(), &Resolution::Unresolved);
        assert_eq!(change.amount(), None);

        repo.put(second.compute_txid(), second).await.unwrap();

        assert!(change.ensure_spent_coins(&repo).await.unwrap());
        assert_eq!(
            change.spent_coins().resolved().unwrap().total(),
            Amount::from_sat(11_000)
        );
    }

    #[test]
    fn one_absent_precomputed_parent_leaves_record_unresolved() {
        let (first, second, mut change) = two_parent_spend();
        let ids = change.spent_parent_ids();

        let parents = ids
            .iter()
            .map(|id| (*id == first.compute_txid()).then(|| first.clone()))
            .collect::<Vec<_>>();
        assert_eq!(parents.iter().filter(|p| p.is_some()).count(), 1);

        assert!(!change.ensure_spent_coins_from(&ids, parents));
        assert_eq!(change.spent_coins(), &Resolution::Unresolved);
        assert_eq!(change.amount(), None);

        let parents = ids
            .iter()
            .map(|id| {
                if *id == first.compute_txid() {
                    Some(first.clone())
                } else {
                    Some(second.clone())
                }
            })
            .collect();

        assert!(change.ensure_spent_coins_from(&ids, parents));
        assert_eq!(change.amount(), Some(SignedAmount::from_sat(-11_000)));
    }

    #[tokio::test]
    async fn null_outpoints_are_skipped() {
        let tx = coinbase_tx(vec![(p2pkh_script(1), 1)]);
        let mut change = extract_script_balances_for(&tx).remove(0);

        change.spent_outpoints.push(OutPoint::null());
        change.spent_indices.push(0);

        assert!(change.ensure_spent_coins(&InMemoryTransactionRepository::new()).await.unwrap());
        assert!(change.spent_coins().resolved().unwrap().is_empty());
    }

    #[tokio::test]
    async fn colored_requires_known_transaction() {
        let transactions = InMemoryTransactionRepository::new();
        let (tx, mut change) = spender_of(&transactions, 0).await;

        let colored = InMemoryColoredRepository::new(transactions);
        assert!(!change.ensure_colored(&colored).await.unwrap());

        colored.transactions().put(tx.compute_txid(), tx).await.unwrap();

        assert!(change.ensure_colored(&colored).await.unwrap());

        let entry = change.colored().resolved().unwrap();
        assert!(!entry.colored.is_colored());
        assert!(entry.balances().is_empty());
    }
}
