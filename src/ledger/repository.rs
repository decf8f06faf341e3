use std::collections::HashMap;

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use tokio::sync::RwLock;

use crate::{
    define_table,
    error::Error,
    storage::{
        entity::{EntityKey, EntityProperties, EntityRow},
        kv_store::{StorageHandler, WriteTask},
        table::{LedgerTable, Table},
    },
};

use super::{BalanceId, OrderedBalanceChange};

define_table! {
    name: TransactionByIdKV,
    key_type: Txid,
    value_type: Transaction,
    table: LedgerTable::TransactionById
}

define_table! {
    name: ScriptBalancesKV,
    key_type: EntityKey,
    value_type: EntityProperties,
    table: LedgerTable::ScriptBalances
}

define_table! {
    name: WalletBalancesKV,
    key_type: EntityKey,
    value_type: EntityProperties,
    table: LedgerTable::WalletBalances
}

/// Lookup of previously seen transactions
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    async fn get(&self, txid: &Txid) -> Result<Option<Transaction>, Error>;

    async fn put(&self, txid: Txid, tx: Transaction) -> Result<(), Error>;

    /// Results are in the order of `txids`
    async fn get_many(&self, txids: &[Txid]) -> Result<Vec<Option<Transaction>>, Error> {
        let mut out = Vec::with_capacity(txids.len());

        for txid in txids {
            out.push(self.get(txid).await?);
        }

        Ok(out)
    }
}

#[derive(Default)]
pub struct InMemoryTransactionRepository {
    transactions: RwLock<HashMap<Txid, Transaction>>,
}

impl InMemoryTransactionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionRepository for InMemoryTransactionRepository {
    async fn get(&self, txid: &Txid) -> Result<Option<Transaction>, Error> {
        Ok(self.transactions.read().await.get(txid).cloned())
    }

    async fn put(&self, txid: Txid, tx: Transaction) -> Result<(), Error> {
        self.transactions.write().await.insert(txid, tx);

        Ok(())
    }
}

/// Transactions persisted in the ledger database
#[derive(Clone)]
pub struct StoredTransactionRepository {
    storage: StorageHandler,
}

impl StoredTransactionRepository {
    pub fn new(storage: StorageHandler) -> Self {
        Self { storage }
    }

    /// Stage a block's transactions into an open write task
    pub fn stage(task: &mut WriteTask, txs: &[(Txid, Transaction)]) -> Result<(), Error> {
        for (txid, tx) in txs {
            task.set::<TransactionByIdKV>(txid, tx)?;
        }

        Ok(())
    }
}

#[async_trait]
impl TransactionRepository for StoredTransactionRepository {
    async fn get(&self, txid: &Txid) -> Result<Option<Transaction>, Error> {
        self.storage.reader().get::<TransactionByIdKV>(txid)
    }

    async fn put(&self, txid: Txid, tx: Transaction) -> Result<(), Error> {
        let mut task = self.storage.begin_task();
        task.set::<TransactionByIdKV>(&txid, &tx)?;
        task.commit()
    }

    async fn get_many(&self, txids: &[Txid]) -> Result<Vec<Option<Transaction>>, Error> {
        let fetched = self
            .storage
            .reader()
            .multi_get::<TransactionByIdKV>(txids.to_vec())?;

        Ok(fetched.into_iter().map(|(_, tx)| tx).collect())
    }
}

/// Which balances table a record belongs in
fn is_wallet(change: &OrderedBalanceChange) -> bool {
    change.balance_id().wallet_id().is_some()
}

/// Reads and writes balance change rows
#[derive(Clone)]
pub struct BalanceRepository {
    storage: StorageHandler,
}

impl BalanceRepository {
    pub fn new(storage: StorageHandler) -> Self {
        Self { storage }
    }

    pub fn stage(task: &mut WriteTask, change: &OrderedBalanceChange) -> Result<(), Error> {
        let row = change.to_entity();
        let key = row.key();

        if is_wallet(change) {
            task.set::<WalletBalancesKV>(&key, &row.properties)
        } else {
            task.set::<ScriptBalancesKV>(&key, &row.properties)
        }
    }

    pub fn put_all(&self, changes: &[OrderedBalanceChange]) -> Result<(), Error> {
        let mut task = self.storage.begin_task();

        for change in changes {
            Self::stage(&mut task, change)?;
        }

        task.commit()
    }

    /// Every balance change of `balance_id`, in locator order
    pub fn query(&self, balance_id: &BalanceId) -> Result<Vec<OrderedBalanceChange>, Error> {
        if balance_id.wallet_id().is_some() {
            self.query_table::<WalletBalancesKV>(balance_id)
        } else {
            self.query_table::<ScriptBalancesKV>(balance_id)
        }
    }

    fn query_table<T>(&self, balance_id: &BalanceId) -> Result<Vec<OrderedBalanceChange>, Error>
    where
        T: Table<Key = EntityKey, Value = EntityProperties>,
    {
        let prefix = format!("{}{}-", balance_id.partition_key(), balance_id);

        let reader = self.storage.reader();
        let mut changes = vec![];

        for kv in reader.iter_kvs::<T>(T::prefix_range(prefix.as_bytes()), false)? {
            let (key, properties) = kv?;

            changes.push(OrderedBalanceChange::from_entity(&EntityRow::from_parts(
                key, properties,
            ))?);
        }

        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;

    use super::*;
    use crate::test_utils::{coinbase_tx, p2pkh_script};

    #[tokio::test]
    async fn in_memory_get_many_keeps_order() {
        let repo = InMemoryTransactionRepository::new();
        let tx = coinbase_tx(vec![(p2pkh_script(1), 50)]);
        let txid = tx.compute_txid();

        repo.put(txid, tx.clone()).await.unwrap();

        let missing = Txid::all_zeros();
        let got = repo.get_many(&[missing, txid]).await.unwrap();

        assert_eq!(got, vec![None, Some(tx)]);
    }

    #[tokio::test]
    async fn stored_repository_persists_transactions() {
        let (_dir, storage) = crate::test_utils::temp_storage();
        let repo = StoredTransactionRepository::new(storage);

        let tx = coinbase_tx(vec![(p2pkh_script(2), 10)]);
        let txid = tx.compute_txid();

        assert_eq!(repo.get(&txid).await.unwrap(), None);

        repo.put(txid, tx.clone()).await.unwrap();

        assert_eq!(repo.get(&txid).await.unwrap(), Some(tx.clone()));
        assert_eq!(repo.get_many(&[txid]).await.unwrap(), vec![Some(tx)]);
    }
}
