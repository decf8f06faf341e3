use std::collections::HashMap;

use async_trait::async_trait;
use bitcoin::Txid;
use mini_moka::sync::Cache;
use tokio::sync::RwLock;
use tracing::trace;

use crate::{
    define_table,
    error::Error,
    ledger::repository::TransactionRepository,
    storage::{encdec::Encode, kv_store::StorageHandler, table::LedgerTable},
};

use super::ColoredTransaction;

define_table! {
    name: ColoredTransactionByIdKV,
    key_type: Txid,
    value_type: ColoredTransaction,
    table: LedgerTable::ColoredTransactionById
}

/// Colored data lookup, backed by a transaction repository used to compute missing data
#[async_trait]
pub trait ColoredTransactionRepository: Send + Sync {
    fn transactions(&self) -> &dyn TransactionRepository;

    async fn get_colored(&self, txid: &Txid) -> Result<Option<ColoredTransaction>, Error>;

    async fn put_colored(&self, txid: Txid, colored: ColoredTransaction) -> Result<(), Error>;
}

pub struct InMemoryColoredRepository<T> {
    transactions: T,
    colored: RwLock<HashMap<Txid, ColoredTransaction>>,
}

impl<T: TransactionRepository> InMemoryColoredRepository<T> {
    pub fn new(transactions: T) -> Self {
        Self {
            transactions,
            colored: Default::default(),
        }
    }
}

#[async_trait]
impl<T: TransactionRepository> ColoredTransactionRepository for InMemoryColoredRepository<T> {
    fn transactions(&self) -> &dyn TransactionRepository {
        &self.transactions
    }

    async fn get_colored(&self, txid: &Txid) -> Result<Option<ColoredTransaction>, Error> {
        Ok(self.colored.read().await.get(txid).cloned())
    }

    async fn put_colored(&self, txid: Txid, colored: ColoredTransaction) -> Result<(), Error> {
        self.colored.write().await.insert(txid, colored);

        Ok(())
    }
}

/// Colored data persisted in the ledger database, with a bounded in-memory cache in front
pub struct CachedColoredRepository<T> {
    transactions: T,
    storage: StorageHandler,
    cache: Cache<Txid, ColoredTransaction>,
}

impl<T: TransactionRepository> CachedColoredRepository<T> {
    pub fn new(transactions: T, storage: StorageHandler, max_size_bytes: u64) -> Self {
        Self {
            transactions,
            storage,
            cache: Cache::builder()
                .weigher(|_txid: &Txid, value: &ColoredTransaction| -> u32 {
                    (value.encode().len() as u32).saturating_add(32)
                })
                .max_capacity(max_size_bytes)
                .build(),
        }
    }

    pub fn log(&self) -> String {
        format!(
            "entries={} weight={}",
            self.cache.entry_count(),
            self.cache.weighted_size(),
        )
    }
}

#[async_trait]
impl<T: TransactionRepository> ColoredTransactionRepository for CachedColoredRepository<T> {
    fn transactions(&self) -> &dyn TransactionRepository {
        &self.transactions
    }

    async fn get_colored(&self, txid: &Txid) -> Result<Option<ColoredTransaction>, Error> {
        if let Some(colored) = self.cache.get(txid) {
            trace!(%txid, "colored cache hit");
            return Ok(Some(colored));
        }

        let stored = self
            .storage
            .reader()
            .get::<ColoredTransactionByIdKV>(txid)?;

        if let Some(colored) = &stored {
            self.cache.insert(*txid, colored.clone());
        }

        Ok(stored)
    }

    async fn put_colored(&self, txid: Txid, colored: ColoredTransaction) -> Result<(), Error> {
        let mut task = self.storage.begin_task();
        task.set::<ColoredTransactionByIdKV>(&txid, &colored)?;
        task.commit()?;

        self.cache.insert(txid, colored);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        colored::{AssetId, AssetMoney, ColoredEntry},
        ledger::repository::InMemoryTransactionRepository,
        test_utils::{coinbase_tx, p2pkh_script, temp_storage},
    };

    #[tokio::test]
    async fn cached_repository_survives_cache_loss() {
        let (_dir, storage) = temp_storage();
        let txid = coinbase_tx(vec![(p2pkh_script(1), 1)]).compute_txid();

        let colored = ColoredTransaction {
            issuances: vec![ColoredEntry {
                index: 0,
                asset: AssetMoney {
                    asset_id: AssetId([9; 20]),
                    quantity: 100,
                },
            }],
            ..Default::default()
        };

        let repo = CachedColoredRepository::new(
            InMemoryTransactionRepository::new(),
            storage.clone(),
            1024 * 1024,
        );
        repo.put_colored(txid, colored.clone()).await.unwrap();

        // fresh cache over the same storage
        let reopened =
            CachedColoredRepository::new(InMemoryTransactionRepository::new(), storage, 1024);

        assert_eq!(reopened.get_colored(&txid).await.unwrap(), Some(colored));
    }
}
