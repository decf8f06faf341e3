use std::{collections::HashMap, ops::Range, path::PathBuf, sync::Arc};

use itertools::Itertools;
use rocksdb::{
    Cache, ColumnFamily, ColumnFamilyDescriptor, DB, Options, ReadOptions, SliceTransform,
    WriteBatch,
};
use sysinfo::{Pid, System};
use tracing::{info, trace, warn};

use crate::error::Error;

use super::{
    encdec::{Decode, Encode},
    table::{Table, TableIterator},
};

static LEDGER_CF_NAME: &str = "ledger";

pub type RawKey = Vec<u8>;
pub type RawValue = Vec<u8>;

/// Result type for multi_get: a vector of (key, Option<value>) pairs.
pub type MultiGetResult<K, V> = Vec<(K, Option<V>)>;

pub enum StorageAction {
    Set(RawValue),
    Delete,
}

/// Buffered set of writes which are flushed to storage atomically in a single write batch.
///
/// Reads check the buffer first, so a task observes its own pending writes.
pub struct WriteTask<'a> {
    storage: &'a StorageHandler,
    write_buffer: HashMap<RawKey, StorageAction>,
}

impl WriteTask<'_> {
    pub fn get<T>(&self, key: &T::Key) -> Result<Option<T::Value>, Error>
    where
        T: Table,
    {
        let encoded_key = T::encode_key(key);

        if let Some(action) = self.write_buffer.get(&encoded_key) {
            trace!("fetching {} from writebuf", hex::encode(&encoded_key));

            return match action {
                StorageAction::Set(value) => Ok(Some(T::Value::decode_all(value)?)),
                StorageAction::Delete => Ok(None),
            };
        }

        self.storage.reader().get_raw::<T>(&encoded_key)
    }

    pub fn set<T>(&mut self, key: &T::Key, value: &T::Value) -> Result<(), Error>
    where
        T: Table,
    {
        let encoded_key = T::encode_key(key);

        trace!("setting {}", hex::encode(&encoded_key));

        self.write_buffer
            .insert(encoded_key, StorageAction::Set(value.encode()));

        Ok(())
    }

    pub fn delete<T>(&mut self, key: &T::Key) -> Result<(), Error>
    where
        T: Table,
    {
        let encoded_key = T::encode_key(key);

        trace!("deleting {}", hex::encode(&encoded_key));

        self.write_buffer.insert(encoded_key, StorageAction::Delete);

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.write_buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.write_buffer.is_empty()
    }

    /// Flush all the pending writes to storage in one atomic batch
    pub fn commit(self) -> Result<(), Error> {
        let cf = self.storage.cf_handle()?;

        let mut wb = WriteBatch::default();

        for (key, action) in self.write_buffer {
            match action {
                StorageAction::Set(value) => wb.put_cf(cf, key, value),
                StorageAction::Delete => wb.delete_cf(cf, key),
            }
        }

        self.storage.db.write(wb)?;

        Ok(())
    }
}

#[derive(Clone)]
pub struct StorageHandler {
    db: Arc<DB>,
    read_only: bool,
}

impl StorageHandler {
    pub fn open(path: PathBuf, read_only: bool, memory_budget: u64) -> Result<Self, Error> {
        info!(path = %path.display(), read_only, "opening db...");

        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);

        info!(
            "using rocksdb memory budget: {:.2} GB ({} bytes)",
            memory_budget as f64 / 1024.0 / 1024.0 / 1024.0,
            memory_budget
        );

        let block_cache_budget = (memory_budget as f64 * 0.75) as usize;
        let memtable_budget = (memory_budget as f64 * 0.25) as usize;

        let cache = Cache::new_lru_cache(block_cache_budget);

        let sys = System::new_all();
        let cpus = sys.cpus().len().max(1) as i32;
        db_opts.set_max_background_jobs(cpus.max(2));
        db_opts.set_max_subcompactions(cpus as u32);

        let mut cf_opts = Options::default();

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_block_cache(&cache);
        cf_opts.set_block_based_table_factory(&block_opts);

        let per_memtable_cap = 512 * 1024 * 1024;
        cf_opts.set_write_buffer_size(std::cmp::min(memtable_budget / 2, per_memtable_cap));
        cf_opts.set_max_write_buffer_number(2);

        // tag + table id
        cf_opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(2));

        let cfs = vec![ColumnFamilyDescriptor::new(LEDGER_CF_NAME, cf_opts)];

        let db = if read_only {
            let mut secondary_path = path.clone();
            secondary_path.push("secondary");
            DB::open_cf_descriptors_as_secondary(&db_opts, path, secondary_path, cfs)?
        } else {
            DB::open_cf_descriptors(&db_opts, path, cfs)?
        };

        Ok(Self {
            db: Arc::new(db),
            read_only,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn cf_handle(&self) -> Result<&ColumnFamily, Error> {
        self.db
            .cf_handle(LEDGER_CF_NAME)
            .ok_or_else(|| Error::Custom(format!("column family {LEDGER_CF_NAME} missing")))
    }

    pub fn begin_task(&self) -> WriteTask<'_> {
        WriteTask {
            storage: self,
            write_buffer: HashMap::new(),
        }
    }

    pub fn reader(&self) -> Reader<'_> {
        Reader { storage: self }
    }

    pub fn try_refresh_read_only_data(&self) -> Result<(), Error> {
        if self.read_only {
            self.db.try_catch_up_with_primary()?
        }

        Ok(())
    }

    pub fn flush_and_compact(&self) -> Result<(), Error> {
        self.db.flush()?;
        self.db
            .compact_range_cf(self.cf_handle()?, None::<Vec<u8>>, None::<Vec<u8>>);

        Ok(())
    }

    /// Log rocksdb and process memory usage
    pub fn log_perf_snapshot(&self) -> Result<(), Error> {
        let cf = self.cf_handle()?;

        let property = |name: &str| -> u64 {
            match self.db.property_int_value_cf(cf, name) {
                Ok(value) => value.unwrap_or_default(),
                Err(e) => {
                    warn!("failed to read rocksdb property {name}: {e}");
                    0
                }
            }
        };

        let memtables_mb = property("rocksdb.cur-size-all-mem-tables") / 1024 / 1024;
        let block_cache_mb = property("rocksdb.block-cache-usage") / 1024 / 1024;
        let pending_compaction_mb = property("rocksdb.estimate-pending-compaction-bytes") / 1024 / 1024;
        let running_compactions = property("rocksdb.num-running-compactions");

        let sys = System::new_all();
        let app_mem_mb = sys
            .process(Pid::from_u32(std::process::id()))
            .map(|p| p.memory() / 1024 / 1024)
            .unwrap_or_default();

        info!(
            app_mem_mb,
            memtables_mb,
            block_cache_mb,
            pending_compaction_mb,
            running_compactions,
            free_mem_mb = sys.free_memory() / 1024 / 1024,
            total_mem_mb = sys.total_memory() / 1024 / 1024,
            "storage stats"
        );

        Ok(())
    }
}

/// Reads the latest committed data
pub struct Reader<'a> {
    storage: &'a StorageHandler,
}

impl Reader<'_> {
    pub fn get<T>(&self, key: &T::Key) -> Result<Option<T::Value>, Error>
    where
        T: Table,
    {
        self.get_raw::<T>(&T::encode_key(key))
    }

    fn get_raw<T>(&self, encoded_key: &[u8]) -> Result<Option<T::Value>, Error>
    where
        T: Table,
    {
        let res = self
            .storage
            .db
            .get_cf(self.storage.cf_handle()?, encoded_key)?;

        match res {
            Some(bytes) => Ok(Some(T::Value::decode_all(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn multi_get<T>(&self, keys: Vec<T::Key>) -> Result<MultiGetResult<T::Key, T::Value>, Error>
    where
        T: Table,
    {
        let cf = self.storage.cf_handle()?;

        let encoded = keys.iter().map(|k| T::encode_key(k)).collect::<Vec<_>>();

        let fetched = self
            .storage
            .db
            .multi_get_cf(encoded.iter().map(|enc_k| (cf, enc_k)));

        let mut out = Vec::with_capacity(keys.len());

        for (key, value) in keys.into_iter().zip_eq(fetched) {
            let value = match value? {
                Some(v) => Some(T::Value::decode_all(&v)?),
                None => None,
            };

            out.push((key, value));
        }

        Ok(out)
    }

    pub fn iter_kvs<T: Table>(
        &self,
        range: Range<Vec<u8>>,
        reverse: bool,
    ) -> Result<TableIterator<'_, T>, Error> {
        let mut read_opts = ReadOptions::default();
        read_opts.set_iterate_range(range);

        let mode = if reverse {
            rocksdb::IteratorMode::End
        } else {
            rocksdb::IteratorMode::Start
        };

        let iter = self
            .storage
            .db
            .iterator_cf_opt(self.storage.cf_handle()?, read_opts, mode);

        Ok(TableIterator::<T>::new(iter))
    }
}
