use std::{marker::PhantomData, ops::Range};

use rocksdb::{DB, DBIteratorWithThreadMode};

use crate::error::Error;

use super::encdec::{Decode, DecodingError, Encode, EncodeBuilder, malformed_input, prefix_key_range};

/// First byte of every key written by the ledger, leaving room for other key spaces in the same
/// column family.
const LEDGER_TAG: u8 = b'L';

/// Unique u8 for each table, used in the key encodings. Do not modify, only add new variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LedgerTable {
    HeaderByHeight = 0,
    CheckpointByName = 1,
    TransactionById = 2,
    ColoredTransactionById = 3,
    ScriptBalances = 4,
    WalletBalances = 5,
}

/// Defines a ledger table.
///
/// # Example
/// ```ignore
/// define_table! {
///     name: HeaderByHeightKV,
///     key_type: u64,
///     value_type: Header,
///     table: LedgerTable::HeaderByHeight
/// }
/// ```
#[macro_export]
macro_rules! define_table {
    {
        name: $name:ident,
        key_type: $key_type:ty,
        value_type: $value_type:ty,
        table: $table_id:expr
    } => {
        pub struct $name;

        impl $crate::storage::table::Table for $name {
            const TABLE_ID: u8 = $table_id as u8;
            type Key = $key_type;
            type Value = $value_type;
        }
    };
}

/// A table with a unique prefix and key-value types.
pub trait Table {
    /// The unique prefix for this table.
    const TABLE_ID: u8;

    /// Key type for the table.
    type Key: Encode + Decode;

    /// Value type for the table.
    type Value: Encode + Decode;

    /// Tag and table id, shared by every key of the table
    fn table_prefix() -> [u8; 2] {
        [LEDGER_TAG, Self::TABLE_ID]
    }

    /// Encodes the full key by combining the table prefix and the encoded key.
    fn encode_key(key: &Self::Key) -> Vec<u8> {
        EncodeBuilder::new()
            .append(&Self::table_prefix())
            .append(key)
            .build()
    }

    fn decode_key(raw: &[u8]) -> Result<Self::Key, DecodingError> {
        let rest = raw
            .strip_prefix(&Self::table_prefix())
            .ok_or_else(|| malformed_input("key outside of table", raw))?;

        Self::Key::decode_exact(rest)
    }

    /// Range of encoded keys between `start` (inclusive) and `end` (exclusive), unbounded sides
    /// cover the rest of the table.
    fn encode_range<S: Encode, E: Encode>(start: Option<&S>, end: Option<&E>) -> Range<Vec<u8>> {
        let prefix = Self::table_prefix();

        let start = match start {
            Some(s) => EncodeBuilder::new().append(&prefix).append(s).build(),
            None => prefix.to_vec(),
        };

        let end = match end {
            Some(e) => EncodeBuilder::new().append(&prefix).append(e).build(),
            None => prefix_key_range(&prefix).end,
        };

        start..end
    }

    /// Range of every key in the table whose encoding starts with `key_prefix`
    fn prefix_range(key_prefix: &[u8]) -> Range<Vec<u8>> {
        let full = EncodeBuilder::new()
            .append(&Self::table_prefix())
            .append_raw(key_prefix)
            .build();

        prefix_key_range(&full)
    }
}

/// Iterates the decoded KVs of a single table
pub struct TableIterator<'a, T: Table> {
    inner: DBIteratorWithThreadMode<'a, DB>,
    _table: PhantomData<T>,
}

impl<'a, T: Table> TableIterator<'a, T> {
    pub fn new(inner: DBIteratorWithThreadMode<'a, DB>) -> Self {
        Self {
            inner,
            _table: PhantomData,
        }
    }
}

impl<T: Table> Iterator for TableIterator<'_, T> {
    type Item = Result<(T::Key, T::Value), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let res = self.inner.next()?;

        Some(res.map_err(Error::from).and_then(|(k, v)| {
            let key = T::decode_key(&k)?;
            let value = T::Value::decode_all(&v)?;

            Ok((key, value))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::define_table! {
        name: TestKV,
        key_type: u64,
        value_type: (),
        table: LedgerTable::HeaderByHeight
    }

    #[test]
    fn keys_carry_the_table_prefix() {
        let key = TestKV::encode_key(&5);

        assert_eq!(&key[..2], &[b'L', LedgerTable::HeaderByHeight as u8]);
        assert_eq!(TestKV::decode_key(&key).unwrap(), 5);
    }

    #[test]
    fn unbounded_range_covers_only_the_table() {
        let range = TestKV::encode_range(None::<&()>, None::<&()>);

        assert!(range.contains(&TestKV::encode_key(&0)));
        assert!(range.contains(&TestKV::encode_key(&u64::MAX)));
        assert!(!range.contains(&vec![b'L', LedgerTable::CheckpointByName as u8]));
    }

    #[test]
    fn bounded_range_excludes_end() {
        let range = TestKV::encode_range(Some(&10u64), Some(&20u64));

        assert!(range.contains(&TestKV::encode_key(&10)));
        assert!(range.contains(&TestKV::encode_key(&19)));
        assert!(!range.contains(&TestKV::encode_key(&20)));
        assert!(!range.contains(&TestKV::encode_key(&9)));
    }
}
