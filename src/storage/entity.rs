use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use maestro_ledger_macros::{Decode, Encode};

use super::encdec::{Decode, DecodingResult, Encode, malformed_input};

/// Number of characters in a partition key
pub const PARTITION_KEY_LEN: usize = 3;

/// A single typed value of a wide row
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub enum EntityProperty {
    Timestamp(DateTime<Utc>),
    Binary(Vec<u8>),
    Text(String),
}

impl EntityProperty {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(t) => Some(*t),
            _ => None,
        }
    }
}

pub type EntityProperties = IndexMap<String, EntityProperty>;

/// Storage address of a row: a short partition key followed by the row key.
///
/// Encoded without a length prefix on the row key so that keys sharing a row key prefix are
/// contiguous within their partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub partition_key: String,
    pub row_key: String,
}

impl Encode for EntityKey {
    fn encode(&self) -> Vec<u8> {
        [self.partition_key.as_bytes(), self.row_key.as_bytes()].concat()
    }
}

impl Decode for EntityKey {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (partition, row) = bytes
            .split_at_checked(PARTITION_KEY_LEN)
            .ok_or_else(|| malformed_input("entity key shorter than partition", bytes))?;

        let partition_key = String::from_utf8(partition.to_vec())?;
        let row_key = String::from_utf8(row.to_vec())?;

        Ok((
            Self {
                partition_key,
                row_key,
            },
            &[],
        ))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition_key, self.row_key)
    }
}

/// Generic wide row as written to a balances table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRow {
    pub partition_key: String,
    pub row_key: String,
    pub properties: EntityProperties,
}

impl EntityRow {
    pub fn new(partition_key: String, row_key: String) -> Self {
        Self {
            partition_key,
            row_key,
            properties: IndexMap::new(),
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey {
            partition_key: self.partition_key.clone(),
            row_key: self.row_key.clone(),
        }
    }

    pub fn from_parts(key: EntityKey, properties: EntityProperties) -> Self {
        Self {
            partition_key: key.partition_key,
            row_key: key.row_key,
            properties,
        }
    }

    pub fn insert(&mut self, name: &str, value: EntityProperty) {
        self.properties.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&EntityProperty> {
        self.properties.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_key_keeps_row_prefixes_contiguous() {
        let a = EntityKey {
            partition_key: "abc".into(),
            row_key: "id-0000000001".into(),
        };
        let b = EntityKey {
            partition_key: "abc".into(),
            row_key: "id-0000000002".into(),
        };

        assert!(a.encode() < b.encode());
        assert!(a.encode().starts_with(b"abcid-"));
        assert_eq!(EntityKey::decode_exact(&a.encode()).unwrap(), a);
    }

    #[test]
    fn properties_round_trip() {
        let mut row = EntityRow::new("abc".into(), "id".into());
        row.insert("s", EntityProperty::Timestamp(DateTime::from_timestamp_micros(1).unwrap()));
        row.insert("a", EntityProperty::Binary(vec![1, 2]));
        row.insert("cu", EntityProperty::Text("hello".into()));

        let decoded = EntityProperties::decode_exact(&row.properties.encode()).unwrap();

        assert_eq!(decoded, row.properties);
        assert_eq!(decoded["cu"].as_text(), Some("hello"));
    }
}
