use super::{Decode, VarUInt};

use bitcoin::{BlockHash, OutPoint, ScriptBuf, Transaction, TxOut, Txid, block::Header};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DecodingError {
    #[error("Malformed input: {0} ({1:?})")]
    MalformedInput(String, Vec<u8>),
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("VarUInt casting: {0}")]
    VarUIntCasting(u128),
    #[error("Enum kind: {0:?}")]
    InvalidEnumKind(Vec<u8>),
    #[error("Consensus decoding: {0}")]
    Consensus(String),
}

// Helper method to create MalformedInput error with just a message
pub fn malformed_input<S: Into<String>>(msg: S, bytes: &[u8]) -> DecodingError {
    DecodingError::MalformedInput(msg.into(), bytes.to_vec())
}

pub type DecodingResult<'a, T> = Result<(T, &'a [u8]), DecodingError>;

impl<const N: usize> Decode for [u8; N] {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (head, rest) = bytes
            .split_first_chunk::<N>()
            .ok_or_else(|| malformed_input("array insufficient bytes", bytes))?;

        Ok((*head, rest))
    }
}

impl Decode for u8 {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        bytes
            .split_first()
            .map(|(b, rest)| (*b, rest))
            .ok_or_else(|| malformed_input("u8 insufficient bytes", bytes))
    }
}

impl Decode for bool {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        match u8::decode(bytes)? {
            (0, rest) => Ok((false, rest)),
            (1, rest) => Ok((true, rest)),
            _ => Err(malformed_input("invalid bool", bytes)),
        }
    }
}

impl Decode for () {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        Ok(((), bytes))
    }
}

impl Decode for VarUInt {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (len, rest) = u8::decode(bytes)?;
        let len = len as usize;

        if len > 16 {
            return Err(malformed_input("varuint len exceeds maximum", bytes));
        }

        let (data, rest) = rest
            .split_at_checked(len)
            .ok_or_else(|| malformed_input("varuint insufficient bytes", bytes))?;

        let mut be_128 = [0u8; 16];
        be_128[16 - len..].copy_from_slice(data);

        Ok((VarUInt(u128::from_be_bytes(be_128)), rest))
    }
}

macro_rules! impl_uint_decode {
    ($t:ty) => {
        impl Decode for $t {
            fn decode(bytes: &[u8]) -> DecodingResult<'_, $t> {
                let (varuint, rem) = VarUInt::decode(bytes)?;

                let casted = Self::try_from(varuint)?;

                Ok((casted, rem))
            }
        }
    };
}

impl_uint_decode!(usize);
impl_uint_decode!(u16);
impl_uint_decode!(u32);
impl_uint_decode!(u64);
impl_uint_decode!(u128);

impl Decode for i64 {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (raw, rest) = <[u8; 8]>::decode(bytes)?;

        Ok(((u64::from_be_bytes(raw) ^ (1 << 63)) as i64, rest))
    }
}

impl<A: Decode> Decode for Vec<A> {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (len, mut bytes) = usize::decode(bytes)?;
        // each item is at least one byte, don't trust the prefix for allocation beyond that
        let mut vec = Vec::with_capacity(len.min(bytes.len()));

        for _ in 0..len {
            let (item, rest) = A::decode(bytes)?;
            bytes = rest;

            vec.push(item);
        }

        Ok((vec, bytes))
    }
}

impl Decode for String {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (len, rest) = usize::decode(bytes)?;

        let (data, rest) = rest
            .split_at_checked(len)
            .ok_or_else(|| malformed_input("string insufficient bytes", bytes))?;

        Ok((String::from_utf8(data.to_vec())?, rest))
    }
}

impl<A: Decode> Decode for Option<A> {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        match u8::decode(bytes)? {
            (0, rest) => Ok((None, rest)),
            (1, rest) => A::decode(rest).map(|(value, rest)| (Some(value), rest)),
            _ => Err(malformed_input("invalid option tag", bytes)),
        }
    }
}

impl<A: Decode, B: Decode> Decode for (A, B) {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (a, bytes) = A::decode(bytes)?;
        let (b, bytes) = B::decode(bytes)?;

        Ok(((a, b), bytes))
    }
}

impl<K, V> Decode for IndexMap<K, V>
where
    K: Decode + Eq + std::hash::Hash,
    V: Decode,
{
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let mut map = IndexMap::new();

        let (len, mut bytes) = usize::decode(bytes)?;

        for _ in 0..len {
            let (key, rest) = K::decode(bytes)?;
            bytes = rest;
            let (value, rest) = V::decode(bytes)?;
            bytes = rest;
            map.insert(key, value);
        }

        Ok((map, bytes))
    }
}

impl Decode for DateTime<Utc> {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (micros, rest) = i64::decode(bytes)?;

        let datetime = DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| malformed_input("timestamp out of range", bytes))?;

        Ok((datetime, rest))
    }
}

macro_rules! impl_consensus_decode {
    ($type:ty) => {
        impl Decode for $type {
            fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
                let (value, consumed) = bitcoin::consensus::deserialize_partial::<$type>(bytes)
                    .map_err(|e| DecodingError::Consensus(e.to_string()))?;

                Ok((value, &bytes[consumed..]))
            }
        }
    };
}

impl_consensus_decode!(OutPoint);
impl_consensus_decode!(TxOut);
impl_consensus_decode!(ScriptBuf);
impl_consensus_decode!(Transaction);
impl_consensus_decode!(Header);
impl_consensus_decode!(BlockHash);
impl_consensus_decode!(Txid);
