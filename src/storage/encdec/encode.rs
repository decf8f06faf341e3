use bitcoin::{BlockHash, OutPoint, ScriptBuf, Transaction, TxOut, Txid, block::Header};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use super::{Encode, VarUInt};

impl<const N: usize> Encode for [u8; N] {
    fn encode(&self) -> Vec<u8> {
        self.to_vec()
    }
}

impl Encode for u8 {
    fn encode(&self) -> Vec<u8> {
        vec![*self]
    }
}

impl Encode for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Encode for () {
    fn encode(&self) -> Vec<u8> {
        vec![]
    }
}

impl Encode for VarUInt {
    fn encode(&self) -> Vec<u8> {
        let bend = self.0.to_be_bytes();

        match bend.iter().position(|b| *b != 0x00) {
            Some(idx) => {
                let mut out = Vec::with_capacity(1 + 16 - idx);
                out.push((16 - idx) as u8);
                out.extend_from_slice(&bend[idx..]);
                out
            }
            None => vec![0],
        }
    }
}

macro_rules! impl_uint_encode {
    ($type:ty) => {
        impl Encode for $type {
            fn encode(&self) -> Vec<u8> {
                Into::<VarUInt>::into(*self).encode()
            }
        }
    };
}

// u8 encoding is more efficient than if we used our varuint
impl_uint_encode!(usize);
impl_uint_encode!(u16);
impl_uint_encode!(u32);
impl_uint_encode!(u64);
impl_uint_encode!(u128);

/// Fixed width big endian with the sign bit flipped, so negative values sort first
impl Encode for i64 {
    fn encode(&self) -> Vec<u8> {
        ((*self as u64) ^ (1 << 63)).to_be_bytes().to_vec()
    }
}

impl<A: Encode> Encode for Vec<A> {
    fn encode(&self) -> Vec<u8> {
        [
            self.len().encode(),
            self.iter().flat_map(|t| t.encode()).collect(),
        ]
        .concat()
    }
}

impl Encode for String {
    fn encode(&self) -> Vec<u8> {
        [self.len().encode(), self.as_bytes().to_vec()].concat()
    }
}

impl<A: Encode> Encode for Option<A> {
    fn encode(&self) -> Vec<u8> {
        match self {
            Some(value) => [vec![1], value.encode()].concat(),
            None => vec![0],
        }
    }
}

impl<A: Encode, B: Encode> Encode for (A, B) {
    fn encode(&self) -> Vec<u8> {
        [self.0.encode(), self.1.encode()].concat()
    }
}

impl<K: Encode, V: Encode> Encode for IndexMap<K, V> {
    fn encode(&self) -> Vec<u8> {
        [
            self.len().encode(),
            self.iter()
                .flat_map(|(k, v)| [k.encode(), v.encode()].concat())
                .collect(),
        ]
        .concat()
    }
}

/// Microseconds since the unix epoch
impl Encode for DateTime<Utc> {
    fn encode(&self) -> Vec<u8> {
        self.timestamp_micros().encode()
    }
}

macro_rules! impl_consensus_encode {
    ($type:ty) => {
        impl Encode for $type {
            fn encode(&self) -> Vec<u8> {
                bitcoin::consensus::serialize(self)
            }
        }
    };
}

impl_consensus_encode!(OutPoint);
impl_consensus_encode!(TxOut);
impl_consensus_encode!(ScriptBuf);
impl_consensus_encode!(Transaction);
impl_consensus_encode!(Header);
impl_consensus_encode!(BlockHash);
impl_consensus_encode!(Txid);
