use std::{fmt, str::FromStr};

use bitcoin::{
    Script, ScriptBuf,
    hashes::{Hash, hash160, sha256},
};

use crate::{error::Error, storage::entity::PARTITION_KEY_LEN};

/// Scripts longer than this are not inlined into the balance id, the id holds a hash of the
/// script and the script itself travels with the record.
pub const MAX_SCRIPT_SIZE: usize = 512;

const WALLET_PREFIX: char = 'w';
const SCRIPT_HASH_PREFIX: char = 'h';

/// Partition of the ledger a balance change belongs to.
///
/// The string form never contains `-`, which separates the id from the locator in row keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BalanceId {
    Wallet(String),
    Script(ScriptBuf),
    /// Placeholder for a script over [`MAX_SCRIPT_SIZE`]
    ScriptHash(hash160::Hash),
}

impl BalanceId {
    pub fn from_wallet(wallet_id: impl Into<String>) -> Self {
        Self::Wallet(wallet_id.into())
    }

    pub fn from_script(script: &Script) -> Self {
        if script.len() > MAX_SCRIPT_SIZE {
            Self::ScriptHash(hash160::Hash::hash(script.as_bytes()))
        } else {
            Self::Script(script.to_owned())
        }
    }

    /// Whether the script has to be stored alongside the record because the id cannot hold it
    pub fn is_oversized(script: &Script) -> bool {
        script.len() > MAX_SCRIPT_SIZE
    }

    pub fn wallet_id(&self) -> Option<&str> {
        match self {
            Self::Wallet(id) => Some(id),
            _ => None,
        }
    }

    /// The script this id was derived from, when it is inlined
    pub fn script(&self) -> Option<&Script> {
        match self {
            Self::Script(script) => Some(script),
            _ => None,
        }
    }

    pub fn extract_script(&self) -> Option<ScriptBuf> {
        self.script().map(Script::to_owned)
    }

    /// Short, deterministic key spreading ids across partitions
    pub fn partition_key(&self) -> String {
        let digest = sha256::Hash::hash(self.to_string().as_bytes());

        let mut key = hex::encode(&digest.as_byte_array()[..PARTITION_KEY_LEN.div_ceil(2)]);
        key.truncate(PARTITION_KEY_LEN);

        key
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        let bad = |e: &dyn fmt::Display| Error::row_format(format!("invalid balance id {s}: {e}"));

        if let Some(rest) = s.strip_prefix(WALLET_PREFIX) {
            let bytes = hex::decode(rest).map_err(|e| bad(&e))?;
            let id = String::from_utf8(bytes).map_err(|e| bad(&e))?;

            Ok(Self::Wallet(id))
        } else if let Some(rest) = s.strip_prefix(SCRIPT_HASH_PREFIX) {
            let bytes = hex::decode(rest).map_err(|e| bad(&e))?;
            let hash = hash160::Hash::from_slice(&bytes).map_err(|e| bad(&e))?;

            Ok(Self::ScriptHash(hash))
        } else {
            let bytes = hex::decode(s).map_err(|e| bad(&e))?;

            Ok(Self::Script(ScriptBuf::from_bytes(bytes)))
        }
    }
}

impl fmt::Display for BalanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wallet(id) => write!(f, "{WALLET_PREFIX}{}", hex::encode(id.as_bytes())),
            Self::Script(script) => write!(f, "{}", hex::encode(script.as_bytes())),
            Self::ScriptHash(hash) => write!(f, "{SCRIPT_HASH_PREFIX}{}", hex::encode(hash)),
        }
    }
}

impl FromStr for BalanceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
