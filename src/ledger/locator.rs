use std::{fmt, str::FromStr};

use bitcoin::{BlockHash, Txid};
use chrono::{DateTime, Utc};

use crate::{error::Error, sync::BlockHeight};

const UNCONFIRMED_PREFIX: char = 'u';

/// Ordering token of a balance change within its partition.
///
/// The string forms sort ascending: confirmed by height then block then transaction, unconfirmed
/// by first-seen time then transaction, and every unconfirmed locator after every confirmed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BalanceLocator {
    Confirmed {
        height: BlockHeight,
        block_id: BlockHash,
        tx_id: Txid,
    },
    Unconfirmed {
        seen: DateTime<Utc>,
        tx_id: Txid,
    },
}

impl BalanceLocator {
    pub fn tx_id(&self) -> Txid {
        match self {
            Self::Confirmed { tx_id, .. } | Self::Unconfirmed { tx_id, .. } => *tx_id,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        let bad = |what: &str| Error::row_format(format!("invalid balance locator {s}: {what}"));

        if let Some(rest) = s.strip_prefix(UNCONFIRMED_PREFIX) {
            let (micros, tx_id) = rest.split_once('-').ok_or_else(|| bad("missing tx id"))?;

            let micros = micros.parse::<i64>().map_err(|_| bad("seen time"))?;
            let seen = DateTime::from_timestamp_micros(micros).ok_or_else(|| bad("seen range"))?;
            let tx_id = tx_id.parse().map_err(|_| bad("tx id"))?;

            Ok(Self::Unconfirmed { seen, tx_id })
        } else {
            let mut parts = s.splitn(3, '-');

            let (Some(height), Some(block_id), Some(tx_id)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(bad("expected height-block-tx"));
            };

            Ok(Self::Confirmed {
                height: height.parse().map_err(|_| bad("height"))?,
                block_id: block_id.parse().map_err(|_| bad("block id"))?,
                tx_id: tx_id.parse().map_err(|_| bad("tx id"))?,
            })
        }
    }
}

impl fmt::Display for BalanceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Confirmed {
                height,
                block_id,
                tx_id,
            } => write!(f, "{height:010}-{block_id}-{tx_id}"),
            Self::Unconfirmed { seen, tx_id } => write!(
                f,
                "{UNCONFIRMED_PREFIX}{:020}-{tx_id}",
                seen.timestamp_micros().max(0)
            ),
        }
    }
}

impl FromStr for BalanceLocator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
