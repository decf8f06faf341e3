//! Wide row form of a balance change.
//!
//! | property | content                                   |
//! |----------|-------------------------------------------|
//! | `s`      | seen time                                 |
//! | `ss`     | spent input indices                       |
//! | `a`      | spent outpoints, parallel to `ss`         |
//! | `b`      | spent coins, only once resolved           |
//! | `c`      | received output indices                   |
//! | `d`      | received outputs, parallel to `c`         |
//! | `e`      | op return then coinbase flag, `o` or `n`  |
//! | `f`      | matched rules, json                       |
//! | `g`      | colored transaction, only once resolved   |
//! | `h`      | script, only when carried                 |
//! | `cu`     | custom data                               |

use std::sync::OnceLock;

use bitcoin::{OutPoint, TxOut};

use crate::{
    colored::{ColoredBalanceChangeEntry, ColoredTransaction},
    error::Error,
    storage::{
        encdec::{Decode, Encode, VarUInt},
        entity::{EntityProperty, EntityRow},
    },
    sync::Point,
};

use super::{
    BalanceId, BalanceLocator, Coin, CoinCollection, MatchedRule, OrderedBalanceChange, Resolution,
};

const FLAG_SET: char = 'o';
const FLAG_UNSET: char = 'n';

fn flag(value: bool) -> char {
    if value { FLAG_SET } else { FLAG_UNSET }
}

fn indices(values: impl IntoIterator<Item = u32>) -> Vec<u8> {
    values.into_iter().map(VarUInt::from).collect::<Vec<_>>().encode()
}

impl OrderedBalanceChange {
    pub fn to_entity(&self) -> EntityRow {
        let mut row = EntityRow::new(self.partition_key(), self.row_key());

        row.insert("s", EntityProperty::Timestamp(self.seen));
        row.insert(
            "ss",
            EntityProperty::Binary(indices(self.spent_indices.iter().copied())),
        );
        row.insert("a", EntityProperty::Binary(self.spent_outpoints.encode()));

        if let Some(coins) = self.spent_coins.resolved() {
            let spent = coins
                .iter()
                .map(|c| (c.outpoint, c.txout.clone()))
                .collect::<Vec<_>>();

            row.insert("b", EntityProperty::Binary(spent.encode()));
        }

        row.insert(
            "c",
            EntityProperty::Binary(indices(self.received_coins.iter().map(|c| c.outpoint.vout))),
        );
        row.insert(
            "d",
            EntityProperty::Binary(
                self.received_coins
                    .iter()
                    .map(|c| c.txout.clone())
                    .collect::<Vec<_>>()
                    .encode(),
            ),
        );

        row.insert(
            "e",
            EntityProperty::Text(format!(
                "{}{}",
                flag(self.has_op_return),
                flag(self.is_coinbase)
            )),
        );

        // a list of plain serde types cannot fail to serialise
        let rules = serde_json::to_string(&self.matched_rules).unwrap_or_else(|_| "[]".into());
        row.insert("f", EntityProperty::Text(rules));

        if let Some(entry) = self.colored.resolved() {
            row.insert("g", EntityProperty::Binary(entry.colored.encode()));
        }

        if let Some(script) = &self.script {
            row.insert("h", EntityProperty::Binary(script.to_bytes()));
        }

        if let Some(custom_data) = &self.custom_data {
            row.insert("cu", EntityProperty::Binary(custom_data.as_bytes().to_vec()));
        }

        row
    }

    pub fn from_entity(row: &EntityRow) -> Result<Self, Error> {
        let (id, locator) = row.row_key.split_once('-').ok_or_else(|| {
            Error::row_format(format!("row key {} has no locator", row.row_key))
        })?;

        let balance_id = BalanceId::parse(id)?;
        let locator = BalanceLocator::parse(locator)?;

        let point = match locator {
            BalanceLocator::Confirmed {
                height, block_id, ..
            } => Some(Point {
                height,
                hash: block_id,
            }),
            BalanceLocator::Unconfirmed { .. } => None,
        };

        let seen = row
            .get("s")
            .and_then(EntityProperty::as_timestamp)
            .ok_or_else(|| missing(row, "s"))?;

        let mut change = Self::new(balance_id, locator.tx_id(), point, seen);

        change.spent_indices = decode_indices(row, "ss")?.unwrap_or_default();
        change.spent_outpoints = decode_binary::<Vec<OutPoint>>(row, "a")?.unwrap_or_default();

        if change.spent_indices.len() != change.spent_outpoints.len() {
            return Err(Error::row_format(format!(
                "{}: {} spent indices for {} outpoints",
                row.row_key,
                change.spent_indices.len(),
                change.spent_outpoints.len()
            )));
        }

        if let Some(spent) = decode_binary::<Vec<(OutPoint, TxOut)>>(row, "b")? {
            change.spent_coins = Resolution::Resolved(
                spent
                    .into_iter()
                    .map(|(outpoint, txout)| Coin::new(outpoint, txout))
                    .collect(),
            );
        }

        let received_indices = decode_indices(row, "c")?.unwrap_or_default();
        let received_outputs = decode_binary::<Vec<TxOut>>(row, "d")?.unwrap_or_default();

        if received_indices.len() != received_outputs.len() {
            return Err(Error::row_format(format!(
                "{}: {} received indices for {} outputs",
                row.row_key,
                received_indices.len(),
                received_outputs.len()
            )));
        }

        change.received_coins = received_indices
            .into_iter()
            .zip(received_outputs)
            .map(|(vout, txout)| Coin::new(OutPoint::new(change.tx_id, vout), txout))
            .collect::<CoinCollection>();

        let flags = text(row, "e")?.ok_or_else(|| missing(row, "e"))?;
        let mut chars = flags.chars();

        match (chars.next(), chars.next(), chars.next()) {
            (Some(op_return), Some(coinbase), None) => {
                change.has_op_return = parse_flag(row, op_return)?;
                change.is_coinbase = parse_flag(row, coinbase)?;
            }
            _ => return Err(Error::row_format(format!("{}: bad flags {flags}", row.row_key))),
        }

        if let Some(rules) = text(row, "f")? {
            change.matched_rules = serde_json::from_str::<Vec<MatchedRule>>(rules)
                .map_err(|e| Error::row_format(format!("{}: matched rules: {e}", row.row_key)))?;
        }

        if let Some(colored) = decode_binary::<ColoredTransaction>(row, "g")? {
            let received = change.received_coins.iter().map(|c| c.outpoint.vout);
            let entry = ColoredBalanceChangeEntry::new(colored, &change.spent_indices, received);

            change.colored = Resolution::Resolved(entry);
        }

        if let Some(script) = binary(row, "h")? {
            change.script = Some(script.to_vec().into());
        }

        if let Some(custom_data) = binary(row, "cu")? {
            let custom_data = String::from_utf8(custom_data.to_vec())
                .map_err(|_| Error::row_format(format!("{}: custom data", row.row_key)))?;

            change.custom_data = Some(custom_data);
        }

        change.amount = OnceLock::new();
        change.add_redeem_info();

        Ok(change)
    }
}

fn missing(row: &EntityRow, name: &str) -> Error {
    Error::row_format(format!("{}: missing property {name}", row.row_key))
}

fn parse_flag(row: &EntityRow, c: char) -> Result<bool, Error> {
    match c {
        FLAG_SET => Ok(true),
        FLAG_UNSET => Ok(false),
        other => Err(Error::row_format(format!("{}: bad flag {other}", row.row_key))),
    }
}

fn binary<'a>(row: &'a EntityRow, name: &str) -> Result<Option<&'a [u8]>, Error> {
    match row.get(name) {
        None => Ok(None),
        Some(EntityProperty::Binary(bytes)) => Ok(Some(bytes)),
        Some(_) => Err(Error::row_format(format!(
            "{}: property {name} is not binary",
            row.row_key
        ))),
    }
}

fn text<'a>(row: &'a EntityRow, name: &str) -> Result<Option<&'a str>, Error> {
    match row.get(name) {
        None => Ok(None),
        Some(EntityProperty::Text(text)) => Ok(Some(text)),
        Some(_) => Err(Error::row_format(format!(
            "{}: property {name} is not text",
            row.row_key
        ))),
    }
}

fn decode_binary<T: Decode>(row: &EntityRow, name: &str) -> Result<Option<T>, Error> {
    binary(row, name)?
        .map(T::decode_exact)
        .transpose()
        .map_err(Error::from)
}

fn decode_indices(row: &EntityRow, name: &str) -> Result<Option<Vec<u32>>, Error> {
    let Some(values) = decode_binary::<Vec<VarUInt>>(row, name)? else {
        return Ok(None);
    };

    let indices = values
        .into_iter()
        .map(u32::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(indices))
}
