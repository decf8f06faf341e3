use bitcoin::{
    BlockHash, OutPoint, Script, ScriptBuf, Transaction, Txid,
    block::Header,
    opcodes::all::{OP_PUSHNUM_16, OP_RESERVED, OP_RETURN},
    script::Instruction,
};
use chrono::{DateTime, SubsecRound, Utc};
use indexmap::IndexMap;
use tracing::trace;

use crate::sync::{BlockHeight, Point};

use super::{Coin, OrderedBalanceChange, WalletRules, signer::spending_script};

#[derive(Default)]
struct ScriptAccumulator {
    spent: Vec<(OutPoint, u32)>,
    received: Vec<Coin>,
}

/// `OP_RETURN` followed by nothing but data pushes
fn is_null_data(script: &Script) -> bool {
    let mut instructions = script.instructions();

    matches!(instructions.next(), Some(Ok(Instruction::Op(op))) if op == OP_RETURN)
        && instructions.all(|instruction| match instruction {
            Ok(Instruction::PushBytes(_)) => true,
            Ok(Instruction::Op(op)) => op.to_u8() <= OP_PUSHNUM_16.to_u8() && op != OP_RESERVED,
            Err(_) => false,
        })
}

/// Current time at the precision balance changes are stored with
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Split a transaction into one balance change per script it spends from or pays to.
///
/// `tx_id` and `block_id` are computed from `tx` and `header` when not supplied. Without either a
/// block id or a header the changes are unconfirmed and seen now.
pub fn extract_script_balances(
    tx_id: Option<Txid>,
    tx: &Transaction,
    block_id: Option<BlockHash>,
    header: Option<&Header>,
    height: BlockHeight,
) -> Vec<OrderedBalanceChange> {
    let tx_id = tx_id.unwrap_or_else(|| tx.compute_txid());
    let block_id = block_id.or_else(|| header.map(Header::block_hash));

    let point = block_id.map(|hash| Point { height, hash });

    let seen = header
        .and_then(|h| DateTime::from_timestamp(h.time.into(), 0))
        .unwrap_or_else(now);

    let is_coinbase = tx.is_coinbase();
    let mut has_op_return = false;

    let mut by_script: IndexMap<ScriptBuf, ScriptAccumulator> = IndexMap::new();

    if !is_coinbase {
        by_script = tx
            .input
            .iter()
            .enumerate()
            .fold(by_script, |mut acc, (index, input)| {
                match spending_script(input) {
                    Some(script) => acc
                        .entry(script)
                        .or_default()
                        .spent
                        .push((input.previous_output, index as u32)),
                    None => trace!(%tx_id, index, "input spends an unrecognised script"),
                }

                acc
            });
    }

    for (vout, output) in tx.output.iter().enumerate() {
        if is_null_data(&output.script_pubkey) {
            has_op_return = true;
            continue;
        }

        by_script
            .entry(output.script_pubkey.clone())
            .or_default()
            .received
            .push(Coin::new(OutPoint::new(tx_id, vout as u32), output.clone()));
    }

    by_script
        .into_iter()
        .map(|(script, acc)| {
            let mut change = OrderedBalanceChange::for_script(&script, tx_id, point, seen);

            change.is_coinbase = is_coinbase;
            change.has_op_return = has_op_return;

            for (outpoint, index) in acc.spent {
                change.spent_outpoints.push(outpoint);
                change.spent_indices.push(index);
            }

            for coin in acc.received {
                change.received_coins.insert(coin);
            }

            change
        })
        .collect()
}

/// Unconfirmed script balances of a loose transaction
pub fn extract_script_balances_for(tx: &Transaction) -> Vec<OrderedBalanceChange> {
    extract_script_balances(None, tx, None, None, 0)
}

/// Split a transaction into one balance change per wallet with a rule matching any of its
/// scripts
pub fn extract_wallet_balances<R>(
    tx_id: Option<Txid>,
    tx: &Transaction,
    block_id: Option<BlockHash>,
    header: Option<&Header>,
    height: BlockHeight,
    rules: &R,
) -> Vec<OrderedBalanceChange>
where
    R: WalletRules + ?Sized,
{
    let scripts = extract_script_balances(tx_id, tx, block_id, header, height);

    project_wallets(&scripts, rules)
}

/// Merge script-level changes into per-wallet changes
pub fn project_wallets<R>(scripts: &[OrderedBalanceChange], rules: &R) -> Vec<OrderedBalanceChange>
where
    R: WalletRules + ?Sized,
{
    let mut wallets: IndexMap<String, OrderedBalanceChange> = IndexMap::new();

    for change in scripts {
        let Some(script) = change.script_pubkey() else {
            continue;
        };

        for entry in rules.rules_for(script) {
            wallets
                .entry(entry.wallet_id.clone())
                .or_insert_with(|| OrderedBalanceChange::for_wallet(&entry.wallet_id, change))
                .merge(change, &entry.rule);
        }
    }

    wallets
        .into_values()
        .map(|mut wallet| {
            wallet.add_redeem_info();
            wallet
        })
        .collect()
}
