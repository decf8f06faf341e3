use bitcoin::{Transaction, Txid, hashes::{Hash, hash160}};
use tracing::{debug, trace};

use crate::error::Error;

use super::{
    AssetId, AssetMoney, ColorMarker, ColoredEntry, ColoredError, ColoredTransaction,
    repository::ColoredTransactionRepository,
};

/// Upper bound on transactions colored while resolving a single request
pub const MAX_COLOR_WALK: usize = 10_000;

/// Fetch the colored data of `txid`, computing and storing it (and any uncolored ancestors) when
/// missing.
///
/// Ancestors are walked with an explicit stack. A transaction absent from the repository's
/// transactions fails with [`ColoredError::TransactionNotFound`], exceeding [`MAX_COLOR_WALK`]
/// fails with [`ColoredError::Unrecognized`].
pub async fn fetch_colored<R>(txid: Txid, repo: &R) -> Result<ColoredTransaction, Error>
where
    R: ColoredTransactionRepository + ?Sized,
{
    if let Some(colored) = repo.get_colored(&txid).await? {
        return Ok(colored);
    }

    let mut stack = vec![txid];
    let mut computed = 0;

    while let Some(&current) = stack.last() {
        if repo.get_colored(&current).await?.is_some() {
            stack.pop();
            continue;
        }

        let tx = repo
            .transactions()
            .get(&current)
            .await?
            .ok_or(ColoredError::TransactionNotFound(current))?;

        let mut input_assets = Vec::with_capacity(tx.input.len());
        let mut missing = vec![];

        if !tx.is_coinbase() {
            for input in &tx.input {
                let parent = input.previous_output;

                match repo.get_colored(&parent.txid).await? {
                    Some(colored) => input_assets.push(colored.output_asset(parent.vout)),
                    None => missing.push(parent.txid),
                }
            }
        }

        if !missing.is_empty() {
            trace!(%current, missing = missing.len(), "coloring parents first");
            stack.extend(missing);
            continue;
        }

        let colored = color_transaction(&tx, &input_assets, |prev| async move {
            let parent = repo
                .transactions()
                .get(&prev.txid)
                .await?
                .ok_or(ColoredError::TransactionNotFound(prev.txid))?;

            let output = parent
                .output
                .get(prev.vout as usize)
                .ok_or(ColoredError::Unrecognized(current))?;

            Ok::<_, Error>(AssetId(
                hash160::Hash::hash(output.script_pubkey.as_bytes()).to_byte_array(),
            ))
        })
        .await?;

        repo.put_colored(current, colored).await?;
        stack.pop();

        computed += 1;
        if computed > MAX_COLOR_WALK {
            debug!(%txid, "gave up coloring after {MAX_COLOR_WALK} transactions");
            return Err(ColoredError::Unrecognized(txid).into());
        }
    }

    repo.get_colored(&txid)
        .await?
        .ok_or_else(|| ColoredError::Unrecognized(txid).into())
}

/// Apply the Open Assets rules to `tx` given the assets held by each of its spent outputs.
///
/// `issuer` resolves the asset id issued by the transaction from its first input, it is only
/// called when the transaction issues. An invalid transaction is uncolored: every input asset is
/// destroyed.
pub async fn color_transaction<F, Fut>(
    tx: &Transaction,
    input_assets: &[Option<AssetMoney>],
    issuer: F,
) -> Result<ColoredTransaction, Error>
where
    F: FnOnce(bitcoin::OutPoint) -> Fut,
    Fut: Future<Output = Result<AssetId, Error>>,
{
    let inputs = input_assets
        .iter()
        .enumerate()
        .filter_map(|(index, asset)| {
            asset.map(|asset| ColoredEntry {
                index: index as u32,
                asset,
            })
        })
        .collect::<Vec<_>>();

    let uncolored = ColoredTransaction {
        marker: None,
        inputs: inputs.clone(),
        issuances: vec![],
        transfers: vec![],
    };

    let Some((marker_index, marker)) = tx
        .output
        .iter()
        .enumerate()
        .find_map(|(i, o)| ColorMarker::from_script(&o.script_pubkey).map(|m| (i, m)))
    else {
        return Ok(uncolored);
    };

    if marker.quantities.len() > tx.output.len() - 1 {
        return Ok(uncolored);
    }

    // output index for each quantity, skipping the marker
    let assigned = (0..tx.output.len())
        .filter(|i| *i != marker_index)
        .zip(marker.quantities.iter().copied())
        .filter(|(_, quantity)| *quantity > 0)
        .collect::<Vec<_>>();

    let issues = assigned.iter().any(|(vout, _)| *vout < marker_index);

    let issued_asset = match (issues, tx.input.first()) {
        (false, _) => None,
        (true, None) => return Ok(uncolored),
        (true, Some(first)) => Some(issuer(first.previous_output).await?),
    };

    let mut issuances = vec![];
    let mut transfers = vec![];

    let mut cursor = 0;
    let mut remaining = input_assets
        .first()
        .copied()
        .flatten()
        .map(|a| a.quantity)
        .unwrap_or_default();

    for (vout, quantity) in assigned {
        if vout < marker_index {
            let Some(asset_id) = issued_asset else {
                return Ok(uncolored);
            };

            issuances.push(ColoredEntry {
                index: vout as u32,
                asset: AssetMoney { asset_id, quantity },
            });

            continue;
        }

        let mut needed = quantity;
        let mut asset_id = None;

        while needed > 0 {
            while remaining == 0 {
                cursor += 1;

                match input_assets.get(cursor) {
                    Some(asset) => remaining = asset.map(|a| a.quantity).unwrap_or_default(),
                    None => return Ok(uncolored),
                }
            }

            let Some(input) = input_assets[cursor] else {
                return Ok(uncolored);
            };

            // one output can only hold one asset
            if asset_id.is_some_and(|id| id != input.asset_id) {
                return Ok(uncolored);
            }
            asset_id = Some(input.asset_id);

            let taken = needed.min(remaining);
            needed -= taken;
            remaining -= taken;
        }

        if let Some(asset_id) = asset_id {
            transfers.push(ColoredEntry {
                index: vout as u32,
                asset: AssetMoney { asset_id, quantity },
            });
        }
    }

    Ok(ColoredTransaction {
        marker: Some(marker),
        inputs,
        issuances,
        transfers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        colored::InMemoryColoredRepository,
        ledger::repository::{InMemoryTransactionRepository, TransactionRepository},
        test_utils::{coinbase_tx, p2pkh_script, spend_tx},
    };

    fn marker_output(quantities: Vec<u64>) -> bitcoin::TxOut {
        bitcoin::TxOut {
            value: bitcoin::Amount::ZERO,
            script_pubkey: ColorMarker {
                quantities,
                metadata: vec![],
            }
            .to_script()
            .unwrap(),
        }
    }

    #[tokio::test]
    async fn issuance_then_transfer() {
        let transactions = InMemoryTransactionRepository::new();

        let funding = coinbase_tx(vec![(p2pkh_script(1), 10_000)]);
        let funding_id = funding.compute_txid();

        // issue 100 units to output 0, marker at 1
        let mut issue = spend_tx(vec![(funding_id, 0)], vec![(p2pkh_script(2), 600)]);
        issue.output.push(marker_output(vec![100]));
        let issue_id = issue.compute_txid();

        // transfer 60 + 40, marker first
        let mut transfer = spend_tx(vec![(issue_id, 0)], vec![]);
        transfer.output.push(marker_output(vec![60, 40]));
        transfer.output.push(bitcoin::TxOut {
            value: bitcoin::Amount::from_sat(300),
            script_pubkey: p2pkh_script(3),
        });
        transfer.output.push(bitcoin::TxOut {
            value: bitcoin::Amount::from_sat(300),
            script_pubkey: p2pkh_script(4),
        });
        let transfer_id = transfer.compute_txid();

        for tx in [funding, issue, transfer] {
            transactions.put(tx.compute_txid(), tx).await.unwrap();
        }

        let repo = InMemoryColoredRepository::new(transactions);

        let colored = fetch_colored(transfer_id, &repo).await.unwrap();

        let asset_id = AssetId(hash160::Hash::hash(p2pkh_script(1).as_bytes()).to_byte_array());

        assert_eq!(colored.inputs.len(), 1);
        assert_eq!(colored.inputs[0].asset, AssetMoney { asset_id, quantity: 100 });
        assert_eq!(colored.output_asset(1), Some(AssetMoney { asset_id, quantity: 60 }));
        assert_eq!(colored.output_asset(2), Some(AssetMoney { asset_id, quantity: 40 }));

        // ancestors were cached along the way
        assert!(repo.get_colored(&issue_id).await.unwrap().is_some());
        assert!(repo.get_colored(&funding_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn overspending_transfer_is_uncolored() {
        let transactions = InMemoryTransactionRepository::new();

        let funding = coinbase_tx(vec![(p2pkh_script(1), 10_000)]);
        let funding_id = funding.compute_txid();

        let mut issue = spend_tx(vec![(funding_id, 0)], vec![(p2pkh_script(2), 600)]);
        issue.output.push(marker_output(vec![10]));
        let issue_id = issue.compute_txid();

        let mut transfer = spend_tx(vec![(issue_id, 0)], vec![]);
        transfer.output.push(marker_output(vec![11]));
        transfer.output.push(bitcoin::TxOut {
            value: bitcoin::Amount::from_sat(300),
            script_pubkey: p2pkh_script(3),
        });
        let transfer_id = transfer.compute_txid();

        for tx in [funding, issue, transfer] {
            transactions.put(tx.compute_txid(), tx).await.unwrap();
        }

        let repo = InMemoryColoredRepository::new(transactions);
        let colored = fetch_colored(transfer_id, &repo).await.unwrap();

        assert!(colored.marker.is_none());
        assert!(colored.transfers.is_empty());
        // the input asset is destroyed
        assert_eq!(colored.inputs.len(), 1);
    }

    #[tokio::test]
    async fn missing_ancestor_is_reported() {
        let transactions = InMemoryTransactionRepository::new();

        let orphan = spend_tx(vec![(Txid::all_zeros(), 0)], vec![(p2pkh_script(1), 1)]);
        let orphan_id = orphan.compute_txid();
        transactions.put(orphan_id, orphan).await.unwrap();

        let repo = InMemoryColoredRepository::new(transactions);

        assert!(matches!(
            fetch_colored(orphan_id, &repo).await,
            Err(Error::Colored(ColoredError::TransactionNotFound(_)))
        ));
    }
}
