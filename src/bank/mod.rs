//! Outgoing transactions: prepare, broadcast, confirm, merge.
//!
//! Every function that can broadcast runs under the chain's bank lease
//! (`bank:{chain}`); callers that prepare transactions take the same lease
//! so preparation never interleaves with a broadcast.

pub mod merge;
pub mod plan;

use std::sync::Arc;
use std::time::Duration;

use diesel::MysqlConnection;
use num_bigint::BigInt;
use tokio::time::Instant;
use tracing::{error, info, warn};

pub use plan::{PreparedTx, SpendableUtxo, UtxoSource, VirtualUtxo};

use crate::amount::require;
use crate::app_database::bank as ledger;
use crate::chains::{AccountingType, Chain, TxOutput};
use crate::context::PoolContext;
use crate::error::{PoolError, PoolResult};
use crate::locker::{Lease, Locker};
use crate::models::{self, TransactionType};

pub const BANK_LEASE_TTL: Duration = Duration::from_secs(5 * 60);

/// Takes `bank:{chain}`. `None` when another holder has it.
pub async fn obtain_bank_lease(ctx: &PoolContext, chain_id: &str) -> PoolResult<Option<Lease>> {
    ctx.locker
        .obtain(&Locker::bank_lease_name(chain_id), BANK_LEASE_TTL)
        .await
}

/// Plans one transaction per output group and writes them, their input
/// bindings and whatever `bind` adds (payout rows, deposit rows, fee
/// charges) in one DB transaction. Returns the persisted transactions with
/// their ids; empty while the chain still has an outstanding transaction.
pub async fn prepare_outgoing_txs<T, F>(
    ctx: &PoolContext,
    chain: &Arc<Chain>,
    tx_type: TransactionType,
    groups: Vec<Vec<TxOutput>>,
    bind: F,
) -> PoolResult<(Vec<(i64, PreparedTx)>, Option<T>)>
where
    F: FnOnce(&mut MysqlConnection, &[(i64, PreparedTx)]) -> PoolResult<T> + Send + 'static,
    T: Send + 'static,
{
    let node = chain.payout_node()?;
    let (unspent, rows) = ctx.db.get_bank_state(chain.id().to_string()).await?;
    let utxos = rows
        .iter()
        .map(SpendableUtxo::from_row)
        .collect::<PoolResult<Vec<_>>>()?;

    let planned = plan::plan_outgoing_txs(
        node.as_ref(),
        tx_type,
        unspent,
        utxos,
        &groups,
        chain.config.allow_remainder_output,
    )
    .await?;
    if planned.is_empty() {
        return Ok((Vec::new(), None));
    }

    let chain_id = chain.id().to_string();
    let (persisted, bound) = ctx
        .db
        .transaction(move |conn| {
            let ids = ledger::persist_prepared_txs(conn, &chain_id, &planned)?;
            let persisted: Vec<(i64, PreparedTx)> = ids.into_iter().zip(planned).collect();
            let bound = bind(conn, &persisted)?;
            Ok((persisted, bound))
        })
        .await?;

    for (id, tx) in persisted.iter() {
        info!(
            target: "bank_log",
            "{}: prepared {} tx {} ({}) value {} fee {} remainder {}",
            chain.id(),
            tx.tx_type.as_str(),
            id,
            tx.txid,
            tx.value,
            tx.fee,
            tx.remainder
        );
    }
    Ok((persisted, Some(bound)))
}

/// Checks that the ledger backs the transaction before it leaves the
/// process.
fn validate_for_broadcast(conn: &mut MysqlConnection, tx_id: i64) -> PoolResult<models::Transaction> {
    let tx = ledger::get_transaction(conn, tx_id)?;
    if tx.spent {
        return Err(PoolError::Duplicate(format!("transaction {} already broadcast", tx.id)));
    }
    let value = require(&tx.value, "transaction value")?;
    let fee = require(&tx.fee, "transaction fee")?;

    let inputs = ledger::get_input_utxos(conn, tx.id)?;
    let mut input_sum = BigInt::from(0);
    for utxo in inputs.iter() {
        input_sum += require(&utxo.value, "utxo value")?;
    }
    if &input_sum < value {
        return Err(PoolError::Overspend {
            have: input_sum,
            want: value.clone(),
        });
    }

    match tx.kind() {
        Some(TransactionType::Deposit) => {
            let deposits = ledger::sum_unregistered_deposits(conn, &tx.chain_id, &tx.txid)?;
            if &deposits != value {
                return Err(PoolError::invalid(format!(
                    "deposit tx {}: deposits {} != value {}",
                    tx.id, deposits, value
                )));
            }
        }
        Some(TransactionType::Payout) => {
            let owed = ledger::sum_payout_outputs(conn, tx.id)?;
            if &(&owed - fee) != value {
                return Err(PoolError::invalid(format!(
                    "payout tx {}: outputs {} - fee {} != value {}",
                    tx.id, owed, fee, value
                )));
            }
        }
        Some(TransactionType::Merge) => {}
        None => {
            return Err(PoolError::invalid(format!(
                "transaction {} has unknown type {}",
                tx.id, tx.tx_type
            )))
        }
    }
    Ok(tx)
}

/// Broadcasts every prepared transaction of the chain. The caller holds the
/// bank lease.
pub async fn broadcast_outgoing_txs(ctx: &PoolContext, chain: &Arc<Chain>) -> PoolResult<Vec<String>> {
    let node = chain.payout_node()?;
    let pending = ctx.db.get_unspent_transactions(chain.id().to_string()).await?;
    let mut sent = Vec::with_capacity(pending.len());

    for tx in pending {
        let tx_id = tx.id;
        let tx = match ctx
            .db
            .transaction(move |conn| validate_for_broadcast(conn, tx_id))
            .await
        {
            Ok(tx) => tx,
            Err(e) if e.is_duplicate() => continue,
            Err(e) => return Err(e),
        };

        let instant = Instant::now();
        let network_txid = match node.broadcast_tx(&tx.tx_hex).await {
            Ok(txid) => txid,
            Err(PoolError::Duplicate(_)) => {
                warn!(target: "bank_log", "{}: tx {} already known to the node", chain.id(), tx.txid);
                tx.txid.clone()
            }
            Err(e) => {
                error!(target: "bank_log", "{}: failed to broadcast tx {}: {:?}", chain.id(), tx.id, e);
                return Err(e);
            }
        };
        info!(
            target: "bank_log",
            "{}: broadcast tx {} as {} in {}ms",
            chain.id(),
            tx.id,
            network_txid,
            instant.elapsed().as_millis()
        );

        let recorded = tx.clone();
        let txid = network_txid.clone();
        if let Err(e) = ctx
            .db
            .transaction(move |conn| ledger::mark_broadcast(conn, &recorded, &txid))
            .await
        {
            // The chain has the tx; the ledger must catch up by hand.
            error!(
                target: "bank_log",
                "{}: tx {} broadcast as {} but not recorded: {:?}",
                chain.id(),
                tx.id,
                network_txid,
                e
            );
            ctx.notifier.alert(format!(
                "{}: tx {} broadcast as {} but not recorded: {}",
                chain.id(),
                tx.id,
                network_txid,
                e
            ));
            return Err(e);
        }

        ctx.notifier.info(format!(
            "{} {} sent: {} ({} units)",
            chain.id(),
            tx.tx_type,
            network_txid,
            tx.value.as_ref().map(|v| v.to_string()).unwrap_or_default()
        ));
        sent.push(network_txid);
    }
    Ok(sent)
}

/// Polls the node for every broadcast transaction and records the ones that
/// made it into a block.
pub async fn confirm_outgoing_txs(ctx: &PoolContext, chain: &Arc<Chain>) -> PoolResult<usize> {
    let node = chain.payout_node()?;
    let unconfirmed = ctx.db.get_unconfirmed_transactions(chain.id().to_string()).await?;
    let mut confirmed = 0;

    for tx in unconfirmed {
        let info = match node.get_tx(&tx.txid).await? {
            Some(info) if info.confirmed => info,
            _ => continue,
        };

        let fee_balance = match node.accounting_type() {
            AccountingType::Account => {
                let reserved = require(&tx.fee, "transaction fee")?;
                plan::account_fee_balance(reserved, info.fee.as_ref().map(|f| &f.0))
            }
            AccountingType::Utxo => BigInt::from(0),
        };

        let height = info.height;
        let recorded = tx.clone();
        ctx.db
            .transaction(move |conn| ledger::mark_confirmed(conn, &recorded, height, &fee_balance))
            .await?;
        info!(
            target: "bank_log",
            "{}: confirmed tx {} ({}) at height {:?}",
            chain.id(),
            tx.id,
            tx.txid,
            height
        );
        confirmed += 1;
    }
    Ok(confirmed)
}
