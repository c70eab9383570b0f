//! Input selection for outgoing transactions.
//!
//! Planning talks to the chain codec (to build and sign) but never to the
//! ledger; the result is written by
//! [`persist_prepared_txs`](crate::app_database::bank::persist_prepared_txs)
//! in one DB transaction.

use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use tracing::info;

use crate::amount::{require, Amount};
use crate::chains::{AccountingType, PayoutNode, TxInput, TxOutput};
use crate::error::{PoolError, PoolResult};
use crate::models::{self, TransactionType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtxoSource {
    Stored(i64),
    /// Output of a transaction planned earlier in the same call.
    Virtual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendableUtxo {
    pub source: UtxoSource,
    pub txid: String,
    pub index: u32,
    pub value: BigInt,
}

impl SpendableUtxo {
    pub fn from_row(row: &models::Utxo) -> PoolResult<Self> {
        Ok(SpendableUtxo {
            source: UtxoSource::Stored(row.id),
            txid: row.txid.clone(),
            index: row.idx,
            value: require(&row.value, "utxo value")?.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualUtxo {
    pub txid: String,
    pub index: u32,
    pub value: BigInt,
}

#[derive(Debug, Clone)]
pub struct PreparedTx {
    pub tx_type: TransactionType,
    pub txid: String,
    pub hex: String,
    /// Sum of the final outputs, change excluded.
    pub value: BigInt,
    pub fee: BigInt,
    pub remainder: BigInt,
    pub remainder_idx: Option<u32>,
    pub inputs: Vec<SpendableUtxo>,
    /// Final outputs as signed, change included.
    pub outputs: Vec<TxOutput>,
    pub self_outputs: Vec<VirtualUtxo>,
}

impl PreparedTx {
    pub fn input_sum(&self) -> BigInt {
        self.inputs.iter().map(|u| &u.value).sum()
    }

    /// Final value of the output at `index` of the requested group.
    pub fn output_value(&self, index: usize) -> Option<&BigInt> {
        self.outputs.get(index).map(|o| &o.value.0)
    }
}

fn sum_values(utxos: &[SpendableUtxo]) -> BigInt {
    utxos.iter().map(|u| &u.value).sum()
}

fn sum_outputs(outputs: &[TxOutput]) -> BigInt {
    outputs.iter().map(|o| &o.value.0).sum()
}

/// Keeps the fewest trailing inputs needed: walks from the highest index and
/// drops every UTXO the surplus can still absorb. Returns `(kept, pruned)`,
/// both in their original order.
pub fn select_inputs(
    available: Vec<SpendableUtxo>,
    target: &BigInt,
) -> PoolResult<(Vec<SpendableUtxo>, Vec<SpendableUtxo>)> {
    let total = sum_values(&available);
    if &total < target {
        return Err(PoolError::Overspend {
            have: total,
            want: target.clone(),
        });
    }

    let mut surplus = total - target;
    let mut kept = Vec::with_capacity(available.len());
    let mut pruned = Vec::new();
    for utxo in available.into_iter().rev() {
        if surplus >= utxo.value {
            surplus -= &utxo.value;
            pruned.push(utxo);
        } else {
            kept.push(utxo);
        }
    }
    kept.reverse();
    pruned.reverse();
    Ok((kept, pruned))
}

/// Builds one signed transaction per output group. Returns nothing while
/// the chain still has an outstanding transaction.
pub async fn plan_outgoing_txs(
    node: &dyn PayoutNode,
    tx_type: TransactionType,
    unspent_tx_count: i64,
    utxos: Vec<SpendableUtxo>,
    groups: &[Vec<TxOutput>],
    allow_remainder_output: bool,
) -> PoolResult<Vec<PreparedTx>> {
    if unspent_tx_count > 0 {
        info!(
            target: "bank_log",
            "{}: {} outstanding transaction(s), not preparing {}",
            node.chain(),
            unspent_tx_count,
            tx_type.as_str()
        );
        return Ok(Vec::new());
    }

    let mut available = utxos;
    let mut prepared = Vec::with_capacity(groups.len());
    for outputs in groups.iter() {
        if outputs.is_empty() {
            continue;
        }
        let target = sum_outputs(outputs);
        if !target.is_positive() {
            return Err(PoolError::invalid(format!(
                "{}: non-positive {} value {}",
                node.chain(),
                tx_type.as_str(),
                target
            )));
        }

        let (tx, rest) = match node.accounting_type() {
            AccountingType::Utxo => {
                plan_utxo_tx(node, tx_type, available, outputs, &target, allow_remainder_output).await?
            }
            AccountingType::Account => plan_account_tx(node, tx_type, available, outputs, &target).await?,
        };

        available = rest;
        available.extend(tx.self_outputs.iter().map(|v| SpendableUtxo {
            source: UtxoSource::Virtual,
            txid: v.txid.clone(),
            index: v.index,
            value: v.value.clone(),
        }));
        prepared.push(tx);
    }

    Ok(prepared)
}

async fn plan_utxo_tx(
    node: &dyn PayoutNode,
    tx_type: TransactionType,
    available: Vec<SpendableUtxo>,
    outputs: &[TxOutput],
    target: &BigInt,
    allow_remainder_output: bool,
) -> PoolResult<(PreparedTx, Vec<SpendableUtxo>)> {
    let (inputs, pruned) = select_inputs(available, target)?;
    let input_sum = sum_values(&inputs);

    let mut requested = outputs.to_vec();
    let change = &input_sum - target;
    let mut remainder_idx = None;
    if change.is_positive() && allow_remainder_output {
        remainder_idx = Some(requested.len() as u32);
        requested.push(TxOutput::new(node.address(), Amount(change)));
    }

    let tx_inputs: Vec<TxInput> = inputs
        .iter()
        .map(|u| TxInput {
            txid: u.txid.clone(),
            index: u.index,
            value: Amount(u.value.clone()),
            fee_balance: None,
        })
        .collect();
    let created = node.create_tx(&tx_inputs, &requested).await?;

    let value: BigInt = created
        .outputs
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i as u32) != remainder_idx)
        .map(|(_, o)| &o.value.0)
        .sum();
    let fee = created.fee.0.clone();
    let remainder = &input_sum - &value - &fee;
    if remainder.is_negative() {
        return Err(PoolError::Overspend {
            have: input_sum,
            want: value + fee,
        });
    }

    let self_outputs = created
        .outputs
        .iter()
        .enumerate()
        .filter(|(_, o)| o.address == node.address() && o.value.is_positive())
        .map(|(i, o)| VirtualUtxo {
            txid: created.txid.clone(),
            index: i as u32,
            value: o.value.0.clone(),
        })
        .collect();

    Ok((
        PreparedTx {
            tx_type,
            txid: created.txid,
            hex: created.hex,
            value,
            fee,
            remainder,
            remainder_idx,
            inputs,
            outputs: created.outputs,
            self_outputs,
        },
        pruned,
    ))
}

/// Account chains have no coins to pick: the whole tracked balance goes in
/// as one synthetic input and whatever is left comes back as one virtual
/// UTXO at index 0.
async fn plan_account_tx(
    node: &dyn PayoutNode,
    tx_type: TransactionType,
    available: Vec<SpendableUtxo>,
    outputs: &[TxOutput],
    target: &BigInt,
) -> PoolResult<(PreparedTx, Vec<SpendableUtxo>)> {
    let balance = sum_values(&available);
    if &balance < target {
        return Err(PoolError::Overspend {
            have: balance,
            want: target.clone(),
        });
    }

    let synthetic = TxInput {
        txid: node.address().to_string(),
        index: 0,
        value: Amount(balance.clone()),
        fee_balance: None,
    };
    let created = node.create_tx(&[synthetic], outputs).await?;

    let value: BigInt = created.outputs.iter().map(|o| &o.value.0).sum();
    let fee = created.fee.0.clone();
    let remainder = &balance - &value - &fee;
    if remainder.is_negative() {
        return Err(PoolError::Overspend {
            have: balance,
            want: value + fee,
        });
    }

    let mut self_outputs = Vec::new();
    let mut remainder_idx = None;
    if remainder.is_positive() {
        remainder_idx = Some(0);
        self_outputs.push(VirtualUtxo {
            txid: created.txid.clone(),
            index: 0,
            value: remainder.clone(),
        });
    }

    Ok((
        PreparedTx {
            tx_type,
            txid: created.txid,
            hex: created.hex,
            value,
            fee,
            remainder,
            remainder_idx,
            inputs: available,
            outputs: created.outputs,
            self_outputs,
        },
        Vec::new(),
    ))
}

/// Fee refund owed on an account chain once the actual fee is known.
pub fn account_fee_balance(reserved: &BigInt, charged: Option<&BigInt>) -> BigInt {
    match charged {
        Some(charged) if charged < reserved => reserved - charged,
        _ => BigInt::zero(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::testing::FakeNode;

    fn utxo(id: i64, value: i64) -> SpendableUtxo {
        SpendableUtxo {
            source: UtxoSource::Stored(id),
            txid: format!("coinbase-{}", id),
            index: 0,
            value: BigInt::from(value),
        }
    }

    fn pay(address: &str, value: i64) -> TxOutput {
        TxOutput::new(address, Amount::from(value))
    }

    fn ids(utxos: &[SpendableUtxo]) -> Vec<UtxoSource> {
        utxos.iter().map(|u| u.source).collect()
    }

    #[test]
    fn select_prunes_from_the_top() {
        let (kept, pruned) =
            select_inputs(vec![utxo(1, 50), utxo(2, 30), utxo(3, 40)], &BigInt::from(60)).unwrap();
        assert_eq!(ids(&kept), vec![UtxoSource::Stored(1), UtxoSource::Stored(3)]);
        assert_eq!(ids(&pruned), vec![UtxoSource::Stored(2)]);
    }

    #[test]
    fn select_single_utxo_exactly_covering() {
        let (kept, pruned) = select_inputs(vec![utxo(1, 100)], &BigInt::from(100)).unwrap();
        assert_eq!(kept.len(), 1);
        assert!(pruned.is_empty());
    }

    #[tokio::test]
    async fn overspend_is_a_business_rule_violation() {
        let node = FakeNode::new("KAS", AccountingType::Utxo);
        let err = plan_outgoing_txs(
            &node,
            TransactionType::Payout,
            0,
            vec![utxo(1, 99)],
            &[vec![pay("kaspa:miner", 100)]],
            true,
        )
        .await
        .unwrap_err();

        assert!(err.is_business_rule());
        match err {
            PoolError::Overspend { have, want } => {
                assert_eq!(have, BigInt::from(99));
                assert_eq!(want, BigInt::from(100));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(*node.counter.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn outstanding_transaction_returns_nothing() {
        let node = FakeNode::new("ETC", AccountingType::Account);
        let txs = plan_outgoing_txs(
            &node,
            TransactionType::Payout,
            1,
            vec![utxo(1, 1_000)],
            &[vec![pay("0xminer", 100)]],
            true,
        )
        .await
        .unwrap();
        assert!(txs.is_empty());
        assert_eq!(*node.counter.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn utxo_tx_adds_change_and_balances() {
        let node = FakeNode::new("KAS", AccountingType::Utxo).with_fee(2);
        let txs = plan_outgoing_txs(
            &node,
            TransactionType::Payout,
            0,
            vec![utxo(1, 60), utxo(2, 70)],
            &[vec![TxOutput::splitting_fee("kaspa:a", Amount::from(40i64)), TxOutput::splitting_fee("kaspa:b", Amount::from(40i64))]],
            true,
        )
        .await
        .unwrap();

        assert_eq!(txs.len(), 1);
        let tx = &txs[0];
        assert_eq!(ids(&tx.inputs), vec![UtxoSource::Stored(1), UtxoSource::Stored(2)]);
        assert_eq!(tx.value, BigInt::from(78));
        assert_eq!(tx.fee, BigInt::from(2));
        assert_eq!(tx.remainder, BigInt::from(50));
        assert_eq!(tx.remainder_idx, Some(2));
        assert_eq!(&tx.input_sum() - &tx.value - &tx.fee, tx.remainder);
        assert_eq!(
            tx.self_outputs,
            vec![VirtualUtxo {
                txid: "kas-tx-1".into(),
                index: 2,
                value: BigInt::from(50),
            }]
        );
    }

    #[tokio::test]
    async fn change_is_spendable_by_the_next_group() {
        let node = FakeNode::new("KAS", AccountingType::Utxo);
        let txs = plan_outgoing_txs(
            &node,
            TransactionType::Payout,
            0,
            vec![utxo(1, 100)],
            &[vec![pay("kaspa:a", 30)], vec![pay("kaspa:b", 50)]],
            true,
        )
        .await
        .unwrap();

        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].remainder, BigInt::from(70));
        let second = &txs[1];
        assert_eq!(second.inputs.len(), 1);
        assert_eq!(second.inputs[0].source, UtxoSource::Virtual);
        assert_eq!(second.inputs[0].txid, "kas-tx-1");
        assert_eq!(second.inputs[0].value, BigInt::from(70));
        assert_eq!(second.remainder, BigInt::from(20));
    }

    #[tokio::test]
    async fn pruned_inputs_carry_over() {
        let node = FakeNode::new("KAS", AccountingType::Utxo);
        let txs = plan_outgoing_txs(
            &node,
            TransactionType::Payout,
            0,
            vec![utxo(1, 40), utxo(2, 40)],
            &[vec![pay("kaspa:a", 40)], vec![pay("kaspa:b", 40)]],
            false,
        )
        .await
        .unwrap();

        assert_eq!(ids(&txs[0].inputs), vec![UtxoSource::Stored(1)]);
        assert_eq!(ids(&txs[1].inputs), vec![UtxoSource::Stored(2)]);
        assert!(txs.iter().all(|t| t.remainder.is_zero()));
    }

    #[tokio::test]
    async fn too_big_is_returned_to_the_caller() {
        let node = FakeNode::new("KAS", AccountingType::Utxo).with_max_inputs(1);
        let err = plan_outgoing_txs(
            &node,
            TransactionType::Merge,
            0,
            vec![utxo(1, 10), utxo(2, 10)],
            &[vec![pay("kas-pool", 20)]],
            false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PoolError::TxTooBig));
    }

    #[tokio::test]
    async fn account_tx_consumes_every_balance_entry() {
        let node = FakeNode::new("ETC", AccountingType::Account).with_fee(1);
        let txs = plan_outgoing_txs(
            &node,
            TransactionType::Payout,
            0,
            vec![utxo(1, 500), utxo(2, 500)],
            &[vec![TxOutput::splitting_fee("0xminer", Amount::from(300i64))]],
            true,
        )
        .await
        .unwrap();

        let tx = &txs[0];
        assert_eq!(tx.inputs.len(), 2);
        assert_eq!(tx.value, BigInt::from(299));
        assert_eq!(tx.remainder, BigInt::from(700));
        assert_eq!(tx.remainder_idx, Some(0));
        assert_eq!(tx.self_outputs[0].index, 0);
        assert_eq!(tx.self_outputs[0].value, BigInt::from(700));
    }

    #[test]
    fn account_fee_balance_refunds_overestimate() {
        assert_eq!(
            account_fee_balance(&BigInt::from(21), Some(&BigInt::from(15))),
            BigInt::from(6)
        );
        assert!(account_fee_balance(&BigInt::from(21), Some(&BigInt::from(21))).is_zero());
        assert!(account_fee_balance(&BigInt::from(21), None).is_zero());
    }
}
