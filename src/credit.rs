//! PPLNS distribution of a round's value across its share snapshot.

use std::collections::{BTreeMap, HashMap};

use num_bigint::BigInt;
use num_traits::{Signed, Zero};

use crate::amount::{percent_of, require, split_proportionally};
use crate::error::{PoolError, PoolResult};
use crate::models::{Round, Share};

#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
    pub miner_id: i64,
    pub fee_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditEntry {
    pub miner_id: i64,
    pub out_chain_id: String,
    pub value: BigInt,
    pub pool_fees: BigInt,
    /// Cross-chain credits wait for an exchange batch.
    pub pending: bool,
}

#[derive(Debug, Clone)]
pub struct CreditPlan {
    pub round_id: i64,
    pub chain_id: String,
    pub mature: bool,
    pub entries: Vec<CreditEntry>,
    /// Pool fees kept by the pool when there are no recipients.
    pub retained_fees: BigInt,
}

impl CreditPlan {
    pub fn credited(&self) -> BigInt {
        self.entries.iter().map(|e| &e.value).sum()
    }
}

fn recipient_weight(percent: f64) -> BigInt {
    BigInt::from((percent.max(0.0) * 10_000.0).round() as i64)
}

/// Splits `round.value` across the miners in `shares`, withholds
/// `pool_fee_percent` from each miner and hands the withheld total to the
/// recipients in proportion to their fee percent. The credited values plus
/// the retained fees always add up to the round value.
pub fn plan_round_credit(
    round: &Round,
    shares: &[Share],
    out_chains: &HashMap<i64, String>,
    recipients: &[Recipient],
    pool_fee_percent: f64,
) -> PoolResult<CreditPlan> {
    let value = require(&round.value, "round value")?;
    if value.is_negative() {
        return Err(PoolError::invalid(format!("round {} has negative value", round.id)));
    }

    let mut counts: BTreeMap<i64, BigInt> = BTreeMap::new();
    for share in shares.iter().filter(|s| s.count > 0) {
        *counts.entry(share.miner_id).or_insert_with(BigInt::zero) += share.count;
    }
    if counts.is_empty() {
        return Err(PoolError::invalid(format!("round {} has no shares", round.id)));
    }

    let weights: Vec<(i64, BigInt)> = counts.into_iter().collect();
    let raw = split_proportionally(value, &weights)?;

    // miner id -> (value, pool fees withheld from that miner)
    let mut receivers: BTreeMap<i64, (BigInt, BigInt)> = BTreeMap::new();
    let mut total_fees = BigInt::zero();
    for (miner_id, raw_value) in raw {
        let fee = percent_of(&raw_value, pool_fee_percent);
        total_fees += &fee;
        let entry = receivers
            .entry(miner_id)
            .or_insert_with(|| (BigInt::zero(), BigInt::zero()));
        entry.0 += &raw_value - &fee;
        entry.1 += fee;
    }

    let recipient_weights: Vec<(i64, BigInt)> = recipients
        .iter()
        .map(|r| (r.miner_id, recipient_weight(r.fee_percent)))
        .filter(|(_, w)| w.is_positive())
        .collect();

    let mut retained_fees = BigInt::zero();
    if recipient_weights.is_empty() {
        retained_fees = total_fees;
    } else if total_fees.is_positive() {
        for (miner_id, cut) in split_proportionally(&total_fees, &recipient_weights)? {
            receivers
                .entry(miner_id)
                .or_insert_with(|| (BigInt::zero(), BigInt::zero()))
                .0 += cut;
        }
    }

    let mut entries = Vec::with_capacity(receivers.len());
    for (miner_id, (value, pool_fees)) in receivers {
        if value.is_zero() {
            continue;
        }
        let out_chain_id = out_chains
            .get(&miner_id)
            .ok_or_else(|| PoolError::NotFound(format!("miner {}", miner_id)))?
            .clone();
        entries.push(CreditEntry {
            pending: out_chain_id != round.chain_id,
            miner_id,
            out_chain_id,
            value,
            pool_fees,
        });
    }

    let plan = CreditPlan {
        round_id: round.id,
        chain_id: round.chain_id.clone(),
        mature: round.mature,
        entries,
        retained_fees,
    };

    let total = plan.credited() + &plan.retained_fees;
    if &total != value {
        return Err(PoolError::invalid(format!(
            "round {} credit mismatch: {} != {}",
            round.id, total, value
        )));
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use chrono::NaiveDateTime;

    use super::*;
    use crate::amount::Amount;

    fn round(chain: &str, value: &str) -> Round {
        Round {
            id: 1,
            chain_id: chain.to_string(),
            miner_id: Some(1),
            solo: false,
            height: 100,
            hash: "0xabc".into(),
            nonce: None,
            value: Some(Amount::from_str(value).unwrap()),
            difficulty: 1.0,
            accepted_shares: 0,
            rejected_shares: 0,
            invalid_shares: 0,
            luck: 0.0,
            pending: false,
            uncle: false,
            orphan: false,
            mature: true,
            spent: false,
            coinbase_txid: None,
            epoch_height: None,
            uncle_height: None,
            created_at: NaiveDateTime::default(),
        }
    }

    fn shares(counts: &[(i64, i64)]) -> Vec<Share> {
        counts
            .iter()
            .map(|(miner_id, count)| Share {
                round_id: 1,
                miner_id: *miner_id,
                count: *count,
            })
            .collect()
    }

    fn chains(pairs: &[(i64, &str)]) -> HashMap<i64, String> {
        pairs.iter().map(|(id, c)| (*id, c.to_string())).collect()
    }

    fn big(v: &str) -> BigInt {
        BigInt::from_str(v).unwrap()
    }

    #[test]
    fn same_chain_credit_withholds_pool_fee() {
        let plan = plan_round_credit(
            &round("ETC", "2000000000000000000"),
            &shares(&[(1, 100)]),
            &chains(&[(1, "ETC")]),
            &[],
            1.0,
        )
        .unwrap();

        assert_eq!(
            plan.entries,
            vec![CreditEntry {
                miner_id: 1,
                out_chain_id: "ETC".into(),
                value: big("1980000000000000000"),
                pool_fees: big("20000000000000000"),
                pending: false,
            }]
        );
        assert_eq!(plan.retained_fees, big("20000000000000000"));
        assert!(plan.mature);
    }

    #[test]
    fn cross_chain_credit_is_pending() {
        let plan = plan_round_credit(
            &round("ETC", "1000000000000000000000"),
            &shares(&[(2, 100)]),
            &chains(&[(2, "BTC")]),
            &[],
            1.0,
        )
        .unwrap();

        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].out_chain_id, "BTC");
        assert_eq!(plan.entries[0].value, big("990000000000000000000"));
        assert!(plan.entries[0].pending);
    }

    #[test]
    fn proportional_distribution() {
        let plan = plan_round_credit(
            &round("ETC", "100"),
            &shares(&[(1, 70), (2, 30)]),
            &chains(&[(1, "ETC"), (2, "ETC")]),
            &[],
            0.0,
        )
        .unwrap();
        let values: Vec<_> = plan.entries.iter().map(|e| (e.miner_id, e.value.clone())).collect();
        assert_eq!(values, vec![(1, big("70")), (2, big("30"))]);

        let plan = plan_round_credit(
            &round("ETC", "100"),
            &shares(&[(3, 1), (1, 1), (2, 1)]),
            &chains(&[(1, "ETC"), (2, "ETC"), (3, "ETC")]),
            &[],
            0.0,
        )
        .unwrap();
        let values: Vec<_> = plan.entries.iter().map(|e| (e.miner_id, e.value.clone())).collect();
        assert_eq!(values, vec![(1, big("34")), (2, big("33")), (3, big("33"))]);
    }

    #[test]
    fn fees_go_to_recipients() {
        let plan = plan_round_credit(
            &round("ETC", "1000"),
            &shares(&[(1, 1)]),
            &chains(&[(1, "ETC"), (8, "ETC"), (9, "BTC")]),
            &[
                Recipient {
                    miner_id: 8,
                    fee_percent: 0.75,
                },
                Recipient {
                    miner_id: 9,
                    fee_percent: 0.25,
                },
            ],
            10.0,
        )
        .unwrap();

        let values: Vec<_> = plan
            .entries
            .iter()
            .map(|e| (e.miner_id, e.value.clone(), e.pending))
            .collect();
        assert_eq!(
            values,
            vec![
                (1, big("900"), false),
                (8, big("75"), false),
                (9, big("25"), true),
            ]
        );
        assert!(plan.retained_fees.is_zero());
        assert_eq!(plan.credited(), big("1000"));
    }

    #[test]
    fn recipient_only_round_gets_fees_back() {
        let plan = plan_round_credit(
            &round("ETC", "1000"),
            &shares(&[(8, 1)]),
            &chains(&[(8, "ETC")]),
            &[Recipient {
                miner_id: 8,
                fee_percent: 1.0,
            }],
            1.0,
        )
        .unwrap();
        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].value, big("1000"));
        assert_eq!(plan.entries[0].pool_fees, big("10"));
    }

    #[test]
    fn rejects_empty_snapshot_and_missing_value() {
        let err = plan_round_credit(&round("ETC", "100"), &[], &chains(&[]), &[], 1.0).unwrap_err();
        assert!(err.is_business_rule());

        let mut r = round("ETC", "100");
        r.value = None;
        let err = plan_round_credit(&r, &shares(&[(1, 1)]), &chains(&[(1, "ETC")]), &[], 1.0)
            .unwrap_err();
        assert!(err.is_business_rule());
    }

    #[test]
    fn merges_duplicate_miner_rows() {
        let plan = plan_round_credit(
            &round("ETC", "90"),
            &shares(&[(1, 1), (2, 1), (1, 1)]),
            &chains(&[(1, "ETC"), (2, "ETC")]),
            &[],
            0.0,
        )
        .unwrap();
        let values: Vec<_> = plan.entries.iter().map(|e| (e.miner_id, e.value.clone())).collect();
        assert_eq!(values, vec![(1, big("60")), (2, big("30"))]);
    }
}
