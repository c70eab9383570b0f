//! Money math for trade routes: seeding paths from deposits, carrying fees
//! and prices through each hop, and splitting withdrawals back to miners.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};

use super::TradeInfo;
use crate::amount::{decimal_to_units, f64_to_decimal, require, split_proportionally, units_to_decimal};
use crate::error::{PoolError, PoolResult};
use crate::models::{BalanceInput, ExchangeInput, ExchangeTrade};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    /// Spend the base currency, receive the quote currency.
    Sell,
    /// Spend the quote currency, receive the base currency.
    Buy,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Sell => "sell",
            TradeDirection::Buy => "buy",
        }
    }
}

impl fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeDirection {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sell" => Ok(TradeDirection::Sell),
            "buy" => Ok(TradeDirection::Buy),
            other => Err(PoolError::invalid(format!("unknown trade direction {}", other))),
        }
    }
}

/// Sells are quoted in the currency received, buys in the one spent.
pub fn slippage(direction: TradeDirection, order_price: f64, fill_price: f64) -> Option<f64> {
    match direction {
        TradeDirection::Sell if order_price > 0.0 => Some((fill_price - order_price) / order_price),
        TradeDirection::Buy if fill_price > 0.0 => Some((order_price - fill_price) / fill_price),
        _ => None,
    }
}

/// Re-denominates an amount of a hop's source currency in its target
/// currency at `price`.
pub fn convert(
    value: &BigInt,
    direction: TradeDirection,
    price: f64,
    from_units: u32,
    to_units: u32,
) -> PoolResult<BigInt> {
    if value.is_zero() {
        return Ok(BigInt::zero());
    }
    if price.is_nan() || price <= 0.0 {
        return Err(PoolError::invalid(format!("cannot convert at price {}", price)));
    }
    let amount = units_to_decimal(value, from_units);
    let price = f64_to_decimal(price)?;
    let converted = match direction {
        TradeDirection::Sell => amount * price,
        TradeDirection::Buy => amount / price,
    };
    Ok(decimal_to_units(&converted, to_units))
}

/// Price of the hop's target currency in units of the path's initial
/// currency, chained across hops.
pub fn cumulative_price(previous: Option<f64>, direction: TradeDirection, fill_price: f64) -> f64 {
    let hop = match direction {
        TradeDirection::Sell => fill_price,
        TradeDirection::Buy if fill_price > 0.0 => 1.0 / fill_price,
        TradeDirection::Buy => 0.0,
    };
    previous.unwrap_or(1.0) * hop
}

/// Starting value of one conversion path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSeed {
    pub in_chain_id: String,
    pub out_chain_id: String,
    pub value: BigInt,
    /// Deposit losses (tx fee and exchange deposit fee) borne by this path,
    /// in the input currency.
    pub deposit_fees: BigInt,
}

/// Splits what the exchange credited for one input chain across that
/// chain's routes, in proportion to what each route owed.
pub fn plan_path_seeds(inputs: &[ExchangeInput], credited: &BigInt) -> PoolResult<Vec<PathSeed>> {
    let mut weights = Vec::with_capacity(inputs.len());
    let mut owed = BigInt::zero();
    for input in inputs.iter() {
        let value = require(&input.value, "exchange input value")?;
        owed += value;
        weights.push((input.out_chain_id.clone(), value.clone()));
    }
    if weights.is_empty() {
        return Ok(Vec::new());
    }

    let lost = &owed - credited;
    let lost = if lost.is_negative() { BigInt::zero() } else { lost };
    let values = split_proportionally(credited, &weights)?;
    let fees = split_proportionally(&lost, &weights)?;

    Ok(inputs
        .iter()
        .zip(values.into_iter().zip(fees))
        .map(|(input, ((_, value), (_, deposit_fees)))| PathSeed {
            in_chain_id: input.in_chain_id.clone(),
            out_chain_id: input.out_chain_id.clone(),
            value,
            deposit_fees,
        })
        .collect())
}

/// Everything recorded when a leg fills, plus what the next leg inherits.
#[derive(Debug, Clone, PartialEq)]
pub struct LegFill {
    pub proceeds: BigInt,
    pub trade_fees: BigInt,
    pub fill_price: f64,
    pub slippage: Option<f64>,
    pub cumulative_deposit_fees: BigInt,
    pub cumulative_trade_fees: BigInt,
    pub cumulative_fill_price: f64,
}

/// Carries the leg's accumulated fees into its target currency and adds the
/// fee charged on this hop.
pub fn apply_fill(
    trade: &ExchangeTrade,
    info: &TradeInfo,
    from_units: u32,
    to_units: u32,
) -> PoolResult<LegFill> {
    let direction = TradeDirection::from_str(&trade.direction)?;
    let proceeds = decimal_to_units(&info.proceeds, to_units);
    let trade_fees = decimal_to_units(&info.fees, to_units);
    let carried_deposit = trade
        .cumulative_deposit_fees
        .as_ref()
        .map(|v| v.0.clone())
        .unwrap_or_default();
    let carried_trade = trade
        .cumulative_trade_fees
        .as_ref()
        .map(|v| v.0.clone())
        .unwrap_or_default();

    Ok(LegFill {
        cumulative_deposit_fees: convert(&carried_deposit, direction, info.fill_price, from_units, to_units)?,
        cumulative_trade_fees: convert(&carried_trade, direction, info.fill_price, from_units, to_units)?
            + &trade_fees,
        cumulative_fill_price: cumulative_price(trade.cumulative_fill_price, direction, info.fill_price),
        slippage: trade
            .order_price
            .and_then(|order| slippage(direction, order, info.fill_price)),
        fill_price: info.fill_price,
        proceeds,
        trade_fees,
    })
}

/// A path's last leg, as it stands when its currency is withdrawn.
#[derive(Debug, Clone, PartialEq)]
pub struct PathResult {
    pub in_chain_id: String,
    pub proceeds: BigInt,
    pub deposit_fees: BigInt,
    pub trade_fees: BigInt,
    pub cumulative_fill_price: f64,
}

impl PathResult {
    pub fn from_final_leg(trade: &ExchangeTrade) -> PoolResult<Self> {
        Ok(PathResult {
            in_chain_id: trade.initial_chain_id.clone(),
            proceeds: require(&trade.proceeds, "trade proceeds")?.clone(),
            deposit_fees: trade
                .cumulative_deposit_fees
                .as_ref()
                .map(|v| v.0.clone())
                .unwrap_or_default(),
            trade_fees: trade
                .cumulative_trade_fees
                .as_ref()
                .map(|v| v.0.clone())
                .unwrap_or_default(),
            cumulative_fill_price: trade.cumulative_fill_price.unwrap_or(0.0),
        })
    }
}

/// Proceeds-weighted price of the withdrawn currency across paths.
pub fn weighted_fill_price(paths: &[PathResult]) -> f64 {
    let total: f64 = paths.iter().filter_map(|p| p.proceeds.to_f64()).sum();
    if total <= 0.0 {
        return 0.0;
    }
    paths
        .iter()
        .filter_map(|p| p.proceeds.to_f64().map(|w| w * p.cumulative_fill_price))
        .sum::<f64>()
        / total
}

/// One miner's settlement out of a withdrawal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditShare {
    pub balance_input_id: i64,
    pub miner_id: i64,
    pub in_chain_id: String,
    pub input_value: BigInt,
    pub value: BigInt,
    pub exchange_fees: BigInt,
}

/// Splits a withdrawal's net value across the paths that fed it (by final
/// proceeds) and then across each path's balance inputs (by input value).
/// Fees follow the same split, so every input carries its share of
/// deposit, trade and withdrawal costs in the withdrawn currency.
pub fn plan_withdrawal_credit(
    withdrawn: &BigInt,
    withdrawal_fees: &BigInt,
    paths: &[PathResult],
    inputs: &BTreeMap<String, Vec<BalanceInput>>,
) -> PoolResult<Vec<CreditShare>> {
    let net = withdrawn - withdrawal_fees;
    if net.is_negative() {
        return Err(PoolError::invalid(format!(
            "withdrawal fees {} exceed value {}",
            withdrawal_fees, withdrawn
        )));
    }

    let weights: Vec<(usize, BigInt)> = paths
        .iter()
        .enumerate()
        .map(|(i, p)| (i, p.proceeds.clone()))
        .collect();
    let path_values = split_proportionally(&net, &weights)?;
    let path_fees = split_proportionally(withdrawal_fees, &weights)?;

    let mut shares = Vec::new();
    for ((idx, path_value), (_, path_withdrawal_fee)) in path_values.into_iter().zip(path_fees) {
        let path = &paths[idx];
        let path_inputs = inputs.get(&path.in_chain_id).ok_or_else(|| {
            PoolError::invalid(format!("no balance inputs for path from {}", path.in_chain_id))
        })?;

        let mut input_weights = Vec::with_capacity(path_inputs.len());
        for input in path_inputs.iter() {
            input_weights.push((input.id, require(&input.value, "balance input value")?.clone()));
        }
        let total_fees = &path.deposit_fees + &path.trade_fees + path_withdrawal_fee;
        let values = split_proportionally(&path_value, &input_weights)?;
        let fees = split_proportionally(&total_fees, &input_weights)?;

        for ((input, (_, value)), (_, exchange_fees)) in path_inputs.iter().zip(values).zip(fees) {
            shares.push(CreditShare {
                balance_input_id: input.id,
                miner_id: input.miner_id,
                in_chain_id: input.chain_id.clone(),
                input_value: require(&input.value, "balance input value")?.clone(),
                value,
                exchange_fees,
            });
        }
    }
    Ok(shares)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDateTime;

    use super::*;
    use crate::amount::Amount;

    fn big(v: i64) -> BigInt {
        BigInt::from(v)
    }

    fn dec(v: &str) -> bigdecimal::BigDecimal {
        bigdecimal::BigDecimal::from_str(v).unwrap()
    }

    fn input(out_chain: &str, value: i64) -> ExchangeInput {
        ExchangeInput {
            id: 0,
            batch_id: 1,
            in_chain_id: "ETC".into(),
            out_chain_id: out_chain.into(),
            value: Some(Amount::from(value)),
        }
    }

    fn leg(direction: &str, order_price: f64) -> ExchangeTrade {
        ExchangeTrade {
            id: 1,
            batch_id: 1,
            path_id: 1,
            stage_id: 1,
            step_id: 1,
            exchange_trade_id: Some("t-1".into()),
            initial_chain_id: "ETC".into(),
            from_chain_id: "ETC".into(),
            to_chain_id: "BTC".into(),
            market: "ETC-BTC".into(),
            direction: direction.into(),
            value: Some(Amount::from(10i64)),
            proceeds: None,
            trade_fees: None,
            cumulative_deposit_fees: Some(Amount::from(0i64)),
            cumulative_trade_fees: None,
            order_price: Some(order_price),
            fill_price: None,
            cumulative_fill_price: None,
            slippage: None,
            initiated: true,
            filled: false,
            open: true,
            transferred: false,
            created_at: NaiveDateTime::default(),
        }
    }

    fn balance_input(id: i64, miner_id: i64, out_chain: &str, value: i64) -> BalanceInput {
        BalanceInput {
            id,
            round_id: 1,
            chain_id: "ETC".into(),
            miner_id,
            out_chain_id: out_chain.into(),
            value: Some(Amount::from(value)),
            pool_fees: Some(Amount::zero()),
            mature: true,
            pending: true,
            batch_id: Some(1),
            balance_output_id: None,
        }
    }

    #[test]
    fn slippage_signs() {
        assert_eq!(slippage(TradeDirection::Sell, 2.0, 2.2).map(|s| (s * 100.0).round()), Some(10.0));
        assert_eq!(slippage(TradeDirection::Buy, 2.2, 2.0).map(|s| (s * 100.0).round()), Some(10.0));
        assert_eq!(slippage(TradeDirection::Sell, 0.0, 1.0), None);
    }

    #[test]
    fn convert_handles_units_and_direction() {
        // 2 ETC (18 decimals) sold at 0.0005 BTC -> 0.001 BTC (8 decimals)
        let two_etc = BigInt::from_str("2000000000000000000").unwrap();
        assert_eq!(
            convert(&two_etc, TradeDirection::Sell, 0.0005, 18, 8).unwrap(),
            big(100_000)
        );
        // 0.001 BTC buying ETH at 0.05 -> 0.02 ETH
        assert_eq!(
            convert(&big(100_000), TradeDirection::Buy, 0.05, 8, 18).unwrap(),
            BigInt::from_str("20000000000000000").unwrap()
        );
        assert!(convert(&big(1), TradeDirection::Sell, 0.0, 8, 8).is_err());
        assert!(convert(&big(0), TradeDirection::Sell, 0.0, 8, 8).unwrap().is_zero());
    }

    #[test]
    fn seeds_split_credited_value_and_losses() {
        let seeds = plan_path_seeds(&[input("BTC", 10), input("ETH", 20)], &big(27)).unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!((seeds[0].value.clone(), seeds[0].deposit_fees.clone()), (big(9), big(1)));
        assert_eq!((seeds[1].value.clone(), seeds[1].deposit_fees.clone()), (big(18), big(2)));
    }

    #[test]
    fn fill_carries_fees_into_target_units() {
        let mut trade = leg("sell", 2.0);
        trade.cumulative_deposit_fees = Some(Amount::from(5i64));
        let fill = apply_fill(
            &trade,
            &TradeInfo {
                completed: true,
                proceeds: dec("19.8"),
                fees: dec("0.2"),
                fill_price: 2.0,
            },
            0,
            1,
        )
        .unwrap();
        assert_eq!(fill.proceeds, big(198));
        assert_eq!(fill.trade_fees, big(2));
        // 5 units at price 2 with one extra decimal in the target currency
        assert_eq!(fill.cumulative_deposit_fees, big(100));
        assert_eq!(fill.cumulative_trade_fees, big(2));
        assert_eq!(fill.slippage, Some(0.0));
        assert_eq!(fill.cumulative_fill_price, 2.0);
    }

    #[test]
    fn second_hop_rescales_first_hop_fees() {
        let mut trade = leg("buy", 4.0);
        trade.stage_id = 2;
        trade.cumulative_deposit_fees = Some(Amount::from(40i64));
        trade.cumulative_trade_fees = Some(Amount::from(8i64));
        trade.cumulative_fill_price = Some(2.0);
        let fill = apply_fill(
            &trade,
            &TradeInfo {
                completed: true,
                proceeds: dec("10"),
                fees: dec("1"),
                fill_price: 4.0,
            },
            0,
            0,
        )
        .unwrap();
        assert_eq!(fill.cumulative_deposit_fees, big(10));
        assert_eq!(fill.cumulative_trade_fees, big(3));
        assert_eq!(fill.cumulative_fill_price, 0.5);
        assert_eq!(fill.slippage, Some(0.0));
    }

    #[test]
    fn withdrawal_credit_is_exact_per_input() {
        let paths = vec![PathResult {
            in_chain_id: "ETC".into(),
            proceeds: big(100),
            deposit_fees: big(3),
            trade_fees: big(2),
            cumulative_fill_price: 0.1,
        }];
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "ETC".to_string(),
            vec![balance_input(7, 1, "BTC", 1), balance_input(8, 2, "BTC", 2)],
        );
        let shares = plan_withdrawal_credit(&big(100), &big(4), &paths, &inputs).unwrap();

        let values: Vec<_> = shares.iter().map(|s| (s.miner_id, s.value.clone(), s.exchange_fees.clone())).collect();
        assert_eq!(values, vec![(1, big(32), big(3)), (2, big(64), big(6))]);
        let total: BigInt = shares.iter().map(|s| &s.value).sum();
        assert_eq!(total, big(96));
    }

    #[test]
    fn withdrawal_credit_splits_across_paths_by_proceeds() {
        let paths = vec![
            PathResult {
                in_chain_id: "ETC".into(),
                proceeds: big(30),
                deposit_fees: big(0),
                trade_fees: big(0),
                cumulative_fill_price: 1.0,
            },
            PathResult {
                in_chain_id: "KAS".into(),
                proceeds: big(70),
                deposit_fees: big(0),
                trade_fees: big(0),
                cumulative_fill_price: 2.0,
            },
        ];
        let mut kas_input = balance_input(9, 3, "BTC", 500);
        kas_input.chain_id = "KAS".into();
        let mut inputs = BTreeMap::new();
        inputs.insert("ETC".to_string(), vec![balance_input(7, 1, "BTC", 5)]);
        inputs.insert("KAS".to_string(), vec![kas_input]);

        let shares = plan_withdrawal_credit(&big(100), &big(10), &paths, &inputs).unwrap();
        assert_eq!(shares[0].value, big(27));
        assert_eq!(shares[1].value, big(63));
        assert_eq!(shares[1].in_chain_id, "KAS");
        assert_eq!(weighted_fill_price(&paths), 1.7);
    }

    #[test]
    fn withdrawal_fees_above_value_are_rejected() {
        let err = plan_withdrawal_credit(&big(1), &big(2), &[], &BTreeMap::new()).unwrap_err();
        assert!(err.is_business_rule());
    }
}
