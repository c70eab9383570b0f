//! Monetary values in a chain's smallest unit.
//!
//! Every ledger column that carries money is an arbitrary-precision integer
//! stored as `DECIMAL(65,0)`. Values coming from exchanges are decimals in
//! whole coins and go through [`decimal_to_units`] before they touch the
//! ledger.

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::mysql::{Mysql, MysqlValue};
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::Numeric;
use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive, Zero};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{PoolError, PoolResult};

const PERCENT_SCALE: i64 = 1_000_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, AsExpression, FromSqlRow)]
#[diesel(sql_type = Numeric)]
pub struct Amount(pub BigInt);

impl Amount {
    pub fn zero() -> Self {
        Amount(BigInt::zero())
    }

    pub fn into_inner(self) -> BigInt {
        self.0
    }

    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }
}

impl Deref for Amount {
    type Target = BigInt;

    fn deref(&self) -> &BigInt {
        &self.0
    }
}

impl From<BigInt> for Amount {
    fn from(v: BigInt) -> Self {
        Amount(v)
    }
}

impl From<&BigInt> for Amount {
    fn from(v: &BigInt) -> Self {
        Amount(v.clone())
    }
}

impl From<u64> for Amount {
    fn from(v: u64) -> Self {
        Amount(BigInt::from(v))
    }
}

impl From<i64> for Amount {
    fn from(v: i64) -> Self {
        Amount(BigInt::from(v))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BigInt::from_str(s.trim())
            .map(Amount)
            .map_err(|_| PoolError::invalid(format!("invalid integer amount: {}", s)))
    }
}

impl FromSql<Numeric, Mysql> for Amount {
    fn from_sql(bytes: MysqlValue<'_>) -> deserialize::Result<Self> {
        let decimal = <BigDecimal as FromSql<Numeric, Mysql>>::from_sql(bytes)?;
        Ok(Amount(integer_part(&decimal)))
    }
}

impl ToSql<Numeric, Mysql> for Amount {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Mysql>) -> serialize::Result {
        let decimal = BigDecimal::new(self.0.clone(), 0);
        <BigDecimal as ToSql<Numeric, Mysql>>::to_sql(&decimal, &mut out.reborrow())
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Int(i64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Amount::from_str(&s).map_err(serde::de::Error::custom),
            Raw::Int(v) => Ok(Amount::from(v)),
        }
    }
}

/// Unwraps a nullable monetary column, refusing to do arithmetic on a
/// missing value.
pub fn require<'a>(value: &'a Option<Amount>, column: &str) -> PoolResult<&'a BigInt> {
    value
        .as_ref()
        .map(|v| &v.0)
        .ok_or_else(|| PoolError::invalid(format!("missing {}", column)))
}

/// Integer part of a decimal, truncated toward zero.
pub fn integer_part(value: &BigDecimal) -> BigInt {
    let (digits, scale) = value.as_bigint_and_exponent();
    if scale <= 0 {
        digits * pow10(scale.unsigned_abs())
    } else {
        digits / pow10(scale as u64)
    }
}

fn pow10(exp: u64) -> BigInt {
    num_traits::pow(BigInt::from(10), exp as usize)
}

/// Whole-coin decimal to smallest-unit integer. Digits past the chain's
/// precision are dropped (rounding toward zero).
pub fn decimal_to_units(value: &BigDecimal, units: u32) -> BigInt {
    let (digits, scale) = value.as_bigint_and_exponent();
    let shift = units as i64 - scale;
    if shift >= 0 {
        digits * pow10(shift as u64)
    } else {
        digits / pow10(shift.unsigned_abs())
    }
}

pub fn units_to_decimal(value: &BigInt, units: u32) -> BigDecimal {
    BigDecimal::new(value.clone(), units as i64)
}

pub fn parse_decimal_units(value: &str, units: u32) -> PoolResult<BigInt> {
    let decimal = BigDecimal::from_str(value.trim())
        .map_err(|_| PoolError::invalid(format!("invalid decimal amount: {}", value)))?;
    Ok(decimal_to_units(&decimal, units))
}

pub fn f64_to_decimal(value: f64) -> PoolResult<BigDecimal> {
    if !value.is_finite() {
        return Err(PoolError::invalid(format!("non-finite number: {}", value)));
    }
    BigDecimal::from_str(&format!("{}", value))
        .map_err(|_| PoolError::invalid(format!("invalid number: {}", value)))
}

/// `value * percent / 100`, truncated, with the percent resolved to
/// millionths.
pub fn percent_of(value: &BigInt, percent: f64) -> BigInt {
    let ppm = (percent * (PERCENT_SCALE as f64 / 100.0)).round() as i64;
    value * BigInt::from(ppm) / BigInt::from(PERCENT_SCALE)
}

/// Splits `total` across weighted keys so the parts add up to `total`
/// exactly. Units left over from integer division go one at a time to the
/// largest fractional parts, ties broken by ascending key.
pub fn split_proportionally<K: Ord + Clone>(
    total: &BigInt,
    weights: &[(K, BigInt)],
) -> PoolResult<Vec<(K, BigInt)>> {
    if total.is_negative() {
        return Err(PoolError::invalid("cannot split a negative amount"));
    }
    if weights.iter().any(|(_, w)| w.is_negative()) {
        return Err(PoolError::invalid("negative split weight"));
    }
    let weight_sum: BigInt = weights.iter().map(|(_, w)| w).sum();
    if weight_sum.is_zero() {
        if total.is_zero() {
            return Ok(weights.iter().map(|(k, _)| (k.clone(), BigInt::zero())).collect());
        }
        return Err(PoolError::invalid("split weights sum to zero"));
    }

    let mut parts = Vec::with_capacity(weights.len());
    let mut remainders = Vec::with_capacity(weights.len());
    let mut allocated = BigInt::zero();
    for (idx, (_, weight)) in weights.iter().enumerate() {
        let (part, rem) = (total * weight).div_rem(&weight_sum);
        allocated += &part;
        parts.push(part);
        remainders.push((rem, idx));
    }

    remainders.sort_by(|(rem_a, idx_a), (rem_b, idx_b)| {
        rem_b
            .cmp(rem_a)
            .then_with(|| weights[*idx_a].0.cmp(&weights[*idx_b].0))
    });

    let mut leftover = total - allocated;
    for (_, idx) in remainders {
        if !leftover.is_positive() {
            break;
        }
        parts[idx] += 1;
        leftover -= 1;
    }

    Ok(weights
        .iter()
        .zip(parts)
        .map(|((k, _), part)| (k.clone(), part))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big(v: i64) -> BigInt {
        BigInt::from(v)
    }

    #[test]
    fn decimal_round_trip_is_identity() {
        for (raw, units) in [
            ("1.5", 8u32),
            ("0.00000001", 8),
            ("123456789.123456789012345678", 18),
            ("0", 18),
            ("42", 0),
        ] {
            let integer = parse_decimal_units(raw, units).unwrap();
            let back = units_to_decimal(&integer, units);
            assert_eq!(back, BigDecimal::from_str(raw).unwrap(), "{}", raw);
            assert_eq!(decimal_to_units(&back, units), integer);
        }
    }

    #[test]
    fn decimal_to_units_truncates_toward_zero() {
        assert_eq!(parse_decimal_units("1.999999999", 8).unwrap(), big(199_999_999));
        assert_eq!(parse_decimal_units("-1.999999999", 8).unwrap(), big(-199_999_999));
    }

    #[test]
    fn integer_part_handles_positive_exponents() {
        let d = BigDecimal::new(big(12), -3);
        assert_eq!(integer_part(&d), big(12_000));
        assert_eq!(integer_part(&BigDecimal::from_str("7.9").unwrap()), big(7));
    }

    #[test]
    fn percent_of_one_percent() {
        let value = BigInt::from_str("2000000000000000000000").unwrap();
        assert_eq!(
            percent_of(&value, 1.0),
            BigInt::from_str("20000000000000000000").unwrap()
        );
        assert_eq!(percent_of(&big(100), 0.0), big(0));
        assert_eq!(percent_of(&big(1000), 0.25), big(2));
    }

    #[test]
    fn split_gives_leftover_to_lowest_key_on_ties() {
        let parts = split_proportionally(&big(100), &[(1, big(1)), (2, big(1)), (3, big(1))]).unwrap();
        assert_eq!(parts, vec![(1, big(34)), (2, big(33)), (3, big(33))]);
    }

    #[test]
    fn split_prefers_largest_fraction() {
        // 10 * 2/7 = 2.857, 10 * 5/7 = 7.142
        let parts = split_proportionally(&big(10), &[(1, big(2)), (2, big(5))]).unwrap();
        assert_eq!(parts, vec![(1, big(3)), (2, big(7))]);
    }

    #[test]
    fn split_exact_proportions() {
        let parts = split_proportionally(&big(100), &[(7, big(70)), (9, big(30))]).unwrap();
        assert_eq!(parts, vec![(7, big(70)), (9, big(30))]);
    }

    #[test]
    fn split_rejects_zero_weights() {
        assert!(split_proportionally(&big(5), &[(1, big(0))]).is_err());
        assert_eq!(
            split_proportionally(&big(0), &[(1, big(0))]).unwrap(),
            vec![(1, big(0))]
        );
        assert!(split_proportionally::<i64>(&big(5), &[]).is_err());
    }

    #[test]
    fn require_rejects_missing_values() {
        let missing: Option<Amount> = None;
        assert!(require(&missing, "value").unwrap_err().is_business_rule());
        let present = Some(Amount::from(5u64));
        assert_eq!(require(&present, "value").unwrap(), &big(5));
    }

    #[test]
    fn amount_serde_accepts_strings_and_ints() {
        let a: Amount = serde_json::from_str("\"123456789012345678901234\"").unwrap();
        assert_eq!(a.to_string(), "123456789012345678901234");
        let b: Amount = serde_json::from_str("42").unwrap();
        assert_eq!(b, Amount::from(42u64));
        assert_eq!(serde_json::to_string(&b).unwrap(), "\"42\"");
    }
}
