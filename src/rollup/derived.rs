//! Quantities computed from rolled-up sums.

pub fn hashrate(accepted_shares: f64, adjusted_share_difficulty: f64, period_seconds: f64) -> f64 {
    if period_seconds <= 0.0 {
        return 0.0;
    }
    accepted_shares * adjusted_share_difficulty / period_seconds
}

pub fn luck(difficulty: f64, share_difficulty: f64, accepted_shares: f64) -> f64 {
    let denominator = share_difficulty * accepted_shares;
    if denominator <= 0.0 {
        return 0.0;
    }
    100.0 * difficulty / denominator
}

pub fn profitability(market_rate: f64, value: f64, block_time: f64, hashrate: f64) -> f64 {
    if block_time <= 0.0 || hashrate <= 0.0 {
        return 0.0;
    }
    market_rate * (value / block_time) / hashrate
}

pub fn uncle_rate(uncle_count: i64, count: i64) -> f64 {
    let total = count + uncle_count;
    if total <= 0 {
        return 0.0;
    }
    uncle_count as f64 / total as f64
}

/// Divides an accumulated `mean * count` back into a mean.
pub fn mean(sum: f64, count: i64) -> f64 {
    if count <= 0 {
        return 0.0;
    }
    sum / count as f64
}

pub fn average(values: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, n) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_quantities() {
        assert_eq!(hashrate(900.0, 4.0, 900.0), 4.0);
        assert_eq!(luck(100.0, 4.0, 50.0), 50.0);
        assert_eq!(luck(100.0, 4.0, 0.0), 0.0);
        assert_eq!(profitability(2.0, 10.0, 5.0, 4.0), 1.0);
        assert_eq!(uncle_rate(1, 3), 0.25);
        assert_eq!(uncle_rate(0, 0), 0.0);
        assert_eq!(mean(30.0, 3), 10.0);
        assert_eq!(average(vec![1.0, 2.0, 6.0]), 3.0);
        assert_eq!(average(Vec::<f64>::new()), 0.0);
    }
}
