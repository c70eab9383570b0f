use chrono::{Duration, NaiveDateTime};

use crate::error::{PoolError, PoolResult};

/// Chart resolutions. Stored in the chart tables as minutes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Period {
    FifteenMinutes,
    Hour,
    FourHours,
    Day,
}

impl Period {
    pub fn minutes(&self) -> i32 {
        match self {
            Period::FifteenMinutes => 15,
            Period::Hour => 60,
            Period::FourHours => 240,
            Period::Day => 1440,
        }
    }

    pub fn from_minutes(minutes: i32) -> PoolResult<Self> {
        match minutes {
            15 => Ok(Period::FifteenMinutes),
            60 => Ok(Period::Hour),
            240 => Ok(Period::FourHours),
            1440 => Ok(Period::Day),
            other => Err(PoolError::invalid(format!("unknown chart period {}", other))),
        }
    }

    pub fn seconds(&self) -> i64 {
        self.minutes() as i64 * 60
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// How long rows of this period are kept.
    pub fn retention(&self) -> Duration {
        match self {
            Period::FifteenMinutes => Duration::days(1),
            Period::Hour => Duration::days(7),
            Period::FourHours => Duration::days(30),
            Period::Day => Duration::days(365),
        }
    }

    /// Window the `avg_*` columns are computed over.
    pub fn average_window(&self) -> Duration {
        match self {
            Period::FifteenMinutes => Duration::hours(4),
            Period::Hour => Duration::hours(8),
            Period::FourHours => Duration::days(1),
            Period::Day => Duration::days(30),
        }
    }

    /// Latest period boundary at or before `time`.
    pub fn floor(&self, time: NaiveDateTime) -> NaiveDateTime {
        let ts = time.and_utc().timestamp();
        let floored = ts - ts.rem_euclid(self.seconds());
        time - Duration::seconds(ts - floored)
    }

    /// The `(start, end)` of the row of this period that holds the instant
    /// `time`.
    pub fn containing(&self, time: NaiveDateTime) -> (NaiveDateTime, NaiveDateTime) {
        let start = self.floor(time);
        (start, start + self.duration())
    }
}

/// End-times from `last` (exclusive) to `until` (inclusive) in steps of
/// `base`, capped at `max` entries.
pub fn end_times(base: Period, last: NaiveDateTime, until: NaiveDateTime, max: usize) -> Vec<NaiveDateTime> {
    let mut times = Vec::new();
    let mut next = base.floor(last) + base.duration();
    while next <= until && times.len() < max {
        times.push(next);
        next += base.duration();
    }
    times
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn floors_to_boundaries() {
        assert_eq!(Period::FifteenMinutes.floor(at(10, 44)), at(10, 30));
        assert_eq!(Period::FourHours.floor(at(10, 44)), at(8, 0));
        assert_eq!(Period::Day.containing(at(10, 44)), (at(0, 0), at(0, 0) + Duration::days(1)));
        assert_eq!(Period::from_minutes(240).unwrap(), Period::FourHours);
        assert!(Period::from_minutes(30).is_err());
    }

    #[test]
    fn end_times_step_and_cap() {
        let times = end_times(Period::FifteenMinutes, at(10, 0), at(11, 10), 25);
        assert_eq!(times, vec![at(10, 15), at(10, 30), at(10, 45), at(11, 0)]);

        let capped = end_times(Period::FifteenMinutes, at(0, 0), at(23, 0), 25);
        assert_eq!(capped.len(), 25);
        assert_eq!(capped[24], at(6, 15));

        assert!(end_times(Period::Hour, at(10, 0), at(10, 59), 25).is_empty());
    }
}
