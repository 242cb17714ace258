//! Time axis handling for climate datasets.

use chrono::{
    DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use serde::{Deserialize, Serialize};

use crate::error::{DataError, Result};

/// Parse an ISO-8601-ish date string.
///
/// Accepts full RFC 3339, a naive datetime ("2020-05-01T06:00:00") or a
/// bare date ("2020-05-01", interpreted as midnight UTC).
pub fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&ndt));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(&format!("{s}T00:00:00"), "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&ndt));
    }
    Err(DataError::InvalidTime(s.to_string()))
}

/// Number of days in the month containing `year`/`month` (leap-year aware).
pub fn days_in_month(year: i32, month: u32) -> u32 {
    let first = NaiveDate::from_ymd_opt(year, month, 1);
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    match (first, next) {
        (Some(a), Some(b)) => (b - a).num_days() as u32,
        _ => 30,
    }
}

/// Calendar units for streaming steps and offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Hours,
    Days,
    Months,
    Years,
}

impl TimeUnit {
    /// Parse from string (case-insensitive, singular or plural).
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().trim_end_matches('s') {
            "hour" => Ok(Self::Hours),
            "day" => Ok(Self::Days),
            "month" => Ok(Self::Months),
            "year" => Ok(Self::Years),
            other => Err(DataError::UnknownFrequency(other.to_string())),
        }
    }
}

/// Shift a date forward by `n` calendar units.
pub fn shift_date(t: DateTime<Utc>, n: u32, unit: TimeUnit) -> DateTime<Utc> {
    match unit {
        TimeUnit::Hours => t + Duration::hours(n as i64),
        TimeUnit::Days => t + Duration::days(n as i64),
        TimeUnit::Months => t.checked_add_months(Months::new(n)).unwrap_or(t),
        TimeUnit::Years => t.checked_add_months(Months::new(12 * n)).unwrap_or(t),
    }
}

/// Resampling frequency for temporal aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Hourly,
    Daily,
    Monthly,
    Yearly,
}

impl Frequency {
    /// Parse a frequency string, accepting both descriptive names
    /// ("monthly", "mon") and pandas-style codes ("MS", "1D").
    pub fn parse(s: &str) -> Result<Self> {
        let stripped: String = s.chars().filter(|c| !c.is_ascii_digit()).collect();
        match stripped.trim() {
            "h" | "H" | "hour" | "hourly" => Ok(Self::Hourly),
            "d" | "D" | "day" | "daily" => Ok(Self::Daily),
            "m" | "M" | "MS" | "ME" | "mon" | "month" | "monthly" => Ok(Self::Monthly),
            "y" | "Y" | "YS" | "YE" | "yr" | "year" | "yearly" | "annual" => Ok(Self::Yearly),
            other => Err(DataError::UnknownFrequency(other.to_string())),
        }
    }

    /// Truncate a timestamp to the start of its period.
    pub fn period_start(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let d = t.date_naive();
        let naive = match self {
            Self::Hourly => d.and_hms_opt(t.time().hour(), 0, 0),
            Self::Daily => d.and_hms_opt(0, 0, 0),
            Self::Monthly => NaiveDate::from_ymd_opt(d.year(), d.month(), 1)
                .and_then(|x| x.and_hms_opt(0, 0, 0)),
            Self::Yearly => {
                NaiveDate::from_ymd_opt(d.year(), 1, 1).and_then(|x| x.and_hms_opt(0, 0, 0))
            }
        };
        match naive {
            Some(n) => Utc.from_utc_datetime(&n),
            None => t,
        }
    }

    /// Start of the period following the one beginning at `start`.
    pub fn next_period(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Hourly => start + Duration::hours(1),
            Self::Daily => start + Duration::days(1),
            Self::Monthly => shift_date(start, 1, TimeUnit::Months),
            Self::Yearly => shift_date(start, 1, TimeUnit::Years),
        }
    }

    /// Canonical length in seconds of the period starting at `start`
    /// (leap-year aware for months and years).
    pub fn period_seconds(&self, start: DateTime<Utc>) -> i64 {
        (self.next_period(start) - start).num_seconds()
    }

    /// Midpoint of the period starting at `start`, used for time centering.
    pub fn period_center(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start + Duration::seconds(self.period_seconds(start) / 2)
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        };
        write!(f, "{s}")
    }
}

/// The time coordinate of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeAxis {
    pub times: Vec<DateTime<Utc>>,
}

impl TimeAxis {
    pub fn new(times: Vec<DateTime<Utc>>) -> Self {
        Self { times }
    }

    /// Build a regular axis of `n` steps starting at `start`.
    pub fn regular(start: DateTime<Utc>, step: Duration, n: usize) -> Self {
        let times = (0..n).map(|i| start + step * i as i32).collect();
        Self { times }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn first(&self) -> Option<DateTime<Utc>> {
        self.times.first().copied()
    }

    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.times.last().copied()
    }

    /// Inferred step between consecutive entries (assumed regular).
    pub fn step(&self) -> Option<Duration> {
        if self.times.len() < 2 {
            return None;
        }
        Some(self.times[1] - self.times[0])
    }

    /// First index whose timestamp is >= `t` (or `len()` if past the end).
    pub fn lower_bound(&self, t: DateTime<Utc>) -> usize {
        self.times.partition_point(|x| *x < t)
    }

    /// Index range [lo, hi) covering timestamps in [start, end).
    pub fn window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> (usize, usize) {
        (self.lower_bound(start), self.lower_bound(end))
    }

    /// Exact position of a timestamp.
    pub fn position(&self, t: DateTime<Utc>) -> Option<usize> {
        let idx = self.lower_bound(t);
        if idx < self.times.len() && self.times[idx] == t {
            Some(idx)
        } else {
            None
        }
    }

    pub fn slice(&self, lo: usize, hi: usize) -> Self {
        Self {
            times: self.times[lo..hi.min(self.times.len())].to_vec(),
        }
    }

    /// Group indices by aggregation period. Returns (period_start, indices)
    /// pairs in chronological order.
    pub fn group_by_period(&self, freq: Frequency) -> Vec<(DateTime<Utc>, Vec<usize>)> {
        let mut groups: Vec<(DateTime<Utc>, Vec<usize>)> = Vec::new();
        for (i, t) in self.times.iter().enumerate() {
            let start = freq.period_start(*t);
            match groups.last_mut() {
                Some((s, idxs)) if *s == start => idxs.push(i),
                _ => groups.push((start, vec![i])),
            }
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> DateTime<Utc> {
        parse_date(s).unwrap()
    }

    #[test]
    fn test_parse_date_variants() {
        assert_eq!(dt("2020-05-01"), dt("2020-05-01T00:00:00"));
        assert_eq!(dt("2020-05-01T06:00:00Z"), dt("2020-05-01T06:00:00"));
        assert!(parse_date("not-a-date").is_err());
    }

    #[test]
    fn test_days_in_month_leap() {
        assert_eq!(days_in_month(2020, 2), 29);
        assert_eq!(days_in_month(2021, 2), 28);
        assert_eq!(days_in_month(2020, 12), 31);
    }

    #[test]
    fn test_frequency_parse() {
        assert_eq!(Frequency::parse("mon").unwrap(), Frequency::Monthly);
        assert_eq!(Frequency::parse("1D").unwrap(), Frequency::Daily);
        assert_eq!(Frequency::parse("MS").unwrap(), Frequency::Monthly);
        assert_eq!(Frequency::parse("yearly").unwrap(), Frequency::Yearly);
        assert!(Frequency::parse("fortnight").is_err());
    }

    #[test]
    fn test_period_start_and_length() {
        let t = dt("2020-02-15T13:30:00");
        let start = Frequency::Monthly.period_start(t);
        assert_eq!(start, dt("2020-02-01"));
        // leap February
        assert_eq!(Frequency::Monthly.period_seconds(start), 29 * 86400);
    }

    #[test]
    fn test_window_lookup() {
        let axis = TimeAxis::regular(dt("2020-05-01"), Duration::days(1), 10);
        let (lo, hi) = axis.window(dt("2020-05-03"), dt("2020-05-06"));
        assert_eq!((lo, hi), (2, 5));
        assert_eq!(axis.position(dt("2020-05-03")), Some(2));
        assert_eq!(axis.position(dt("2020-05-03T12:00:00")), None);
    }

    #[test]
    fn test_group_by_period() {
        let axis = TimeAxis::regular(dt("2020-01-30"), Duration::days(1), 5);
        let groups = axis.group_by_period(Frequency::Monthly);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].1, vec![0, 1]); // Jan 30, 31
        assert_eq!(groups[1].1, vec![2, 3, 4]); // Feb 1-3
    }

    #[test]
    fn test_shift_date_months() {
        assert_eq!(
            shift_date(dt("2020-01-31"), 1, TimeUnit::Months),
            dt("2020-02-29")
        );
        assert_eq!(
            shift_date(dt("2020-05-01"), 2, TimeUnit::Years),
            dt("2022-05-01")
        );
    }
}
