use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const SECONDS_PER_DAY: i64 = 86_400;
const SECONDS_PER_WEEK: i64 = 7 * SECONDS_PER_DAY;
// 1970-01-01 was a Thursday; weeks are aligned to Monday 00:00 UTC.
const WEEK_ALIGN_OFFSET: i64 = 3 * SECONDS_PER_DAY;

/// Candle interval. Sub-month intervals tick on a fixed number of seconds; months and years
/// tick on calendar boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Interval {
    Second1,
    Minute1,
    Minute3,
    Minute5,
    Minute15,
    Minute30,
    Hour1,
    Hour2,
    Hour4,
    Hour6,
    Hour8,
    Hour12,
    Day1,
    Week1,
    Month1,
    Year1,
}

impl Interval {
    pub const ALL: [Interval; 16] = [
        Interval::Second1,
        Interval::Minute1,
        Interval::Minute3,
        Interval::Minute5,
        Interval::Minute15,
        Interval::Minute30,
        Interval::Hour1,
        Interval::Hour2,
        Interval::Hour4,
        Interval::Hour6,
        Interval::Hour8,
        Interval::Hour12,
        Interval::Day1,
        Interval::Week1,
        Interval::Month1,
        Interval::Year1,
    ];

    pub fn parse(value: &str) -> Result<Self, String> {
        let normalized = value.trim().to_lowercase();
        let interval = match normalized.as_str() {
            "1s" | "1sec" | "1second" => Interval::Second1,
            "1m" | "1min" => Interval::Minute1,
            "3m" | "3min" => Interval::Minute3,
            "5m" | "5min" => Interval::Minute5,
            "15m" | "15min" => Interval::Minute15,
            "30m" | "30min" => Interval::Minute30,
            "1h" | "1hour" => Interval::Hour1,
            "2h" | "2hour" => Interval::Hour2,
            "4h" | "4hour" => Interval::Hour4,
            "6h" | "6hour" => Interval::Hour6,
            "8h" | "8hour" => Interval::Hour8,
            "12h" | "12hour" => Interval::Hour12,
            "1d" | "1day" => Interval::Day1,
            "1w" | "1week" => Interval::Week1,
            "1mo" | "1month" => Interval::Month1,
            "1y" | "1year" => Interval::Year1,
            _ => return Err(format!("unsupported interval: {value}")),
        };
        Ok(interval)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Interval::Second1 => "1s",
            Interval::Minute1 => "1min",
            Interval::Minute3 => "3min",
            Interval::Minute5 => "5min",
            Interval::Minute15 => "15min",
            Interval::Minute30 => "30min",
            Interval::Hour1 => "1hour",
            Interval::Hour2 => "2hour",
            Interval::Hour4 => "4hour",
            Interval::Hour6 => "6hour",
            Interval::Hour8 => "8hour",
            Interval::Hour12 => "12hour",
            Interval::Day1 => "1day",
            Interval::Week1 => "1week",
            Interval::Month1 => "1month",
            Interval::Year1 => "1year",
        }
    }

    /// Nominal duration of one tick. Months count as 30 days and years as 365 days.
    pub fn nominal_seconds(&self) -> i64 {
        match self {
            Interval::Month1 => 30 * SECONDS_PER_DAY,
            Interval::Year1 => 365 * SECONDS_PER_DAY,
            _ => self.fixed_seconds().unwrap_or(60),
        }
    }

    /// Largest spacing between two stored candles that still counts as contiguous.
    pub fn gap_threshold(&self) -> Duration {
        Duration::milliseconds(self.nominal_seconds() * 1500)
    }

    pub fn is_calendar(&self) -> bool {
        matches!(self, Interval::Month1 | Interval::Year1)
    }

    fn fixed_seconds(&self) -> Option<i64> {
        let seconds = match self {
            Interval::Second1 => 1,
            Interval::Minute1 => 60,
            Interval::Minute3 => 180,
            Interval::Minute5 => 300,
            Interval::Minute15 => 900,
            Interval::Minute30 => 1800,
            Interval::Hour1 => 3600,
            Interval::Hour2 => 7200,
            Interval::Hour4 => 14_400,
            Interval::Hour6 => 21_600,
            Interval::Hour8 => 28_800,
            Interval::Hour12 => 43_200,
            Interval::Day1 => SECONDS_PER_DAY,
            Interval::Week1 => SECONDS_PER_WEEK,
            Interval::Month1 | Interval::Year1 => return None,
        };
        Some(seconds)
    }

    fn months_per_tick(&self) -> i64 {
        match self {
            Interval::Year1 => 12,
            _ => 1,
        }
    }

    /// Floors `ts` onto the interval grid.
    pub fn align(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let aligned = match self {
            Interval::Month1 => Utc
                .with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0)
                .single(),
            Interval::Year1 => Utc.with_ymd_and_hms(ts.year(), 1, 1, 0, 0, 0).single(),
            Interval::Week1 => {
                let shifted = ts.timestamp() + WEEK_ALIGN_OFFSET;
                let floored = shifted - shifted.rem_euclid(SECONDS_PER_WEEK) - WEEK_ALIGN_OFFSET;
                Utc.timestamp_opt(floored, 0).single()
            }
            _ => {
                let step = self.nominal_seconds();
                let secs = ts.timestamp();
                Utc.timestamp_opt(secs - secs.rem_euclid(step), 0).single()
            }
        };
        aligned.unwrap_or(ts)
    }

    pub fn is_aligned(&self, ts: DateTime<Utc>) -> bool {
        self.align(ts) == ts
    }

    /// Moves an aligned timestamp by `ticks` (negative goes back in time). Returns `None` when
    /// the result falls outside the representable range.
    pub fn step(&self, ts: DateTime<Utc>, ticks: i64) -> Option<DateTime<Utc>> {
        if let Some(seconds) = self.fixed_seconds() {
            let delta = Duration::try_seconds(ticks.checked_mul(seconds)?)?;
            return ts.checked_add_signed(delta);
        }

        let months = ticks.checked_mul(self.months_per_tick())?;
        let magnitude = u32::try_from(months.unsigned_abs()).ok()?;
        if months >= 0 {
            ts.checked_add_months(Months::new(magnitude))
        } else {
            ts.checked_sub_months(Months::new(magnitude))
        }
    }

    /// Inclusive number of ticks between two aligned timestamps, `newest >= oldest`.
    /// Non-positive when `newest < oldest`.
    pub fn ticks_between(&self, newest: DateTime<Utc>, oldest: DateTime<Utc>) -> i64 {
        match self.fixed_seconds() {
            Some(seconds) => (newest.timestamp() - oldest.timestamp()).div_euclid(seconds) + 1,
            None => {
                let index = |ts: DateTime<Utc>| i64::from(ts.year()) * 12 + i64::from(ts.month0());
                (index(newest) - index(oldest)).div_euclid(self.months_per_tick()) + 1
            }
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for Interval {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Interval::parse(value)
    }
}

impl TryFrom<String> for Interval {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Interval::parse(&value)
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.label().to_string()
    }
}
