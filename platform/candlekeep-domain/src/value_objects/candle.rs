use crate::value_objects::interval::Interval;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Partition key of the candle store: one time series per (instrument, interval).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub instrument: String,
    pub interval: Interval,
}

impl SeriesKey {
    pub fn new(instrument: impl Into<String>, interval: Interval) -> Self {
        Self {
            instrument: instrument.into(),
            interval,
        }
    }

    /// Owns both candle fields of this partition.
    pub fn owns(&self, candle: &Candle) -> bool {
        candle.instrument == self.instrument && candle.interval == self.interval
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instrument, self.interval)
    }
}

/// Back-reference carried by filler candles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyReference {
    /// Provisional group marker shared by the fillers of one fetch.
    Pending(String),
    /// `open_time` of the real candle whose prices the filler copies.
    Anchor(DateTime<Utc>),
}

impl EmptyReference {
    pub const PENDING_PREFIX: &'static str = "pending:";

    pub fn marker(&self) -> Option<&str> {
        match self {
            EmptyReference::Pending(marker) => Some(marker.as_str()),
            EmptyReference::Anchor(_) => None,
        }
    }

    pub fn anchor(&self) -> Option<DateTime<Utc>> {
        match self {
            EmptyReference::Pending(_) => None,
            EmptyReference::Anchor(ts) => Some(*ts),
        }
    }

    /// Text form persisted in the `empty_reference` column.
    pub fn encode(&self) -> String {
        match self {
            EmptyReference::Pending(marker) => format!("{}{}", Self::PENDING_PREFIX, marker),
            EmptyReference::Anchor(ts) => ts.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn decode(raw: &str) -> Result<Self, String> {
        if let Some(marker) = raw.strip_prefix(Self::PENDING_PREFIX) {
            if marker.is_empty() {
                return Err("empty group marker".to_string());
            }
            return Ok(EmptyReference::Pending(marker.to_string()));
        }
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| EmptyReference::Anchor(dt.with_timezone(&Utc)))
            .map_err(|_| format!("invalid empty reference: {raw}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument: String,
    pub interval: Interval,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trade_count: Option<i64>,
    pub empty_reference: Option<EmptyReference>,
}

impl Candle {
    /// Synthetic candle for a bucket without trades: flat at `carried_close`, zero volume.
    pub fn filler(
        series: &SeriesKey,
        open_time: DateTime<Utc>,
        carried_close: f64,
        reference: EmptyReference,
    ) -> Self {
        Self {
            instrument: series.instrument.clone(),
            interval: series.interval,
            open_time,
            open: carried_close,
            high: carried_close,
            low: carried_close,
            close: carried_close,
            volume: 0.0,
            quote_volume: 0.0,
            trade_count: Some(0),
            empty_reference: Some(reference),
        }
    }

    pub fn is_filler(&self) -> bool {
        self.empty_reference.is_some()
    }

    pub fn pending_marker(&self) -> Option<&str> {
        self.empty_reference.as_ref().and_then(EmptyReference::marker)
    }

    pub fn series(&self) -> SeriesKey {
        SeriesKey::new(self.instrument.clone(), self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn empty_reference_encoding_round_trips() {
        let pending = EmptyReference::Pending("1min:1704067200".to_string());
        assert_eq!(pending.encode(), "pending:1min:1704067200");
        assert_eq!(EmptyReference::decode(&pending.encode()).unwrap(), pending);

        let anchor = EmptyReference::Anchor(Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap());
        assert_eq!(anchor.encode(), "2024-01-01T00:05:00Z");
        assert_eq!(EmptyReference::decode(&anchor.encode()).unwrap(), anchor);

        assert!(EmptyReference::decode("pending:").is_err());
        assert!(EmptyReference::decode("garbage").is_err());
    }

    #[test]
    fn filler_carries_close_forward_with_zero_volume() {
        let series = SeriesKey::new("BTC-USDT", Interval::Minute1);
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let filler = Candle::filler(
            &series,
            ts,
            42.5,
            EmptyReference::Pending("grp".to_string()),
        );
        assert!(filler.is_filler());
        assert_eq!(filler.pending_marker(), Some("grp"));
        assert_eq!(filler.high, 42.5);
        assert_eq!(filler.volume, 0.0);
        assert!(series.owns(&filler));
    }
}
