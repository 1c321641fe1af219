use crate::error::CandleError;
use crate::repositories::candle_store::CandleStore;
use crate::value_objects::candle::{Candle, EmptyReference, SeriesKey};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

type Partition = Arc<RwLock<BTreeMap<DateTime<Utc>, Candle>>>;

/// Embedded candle store. Each partition has its own lock, so writers of different series never
/// contend and readers of one series proceed concurrently.
#[derive(Debug, Default)]
pub struct MemoryCandleStore {
    partitions: RwLock<HashMap<SeriesKey, Partition>>,
}

impl MemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, series: &SeriesKey) -> usize {
        self.existing(series).map_or(0, |p| p.read().len())
    }

    pub fn is_empty(&self, series: &SeriesKey) -> bool {
        self.len(series) == 0
    }

    /// Every row of the partition, newest first.
    pub fn snapshot(&self, series: &SeriesKey) -> Vec<Candle> {
        self.existing(series)
            .map(|p| p.read().values().rev().cloned().collect())
            .unwrap_or_default()
    }

    fn existing(&self, series: &SeriesKey) -> Option<Partition> {
        self.partitions.read().get(series).cloned()
    }

    fn partition(&self, series: &SeriesKey) -> Partition {
        if let Some(partition) = self.existing(series) {
            return partition;
        }
        self.partitions
            .write()
            .entry(series.clone())
            .or_default()
            .clone()
    }
}

impl CandleStore for MemoryCandleStore {
    fn bulk_insert_ignore_duplicates(
        &self,
        series: &SeriesKey,
        candles: &[Candle],
    ) -> Result<u64, CandleError> {
        if let Some(foreign) = candles.iter().find(|c| !series.owns(c)) {
            return Err(CandleError::Store(format!(
                "candle for {} in a batch for {series}",
                foreign.series()
            )));
        }
        if candles.is_empty() {
            return Ok(0);
        }

        let partition = self.partition(series);
        let mut rows = partition.write();
        let mut inserted = 0u64;
        for candle in candles {
            if rows.contains_key(&candle.open_time) {
                continue;
            }
            rows.insert(candle.open_time, candle.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    fn range_query(
        &self,
        series: &SeriesKey,
        newest: DateTime<Utc>,
        oldest: DateTime<Utc>,
    ) -> Result<Vec<Candle>, CandleError> {
        if newest < oldest {
            return Ok(Vec::new());
        }
        Ok(self
            .existing(series)
            .map(|p| p.read().range(oldest..=newest).rev().map(|(_, c)| c.clone()).collect())
            .unwrap_or_default())
    }

    fn count_in_range(
        &self,
        series: &SeriesKey,
        newest: DateTime<Utc>,
        oldest: DateTime<Utc>,
    ) -> Result<u64, CandleError> {
        if newest < oldest {
            return Ok(0);
        }
        Ok(self
            .existing(series)
            .map_or(0, |p| p.read().range(oldest..=newest).count() as u64))
    }

    fn point_lookup(
        &self,
        series: &SeriesKey,
        open_time: DateTime<Utc>,
    ) -> Result<Option<Candle>, CandleError> {
        Ok(self
            .existing(series)
            .and_then(|p| p.read().get(&open_time).cloned()))
    }

    fn bulk_update_reference(
        &self,
        series: &SeriesKey,
        marker: &str,
        anchor: DateTime<Utc>,
    ) -> Result<u64, CandleError> {
        let Some(partition) = self.existing(series) else {
            return Ok(0);
        };
        let mut rows = partition.write();
        let mut updated = 0u64;
        for candle in rows.values_mut() {
            if candle.pending_marker() == Some(marker) {
                candle.empty_reference = Some(EmptyReference::Anchor(anchor));
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_objects::interval::Interval;
    use chrono::TimeZone;

    fn series() -> SeriesKey {
        SeriesKey::new("BTC-USDT", Interval::Minute1)
    }

    fn candle(minute: u32, close: f64) -> Candle {
        Candle {
            instrument: "BTC-USDT".to_string(),
            interval: Interval::Minute1,
            open_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            quote_volume: close,
            trade_count: Some(1),
            empty_reference: None,
        }
    }

    #[test]
    fn insert_is_idempotent_and_never_overwrites() {
        let store = MemoryCandleStore::new();
        let first = vec![candle(0, 1.0), candle(1, 2.0)];
        assert_eq!(store.bulk_insert_ignore_duplicates(&series(), &first).unwrap(), 2);
        assert_eq!(store.bulk_insert_ignore_duplicates(&series(), &first).unwrap(), 0);

        let replaced = vec![candle(1, 99.0)];
        assert_eq!(store.bulk_insert_ignore_duplicates(&series(), &replaced).unwrap(), 0);
        let kept = store
            .point_lookup(&series(), candle(1, 0.0).open_time)
            .unwrap()
            .unwrap();
        assert_eq!(kept.close, 2.0);
        assert_eq!(store.len(&series()), 2);
    }

    #[test]
    fn range_query_is_inclusive_and_newest_first() {
        let store = MemoryCandleStore::new();
        let rows: Vec<Candle> = (0..10).map(|m| candle(m, m as f64)).collect();
        store.bulk_insert_ignore_duplicates(&series(), &rows).unwrap();

        let newest = rows[7].open_time;
        let oldest = rows[3].open_time;
        let got = store.range_query(&series(), newest, oldest).unwrap();
        let minutes: Vec<f64> = got.iter().map(|c| c.close).collect();
        assert_eq!(minutes, vec![7.0, 6.0, 5.0, 4.0, 3.0]);
        assert_eq!(store.count_in_range(&series(), newest, oldest).unwrap(), 5);
        assert_eq!(store.count_in_range(&series(), oldest, newest).unwrap(), 0);
    }

    #[test]
    fn insert_rejects_rows_of_another_series() {
        let store = MemoryCandleStore::new();
        let mut foreign = candle(0, 1.0);
        foreign.instrument = "ETH-USDT".to_string();
        let err = store
            .bulk_insert_ignore_duplicates(&series(), &[foreign])
            .unwrap_err();
        assert!(matches!(err, CandleError::Store(_)));
    }

    #[test]
    fn bulk_update_reference_only_touches_the_marker() {
        let store = MemoryCandleStore::new();
        let anchor = candle(9, 5.0).open_time;
        let pending = |minute: u32, marker: &str| {
            let reference = EmptyReference::Pending(marker.to_string());
            Candle::filler(&series(), candle(minute, 0.0).open_time, 1.0, reference)
        };
        let fillers = vec![pending(1, "a"), pending(2, "a"), pending(5, "b")];
        store.bulk_insert_ignore_duplicates(&series(), &fillers).unwrap();

        assert_eq!(store.bulk_update_reference(&series(), "a", anchor).unwrap(), 2);
        assert_eq!(store.bulk_update_reference(&series(), "a", anchor).unwrap(), 0);
        let untouched = store
            .point_lookup(&series(), candle(5, 0.0).open_time)
            .unwrap()
            .unwrap();
        assert_eq!(untouched.pending_marker(), Some("b"));
    }
}
