use crate::error::CandleError;
use crate::repositories::candle_store::CandleStore;
use crate::value_objects::candle::{Candle, EmptyReference, SeriesKey};
use crate::value_objects::range::CandleRange;
use chrono::{DateTime, Utc};

/// Outcome of one resolver pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ResolveReport {
    pub groups_examined: usize,
    pub groups_resolved: usize,
    pub rows_updated: u64,
    pub error: Option<CandleError>,
}

/// Rewires pending filler groups to the real candle that immediately follows them in store
/// order, the older candle their prices were copied from.
pub struct EmptyCandleResolver<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: CandleStore + ?Sized> EmptyCandleResolver<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Resolves every pending group with a member inside `window` or on the tick just above it.
    /// Never fails: store errors end the pass early and are returned inside the report.
    pub fn resolve(&self, series: &SeriesKey, window: &CandleRange) -> ResolveReport {
        let span = tracing::debug_span!(
            "domain.resolver.resolve",
            series = %series,
            start = %window.start,
            end = %window.end
        );
        let _enter = span.enter();

        let mut report = ResolveReport::default();
        if let Err(err) = self.resolve_inner(series, window, &mut report) {
            let err = match err {
                CandleError::Resolver(_) => err,
                other => CandleError::Resolver(other.to_string()),
            };
            tracing::debug!(error = %err, "empty candle resolution aborted");
            metrics::counter!("candlekeep.domain.resolver.errors_total").increment(1);
            report.error = Some(err);
        }

        metrics::counter!("candlekeep.domain.resolver.rows_updated_total")
            .increment(report.rows_updated);
        if report.groups_examined > 0 {
            tracing::debug!(
                examined = report.groups_examined,
                resolved = report.groups_resolved,
                rows = report.rows_updated,
                "empty candle groups processed"
            );
        }
        report
    }

    fn resolve_inner(
        &self,
        series: &SeriesKey,
        window: &CandleRange,
        report: &mut ResolveReport,
    ) -> Result<(), CandleError> {
        // A group left at the bottom of the previous chunk ends one tick above this window.
        let top = series.interval.step(window.start, 1).unwrap_or(window.start);
        let rows = self.store.range_query(series, top, window.end)?;

        // Rows are newest first: the last sighting of a marker is its oldest member in view.
        let mut groups: Vec<(String, DateTime<Utc>)> = Vec::new();
        for row in &rows {
            if let Some(marker) = row.pending_marker() {
                match groups.iter().position(|(m, _)| m == marker) {
                    Some(idx) => groups[idx].1 = row.open_time,
                    None => groups.push((marker.to_string(), row.open_time)),
                }
            }
        }

        // Oldest group first, so a newer group can adopt the anchor its neighbour just got.
        for (marker, oldest_in_view) in groups.into_iter().rev() {
            report.groups_examined += 1;
            let Some(neighbour) = self.neighbour_below(series, &marker, oldest_in_view)? else {
                continue;
            };
            let anchor = match &neighbour.empty_reference {
                None => neighbour.open_time,
                Some(EmptyReference::Anchor(anchor)) => *anchor,
                Some(EmptyReference::Pending(_)) => continue,
            };
            let updated = self.store.bulk_update_reference(series, &marker, anchor)?;
            report.groups_resolved += 1;
            report.rows_updated += updated;
            tracing::debug!(marker = %marker, anchor = %anchor, updated, "filler group resolved");
        }
        Ok(())
    }

    /// Candle directly below the oldest member of the group, following members that extend
    /// past the window.
    fn neighbour_below(
        &self,
        series: &SeriesKey,
        marker: &str,
        mut oldest: DateTime<Utc>,
    ) -> Result<Option<Candle>, CandleError> {
        loop {
            let next = series.interval.step(oldest, -1).ok_or_else(|| {
                CandleError::Resolver(format!("cannot step below {oldest} for {series}"))
            })?;
            match self.store.point_lookup(series, next)? {
                Some(candle) if candle.pending_marker() == Some(marker) => oldest = next,
                other => return Ok(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::memory::MemoryCandleStore;
    use crate::value_objects::interval::Interval;
    use chrono::{Duration, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn series() -> SeriesKey {
        SeriesKey::new("BTC-USDT", Interval::Minute1)
    }

    fn at(minute: i64) -> DateTime<Utc> {
        base() + Duration::minutes(minute)
    }

    fn real(minute: i64) -> Candle {
        Candle {
            instrument: "BTC-USDT".to_string(),
            interval: Interval::Minute1,
            open_time: at(minute),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            quote_volume: 1.0,
            trade_count: None,
            empty_reference: None,
        }
    }

    fn pending(minute: i64, marker: &str) -> Candle {
        Candle::filler(
            &series(),
            at(minute),
            1.0,
            EmptyReference::Pending(marker.to_string()),
        )
    }

    fn window(newest: i64, oldest: i64) -> CandleRange {
        CandleRange::new(Interval::Minute1, at(newest), at(oldest)).unwrap()
    }

    #[test]
    fn group_without_an_older_neighbour_stays_pending() {
        let store = MemoryCandleStore::new();
        let mut rows: Vec<Candle> = (0..3).map(|m| pending(m, "g")).collect();
        rows.push(real(3));
        store.bulk_insert_ignore_duplicates(&series(), &rows).unwrap();

        let report = EmptyCandleResolver::new(&store).resolve(&series(), &window(9, 0));
        assert_eq!(report.groups_examined, 1);
        assert_eq!(report.groups_resolved, 0);
        assert_eq!(report.rows_updated, 0);
        assert!(report.error.is_none());
    }

    #[test]
    fn group_is_linked_to_the_candle_below_it_not_above() {
        let store = MemoryCandleStore::new();
        let mut rows: Vec<Candle> = (1..6).map(|m| pending(m, "g")).collect();
        rows.push(real(0));
        rows.push(real(6));
        store.bulk_insert_ignore_duplicates(&series(), &rows).unwrap();

        let report = EmptyCandleResolver::new(&store).resolve(&series(), &window(6, 0));
        assert_eq!(report.groups_resolved, 1);
        assert_eq!(report.rows_updated, 5);
        for minute in 1..6 {
            let row = store.point_lookup(&series(), at(minute)).unwrap().unwrap();
            assert_eq!(row.empty_reference, Some(EmptyReference::Anchor(at(0))));
        }
    }

    #[test]
    fn group_extending_below_the_window_is_followed() {
        let store = MemoryCandleStore::new();
        let mut rows: Vec<Candle> = (1..7).map(|m| pending(m, "g")).collect();
        rows.push(real(0));
        store.bulk_insert_ignore_duplicates(&series(), &rows).unwrap();

        let report = EmptyCandleResolver::new(&store).resolve(&series(), &window(6, 4));
        assert_eq!(report.groups_resolved, 1);
        assert_eq!(report.rows_updated, 6);
        let member = store.point_lookup(&series(), at(6)).unwrap().unwrap();
        assert_eq!(member.empty_reference, Some(EmptyReference::Anchor(at(0))));
    }

    #[test]
    fn group_just_above_the_window_is_picked_up() {
        let store = MemoryCandleStore::new();
        let mut rows: Vec<Candle> = (10..12).map(|m| pending(m, "upper")).collect();
        rows.extend((5..10).map(real));
        store.bulk_insert_ignore_duplicates(&series(), &rows).unwrap();

        let report = EmptyCandleResolver::new(&store).resolve(&series(), &window(9, 5));
        assert_eq!(report.groups_examined, 1);
        assert_eq!(report.rows_updated, 2);
        let row = store.point_lookup(&series(), at(11)).unwrap().unwrap();
        assert_eq!(row.empty_reference, Some(EmptyReference::Anchor(at(9))));
    }

    #[test]
    fn newer_group_adopts_the_anchor_of_a_resolved_neighbour() {
        let store = MemoryCandleStore::new();
        let rows = vec![
            real(0),
            pending(1, "old"),
            pending(2, "old"),
            pending(3, "new"),
            pending(4, "new"),
        ];
        store.bulk_insert_ignore_duplicates(&series(), &rows).unwrap();

        let report = EmptyCandleResolver::new(&store).resolve(&series(), &window(4, 0));
        assert_eq!(report.groups_examined, 2);
        assert_eq!(report.groups_resolved, 2);
        assert_eq!(report.rows_updated, 4);
        for minute in 1..5 {
            let row = store.point_lookup(&series(), at(minute)).unwrap().unwrap();
            assert_eq!(row.empty_reference, Some(EmptyReference::Anchor(at(0))));
        }
    }

    #[test]
    fn a_pending_neighbour_blocks_resolution() {
        let store = MemoryCandleStore::new();
        let rows = vec![pending(0, "old"), pending(1, "new")];
        store.bulk_insert_ignore_duplicates(&series(), &rows).unwrap();
        let report = EmptyCandleResolver::new(&store).resolve(&series(), &window(1, 1));
        assert_eq!(report.groups_examined, 1);
        assert_eq!(report.groups_resolved, 0);
        let row = store.point_lookup(&series(), at(1)).unwrap().unwrap();
        assert_eq!(row.pending_marker(), Some("new"));
    }
}
