use crate::value_objects::candle::{Candle, EmptyReference, SeriesKey};
use crate::value_objects::range::CandleRange;
use chrono::{DateTime, Utc};

/// Group marker shared by the unresolved fillers of one fetch.
pub fn group_marker(series: &SeriesKey, older_than: DateTime<Utc>) -> String {
    format!("{}:{}", series.interval.label(), older_than.timestamp())
}

/// Newest owned, on-grid row of a feed page that is older than `window`. Its presence means the
/// history continues past the bottom of the window.
pub fn newest_below(series: &SeriesKey, window: &CandleRange, raw: &[Candle]) -> Option<Candle> {
    raw.iter()
        .filter(|c| {
            series.owns(c) && series.interval.is_aligned(c.open_time) && c.open_time < window.end
        })
        .max_by_key(|c| c.open_time)
        .cloned()
}

/// Synthesizes fillers for the ticks of `window` that the feed skipped, newest first.
///
/// `rows` are the sanitized real candles of the page, newest first. A filler is flat at the
/// close of the nearest older real candle and references that candle's `open_time`.
///
/// Ticks below the oldest row copy from `below`, the page's first row past the window. That
/// candle is only stored by the next chunk, so those fillers carry the pending `marker` until
/// the resolver links them. Without `below` the ticks under the oldest row are pre-history and
/// stay empty.
pub fn build_fillers(
    series: &SeriesKey,
    window: &CandleRange,
    rows: &[Candle],
    below: Option<&Candle>,
    marker: &str,
) -> Vec<Candle> {
    let interval = series.interval;
    let mut source: Option<(f64, EmptyReference)> =
        below.map(|c| (c.close, EmptyReference::Pending(marker.to_string())));
    let mut older = rows.iter().rev().peekable();
    let mut fillers = Vec::new();
    let mut tick = window.end;

    loop {
        match older.next_if(|c| c.open_time == tick) {
            Some(real) => source = Some((real.close, EmptyReference::Anchor(real.open_time))),
            None => {
                if let Some((close, reference)) = &source {
                    fillers.push(Candle::filler(series, tick, *close, reference.clone()));
                }
            }
        }
        if tick >= window.start {
            break;
        }
        let Some(next) = interval.step(tick, 1) else {
            break;
        };
        tick = next;
    }

    fillers.reverse();
    fillers
}
