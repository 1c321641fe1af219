use candlekeep_domain::error::CandleError;
use candlekeep_domain::repositories::candle_feed::CandleFeed;
use candlekeep_domain::value_objects::candle::{Candle, SeriesKey};
use candlekeep_domain::value_objects::interval::Interval;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub const KUCOIN_SPOT_BASE: &str = "https://api.kucoin.com";
pub const KUCOIN_FUTURES_BASE: &str = "https://api-futures.kucoin.com";
pub const KUCOIN_SPOT_LIMIT: usize = 1500;
pub const KUCOIN_FUTURES_LIMIT: usize = 500;
/// Upper bound on the number of time windows one `fetch` walks back through.
pub const MAX_WINDOWS_PER_FETCH: usize = 4;
const KUCOIN_OK: &str = "200000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    Spot,
    Futures,
}

impl Market {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_lowercase().as_str() {
            "spot" => Ok(Market::Spot),
            "futures" => Ok(Market::Futures),
            other => Err(format!("unsupported market: {other}")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Spot => "spot",
            Market::Futures => "futures",
        }
    }

    /// Most candles a single KuCoin request returns.
    pub fn max_limit(&self) -> usize {
        match self {
            Market::Spot => KUCOIN_SPOT_LIMIT,
            Market::Futures => KUCOIN_FUTURES_LIMIT,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Market::Spot => KUCOIN_SPOT_BASE,
            Market::Futures => KUCOIN_FUTURES_BASE,
        }
    }
}

/// Spot `type` parameter for an interval.
pub fn spot_type(interval: Interval) -> Option<&'static str> {
    match interval {
        Interval::Second1 | Interval::Year1 => None,
        other => Some(other.label()),
    }
}

/// Futures `granularity` parameter (minutes) for an interval.
pub fn futures_granularity(interval: Interval) -> Option<u32> {
    let minutes = match interval {
        Interval::Minute1 => 1,
        Interval::Minute5 => 5,
        Interval::Minute15 => 15,
        Interval::Minute30 => 30,
        Interval::Hour1 => 60,
        Interval::Hour2 => 120,
        Interval::Hour4 => 240,
        Interval::Hour8 => 480,
        Interval::Hour12 => 720,
        Interval::Day1 => 1440,
        Interval::Week1 => 10_080,
        _ => return None,
    };
    Some(minutes)
}

#[derive(Debug, Deserialize)]
struct KucoinResponse {
    code: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    msg: Option<String>,
}

/// KuCoin REST candle feed. Pages backwards in time windows sized to the market's page limit.
pub struct KucoinCandleFeed {
    pub market: Market,
    pub base_url: String,
    pub timeout_ms: u64,
    pub retries: u32,
    pub backoff_ms: u64,
    window_ticks: usize,
    client: Client,
}

impl KucoinCandleFeed {
    pub fn new(
        market: Market,
        base_url: Option<String>,
        timeout_ms: u64,
        retries: u32,
        backoff_ms: u64,
    ) -> Result<Self, String> {
        if timeout_ms == 0 {
            return Err("feed timeout_ms must be > 0".to_string());
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|err| format!("failed to build http client: {err}"))?;
        Ok(Self {
            market,
            base_url: base_url.unwrap_or_else(|| market.default_base_url().to_string()),
            timeout_ms,
            retries,
            backoff_ms,
            window_ticks: market.max_limit(),
            client,
        })
    }

    /// Narrows the per-request window. Values above the market limit are clamped.
    pub fn with_window_ticks(mut self, window_ticks: usize) -> Self {
        self.window_ticks = window_ticks.clamp(1, self.market.max_limit());
        self
    }

    fn request_window(
        &self,
        series: &SeriesKey,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, CandleError> {
        let (url, query) = self.request_parts(series, window_start, window_end)?;
        let market = self.market.as_str();

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if attempts > 1 {
                metrics::counter!("candlekeep.infra.kucoin.retries_total", "market" => market)
                    .increment(1);
            }
            metrics::counter!("candlekeep.infra.kucoin.requests_total", "market" => market)
                .increment(1);

            let attempt_start = Instant::now();
            let response = self.client.get(&url).query(&query).send();
            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    let kind = if err.is_timeout() { "timeout" } else { "transport" };
                    metrics::counter!(
                        "candlekeep.infra.kucoin.errors_total",
                        "market" => market,
                        "kind" => kind
                    )
                    .increment(1);
                    tracing::warn!(attempt = attempts, error = %err, kind, "kucoin request failed");
                    if err.is_timeout() {
                        return Err(CandleError::FeedTimeout(format!(
                            "{market} request timed out after {}ms: {err}",
                            self.timeout_ms
                        )));
                    }
                    return Err(CandleError::FeedUnavailable(format!(
                        "{market} request failed: {err}"
                    )));
                }
            };

            let status = response.status();
            metrics::histogram!(
                "candlekeep.infra.kucoin.request_ms",
                "market" => market,
                "status" => status.as_u16().to_string()
            )
            .record(attempt_start.elapsed().as_secs_f64() * 1000.0);

            let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if retryable && attempts <= self.retries {
                let backoff = self.backoff_ms * u64::from(attempts);
                tracing::debug!(
                    attempt = attempts,
                    status = status.as_u16(),
                    backoff_ms = backoff,
                    "retrying kucoin request"
                );
                std::thread::sleep(Duration::from_millis(backoff));
                continue;
            }

            if !status.is_success() {
                metrics::counter!(
                    "candlekeep.infra.kucoin.errors_total",
                    "market" => market,
                    "kind" => "http_status"
                )
                .increment(1);
                return Err(CandleError::FeedUnavailable(format!(
                    "{market} request failed with status {status} after {attempts} attempt(s)"
                )));
            }

            let payload: KucoinResponse = response.json().map_err(|err| {
                if err.is_timeout() {
                    CandleError::FeedTimeout(format!("{market} response timed out: {err}"))
                } else {
                    CandleError::FeedUnavailable(format!("{market} response parse failed: {err}"))
                }
            })?;
            if payload.code != KUCOIN_OK {
                return Err(CandleError::FeedUnavailable(format!(
                    "{market} response error code {}: {}",
                    payload.code,
                    payload.msg.unwrap_or_default()
                )));
            }
            return parse_rows(self.market, series, &payload.data)
                .map_err(CandleError::FeedUnavailable);
        }
    }

    fn request_parts(
        &self,
        series: &SeriesKey,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<(String, Vec<(&'static str, String)>), CandleError> {
        let base = self.base_url.trim_end_matches('/');
        // KuCoin bounds are inclusive; stop one second short of the exclusive window end.
        match self.market {
            Market::Spot => {
                let kind = spot_type(series.interval).ok_or_else(|| unsupported(series))?;
                Ok((
                    format!("{base}/api/v1/market/candles"),
                    vec![
                        ("symbol", series.instrument.clone()),
                        ("type", kind.to_string()),
                        ("startAt", window_start.timestamp().to_string()),
                        ("endAt", (window_end.timestamp() - 1).to_string()),
                    ],
                ))
            }
            Market::Futures => {
                let granularity =
                    futures_granularity(series.interval).ok_or_else(|| unsupported(series))?;
                Ok((
                    format!("{base}/api/v1/kline/query"),
                    vec![
                        ("symbol", series.instrument.clone()),
                        ("granularity", granularity.to_string()),
                        ("from", window_start.timestamp_millis().to_string()),
                        ("to", (window_end.timestamp_millis() - 1).to_string()),
                    ],
                ))
            }
        }
    }
}

impl CandleFeed for KucoinCandleFeed {
    fn fetch(
        &self,
        series: &SeriesKey,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>, CandleError> {
        let span = tracing::info_span!(
            "infra.kucoin.fetch",
            market = self.market.as_str(),
            series = %series,
            older_than = %older_than,
            limit
        );
        let _enter = span.enter();

        if limit == 0 {
            return Ok(Vec::new());
        }
        let interval = series.interval;
        let span_ticks = limit.min(self.window_ticks) as i64;

        let mut collected: BTreeMap<DateTime<Utc>, Candle> = BTreeMap::new();
        let mut window_end = older_than;
        let mut windows = 0usize;
        while collected.len() < limit && windows < MAX_WINDOWS_PER_FETCH {
            let Some(window_start) = interval.step(window_end, -span_ticks) else {
                break;
            };
            windows += 1;
            let rows = self.request_window(series, window_start, window_end)?;
            let before = collected.len();
            for row in rows {
                if row.open_time >= window_start && row.open_time < window_end {
                    collected.entry(row.open_time).or_insert(row);
                }
            }
            if collected.len() == before {
                break;
            }
            window_end = window_start;
        }

        let candles: Vec<Candle> = collected.into_values().rev().take(limit).collect();
        metrics::counter!("candlekeep.infra.kucoin.rows_total", "market" => self.market.as_str())
            .increment(candles.len() as u64);
        tracing::debug!(windows, returned = candles.len(), "kucoin fetch complete");
        Ok(candles)
    }
}

fn unsupported(series: &SeriesKey) -> CandleError {
    CandleError::FeedUnavailable(format!("interval {} is not offered by kucoin", series.interval))
}

/// Parses KuCoin candle rows. Spot rows are `[time, open, close, high, low, volume, turnover]`
/// with string fields and second timestamps. Futures rows are
/// `[time, open, high, low, close, volume, turnover]` with numeric fields and millisecond
/// timestamps. Both encodings are accepted for every field.
pub fn parse_rows(market: Market, series: &SeriesKey, data: &Value) -> Result<Vec<Candle>, String> {
    let rows = match data {
        Value::Array(rows) => rows,
        Value::Null => return Ok(Vec::new()),
        other => return Err(format!("unexpected candle payload: {other}")),
    };

    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        let fields = row
            .as_array()
            .ok_or_else(|| format!("unexpected candle row: {row}"))?;
        if fields.len() < 6 {
            return Err("unexpected candle row length".to_string());
        }

        let ts = parse_epoch_value(&fields[0])?;
        let open_time = Utc
            .timestamp_opt(ts, 0)
            .single()
            .ok_or_else(|| format!("invalid timestamp: {ts}"))?;
        let (open, high, low, close) = match market {
            Market::Spot => (
                parse_f64(&fields[1], "open")?,
                parse_f64(&fields[3], "high")?,
                parse_f64(&fields[4], "low")?,
                parse_f64(&fields[2], "close")?,
            ),
            Market::Futures => (
                parse_f64(&fields[1], "open")?,
                parse_f64(&fields[2], "high")?,
                parse_f64(&fields[3], "low")?,
                parse_f64(&fields[4], "close")?,
            ),
        };
        let volume = parse_f64(&fields[5], "volume")?;
        let quote_volume = match fields.get(6) {
            Some(value) => parse_f64(value, "turnover")?,
            None => volume * close,
        };

        candles.push(Candle {
            instrument: series.instrument.clone(),
            interval: series.interval,
            open_time,
            open,
            high,
            low,
            close,
            volume,
            quote_volume,
            trade_count: None,
            empty_reference: None,
        });
    }
    Ok(candles)
}

fn parse_epoch_value(value: &Value) -> Result<i64, String> {
    let ts = match value {
        Value::String(raw) => raw
            .parse::<i64>()
            .map_err(|_| format!("invalid epoch: {raw}"))?,
        Value::Number(num) => num
            .as_i64()
            .ok_or_else(|| format!("invalid epoch: {num}"))?,
        other => return Err(format!("invalid epoch: {other}")),
    };
    if ts > 1_000_000_000_000 {
        Ok(ts / 1000)
    } else {
        Ok(ts)
    }
}

fn parse_f64(value: &Value, field: &str) -> Result<f64, String> {
    match value {
        Value::String(raw) => raw
            .parse::<f64>()
            .map_err(|_| format!("invalid {field}: {raw}")),
        Value::Number(num) => num
            .as_f64()
            .ok_or_else(|| format!("invalid {field}: {num}")),
        other => Err(format!("invalid {field}: {other}")),
    }
}
