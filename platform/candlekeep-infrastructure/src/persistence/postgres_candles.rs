use crate::persistence::migrations::candles_table_ddl;
use candlekeep_domain::error::CandleError;
use candlekeep_domain::repositories::candle_store::CandleStore;
use candlekeep_domain::value_objects::candle::{Candle, EmptyReference, SeriesKey};
use chrono::{DateTime, Utc};
use postgres::NoTls;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use std::fmt::Display;
use std::time::Instant;

type PgPool = Pool<PostgresConnectionManager<NoTls>>;
type PgConnection = PooledConnection<PostgresConnectionManager<NoTls>>;

const SELECT_COLUMNS: &str = "open_time, open, high, low, close, volume, quote_volume, \
                              trade_count, empty_reference";

/// Candle store backed by a single Postgres table partitioned logically by
/// `(instrument, timeframe)`. Writes take a transaction-scoped advisory lock on the partition.
#[derive(Debug, Clone)]
pub struct PostgresCandleStore {
    pool: PgPool,
    pub candles_table: String,
}

impl PostgresCandleStore {
    pub fn new(db_url: String, candles_table: String, pool_max_size: u32) -> Result<Self, String> {
        validate_table_name(&candles_table)?;

        let config = db_url
            .parse::<postgres::Config>()
            .map_err(|err| format!("invalid postgres db url: {err}"))?;
        let manager = PostgresConnectionManager::new(config, NoTls);
        let pool = Pool::builder()
            .max_size(pool_max_size)
            .build(manager)
            .map_err(|err| format!("failed to build postgres pool: {err}"))?;

        Ok(Self {
            pool,
            candles_table,
        })
    }

    /// Creates the candles table and its pending-reference index when missing.
    pub fn ensure_table(&self) -> Result<(), String> {
        let ddl = candles_table_ddl(&self.candles_table)?;
        let mut client = self
            .pool
            .get()
            .map_err(|err| format!("failed to checkout postgres connection: {err}"))?;
        client
            .batch_execute(&ddl)
            .map_err(|err| format!("failed to create candles table: {err}"))
    }

    fn client(&self) -> Result<PgConnection, CandleError> {
        let get_start = Instant::now();
        let client = self.pool.get().map_err(|err| {
            metrics::counter!("candlekeep.infra.postgres.pool.get.errors_total").increment(1);
            tracing::error!(error = %err, "failed to checkout postgres connection");
            store_error("checkout postgres connection", err)
        })?;
        metrics::histogram!("candlekeep.infra.postgres.pool.get_ms")
            .record(get_start.elapsed().as_secs_f64() * 1000.0);
        Ok(client)
    }

    fn insert_rows(&self, series: &SeriesKey, candles: &[Candle]) -> Result<u64, CandleError> {
        let mut client = self.client()?;
        let mut tx = client
            .transaction()
            .map_err(|err| store_error("start transaction", err))?;
        lock_partition(&mut tx, series)?;

        let statement = tx
            .prepare(&format!(
                "INSERT INTO {} (instrument, timeframe, open_time, open, high, low, close, \
                 volume, quote_volume, trade_count, empty_reference) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
                 ON CONFLICT (instrument, timeframe, open_time) DO NOTHING",
                self.candles_table
            ))
            .map_err(|err| store_error("prepare insert", err))?;

        let label = series.interval.label();
        let mut inserted = 0u64;
        for candle in candles {
            let reference = candle.empty_reference.as_ref().map(EmptyReference::encode);
            inserted += tx
                .execute(
                    &statement,
                    &[
                        &series.instrument,
                        &label,
                        &candle.open_time,
                        &candle.open,
                        &candle.high,
                        &candle.low,
                        &candle.close,
                        &candle.volume,
                        &candle.quote_volume,
                        &candle.trade_count,
                        &reference,
                    ],
                )
                .map_err(|err| store_error("insert candle", err))?;
        }

        tx.commit().map_err(|err| store_error("commit insert", err))?;
        Ok(inserted)
    }

    fn select_range(
        &self,
        series: &SeriesKey,
        newest: DateTime<Utc>,
        oldest: DateTime<Utc>,
    ) -> Result<Vec<Candle>, CandleError> {
        let mut client = self.client()?;
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM {} \
             WHERE instrument=$1 AND timeframe=$2 AND open_time <= $3 AND open_time >= $4 \
             ORDER BY open_time DESC",
            self.candles_table
        );
        let label = series.interval.label();
        let rows = client
            .query(&query, &[&series.instrument, &label, &newest, &oldest])
            .map_err(|err| store_error("query candle range", err))?;
        rows.iter().map(|row| decode_row(series, row)).collect()
    }

    fn count_range(
        &self,
        series: &SeriesKey,
        newest: DateTime<Utc>,
        oldest: DateTime<Utc>,
    ) -> Result<u64, CandleError> {
        let mut client = self.client()?;
        let query = format!(
            "SELECT COUNT(*) FROM {} \
             WHERE instrument=$1 AND timeframe=$2 AND open_time <= $3 AND open_time >= $4",
            self.candles_table
        );
        let label = series.interval.label();
        let row = client
            .query_one(&query, &[&series.instrument, &label, &newest, &oldest])
            .map_err(|err| store_error("count candle range", err))?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    fn select_one(
        &self,
        series: &SeriesKey,
        open_time: DateTime<Utc>,
    ) -> Result<Option<Candle>, CandleError> {
        let mut client = self.client()?;
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM {} \
             WHERE instrument=$1 AND timeframe=$2 AND open_time=$3",
            self.candles_table
        );
        let label = series.interval.label();
        let row = client
            .query_opt(&query, &[&series.instrument, &label, &open_time])
            .map_err(|err| store_error("look up candle", err))?;
        row.map(|row| decode_row(series, &row)).transpose()
    }

    fn update_reference(
        &self,
        series: &SeriesKey,
        marker: &str,
        anchor: DateTime<Utc>,
    ) -> Result<u64, CandleError> {
        let mut client = self.client()?;
        let mut tx = client
            .transaction()
            .map_err(|err| store_error("start transaction", err))?;
        lock_partition(&mut tx, series)?;

        let query = format!(
            "UPDATE {} SET empty_reference=$4 \
             WHERE instrument=$1 AND timeframe=$2 AND empty_reference=$3",
            self.candles_table
        );
        let label = series.interval.label();
        let pending = EmptyReference::Pending(marker.to_string()).encode();
        let resolved = EmptyReference::Anchor(anchor).encode();
        let updated = tx
            .execute(&query, &[&series.instrument, &label, &pending, &resolved])
            .map_err(|err| store_error("update empty references", err))?;
        tx.commit().map_err(|err| store_error("commit update", err))?;
        Ok(updated)
    }
}

impl CandleStore for PostgresCandleStore {
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

        let span = tracing::info_span!(
            "infra.postgres.insert",
            table = %self.candles_table,
            series = %series,
            rows = candles.len()
        );
        let _enter = span.enter();

        let started = Instant::now();
        let result = self.insert_rows(series, candles);
        observe("insert", started, &result);
        if let Ok(inserted) = &result {
            metrics::counter!("candlekeep.infra.postgres.rows_inserted_total").increment(*inserted);
            tracing::debug!(
                inserted = *inserted,
                skipped = candles.len() as u64 - *inserted,
                "candles inserted"
            );
        }
        result
    }

    fn range_query(
        &self,
        series: &SeriesKey,
        newest: DateTime<Utc>,
        oldest: DateTime<Utc>,
    ) -> Result<Vec<Candle>, CandleError> {
        let span = tracing::debug_span!(
            "infra.postgres.range_query",
            table = %self.candles_table,
            series = %series
        );
        let _enter = span.enter();

        let started = Instant::now();
        let result = self.select_range(series, newest, oldest);
        observe("range_query", started, &result);
        if let Ok(rows) = &result {
            metrics::counter!("candlekeep.infra.postgres.rows_returned_total")
                .increment(rows.len() as u64);
        }
        result
    }

    fn count_in_range(
        &self,
        series: &SeriesKey,
        newest: DateTime<Utc>,
        oldest: DateTime<Utc>,
    ) -> Result<u64, CandleError> {
        let started = Instant::now();
        let result = self.count_range(series, newest, oldest);
        observe("count_in_range", started, &result);
        result
    }

    fn point_lookup(
        &self,
        series: &SeriesKey,
        open_time: DateTime<Utc>,
    ) -> Result<Option<Candle>, CandleError> {
        let started = Instant::now();
        let result = self.select_one(series, open_time);
        observe("point_lookup", started, &result);
        result
    }

    fn bulk_update_reference(
        &self,
        series: &SeriesKey,
        marker: &str,
        anchor: DateTime<Utc>,
    ) -> Result<u64, CandleError> {
        let span = tracing::info_span!(
            "infra.postgres.update_reference",
            table = %self.candles_table,
            series = %series,
            marker = %marker
        );
        let _enter = span.enter();

        let started = Instant::now();
        let result = self.update_reference(series, marker, anchor);
        observe("update_reference", started, &result);
        result
    }
}

fn lock_partition(
    tx: &mut postgres::Transaction<'_>,
    series: &SeriesKey,
) -> Result<(), CandleError> {
    let key = partition_lock_key(series);
    tx.execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&key])
        .map_err(|err| store_error("lock partition", err))?;
    Ok(())
}

fn partition_lock_key(series: &SeriesKey) -> String {
    format!("{}:{}", series.instrument, series.interval.label())
}

fn decode_row(series: &SeriesKey, row: &postgres::Row) -> Result<Candle, CandleError> {
    let reference: Option<String> = row.get(8);
    let empty_reference = reference
        .as_deref()
        .map(EmptyReference::decode)
        .transpose()
        .map_err(CandleError::Store)?;
    Ok(Candle {
        instrument: series.instrument.clone(),
        interval: series.interval,
        open_time: row.get(0),
        open: row.get(1),
        high: row.get(2),
        low: row.get(3),
        close: row.get(4),
        volume: row.get(5),
        quote_volume: row.get(6),
        trade_count: row.get(7),
        empty_reference,
    })
}

fn observe<T>(op: &'static str, started: Instant, result: &Result<T, CandleError>) {
    let label = if result.is_ok() { "ok" } else { "err" };
    metrics::counter!("candlekeep.infra.postgres.calls_total", "op" => op, "result" => label)
        .increment(1);
    metrics::histogram!("candlekeep.infra.postgres.op_ms", "op" => op)
        .record(started.elapsed().as_secs_f64() * 1000.0);
    if let Err(err) = result {
        tracing::warn!(op, error = %err, "postgres candle store operation failed");
    }
}

fn store_error(stage: &str, err: impl Display) -> CandleError {
    CandleError::Store(format!("failed to {stage}: {err}"))
}

/// Suffix of the partial index created next to every candles table.
pub const PENDING_INDEX_SUFFIX: &str = "_pending_idx";

/// Postgres silently truncates longer identifiers.
const MAX_IDENTIFIER_BYTES: usize = 63;

/// Accepts `[schema.]table` made of unquoted lowercase identifiers, the only form interpolated
/// into SQL. The table part must leave room for its pending index name.
pub fn validate_table_name(table: &str) -> Result<(), String> {
    let (schema, name) = match table.split_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    };
    let name_limit = MAX_IDENTIFIER_BYTES - PENDING_INDEX_SUFFIX.len();
    let problem = schema
        .and_then(|schema| identifier_problem(schema, MAX_IDENTIFIER_BYTES))
        .or_else(|| identifier_problem(name, name_limit));
    match problem {
        Some(problem) => Err(format!("invalid candles_table {table:?}: {problem}")),
        None => Ok(()),
    }
}

fn identifier_problem(ident: &str, max_bytes: usize) -> Option<String> {
    if ident.is_empty() {
        return Some("empty identifier".to_string());
    }
    if ident.len() > max_bytes {
        return Some(format!("`{ident}` is longer than {max_bytes} bytes"));
    }
    if ident.starts_with(|ch: char| ch.is_ascii_digit()) {
        return Some(format!("`{ident}` starts with a digit"));
    }
    ident
        .chars()
        .find(|ch| !(ch.is_ascii_lowercase() || ch.is_ascii_digit() || *ch == '_'))
        .map(|ch| format!("`{ident}` contains {ch:?}"))
}

#[cfg(test)]
mod tests {
    use super::{
        partition_lock_key, validate_table_name, PostgresCandleStore, PENDING_INDEX_SUFFIX,
    };
    use candlekeep_domain::value_objects::candle::SeriesKey;
    use candlekeep_domain::value_objects::interval::Interval;

    #[test]
    fn table_names_are_plain_lowercase_identifiers() {
        assert!(validate_table_name("candles").is_ok());
        assert!(validate_table_name("market.candles").is_ok());
        assert!(validate_table_name("_scratch.candles_1m").is_ok());

        let err = validate_table_name("").unwrap_err();
        assert!(err.contains("empty identifier"));
        assert!(validate_table_name("public.").is_err());
        assert!(validate_table_name(".candles").is_err());
        assert!(validate_table_name("a.b.c").unwrap_err().contains("'.'"));
        assert!(validate_table_name("candles;drop").unwrap_err().contains("';'"));
        assert!(validate_table_name("Candles").unwrap_err().contains("'C'"));
        assert!(validate_table_name("1candles").unwrap_err().contains("digit"));
    }

    #[test]
    fn table_name_leaves_room_for_the_pending_index() {
        let longest = "c".repeat(63 - PENDING_INDEX_SUFFIX.len());
        assert!(validate_table_name(&longest).is_ok());
        let err = validate_table_name(&format!("{longest}x")).unwrap_err();
        assert!(err.contains("longer than 51 bytes"));
        let long_schema = format!("{}.candles", "s".repeat(63));
        assert!(validate_table_name(&long_schema).is_ok());
    }

    #[test]
    fn new_rejects_invalid_table_name_before_connect() {
        let err = PostgresCandleStore::new(
            "postgres://invalid".to_string(),
            "candles;drop".to_string(),
            1,
        )
        .expect_err("invalid table name");
        assert!(err.contains("invalid candles_table"));
    }

    #[test]
    fn new_errors_on_invalid_db_url() {
        let err = PostgresCandleStore::new("not a url".to_string(), "candles".to_string(), 1)
            .expect_err("invalid db url should fail fast");
        assert!(err.contains("invalid postgres db url"));
    }

    #[test]
    fn partition_lock_key_names_instrument_and_interval() {
        let series = SeriesKey::new("BTC-USDT", Interval::Hour4);
        assert_eq!(partition_lock_key(&series), "BTC-USDT:4hour");
    }
}
