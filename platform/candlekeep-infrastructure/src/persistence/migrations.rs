use crate::persistence::postgres_candles::{validate_table_name, PENDING_INDEX_SUFFIX};
use postgres::{Client, NoTls};
use std::path::Path;

pub const DEFAULT_MIGRATIONS_PATH: &str = "platform/ops/migrations/0001_create_candles.sql";

/// Applies a SQL migrations file in one batch.
pub fn migrate_db(db_url: &str, migrations_path: &Path) -> Result<(), String> {
    let span = tracing::info_span!(
        "infra.postgres.migrate",
        migrations_path = %migrations_path.display()
    );
    let _enter = span.enter();

    let sql = std::fs::read_to_string(migrations_path).map_err(|err| {
        format!(
            "failed to read migrations file {}: {}",
            migrations_path.display(),
            err
        )
    })?;

    let mut client = Client::connect(db_url, NoTls)
        .map_err(|err| format!("failed to connect to postgres: {err}"))?;
    client
        .batch_execute(&sql)
        .map_err(|err| format!("failed to apply migrations: {err}"))?;

    metrics::counter!("candlekeep.infra.postgres.migrations_applied_total").increment(1);
    tracing::info!("migrations applied");
    Ok(())
}

/// DDL for a candles table named `table`, matching the shipped migration.
pub fn candles_table_ddl(table: &str) -> Result<String, String> {
    validate_table_name(table)?;
    let index_base = table.rsplit('.').next().unwrap_or(table);
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            instrument TEXT NOT NULL,
            timeframe TEXT NOT NULL,
            open_time TIMESTAMPTZ NOT NULL,
            open DOUBLE PRECISION NOT NULL,
            high DOUBLE PRECISION NOT NULL,
            low DOUBLE PRECISION NOT NULL,
            close DOUBLE PRECISION NOT NULL,
            volume DOUBLE PRECISION NOT NULL,
            quote_volume DOUBLE PRECISION NOT NULL,
            trade_count BIGINT,
            empty_reference TEXT,
            ingested_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (instrument, timeframe, open_time)
        );
        CREATE INDEX IF NOT EXISTS {index_base}{PENDING_INDEX_SUFFIX}
            ON {table} (instrument, timeframe, empty_reference)
            WHERE empty_reference IS NOT NULL;"
    ))
}
