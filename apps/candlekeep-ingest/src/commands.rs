use crate::time_input::parse_time_input;
use candlekeep_application::candles::{CandleService, ServiceOptions};
use candlekeep_application::config::{
    load_config, resolve_config_path, resolve_db_url, to_toml_pretty, Config,
};
use candlekeep_domain::services::continuity::ContinuityFinder;
use candlekeep_domain::services::resolver::EmptyCandleResolver;
use candlekeep_domain::value_objects::candle::SeriesKey;
use candlekeep_domain::value_objects::collection::CollectionPhase;
use candlekeep_domain::value_objects::interval::Interval;
use candlekeep_domain::value_objects::range::CandleRange;
use candlekeep_domain::value_objects::request::CandleRequest;
use candlekeep_infrastructure::feed::kucoin::{KucoinCandleFeed, Market};
use candlekeep_infrastructure::persistence::migrations::migrate_db;
use candlekeep_infrastructure::persistence::postgres_candles::PostgresCandleStore;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;

pub struct SeriesArgs {
    pub config: Option<PathBuf>,
    pub db_url: Option<String>,
    pub instrument: String,
    pub interval: String,
}

pub enum Command {
    Migrate {
        db_url: String,
        migrations_path: PathBuf,
    },
    Collect {
        series: SeriesArgs,
        count: Option<u64>,
        start: Option<String>,
        end: Option<String>,
        fill_empty_candles: bool,
        print_candles: bool,
    },
    Continuity {
        series: SeriesArgs,
        start: String,
        end: Option<String>,
    },
    Resolve {
        series: SeriesArgs,
        start: String,
        end: String,
    },
    CheckConfig {
        config: Option<PathBuf>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Migrate { .. } => "migrate",
            Command::Collect { .. } => "collect",
            Command::Continuity { .. } => "continuity",
            Command::Resolve { .. } => "resolve",
            Command::CheckConfig { .. } => "check_config",
        }
    }
}

pub fn run(command: Command) -> Result<(), String> {
    let name = command.name();
    let span = tracing::info_span!("cli.command", command = name);
    let _enter = span.enter();

    let result = dispatch(command);
    let outcome = if result.is_ok() { "ok" } else { "err" };
    metrics::counter!("candlekeep.cli.commands_total", "command" => name, "result" => outcome)
        .increment(1);
    if let Err(err) = &result {
        tracing::error!(error = %err, "command failed");
    }
    result
}

fn dispatch(command: Command) -> Result<(), String> {
    match command {
        Command::Migrate {
            db_url,
            migrations_path,
        } => {
            migrate_db(&db_url, &migrations_path)?;
            println!("migrations applied: {}", migrations_path.display());
            Ok(())
        }
        Command::Collect {
            series,
            count,
            start,
            end,
            fill_empty_candles,
            print_candles,
        } => run_collect(series, count, start, end, fill_empty_candles, print_candles),
        Command::Continuity { series, start, end } => run_continuity(series, &start, end),
        Command::Resolve { series, start, end } => run_resolve(series, &start, &end),
        Command::CheckConfig { config } => run_check_config(config),
    }
}

fn run_collect(
    args: SeriesArgs,
    count: Option<u64>,
    start: Option<String>,
    end: Option<String>,
    fill_empty_candles: bool,
    print_candles: bool,
) -> Result<(), String> {
    let start = start.as_deref().map(parse_time_input).transpose()?;
    let end = end.as_deref().map(parse_time_input).transpose()?;
    let request = CandleRequest::from_parts(count, start, end).map_err(|err| err.to_string())?;
    let interval = Interval::parse(&args.interval)?;

    let config = load_config(&resolve_config_path(args.config.clone()))?;
    let store = open_store(&config, args.db_url.as_deref())?;
    store.ensure_table()?;
    let feed = open_feed(&config)?;

    let mut options = ServiceOptions::from_config(&config);
    options.fill_empty_candles |= fill_empty_candles;
    let service = CandleService::new(Arc::new(store), Arc::new(feed), options)?;

    let response = service
        .get_candles(&args.instrument, interval, request)
        .map_err(|err| err.to_string())?;
    let summary = serde_json::to_string_pretty(&response.summary_json())
        .map_err(|err| format!("failed to serialize summary: {err}"))?;
    println!("{summary}");
    if print_candles {
        for candle in &response.candles {
            let line = serde_json::to_string(candle)
                .map_err(|err| format!("failed to serialize candle: {err}"))?;
            println!("{line}");
        }
    }

    match (response.phase, response.failure) {
        (CollectionPhase::Failed, Some(failure)) => Err(format!(
            "collection failed at chunk {}: {}",
            failure.sequence_index, failure.error
        )),
        _ => Ok(()),
    }
}

fn run_continuity(args: SeriesArgs, start: &str, end: Option<String>) -> Result<(), String> {
    let series = series_key(&args)?;
    let start = series.interval.align(parse_time_input(start)?);
    let end = end
        .as_deref()
        .map(parse_time_input)
        .transpose()?
        .map(|ts| series.interval.align(ts));

    let config = load_config(&resolve_config_path(args.config.clone()))?;
    let store = open_store(&config, args.db_url.as_deref())?;
    let finder = ContinuityFinder::new(&store);
    let last = match end {
        Some(end) => finder.find_last_continuous(&series, start, end),
        None => finder.find_last_continuous_unbounded(&series, start),
    }
    .map_err(|err| err.to_string())?;

    let out = serde_json::json!({
        "series": series.to_string(),
        "start": start.to_rfc3339(),
        "end": end.map(|ts| ts.to_rfc3339()),
        "last_continuous": last.map(|ts: DateTime<Utc>| ts.to_rfc3339()),
    });
    println!("{out}");
    Ok(())
}

fn run_resolve(args: SeriesArgs, start: &str, end: &str) -> Result<(), String> {
    let series = series_key(&args)?;
    let start = series.interval.align(parse_time_input(start)?);
    let end = series.interval.align(parse_time_input(end)?);
    let window = CandleRange::new(series.interval, start, end).map_err(|err| err.to_string())?;

    let config = load_config(&resolve_config_path(args.config.clone()))?;
    let store = open_store(&config, args.db_url.as_deref())?;
    let report = EmptyCandleResolver::new(&store).resolve(&series, &window);

    let out = serde_json::json!({
        "series": series.to_string(),
        "groups_examined": report.groups_examined,
        "groups_resolved": report.groups_resolved,
        "rows_updated": report.rows_updated,
        "error": report.error.as_ref().map(|err| err.to_string()),
    });
    println!("{out}");
    match report.error {
        Some(err) => Err(err.to_string()),
        None => Ok(()),
    }
}

fn run_check_config(config: Option<PathBuf>) -> Result<(), String> {
    let path = resolve_config_path(config);
    let config = load_config(&path)?;
    Market::parse(&config.feed.market)?;
    println!("# {}", path.display());
    print!("{}", to_toml_pretty(&config)?);
    Ok(())
}

fn series_key(args: &SeriesArgs) -> Result<SeriesKey, String> {
    let interval = Interval::parse(&args.interval)?;
    Ok(SeriesKey::new(args.instrument.clone(), interval))
}

fn open_store(config: &Config, cli_db_url: Option<&str>) -> Result<PostgresCandleStore, String> {
    let db_url = resolve_db_url(cli_db_url, config)?;
    PostgresCandleStore::new(
        db_url,
        config.db.candles_table.clone(),
        config.pool_max_size(),
    )
}

fn open_feed(config: &Config) -> Result<KucoinCandleFeed, String> {
    let market = Market::parse(&config.feed.market)?;
    KucoinCandleFeed::new(
        market,
        config.feed.base_url.clone(),
        config.feed.timeout_ms,
        config.feed.retries,
        config.backoff_ms(),
    )
}

#[cfg(test)]
mod tests {
    use super::{run, Command};
    use std::path::PathBuf;

    fn sample_config() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../platform/ops/configs/sample.toml")
    }

    #[test]
    fn check_config_accepts_the_sample() {
        run(Command::CheckConfig {
            config: Some(sample_config()),
        })
        .expect("sample config is valid");
    }

    #[test]
    fn check_config_reports_missing_file() {
        let err = run(Command::CheckConfig {
            config: Some(PathBuf::from("does/not/exist.toml")),
        })
        .expect_err("missing config");
        assert!(err.contains("failed to read config"));
    }

    #[test]
    fn migrate_fails_on_missing_migrations_file() {
        let err = run(Command::Migrate {
            db_url: "postgres://localhost/candlekeep".to_string(),
            migrations_path: PathBuf::from("does/not/exist.sql"),
        })
        .expect_err("missing migrations");
        assert!(err.contains("failed to read migrations file"));
    }
}
