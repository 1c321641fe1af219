mod commands;
mod obs;
mod time_input;

use candlekeep_application::config::{load_config, resolve_config_path};
use candlekeep_infrastructure::persistence::migrations::DEFAULT_MIGRATIONS_PATH;
use clap::{Args, Parser, Subcommand};
use commands::{Command, SeriesArgs};
use obs::{Telemetry, TelemetryArgs};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "candlekeep-ingest")]
#[command(
    about = "Cached candle collection from KuCoin into PostgreSQL.",
    version,
    arg_required_else_help = true
)]
#[command(
    after_help = "Examples:\n  candlekeep-ingest migrate --db-url postgres://localhost/candlekeep\n  candlekeep-ingest collect --config platform/ops/configs/sample.toml --instrument BTC-USDT --interval 1min --count 500\n  candlekeep-ingest continuity --instrument BTC-USDT --interval 1min --start 2024-01-02T00:00:00Z\n  candlekeep-ingest resolve --instrument BTC-USDT --interval 1min --start 1704153600 --end 1704067200\n"
)]
struct Cli {
    #[command(flatten)]
    telemetry: TelemetryArgs,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Args)]
struct StoreArgs {
    /// Defaults to `CANDLEKEEP_CONFIG`, then the sample config.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    db_url: Option<String>,
    #[arg(long)]
    instrument: String,
    #[arg(long, default_value = "1min")]
    interval: String,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Apply SQL migrations to the target database.
    Migrate {
        #[arg(long, env = "CANDLEKEEP_DB_URL")]
        db_url: String,
        #[arg(long, default_value = DEFAULT_MIGRATIONS_PATH)]
        migrations_path: PathBuf,
    },
    /// Serve a candle request from the cache, fetching what is missing.
    Collect {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long)]
        count: Option<u64>,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        /// Synthesize flat candles for buckets without trades.
        #[arg(long, default_value_t = false)]
        fill_empty_candles: bool,
        /// Print every returned candle as a JSON line after the summary.
        #[arg(long, default_value_t = false)]
        print_candles: bool,
    },
    /// Oldest stored candle connected to `--start` without a gap.
    Continuity {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long)]
        start: String,
        /// Without it the whole stored history is scanned.
        #[arg(long)]
        end: Option<String>,
    },
    /// Link pending filler groups in a window to the real candle below them.
    Resolve {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
    },
    /// Parse a config file and print it back in canonical form.
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

impl CliCommand {
    fn config_path(&self) -> Option<PathBuf> {
        match self {
            CliCommand::Migrate { .. } => None,
            CliCommand::Collect { store, .. }
            | CliCommand::Continuity { store, .. }
            | CliCommand::Resolve { store, .. } => store.config.clone(),
            CliCommand::CheckConfig { config } => config.clone(),
        }
    }
}

impl From<StoreArgs> for SeriesArgs {
    fn from(args: StoreArgs) -> Self {
        SeriesArgs {
            config: args.config,
            db_url: args.db_url,
            instrument: args.instrument,
            interval: args.interval,
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    // An unreadable config leaves telemetry at its defaults; the command reports the error.
    let telemetry_config = load_config(&resolve_config_path(cli.command.config_path()))
        .map(|config| config.telemetry())
        .unwrap_or_default();
    let telemetry = Telemetry::resolve(
        &telemetry_config,
        &cli.telemetry,
        std::env::var("CANDLEKEEP_LOG").ok(),
    )?;
    obs::init_tracing(&telemetry)?;
    obs::init_metrics(telemetry.metrics_addr)?;

    let command = match cli.command {
        CliCommand::Migrate {
            db_url,
            migrations_path,
        } => Command::Migrate {
            db_url,
            migrations_path,
        },
        CliCommand::Collect {
            store,
            count,
            start,
            end,
            fill_empty_candles,
            print_candles,
        } => Command::Collect {
            series: store.into(),
            count,
            start,
            end,
            fill_empty_candles,
            print_candles,
        },
        CliCommand::Continuity { store, start, end } => Command::Continuity {
            series: store.into(),
            start,
            end,
        },
        CliCommand::Resolve { store, start, end } => Command::Resolve {
            series: store.into(),
            start,
            end,
        },
        CliCommand::CheckConfig { config } => Command::CheckConfig { config },
    };
    commands::run(command)
}
