use candlekeep_application::config::{LogFormat, TelemetryConfig};
use clap::Args;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info";

/// Global flags overriding the `[telemetry]` config section.
#[derive(Args, Debug, Default)]
pub struct TelemetryArgs {
    /// Log filter; `CANDLEKEEP_LOG` overrides it.
    #[arg(long, global = true)]
    pub log_level: Option<String>,
    /// `pretty`, `compact` or `json`.
    #[arg(long, global = true)]
    pub log_format: Option<String>,
    /// Serve Prometheus metrics on host:port.
    #[arg(long, global = true)]
    pub metrics_addr: Option<String>,
}

/// Effective log and metrics settings for one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telemetry {
    pub filter: String,
    pub format: LogFormat,
    pub metrics_addr: Option<SocketAddr>,
}

impl Telemetry {
    /// Filter precedence: `env_filter`, then `--log-level`, then `log_filter`, then `info`.
    /// Format and metrics address: flag, then config.
    pub fn resolve(
        config: &TelemetryConfig,
        args: &TelemetryArgs,
        env_filter: Option<String>,
    ) -> Result<Self, String> {
        let filter = [env_filter, args.log_level.clone(), config.log_filter.clone()]
            .into_iter()
            .flatten()
            .find(|raw| !raw.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        EnvFilter::try_new(&filter)
            .map_err(|err| format!("invalid log filter {filter:?}: {err}"))?;

        let format = match args.log_format.as_deref() {
            Some(raw) => LogFormat::parse(raw)?,
            None => config.log_format.unwrap_or_default(),
        };

        let metrics_addr = args
            .metrics_addr
            .as_deref()
            .or(config.metrics_addr.as_deref())
            .map(|raw| {
                raw.parse::<SocketAddr>()
                    .map_err(|err| format!("invalid metrics address {raw:?} (host:port): {err}"))
            })
            .transpose()?;

        Ok(Self {
            filter,
            format,
            metrics_addr,
        })
    }
}

/// Installs the global subscriber. Events go to stderr so stdout stays machine-readable.
pub fn init_tracing(telemetry: &Telemetry) -> Result<(), String> {
    let filter = EnvFilter::try_new(&telemetry.filter)
        .map_err(|err| format!("invalid log filter: {err}"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = match telemetry.format {
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    installed.map_err(|err| format!("failed to install tracing subscriber: {err}"))
}

#[cfg(feature = "prometheus")]
pub fn init_metrics(addr: Option<SocketAddr>) -> Result<(), String> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let Some(addr) = addr else {
        return Ok(());
    };
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|err| format!("failed to start metrics listener on {addr}: {err}"))?;
    tracing::info!(metrics_addr = %addr, "serving prometheus metrics");
    Ok(())
}

#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(addr: Option<SocketAddr>) -> Result<(), String> {
    match addr {
        Some(addr) => Err(format!(
            "metrics address {addr} given but candlekeep-ingest was built without `prometheus`"
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TelemetryConfig {
        TelemetryConfig {
            log_filter: Some("warn".to_string()),
            log_format: Some(LogFormat::Json),
            metrics_addr: Some("127.0.0.1:9464".to_string()),
        }
    }

    #[test]
    fn defaults_apply_without_config_or_flags() {
        let telemetry =
            Telemetry::resolve(&TelemetryConfig::default(), &TelemetryArgs::default(), None)
                .expect("defaults");
        assert_eq!(telemetry.filter, "info");
        assert_eq!(telemetry.format, LogFormat::Pretty);
        assert!(telemetry.metrics_addr.is_none());
    }

    #[test]
    fn config_section_is_used_when_no_flag_is_given() {
        let telemetry =
            Telemetry::resolve(&config(), &TelemetryArgs::default(), None).expect("config");
        assert_eq!(telemetry.filter, "warn");
        assert_eq!(telemetry.format, LogFormat::Json);
        assert_eq!(telemetry.metrics_addr, Some("127.0.0.1:9464".parse().unwrap()));
    }

    #[test]
    fn environment_then_flags_override_the_config() {
        let args = TelemetryArgs {
            log_level: Some("debug".to_string()),
            log_format: Some("compact".to_string()),
            metrics_addr: Some("0.0.0.0:9000".to_string()),
        };
        let from_flags = Telemetry::resolve(&config(), &args, None).expect("flags");
        assert_eq!(from_flags.filter, "debug");
        assert_eq!(from_flags.format, LogFormat::Compact);
        assert_eq!(from_flags.metrics_addr.map(|a| a.port()), Some(9000));

        let from_env =
            Telemetry::resolve(&config(), &args, Some("candlekeep_domain=trace".to_string()))
                .expect("env");
        assert_eq!(from_env.filter, "candlekeep_domain=trace");

        let blank_env =
            Telemetry::resolve(&config(), &args, Some(" ".to_string())).expect("blank env");
        assert_eq!(blank_env.filter, "debug");
    }

    #[test]
    fn malformed_settings_are_rejected() {
        let bad_format = TelemetryArgs {
            log_format: Some("xml".to_string()),
            ..TelemetryArgs::default()
        };
        assert!(Telemetry::resolve(&config(), &bad_format, None).is_err());

        let bad_addr = TelemetryArgs {
            metrics_addr: Some("localhost".to_string()),
            ..TelemetryArgs::default()
        };
        let err = Telemetry::resolve(&config(), &bad_addr, None).expect_err("addr");
        assert!(err.contains("invalid metrics address"));

        let loud = Some("candlekeep=loud".to_string());
        let err = Telemetry::resolve(&config(), &TelemetryArgs::default(), loud)
            .expect_err("filter");
        assert!(err.contains("invalid log filter"));
    }
}
