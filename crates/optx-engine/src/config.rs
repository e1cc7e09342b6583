//! Application configuration.

use crate::error::{AppError, AppResult};
use crate::paper::PaperConfig;
use optx_core::{ErrorCodeMap, StrategyKind};
use optx_execution::ExecutorConfig;
use optx_throttle::ControllerConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Environment variable overriding the config path.
pub const CONFIG_ENV: &str = "OPTX_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// One quoted instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Exchange symbol, e.g. "BTC-27DEC-60000-C".
    pub symbol: String,
    /// Mid price the quoter steps around.
    pub reference_price: Decimal,
    /// Distance from mid to each side.
    pub half_spread: Decimal,
    pub tick_size: Decimal,
    /// Size quoted on each side.
    pub volume: Decimal,
    /// Quote refresh period (ms). Default: 1000.
    #[serde(default = "default_requote_interval_ms")]
    pub requote_interval_ms: u64,
    #[serde(default)]
    pub kind: StrategyKind,
}

fn default_requote_interval_ms() -> u64 {
    1_000
}

impl InstrumentConfig {
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |what: &str| -> AppResult<()> {
            Err(AppError::Config(format!("instrument {}: {what}", self.symbol)))
        };

        if self.symbol.trim().is_empty() {
            return Err(AppError::Config("instrument symbol is empty".to_string()));
        }
        if self.tick_size <= Decimal::ZERO {
            return invalid("tick_size must be positive");
        }
        if self.volume <= Decimal::ZERO {
            return invalid("volume must be positive");
        }
        if self.half_spread <= Decimal::ZERO {
            return invalid("half_spread must be positive");
        }
        // The bid must stay positive at the lowest step of the quote cycle.
        if self.reference_price - self.half_spread - self.tick_size * Decimal::TWO <= Decimal::ZERO {
            return invalid("reference_price too small for half_spread");
        }
        if self.requote_interval_ms == 0 {
            return invalid("requote_interval_ms must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Prometheus text snapshot written on shutdown.
    #[serde(default)]
    pub metrics_snapshot_path: Option<PathBuf>,
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub paper: PaperConfig,
    #[serde(default)]
    pub error_codes: ErrorCodeMap,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

impl AppConfig {
    /// Config path: CLI argument > `OPTX_CONFIG` > `config/default.toml`.
    pub fn resolve_path(cli: Option<&str>) -> String {
        cli.map(str::to_string)
            .or_else(|| std::env::var(CONFIG_ENV).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }

    /// Load from the resolved path, falling back to defaults if it is missing.
    pub fn load(cli: Option<&str>) -> AppResult<Self> {
        let config_path = Self::resolve_path(cli);

        if Path::new(&config_path).exists() {
            Self::from_file(&config_path)
        } else {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load from a specific file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        self.controller.validate()?;
        self.paper.validate()?;

        let mut seen = HashSet::new();
        for instrument in &self.instruments {
            instrument.validate()?;
            if !seen.insert(instrument.symbol.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate instrument {}",
                    instrument.symbol
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    const SAMPLE: &str = r#"
[controller]
limit = 20
new_order_fraction = 0.4

[executor]
force_stop_timeout_ms = 3000

[executor.slot]
timeout_grace_ms = 1500

[paper]
ack_latency_ms = 2

[error_codes]
fatal = [500, 503]

[[instruments]]
symbol = "OPT-C-100"
reference_price = "2.50"
half_spread = "0.05"
tick_size = "0.01"
volume = "3"

[[instruments]]
symbol = "OPT-P-95"
reference_price = "1.10"
half_spread = "0.04"
tick_size = "0.01"
volume = "1"
requote_interval_ms = 250
kind = "hedge"
"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_from_file_parses_sections() {
        let file = write_config(SAMPLE);
        let config = AppConfig::from_file(file.path()).unwrap();

        assert_eq!(config.controller.limit, 20);
        assert_eq!(config.controller.reserve_slots, 2);
        assert_eq!(config.executor.force_stop_timeout_ms, 3000);
        assert_eq!(config.executor.slot.timeout_grace_ms, 1500);
        assert_eq!(config.executor.slot.max_superseded, 16);
        assert_eq!(config.paper.ack_latency_ms, 2);
        assert_eq!(config.error_codes.fatal, vec![500, 503]);
        assert_eq!(config.error_codes.not_found, vec![404]);

        assert_eq!(config.instruments.len(), 2);
        let call = &config.instruments[0];
        assert_eq!(call.reference_price, dec!(2.50));
        assert_eq!(call.requote_interval_ms, 1_000);
        assert_eq!(call.kind, StrategyKind::MarketMaking);
        assert_eq!(config.instruments[1].kind, StrategyKind::Hedge);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = write_config("");
        let config = AppConfig::from_file(file.path()).unwrap();

        assert_eq!(config.controller.limit, 50);
        assert_eq!(config.executor.force_stop_timeout_ms, 10_000);
        assert!(config.instruments.is_empty());
        assert!(config.telemetry.metrics_snapshot_path.is_none());
    }

    #[test]
    fn test_invalid_controller_rejected() {
        let file = write_config("[controller]\nlimit = 0\n");
        assert!(matches!(
            AppConfig::from_file(file.path()),
            Err(AppError::Throttle(_))
        ));
    }

    #[test]
    fn test_duplicate_instrument_rejected() {
        let instrument = r#"
[[instruments]]
symbol = "OPT-C-100"
reference_price = "2.50"
half_spread = "0.05"
tick_size = "0.01"
volume = "3"
"#;
        let file = write_config(&instrument.repeat(2));
        let err = AppConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate instrument OPT-C-100"));
    }

    #[test]
    fn test_instrument_validation() {
        let mut instrument = InstrumentConfig {
            symbol: "OPT".to_string(),
            reference_price: dec!(0.05),
            half_spread: dec!(0.05),
            tick_size: dec!(0.01),
            volume: dec!(1),
            requote_interval_ms: 500,
            kind: StrategyKind::MarketMaking,
        };
        assert!(instrument.validate().is_err());

        instrument.reference_price = dec!(1.00);
        assert!(instrument.validate().is_ok());

        instrument.volume = Decimal::ZERO;
        assert!(instrument.validate().is_err());
    }

    #[test]
    fn test_missing_file_and_parse_error() {
        assert!(AppConfig::from_file("/nonexistent/optx.toml").is_err());

        let file = write_config("[controller\nlimit = ");
        let err = AppConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_resolve_path_prefers_cli() {
        assert_eq!(AppConfig::resolve_path(Some("custom.toml")), "custom.toml");
    }
}
