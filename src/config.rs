// 7.0 config.rs: all settings in one place. instruments, leverage defaults, evaluator timing.
// 7.1 presets per environment, json loading, env var overrides.

use crate::calc::Precision;
use crate::types::Instrument;
use serde::{Deserialize, Serialize};
use std::env;

// Rounding and symbol for one tradable instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    // Instrument symbol (e.g. "BTC-USD")
    pub symbol: String,
    // Decimal places for prices (entry, liquidation, exit)
    pub price_scale: u32,
    // Decimal places for quote amounts (pnl)
    pub quote_scale: u32,
}

impl InstrumentConfig {
    pub fn new(symbol: &str, price_scale: u32, quote_scale: u32) -> Self {
        Self {
            symbol: symbol.to_string(),
            price_scale,
            quote_scale,
        }
    }

    pub fn instrument(&self) -> Instrument {
        Instrument::new(self.symbol.clone())
    }

    pub fn precision(&self) -> Precision {
        Precision {
            price_scale: self.price_scale,
            quote_scale: self.quote_scale,
        }
    }
}

/** 7.2: trigger evaluator timing. all durations in milliseconds */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    // Time between evaluation ticks per instrument
    pub interval_ms: u64,
    // Upper bound on a single oracle call
    pub price_timeout_ms: u64,
    // Ticks older than this are skipped
    pub max_price_age_ms: i64,
    // How often the supervisor looks for instruments with open positions
    pub discovery_interval_ms: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            price_timeout_ms: 2_000,
            max_price_age_ms: 30_000,
            discovery_interval_ms: 5_000,
        }
    }
}

// The complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub environment: Environment,
    pub instruments: Vec<InstrumentConfig>,
    // Leverage cap for accounts. New accounts get it when the caller doesn't pick one
    pub default_max_leverage: u32,
    // Reject stop loss / take profit on the wrong side of entry
    pub validate_risk_levels: bool,
    // Events kept in the in-memory log
    pub max_events: usize,
    pub evaluator: EvaluatorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            instruments: vec![
                InstrumentConfig::new("BTC-USD", 2, 2),
                InstrumentConfig::new("ETH-USD", 2, 2),
                InstrumentConfig::new("SOL-USD", 4, 2),
            ],
            default_max_leverage: 20,
            validate_risk_levels: true,
            max_events: 100_000,
            evaluator: EvaluatorConfig::default(),
        }
    }
}

impl EngineConfig {
    // Staging mirrors production limits with a slower cycle
    pub fn staging() -> Self {
        let mut config = Self::default();
        config.environment = Environment::Staging;
        config.evaluator.interval_ms = 10_000;
        config
    }

    // Production with conservative leverage
    pub fn production() -> Self {
        let mut config = Self::default();
        config.environment = Environment::Production;
        config.default_max_leverage = 10;
        config.evaluator.interval_ms = 5_000;
        config.evaluator.max_price_age_ms = 15_000;
        config
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    // MARGIN_CORE_ENV picks the preset; the other vars override single fields
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("MARGIN_CORE_ENV").ok().as_deref() {
            Some("production") => Self::production(),
            Some("staging") => Self::staging(),
            Some("development") | None => Self::default(),
            Some(other) => {
                return Err(ConfigError::Parse {
                    reason: format!("unknown environment {other}"),
                })
            }
        };

        if let Ok(raw) = env::var("MARGIN_CORE_EVAL_INTERVAL_MS") {
            config.evaluator.interval_ms = raw.parse().map_err(|_| ConfigError::Parse {
                reason: format!("MARGIN_CORE_EVAL_INTERVAL_MS is not a number: {raw}"),
            })?;
        }
        if let Ok(raw) = env::var("MARGIN_CORE_MAX_LEVERAGE") {
            config.default_max_leverage = raw.parse().map_err(|_| ConfigError::Parse {
                reason: format!("MARGIN_CORE_MAX_LEVERAGE is not a number: {raw}"),
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    // Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_max_leverage == 0 {
            return Err(ConfigError::InvalidLeverage {
                reason: "Max leverage must be at least 1x".to_string(),
            });
        }

        if self.instruments.is_empty() {
            return Err(ConfigError::InvalidInstrument {
                reason: "Need at least one instrument".to_string(),
            });
        }

        for (i, instrument) in self.instruments.iter().enumerate() {
            if instrument.symbol.trim().is_empty() {
                return Err(ConfigError::InvalidInstrument {
                    reason: "Instrument symbol is empty".to_string(),
                });
            }
            // rust_decimal tops out at 28 fractional digits
            if instrument.price_scale > 28 || instrument.quote_scale > 28 {
                return Err(ConfigError::InvalidInstrument {
                    reason: format!("{} scale above 28", instrument.symbol),
                });
            }
            if self.instruments[..i].iter().any(|other| other.symbol == instrument.symbol) {
                return Err(ConfigError::InvalidInstrument {
                    reason: format!("{} listed twice", instrument.symbol),
                });
            }
        }

        // development allows fast cycles for tests and the simulator
        if self.environment != Environment::Development
            && !(5_000..=15_000).contains(&self.evaluator.interval_ms)
        {
            return Err(ConfigError::InvalidEvaluator {
                reason: "Evaluation interval must be between 5s and 15s".to_string(),
            });
        }

        if self.max_events == 0 {
            return Err(ConfigError::InvalidEvents {
                reason: "Event log must keep at least one event".to_string(),
            });
        }

        self.evaluator.validate()
    }

    pub fn instrument(&self, instrument: &Instrument) -> Option<&InstrumentConfig> {
        self.instruments.iter().find(|c| c.symbol == instrument.symbol())
    }
}

impl EvaluatorConfig {
    // zero intervals would panic inside tokio's interval timer
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 || self.discovery_interval_ms == 0 {
            return Err(ConfigError::InvalidEvaluator {
                reason: "Intervals must be positive".to_string(),
            });
        }

        if self.price_timeout_ms == 0 || self.max_price_age_ms <= 0 {
            return Err(ConfigError::InvalidEvaluator {
                reason: "Price timeout and max age must be positive".to_string(),
            });
        }

        Ok(())
    }
}

// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid leverage: {reason}")]
    InvalidLeverage { reason: String },
    #[error("invalid instrument: {reason}")]
    InvalidInstrument { reason: String },
    #[error("invalid evaluator settings: {reason}")]
    InvalidEvaluator { reason: String },
    #[error("invalid event settings: {reason}")]
    InvalidEvents { reason: String },
    #[error("config parse error: {reason}")]
    Parse { reason: String },
}

// Environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn config(&self) -> EngineConfig {
        match self {
            Environment::Development => EngineConfig::default(),
            Environment::Staging => EngineConfig::staging(),
            Environment::Production => EngineConfig::production(),
        }
    }
}
