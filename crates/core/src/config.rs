//! Configuration types

use std::time::Duration;

use chrono::TimeDelta;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{CoreError, CoreResult, Instrument};

/// Optional configuration file, looked up in the working directory
pub const CONFIG_FILE: &str = "index-price";

/// Environment variable prefix, nested keys use `__` (e.g. `INDEX__SIMULATION__SOURCES`)
pub const ENV_PREFIX: &str = "INDEX";

/// Simulated upstream source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub sources: usize,
    pub tick_interval_ms: u64,
    pub uptime_secs: u64,
    pub base_price: Decimal,
    pub price_spread: Decimal,
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sources: 100,
            tick_interval_ms: 1000,
            uptime_secs: 180,
            base_price: Decimal::new(98, 0),
            price_spread: Decimal::new(4, 0),
            seed: None,
        }
    }
}

impl SimulationConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn uptime(&self) -> Duration {
        Duration::from_secs(self.uptime_secs)
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub instrument: Instrument,
    pub interval_secs: u64,
    pub channel_capacity: usize,
    pub source_error_wait_ms: u64,
    pub max_lookahead_buckets: u32,
    pub simulation: SimulationConfig,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            instrument: Instrument::BTC_USD,
            interval_secs: 60,
            channel_capacity: 1024,
            source_error_wait_ms: 1000,
            max_lookahead_buckets: 1,
            simulation: SimulationConfig::default(),
        }
    }
}

impl IndexConfig {
    /// Load from `.env`, an optional `index-price.toml` and `INDEX__*` variables
    pub fn load() -> CoreResult<Self> {
        dotenvy::dotenv().ok();

        let config: IndexConfig = config::Config::builder()
            .add_source(config::File::with_name(CONFIG_FILE).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.interval_secs == 0 {
            return Err(CoreError::InvalidConfig("interval_secs must be positive".to_string()));
        }
        if TimeDelta::try_seconds(self.interval_secs as i64).is_none() {
            return Err(CoreError::InvalidConfig(format!(
                "interval_secs {} is out of range",
                self.interval_secs
            )));
        }
        if self.channel_capacity == 0 {
            return Err(CoreError::InvalidConfig("channel_capacity must be at least 1".to_string()));
        }
        if self.max_lookahead_buckets == 0 {
            return Err(CoreError::InvalidConfig(
                "max_lookahead_buckets must be at least 1".to_string(),
            ));
        }
        if self.simulation.sources == 0 {
            return Err(CoreError::InvalidConfig("at least one source is required".to_string()));
        }
        if self.simulation.tick_interval_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "simulation.tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.simulation.price_spread.is_sign_negative() {
            return Err(CoreError::InvalidConfig(
                "simulation.price_spread must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn source_error_wait(&self) -> Duration {
        Duration::from_millis(self.source_error_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IndexConfig::default();
        assert_eq!(config.instrument, Instrument::BTC_USD);
        assert_eq!(config.interval(), Duration::from_secs(60));
        assert_eq!(config.max_lookahead_buckets, 1);
        assert_eq!(config.simulation.sources, 100);
        assert_eq!(config.simulation.uptime(), Duration::from_secs(180));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = IndexConfig::default();
        config.interval_secs = 0;
        assert!(matches!(config.validate(), Err(CoreError::InvalidConfig(_))));

        let mut config = IndexConfig::default();
        config.simulation.sources = 0;
        assert!(config.validate().is_err());

        let mut config = IndexConfig::default();
        config.max_lookahead_buckets = 0;
        assert!(config.validate().is_err());

        let mut config = IndexConfig::default();
        config.channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_deserialization_keeps_defaults() {
        let config: IndexConfig = serde_json::from_str(
            r#"{"instrument": "ETH_USD", "interval_secs": 5, "simulation": {"sources": 3}}"#,
        )
        .unwrap();

        assert_eq!(config.instrument.as_str(), "ETH_USD");
        assert_eq!(config.interval_secs, 5);
        assert_eq!(config.simulation.sources, 3);
        assert_eq!(config.simulation.tick_interval_ms, 1000);
        assert_eq!(config.channel_capacity, 1024);
    }
}
