use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub collaborators: CollaboratorsConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
    #[serde(default)]
    pub peaks: PeaksConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorsConfig {
    pub weather_url: String,
    pub tariff_url: String,
    pub historical_url: String,
    pub ml_url: String,
    pub device_control_url: String,
    /// Deadline applied to every outbound call
    pub request_timeout_ms: u64,
    pub user_agent: String,
}

impl Default for CollaboratorsConfig {
    fn default() -> Self {
        Self {
            weather_url: "http://localhost:8081".to_string(),
            tariff_url: "http://localhost:8082".to_string(),
            historical_url: "http://localhost:8083".to_string(),
            ml_url: "http://localhost:8084".to_string(),
            device_control_url: "http://localhost:8085".to_string(),
            request_timeout_ms: 5_000,
            user_agent: "building-energy-planner/0.1".to_string(),
        }
    }
}

impl CollaboratorsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    pub default_horizon_hours: u32,
    pub max_horizon_hours: u32,
    pub history_lookback_hours: u32,
    pub model_type: String,
    /// IANA timezone used for time-of-day and weekend factors
    pub timezone: String,
    pub backtest_accuracy: bool,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            default_horizon_hours: 24,
            max_horizon_hours: 168,
            history_lookback_hours: 168,
            model_type: "ensemble".to_string(),
            timezone: "UTC".to_string(),
            backtest_accuracy: true,
        }
    }
}

impl ForecastConfig {
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow::anyhow!("invalid forecast.timezone '{}': {}", self.timezone, e))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeaksConfig {
    /// Percent above baseline at which a point counts as peak load
    pub threshold_percent: f64,
}

impl Default for PeaksConfig {
    fn default() -> Self {
        Self {
            threshold_percent: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub min_temperature_c: f64,
    pub max_temperature_c: f64,
    pub preserve_comfort: bool,
    /// Price per kWh used when no tariff is available
    pub tariff_fallback_rate: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            min_temperature_c: 20.0,
            max_temperature_c: 26.0,
            preserve_comfort: true,
            tariff_fallback_rate: 0.15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/building_energy".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub building_id: String,
    /// JSON file with the device inventory handed to the planner
    pub devices_file: Option<String>,
    pub requested_by: String,
}

impl Config {
    /// Defaults, then `config/default.toml`, then `BEP__`-prefixed environment variables.
    pub fn load() -> Result<Self> {
        Self::figment()
            .extract()
            .context("failed to load configuration")
    }

    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("BEP__").split("__"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.forecast.default_horizon_hours, 24);
        assert_eq!(cfg.forecast.max_horizon_hours, 168);
        assert_eq!(cfg.peaks.threshold_percent, 20.0);
        assert!(cfg.forecast.tz().is_ok());
        assert_eq!(cfg.collaborators.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_env_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("BEP__FORECAST__MAX_HORIZON_HOURS", "48");
            jail.set_env("BEP__PEAKS__THRESHOLD_PERCENT", "35.5");
            let cfg: Config = Config::figment().extract()?;
            assert_eq!(cfg.forecast.max_horizon_hours, 48);
            assert_eq!(cfg.peaks.threshold_percent, 35.5);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_timezone() {
        let forecast = ForecastConfig {
            timezone: "Mars/Olympus".to_string(),
            ..Default::default()
        };
        assert!(forecast.tz().is_err());
    }
}
