use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{DeviceError, ForecastAccuracy, OptimizationAction, PredictionPoint};

/// One historical consumption sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalPoint {
    pub timestamp: DateTime<Utc>,
    pub value_kw: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalSummary {
    pub average_kw: f64,
    pub peak_kw: f64,
    pub min_kw: f64,
}

/// Historical consumption for a building/device window, oldest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalData {
    pub points: Vec<HistoricalPoint>,
    pub summary: Option<HistoricalSummary>,
}

impl HistoricalData {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Summary computed from the points themselves
    pub fn computed_summary(&self) -> Option<HistoricalSummary> {
        if self.points.is_empty() {
            return None;
        }
        let values = self.points.iter().map(|p| p.value_kw);
        let sum: f64 = values.clone().sum();
        let peak = values.clone().fold(f64::NEG_INFINITY, f64::max);
        let min = values.fold(f64::INFINITY, f64::min);
        Some(HistoricalSummary {
            average_kw: sum / self.points.len() as f64,
            peak_kw: peak,
            min_kw: min,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherPoint {
    pub timestamp: DateTime<Utc>,
    pub temperature_c: f64,
    #[serde(default)]
    pub humidity_percent: Option<f64>,
    #[serde(default)]
    pub cloud_cover_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherData {
    pub current: Option<WeatherPoint>,
    #[serde(default)]
    pub forecast: Vec<WeatherPoint>,
}

impl WeatherData {
    /// Temperature nearest to `at`: a forecast point within three hours, else current conditions.
    pub fn temperature_at(&self, at: DateTime<Utc>) -> Option<f64> {
        self.forecast
            .iter()
            .map(|p| ((p.timestamp - at).num_seconds().abs(), p.temperature_c))
            .filter(|(gap, _)| *gap <= 3 * 3600)
            .min_by_key(|(gap, _)| *gap)
            .map(|(_, t)| t)
            .or_else(|| self.current.as_ref().map(|c| c.temperature_c))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TariffData {
    pub region: String,
    pub rate_per_kwh: f64,
    pub currency: String,
    #[serde(default)]
    pub peak_rate_per_kwh: Option<f64>,
}

impl TariffData {
    /// Rate that applies to energy avoided during peaks
    pub fn peak_rate(&self) -> f64 {
        self.peak_rate_per_kwh.unwrap_or(self.rate_per_kwh)
    }
}

/// Structured request to the ML prediction provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionRequest {
    pub building_id: String,
    pub device_id: Option<String>,
    pub historical_data: Vec<HistoricalPoint>,
    pub weather_forecast: Option<Vec<WeatherPoint>>,
    pub tariff_data: Option<TariffData>,
    pub horizon_hours: u32,
    pub model_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelAccuracy {
    pub mae: f64,
    pub rmse: f64,
    pub mape: f64,
    pub score: f64,
}

impl From<ModelAccuracy> for ForecastAccuracy {
    fn from(a: ModelAccuracy) -> Self {
        ForecastAccuracy {
            mae: a.mae,
            rmse: a.rmse,
            mape: a.mape,
            score: a.score,
            method: crate::domain::AccuracyMethod::ModelReported,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionResponse {
    pub predictions: Vec<PredictionPoint>,
    pub model_used: String,
    #[serde(default)]
    pub accuracy: Option<ModelAccuracy>,
}

/// Scenario-scoped batch sent to device control
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationBatch {
    pub scenario_id: Uuid,
    pub building_id: String,
    pub actions: Vec<OptimizationAction>,
    pub execute_now: bool,
    pub dry_run: bool,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub execution_id: String,
    pub actions_queued: u32,
    pub actions_skipped: u32,
    #[serde(default)]
    pub errors: Vec<DeviceError>,
}
