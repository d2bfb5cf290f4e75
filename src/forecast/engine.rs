//! Prediction engine
//!
//! Produces the prediction series of a forecast by trying three tiers in
//! order, first success wins:
//! 1. the ML provider, when historical data exists
//! 2. a statistical profile over historical data
//! 3. a synthetic profile when there is no history at all
//!
//! Upstream failures never escape this module; they only decide which tier runs.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::aggregator::EnrichmentContext;
use super::metrics::{
    heuristic_accuracy, ForecastMetrics, STATISTICAL_HEURISTIC, SYNTHETIC_HEURISTIC,
};
use super::profile::{round2, LoadProfile};
use crate::clients::{bounded, HistoricalData, PredictionProvider, PredictionRequest};
use crate::domain::{
    validate_series, AccuracyMethod, ForecastAccuracy, PredictionPoint, PredictionTier,
};
use crate::error::{PlannerError, Result};

pub const UNIT_KW: &str = "kW";

const STATISTICAL_START_CONFIDENCE: f64 = 0.95;
const CONFIDENCE_DECAY_PER_HOUR: f64 = 0.01;
const CONFIDENCE_FLOOR: f64 = 0.5;
const SYNTHETIC_CONFIDENCE: f64 = 0.90;
const SYNTHETIC_MARGIN: f64 = 0.15;
const SYNTHETIC_BASELINE_KW: std::ops::Range<f64> = 50.0..100.0;
/// Hours held out of the history when backtesting the statistical profile
const BACKTEST_HOLDOUT: usize = 24;

/// What to predict
#[derive(Debug, Clone)]
pub struct PredictionInput<'a> {
    pub building_id: &'a str,
    pub device_id: Option<&'a str>,
    pub horizon_hours: u32,
    /// Timestamp of the first prediction; later points follow hourly
    pub start: DateTime<Utc>,
    pub context: &'a EnrichmentContext,
}

/// Predictions plus their provenance
#[derive(Debug, Clone)]
pub struct PredictionOutput {
    pub predictions: Vec<PredictionPoint>,
    pub accuracy: Option<ForecastAccuracy>,
    pub tier: PredictionTier,
    pub model_used: String,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub model_type: String,
    pub timeout: std::time::Duration,
    pub backtest_accuracy: bool,
}

pub struct PredictionEngine {
    predictor: Arc<dyn PredictionProvider>,
    profile: LoadProfile,
    settings: EngineSettings,
}

impl PredictionEngine {
    pub fn new(
        predictor: Arc<dyn PredictionProvider>,
        profile: LoadProfile,
        settings: EngineSettings,
    ) -> Self {
        Self {
            predictor,
            profile,
            settings,
        }
    }

    /// Always yields a series: the synthetic tier cannot fail.
    pub async fn predict(&self, input: &PredictionInput<'_>) -> PredictionOutput {
        if let Some(history) = input.context.historical.as_ref().filter(|h| !h.is_empty()) {
            match self.ml_tier(input, history).await {
                Ok(output) => {
                    info!(
                        building_id = input.building_id,
                        model = %output.model_used,
                        "ML tier produced forecast"
                    );
                    return output;
                }
                Err(e) => {
                    warn!(
                        building_id = input.building_id,
                        error = %e,
                        "ML tier unavailable, falling back to statistical"
                    );
                }
            }
            let output = self.statistical_tier(input, history);
            info!(building_id = input.building_id, "statistical tier produced forecast");
            return output;
        }

        info!(building_id = input.building_id, "no historical data, using synthetic tier");
        self.synthetic_tier(input, &mut rand::thread_rng())
    }

    async fn ml_tier(
        &self,
        input: &PredictionInput<'_>,
        history: &HistoricalData,
    ) -> Result<PredictionOutput> {
        let request = PredictionRequest {
            building_id: input.building_id.to_string(),
            device_id: input.device_id.map(str::to_string),
            historical_data: history.points.clone(),
            weather_forecast: input.context.weather.as_ref().map(|w| w.forecast.clone()),
            tariff_data: input.context.tariff.clone(),
            horizon_hours: input.horizon_hours,
            model_type: self.settings.model_type.clone(),
        };

        let deadline = Instant::now() + self.settings.timeout;
        let response = bounded("ml", deadline, self.predictor.predict(&request)).await?;

        validate_series(&response.predictions, input.horizon_hours)
            .map_err(|reason| {
                PlannerError::upstream("ml", format!("rejected predictions: {reason}"))
            })?;

        Ok(PredictionOutput {
            predictions: response.predictions,
            accuracy: response.accuracy.map(Into::into),
            tier: PredictionTier::Ml,
            model_used: response.model_used,
        })
    }

    /// Baseline = mean of history, spread = (peak - min) / 4. The margin widens
    /// from the spread to 1.5x the spread across the horizon while confidence
    /// decays by one point per hour.
    pub fn statistical_tier(
        &self,
        input: &PredictionInput<'_>,
        history: &HistoricalData,
    ) -> PredictionOutput {
        let values: Vec<f64> = history.points.iter().map(|p| p.value_kw).collect();
        let baseline = mean(&values);
        let summary = history.summary.clone().or_else(|| history.computed_summary());
        let variance = summary
            .map(|s| ((s.peak_kw - s.min_kw) / 4.0).max(0.0))
            .unwrap_or(0.0);

        let horizon = input.horizon_hours.max(1) as f64;
        let predictions = (0..input.horizon_hours)
            .map(|i| {
                let timestamp = input.start + Duration::hours(i as i64);
                let temperature = input.context.temperature_at(timestamp);
                let factor = self.profile.factor(timestamp, temperature);
                let predicted = (baseline * factor).max(0.0);
                let margin = variance * (1.0 + 0.5 * (i as f64 / horizon));
                let confidence = (STATISTICAL_START_CONFIDENCE
                    - CONFIDENCE_DECAY_PER_HOUR * i as f64)
                    .max(CONFIDENCE_FLOOR);
                PredictionPoint {
                    timestamp,
                    predicted_value: round2(predicted),
                    lower_bound: round2((predicted - margin).max(0.0)),
                    upper_bound: round2(predicted + margin),
                    confidence_level: round2(confidence),
                    unit: UNIT_KW.to_string(),
                }
            })
            .collect();

        PredictionOutput {
            predictions,
            accuracy: Some(self.statistical_accuracy(history)),
            tier: PredictionTier::Statistical,
            model_used: "statistical-profile".to_string(),
        }
    }

    /// Replay the profile over the last day of history using a baseline
    /// learned from the days before it. Falls back to placeholder figures
    /// when there is too little history or backtesting is disabled.
    fn statistical_accuracy(&self, history: &HistoricalData) -> ForecastAccuracy {
        let points = &history.points;
        if !self.settings.backtest_accuracy || points.len() < BACKTEST_HOLDOUT * 2 {
            return heuristic_accuracy(STATISTICAL_HEURISTIC);
        }

        let (train, test) = points.split_at(points.len() - BACKTEST_HOLDOUT);
        let baseline = mean(&train.iter().map(|p| p.value_kw).collect::<Vec<_>>());
        let actual: Vec<f64> = test.iter().map(|p| p.value_kw).collect();
        let predicted: Vec<f64> = test
            .iter()
            .map(|p| baseline * self.profile.factor(p.timestamp, None))
            .collect();

        match ForecastMetrics::calculate(&actual, &predicted) {
            Ok(metrics) => {
                debug!(%metrics, "statistical profile backtested");
                metrics.into_accuracy(AccuracyMethod::Backtest)
            }
            Err(e) => {
                warn!(error = %e, "backtest failed, using heuristic accuracy");
                heuristic_accuracy(STATISTICAL_HEURISTIC)
            }
        }
    }

    /// Profile over a random baseline in [50, 100) kW with a fixed ±15% band.
    pub fn synthetic_tier<R: Rng + ?Sized>(
        &self,
        input: &PredictionInput<'_>,
        rng: &mut R,
    ) -> PredictionOutput {
        let baseline = rng.gen_range(SYNTHETIC_BASELINE_KW);
        let predictions = (0..input.horizon_hours)
            .map(|i| {
                let timestamp = input.start + Duration::hours(i as i64);
                let temperature = input.context.temperature_at(timestamp);
                let predicted = baseline * self.profile.factor(timestamp, temperature);
                let margin = predicted * SYNTHETIC_MARGIN;
                PredictionPoint {
                    timestamp,
                    predicted_value: round2(predicted),
                    lower_bound: round2(predicted - margin),
                    upper_bound: round2(predicted + margin),
                    confidence_level: SYNTHETIC_CONFIDENCE,
                    unit: UNIT_KW.to_string(),
                }
            })
            .collect();

        PredictionOutput {
            predictions,
            accuracy: Some(heuristic_accuracy(SYNTHETIC_HEURISTIC)),
            tier: PredictionTier::Synthetic,
            model_used: "synthetic-profile".to_string(),
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
