//! Forecast job orchestration
//!
//! A forecast is written twice: a `PROCESSING` record when requested, then
//! one terminal write from the background job (`COMPLETED` with predictions,
//! or `FAILED` with the persistence error that stopped it).

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};
use uuid::Uuid;
use validator::Validate;

use super::aggregator::{ContextRequest, DataAggregator, EnrichmentContext};
use super::engine::{EngineSettings, PredictionEngine, PredictionInput};
use super::peaks::PeakPeriodDetector;
use super::profile::{next_hour, LoadProfile};
use crate::clients::Collaborators;
use crate::config::Config;
use crate::domain::{Forecast, ForecastStatus, ForecastType, PeakAnalysis, PredictionPoint};
use crate::error::{PlannerError, Result};
use crate::repo::{ForecastStore, PredictionUpdate};

fn default_forecast_type() -> ForecastType {
    ForecastType::Consumption
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ForecastRequest {
    #[validate(length(min = 1))]
    pub building_id: String,
    pub device_id: Option<String>,
    #[serde(default = "default_forecast_type")]
    pub forecast_type: ForecastType,
    /// Defaults to the configured horizon
    #[validate(range(min = 1, max = 168))]
    pub horizon_hours: Option<u32>,
    /// Peak threshold above baseline (%), for `PEAK_LOAD` forecasts
    #[validate(range(exclusive_min = 0.0, max = 500.0))]
    pub threshold_percent: Option<f64>,
}

impl ForecastRequest {
    pub fn new(building_id: impl Into<String>, forecast_type: ForecastType) -> Self {
        Self {
            building_id: building_id.into(),
            device_id: None,
            forecast_type,
            horizon_hours: None,
            threshold_percent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForecastSettings {
    pub default_horizon_hours: u32,
    pub max_horizon_hours: u32,
    pub history_lookback_hours: u32,
    pub threshold_percent: f64,
}

impl ForecastSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            default_horizon_hours: cfg.forecast.default_horizon_hours,
            max_horizon_hours: cfg.forecast.max_horizon_hours,
            history_lookback_hours: cfg.forecast.history_lookback_hours,
            threshold_percent: cfg.peaks.threshold_percent,
        }
    }
}

/// A running forecast job
pub struct ForecastJob {
    /// The record as first persisted, still `PROCESSING`
    pub forecast: Forecast,
    pub handle: JoinHandle<Result<Forecast>>,
}

impl ForecastJob {
    /// Wait for the terminal write
    pub async fn wait(self) -> Result<Forecast> {
        self.handle
            .await
            .map_err(|e| {
                PlannerError::persistence(format!("forecast job {} aborted: {e}", self.forecast.id))
            })?
    }
}

/// Source of the current time; the forecast window starts at the next whole hour
pub type Clock = fn() -> DateTime<Utc>;

struct Inner {
    clock: Clock,
    store: Arc<dyn ForecastStore>,
    aggregator: DataAggregator,
    engine: PredictionEngine,
    detector: PeakPeriodDetector,
    settings: ForecastSettings,
}

#[derive(Clone)]
pub struct ForecastService {
    inner: Arc<Inner>,
}

impl ForecastService {
    pub fn new(
        store: Arc<dyn ForecastStore>,
        aggregator: DataAggregator,
        engine: PredictionEngine,
        settings: ForecastSettings,
    ) -> Self {
        Self::with_clock(store, aggregator, engine, settings, Utc::now)
    }

    pub fn with_clock(
        store: Arc<dyn ForecastStore>,
        aggregator: DataAggregator,
        engine: PredictionEngine,
        settings: ForecastSettings,
        clock: Clock,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                store,
                aggregator,
                engine,
                detector: PeakPeriodDetector::new(),
                settings,
            }),
        }
    }

    pub fn from_config(
        cfg: &Config,
        collaborators: &Collaborators,
        store: Arc<dyn ForecastStore>,
    ) -> anyhow::Result<Self> {
        let aggregator = DataAggregator::new(
            collaborators.weather.clone(),
            collaborators.tariff.clone(),
            collaborators.historical.clone(),
            collaborators.timeout,
        );
        let engine = PredictionEngine::new(
            collaborators.predictor.clone(),
            LoadProfile::new(cfg.forecast.tz()?),
            EngineSettings {
                model_type: cfg.forecast.model_type.clone(),
                timeout: collaborators.timeout,
                backtest_accuracy: cfg.forecast.backtest_accuracy,
            },
        );
        Ok(Self::new(store, aggregator, engine, ForecastSettings::from_config(cfg)))
    }

    /// Validate, persist the `PROCESSING` record and start generation.
    /// Fails only on validation or when the record cannot be created.
    #[instrument(
        skip(self, req),
        fields(building_id = %req.building_id, forecast_type = %req.forecast_type)
    )]
    pub async fn request_forecast(&self, req: ForecastRequest) -> Result<ForecastJob> {
        req.validate()?;
        let settings = &self.inner.settings;
        let horizon = req.horizon_hours.unwrap_or(settings.default_horizon_hours);
        if horizon == 0 || horizon > settings.max_horizon_hours {
            return Err(PlannerError::Validation(format!(
                "horizon_hours must be between 1 and {}, got {horizon}",
                settings.max_horizon_hours
            )));
        }
        let threshold_percent = req.threshold_percent.unwrap_or(settings.threshold_percent);

        let forecast =
            Forecast::processing(req.building_id, req.device_id, req.forecast_type, horizon);
        self.inner.store.create(&forecast).await?;
        info!(forecast_id = %forecast.id, horizon, "forecast record created");

        let inner = self.inner.clone();
        let snapshot = forecast.clone();
        let handle = tokio::spawn(async move { inner.run(snapshot, threshold_percent).await });

        Ok(ForecastJob { forecast, handle })
    }

    /// Request a forecast and wait for it to finish
    pub async fn generate_forecast(&self, req: ForecastRequest) -> Result<Forecast> {
        self.request_forecast(req).await?.wait().await
    }

    pub async fn get(&self, id: Uuid) -> Result<Forecast> {
        self.inner
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| PlannerError::NotFound(format!("forecast {id}")))
    }

    pub async fn latest(
        &self,
        building_id: &str,
        forecast_type: ForecastType,
    ) -> Result<Option<Forecast>> {
        self.inner.store.find_latest_by_building(building_id, forecast_type).await
    }

    /// Peak analysis of an existing forecast against its own mean load
    pub fn analyze_peaks(
        &self,
        forecast: &Forecast,
        threshold_percent: Option<f64>,
    ) -> PeakAnalysis {
        let pct = threshold_percent.unwrap_or(self.inner.settings.threshold_percent);
        self.inner
            .detector
            .detect(&forecast.predictions, forecast.average_load(), pct)
    }
}

impl Inner {
    async fn run(&self, mut forecast: Forecast, threshold_percent: f64) -> Result<Forecast> {
        let now = (self.clock)();
        let start = next_hour(now);
        let ctx = self
            .aggregator
            .gather(&ContextRequest {
                building_id: forecast.building_id.clone(),
                device_id: forecast.device_id.clone(),
                history_from: now - Duration::hours(self.settings.history_lookback_hours as i64),
                history_to: now,
                forecast_from: start,
                forecast_to: start + Duration::hours(forecast.horizon_hours as i64),
            })
            .await;

        let output = self
            .engine
            .predict(&PredictionInput {
                building_id: &forecast.building_id,
                device_id: forecast.device_id.as_deref(),
                horizon_hours: forecast.horizon_hours,
                start,
                context: &ctx,
            })
            .await;

        let peak_analysis = match forecast.forecast_type {
            ForecastType::PeakLoad => {
                Some(self.peaks_for(&output.predictions, &ctx, threshold_percent))
            }
            ForecastType::Consumption => None,
        };

        let update = PredictionUpdate {
            predictions: output.predictions,
            accuracy: output.accuracy,
            tier: output.tier,
            model_used: output.model_used,
            degraded_sources: ctx.degraded,
            peak_analysis,
            completed_at: (self.clock)(),
        };

        if let Err(e) = self.store.update_predictions(forecast.id, &update).await {
            error!(
                forecast_id = %forecast.id,
                error = %e,
                "failed to store predictions, marking forecast failed"
            );
            if let Err(mark) = self
                .store
                .update_status(forecast.id, ForecastStatus::Failed, Some(e.to_string()))
                .await
            {
                error!(forecast_id = %forecast.id, error = %mark, "failed to mark forecast failed");
            }
            return Err(e);
        }

        info!(
            forecast_id = %forecast.id,
            tier = %update.tier,
            model = %update.model_used,
            points = update.predictions.len(),
            "forecast completed"
        );

        forecast.status = ForecastStatus::Completed;
        forecast.predictions = update.predictions;
        forecast.accuracy = update.accuracy;
        forecast.tier = Some(update.tier);
        forecast.model_used = Some(update.model_used);
        forecast.degraded_sources = update.degraded_sources;
        forecast.peak_analysis = update.peak_analysis;
        forecast.completed_at = Some(update.completed_at);
        Ok(forecast)
    }

    /// Baseline is the historical average when history exists, else the
    /// mean of the predictions themselves.
    fn peaks_for(
        &self,
        predictions: &[PredictionPoint],
        ctx: &EnrichmentContext,
        threshold_percent: f64,
    ) -> PeakAnalysis {
        let baseline = ctx.historical_average().unwrap_or_else(|| {
            if predictions.is_empty() {
                0.0
            } else {
                let total: f64 = predictions.iter().map(|p| p.predicted_value).sum();
                total / predictions.len() as f64
            }
        });
        self.detector.detect(predictions, baseline, threshold_percent)
    }
}
