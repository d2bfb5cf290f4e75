use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clients::{
    bounded, HistoricalData, HistoricalProvider, TariffData, TariffProvider, WeatherData,
    WeatherProvider,
};
use crate::error::Result;

/// Window of context to gather for one forecast
#[derive(Debug, Clone)]
pub struct ContextRequest {
    pub building_id: String,
    pub device_id: Option<String>,
    pub history_from: DateTime<Utc>,
    pub history_to: DateTime<Utc>,
    pub forecast_from: DateTime<Utc>,
    pub forecast_to: DateTime<Utc>,
}

/// Optional enrichment gathered before prediction. A missing source only
/// lowers prediction quality.
#[derive(Debug, Clone, Default)]
pub struct EnrichmentContext {
    pub historical: Option<HistoricalData>,
    pub weather: Option<WeatherData>,
    pub tariff: Option<TariffData>,
    /// Names of sources that failed or timed out
    pub degraded: Vec<String>,
}

impl EnrichmentContext {
    pub fn has_history(&self) -> bool {
        self.historical.as_ref().is_some_and(|h| !h.is_empty())
    }

    pub fn temperature_at(&self, at: DateTime<Utc>) -> Option<f64> {
        self.weather.as_ref().and_then(|w| w.temperature_at(at))
    }

    /// Average historical load, if any history was returned
    pub fn historical_average(&self) -> Option<f64> {
        self.historical
            .as_ref()
            .and_then(|h| h.computed_summary())
            .map(|s| s.average_kw)
    }
}

pub struct DataAggregator {
    weather: Arc<dyn WeatherProvider>,
    tariff: Arc<dyn TariffProvider>,
    historical: Arc<dyn HistoricalProvider>,
    timeout: Duration,
}

impl DataAggregator {
    pub fn new(
        weather: Arc<dyn WeatherProvider>,
        tariff: Arc<dyn TariffProvider>,
        historical: Arc<dyn HistoricalProvider>,
        timeout: Duration,
    ) -> Self {
        Self {
            weather,
            tariff,
            historical,
            timeout,
        }
    }

    /// Fetch weather, tariff and history concurrently under one deadline.
    /// Never fails: each unavailable source is logged and listed in `degraded`.
    pub async fn gather(&self, req: &ContextRequest) -> EnrichmentContext {
        let deadline = Instant::now() + self.timeout;

        let (weather, tariff, historical) = tokio::join!(
            bounded(
                "weather",
                deadline,
                self.weather
                    .fetch_weather(&req.building_id, req.forecast_from, req.forecast_to),
            ),
            bounded("tariff", deadline, self.tariff.fetch_tariff(&req.building_id)),
            bounded(
                "historical",
                deadline,
                self.historical.fetch_historical(
                    &req.building_id,
                    req.device_id.as_deref(),
                    req.history_from,
                    req.history_to,
                ),
            ),
        );

        let mut degraded = Vec::new();
        let ctx = EnrichmentContext {
            weather: keep("weather", &req.building_id, weather, &mut degraded),
            tariff: keep("tariff", &req.building_id, tariff, &mut degraded),
            historical: keep("historical", &req.building_id, historical, &mut degraded),
            degraded,
        };

        debug!(
            building_id = %req.building_id,
            history_points = ctx.historical.as_ref().map(|h| h.points.len()).unwrap_or(0),
            degraded = ?ctx.degraded,
            "enrichment context gathered"
        );
        ctx
    }
}

fn keep<T>(
    source: &str,
    building_id: &str,
    result: Result<T>,
    degraded: &mut Vec<String>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(source, building_id, error = %e, "enrichment source unavailable");
            degraded.push(source.to_string());
            None
        }
    }
}
