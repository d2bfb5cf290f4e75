//! Outbound collaborators
//!
//! Every external service the planner talks to sits behind one of the traits
//! below. The [`Collaborators`] bundle is built once (see [`http::HttpCollaborators`])
//! and passed explicitly to the services, so tests can substitute fakes.

pub mod http;
pub mod types;

pub use http::HttpCollaborators;
pub use types::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time::Instant;

use crate::error::{PlannerError, Result};

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn fetch_weather(
        &self,
        building_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<WeatherData>;
}

#[async_trait]
pub trait TariffProvider: Send + Sync {
    async fn fetch_tariff(&self, building_id: &str) -> Result<TariffData>;
}

#[async_trait]
pub trait HistoricalProvider: Send + Sync {
    async fn fetch_historical(
        &self,
        building_id: &str,
        device_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HistoricalData>;
}

#[async_trait]
pub trait PredictionProvider: Send + Sync {
    async fn predict(&self, request: &PredictionRequest) -> Result<PredictionResponse>;
}

#[async_trait]
pub trait DeviceControl: Send + Sync {
    /// Non-2xx replies surface as `UpstreamUnavailable`.
    async fn apply_optimization(&self, batch: &OptimizationBatch) -> Result<BatchResponse>;
}

/// The capability set injected into the services
#[derive(Clone)]
pub struct Collaborators {
    pub weather: Arc<dyn WeatherProvider>,
    pub tariff: Arc<dyn TariffProvider>,
    pub historical: Arc<dyn HistoricalProvider>,
    pub predictor: Arc<dyn PredictionProvider>,
    pub device_control: Arc<dyn DeviceControl>,
    /// Caller deadline for each outbound call
    pub timeout: Duration,
}

impl Collaborators {
    /// All five capabilities served by one HTTP client
    pub fn from_http(client: Arc<HttpCollaborators>, timeout: Duration) -> Self {
        Self {
            weather: client.clone(),
            tariff: client.clone(),
            historical: client.clone(),
            predictor: client.clone(),
            device_control: client,
            timeout,
        }
    }
}

/// Run `fut` until `deadline`; running past it is reported like any other upstream failure.
pub async fn bounded<T, F>(source: &str, deadline: Instant, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(PlannerError::upstream(source, "deadline exceeded")),
    }
}
