use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{
    header::{HeaderMap, HeaderValue, USER_AGENT},
    Client, RequestBuilder,
};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{
    BatchResponse, DeviceControl, HistoricalData, HistoricalProvider, OptimizationBatch,
    PredictionProvider, PredictionRequest, PredictionResponse, TariffData, TariffProvider,
    WeatherData, WeatherProvider,
};
use crate::config::CollaboratorsConfig;
use crate::error::{PlannerError, Result};

/// reqwest-backed client for every collaborator service
pub struct HttpCollaborators {
    client: Client,
    weather_url: String,
    tariff_url: String,
    historical_url: String,
    ml_url: String,
    device_control_url: String,
}

impl HttpCollaborators {
    pub fn new(cfg: &CollaboratorsConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_str(&cfg.user_agent)?);
        let client = Client::builder()
            .timeout(cfg.request_timeout())
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            weather_url: trim(&cfg.weather_url),
            tariff_url: trim(&cfg.tariff_url),
            historical_url: trim(&cfg.historical_url),
            ml_url: trim(&cfg.ml_url),
            device_control_url: trim(&cfg.device_control_url),
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        source: &str,
        request: RequestBuilder,
    ) -> Result<T> {
        let resp = request
            .send()
            .await
            .map_err(|e| PlannerError::upstream(source, e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| PlannerError::upstream(source, e))?;
        if !status.is_success() {
            return Err(PlannerError::upstream(
                source,
                format!("HTTP {status}: {body}"),
            ));
        }
        debug!(source, %status, "collaborator responded");
        serde_json::from_str(&body)
            .map_err(|e| PlannerError::upstream(source, format!("invalid response body: {e}")))
    }
}

fn trim(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl WeatherProvider for HttpCollaborators {
    async fn fetch_weather(
        &self,
        building_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<WeatherData> {
        let request = self
            .client
            .get(format!("{}/api/weather", self.weather_url))
            .query(&[("buildingId", building_id.to_string()), ("from", ts(from)), ("to", ts(to))]);
        self.send_json("weather", request).await
    }
}

#[async_trait]
impl TariffProvider for HttpCollaborators {
    async fn fetch_tariff(&self, building_id: &str) -> Result<TariffData> {
        let request = self
            .client
            .get(format!("{}/api/tariffs/current", self.tariff_url))
            .query(&[("buildingId", building_id)]);
        self.send_json("tariff", request).await
    }
}

#[async_trait]
impl HistoricalProvider for HttpCollaborators {
    async fn fetch_historical(
        &self,
        building_id: &str,
        device_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HistoricalData> {
        let mut query = vec![
            ("buildingId", building_id.to_string()),
            ("from", ts(from)),
            ("to", ts(to)),
        ];
        if let Some(device_id) = device_id {
            query.push(("deviceId", device_id.to_string()));
        }
        let request = self
            .client
            .get(format!("{}/api/consumption", self.historical_url))
            .query(&query);
        self.send_json("historical", request).await
    }
}

#[async_trait]
impl PredictionProvider for HttpCollaborators {
    async fn predict(&self, request: &PredictionRequest) -> Result<PredictionResponse> {
        let request = self
            .client
            .post(format!("{}/api/predict", self.ml_url))
            .json(request);
        self.send_json("ml", request).await
    }
}

#[async_trait]
impl DeviceControl for HttpCollaborators {
    async fn apply_optimization(&self, batch: &OptimizationBatch) -> Result<BatchResponse> {
        let request = self
            .client
            .post(format!("{}/api/optimizations/apply", self.device_control_url))
            .header("Idempotency-Key", batch.idempotency_key.as_str())
            .json(batch);
        self.send_json("device-control", request).await
    }
}
