#![allow(dead_code)]

use async_trait::async_trait;
use building_energy_planner::clients::{
    BatchResponse, Collaborators, DeviceControl, HistoricalData, HistoricalPoint,
    HistoricalProvider, OptimizationBatch, PredictionProvider, PredictionRequest,
    PredictionResponse, TariffData, TariffProvider, WeatherData, WeatherPoint, WeatherProvider,
};
use building_energy_planner::config::Config;
use building_energy_planner::controller::AppState;
use building_energy_planner::domain::{
    DeviceError, Forecast, ForecastStatus, ForecastType, PredictionPoint,
};
use building_energy_planner::error::{PlannerError, Result};
use building_energy_planner::optimizer::{DeviceKind, DeviceProfile};
use building_energy_planner::repo::{
    ForecastStore, InMemoryForecastStore, InMemoryScenarioStore, PredictionUpdate, ScenarioStore,
};
use chrono::{DateTime, Duration, Timelike, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub const BUILDING: &str = "building-1";
pub const BASE_KW: f64 = 60.0;

/// Hourly load the fake model returns: flat at `BASE_KW` with an
/// afternoon bump in hours 3..=5 of the horizon.
pub const PEAK_SHAPE: [f64; 3] = [90.0, 95.0, 90.0];

/// Weather, tariff, history and model for one building
pub struct FakeBuilding {
    pub ml_calls: AtomicUsize,
}

impl FakeBuilding {
    pub fn new() -> Self {
        Self { ml_calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl WeatherProvider for FakeBuilding {
    async fn fetch_weather(
        &self,
        _: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<WeatherData> {
        let hours = (to - from).num_hours().max(0);
        Ok(WeatherData {
            current: None,
            forecast: (0..hours)
                .map(|i| WeatherPoint {
                    timestamp: from + Duration::hours(i),
                    temperature_c: 24.0,
                    humidity_percent: Some(45.0),
                    cloud_cover_percent: None,
                })
                .collect(),
        })
    }
}

#[async_trait]
impl TariffProvider for FakeBuilding {
    async fn fetch_tariff(&self, _: &str) -> Result<TariffData> {
        Ok(TariffData {
            region: "SE3".to_string(),
            rate_per_kwh: 0.2,
            currency: "EUR".to_string(),
            peak_rate_per_kwh: Some(0.4),
        })
    }
}

#[async_trait]
impl HistoricalProvider for FakeBuilding {
    async fn fetch_historical(
        &self,
        _: &str,
        _: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HistoricalData> {
        let hours = (to - from).num_hours().max(0);
        Ok(HistoricalData {
            points: (0..hours)
                .map(|i| HistoricalPoint {
                    timestamp: from + Duration::hours(i),
                    value_kw: BASE_KW,
                })
                .collect(),
            summary: None,
        })
    }
}

#[async_trait]
impl PredictionProvider for FakeBuilding {
    async fn predict(&self, request: &PredictionRequest) -> Result<PredictionResponse> {
        self.ml_calls.fetch_add(1, Ordering::SeqCst);
        let start = Utc::now()
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .ok_or_else(|| PlannerError::upstream("ml", "clock"))?
            + Duration::hours(1);
        Ok(PredictionResponse {
            predictions: (0..request.horizon_hours as usize)
                .map(|i| {
                    let value = match i {
                        3..=5 => PEAK_SHAPE[i - 3],
                        _ => BASE_KW,
                    };
                    PredictionPoint {
                        timestamp: start + Duration::hours(i as i64),
                        predicted_value: value,
                        lower_bound: value - 5.0,
                        upper_bound: value + 5.0,
                        confidence_level: 0.9,
                        unit: "kW".to_string(),
                    }
                })
                .collect(),
            model_used: "fake-gbm".to_string(),
            accuracy: None,
        })
    }
}

/// Device control that keeps the state of every device it touches. State
/// only changes for batches with `executeNow` set and `dryRun` unset.
pub struct FakeDevices {
    pub state: Mutex<HashMap<String, f64>>,
    pub batches: Mutex<Vec<OptimizationBatch>>,
    /// Every action for this device is rejected
    pub failing_device: Option<String>,
}

impl FakeDevices {
    pub fn new(devices: &[DeviceProfile]) -> Self {
        Self {
            state: Mutex::new(
                devices.iter().map(|d| (d.device_id.clone(), d.current_value)).collect(),
            ),
            batches: Mutex::new(Vec::new()),
            failing_device: None,
        }
    }

    pub fn failing(devices: &[DeviceProfile], device_id: &str) -> Self {
        Self { failing_device: Some(device_id.to_string()), ..Self::new(devices) }
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.state.lock().clone()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }
}

#[async_trait]
impl DeviceControl for FakeDevices {
    async fn apply_optimization(&self, batch: &OptimizationBatch) -> Result<BatchResponse> {
        self.batches.lock().push(batch.clone());

        let mut errors = Vec::new();
        let mut queued = 0;
        for (index, action) in batch.actions.iter().enumerate() {
            if self.failing_device.as_deref() == Some(action.device_id.as_str()) {
                errors.push(DeviceError {
                    device_id: action.device_id.clone(),
                    action_index: Some(index),
                    message: "device offline".to_string(),
                });
                continue;
            }
            queued += 1;
            if batch.execute_now && !batch.dry_run {
                self.state.lock().insert(action.device_id.clone(), action.target_value);
            }
        }

        Ok(BatchResponse {
            execution_id: format!("exec-{}", self.batches.lock().len()),
            actions_queued: queued,
            actions_skipped: errors.len() as u32,
            errors,
        })
    }
}

/// Forecast store whose prediction writes always fail
pub struct BrokenForecastStore {
    pub inner: InMemoryForecastStore,
}

#[async_trait]
impl ForecastStore for BrokenForecastStore {
    async fn create(&self, forecast: &Forecast) -> Result<()> {
        self.inner.create(forecast).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Forecast>> {
        self.inner.find_by_id(id).await
    }

    async fn find_latest_by_building(
        &self,
        building_id: &str,
        forecast_type: ForecastType,
    ) -> Result<Option<Forecast>> {
        self.inner.find_latest_by_building(building_id, forecast_type).await
    }

    async fn update_predictions(&self, _: Uuid, _: &PredictionUpdate) -> Result<()> {
        Err(PlannerError::persistence("disk full"))
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ForecastStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.inner.update_status(id, status, error).await
    }
}

pub fn devices() -> Vec<DeviceProfile> {
    vec![
        DeviceProfile {
            device_id: "hvac-1".to_string(),
            kind: DeviceKind::Hvac,
            rated_kw: 40.0,
            current_value: 22.0,
        },
        DeviceProfile {
            device_id: "lights-1".to_string(),
            kind: DeviceKind::Lighting,
            rated_kw: 10.0,
            current_value: 100.0,
        },
    ]
}

pub fn collaborators(building: Arc<FakeBuilding>, devices: Arc<FakeDevices>) -> Collaborators {
    Collaborators {
        weather: building.clone(),
        tariff: building.clone(),
        historical: building.clone(),
        predictor: building,
        device_control: devices,
        timeout: std::time::Duration::from_secs(2),
    }
}

pub struct Harness {
    pub app: AppState,
    pub building: Arc<FakeBuilding>,
    pub devices: Arc<FakeDevices>,
    pub scenarios: Arc<InMemoryScenarioStore>,
}

pub fn harness_with(devices: FakeDevices, forecast_store: Arc<dyn ForecastStore>) -> Harness {
    let building = Arc::new(FakeBuilding::new());
    let devices = Arc::new(devices);
    let scenarios = Arc::new(InMemoryScenarioStore::new());
    let scenario_store: Arc<dyn ScenarioStore> = scenarios.clone();
    let app = AppState::with_parts(
        Config::default(),
        collaborators(building.clone(), devices.clone()),
        forecast_store,
        scenario_store,
    )
    .expect("app state");
    Harness { app, building, devices, scenarios }
}

pub fn harness() -> Harness {
    harness_with(FakeDevices::new(&devices()), Arc::new(InMemoryForecastStore::new()))
}
