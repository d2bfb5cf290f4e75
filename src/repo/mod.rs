//! Forecast and scenario persistence
//!
//! The services only see the [`ForecastStore`] and [`ScenarioStore`] traits.
//! [`memory`] backs them with process memory; [`pg`] (feature `db`) with Postgres.

pub mod memory;

#[cfg(feature = "db")]
pub mod pg;

pub use memory::{InMemoryForecastStore, InMemoryScenarioStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    ExecutionLogEntry, Forecast, ForecastAccuracy, ForecastStatus, ForecastType, OptimizationAction,
    OptimizationScenario, PeakAnalysis, PredictionPoint, PredictionTier, Savings, ScenarioStatus,
};
use crate::error::Result;

/// Everything written when a forecast completes
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionUpdate {
    pub predictions: Vec<PredictionPoint>,
    pub accuracy: Option<ForecastAccuracy>,
    pub tier: PredictionTier,
    pub model_used: String,
    pub degraded_sources: Vec<String>,
    pub peak_analysis: Option<PeakAnalysis>,
    pub completed_at: DateTime<Utc>,
}

/// Outcome of a conditional scenario write
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The write happened; carries the updated scenario
    Applied(OptimizationScenario),
    /// The scenario was in another state; nothing changed
    Conflict(ScenarioStatus),
    NotFound,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ForecastStore: Send + Sync {
    async fn create(&self, forecast: &Forecast) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Forecast>>;

    /// Most recent forecast of `forecast_type` for the building
    async fn find_latest_by_building(
        &self,
        building_id: &str,
        forecast_type: ForecastType,
    ) -> Result<Option<Forecast>>;

    /// Store the predictions and mark the forecast `COMPLETED`. Only a
    /// `PROCESSING` forecast accepts a terminal write; any other status is a
    /// persistence error and leaves the row untouched.
    async fn update_predictions(&self, id: Uuid, update: &PredictionUpdate) -> Result<()>;

    /// Same `PROCESSING` guard as [`ForecastStore::update_predictions`]
    async fn update_status(
        &self,
        id: Uuid,
        status: ForecastStatus,
        error: Option<String>,
    ) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScenarioStore: Send + Sync {
    async fn create(&self, scenario: &OptimizationScenario) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OptimizationScenario>>;

    /// Newest first
    async fn list_by_building(&self, building_id: &str) -> Result<Vec<OptimizationScenario>>;

    /// `PENDING -> APPROVED`, recording the approver. Atomic: of two
    /// concurrent callers only one sees `Applied`.
    async fn approve(&self, id: Uuid, approver_id: &str, at: DateTime<Utc>) -> Result<Transition>;

    /// Compare-and-set on the status column
    async fn update_status(
        &self,
        id: Uuid,
        from: ScenarioStatus,
        to: ScenarioStatus,
    ) -> Result<Transition>;

    async fn append_execution_log(&self, id: Uuid, entry: &ExecutionLogEntry) -> Result<()>;

    /// Record the measured impact of one executed action and refresh actual
    /// savings in a single atomic read-modify-write. An action that is not
    /// `EXECUTED` or out of range is a validation error.
    async fn set_action_impact(
        &self,
        id: Uuid,
        action_index: usize,
        actual_impact: f64,
    ) -> Result<OptimizationScenario>;

    /// Replace the action list and actual savings after dispatch
    async fn update_execution(
        &self,
        id: Uuid,
        actions: &[OptimizationAction],
        actual_savings: Option<Savings>,
    ) -> Result<()>;
}
