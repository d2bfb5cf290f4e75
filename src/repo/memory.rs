use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use super::{ForecastStore, PredictionUpdate, ScenarioStore, Transition};
use crate::domain::{
    ExecutionLogEntry, Forecast, ForecastStatus, ForecastType, OptimizationAction,
    OptimizationScenario, Savings, ScenarioStatus,
};
use crate::error::{PlannerError, Result};

/// Forecasts held in process memory
#[derive(Default)]
pub struct InMemoryForecastStore {
    forecasts: RwLock<HashMap<Uuid, Forecast>>,
}

impl InMemoryForecastStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn forecast_not_found(id: Uuid) -> PlannerError {
    PlannerError::NotFound(format!("forecast {id}"))
}

/// A forecast still open for its terminal write
fn processing(forecasts: &mut HashMap<Uuid, Forecast>, id: Uuid) -> Result<&mut Forecast> {
    let forecast = forecasts.get_mut(&id).ok_or_else(|| forecast_not_found(id))?;
    if forecast.status != ForecastStatus::Processing {
        let status = forecast.status;
        return Err(PlannerError::persistence(format!("forecast {id} is already {status}")));
    }
    Ok(forecast)
}

#[async_trait]
impl ForecastStore for InMemoryForecastStore {
    async fn create(&self, forecast: &Forecast) -> Result<()> {
        let mut forecasts = self.forecasts.write();
        if forecasts.contains_key(&forecast.id) {
            let id = forecast.id;
            return Err(PlannerError::persistence(format!("forecast {id} already exists")));
        }
        forecasts.insert(forecast.id, forecast.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Forecast>> {
        Ok(self.forecasts.read().get(&id).cloned())
    }

    async fn find_latest_by_building(
        &self,
        building_id: &str,
        forecast_type: ForecastType,
    ) -> Result<Option<Forecast>> {
        Ok(self
            .forecasts
            .read()
            .values()
            .filter(|f| f.building_id == building_id && f.forecast_type == forecast_type)
            .max_by_key(|f| f.created_at)
            .cloned())
    }

    async fn update_predictions(&self, id: Uuid, update: &PredictionUpdate) -> Result<()> {
        let mut forecasts = self.forecasts.write();
        let forecast = processing(&mut forecasts, id)?;
        forecast.predictions = update.predictions.clone();
        forecast.accuracy = update.accuracy.clone();
        forecast.tier = Some(update.tier);
        forecast.model_used = Some(update.model_used.clone());
        forecast.degraded_sources = update.degraded_sources.clone();
        forecast.peak_analysis = update.peak_analysis.clone();
        forecast.status = ForecastStatus::Completed;
        forecast.completed_at = Some(update.completed_at);
        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ForecastStatus,
        error: Option<String>,
    ) -> Result<()> {
        let mut forecasts = self.forecasts.write();
        let forecast = processing(&mut forecasts, id)?;
        forecast.status = status;
        forecast.error = error;
        if status.is_terminal() {
            forecast.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// Scenarios held in process memory. Conditional writes run under the
/// write lock, which makes them atomic.
#[derive(Default)]
pub struct InMemoryScenarioStore {
    scenarios: RwLock<HashMap<Uuid, OptimizationScenario>>,
}

impl InMemoryScenarioStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn compare_and_set<F>(&self, id: Uuid, expected: ScenarioStatus, apply: F) -> Transition
    where
        F: FnOnce(&mut OptimizationScenario),
    {
        let mut scenarios = self.scenarios.write();
        match scenarios.get_mut(&id) {
            None => Transition::NotFound,
            Some(s) if s.status != expected => Transition::Conflict(s.status),
            Some(s) => {
                apply(s);
                s.updated_at = Utc::now();
                Transition::Applied(s.clone())
            }
        }
    }
}

fn scenario_not_found(id: Uuid) -> PlannerError {
    PlannerError::NotFound(format!("scenario {id}"))
}

#[async_trait]
impl ScenarioStore for InMemoryScenarioStore {
    async fn create(&self, scenario: &OptimizationScenario) -> Result<()> {
        let mut scenarios = self.scenarios.write();
        if scenarios.contains_key(&scenario.id) {
            let id = scenario.id;
            return Err(PlannerError::persistence(format!("scenario {id} already exists")));
        }
        scenarios.insert(scenario.id, scenario.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OptimizationScenario>> {
        Ok(self.scenarios.read().get(&id).cloned())
    }

    async fn list_by_building(&self, building_id: &str) -> Result<Vec<OptimizationScenario>> {
        let mut list: Vec<_> = self
            .scenarios
            .read()
            .values()
            .filter(|s| s.building_id == building_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn approve(&self, id: Uuid, approver_id: &str, at: DateTime<Utc>) -> Result<Transition> {
        Ok(self.compare_and_set(id, ScenarioStatus::Pending, |s| {
            s.status = ScenarioStatus::Approved;
            s.approved_by = Some(approver_id.to_string());
            s.approved_at = Some(at);
        }))
    }

    async fn update_status(
        &self,
        id: Uuid,
        from: ScenarioStatus,
        to: ScenarioStatus,
    ) -> Result<Transition> {
        Ok(self.compare_and_set(id, from, |s| s.status = to))
    }

    async fn append_execution_log(&self, id: Uuid, entry: &ExecutionLogEntry) -> Result<()> {
        let mut scenarios = self.scenarios.write();
        let scenario = scenarios.get_mut(&id).ok_or_else(|| scenario_not_found(id))?;
        scenario.execution_log.push(entry.clone());
        scenario.updated_at = Utc::now();
        Ok(())
    }

    async fn set_action_impact(
        &self,
        id: Uuid,
        action_index: usize,
        actual_impact: f64,
    ) -> Result<OptimizationScenario> {
        let mut scenarios = self.scenarios.write();
        let scenario = scenarios.get_mut(&id).ok_or_else(|| scenario_not_found(id))?;
        scenario
            .record_impact(action_index, actual_impact)
            .map_err(PlannerError::Validation)?;
        scenario.updated_at = Utc::now();
        Ok(scenario.clone())
    }

    async fn update_execution(
        &self,
        id: Uuid,
        actions: &[OptimizationAction],
        actual_savings: Option<Savings>,
    ) -> Result<()> {
        let mut scenarios = self.scenarios.write();
        let scenario = scenarios.get_mut(&id).ok_or_else(|| scenario_not_found(id))?;
        scenario.actions = actions.to_vec();
        scenario.actual_savings = actual_savings;
        scenario.updated_at = Utc::now();
        Ok(())
    }
}
