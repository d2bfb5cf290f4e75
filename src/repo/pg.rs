#![cfg(feature = "db")]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool};
use std::str::FromStr;
use uuid::Uuid;

use super::{ForecastStore, PredictionUpdate, ScenarioStore, Transition};
use crate::config::DbConfig;
use crate::domain::{
    ExecutionLogEntry, Forecast, ForecastAccuracy, ForecastStatus, ForecastType, OptimizationAction,
    OptimizationScenario, PeakAnalysis, PredictionPoint, PredictionTier, Savings,
    ScenarioConstraints, ScenarioStatus,
};
use crate::error::{PlannerError, Result};

pub async fn connect(cfg: &DbConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .connect(&cfg.url)
        .await?;
    Ok(pool)
}

fn token<T: FromStr>(value: &str, what: &str) -> Result<T> {
    T::from_str(value)
        .map_err(|_| PlannerError::persistence(format!("unknown {what} '{value}' in database")))
}

#[derive(Debug, sqlx::FromRow)]
struct ForecastRow {
    id: Uuid,
    building_id: String,
    device_id: Option<String>,
    forecast_type: String,
    status: String,
    horizon_hours: i32,
    predictions: Json<Vec<PredictionPoint>>,
    accuracy: Option<Json<ForecastAccuracy>>,
    tier: Option<String>,
    model_used: Option<String>,
    degraded_sources: Json<Vec<String>>,
    peak_analysis: Option<Json<PeakAnalysis>>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ForecastRow> for Forecast {
    type Error = PlannerError;

    fn try_from(row: ForecastRow) -> Result<Self> {
        Ok(Forecast {
            id: row.id,
            building_id: row.building_id,
            device_id: row.device_id,
            forecast_type: token::<ForecastType>(&row.forecast_type, "forecast type")?,
            status: token::<ForecastStatus>(&row.status, "forecast status")?,
            horizon_hours: u32::try_from(row.horizon_hours).map_err(PlannerError::persistence)?,
            predictions: row.predictions.0,
            accuracy: row.accuracy.map(|a| a.0),
            tier: row.tier.as_deref().map(|t| token::<PredictionTier>(t, "tier")).transpose()?,
            model_used: row.model_used,
            degraded_sources: row.degraded_sources.0,
            peak_analysis: row.peak_analysis.map(|p| p.0),
            error: row.error,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

const FORECAST_COLUMNS: &str = "id, building_id, device_id, forecast_type, status, horizon_hours, \
     predictions, accuracy, tier, model_used, degraded_sources, peak_analysis, error, created_at, \
     completed_at";

pub struct PgForecastStore {
    pool: PgPool,
}

impl PgForecastStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A guarded terminal write touched no row: the forecast is missing or already terminal
    async fn terminal_write_missed(&self, id: Uuid) -> Result<()> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM forecasts WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        match status {
            None => Err(PlannerError::NotFound(format!("forecast {id}"))),
            Some(status) => Err(PlannerError::persistence(format!(
                "forecast {id} is already {status}"
            ))),
        }
    }
}

fn expect_one_row(rows: u64, what: &str, id: Uuid) -> Result<()> {
    if rows == 0 {
        return Err(PlannerError::NotFound(format!("{what} {id}")));
    }
    Ok(())
}

#[async_trait]
impl ForecastStore for PgForecastStore {
    async fn create(&self, forecast: &Forecast) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO forecasts (id, building_id, device_id, forecast_type, status, horizon_hours,
                                   predictions, degraded_sources, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(forecast.id)
        .bind(&forecast.building_id)
        .bind(&forecast.device_id)
        .bind(forecast.forecast_type.to_string())
        .bind(forecast.status.to_string())
        .bind(forecast.horizon_hours as i32)
        .bind(Json(&forecast.predictions))
        .bind(Json(&forecast.degraded_sources))
        .bind(forecast.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Forecast>> {
        let row = sqlx::query_as::<_, ForecastRow>(&format!(
            "SELECT {FORECAST_COLUMNS} FROM forecasts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Forecast::try_from).transpose()
    }

    async fn find_latest_by_building(
        &self,
        building_id: &str,
        forecast_type: ForecastType,
    ) -> Result<Option<Forecast>> {
        let row = sqlx::query_as::<_, ForecastRow>(&format!(
            "SELECT {FORECAST_COLUMNS} FROM forecasts \
             WHERE building_id = $1 AND forecast_type = $2 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(building_id)
        .bind(forecast_type.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Forecast::try_from).transpose()
    }

    async fn update_predictions(&self, id: Uuid, update: &PredictionUpdate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE forecasts
            SET predictions = $2, accuracy = $3, tier = $4, model_used = $5,
                degraded_sources = $6, peak_analysis = $7, status = $8, completed_at = $9
            WHERE id = $1 AND status = $10
            "#,
        )
        .bind(id)
        .bind(Json(&update.predictions))
        .bind(update.accuracy.as_ref().map(Json))
        .bind(update.tier.to_string())
        .bind(&update.model_used)
        .bind(Json(&update.degraded_sources))
        .bind(update.peak_analysis.as_ref().map(Json))
        .bind(ForecastStatus::Completed.to_string())
        .bind(update.completed_at)
        .bind(ForecastStatus::Processing.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return self.terminal_write_missed(id).await;
        }
        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ForecastStatus,
        error: Option<String>,
    ) -> Result<()> {
        let completed_at = status.is_terminal().then(Utc::now);
        let result = sqlx::query(
            "UPDATE forecasts \
             SET status = $2, error = $3, completed_at = COALESCE($4, completed_at) \
             WHERE id = $1 AND status = $5",
        )
        .bind(id)
        .bind(status.to_string())
        .bind(error)
        .bind(completed_at)
        .bind(ForecastStatus::Processing.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return self.terminal_write_missed(id).await;
        }
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ScenarioRow {
    id: Uuid,
    building_id: String,
    forecast_id: Option<Uuid>,
    name: String,
    status: String,
    actions: Json<Vec<OptimizationAction>>,
    constraints: Json<ScenarioConstraints>,
    expected_savings: Json<Savings>,
    actual_savings: Option<Json<Savings>>,
    created_by: String,
    approved_by: Option<String>,
    approved_at: Option<DateTime<Utc>>,
    execution_log: Json<Vec<ExecutionLogEntry>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ScenarioRow> for OptimizationScenario {
    type Error = PlannerError;

    fn try_from(row: ScenarioRow) -> Result<Self> {
        Ok(OptimizationScenario {
            id: row.id,
            building_id: row.building_id,
            forecast_id: row.forecast_id,
            name: row.name,
            status: token::<ScenarioStatus>(&row.status, "scenario status")?,
            actions: row.actions.0,
            constraints: row.constraints.0,
            expected_savings: row.expected_savings.0,
            actual_savings: row.actual_savings.map(|s| s.0),
            created_by: row.created_by,
            approved_by: row.approved_by,
            approved_at: row.approved_at,
            execution_log: row.execution_log.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SCENARIO_COLUMNS: &str = "id, building_id, forecast_id, name, status, actions, constraints, \
     expected_savings, actual_savings, created_by, approved_by, approved_at, execution_log, \
     created_at, updated_at";

pub struct PgScenarioStore {
    pool: PgPool,
}

impl PgScenarioStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve a conditional update that touched no row
    async fn miss(&self, id: Uuid) -> Result<Transition> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM optimization_scenarios WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        match status {
            None => Ok(Transition::NotFound),
            Some(s) => Ok(Transition::Conflict(token(&s, "scenario status")?)),
        }
    }
}

#[async_trait]
impl ScenarioStore for PgScenarioStore {
    async fn create(&self, scenario: &OptimizationScenario) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO optimization_scenarios (id, building_id, forecast_id, name, status, actions,
                constraints, expected_savings, actual_savings, created_by, approved_by, approved_at,
                execution_log, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(scenario.id)
        .bind(&scenario.building_id)
        .bind(scenario.forecast_id)
        .bind(&scenario.name)
        .bind(scenario.status.to_string())
        .bind(Json(&scenario.actions))
        .bind(Json(&scenario.constraints))
        .bind(Json(&scenario.expected_savings))
        .bind(scenario.actual_savings.as_ref().map(Json))
        .bind(&scenario.created_by)
        .bind(&scenario.approved_by)
        .bind(scenario.approved_at)
        .bind(Json(&scenario.execution_log))
        .bind(scenario.created_at)
        .bind(scenario.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OptimizationScenario>> {
        let row = sqlx::query_as::<_, ScenarioRow>(&format!(
            "SELECT {SCENARIO_COLUMNS} FROM optimization_scenarios WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(OptimizationScenario::try_from).transpose()
    }

    async fn list_by_building(&self, building_id: &str) -> Result<Vec<OptimizationScenario>> {
        let rows = sqlx::query_as::<_, ScenarioRow>(&format!(
            "SELECT {SCENARIO_COLUMNS} FROM optimization_scenarios \
             WHERE building_id = $1 ORDER BY created_at DESC"
        ))
        .bind(building_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OptimizationScenario::try_from).collect()
    }

    async fn approve(&self, id: Uuid, approver_id: &str, at: DateTime<Utc>) -> Result<Transition> {
        let row = sqlx::query_as::<_, ScenarioRow>(&format!(
            "UPDATE optimization_scenarios \
             SET status = $2, approved_by = $3, approved_at = $4, updated_at = NOW() \
             WHERE id = $1 AND status = $5 \
             RETURNING {SCENARIO_COLUMNS}"
        ))
        .bind(id)
        .bind(ScenarioStatus::Approved.to_string())
        .bind(approver_id)
        .bind(at)
        .bind(ScenarioStatus::Pending.to_string())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Transition::Applied(row.try_into()?)),
            None => self.miss(id).await,
        }
    }

    async fn update_status(
        &self,
        id: Uuid,
        from: ScenarioStatus,
        to: ScenarioStatus,
    ) -> Result<Transition> {
        let row = sqlx::query_as::<_, ScenarioRow>(&format!(
            "UPDATE optimization_scenarios SET status = $2, updated_at = NOW() \
             WHERE id = $1 AND status = $3 \
             RETURNING {SCENARIO_COLUMNS}"
        ))
        .bind(id)
        .bind(to.to_string())
        .bind(from.to_string())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Transition::Applied(row.try_into()?)),
            None => self.miss(id).await,
        }
    }

    async fn append_execution_log(&self, id: Uuid, entry: &ExecutionLogEntry) -> Result<()> {
        let result = sqlx::query(
            "UPDATE optimization_scenarios \
             SET execution_log = execution_log || jsonb_build_array($2::jsonb), updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(Json(entry))
        .execute(&self.pool)
        .await?;
        expect_one_row(result.rows_affected(), "scenario", id)
    }

    async fn set_action_impact(
        &self,
        id: Uuid,
        action_index: usize,
        actual_impact: f64,
    ) -> Result<OptimizationScenario> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, ScenarioRow>(&format!(
            "SELECT {SCENARIO_COLUMNS} FROM optimization_scenarios WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| PlannerError::NotFound(format!("scenario {id}")))?;

        let mut scenario = OptimizationScenario::try_from(row)?;
        scenario
            .record_impact(action_index, actual_impact)
            .map_err(PlannerError::Validation)?;

        let updated_at: DateTime<Utc> = sqlx::query_scalar(
            "UPDATE optimization_scenarios \
             SET actions = $2, actual_savings = $3, updated_at = NOW() \
             WHERE id = $1 RETURNING updated_at",
        )
        .bind(id)
        .bind(Json(&scenario.actions))
        .bind(scenario.actual_savings.as_ref().map(Json))
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        scenario.updated_at = updated_at;
        Ok(scenario)
    }

    async fn update_execution(
        &self,
        id: Uuid,
        actions: &[OptimizationAction],
        actual_savings: Option<Savings>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE optimization_scenarios \
             SET actions = $2, actual_savings = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(Json(actions))
        .bind(actual_savings.map(Json))
        .execute(&self.pool)
        .await?;
        expect_one_row(result.rows_affected(), "scenario", id)
    }
}
