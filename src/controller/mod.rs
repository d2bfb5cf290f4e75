use anyhow::Context;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::clients::{bounded, Collaborators, HttpCollaborators};
use crate::config::Config;
use crate::domain::{ForecastType, OptimizationScenario};
use crate::error::{PlannerError, Result};
use crate::forecast::ForecastService;
use crate::optimizer::{
    ActionDispatcher, OptimizationPlanner, PlanRequest, ScenarioLifecycleManager,
};
use crate::repo::{ForecastStore, ScenarioStore};

/// Services wired from one configuration
#[derive(Clone)]
pub struct AppState {
    pub cfg: Config,
    pub collaborators: Collaborators,
    pub forecasts: ForecastService,
    pub planner: Arc<OptimizationPlanner>,
    pub scenarios: Arc<ScenarioLifecycleManager>,
}

impl AppState {
    /// HTTP collaborators plus in-memory stores, or Postgres stores with the `db` feature
    pub async fn new(cfg: Config) -> anyhow::Result<Self> {
        let client = HttpCollaborators::new(&cfg.collaborators)
            .context("building collaborator HTTP client")?;
        let timeout = cfg.collaborators.request_timeout();
        let collaborators = Collaborators::from_http(Arc::new(client), timeout);
        let (forecast_store, scenario_store) = stores(&cfg).await?;
        Self::with_parts(cfg, collaborators, forecast_store, scenario_store)
    }

    pub fn with_parts(
        cfg: Config,
        collaborators: Collaborators,
        forecast_store: Arc<dyn ForecastStore>,
        scenario_store: Arc<dyn ScenarioStore>,
    ) -> anyhow::Result<Self> {
        let tz = cfg.forecast.tz()?;
        let forecasts = ForecastService::from_config(&cfg, &collaborators, forecast_store)?;
        let planner = Arc::new(OptimizationPlanner::from_config(&cfg.planner, tz));
        let dispatcher = ActionDispatcher::new(
            scenario_store.clone(),
            collaborators.device_control.clone(),
            collaborators.timeout,
        );
        let scenarios = Arc::new(ScenarioLifecycleManager::new(scenario_store, dispatcher));

        Ok(Self {
            cfg,
            collaborators,
            forecasts,
            planner,
            scenarios,
        })
    }

    /// Plan and persist a `DRAFT` scenario against a completed forecast: the
    /// one named in the request, else the building's latest `PEAK_LOAD` forecast.
    pub async fn plan_scenario(&self, req: PlanRequest) -> Result<OptimizationScenario> {
        let forecast = match req.forecast_id {
            Some(id) => self.forecasts.get(id).await?,
            None => self
                .forecasts
                .latest(&req.building_id, ForecastType::PeakLoad)
                .await?
                .ok_or_else(|| {
                    PlannerError::NotFound(format!(
                        "no PEAK_LOAD forecast for building {}",
                        req.building_id
                    ))
                })?,
        };
        let analysis = match (&forecast.peak_analysis, req.threshold_percent) {
            (Some(analysis), None) => analysis.clone(),
            (_, pct) => self.forecasts.analyze_peaks(&forecast, pct),
        };

        let rate = self.tariff_rate(&req.building_id).await;
        let scenario = self.planner.plan(&req, &forecast, &analysis, rate)?;
        self.scenarios.create(scenario).await
    }

    /// Peak tariff rate, or the configured fallback when the tariff service is unavailable
    async fn tariff_rate(&self, building_id: &str) -> f64 {
        let deadline = Instant::now() + self.collaborators.timeout;
        let fetch = self.collaborators.tariff.fetch_tariff(building_id);
        match bounded("tariff", deadline, fetch).await {
            Ok(tariff) => tariff.peak_rate(),
            Err(e) => {
                let fallback = self.cfg.planner.tariff_fallback_rate;
                warn!(building_id, error = %e, fallback, "tariff unavailable, using fallback rate");
                fallback
            }
        }
    }
}

#[cfg(not(feature = "db"))]
async fn stores(_cfg: &Config) -> anyhow::Result<(Arc<dyn ForecastStore>, Arc<dyn ScenarioStore>)> {
    use crate::repo::{InMemoryForecastStore, InMemoryScenarioStore};

    info!("using in-memory stores");
    Ok((Arc::new(InMemoryForecastStore::new()), Arc::new(InMemoryScenarioStore::new())))
}

#[cfg(feature = "db")]
async fn stores(cfg: &Config) -> anyhow::Result<(Arc<dyn ForecastStore>, Arc<dyn ScenarioStore>)> {
    use crate::repo::pg::{connect, PgForecastStore, PgScenarioStore};

    let pool = connect(&cfg.db).await.context("connecting to database")?;
    info!(max_connections = cfg.db.max_connections, "using postgres stores");
    Ok((
        Arc::new(PgForecastStore::new(pool.clone())),
        Arc::new(PgScenarioStore::new(pool)),
    ))
}
