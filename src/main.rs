use anyhow::{Context, Result};
use building_energy_planner::{config, controller, domain, forecast, optimizer, telemetry};
use config::Config;
use domain::ForecastType;
use forecast::ForecastRequest;
use optimizer::{DeviceProfile, PlanRequest};
use telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = Config::load()?;
    let runner = cfg.runner.clone();
    let devices = load_devices(runner.devices_file.as_deref())?;
    if devices.is_empty() {
        warn!("no devices configured, the scenario will carry no actions");
    }

    let app_state = controller::AppState::new(cfg).await?;

    info!(building_id = %runner.building_id, "generating peak load forecast");
    let forecast = app_state
        .forecasts
        .generate_forecast(ForecastRequest::new(&runner.building_id, ForecastType::PeakLoad))
        .await?;
    info!(
        forecast_id = %forecast.id,
        points = forecast.predictions.len(),
        peak_kw = ?forecast.peak_load(),
        average_kw = forecast.average_load(),
        accuracy = ?forecast.accuracy,
        "forecast completed"
    );

    let scenario = app_state
        .plan_scenario(PlanRequest {
            building_id: runner.building_id.clone(),
            forecast_id: Some(forecast.id),
            name: None,
            requested_by: runner.requested_by.clone(),
            devices,
            constraints: None,
            threshold_percent: None,
        })
        .await?;
    let scenario = app_state.scenarios.submit(scenario.id, &runner.requested_by).await?;
    info!(
        scenario_id = %scenario.id,
        status = %scenario.status,
        actions = scenario.actions.len(),
        "scenario awaiting approval"
    );

    println!("{}", serde_json::to_string_pretty(&scenario)?);
    Ok(())
}

fn load_devices(path: Option<&str>) -> Result<Vec<DeviceProfile>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading devices file {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing devices file {path}"))
}
