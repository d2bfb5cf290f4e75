mod common;

use building_energy_planner::domain::{
    ActionStatus, ActionType, ExecutionEvent, ForecastStatus, ForecastType, PredictionTier, Savings,
    ScenarioStatus, Severity,
};
use building_energy_planner::error::PlannerError;
use building_energy_planner::forecast::ForecastRequest;
use building_energy_planner::optimizer::{DispatchOptions, PlanRequest};
use building_energy_planner::repo::{InMemoryForecastStore, ScenarioStore};
use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

fn plan_request(forecast_id: Option<Uuid>) -> PlanRequest {
    PlanRequest {
        building_id: BUILDING.to_string(),
        forecast_id,
        name: Some("afternoon peak".to_string()),
        requested_by: "planner".to_string(),
        devices: devices(),
        constraints: None,
        threshold_percent: None,
    }
}

/// Forecast, plan, submit and approve; returns the approved scenario id
async fn approved_scenario(h: &Harness) -> Uuid {
    h.app
        .forecasts
        .generate_forecast(ForecastRequest::new(BUILDING, ForecastType::PeakLoad))
        .await
        .unwrap();
    let scenario = h.app.plan_scenario(plan_request(None)).await.unwrap();
    h.app.scenarios.submit(scenario.id, "planner").await.unwrap();
    h.app.scenarios.approve(scenario.id, "ops-lead").await.unwrap();
    scenario.id
}

#[tokio::test]
async fn test_forecast_to_completed_scenario() {
    let h = harness();

    let forecast = h
        .app
        .forecasts
        .generate_forecast(ForecastRequest::new(BUILDING, ForecastType::PeakLoad))
        .await
        .unwrap();
    assert_eq!(forecast.status, ForecastStatus::Completed);
    assert_eq!(forecast.predictions.len(), 24);
    assert_eq!(forecast.tier, Some(PredictionTier::Ml));
    assert_eq!(h.building.ml_calls.load(Ordering::SeqCst), 1);

    let analysis = forecast.peak_analysis.clone().unwrap();
    assert_eq!(analysis.peaks.len(), 1);
    assert_eq!(analysis.peaks[0].peak_value, 95.0);
    assert_eq!(analysis.peaks[0].severity, Severity::Critical);

    let scenario = h.app.plan_scenario(plan_request(Some(forecast.id))).await.unwrap();
    assert_eq!(scenario.status, ScenarioStatus::Draft);
    assert_eq!(scenario.forecast_id, Some(forecast.id));
    let kinds: Vec<_> = scenario.actions.iter().map(|a| a.action_type).collect();
    assert!(kinds.contains(&ActionType::PreCool));
    assert!(kinds.contains(&ActionType::SetTemperature));
    assert!(kinds.contains(&ActionType::Dim));
    assert!(scenario.expected_savings.energy_kwh > 0.0);
    // peak tariff applies
    assert!(scenario.expected_savings.cost > 0.0);

    h.app.scenarios.submit(scenario.id, "planner").await.unwrap();
    h.app.scenarios.approve(scenario.id, "ops-lead").await.unwrap();
    let outcome = h
        .app
        .scenarios
        .dispatch(scenario.id, DispatchOptions::execute_now())
        .await
        .unwrap();
    assert_eq!(outcome.status, ScenarioStatus::Completed);
    assert!(outcome.partial_failure.is_none());

    let done = h.app.scenarios.get(scenario.id).await.unwrap();
    assert!(done.actions.iter().all(|a| a.status == ActionStatus::Executed));
    // measured savings start at zero until impact is reported
    assert_eq!(done.actual_savings, Some(Savings::default()));
    assert!(done.actions.iter().all(|a| a.actual_impact.is_none()));
    assert_eq!(h.devices.snapshot()["hvac-1"], 25.0);
    assert_eq!(h.devices.snapshot()["lights-1"], 80.0);
}

#[tokio::test]
async fn test_plan_uses_latest_peak_load_forecast() {
    let h = harness();
    assert!(matches!(
        h.app.plan_scenario(plan_request(None)).await,
        Err(PlannerError::NotFound(_))
    ));

    let forecast = h
        .app
        .forecasts
        .generate_forecast(ForecastRequest::new(BUILDING, ForecastType::PeakLoad))
        .await
        .unwrap();
    let scenario = h.app.plan_scenario(plan_request(None)).await.unwrap();
    assert_eq!(scenario.forecast_id, Some(forecast.id));
}

#[tokio::test]
async fn test_dispatch_from_draft_is_state_conflict() {
    let h = harness();
    h.app
        .forecasts
        .generate_forecast(ForecastRequest::new(BUILDING, ForecastType::PeakLoad))
        .await
        .unwrap();
    let scenario = h.app.plan_scenario(plan_request(None)).await.unwrap();

    let result = h.app.scenarios.dispatch(scenario.id, DispatchOptions::execute_now()).await;
    assert!(matches!(
        result,
        Err(PlannerError::StateConflict {
            current: ScenarioStatus::Draft,
            attempted: ScenarioStatus::Executing,
            ..
        })
    ));
    assert_eq!(h.devices.batch_count(), 0);
    assert_eq!(h.app.scenarios.get(scenario.id).await.unwrap().status, ScenarioStatus::Draft);
}

#[tokio::test]
async fn test_concurrent_approvals_have_one_winner() {
    let h = harness();
    h.app
        .forecasts
        .generate_forecast(ForecastRequest::new(BUILDING, ForecastType::PeakLoad))
        .await
        .unwrap();
    let id = h.app.plan_scenario(plan_request(None)).await.unwrap().id;
    h.app.scenarios.submit(id, "planner").await.unwrap();

    let attempts = (0..8).map(|i| {
        let scenarios = h.app.scenarios.clone();
        async move { scenarios.approve(id, &format!("approver-{i}")).await }
    });
    let results = futures::future::join_all(attempts).await;

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(
        e,
        PlannerError::StateConflict { current: ScenarioStatus::Approved, .. }
    )));

    let stored = h.app.scenarios.get(id).await.unwrap();
    assert_eq!(stored.approved_by, winners[0].approved_by);
}

#[tokio::test]
async fn test_dry_run_leaves_devices_untouched() {
    let h = harness();
    let id = approved_scenario(&h).await;
    let before = h.devices.snapshot();

    let outcome = h.app.scenarios.dispatch(id, DispatchOptions::dry_run()).await.unwrap();
    assert!(outcome.dry_run);
    assert_eq!(outcome.status, ScenarioStatus::Approved);
    assert_eq!(h.devices.snapshot(), before);
    assert!(h.devices.batches.lock().iter().all(|b| b.dry_run && !b.execute_now));

    let stored = h.app.scenarios.get(id).await.unwrap();
    assert_eq!(stored.status, ScenarioStatus::Approved);
    assert!(matches!(stored.execution_log.last().unwrap().event, ExecutionEvent::DryRun { .. }));

    // a retried dry run is answered from the outcome cache
    let replay = h.app.scenarios.dispatch(id, DispatchOptions::dry_run()).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(h.devices.batch_count(), 1);
}

#[tokio::test]
async fn test_repeated_dispatch_sends_one_batch() {
    let h = harness();
    let id = approved_scenario(&h).await;

    let first = h.app.scenarios.dispatch(id, DispatchOptions::execute_now()).await.unwrap();
    let second = h.app.scenarios.dispatch(id, DispatchOptions::execute_now()).await.unwrap();
    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.execution_id, second.execution_id);
    assert_eq!(h.devices.batch_count(), 1);
}

#[tokio::test]
async fn test_partial_failure_marks_only_rejected_actions() {
    let fake = FakeDevices::failing(&devices(), "lights-1");
    let h = harness_with(fake, Arc::new(InMemoryForecastStore::new()));
    let id = approved_scenario(&h).await;

    let outcome = h.app.scenarios.dispatch(id, DispatchOptions::execute_now()).await.unwrap();
    let failure = outcome.partial_failure.expect("partial failure reported");
    assert_eq!(failure.errors.len(), 1);
    assert_eq!(failure.errors[0].device_id, "lights-1");
    assert_eq!(outcome.status, ScenarioStatus::Completed);

    let stored = h.app.scenarios.get(id).await.unwrap();
    for (index, action) in stored.actions.iter().enumerate() {
        if action.device_id == "lights-1" {
            assert_eq!(action.status, ActionStatus::Failed);
            assert!(failure.failed_actions.contains(&index));
        } else {
            assert_eq!(action.status, ActionStatus::Executed);
        }
    }
    assert!(stored.execution_log.iter().any(|e| matches!(
        &e.event,
        ExecutionEvent::ActionFailed { device_id, .. } if device_id == "lights-1"
    )));
    assert_eq!(h.devices.snapshot()["lights-1"], 100.0);
}

#[tokio::test]
async fn test_persisted_scenario_matches_returned_value() {
    let h = harness();
    h.app
        .forecasts
        .generate_forecast(ForecastRequest::new(BUILDING, ForecastType::PeakLoad))
        .await
        .unwrap();
    let scenario = h.app.plan_scenario(plan_request(None)).await.unwrap();

    let stored = h.scenarios.find_by_id(scenario.id).await.unwrap().unwrap();
    assert_eq!(stored, scenario);

    let listed = h.app.scenarios.list(BUILDING).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, scenario.id);
}

#[tokio::test]
async fn test_prediction_write_failure_marks_forecast_failed() {
    let store = Arc::new(BrokenForecastStore { inner: InMemoryForecastStore::new() });
    let h = harness_with(FakeDevices::new(&devices()), store.clone());

    let job = h
        .app
        .forecasts
        .request_forecast(ForecastRequest::new(BUILDING, ForecastType::PeakLoad))
        .await
        .unwrap();
    assert_eq!(job.forecast.status, ForecastStatus::Processing);
    let id = job.forecast.id;

    assert!(matches!(job.wait().await, Err(PlannerError::Persistence(_))));
    let stored = h.app.forecasts.get(id).await.unwrap();
    assert_eq!(stored.status, ForecastStatus::Failed);
    assert!(stored.predictions.is_empty());

    // a failed forecast cannot be planned against
    assert!(matches!(
        h.app.plan_scenario(plan_request(Some(id))).await,
        Err(PlannerError::Validation(_))
    ));
}
