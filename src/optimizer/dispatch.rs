//! Action dispatch
//!
//! Sends a scenario's actions to device control as one batch. Dispatches
//! with the same (scenario, dry-run) pair are serialized through a slot.
//! A dry-run outcome stays cached while the scenario is `APPROVED`; a real
//! dispatch is replayed from the scenario's persisted `DISPATCHED` entry, so
//! slots are dropped as soon as the scenario is terminal.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clients::{bounded, BatchResponse, DeviceControl, OptimizationBatch};
use crate::domain::{
    ActionStatus, DeviceError, ExecutionEvent, ExecutionLogEntry, OptimizationAction,
    OptimizationScenario, ScenarioStatus,
};
use crate::error::{PlannerError, Result};
use crate::repo::{ScenarioStore, Transition};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    pub execute_now: bool,
    pub dry_run: bool,
}

impl DispatchOptions {
    pub fn dry_run() -> Self {
        Self { execute_now: false, dry_run: true }
    }

    pub fn execute_now() -> Self {
        Self { execute_now: true, dry_run: false }
    }
}

/// Device control accepted the batch but rejected some actions
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialDispatchFailure {
    /// Indexes into the scenario's action list
    pub failed_actions: Vec<usize>,
    pub errors: Vec<DeviceError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub scenario_id: Uuid,
    pub execution_id: String,
    pub dry_run: bool,
    /// Scenario status after dispatch
    pub status: ScenarioStatus,
    pub actions_queued: u32,
    pub actions_skipped: u32,
    pub partial_failure: Option<PartialDispatchFailure>,
    /// Served from the outcome cache
    pub replayed: bool,
}

type Slot = Arc<tokio::sync::Mutex<Option<DispatchOutcome>>>;

pub struct ActionDispatcher {
    store: Arc<dyn ScenarioStore>,
    device_control: Arc<dyn DeviceControl>,
    timeout: Duration,
    outcomes: Mutex<HashMap<(Uuid, bool), Slot>>,
}

pub fn idempotency_key(scenario_id: Uuid, dry_run: bool) -> String {
    format!("{scenario_id}:{dry_run}")
}

impl ActionDispatcher {
    pub fn new(
        store: Arc<dyn ScenarioStore>,
        device_control: Arc<dyn DeviceControl>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            device_control,
            timeout,
            outcomes: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, scenario_id: Uuid, dry_run: bool) -> Slot {
        self.outcomes
            .lock()
            .entry((scenario_id, dry_run))
            .or_default()
            .clone()
    }

    /// Drop every cached slot of a scenario
    pub fn forget(&self, scenario_id: Uuid) {
        let mut outcomes = self.outcomes.lock();
        outcomes.remove(&(scenario_id, true));
        outcomes.remove(&(scenario_id, false));
    }

    /// Number of scenarios-and-mode pairs holding a slot
    pub fn cached_slots(&self) -> usize {
        self.outcomes.lock().len()
    }

    /// Dispatches with the same (scenario, dry-run) pair are serialized. A
    /// retried dry run on a still `APPROVED` scenario replays the cached
    /// outcome; a retried real dispatch replays the persisted one.
    pub async fn dispatch(
        &self,
        scenario_id: Uuid,
        opts: DispatchOptions,
    ) -> Result<DispatchOutcome> {
        let slot = self.slot(scenario_id, opts.dry_run);
        let mut cached = slot.lock().await;

        let result = self.dispatch_locked(scenario_id, opts, &cached).await;
        match &result {
            Ok(outcome) if outcome.status.is_terminal() => {
                *cached = Some(outcome.clone());
                self.forget(scenario_id);
            }
            Ok(outcome) => *cached = Some(outcome.clone()),
            Err(_) => {
                *cached = None;
                self.outcomes.lock().remove(&(scenario_id, opts.dry_run));
            }
        }
        result
    }

    async fn dispatch_locked(
        &self,
        scenario_id: Uuid,
        opts: DispatchOptions,
        cached: &Option<DispatchOutcome>,
    ) -> Result<DispatchOutcome> {
        let scenario = self
            .store
            .find_by_id(scenario_id)
            .await?
            .ok_or_else(|| PlannerError::NotFound(format!("scenario {scenario_id}")))?;

        if let Some(outcome) = cached.as_ref() {
            let current = !opts.dry_run || scenario.status == ScenarioStatus::Approved;
            if current {
                info!(
                    scenario_id = %scenario_id,
                    dry_run = opts.dry_run,
                    "replaying cached dispatch outcome"
                );
                return Ok(DispatchOutcome { replayed: true, ..outcome.clone() });
            }
        }

        if opts.dry_run {
            return self.dry_run(scenario, opts).await;
        }
        if let Some(outcome) = replay_from_log(&scenario) {
            info!(
                scenario_id = %scenario_id,
                execution_id = %outcome.execution_id,
                "replaying persisted dispatch"
            );
            return Ok(outcome);
        }
        self.execute(scenario, opts, Utc::now()).await
    }

    async fn send(
        &self,
        scenario: &OptimizationScenario,
        actions: Vec<OptimizationAction>,
        opts: DispatchOptions,
    ) -> Result<BatchResponse> {
        let batch = OptimizationBatch {
            scenario_id: scenario.id,
            building_id: scenario.building_id.clone(),
            actions,
            execute_now: opts.execute_now,
            dry_run: opts.dry_run,
            idempotency_key: idempotency_key(scenario.id, opts.dry_run),
        };
        let deadline = Instant::now() + self.timeout;
        bounded("device-control", deadline, self.device_control.apply_optimization(&batch)).await
    }

    /// Validate the batch with device control; the scenario status is untouched.
    async fn dry_run(
        &self,
        scenario: OptimizationScenario,
        opts: DispatchOptions,
    ) -> Result<DispatchOutcome> {
        if scenario.status != ScenarioStatus::Approved {
            return Err(PlannerError::StateConflict {
                id: scenario.id,
                current: scenario.status,
                attempted: ScenarioStatus::Executing,
            });
        }

        let response = self.send(&scenario, scenario.actions.clone(), opts).await?;
        self.store
            .append_execution_log(
                scenario.id,
                &ExecutionLogEntry::now(ExecutionEvent::DryRun {
                    execution_id: response.execution_id.clone(),
                    actions_queued: response.actions_queued,
                    actions_skipped: response.actions_skipped,
                    errors: response.errors.clone(),
                }),
            )
            .await?;

        info!(
            scenario_id = %scenario.id,
            execution_id = %response.execution_id,
            skipped = response.actions_skipped,
            errors = response.errors.len(),
            "dry run dispatched"
        );

        Ok(DispatchOutcome {
            scenario_id: scenario.id,
            execution_id: response.execution_id,
            dry_run: true,
            status: scenario.status,
            actions_queued: response.actions_queued,
            actions_skipped: response.actions_skipped,
            partial_failure: None,
            replayed: false,
        })
    }

    async fn execute(
        &self,
        scenario: OptimizationScenario,
        opts: DispatchOptions,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        if !opts.execute_now {
            return Err(PlannerError::Validation(
                "execute_now must be set to dispatch for real".to_string(),
            ));
        }

        let status = scenario.status;
        let mut scenario = match status {
            ScenarioStatus::Approved => {
                match self
                    .store
                    .update_status(scenario.id, ScenarioStatus::Approved, ScenarioStatus::Executing)
                    .await?
                {
                    Transition::Applied(s) => s,
                    Transition::Conflict(current) => {
                        return Err(PlannerError::StateConflict {
                            id: scenario.id,
                            current,
                            attempted: ScenarioStatus::Executing,
                        })
                    }
                    Transition::NotFound => {
                        return Err(PlannerError::NotFound(format!("scenario {}", scenario.id)))
                    }
                }
            }
            // an earlier attempt moved it to EXECUTING but never recorded an outcome
            ScenarioStatus::Executing => {
                warn!(scenario_id = %scenario.id, "resuming dispatch of executing scenario");
                scenario
            }
            current => {
                return Err(PlannerError::StateConflict {
                    id: scenario.id,
                    current,
                    attempted: ScenarioStatus::Executing,
                })
            }
        };

        let expired = skip_expired_actions(&mut scenario.actions, now);
        if !expired.is_empty() {
            warn!(
                scenario_id = %scenario.id,
                skipped = ?expired,
                "action windows already passed, skipping"
            );
        }

        // scenario index of each action in the batch
        let (indexes, pending): (Vec<usize>, Vec<OptimizationAction>) = scenario
            .actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.status == ActionStatus::Pending)
            .map(|(i, a)| (i, a.clone()))
            .unzip();

        // nothing is sent when every window has passed
        if pending.is_empty() {
            self.store
                .update_execution(scenario.id, &scenario.actions, None)
                .await?;
            self.finish(
                scenario.id,
                ScenarioStatus::Failed,
                ExecutionEvent::Failed { reason: "no action left to dispatch".to_string() },
            )
            .await?;
            return Ok(DispatchOutcome {
                scenario_id: scenario.id,
                execution_id: String::new(),
                dry_run: false,
                status: ScenarioStatus::Failed,
                actions_queued: 0,
                actions_skipped: expired.len() as u32,
                partial_failure: None,
                replayed: false,
            });
        }

        let response = match self.send(&scenario, pending, opts).await {
            Ok(response) => response,
            Err(e) => {
                error!(scenario_id = %scenario.id, error = %e, "device control rejected dispatch");
                self.finish(
                    scenario.id,
                    ScenarioStatus::Failed,
                    ExecutionEvent::Failed { reason: e.to_string() },
                )
                .await?;
                return Err(e);
            }
        };

        self.store
            .append_execution_log(
                scenario.id,
                &ExecutionLogEntry::now(ExecutionEvent::Dispatched {
                    execution_id: response.execution_id.clone(),
                    actions_queued: response.actions_queued,
                    actions_skipped: response.actions_skipped,
                }),
            )
            .await?;

        let errors = to_scenario_indexes(&response.errors, &indexes);
        let failed = mark_failed_actions(&mut scenario.actions, &errors);
        for &index in &failed {
            let action = &scenario.actions[index];
            let reason = failure_reason(&errors, index, &action.device_id);
            warn!(
                scenario_id = %scenario.id,
                device_id = %action.device_id,
                action_index = index,
                %reason,
                "action failed"
            );
            self.store
                .append_execution_log(
                    scenario.id,
                    &ExecutionLogEntry::now(ExecutionEvent::ActionFailed {
                        action_index: index,
                        device_id: action.device_id.clone(),
                        reason,
                    }),
                )
                .await?;
        }

        // measured impact arrives later through impact reports
        for action in scenario.actions.iter_mut().filter(|a| a.status == ActionStatus::Pending) {
            action.status = ActionStatus::Executed;
            action.actual_impact = None;
        }
        scenario.actual_savings = Some(scenario.measured_savings());
        self.store
            .update_execution(scenario.id, &scenario.actions, scenario.actual_savings.clone())
            .await?;

        let executed = scenario.actions.iter().any(|a| a.status == ActionStatus::Executed);
        let status = if executed {
            let actual_savings = scenario.actual_savings.clone().unwrap_or_default();
            self.finish(
                scenario.id,
                ScenarioStatus::Completed,
                ExecutionEvent::Completed { actual_savings },
            )
            .await?;
            ScenarioStatus::Completed
        } else {
            self.finish(
                scenario.id,
                ScenarioStatus::Failed,
                ExecutionEvent::Failed {
                    reason: "device control rejected every action".to_string(),
                },
            )
            .await?;
            ScenarioStatus::Failed
        };

        info!(
            scenario_id = %scenario.id,
            execution_id = %response.execution_id,
            %status,
            failed = failed.len(),
            "scenario dispatched"
        );

        Ok(DispatchOutcome {
            scenario_id: scenario.id,
            execution_id: response.execution_id,
            dry_run: false,
            status,
            actions_queued: response.actions_queued,
            actions_skipped: response.actions_skipped + expired.len() as u32,
            partial_failure: (!failed.is_empty()).then(|| PartialDispatchFailure {
                failed_actions: failed,
                errors,
            }),
            replayed: false,
        })
    }

    async fn finish(&self, id: Uuid, to: ScenarioStatus, event: ExecutionEvent) -> Result<()> {
        match self.store.update_status(id, ScenarioStatus::Executing, to).await? {
            Transition::Applied(_) => {}
            Transition::Conflict(current) => {
                return Err(PlannerError::StateConflict { id, current, attempted: to });
            }
            Transition::NotFound => return Err(PlannerError::NotFound(format!("scenario {id}"))),
        }
        self.store
            .append_execution_log(id, &ExecutionLogEntry::now(event))
            .await
    }
}

/// Rebuild the outcome of a finished real dispatch from the execution log
fn replay_from_log(scenario: &OptimizationScenario) -> Option<DispatchOutcome> {
    if !matches!(scenario.status, ScenarioStatus::Completed | ScenarioStatus::Failed) {
        return None;
    }
    let (execution_id, actions_queued, actions_skipped) =
        scenario.execution_log.iter().rev().find_map(|entry| match &entry.event {
            ExecutionEvent::Dispatched { execution_id, actions_queued, actions_skipped } => {
                Some((execution_id.clone(), *actions_queued, *actions_skipped))
            }
            _ => None,
        })?;

    let errors: Vec<DeviceError> = scenario
        .execution_log
        .iter()
        .filter_map(|entry| match &entry.event {
            ExecutionEvent::ActionFailed { action_index, device_id, reason } => Some(DeviceError {
                device_id: device_id.clone(),
                action_index: Some(*action_index),
                message: reason.clone(),
            }),
            _ => None,
        })
        .collect();
    let failed_actions: Vec<usize> = errors.iter().filter_map(|e| e.action_index).collect();

    Some(DispatchOutcome {
        scenario_id: scenario.id,
        execution_id,
        dry_run: false,
        status: scenario.status,
        actions_queued,
        actions_skipped,
        partial_failure: (!failed_actions.is_empty()).then(|| PartialDispatchFailure {
            failed_actions,
            errors,
        }),
        replayed: true,
    })
}

/// Mark pending actions whose window ended before `now` as skipped
fn skip_expired_actions(actions: &mut [OptimizationAction], now: DateTime<Utc>) -> Vec<usize> {
    let mut skipped = Vec::new();
    for (i, action) in actions.iter_mut().enumerate() {
        let ends = action.scheduled_time + ChronoDuration::minutes(action.duration_minutes as i64);
        if action.status == ActionStatus::Pending && ends <= now {
            action.status = ActionStatus::Skipped;
            skipped.push(i);
        }
    }
    skipped
}

/// Device errors index into the batch; rewrite them against the scenario's action list.
fn to_scenario_indexes(errors: &[DeviceError], batch_indexes: &[usize]) -> Vec<DeviceError> {
    errors
        .iter()
        .map(|e| DeviceError {
            action_index: e.action_index.and_then(|i| batch_indexes.get(i).copied()),
            ..e.clone()
        })
        .collect()
}

/// Mark the actions named by device errors as failed: by index when the
/// error carries one, otherwise every pending action of the device.
fn mark_failed_actions(actions: &mut [OptimizationAction], errors: &[DeviceError]) -> Vec<usize> {
    let mut failed = Vec::new();
    for err in errors {
        let targets: Vec<usize> = match err.action_index {
            Some(i) if i < actions.len() => vec![i],
            _ => actions
                .iter()
                .enumerate()
                .filter(|(_, a)| a.device_id == err.device_id)
                .map(|(i, _)| i)
                .collect(),
        };
        for i in targets {
            if actions[i].status == ActionStatus::Pending {
                actions[i].status = ActionStatus::Failed;
                failed.push(i);
            }
        }
    }
    failed.sort_unstable();
    failed
}

fn failure_reason(errors: &[DeviceError], index: usize, device_id: &str) -> String {
    errors
        .iter()
        .find(|e| e.action_index == Some(index))
        .or_else(|| errors.iter().find(|e| e.device_id == device_id))
        .map(|e| e.message.clone())
        .unwrap_or_else(|| "rejected by device control".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActionType, Savings, ScenarioConstraints};
    use crate::repo::InMemoryScenarioStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedControl {
        calls: AtomicUsize,
        reply: Result<BatchResponse>,
    }

    impl ScriptedControl {
        fn ok(errors: Vec<DeviceError>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                reply: Ok(BatchResponse {
                    execution_id: "ex-1".to_string(),
                    actions_queued: 2,
                    actions_skipped: 0,
                    errors,
                }),
            }
        }
    }

    #[async_trait]
    impl DeviceControl for ScriptedControl {
        async fn apply_optimization(&self, _batch: &OptimizationBatch) -> Result<BatchResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Ok(r) => Ok(r.clone()),
                Err(e) => Err(PlannerError::upstream("device-control", e)),
            }
        }
    }

    fn action(device_id: &str, impact: f64) -> OptimizationAction {
        OptimizationAction {
            device_id: device_id.to_string(),
            action_type: ActionType::Shed,
            current_value: 5.0,
            target_value: 0.0,
            scheduled_time: Utc::now(),
            duration_minutes: 60,
            status: ActionStatus::Pending,
            expected_impact: impact,
            actual_impact: None,
        }
    }

    async fn approved(store: &InMemoryScenarioStore) -> Uuid {
        let now = Utc::now();
        let scenario = OptimizationScenario {
            id: Uuid::new_v4(),
            building_id: "b-1".to_string(),
            forecast_id: None,
            name: "test".to_string(),
            status: ScenarioStatus::Approved,
            actions: vec![action("load-1", 6.0), action("load-2", 4.0)],
            constraints: ScenarioConstraints::default(),
            expected_savings: Savings { energy_kwh: 10.0, cost: 2.0, peak_reduction_kw: 10.0 },
            actual_savings: None,
            created_by: "planner".to_string(),
            approved_by: Some("ops".to_string()),
            approved_at: Some(now),
            execution_log: vec![],
            created_at: now,
            updated_at: now,
        };
        store.create(&scenario).await.unwrap();
        scenario.id
    }

    fn dispatcher(
        store: Arc<InMemoryScenarioStore>,
        control: Arc<ScriptedControl>,
    ) -> ActionDispatcher {
        ActionDispatcher::new(store, control, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_partial_failure_marks_only_named_actions() {
        let store = Arc::new(InMemoryScenarioStore::new());
        let id = approved(&store).await;
        let control = Arc::new(ScriptedControl::ok(vec![DeviceError {
            device_id: "load-2".to_string(),
            action_index: None,
            message: "device offline".to_string(),
        }]));

        let outcome = dispatcher(store.clone(), control)
            .dispatch(id, DispatchOptions::execute_now())
            .await
            .unwrap();

        assert_eq!(outcome.status, ScenarioStatus::Completed);
        assert_eq!(outcome.partial_failure.as_ref().unwrap().failed_actions, vec![1]);

        let stored = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.actions[0].status, ActionStatus::Executed);
        assert_eq!(stored.actions[1].status, ActionStatus::Failed);
        // nothing measured yet
        assert!(stored.actions.iter().all(|a| a.actual_impact.is_none()));
        assert_eq!(stored.actual_savings.unwrap(), Savings::default());
        assert!(stored.execution_log.iter().any(|e| matches!(
            &e.event,
            ExecutionEvent::ActionFailed { action_index: 1, reason, .. }
                if reason == "device offline"
        )));
    }

    #[tokio::test]
    async fn test_all_actions_failed_fails_scenario() {
        let store = Arc::new(InMemoryScenarioStore::new());
        let id = approved(&store).await;
        let errors = (0..2)
            .map(|i| DeviceError {
                device_id: format!("load-{}", i + 1),
                action_index: Some(i),
                message: "busy".to_string(),
            })
            .collect();
        let control = Arc::new(ScriptedControl::ok(errors));

        let outcome = dispatcher(store.clone(), control)
            .dispatch(id, DispatchOptions::execute_now())
            .await
            .unwrap();
        assert_eq!(outcome.status, ScenarioStatus::Failed);
        assert_eq!(store.find_by_id(id).await.unwrap().unwrap().status, ScenarioStatus::Failed);
    }

    #[tokio::test]
    async fn test_upstream_failure_fails_scenario() {
        let store = Arc::new(InMemoryScenarioStore::new());
        let id = approved(&store).await;
        let control = Arc::new(ScriptedControl {
            calls: AtomicUsize::new(0),
            reply: Err(PlannerError::upstream("device-control", "HTTP 500")),
        });

        let result = dispatcher(store.clone(), control)
            .dispatch(id, DispatchOptions::execute_now())
            .await;
        assert!(matches!(result, Err(PlannerError::UpstreamUnavailable { .. })));

        let stored = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScenarioStatus::Failed);
        assert!(matches!(
            stored.execution_log.last().unwrap().event,
            ExecutionEvent::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_retry_replays_cached_outcome() {
        let store = Arc::new(InMemoryScenarioStore::new());
        let id = approved(&store).await;
        let control = Arc::new(ScriptedControl::ok(vec![]));
        let dispatcher = dispatcher(store, control.clone());

        let first = dispatcher.dispatch(id, DispatchOptions::execute_now()).await.unwrap();
        let second = dispatcher.dispatch(id, DispatchOptions::execute_now()).await.unwrap();

        assert_eq!(control.calls.load(Ordering::SeqCst), 1);
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.execution_id, first.execution_id);
        assert_eq!(second.status, ScenarioStatus::Completed);
    }

    #[tokio::test]
    async fn test_terminal_dispatch_releases_cache_slots() {
        let store = Arc::new(InMemoryScenarioStore::new());
        let id = approved(&store).await;
        let control = Arc::new(ScriptedControl::ok(vec![DeviceError {
            device_id: "load-2".to_string(),
            action_index: Some(1),
            message: "device offline".to_string(),
        }]));
        let dispatcher = dispatcher(store, control.clone());

        dispatcher.dispatch(id, DispatchOptions::dry_run()).await.unwrap();
        assert_eq!(dispatcher.cached_slots(), 1);

        let first = dispatcher.dispatch(id, DispatchOptions::execute_now()).await.unwrap();
        assert_eq!(dispatcher.cached_slots(), 0);

        // a retry after eviction is answered from the execution log
        let retry = dispatcher.dispatch(id, DispatchOptions::execute_now()).await.unwrap();
        assert!(retry.replayed);
        assert_eq!(retry.execution_id, first.execution_id);
        assert_eq!(retry.partial_failure, first.partial_failure);
        assert_eq!(control.calls.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.cached_slots(), 0);

        // the dry-run outcome is not replayed for a completed scenario
        assert!(matches!(
            dispatcher.dispatch(id, DispatchOptions::dry_run()).await,
            Err(PlannerError::StateConflict { current: ScenarioStatus::Completed, .. })
        ));
        assert_eq!(dispatcher.cached_slots(), 0);
    }

    #[tokio::test]
    async fn test_expired_actions_are_skipped() {
        let store = Arc::new(InMemoryScenarioStore::new());
        let id = approved(&store).await;
        let mut scenario = store.find_by_id(id).await.unwrap().unwrap();
        scenario.actions[0].scheduled_time = Utc::now() - chrono::Duration::hours(3);
        store.update_execution(id, &scenario.actions, None).await.unwrap();
        let control = Arc::new(ScriptedControl::ok(vec![]));

        let outcome = dispatcher(store.clone(), control)
            .dispatch(id, DispatchOptions::execute_now())
            .await
            .unwrap();
        assert_eq!(outcome.status, ScenarioStatus::Completed);
        assert_eq!(outcome.actions_skipped, 1);

        let stored = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.actions[0].status, ActionStatus::Skipped);
        assert_eq!(stored.actions[1].status, ActionStatus::Executed);
    }

    #[tokio::test]
    async fn test_every_window_passed_fails_without_sending() {
        let store = Arc::new(InMemoryScenarioStore::new());
        let id = approved(&store).await;
        let mut scenario = store.find_by_id(id).await.unwrap().unwrap();
        for action in &mut scenario.actions {
            action.scheduled_time = Utc::now() - chrono::Duration::hours(3);
        }
        store.update_execution(id, &scenario.actions, None).await.unwrap();
        let control = Arc::new(ScriptedControl::ok(vec![]));

        let outcome = dispatcher(store.clone(), control.clone())
            .dispatch(id, DispatchOptions::execute_now())
            .await
            .unwrap();
        assert_eq!(outcome.status, ScenarioStatus::Failed);
        assert_eq!(control.calls.load(Ordering::SeqCst), 0);
        let stored = store.find_by_id(id).await.unwrap().unwrap();
        assert!(stored.actions.iter().all(|a| a.status == ActionStatus::Skipped));
        assert_eq!(stored.status, ScenarioStatus::Failed);
    }

    #[tokio::test]
    async fn test_dry_run_keeps_status_and_requires_approval() {
        let store = Arc::new(InMemoryScenarioStore::new());
        let id = approved(&store).await;
        let control = Arc::new(ScriptedControl::ok(vec![]));
        let dispatcher = dispatcher(store.clone(), control);

        let outcome = dispatcher.dispatch(id, DispatchOptions::dry_run()).await.unwrap();
        assert!(outcome.dry_run);
        assert_eq!(outcome.status, ScenarioStatus::Approved);
        let stored = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScenarioStatus::Approved);
        assert!(stored.actions.iter().all(|a| a.status == ActionStatus::Pending));

        store
            .update_status(id, ScenarioStatus::Approved, ScenarioStatus::Cancelled)
            .await
            .unwrap();
        // the cached outcome went stale with the cancellation
        assert!(matches!(
            dispatcher.dispatch(id, DispatchOptions::dry_run()).await,
            Err(PlannerError::StateConflict { current: ScenarioStatus::Cancelled, .. })
        ));
        assert_eq!(dispatcher.cached_slots(), 0);
    }

    #[tokio::test]
    async fn test_real_dispatch_requires_execute_now() {
        let store = Arc::new(InMemoryScenarioStore::new());
        let id = approved(&store).await;
        let control = Arc::new(ScriptedControl::ok(vec![]));
        let dispatcher = dispatcher(store.clone(), control.clone());

        let result = dispatcher.dispatch(id, DispatchOptions::default()).await;
        assert!(matches!(result, Err(PlannerError::Validation(_))));
        assert_eq!(control.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.find_by_id(id).await.unwrap().unwrap().status, ScenarioStatus::Approved);
    }

    #[test]
    fn test_idempotency_key() {
        let id = Uuid::nil();
        assert_eq!(idempotency_key(id, true), "00000000-0000-0000-0000-000000000000:true");
    }

    #[test]
    fn test_batch_indexes_mapped_to_scenario() {
        let err = |index| DeviceError {
            device_id: "hvac-1".to_string(),
            action_index: index,
            message: "offline".to_string(),
        };
        // batch held scenario actions 1 and 3
        let mapped = to_scenario_indexes(&[err(Some(1)), err(Some(7)), err(None)], &[1, 3]);
        assert_eq!(mapped[0].action_index, Some(3));
        assert_eq!(mapped[1].action_index, None);
        assert_eq!(mapped[2].action_index, None);
    }
}
