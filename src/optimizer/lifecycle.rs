use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::dispatch::{ActionDispatcher, DispatchOptions, DispatchOutcome};
use crate::domain::{ExecutionEvent, ExecutionLogEntry, OptimizationScenario, ScenarioStatus};
use crate::error::{PlannerError, Result};
use crate::repo::{ScenarioStore, Transition};

/// Drives scenarios through their lifecycle. Every transition is an explicit
/// call and a compare-and-set in the store; a caller that loses the race gets
/// `StateConflict` and nothing is written.
pub struct ScenarioLifecycleManager {
    store: Arc<dyn ScenarioStore>,
    dispatcher: ActionDispatcher,
}

impl ScenarioLifecycleManager {
    pub fn new(store: Arc<dyn ScenarioStore>, dispatcher: ActionDispatcher) -> Self {
        Self { store, dispatcher }
    }

    /// Persist a freshly planned scenario
    pub async fn create(&self, scenario: OptimizationScenario) -> Result<OptimizationScenario> {
        if scenario.status != ScenarioStatus::Draft {
            return Err(PlannerError::Validation(format!(
                "new scenarios must be DRAFT, got {}",
                scenario.status
            )));
        }
        self.store.create(&scenario).await?;
        info!(scenario_id = %scenario.id, building_id = %scenario.building_id, "scenario created");
        Ok(scenario)
    }

    pub async fn get(&self, id: Uuid) -> Result<OptimizationScenario> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| PlannerError::NotFound(format!("scenario {id}")))
    }

    pub async fn list(&self, building_id: &str) -> Result<Vec<OptimizationScenario>> {
        self.store.list_by_building(building_id).await
    }

    /// `DRAFT -> PENDING`
    pub async fn submit(&self, id: Uuid, submitted_by: &str) -> Result<OptimizationScenario> {
        let mut scenario = self
            .transition(id, ScenarioStatus::Draft, ScenarioStatus::Pending)
            .await?;
        self.log(&mut scenario, ExecutionEvent::Submitted { by: submitted_by.to_string() })
            .await?;
        Ok(scenario)
    }

    /// `PENDING -> APPROVED`. The approver must differ from the scenario's author.
    pub async fn approve(&self, id: Uuid, approver_id: &str) -> Result<OptimizationScenario> {
        let approver_id = approver_id.trim();
        if approver_id.is_empty() {
            return Err(PlannerError::Validation("approver_id is required".to_string()));
        }
        let scenario = self.get(id).await?;
        if scenario.created_by == approver_id {
            return Err(PlannerError::Validation(format!(
                "scenario {id} cannot be approved by its author"
            )));
        }

        match self.store.approve(id, approver_id, Utc::now()).await? {
            Transition::Applied(mut approved) => {
                let event = ExecutionEvent::Approved { approver_id: approver_id.to_string() };
                self.log(&mut approved, event).await?;
                info!(scenario_id = %id, approver_id, "scenario approved");
                Ok(approved)
            }
            Transition::Conflict(current) => Err(PlannerError::StateConflict {
                id,
                current,
                attempted: ScenarioStatus::Approved,
            }),
            Transition::NotFound => Err(PlannerError::NotFound(format!("scenario {id}"))),
        }
    }

    /// Cancel from `DRAFT`, `PENDING` or `APPROVED`
    pub async fn cancel(&self, id: Uuid, reason: &str) -> Result<OptimizationScenario> {
        let current = self.get(id).await?.status;
        if !current.can_transition_to(ScenarioStatus::Cancelled) {
            return Err(PlannerError::StateConflict {
                id,
                current,
                attempted: ScenarioStatus::Cancelled,
            });
        }
        let mut scenario = self.transition(id, current, ScenarioStatus::Cancelled).await?;
        self.dispatcher.forget(id);
        self.log(&mut scenario, ExecutionEvent::Cancelled { reason: reason.to_string() })
            .await?;
        Ok(scenario)
    }

    pub async fn dispatch(&self, id: Uuid, opts: DispatchOptions) -> Result<DispatchOutcome> {
        self.dispatcher.dispatch(id, opts).await
    }

    /// Record the measured impact of an executed action and recompute actual savings
    pub async fn report_action_impact(
        &self,
        id: Uuid,
        action_index: usize,
        actual_impact: f64,
    ) -> Result<OptimizationScenario> {
        let mut scenario = self
            .store
            .set_action_impact(id, action_index, actual_impact)
            .await?;
        self.log(&mut scenario, ExecutionEvent::ImpactReported { action_index, actual_impact })
            .await?;
        info!(scenario_id = %id, action_index, actual_impact, "action impact reported");
        Ok(scenario)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: ScenarioStatus,
        to: ScenarioStatus,
    ) -> Result<OptimizationScenario> {
        match self.store.update_status(id, from, to).await? {
            Transition::Applied(scenario) => {
                info!(scenario_id = %id, %from, %to, "scenario transitioned");
                Ok(scenario)
            }
            Transition::Conflict(current) => Err(PlannerError::StateConflict {
                id,
                current,
                attempted: to,
            }),
            Transition::NotFound => Err(PlannerError::NotFound(format!("scenario {id}"))),
        }
    }

    /// Append to the stored log and to the snapshot handed back to the caller
    async fn log(&self, scenario: &mut OptimizationScenario, event: ExecutionEvent) -> Result<()> {
        let entry = ExecutionLogEntry::now(event);
        self.store.append_execution_log(scenario.id, &entry).await?;
        scenario.execution_log.push(entry);
        Ok(())
    }
}
