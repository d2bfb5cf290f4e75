use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::forecast::profile::round2;

/// Scenario lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioStatus {
    Draft,
    Pending,
    Approved,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl ScenarioStatus {
    /// Allowed lifecycle edges
    pub fn can_transition_to(&self, next: ScenarioStatus) -> bool {
        use ScenarioStatus::*;
        matches!(
            (self, next),
            (Draft, Pending)
                | (Pending, Approved)
                | (Approved, Executing)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Draft, Cancelled)
                | (Pending, Cancelled)
                | (Approved, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Per-action execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Pending,
    Executed,
    Failed,
    Skipped,
}

/// What an action does to its device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    /// Move an HVAC setpoint (°C)
    SetTemperature,
    /// Lower an HVAC setpoint ahead of a peak (°C)
    PreCool,
    /// Dim lighting (% output)
    Dim,
    /// Defer a load until after the peak (0 = off)
    ShiftLoad,
    /// Switch off a non-critical load (0 = off)
    Shed,
}

impl ActionType {
    pub fn is_temperature(&self) -> bool {
        matches!(self, Self::SetTemperature | Self::PreCool)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationAction {
    pub device_id: String,
    pub action_type: ActionType,
    pub current_value: f64,
    pub target_value: f64,
    pub scheduled_time: DateTime<Utc>,
    pub duration_minutes: u32,
    pub status: ActionStatus,
    /// Expected energy reduction (kWh)
    pub expected_impact: f64,
    /// Measured energy reduction (kWh)
    pub actual_impact: Option<f64>,
}

/// Hour-of-day window in which actions may be scheduled, `[start_hour, end_hour)`.
/// A window with `start_hour > end_hour` wraps past midnight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    #[validate(range(max = 23))]
    pub start_hour: u8,
    #[validate(range(min = 1, max = 24))]
    pub end_hour: u8,
}

impl TimeWindow {
    pub fn contains(&self, hour: u32) -> bool {
        let (start, end) = (self.start_hour as u32, self.end_hour as u32);
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_comfort_bounds"))]
pub struct ScenarioConstraints {
    pub min_temperature_c: f64,
    pub max_temperature_c: f64,
    /// Drop temperature actions that leave the comfort band instead of clamping them
    pub preserve_comfort: bool,
    #[serde(default)]
    pub excluded_devices: Vec<String>,
    /// Allowed scheduling windows; empty means any time
    #[serde(default)]
    #[validate(nested)]
    pub time_windows: Vec<TimeWindow>,
}

fn validate_comfort_bounds(c: &ScenarioConstraints) -> Result<(), ValidationError> {
    if !c.min_temperature_c.is_finite()
        || !c.max_temperature_c.is_finite()
        || c.min_temperature_c > c.max_temperature_c
    {
        return Err(ValidationError::new("comfort_bounds"));
    }
    Ok(())
}

impl Default for ScenarioConstraints {
    fn default() -> Self {
        Self {
            min_temperature_c: 20.0,
            max_temperature_c: 26.0,
            preserve_comfort: true,
            excluded_devices: Vec::new(),
            time_windows: Vec::new(),
        }
    }
}

impl ScenarioConstraints {
    pub fn is_excluded(&self, device_id: &str) -> bool {
        self.excluded_devices.iter().any(|d| d == device_id)
    }

    pub fn allows_hour(&self, hour: u32) -> bool {
        self.time_windows.is_empty() || self.time_windows.iter().any(|w| w.contains(hour))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Savings {
    pub energy_kwh: f64,
    pub cost: f64,
    pub peak_reduction_kw: f64,
}

/// A device-level error reported by the device-control collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceError {
    pub device_id: String,
    #[serde(default)]
    pub action_index: Option<usize>,
    pub message: String,
}

/// Execution log event, discriminated by its `type` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ExecutionEvent {
    Created { action_count: usize },
    Submitted { by: String },
    Approved { approver_id: String },
    DryRun {
        execution_id: String,
        actions_queued: u32,
        actions_skipped: u32,
        errors: Vec<DeviceError>,
    },
    Dispatched { execution_id: String, actions_queued: u32, actions_skipped: u32 },
    ActionFailed { action_index: usize, device_id: String, reason: String },
    Completed { actual_savings: Savings },
    Failed { reason: String },
    Cancelled { reason: String },
    ImpactReported { action_index: usize, actual_impact: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    pub at: DateTime<Utc>,
    pub event: ExecutionEvent,
}

impl ExecutionLogEntry {
    pub fn now(event: ExecutionEvent) -> Self {
        Self { at: Utc::now(), event }
    }
}

/// A bundle of scheduled device actions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationScenario {
    pub id: Uuid,
    pub building_id: String,
    pub forecast_id: Option<Uuid>,
    pub name: String,
    pub status: ScenarioStatus,
    pub actions: Vec<OptimizationAction>,
    pub constraints: ScenarioConstraints,
    pub expected_savings: Savings,
    pub actual_savings: Option<Savings>,
    pub created_by: String,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub execution_log: Vec<ExecutionLogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OptimizationScenario {
    /// Sum of the measured impact of executed actions
    pub fn actual_energy_kwh(&self) -> f64 {
        self.actions
            .iter()
            .filter(|a| a.status == ActionStatus::Executed)
            .filter_map(|a| a.actual_impact)
            .sum()
    }

    /// Measured savings. Energy is the reported impact of executed actions;
    /// cost and peak reduction scale with it from the expected figures.
    pub fn measured_savings(&self) -> Savings {
        let energy_kwh = self.actual_energy_kwh();
        let ratio = if self.expected_savings.energy_kwh > 0.0 {
            energy_kwh / self.expected_savings.energy_kwh
        } else {
            0.0
        };
        Savings {
            energy_kwh: round2(energy_kwh),
            cost: round2(self.expected_savings.cost * ratio),
            peak_reduction_kw: round2(self.expected_savings.peak_reduction_kw * ratio),
        }
    }

    /// Set the measured impact of an executed action and refresh
    /// `actual_savings`. Leaves the scenario untouched on error.
    pub fn record_impact(&mut self, action_index: usize, actual_impact: f64) -> Result<(), String> {
        if !actual_impact.is_finite() {
            return Err("actual_impact must be finite".to_string());
        }
        let action = self
            .actions
            .get_mut(action_index)
            .ok_or_else(|| format!("scenario {} has no action {action_index}", self.id))?;
        if action.status != ActionStatus::Executed {
            return Err(format!(
                "action {action_index} is {}, only EXECUTED actions have an impact",
                action.status
            ));
        }
        action.actual_impact = Some(actual_impact);
        self.actual_savings = Some(self.measured_savings());
        Ok(())
    }
}
