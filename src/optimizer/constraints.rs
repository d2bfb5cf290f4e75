use chrono::{Duration, Timelike};
use chrono_tz::Tz;
use serde::Serialize;
use strum::Display;

use crate::domain::{ActionType, OptimizationAction, ScenarioConstraints};
use crate::forecast::profile::round2;

/// Why a candidate action did not make it into the scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DropReason {
    ExcludedDevice,
    OutsideTimeWindow,
    ComfortBounds,
    /// Clamping left nothing to change
    NoOp,
    /// Pre-cool whose setpoint raise was dropped
    OrphanedPreCool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DroppedAction {
    pub action: OptimizationAction,
    pub reason: DropReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstraintReport {
    pub kept: Vec<OptimizationAction>,
    pub dropped: Vec<DroppedAction>,
    /// Number of kept actions whose target was clamped into the comfort band
    pub clamped: usize,
}

/// Filter and clip candidate actions. Time windows are evaluated in the
/// building's timezone.
pub fn apply_constraints(
    candidates: Vec<OptimizationAction>,
    constraints: &ScenarioConstraints,
    tz: Tz,
) -> ConstraintReport {
    let mut report = ConstraintReport::default();

    for mut action in candidates {
        if constraints.is_excluded(&action.device_id) {
            report.dropped.push(DroppedAction { action, reason: DropReason::ExcludedDevice });
            continue;
        }

        let local_hour = action.scheduled_time.with_timezone(&tz).hour();
        if !constraints.allows_hour(local_hour) {
            report.dropped.push(DroppedAction { action, reason: DropReason::OutsideTimeWindow });
            continue;
        }

        if action.action_type.is_temperature() {
            let (min, max) = (constraints.min_temperature_c, constraints.max_temperature_c);
            if action.target_value < min || action.target_value > max {
                if constraints.preserve_comfort {
                    report
                        .dropped
                        .push(DroppedAction { action, reason: DropReason::ComfortBounds });
                    continue;
                }
                match clamp_target(&mut action, min, max) {
                    Ok(()) => report.clamped += 1,
                    Err(reason) => {
                        report.dropped.push(DroppedAction { action, reason });
                        continue;
                    }
                }
            }
        }

        report.kept.push(action);
    }

    drop_orphaned_pre_cool(&mut report);
    report
}

/// A pre-cool ends where the setpoint raise it prepares for starts; without
/// that raise it only costs energy.
fn drop_orphaned_pre_cool(report: &mut ConstraintReport) {
    let raises: Vec<_> = report
        .kept
        .iter()
        .filter(|a| a.action_type == ActionType::SetTemperature)
        .map(|a| (a.device_id.clone(), a.scheduled_time))
        .collect();

    let (kept, orphans): (Vec<_>, Vec<_>) =
        std::mem::take(&mut report.kept).into_iter().partition(|a| {
            if a.action_type != ActionType::PreCool {
                return true;
            }
            let ends = a.scheduled_time + Duration::minutes(a.duration_minutes as i64);
            raises
                .iter()
                .any(|(device_id, start)| *device_id == a.device_id && *start == ends)
        });
    report.kept = kept;
    report.dropped.extend(
        orphans
            .into_iter()
            .map(|action| DroppedAction { action, reason: DropReason::OrphanedPreCool }),
    );
}

/// Move the target onto the nearest bound and scale the expected impact by
/// how much of the original change remains.
fn clamp_target(action: &mut OptimizationAction, min: f64, max: f64) -> Result<(), DropReason> {
    let original = action.target_value - action.current_value;
    let clamped = action.target_value.clamp(min, max);
    let remaining = clamped - action.current_value;

    if remaining.abs() < 1e-9 {
        return Err(DropReason::NoOp);
    }
    // the bound lies on the other side of the current value
    if remaining.signum() != original.signum() {
        return Err(DropReason::ComfortBounds);
    }

    action.expected_impact = round2(action.expected_impact * remaining / original);
    action.target_value = clamped;
    Ok(())
}
