use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};
use tracing::{debug, info};
use uuid::Uuid;
use validator::Validate;

use super::constraints::apply_constraints;
use crate::config::PlannerConfig;
use crate::domain::{
    ActionStatus, ActionType, ExecutionEvent, ExecutionLogEntry, Forecast, ForecastStatus,
    OptimizationAction, OptimizationScenario, PeakAnalysis, PeakPeriod, Savings,
    ScenarioConstraints, ScenarioStatus, Severity,
};
use crate::error::{PlannerError, Result};
use crate::forecast::profile::round2;

/// Share of HVAC rated power saved per °C of setpoint relaxation
const HVAC_SAVING_PER_DEGREE: f64 = 0.06;
/// Lighting is dimmed to this output level (%)
const DIM_LEVEL_PERCENT: f64 = 80.0;
const DIM_SAVING: f64 = 0.2;
const PRE_COOL_DEGREES: f64 = 1.0;
const PRE_COOL_MINUTES: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceKind {
    Hvac,
    Lighting,
    DeferrableLoad,
    NonCriticalLoad,
}

/// A controllable device and its present state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    #[validate(length(min = 1))]
    pub device_id: String,
    pub kind: DeviceKind,
    #[validate(range(min = 0.0))]
    pub rated_kw: f64,
    /// Setpoint (°C) for HVAC, output (%) for lighting, draw (kW) for loads
    pub current_value: f64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    #[validate(length(min = 1))]
    pub building_id: String,
    /// Forecast to plan against; the latest `PEAK_LOAD` forecast when absent
    pub forecast_id: Option<Uuid>,
    pub name: Option<String>,
    #[validate(length(min = 1))]
    pub requested_by: String,
    #[validate(nested)]
    pub devices: Vec<DeviceProfile>,
    #[validate(nested)]
    pub constraints: Option<ScenarioConstraints>,
    #[validate(range(exclusive_min = 0.0, max = 500.0))]
    pub threshold_percent: Option<f64>,
}

pub struct OptimizationPlanner {
    tz: Tz,
    defaults: ScenarioConstraints,
}

impl OptimizationPlanner {
    pub fn new(tz: Tz, defaults: ScenarioConstraints) -> Self {
        Self { tz, defaults }
    }

    pub fn from_config(cfg: &PlannerConfig, tz: Tz) -> Self {
        Self::new(
            tz,
            ScenarioConstraints {
                min_temperature_c: cfg.min_temperature_c,
                max_temperature_c: cfg.max_temperature_c,
                preserve_comfort: cfg.preserve_comfort,
                ..Default::default()
            },
        )
    }

    /// Build a `DRAFT` scenario for the peaks of `analysis`. Candidate actions
    /// are filtered against the constraints before savings are computed.
    pub fn plan(
        &self,
        req: &PlanRequest,
        forecast: &Forecast,
        analysis: &PeakAnalysis,
        rate_per_kwh: f64,
    ) -> Result<OptimizationScenario> {
        req.validate()?;
        if forecast.status != ForecastStatus::Completed {
            return Err(PlannerError::Validation(format!(
                "forecast {} is {}, only COMPLETED forecasts can be planned against",
                forecast.id, forecast.status
            )));
        }
        if forecast.building_id != req.building_id {
            return Err(PlannerError::Validation(format!(
                "forecast {} belongs to building {}",
                forecast.id, forecast.building_id
            )));
        }

        let constraints = req.constraints.clone().unwrap_or_else(|| self.defaults.clone());
        let candidates: Vec<_> = analysis
            .peaks
            .iter()
            .flat_map(|peak| actions_for_peak(peak, analysis.threshold, &req.devices))
            .collect();
        let candidate_count = candidates.len();

        let report = apply_constraints(candidates, &constraints, self.tz);
        for dropped in &report.dropped {
            debug!(
                device_id = %dropped.action.device_id,
                reason = %dropped.reason,
                "candidate action dropped"
            );
        }

        let expected_savings = expected_savings(&report.kept, rate_per_kwh);
        let now = Utc::now();
        let scenario = OptimizationScenario {
            id: Uuid::new_v4(),
            building_id: req.building_id.clone(),
            forecast_id: Some(forecast.id),
            name: req
                .name
                .clone()
                .unwrap_or_else(|| format!("Peak mitigation {}", now.format("%Y-%m-%d %H:%M"))),
            status: ScenarioStatus::Draft,
            execution_log: vec![ExecutionLogEntry::now(ExecutionEvent::Created {
                action_count: report.kept.len(),
            })],
            actions: report.kept,
            constraints,
            expected_savings,
            actual_savings: None,
            created_by: req.requested_by.clone(),
            approved_by: None,
            approved_at: None,
            created_at: now,
            updated_at: now,
        };

        info!(
            scenario_id = %scenario.id,
            building_id = %scenario.building_id,
            peaks = analysis.peaks.len(),
            candidates = candidate_count,
            actions = scenario.actions.len(),
            clamped = report.clamped,
            energy_kwh = scenario.expected_savings.energy_kwh,
            "scenario planned"
        );
        Ok(scenario)
    }
}

/// One candidate reduction, before it is turned into an action
struct Candidate<'a> {
    device: &'a DeviceProfile,
    action_type: ActionType,
    target_value: f64,
    reducible_kw: f64,
}

/// Candidate actions for one peak. Each level includes the actions of the
/// levels below it; reductions are allocated in order until the excess over
/// the threshold is covered.
pub fn actions_for_peak(
    peak: &PeakPeriod,
    threshold: f64,
    devices: &[DeviceProfile],
) -> Vec<OptimizationAction> {
    let setpoint_raise = match peak.severity {
        Severity::Low => return Vec::new(),
        Severity::Medium => 1.0,
        Severity::High => 2.0,
        Severity::Critical => 3.0,
    };

    let of_kind = |kind: DeviceKind| devices.iter().filter(move |d| d.kind == kind);
    let mut candidates: Vec<Candidate<'_>> = Vec::new();

    candidates.extend(of_kind(DeviceKind::Hvac).map(|d| Candidate {
        device: d,
        action_type: ActionType::SetTemperature,
        target_value: d.current_value + setpoint_raise,
        reducible_kw: d.rated_kw * HVAC_SAVING_PER_DEGREE * setpoint_raise,
    }));
    candidates.extend(of_kind(DeviceKind::Lighting).map(|d| Candidate {
        device: d,
        action_type: ActionType::Dim,
        target_value: DIM_LEVEL_PERCENT,
        reducible_kw: d.rated_kw * DIM_SAVING,
    }));
    if peak.severity >= Severity::High {
        candidates.extend(of_kind(DeviceKind::DeferrableLoad).map(|d| Candidate {
            device: d,
            action_type: ActionType::ShiftLoad,
            target_value: 0.0,
            reducible_kw: d.rated_kw,
        }));
    }
    if peak.severity >= Severity::Critical {
        candidates.extend(of_kind(DeviceKind::NonCriticalLoad).map(|d| Candidate {
            device: d,
            action_type: ActionType::Shed,
            target_value: 0.0,
            reducible_kw: d.rated_kw,
        }));
    }

    let hours = peak.duration_hours();
    let duration_minutes = (hours * 60.0).round() as u32;
    let mut remaining_kw = (peak.peak_value - threshold).max(0.0);
    let mut actions = Vec::new();

    for c in candidates {
        let kw = c.reducible_kw.min(remaining_kw);
        if kw <= 0.0 {
            continue;
        }
        remaining_kw -= kw;
        actions.push(action(
            c.device,
            c.action_type,
            c.target_value,
            peak.start_time,
            duration_minutes,
            kw * hours,
        ));
    }

    // pre-cooling only makes sense ahead of a setpoint raise
    if peak.severity >= Severity::High {
        let raised: Vec<_> = actions
            .iter()
            .filter(|a| a.action_type == ActionType::SetTemperature)
            .map(|a| a.device_id.clone())
            .collect();
        for d in of_kind(DeviceKind::Hvac).filter(|d| raised.contains(&d.device_id)) {
            actions.push(action(
                d,
                ActionType::PreCool,
                d.current_value - PRE_COOL_DEGREES,
                peak.start_time - Duration::minutes(PRE_COOL_MINUTES as i64),
                PRE_COOL_MINUTES,
                0.0,
            ));
        }
    }

    actions.sort_by_key(|a| a.scheduled_time);
    actions
}

fn action(
    device: &DeviceProfile,
    action_type: ActionType,
    target_value: f64,
    scheduled_time: DateTime<Utc>,
    duration_minutes: u32,
    expected_impact: f64,
) -> OptimizationAction {
    OptimizationAction {
        device_id: device.device_id.clone(),
        action_type,
        current_value: device.current_value,
        target_value,
        scheduled_time,
        duration_minutes,
        status: ActionStatus::Pending,
        expected_impact: round2(expected_impact),
        actual_impact: None,
    }
}

/// Average kW an action takes off its window
fn reduction_kw(action: &OptimizationAction) -> f64 {
    if action.duration_minutes == 0 {
        return 0.0;
    }
    action.expected_impact / (action.duration_minutes as f64 / 60.0)
}

/// Savings the actions are expected to achieve. Peak reduction is the
/// largest combined reduction over actions starting at the same time.
pub fn expected_savings(actions: &[OptimizationAction], rate_per_kwh: f64) -> Savings {
    let energy_kwh: f64 = actions.iter().map(|a| a.expected_impact).sum();
    let mut per_window: BTreeMap<DateTime<Utc>, f64> = BTreeMap::new();
    for a in actions.iter().filter(|a| a.action_type != ActionType::PreCool) {
        *per_window.entry(a.scheduled_time).or_default() += reduction_kw(a);
    }
    let peak_reduction_kw = per_window.values().copied().fold(0.0, f64::max);

    Savings {
        energy_kwh: round2(energy_kwh),
        cost: round2(energy_kwh * rate_per_kwh),
        peak_reduction_kw: round2(peak_reduction_kw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ForecastType, TimeWindow};
    use chrono::TimeZone;
    use rstest::rstest;
    use ActionType::{Dim, PreCool, SetTemperature, Shed, ShiftLoad};

    fn device(id: &str, kind: DeviceKind, rated_kw: f64, current_value: f64) -> DeviceProfile {
        DeviceProfile { device_id: id.into(), kind, rated_kw, current_value }
    }

    fn devices() -> Vec<DeviceProfile> {
        vec![
            device("hvac-1", DeviceKind::Hvac, 100.0, 22.0),
            device("light-1", DeviceKind::Lighting, 20.0, 100.0),
            device("ev-bank", DeviceKind::DeferrableLoad, 15.0, 15.0),
            device("fountain", DeviceKind::NonCriticalLoad, 5.0, 5.0),
        ]
    }

    fn peak(severity: Severity, peak_value: f64) -> PeakPeriod {
        let start = Utc.with_ymd_and_hms(2026, 1, 5, 13, 0, 0).unwrap();
        PeakPeriod {
            start_time: start,
            end_time: start + Duration::hours(2),
            peak_value,
            expected_load: peak_value * 2.0,
            percent_above_base: 0.0,
            severity,
            confidence: 0.85,
            mitigation_actions: severity.mitigation_actions(),
        }
    }

    fn completed_forecast() -> Forecast {
        let mut f = Forecast::processing("b-1", None, ForecastType::PeakLoad, 24);
        f.status = ForecastStatus::Completed;
        f
    }

    fn request() -> PlanRequest {
        PlanRequest {
            building_id: "b-1".into(),
            forecast_id: None,
            name: None,
            requested_by: "ops-1".into(),
            devices: devices(),
            constraints: None,
            threshold_percent: None,
        }
    }

    #[rstest]
    #[case(Severity::Low, vec![])]
    #[case(Severity::Medium, vec![SetTemperature, Dim])]
    #[case(Severity::High, vec![PreCool, SetTemperature, Dim, ShiftLoad])]
    #[case(Severity::Critical, vec![PreCool, SetTemperature, Dim, ShiftLoad, Shed])]
    fn test_actions_by_severity(#[case] severity: Severity, #[case] expected: Vec<ActionType>) {
        // excess large enough to cover every device
        let actions = actions_for_peak(&peak(severity, 500.0), 100.0, &devices());
        let types: Vec<_> = actions.iter().map(|a| a.action_type).collect();
        assert_eq!(types, expected);
    }

    #[test]
    fn test_impact_allocated_against_excess() {
        // excess 10 kW over 2 h; HVAC +1 covers 6 kW, lighting the remaining 4
        let actions = actions_for_peak(&peak(Severity::Medium, 110.0), 100.0, &devices());
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].expected_impact, 12.0);
        assert_eq!(actions[0].target_value, 23.0);
        assert_eq!(actions[1].expected_impact, 8.0);
        assert_eq!(actions[1].target_value, 80.0);
        assert_eq!(actions[1].duration_minutes, 120);

        // a small excess is covered by HVAC alone
        let actions = actions_for_peak(&peak(Severity::Medium, 103.0), 100.0, &devices());
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].expected_impact, 6.0);
    }

    #[test]
    fn test_pre_cool_scheduled_an_hour_ahead() {
        let p = peak(Severity::High, 500.0);
        let actions = actions_for_peak(&p, 100.0, &devices());
        let pre_cool = &actions[0];
        assert_eq!(pre_cool.action_type, ActionType::PreCool);
        assert_eq!(pre_cool.scheduled_time, p.start_time - Duration::hours(1));
        assert_eq!(pre_cool.target_value, 21.0);
        assert_eq!(pre_cool.expected_impact, 0.0);
    }

    #[test]
    fn test_plan_builds_draft_with_savings() {
        let planner = OptimizationPlanner::new(chrono_tz::UTC, ScenarioConstraints::default());
        let analysis = PeakAnalysis {
            baseline: 90.0,
            threshold: 100.0,
            peaks: vec![peak(Severity::Medium, 110.0)],
            recommendations: vec![],
            total_peak_hours: 2.0,
        };
        let forecast = completed_forecast();

        let scenario = planner.plan(&request(), &forecast, &analysis, 0.25).unwrap();
        assert_eq!(scenario.status, ScenarioStatus::Draft);
        assert_eq!(scenario.forecast_id, Some(forecast.id));
        assert_eq!(scenario.actions.len(), 2);
        assert_eq!(scenario.expected_savings.energy_kwh, 20.0);
        assert_eq!(scenario.expected_savings.cost, 5.0);
        assert_eq!(scenario.expected_savings.peak_reduction_kw, 10.0);
        assert!(scenario.approved_by.is_none());
        assert!(matches!(
            scenario.execution_log[0].event,
            ExecutionEvent::Created { action_count: 2 }
        ));
    }

    #[test]
    fn test_plan_leaves_no_pre_cool_without_its_raise() {
        let planner = OptimizationPlanner::new(chrono_tz::UTC, ScenarioConstraints::default());
        let analysis = PeakAnalysis {
            baseline: 90.0,
            threshold: 100.0,
            peaks: vec![peak(Severity::Critical, 500.0)],
            recommendations: vec![],
            total_peak_hours: 2.0,
        };
        let mut req = request();
        // a CRITICAL raise takes hvac-1 from 22 to 25
        req.constraints =
            Some(ScenarioConstraints { max_temperature_c: 24.0, ..Default::default() });

        let scenario = planner.plan(&req, &completed_forecast(), &analysis, 0.25).unwrap();
        let types: Vec<_> = scenario.actions.iter().map(|a| a.action_type).collect();
        assert_eq!(types, vec![ActionType::Dim, ActionType::ShiftLoad, ActionType::Shed]);
        assert!(scenario.actions.iter().all(|a| a.device_id != "hvac-1"));
    }

    #[test]
    fn test_plan_applies_constraints_before_savings() {
        let planner = OptimizationPlanner::new(chrono_tz::UTC, ScenarioConstraints::default());
        let analysis = PeakAnalysis {
            baseline: 90.0,
            threshold: 100.0,
            peaks: vec![peak(Severity::Medium, 110.0)],
            recommendations: vec![],
            total_peak_hours: 2.0,
        };
        let mut req = request();
        req.constraints = Some(ScenarioConstraints {
            excluded_devices: vec!["light-1".into()],
            ..Default::default()
        });

        let scenario = planner.plan(&req, &completed_forecast(), &analysis, 0.25).unwrap();
        assert_eq!(scenario.actions.len(), 1);
        assert_eq!(scenario.expected_savings.energy_kwh, 12.0);

        req.constraints = Some(ScenarioConstraints {
            time_windows: vec![TimeWindow { start_hour: 0, end_hour: 6 }],
            ..Default::default()
        });
        let scenario = planner.plan(&req, &completed_forecast(), &analysis, 0.25).unwrap();
        assert!(scenario.actions.is_empty());
        assert_eq!(scenario.expected_savings, Savings::default());
    }

    #[test]
    fn test_plan_rejects_invalid_requests() {
        let planner = OptimizationPlanner::new(chrono_tz::UTC, ScenarioConstraints::default());
        let analysis = PeakAnalysis {
            baseline: 90.0,
            threshold: 100.0,
            peaks: vec![],
            recommendations: vec![],
            total_peak_hours: 0.0,
        };

        let mut processing = completed_forecast();
        processing.status = ForecastStatus::Processing;
        assert!(matches!(
            planner.plan(&request(), &processing, &analysis, 0.25),
            Err(PlannerError::Validation(_))
        ));

        let mut req = request();
        req.constraints = Some(ScenarioConstraints {
            min_temperature_c: 25.0,
            max_temperature_c: 21.0,
            ..Default::default()
        });
        assert!(matches!(
            planner.plan(&req, &completed_forecast(), &analysis, 0.25),
            Err(PlannerError::Validation(_))
        ));

        let mut req = request();
        req.requested_by = String::new();
        assert!(planner.plan(&req, &completed_forecast(), &analysis, 0.25).is_err());
    }
}
