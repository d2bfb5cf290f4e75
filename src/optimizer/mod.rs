//! Optimization scenarios: planning, constraint filtering, lifecycle and dispatch

pub mod constraints;
pub mod dispatch;
pub mod lifecycle;
pub mod planner;

pub use constraints::{apply_constraints, ConstraintReport, DropReason};
pub use dispatch::{ActionDispatcher, DispatchOptions, DispatchOutcome, PartialDispatchFailure};
pub use lifecycle::ScenarioLifecycleManager;
pub use planner::{DeviceKind, DeviceProfile, OptimizationPlanner, PlanRequest};
