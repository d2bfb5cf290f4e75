//! Demand forecasting: enrichment, tiered prediction and peak detection

pub mod aggregator;
pub mod engine;
pub mod metrics;
pub mod peaks;
pub mod profile;
pub mod service;

pub use aggregator::{ContextRequest, DataAggregator, EnrichmentContext};
pub use engine::{EngineSettings, PredictionEngine, PredictionInput, PredictionOutput};
pub use metrics::ForecastMetrics;
pub use peaks::PeakPeriodDetector;
pub use profile::LoadProfile;
pub use service::{ForecastJob, ForecastRequest, ForecastService, ForecastSettings};
