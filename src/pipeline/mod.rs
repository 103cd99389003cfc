pub mod controller;
pub mod metrics;
pub mod reporter;

pub use controller::{Controller, PipelineError, PipelineState, RunSummary, StopHandle};
pub use metrics::{MetricsCollector, MetricsSnapshot};
