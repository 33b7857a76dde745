// Pipeline counters

mod collector;

pub use collector::{MetricsSnapshot, PipelineMetrics};
