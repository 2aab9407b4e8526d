//! Observability utilities: metrics sinks and subscriber setup.

mod logging;
mod metrics;

pub use logging::{init_tracing, LogFormat, DEFAULT_FILTER};
pub use metrics::{names, InMemoryMetrics, Labels, MetricsSink, NoOpMetrics};
