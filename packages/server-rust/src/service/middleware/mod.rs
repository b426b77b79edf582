//! Tower middleware layers for the command pipeline.
//!
//! - [`timeout`]: Optional per-command deadline
//! - [`metrics`]: Command timing and outcome counters
//! - [`pipeline`]: Composes all layers around the router

pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use metrics::MetricsLayer;
pub use pipeline::{build_command_pipeline, CommandPipeline};
pub use timeout::TimeoutLayer;
