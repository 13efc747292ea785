//! Source coordinator, pipeline and statistics

pub mod coordinator;
pub mod pipeline;
pub mod stats;

pub use coordinator::{C64Source, Endpoints, SourceOptions};
pub use pipeline::{Pipeline, PipelineSettings, PipelineStats};
pub use stats::{RateSummary, SourceStats, StatsReporter};
