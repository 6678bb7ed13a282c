pub mod pipeline;
pub mod app;
pub mod config;
pub mod control;
pub mod export;
pub mod gap;
pub mod provider;
pub mod registry;
pub mod scheduler;
pub mod sinks;
pub mod status;
pub mod transform;
pub mod observability;
pub mod metrics_server;

#[cfg(test)]
mod testing;

pub use pipeline::{ImportPipeline, ImportRun, PipelineError, RunState};
