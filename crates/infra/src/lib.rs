//! Infrastructure layer: configuration, broker, progress fan-out, checkpoint
//! storage and the job pipeline that ties them together.

pub mod broker;
pub mod checkpoint_store;
pub mod config;
pub mod jobs;
pub mod progress;


pub use config::{ConfigError, ExecutionMode, PipelineConfig};
pub use jobs::{JobConsumer, Outcome};
