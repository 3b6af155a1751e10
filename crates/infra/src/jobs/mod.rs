//! Job pipeline: consume job requests, execute them once per job, publish
//! exactly one terminal result.
//!
//! ## Components
//!
//! - `JobConsumer`: pull loop, ack/nak/retry orchestration
//! - `ExecutionGuard`: at most one active execution per job id
//! - `ExecutionCoordinator`: the boundary a workflow runtime implements
//! - `ReplayCoordinator`: coordinator that replays captured progress events
//! - `ResultEmitter`: durable publication of terminal results
//! - `RetryPolicy`: attempt limits and backoff

pub mod consumer;
pub mod coordinator;
pub mod emitter;
pub mod guard;
pub mod replay;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use consumer::{ConsumerConfig, JobConsumer, Outcome};
pub use coordinator::{ExecutionContext, ExecutionCoordinator, ExecutionError};
pub use emitter::{EmitError, EmitterConfig, ResultEmitter};
pub use guard::{ExecutionGuard, GuardToken};
pub use replay::{REPLAY_CHECKPOINT_KIND, ReplayConfig, ReplayCoordinator, ReplayError};
pub use types::{Backoff, ExecutionState, ExecutionStatus, RetryPolicy};
