//! Wire types shared by the pipeline: CloudEvent envelopes, job requests,
//! terminal results and live progress events.

pub mod envelope;
pub mod in_memory_bus;
pub mod job;
pub mod progress;
pub mod result;

pub use envelope::{Envelope, EnvelopeError, SPEC_VERSION};
pub use in_memory_bus::{InMemoryProgressBus, Subscription};
pub use job::{JOB_REQUEST_EVENT_TYPE, JobRequest, JobRequestData};
pub use progress::{
    DEFAULT_CHANNEL_PREFIX, ProgressError, ProgressEvent, ProgressKind, ProgressSink,
    progress_channel,
};
pub use result::{
    RESULT_EVENT_TYPE_PREFIX, ResultData, ResultEnvelope, ResultError, ResultStatus,
    result_envelope_id,
};
