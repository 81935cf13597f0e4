//! Domain types shared between the agentcore server, runner, and CLI client.

pub mod api;
pub mod job;

pub use api::{
    CancelResponse, ErrorBody, HealthStatus, JobList, JobListQuery, ProfileSummary,
    SubmitJobRequest,
};
pub use job::{
    DEFAULT_TTL_SECONDS, ERROR_LIMIT_BYTES, Job, JobMode, JobStatus, NO_EXIT_CODE, NewJob,
    OUTPUT_LIMIT_BYTES, ProcessOutcome, TransitionError, truncate_utf8,
};
