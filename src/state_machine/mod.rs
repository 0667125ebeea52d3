mod job;
mod state;

pub use job::{
    AgentState, FailureReason, Job, JobStatus, PendingReview, ProjectSpec, RetryPolicy,
    ReviewDecision, ValidationReport,
};
pub use state::{AgentKind, JobLimits, State, StateMachine, Transition};
