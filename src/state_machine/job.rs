use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{AgentKind, State, Transition};
use crate::ledger::TokenLedger;
use crate::router::RouteRecord;
use crate::telemetry::CallTrace;

/// Tracks the lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    DeadLettered,
}

/// Structured reason a job terminated without succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    RetryExhausted,
    BudgetExceeded,
    TamperDetected,
    ToolNotAllowed,
    PathTraversal,
    RateLimited,
    ReviewRejected,
    StepLimit,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::RetryExhausted => "retry_exhausted",
            FailureReason::BudgetExceeded => "budget_exceeded",
            FailureReason::TamperDetected => "tamper_detected",
            FailureReason::ToolNotAllowed => "tool_not_allowed",
            FailureReason::PathTraversal => "path_traversal",
            FailureReason::RateLimited => "rate_limited",
            FailureReason::ReviewRejected => "review_rejected",
            FailureReason::StepLimit => "step_limit",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff between retries of the same agent.
///
/// A zero base delay means retries happen immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// A generation request as owned by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub request: String,
    pub user_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(request: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            request: request.into(),
            user_id: user_id.into(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Planner output: the contract both executors build against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub spec: String,
    pub pages: Vec<String>,
    pub endpoints: Vec<String>,
    pub data_models: Vec<String>,
}

/// Validator output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub report: String,
    /// Agent responsible for a failed validation.
    pub target: Option<AgentKind>,
}

/// Findings that parked the job, plus where it continues if approved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReview {
    pub agent: AgentKind,
    pub findings: Vec<String>,
    pub resume_to: State,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub decision: Option<ReviewDecision>,
}

impl PendingReview {
    pub fn new(agent: AgentKind, findings: Vec<String>, resume_to: State) -> Self {
        Self {
            agent,
            findings,
            resume_to,
            requested_at: Utc::now(),
            decision: None,
        }
    }
}

/// External approval signal for a parked job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub approved: bool,
    pub reviewer: String,
    pub decided_at: DateTime<Utc>,
}

impl ReviewDecision {
    pub fn new(approved: bool, reviewer: impl Into<String>) -> Self {
        Self {
            approved,
            reviewer: reviewer.into(),
            decided_at: Utc::now(),
        }
    }
}

/// The single record threaded through a run.
///
/// Everything a worker needs to resume lives here; the current state is
/// derived from `history` rather than stored separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub job: Job,
    #[serde(default)]
    pub spec: Option<ProjectSpec>,
    #[serde(default)]
    pub fe_code: BTreeMap<String, String>,
    #[serde(default)]
    pub be_code: BTreeMap<String, String>,
    #[serde(default)]
    pub validation: Option<ValidationReport>,
    #[serde(default)]
    pub retries: BTreeMap<AgentKind, u32>,
    #[serde(default)]
    pub ledger: TokenLedger,
    #[serde(default)]
    pub history: Vec<Transition>,
    #[serde(default)]
    pub decisions: Vec<RouteRecord>,
    #[serde(default)]
    pub audit: Vec<CallTrace>,
    #[serde(default)]
    pub security_warnings: Vec<String>,
    #[serde(default)]
    pub pending_review: Option<PendingReview>,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    #[serde(default)]
    pub failure_detail: Option<String>,
    #[serde(default)]
    pub request_sanitized: bool,
}

impl AgentState {
    pub fn new(request: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::for_job(Job::new(request, user_id))
    }

    pub fn for_job(job: Job) -> Self {
        Self {
            job,
            spec: None,
            fe_code: BTreeMap::new(),
            be_code: BTreeMap::new(),
            validation: None,
            retries: BTreeMap::new(),
            ledger: TokenLedger::default(),
            history: Vec::new(),
            decisions: Vec::new(),
            audit: Vec::new(),
            security_warnings: Vec::new(),
            pending_review: None,
            failure: None,
            failure_detail: None,
            request_sanitized: false,
        }
    }

    /// PLANNING for a fresh job, otherwise wherever the history left off.
    pub fn current_state(&self) -> State {
        self.history.last().map(|t| t.to).unwrap_or(State::Planning)
    }

    pub fn retry_count(&self, agent: AgentKind) -> u32 {
        self.retries.get(&agent).copied().unwrap_or(0)
    }

    pub(crate) fn bump_retry(&mut self, agent: AgentKind) -> u32 {
        let count = self.retries.entry(agent).or_insert(0);
        *count += 1;
        *count
    }

    /// Whether the inputs `target` consumes have been produced.
    pub fn has_prerequisites_for(&self, target: State) -> bool {
        match target {
            State::Planning => true,
            State::FeExec | State::BeExec => self.spec.is_some(),
            State::Validating => {
                self.spec.is_some() && !self.fe_code.is_empty() && !self.be_code.is_empty()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_creation_defaults() {
        let job = Job::new("todo app", "alice");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.user_id, "alice");
        assert!(!job.id.is_empty());
    }

    #[test]
    fn zero_base_delay_retries_immediately() {
        let policy = RetryPolicy { base_delay_ms: 0 };
        assert_eq!(policy.delay_for_attempt(1), 0);
        assert_eq!(policy.delay_for_attempt(5), 0);
    }

    #[test]
    fn retry_policy_exponential_backoff() {
        let policy = RetryPolicy { base_delay_ms: 250 };
        assert_eq!(policy.delay_for_attempt(1), 250);
        assert_eq!(policy.delay_for_attempt(2), 500);
        assert_eq!(policy.delay_for_attempt(3), 1000);
    }

    #[test]
    fn failure_reason_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&FailureReason::RetryExhausted).unwrap(),
            r#""retry_exhausted""#
        );
        assert_eq!(FailureReason::BudgetExceeded.to_string(), "budget_exceeded");
    }

    #[test]
    fn prerequisites_follow_progress() {
        let mut state = AgentState::new("todo app", "alice");
        assert!(state.has_prerequisites_for(State::Planning));
        assert!(!state.has_prerequisites_for(State::FeExec));

        state.spec = Some(ProjectSpec::default());
        assert!(state.has_prerequisites_for(State::BeExec));
        assert!(!state.has_prerequisites_for(State::Validating));

        state.fe_code.insert("index.tsx".into(), "export {}".into());
        state.be_code.insert("main.py".into(), "app = None".into());
        assert!(state.has_prerequisites_for(State::Validating));
    }

    #[test]
    fn retry_counters_serialize_with_agent_keys() {
        let mut state = AgentState::new("todo app", "alice");
        state.bump_retry(AgentKind::BeExecutor);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["retries"]["be_executor"], 1);

        let back: AgentState = serde_json::from_value(json).unwrap();
        assert_eq!(back.retry_count(AgentKind::BeExecutor), 1);
    }

    #[test]
    fn minimal_message_deserializes_with_defaults() {
        let job = Job::new("todo app", "alice");
        let json = serde_json::json!({ "job": job });
        let state: AgentState = serde_json::from_value(json).unwrap();
        assert_eq!(state.current_state(), State::Planning);
        assert_eq!(state.ledger.total_tokens(), 0);
    }
}
