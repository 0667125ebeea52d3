use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::job::{AgentState, FailureReason, JobStatus, ReviewDecision};
use crate::router::RouteDecision;

/// The states of the generation state machine.
///
/// A job flows through: PLANNING → FE_EXEC → BE_EXEC → VALIDATING → DONE,
/// with re-entries driven by retries and validator routing. `Done` and
/// `Failed` are terminal; `AwaitingReview` parks the job until an external
/// review decision arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Planning,
    FeExec,
    BeExec,
    Validating,
    Done,
    Failed,
    AwaitingReview,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Planning => write!(f, "PLANNING"),
            State::FeExec => write!(f, "FE_EXEC"),
            State::BeExec => write!(f, "BE_EXEC"),
            State::Validating => write!(f, "VALIDATING"),
            State::Done => write!(f, "DONE"),
            State::Failed => write!(f, "FAILED"),
            State::AwaitingReview => write!(f, "AWAITING_REVIEW"),
        }
    }
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Failed)
    }

    /// The agent invoked on entering this state, if any.
    pub fn agent(self) -> Option<AgentKind> {
        match self {
            State::Planning => Some(AgentKind::Planner),
            State::FeExec => Some(AgentKind::FeExecutor),
            State::BeExec => Some(AgentKind::BeExecutor),
            State::Validating => Some(AgentKind::Validator),
            State::Done | State::Failed | State::AwaitingReview => None,
        }
    }

    /// Static default sequence used when no routing decision overrides it.
    pub fn default_next(self) -> Option<State> {
        match self {
            State::Planning => Some(State::FeExec),
            State::FeExec => Some(State::BeExec),
            State::BeExec => Some(State::Validating),
            _ => None,
        }
    }
}

/// One step of the generation pipeline. `Router` is the optional
/// decision oracle consulted between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Router,
    Planner,
    FeExecutor,
    BeExecutor,
    Validator,
}

impl AgentKind {
    pub const ALL: [AgentKind; 5] = [
        AgentKind::Router,
        AgentKind::Planner,
        AgentKind::FeExecutor,
        AgentKind::BeExecutor,
        AgentKind::Validator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Router => "router",
            AgentKind::Planner => "planner",
            AgentKind::FeExecutor => "fe_executor",
            AgentKind::BeExecutor => "be_executor",
            AgentKind::Validator => "validator",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == name)
    }

    /// State that runs this agent. The router has none.
    pub fn state(self) -> Option<State> {
        match self {
            AgentKind::Router => None,
            AgentKind::Planner => Some(State::Planning),
            AgentKind::FeExecutor => Some(State::FeExec),
            AgentKind::BeExecutor => Some(State::BeExec),
            AgentKind::Validator => Some(State::Validating),
        }
    }

    /// Action this agent's output is carried out with.
    pub fn tool(self) -> Option<&'static str> {
        match self {
            AgentKind::FeExecutor | AgentKind::BeExecutor => Some("file_writer"),
            _ => None,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entry in the append-only transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: State,
    pub to: State,
    pub reason: String,
    pub at: chrono::DateTime<Utc>,
}

/// Job limits enforced by the budget/retry gate.
#[derive(Debug, Clone)]
pub struct JobLimits {
    pub max_retries: u32,
    pub job_token_budget: u64,
    pub caps: crate::config::AgentTokenCaps,
}

/// Mutates an [`AgentState`] through the state machine.
///
/// Every mutation appends to the history, so the current state can always be
/// recovered from the serialized record alone.
pub struct StateMachine;

impl StateMachine {
    /// Move to `to`, recording why.
    pub fn advance(state: &mut AgentState, to: State, reason: impl Into<String>) {
        let from = state.current_state();
        state.history.push(Transition {
            from,
            to,
            reason: reason.into(),
            at: Utc::now(),
        });
        state.job.updated_at = Utc::now();
        match to {
            State::Done => state.job.status = JobStatus::Succeeded,
            State::Failed => state.job.status = JobStatus::Failed,
            _ => {}
        }
    }

    /// Record a failed invocation of `agent` and re-enter the same state.
    ///
    /// Returns the agent's new retry count.
    pub fn retry(state: &mut AgentState, agent: AgentKind, reason: &str) -> u32 {
        let count = state.bump_retry(agent);
        let current = state.current_state();
        Self::advance(state, current, format!("retry {agent} #{count}: {reason}"));
        count
    }

    /// Terminate the job. Prior history is kept for postmortem.
    pub fn fail(state: &mut AgentState, reason: FailureReason, detail: impl Into<String>) {
        let detail = detail.into();
        state.failure = Some(reason);
        state.failure_detail = Some(detail.clone());
        Self::advance(state, State::Failed, format!("{reason}: {detail}"));
    }

    /// Budget/retry gate checked before every invocation of `agent`.
    pub fn gate(state: &AgentState, agent: AgentKind, limits: &JobLimits) -> Result<(), (FailureReason, String)> {
        let retries = state.retry_count(agent);
        if retries >= limits.max_retries {
            return Err((
                FailureReason::RetryExhausted,
                format!("{agent} retried {retries} of {} allowed", limits.max_retries),
            ));
        }

        let total = state.ledger.total_tokens();
        if total >= limits.job_token_budget {
            return Err((
                FailureReason::BudgetExceeded,
                format!("job used {total} of {} tokens", limits.job_token_budget),
            ));
        }

        let used = state.ledger.agent_tokens(agent);
        let cap = limits.caps.cap_for(agent);
        if used >= cap {
            return Err((
                FailureReason::BudgetExceeded,
                format!("{agent} used {used} of its {cap} token cap"),
            ));
        }

        Ok(())
    }

    /// Apply an external review decision to a job parked in AWAITING_REVIEW.
    ///
    /// Approval resumes at the state chosen before suspension; rejection
    /// fails the job. Returns `false` if the job was not awaiting review.
    pub fn resolve_review(state: &mut AgentState, decision: ReviewDecision) -> bool {
        if state.current_state() != State::AwaitingReview {
            return false;
        }
        let Some(pending) = state.pending_review.take() else {
            return false;
        };

        if decision.approved {
            let resume = pending.resume_to;
            state.decisions.push(crate::router::RouteRecord::review(
                RouteDecision::new(resume, format!("approved by {}", decision.reviewer)),
            ));
            Self::advance(state, resume, format!("review approved by {}", decision.reviewer));
        } else {
            Self::fail(
                state,
                FailureReason::ReviewRejected,
                format!("rejected by {}", decision.reviewer),
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentTokenCaps;
    use crate::ledger::{CallUsage, PricingTable};
    use crate::state_machine::job::PendingReview;

    fn limits(max_retries: u32) -> JobLimits {
        JobLimits {
            max_retries,
            job_token_budget: 200_000,
            caps: AgentTokenCaps::default(),
        }
    }

    fn make_state() -> AgentState {
        AgentState::new("todo app", "alice")
    }

    #[test]
    fn fresh_state_starts_in_planning() {
        let state = make_state();
        assert_eq!(state.current_state(), State::Planning);
        assert!(state.history.is_empty());
    }

    #[test]
    fn advance_records_history_and_resumes_from_it() {
        let mut state = make_state();
        StateMachine::advance(&mut state, State::FeExec, "planned");
        StateMachine::advance(&mut state, State::BeExec, "frontend generated");

        assert_eq!(state.current_state(), State::BeExec);
        let path: Vec<_> = state.history.iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            path,
            vec![(State::Planning, State::FeExec), (State::FeExec, State::BeExec)]
        );

        let json = serde_json::to_string(&state).unwrap();
        let resumed: AgentState = serde_json::from_str(&json).unwrap();
        assert_eq!(resumed.current_state(), State::BeExec);
    }

    #[test]
    fn retry_reenters_same_state_and_counts() {
        let mut state = make_state();
        let count = StateMachine::retry(&mut state, AgentKind::Planner, "schema_invalid");
        assert_eq!(count, 1);
        assert_eq!(state.current_state(), State::Planning);
        assert_eq!(state.retry_count(AgentKind::Planner), 1);
        assert_eq!(state.retry_count(AgentKind::FeExecutor), 0);
    }

    #[test]
    fn gate_rejects_exhausted_retries() {
        let mut state = make_state();
        for _ in 0..3 {
            StateMachine::retry(&mut state, AgentKind::Planner, "upstream");
        }
        let (reason, _) = StateMachine::gate(&state, AgentKind::Planner, &limits(3)).unwrap_err();
        assert_eq!(reason, FailureReason::RetryExhausted);
        assert!(StateMachine::gate(&state, AgentKind::FeExecutor, &limits(3)).is_ok());
    }

    #[test]
    fn gate_rejects_agent_over_its_cap() {
        let mut state = make_state();
        let pricing = PricingTable::default();
        state
            .ledger
            .record(AgentKind::Planner, &CallUsage::new("claude-haiku-4-5", 6_000, 4_000), &pricing, 200_000)
            .unwrap();
        let (reason, detail) = StateMachine::gate(&state, AgentKind::Planner, &limits(3)).unwrap_err();
        assert_eq!(reason, FailureReason::BudgetExceeded);
        assert!(detail.contains("planner"));
    }

    #[test]
    fn gate_rejects_job_over_budget() {
        let mut state = make_state();
        let pricing = PricingTable::default();
        state
            .ledger
            .record(AgentKind::FeExecutor, &CallUsage::new("claude-haiku-4-5", 500, 500), &pricing, 200_000)
            .unwrap();
        let tight = JobLimits {
            job_token_budget: 1_000,
            ..limits(3)
        };
        let (reason, _) = StateMachine::gate(&state, AgentKind::BeExecutor, &tight).unwrap_err();
        assert_eq!(reason, FailureReason::BudgetExceeded);
    }

    #[test]
    fn fail_keeps_history_and_sets_status() {
        let mut state = make_state();
        StateMachine::advance(&mut state, State::FeExec, "planned");
        StateMachine::fail(&mut state, FailureReason::PathTraversal, "../etc/passwd");

        assert_eq!(state.current_state(), State::Failed);
        assert_eq!(state.job.status, JobStatus::Failed);
        assert_eq!(state.failure, Some(FailureReason::PathTraversal));
        assert_eq!(state.history.len(), 2);
    }

    #[test]
    fn review_approval_resumes_and_rejection_fails() {
        let mut approved = make_state();
        approved.pending_review = Some(PendingReview::new(AgentKind::BeExecutor, vec!["eval(".into()], State::Validating));
        StateMachine::advance(&mut approved, State::AwaitingReview, "risky pattern");
        assert!(StateMachine::resolve_review(&mut approved, ReviewDecision::new(true, "bob")));
        assert_eq!(approved.current_state(), State::Validating);

        let mut rejected = make_state();
        rejected.pending_review = Some(PendingReview::new(AgentKind::BeExecutor, vec![], State::Validating));
        StateMachine::advance(&mut rejected, State::AwaitingReview, "risky pattern");
        assert!(StateMachine::resolve_review(&mut rejected, ReviewDecision::new(false, "bob")));
        assert_eq!(rejected.current_state(), State::Failed);
        assert_eq!(rejected.failure, Some(FailureReason::ReviewRejected));
    }

    #[test]
    fn state_display() {
        assert_eq!(State::Planning.to_string(), "PLANNING");
        assert_eq!(State::FeExec.to_string(), "FE_EXEC");
        assert_eq!(State::AwaitingReview.to_string(), "AWAITING_REVIEW");
        assert_eq!(
            serde_json::to_string(&State::BeExec).unwrap(),
            r#""BE_EXEC""#
        );
    }

    #[test]
    fn agent_names_roundtrip() {
        for agent in AgentKind::ALL {
            assert_eq!(AgentKind::from_name(agent.as_str()), Some(agent));
        }
        assert_eq!(AgentKind::from_name("shell"), None);
    }
}
