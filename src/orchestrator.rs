use std::time::Duration;

use tokio::time::sleep;

use crate::anthropic::MessageSender;
use crate::error::{AgentError, Disposition};
use crate::invoker::{AgentInvoker, CallContext};
use crate::router::{RouteDecision, RouteRecord, StaticRouter};
use crate::state_machine::{
    AgentKind, AgentState, FailureReason, JobStatus, PendingReview, RetryPolicy, State,
    StateMachine,
};
use crate::telemetry;

/// What one orchestration step left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The job moved and another step is due.
    Continue,
    /// The job is parked until a review decision arrives.
    Suspended,
    /// DONE or FAILED.
    Finished(State),
}

/// Drives an [`AgentState`] through the state machine one agent at a time.
pub struct Orchestrator<'a, C> {
    invoker: &'a AgentInvoker<C>,
    ctx: CallContext<'a>,
    retry: RetryPolicy,
    rate_limit_wait: Duration,
    model_routing: bool,
}

impl<'a, C: MessageSender> Orchestrator<'a, C> {
    pub fn new(invoker: &'a AgentInvoker<C>, ctx: CallContext<'a>) -> Self {
        Self {
            invoker,
            ctx,
            retry: RetryPolicy { base_delay_ms: 0 },
            rate_limit_wait: Duration::from_secs(60),
            model_routing: false,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Longest a rate-limited retry waits for its window to roll over.
    pub fn with_rate_limit_wait(mut self, wait: Duration) -> Self {
        self.rate_limit_wait = wait;
        self
    }

    /// Consult the routing oracle after each successful step.
    pub fn with_model_routing(mut self, enabled: bool) -> Self {
        self.model_routing = enabled;
        self
    }

    pub fn context(&self) -> CallContext<'a> {
        self.ctx
    }

    /// Transitions allowed before a job is declared stuck. Retries and
    /// validator re-routes are already capped per agent; this bounds the
    /// product of the two.
    fn step_limit(&self) -> usize {
        8 * (self.ctx.limits.max_retries as usize + 1) + 8
    }

    /// Run until the job finishes or parks, calling `on_step` after each step.
    pub async fn run(
        &self,
        state: &mut AgentState,
        mut on_step: impl FnMut(&AgentState),
    ) -> StepOutcome {
        loop {
            let outcome = self.step(state).await;
            on_step(state);
            if outcome != StepOutcome::Continue {
                return outcome;
            }
        }
    }

    /// Advance the job by at most one agent invocation.
    pub async fn step(&self, state: &mut AgentState) -> StepOutcome {
        let current = state.current_state();
        if current.is_terminal() {
            return StepOutcome::Finished(current);
        }

        // A parked job spends no budget, so the review decision is applied
        // before the step limit is enforced.
        if current == State::AwaitingReview {
            return self.resume_from_review(state);
        }

        if state.history.len() >= self.step_limit() {
            StateMachine::fail(
                state,
                FailureReason::StepLimit,
                format!("no terminal state after {} transitions", state.history.len()),
            );
            return self.finish(state);
        }

        let Some(agent) = current.agent() else {
            return StepOutcome::Finished(current);
        };

        if let Err((reason, detail)) = StateMachine::gate(state, agent, self.ctx.limits) {
            tracing::warn!(job_id = %state.job.id, agent = %agent, %reason, detail, "gate refused invocation");
            StateMachine::fail(state, reason, detail);
            return self.finish(state);
        }

        state.job.status = JobStatus::Running;
        tracing::info!(job_id = %state.job.id, state = %current, agent = %agent, "invoking agent");

        match self.invoker.invoke(agent, state, &self.ctx).await {
            Ok(_) => {
                let decision = self.route_after(current, state).await;
                StateMachine::advance(state, decision.next, decision.reason);
            }
            Err(err) => match err.disposition() {
                Disposition::Retry => self.schedule_retry(state, agent, &err).await,
                Disposition::Fatal => {
                    let reason = err.failure_reason().unwrap_or(FailureReason::RetryExhausted);
                    tracing::error!(job_id = %state.job.id, agent = %agent, error = %err, "fatal agent failure");
                    StateMachine::fail(state, reason, err.to_string());
                }
                Disposition::Suspend => {
                    let findings = match &err {
                        AgentError::RiskyPatternFound { findings, .. } => findings.clone(),
                        other => vec![other.to_string()],
                    };
                    let resume = self.route_after(current, state).await;
                    state.pending_review = Some(PendingReview::new(agent, findings, resume.next));
                    StateMachine::advance(state, State::AwaitingReview, err.to_string());
                    tracing::warn!(job_id = %state.job.id, agent = %agent, resume_to = %resume.next, "job parked for review");
                    return StepOutcome::Suspended;
                }
            },
        }

        let next = state.current_state();
        if next.is_terminal() {
            self.finish(state)
        } else {
            StepOutcome::Continue
        }
    }

    async fn schedule_retry(&self, state: &mut AgentState, agent: AgentKind, err: &AgentError) {
        let attempt = StateMachine::retry(state, agent, err.code());
        metrics::counter!(telemetry::AGENT_RETRIES_TOTAL, "agent" => agent.as_str()).increment(1);
        let delay = self.retry_delay(attempt, err);
        tracing::warn!(
            job_id = %state.job.id,
            agent = %agent,
            attempt,
            max = self.ctx.limits.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying agent"
        );
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }

    /// Backoff for `attempt`, stretched to the limiter window when the call
    /// was refused for rate, but never past `rate_limit_wait`.
    fn retry_delay(&self, attempt: u32, err: &AgentError) -> Duration {
        let backoff = Duration::from_millis(self.retry.delay_for_attempt(attempt));
        match err {
            AgentError::RateLimited { retry_after, .. } => {
                backoff.max(*retry_after).min(self.rate_limit_wait.max(backoff))
            }
            _ => backoff,
        }
    }

    fn resume_from_review(&self, state: &mut AgentState) -> StepOutcome {
        let decision = state
            .pending_review
            .as_ref()
            .and_then(|pending| pending.decision.clone());
        let Some(decision) = decision else {
            return StepOutcome::Suspended;
        };
        tracing::info!(
            job_id = %state.job.id,
            approved = decision.approved,
            reviewer = %decision.reviewer,
            "applying review decision"
        );
        StateMachine::resolve_review(state, decision);
        if state.current_state().is_terminal() {
            self.finish(state)
        } else {
            StepOutcome::Continue
        }
    }

    /// Decide the successor of a successful `completed` step and log it.
    async fn route_after(&self, completed: State, state: &mut AgentState) -> RouteDecision {
        if completed == State::Validating {
            let decision = match &state.validation {
                Some(report) => StaticRouter::after_validation(report),
                None => RouteDecision::new(State::Validating, "no validation report"),
            };
            if let Some(target) = decision.next.agent()
                && decision.next != State::Validating
            {
                let count = state.bump_retry(target);
                metrics::counter!(telemetry::AGENT_RETRIES_TOTAL, "agent" => target.as_str()).increment(1);
                tracing::info!(job_id = %state.job.id, target = %target, retry = count, "validation failed, re-routing");
            }
            state.decisions.push(RouteRecord::validator(decision.clone()));
            return decision;
        }

        if self.model_routing
            && let Some(decision) = self.invoker.consult_oracle(completed, state, &self.ctx).await
        {
            state.decisions.push(RouteRecord::oracle(decision.clone()));
            return decision;
        }

        let decision = StaticRouter::next_after(completed, state);
        state.decisions.push(RouteRecord::fallback(decision.clone()));
        decision
    }

    fn finish(&self, state: &AgentState) -> StepOutcome {
        let end = state.current_state();
        let cost = state.ledger.total_cost_usd();
        metrics::histogram!(telemetry::COST_PER_PROJECT_USD).record(cost);
        match end {
            State::Done => tracing::info!(
                job_id = %state.job.id,
                tokens = state.ledger.total_tokens(),
                cost_usd = cost,
                "job done"
            ),
            _ => tracing::warn!(
                job_id = %state.job.id,
                reason = state.failure.map(|r| r.as_str()).unwrap_or("unknown"),
                detail = state.failure_detail.as_deref().unwrap_or(""),
                "job failed"
            ),
        }
        StepOutcome::Finished(end)
    }
}
