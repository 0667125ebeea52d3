//! The uniform call contract around one agent.
//!
//! An invocation runs, in order: the per-user token rate check, the pre-call
//! guardrail stages, the provider call under a timeout, the post-call stages,
//! and finally the ledger update. Only when all of those succeed is the
//! parsed output applied to the [`AgentState`]. Every call, successful or not,
//! leaves a [`CallTrace`] in the state's audit trail.

use std::time::{Duration, Instant};

use chrono::Utc;

use crate::anthropic::{Message, MessageSender, MessagesRequest};
use crate::error::{AgentError, Disposition};
use crate::guardrails::{AgentOutput, GuardrailVerdict, Guardrails, Inspection};
use crate::ledger::{CallUsage, LedgerEntry, PricingTable};
use crate::prompts::{self, ContextRetriever, NoContext, Prompts};
use crate::rate_limiter::{RateLimitResult, RateLimiter};
use crate::router::{ModelSelector, RouteDecision, parse_oracle_reply};
use crate::state_machine::{AgentKind, AgentState, JobLimits, State, StateMachine};
use crate::telemetry::{self, CallTrace};

const CONTEXT_SNIPPETS: usize = 3;
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;

/// Shared collaborators handed to every call. Nothing here is global.
#[derive(Clone, Copy)]
pub struct CallContext<'a> {
    pub limiter: &'a RateLimiter,
    pub guardrails: &'a Guardrails,
    pub pricing: &'a PricingTable,
    pub limits: &'a JobLimits,
}

/// A provider call that came back, before its output is trusted.
struct RawCall {
    text: String,
    usage: CallUsage,
    latency: Duration,
    verdicts: Vec<GuardrailVerdict>,
}

pub struct AgentInvoker<C> {
    client: C,
    prompts: Prompts,
    selector: ModelSelector,
    retriever: Box<dyn ContextRetriever>,
    call_timeout: Duration,
    max_output_tokens: u32,
}

impl<C: MessageSender> AgentInvoker<C> {
    pub fn new(client: C, prompts: Prompts, selector: ModelSelector) -> Self {
        Self {
            client,
            prompts,
            selector,
            retriever: Box::new(NoContext),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = max;
        self
    }

    pub fn with_retriever(mut self, retriever: Box<dyn ContextRetriever>) -> Self {
        self.retriever = retriever;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Run `agent` once against `state`.
    ///
    /// A risky-pattern suspension is returned as an error, but its output
    /// has already been applied and billed; the job only waits for review.
    /// Every other error counts once in `agent_errors_total`.
    pub async fn invoke(
        &self,
        agent: AgentKind,
        state: &mut AgentState,
        ctx: &CallContext<'_>,
    ) -> Result<LedgerEntry, AgentError> {
        let result = self.attempt(agent, state, ctx).await;
        if let Err(err) = &result
            && err.disposition() != Disposition::Suspend
        {
            count_error(agent);
        }
        result
    }

    async fn attempt(
        &self,
        agent: AgentKind,
        state: &mut AgentState,
        ctx: &CallContext<'_>,
    ) -> Result<LedgerEntry, AgentError> {
        let raw = self.call(agent, state, ctx).await?;
        let mut verdicts = raw.verdicts.clone();

        let mut inspection = Inspection::after_call(agent, &raw.text);
        let report = ctx.guardrails.run(&mut inspection);
        verdicts.extend(report.verdicts.iter().cloned());
        record_warnings(state, report.warnings());

        let mut suspended = None;
        if let Some(blocking) = report.blocking() {
            let err = AgentError::from_verdict(agent, blocking);
            if err.disposition() != Disposition::Suspend {
                self.trace(state, agent, &raw, 0.0, verdicts, err.code());
                return Err(err);
            }
            suspended = Some(err);
        }

        let entry = match state
            .ledger
            .record(agent, &raw.usage, ctx.pricing, ctx.limits.job_token_budget)
        {
            Ok(entry) => entry,
            Err(e) => {
                let err = AgentError::BudgetExceeded(e.to_string());
                self.trace(state, agent, &raw, 0.0, verdicts, err.code());
                return Err(err);
            }
        };
        metrics::counter!(telemetry::TOKENS_USED_TOTAL, "agent" => agent.as_str()).increment(entry.tokens);

        match inspection.parsed.take() {
            Some(AgentOutput::Plan(spec)) => state.spec = Some(spec),
            Some(AgentOutput::Frontend(files)) => state.fe_code = files,
            Some(AgentOutput::Backend(files)) => state.be_code = files,
            Some(AgentOutput::Validation(report)) => state.validation = Some(report),
            None => {}
        }

        let outcome = suspended.as_ref().map(AgentError::code).unwrap_or("ok");
        self.trace(state, agent, &raw, entry.cost_usd, verdicts, outcome);
        tracing::info!(
            job_id = %state.job.id,
            agent = %agent,
            tokens = entry.tokens,
            job_total = entry.job_total_tokens,
            cost_usd = entry.cost_usd,
            "agent call complete"
        );

        match suspended {
            Some(err) => Err(err),
            None => Ok(entry),
        }
    }

    /// Ask the routing oracle where to go after `completed`.
    ///
    /// Returns `None` whenever the answer cannot be used; callers fall back
    /// to the static sequence.
    pub async fn consult_oracle(
        &self,
        completed: State,
        state: &mut AgentState,
        ctx: &CallContext<'_>,
    ) -> Option<RouteDecision> {
        let agent = AgentKind::Router;
        if let Err((reason, detail)) = StateMachine::gate(state, agent, ctx.limits) {
            tracing::debug!(job_id = %state.job.id, %reason, detail, "oracle skipped");
            return None;
        }

        let raw = match self.call(agent, state, ctx).await {
            Ok(raw) => raw,
            Err(e) => {
                count_error(agent);
                tracing::warn!(job_id = %state.job.id, error = %e, "oracle unavailable, using static routing");
                return None;
            }
        };

        let decision = match parse_oracle_reply(&raw.text, state) {
            Ok(d) if d.next != completed => d,
            Ok(d) => {
                count_error(agent);
                tracing::warn!(job_id = %state.job.id, next = %d.next, "oracle repeated the finished state");
                self.trace(state, agent, &raw, 0.0, raw.verdicts.clone(), "oracle_rejected");
                return None;
            }
            Err(e) => {
                count_error(agent);
                tracing::warn!(job_id = %state.job.id, error = %e, "oracle reply rejected");
                self.trace(state, agent, &raw, 0.0, raw.verdicts.clone(), "oracle_rejected");
                return None;
            }
        };

        match state
            .ledger
            .record(agent, &raw.usage, ctx.pricing, ctx.limits.job_token_budget)
        {
            Ok(entry) => {
                self.trace(state, agent, &raw, entry.cost_usd, raw.verdicts.clone(), "ok");
                Some(decision)
            }
            Err(e) => {
                count_error(agent);
                tracing::warn!(job_id = %state.job.id, error = %e, "oracle tokens exceed budget");
                self.trace(state, agent, &raw, 0.0, raw.verdicts.clone(), "budget_exceeded");
                None
            }
        }
    }

    async fn call(
        &self,
        agent: AgentKind,
        state: &mut AgentState,
        ctx: &CallContext<'_>,
    ) -> Result<RawCall, AgentError> {
        let user_id = state.job.user_id.clone();
        if let RateLimitResult::Limited {
            retry_after,
            limit_type,
        } = ctx.limiter.check_tokens(&user_id)
        {
            return Err(AgentError::RateLimited {
                limit: limit_type,
                retry_after,
            });
        }

        if !state.request_sanitized {
            let cleaned = ctx.guardrails.sanitizer().sanitize(&state.job.request);
            if cleaned.was_modified() {
                record_warnings(
                    state,
                    vec![format!(
                        "[input_sanitization] injection_detected in request: {}",
                        cleaned.hits.join(" | ")
                    )],
                );
                state.job.request = cleaned.text;
            }
            state.request_sanitized = true;
        }

        let system = self.prompts.system(agent);
        let context = if agent == AgentKind::Planner {
            self.retriever.retrieve(&state.job.request, CONTEXT_SNIPPETS)
        } else {
            Vec::new()
        };
        let mut inspection =
            Inspection::before_call(agent, system, prompts::agent_inputs(agent, state, &context));
        let report = ctx.guardrails.run(&mut inspection);
        record_warnings(state, report.warnings());
        if let Some(blocking) = report.blocking() {
            return Err(AgentError::from_verdict(agent, blocking));
        }

        let model = self.selector.select(state.retry_count(agent)).to_string();
        let request = MessagesRequest {
            model: model.clone(),
            max_tokens: self.max_tokens_for(agent, state, ctx.limits),
            system: Some(system.to_string()),
            messages: vec![Message::user(prompts::render_user_message(agent, &inspection.inputs))],
        };

        metrics::counter!(telemetry::AGENT_CALLS_TOTAL, "agent" => agent.as_str()).increment(1);
        tracing::debug!(job_id = %state.job.id, agent = %agent, model = %model, "calling model");
        let started = Instant::now();
        let result = tokio::time::timeout(self.call_timeout, self.client.send_message(&request)).await;
        let latency = started.elapsed();
        metrics::histogram!(telemetry::AGENT_LATENCY_SECONDS, "agent" => agent.as_str())
            .record(latency.as_secs_f64());

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let err = AgentError::Upstream(e);
                self.trace_failure(state, agent, &model, latency, report.verdicts, err.code());
                return Err(err);
            }
            Err(_) => {
                let err = AgentError::Timeout {
                    agent,
                    after: self.call_timeout,
                };
                self.trace_failure(state, agent, &model, latency, report.verdicts, err.code());
                return Err(err);
            }
        };

        let usage = CallUsage::new(
            model,
            u64::from(response.usage.input_tokens),
            u64::from(response.usage.output_tokens),
        );
        ctx.limiter.record_tokens(&user_id, usage.total());

        Ok(RawCall {
            text: response.text(),
            usage,
            latency,
            verdicts: report.verdicts,
        })
    }

    /// Output allowance, clamped to what is left of the job budget and the
    /// agent's cap.
    fn max_tokens_for(&self, agent: AgentKind, state: &AgentState, limits: &JobLimits) -> u32 {
        let job_left = limits
            .job_token_budget
            .saturating_sub(state.ledger.total_tokens());
        let agent_left = limits
            .caps
            .cap_for(agent)
            .saturating_sub(state.ledger.agent_tokens(agent));
        let headroom = job_left.min(agent_left).min(u64::from(self.max_output_tokens));
        u32::try_from(headroom).unwrap_or(self.max_output_tokens).max(1)
    }

    fn trace(
        &self,
        state: &mut AgentState,
        agent: AgentKind,
        raw: &RawCall,
        cost_usd: f64,
        verdicts: Vec<GuardrailVerdict>,
        outcome: &str,
    ) {
        let trace = CallTrace {
            job_id: state.job.id.clone(),
            user_id: state.job.user_id.clone(),
            agent,
            model: raw.usage.model.clone(),
            input_tokens: raw.usage.input_tokens,
            output_tokens: raw.usage.output_tokens,
            cost_usd,
            latency_ms: duration_ms(raw.latency),
            verdicts,
            outcome: outcome.to_string(),
            at: Utc::now(),
        };
        trace.emit();
        state.audit.push(trace);
    }

    fn trace_failure(
        &self,
        state: &mut AgentState,
        agent: AgentKind,
        model: &str,
        latency: Duration,
        verdicts: Vec<GuardrailVerdict>,
        outcome: &str,
    ) {
        let raw = RawCall {
            text: String::new(),
            usage: CallUsage::new(model, 0, 0),
            latency,
            verdicts: Vec::new(),
        };
        self.trace(state, agent, &raw, 0.0, verdicts, outcome);
    }
}

fn count_error(agent: AgentKind) {
    metrics::counter!(telemetry::AGENT_ERRORS_TOTAL, "agent" => agent.as_str()).increment(1);
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn record_warnings(state: &mut AgentState, warnings: Vec<String>) {
    for warning in warnings {
        if !state.security_warnings.contains(&warning) {
            tracing::warn!(job_id = %state.job.id, warning = %warning, "security warning");
            state.security_warnings.push(warning);
        }
    }
}
