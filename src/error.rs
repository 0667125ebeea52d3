use std::time::Duration;

use thiserror::Error;

use crate::anthropic::AnthropicError;
use crate::artifacts::ArtifactError;
use crate::guardrails::{GuardrailSetupError, GuardrailVerdict, StageId, Verdict};
use crate::queue::QueueError;
use crate::rate_limiter::LimitType;
use crate::state_machine::{AgentKind, FailureReason};

#[derive(Debug, Error)]
pub enum ForjaError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Anthropic API error: {0}")]
    Anthropic(#[from] AnthropicError),

    #[error("Guardrail setup error: {0}")]
    Guardrails(#[from] GuardrailSetupError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// How the orchestrator reacts to a failed agent call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Count a retry against the agent and re-enter the same state.
    Retry,
    /// Fail the job now.
    Fatal,
    /// Park the job until a reviewer decides.
    Suspend,
}

/// Why one agent invocation did not produce usable output.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("system prompt for {agent} was tampered with")]
    TamperDetected { agent: AgentKind },

    #[error("{agent} output rejected: {detail}")]
    SchemaInvalid { agent: AgentKind, detail: String },

    #[error("tool not allowed: {0}")]
    ToolNotAllowed(String),

    #[error("path traversal blocked: {0}")]
    PathTraversal(String),

    #[error("{agent} produced risky code: {}", .findings.join("; "))]
    RiskyPatternFound {
        agent: AgentKind,
        findings: Vec<String>,
    },

    #[error("{limit} limit reached, retry after {}s", .retry_after.as_secs())]
    RateLimited {
        limit: LimitType,
        retry_after: Duration,
    },

    #[error("token budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("retries exhausted: {0}")]
    RetryExhausted(String),

    #[error("upstream error: {0}")]
    Upstream(#[from] AnthropicError),

    #[error("{agent} call timed out after {}s", .after.as_secs())]
    Timeout { agent: AgentKind, after: Duration },
}

impl AgentError {
    pub fn disposition(&self) -> Disposition {
        match self {
            AgentError::TamperDetected { .. }
            | AgentError::ToolNotAllowed(_)
            | AgentError::PathTraversal(_)
            | AgentError::BudgetExceeded(_)
            | AgentError::RetryExhausted(_) => Disposition::Fatal,
            AgentError::SchemaInvalid { .. }
            | AgentError::RateLimited { .. }
            | AgentError::Upstream(_)
            | AgentError::Timeout { .. } => Disposition::Retry,
            AgentError::RiskyPatternFound { .. } => Disposition::Suspend,
        }
    }

    /// Short machine-readable code for traces and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::TamperDetected { .. } => "tamper_detected",
            AgentError::SchemaInvalid { .. } => "schema_invalid",
            AgentError::ToolNotAllowed(_) => "tool_not_allowed",
            AgentError::PathTraversal(_) => "path_traversal",
            AgentError::RiskyPatternFound { .. } => "risky_pattern_found",
            AgentError::RateLimited { .. } => "rate_limited",
            AgentError::BudgetExceeded(_) => "budget_exceeded",
            AgentError::RetryExhausted(_) => "retry_exhausted",
            AgentError::Upstream(e) => e.code(),
            AgentError::Timeout { .. } => "timeout",
        }
    }

    /// Terminal reason recorded when this error fails the job.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            AgentError::TamperDetected { .. } => Some(FailureReason::TamperDetected),
            AgentError::ToolNotAllowed(_) => Some(FailureReason::ToolNotAllowed),
            AgentError::PathTraversal(_) => Some(FailureReason::PathTraversal),
            AgentError::BudgetExceeded(_) => Some(FailureReason::BudgetExceeded),
            AgentError::RetryExhausted(_) => Some(FailureReason::RetryExhausted),
            _ => None,
        }
    }

    /// Map the verdict that stopped a pipeline run on `agent`'s call.
    pub fn from_verdict(agent: AgentKind, verdict: &GuardrailVerdict) -> Self {
        let reason = verdict.reason.clone().unwrap_or_default();
        match (verdict.stage, verdict.verdict) {
            (StageId::PromptIntegrity, _) => AgentError::TamperDetected { agent },
            (StageId::ToolAllowlist, _) => AgentError::ToolNotAllowed(reason),
            (StageId::PathSandbox, _) => AgentError::PathTraversal(reason),
            (StageId::RiskScan, _) => AgentError::RiskyPatternFound {
                agent,
                findings: reason.split("; ").map(str::to_string).collect(),
            },
            (_, Verdict::Fatal) => AgentError::TamperDetected { agent },
            _ => AgentError::SchemaInvalid { agent, detail: reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(stage: StageId, verdict: Verdict, reason: &str) -> GuardrailVerdict {
        GuardrailVerdict {
            stage,
            verdict,
            reason: Some(reason.into()),
            offending: None,
        }
    }

    #[test]
    fn verdicts_map_to_taxonomy() {
        let cases = [
            (StageId::PromptIntegrity, Verdict::Fatal, "tamper_detected", Disposition::Fatal),
            (StageId::OutputSchema, Verdict::Retry, "schema_invalid", Disposition::Retry),
            (StageId::ToolAllowlist, Verdict::Fatal, "tool_not_allowed", Disposition::Fatal),
            (StageId::PathSandbox, Verdict::Fatal, "path_traversal", Disposition::Fatal),
            (StageId::RiskScan, Verdict::Suspend, "risky_pattern_found", Disposition::Suspend),
        ];
        for (stage, v, code, disposition) in cases {
            let err = AgentError::from_verdict(AgentKind::BeExecutor, &verdict(stage, v, "x"));
            assert_eq!(err.code(), code);
            assert_eq!(err.disposition(), disposition);
        }
    }

    #[test]
    fn risk_findings_are_split() {
        let err = AgentError::from_verdict(
            AgentKind::BeExecutor,
            &verdict(StageId::RiskScan, Verdict::Suspend, "a in x.py; b in y.py"),
        );
        match err {
            AgentError::RiskyPatternFound { findings, .. } => assert_eq!(findings.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn retryable_errors_carry_no_failure_reason() {
        let timeout = AgentError::Timeout {
            agent: AgentKind::Planner,
            after: Duration::from_secs(60),
        };
        assert_eq!(timeout.disposition(), Disposition::Retry);
        assert!(timeout.failure_reason().is_none());
        assert_eq!(timeout.to_string(), "planner call timed out after 60s");

        let upstream = AgentError::from(AnthropicError::EmptyResponse);
        assert_eq!(upstream.disposition(), Disposition::Retry);
        assert_eq!(upstream.code(), "upstream_empty");
    }

    #[test]
    fn budget_is_fatal_with_reason() {
        let err = AgentError::BudgetExceeded("job at 200000".into());
        assert_eq!(err.disposition(), Disposition::Fatal);
        assert_eq!(err.failure_reason(), Some(FailureReason::BudgetExceeded));
    }
}
