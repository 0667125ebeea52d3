use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::guardrails::extract_json;
use crate::state_machine::{AgentKind, AgentState, State, ValidationReport};

/// Where the orchestrator goes next, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub next: State,
    pub reason: String,
}

impl RouteDecision {
    pub fn new(next: State, reason: impl Into<String>) -> Self {
        Self {
            next,
            reason: reason.into(),
        }
    }
}

/// Who produced a routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    Oracle,
    Static,
    Validator,
    Review,
}

/// A routing decision as kept in the job's decision log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRecord {
    #[serde(flatten)]
    pub decision: RouteDecision,
    pub source: RouteSource,
    pub at: DateTime<Utc>,
}

impl RouteRecord {
    fn new(decision: RouteDecision, source: RouteSource) -> Self {
        Self {
            decision,
            source,
            at: Utc::now(),
        }
    }

    pub fn oracle(decision: RouteDecision) -> Self {
        Self::new(decision, RouteSource::Oracle)
    }

    pub fn fallback(decision: RouteDecision) -> Self {
        Self::new(decision, RouteSource::Static)
    }

    pub fn validator(decision: RouteDecision) -> Self {
        Self::new(decision, RouteSource::Validator)
    }

    pub fn review(decision: RouteDecision) -> Self {
        Self::new(decision, RouteSource::Review)
    }
}

/// Deterministic next-state table used whenever the oracle is off or unusable.
pub struct StaticRouter;

impl StaticRouter {
    /// Next state after `completed` finished successfully.
    ///
    /// Follows the default sequence, but never jumps into a state whose
    /// inputs are missing; in that case the earliest missing producer runs.
    pub fn next_after(completed: State, state: &AgentState) -> RouteDecision {
        let Some(next) = completed.default_next() else {
            return RouteDecision::new(State::Done, format!("{completed} has no successor"));
        };
        if state.has_prerequisites_for(next) {
            return RouteDecision::new(next, format!("{completed} complete"));
        }
        let missing = Self::earliest_missing(state);
        RouteDecision::new(missing, format!("{next} is missing inputs, running {missing}"))
    }

    /// Route a finished validation: pass ends the job, failure re-enters the
    /// responsible agent (frontend when the validator named none).
    pub fn after_validation(report: &ValidationReport) -> RouteDecision {
        if report.passed {
            return RouteDecision::new(State::Done, "validation passed");
        }
        let target = report.target.unwrap_or(AgentKind::FeExecutor);
        let next = target.state().unwrap_or(State::FeExec);
        RouteDecision::new(next, format!("validation failed, re-running {target}"))
    }

    fn earliest_missing(state: &AgentState) -> State {
        if state.spec.is_none() {
            State::Planning
        } else if state.fe_code.is_empty() {
            State::FeExec
        } else if state.be_code.is_empty() {
            State::BeExec
        } else {
            State::Validating
        }
    }
}

/// Classification returned by the routing oracle.
#[derive(Debug, Deserialize)]
struct OracleReply {
    next_agent: String,
    #[serde(default)]
    reason: String,
}

/// Parse and vet an oracle reply against the job's progress.
///
/// Only pipeline agents are acceptable answers, and only when their inputs
/// already exist. Anything else is an error and the caller falls back to
/// [`StaticRouter`].
pub fn parse_oracle_reply(raw: &str, state: &AgentState) -> Result<RouteDecision, String> {
    let reply: OracleReply = serde_json::from_str(extract_json(raw))
        .map_err(|e| format!("malformed oracle reply: {e}"))?;

    let agent = AgentKind::from_name(reply.next_agent.trim())
        .ok_or_else(|| format!("unknown agent '{}'", reply.next_agent))?;
    let next = agent
        .state()
        .ok_or_else(|| format!("'{agent}' cannot be routed to"))?;
    if !state.has_prerequisites_for(next) {
        return Err(format!("{next} is not reachable yet"));
    }

    let reason = if reply.reason.trim().is_empty() {
        format!("oracle chose {agent}")
    } else {
        reply.reason
    };
    Ok(RouteDecision::new(next, reason))
}

/// Picks the model for a call by walking the configured chain.
///
/// Attempt 0 uses the first model; each retry of the same agent moves one
/// step up, staying on the last model once the chain is exhausted.
#[derive(Debug, Clone)]
pub struct ModelSelector {
    chain: Vec<String>,
    override_model: Option<String>,
}

impl ModelSelector {
    pub fn new(chain: Vec<String>, override_model: Option<String>) -> Self {
        Self {
            chain,
            override_model,
        }
    }

    pub fn select(&self, attempt: u32) -> &str {
        if let Some(model) = &self.override_model {
            return model;
        }
        let idx = (attempt as usize).min(self.chain.len().saturating_sub(1));
        self.chain.get(idx).map(String::as_str).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::ProjectSpec;

    fn planned() -> AgentState {
        let mut state = AgentState::new("todo app", "alice");
        state.spec = Some(ProjectSpec::default());
        state
    }

    // --- StaticRouter ---

    #[test]
    fn static_sequence_follows_pipeline() {
        let mut state = planned();
        assert_eq!(StaticRouter::next_after(State::Planning, &state).next, State::FeExec);
        state.fe_code.insert("index.tsx".into(), "x".into());
        assert_eq!(StaticRouter::next_after(State::FeExec, &state).next, State::BeExec);
        state.be_code.insert("main.py".into(), "x".into());
        assert_eq!(StaticRouter::next_after(State::BeExec, &state).next, State::Validating);
    }

    #[test]
    fn static_sequence_backfills_missing_inputs() {
        // Backend finished but the frontend was never produced.
        let mut state = planned();
        state.be_code.insert("main.py".into(), "x".into());
        let decision = StaticRouter::next_after(State::BeExec, &state);
        assert_eq!(decision.next, State::FeExec);
    }

    #[test]
    fn validation_routes_to_target_or_done() {
        let pass = ValidationReport {
            passed: true,
            report: String::new(),
            target: None,
        };
        assert_eq!(StaticRouter::after_validation(&pass).next, State::Done);

        let be = ValidationReport {
            passed: false,
            report: "missing endpoint".into(),
            target: Some(AgentKind::BeExecutor),
        };
        assert_eq!(StaticRouter::after_validation(&be).next, State::BeExec);

        let untargeted = ValidationReport {
            passed: false,
            report: "broken".into(),
            target: None,
        };
        assert_eq!(StaticRouter::after_validation(&untargeted).next, State::FeExec);
    }

    // --- oracle replies ---

    #[test]
    fn oracle_reply_accepts_reachable_agent() {
        let state = planned();
        let decision =
            parse_oracle_reply(r#"{"next_agent": "be_executor", "reason": "backend first"}"#, &state)
                .unwrap();
        assert_eq!(decision.next, State::BeExec);
        assert_eq!(decision.reason, "backend first");
    }

    #[test]
    fn oracle_reply_in_code_fence() {
        let state = planned();
        let raw = "```json\n{\"next_agent\": \"fe_executor\"}\n```";
        let decision = parse_oracle_reply(raw, &state).unwrap();
        assert_eq!(decision.next, State::FeExec);
        assert!(decision.reason.contains("fe_executor"));
    }

    #[test]
    fn oracle_reply_rejections() {
        let fresh = AgentState::new("todo app", "alice");
        for raw in [
            "not json",
            r#"{"next_agent": "done"}"#,
            r#"{"next_agent": "router"}"#,
            r#"{"next_agent": "shell"}"#,
            // no spec yet
            r#"{"next_agent": "validator"}"#,
            r#"{"next_agent": "fe_executor"}"#,
        ] {
            assert!(parse_oracle_reply(raw, &fresh).is_err(), "{raw} accepted");
        }
    }

    // --- ModelSelector ---

    #[test]
    fn selector_escalates_with_attempts() {
        let selector = ModelSelector::new(
            vec!["claude-haiku-4-5".into(), "claude-sonnet-4-5".into(), "claude-opus-4-1".into()],
            None,
        );
        assert_eq!(selector.select(0), "claude-haiku-4-5");
        assert_eq!(selector.select(1), "claude-sonnet-4-5");
        assert_eq!(selector.select(2), "claude-opus-4-1");
        assert_eq!(selector.select(7), "claude-opus-4-1");
    }

    #[test]
    fn selector_override_wins() {
        let selector = ModelSelector::new(vec!["claude-haiku-4-5".into()], Some("claude-opus-4-1".into()));
        assert_eq!(selector.select(0), "claude-opus-4-1");
        assert_eq!(selector.select(3), "claude-opus-4-1");
    }

    #[test]
    fn route_record_serializes_flat() {
        let record = RouteRecord::oracle(RouteDecision::new(State::BeExec, "why not"));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["next"], "BE_EXEC");
        assert_eq!(json["source"], "oracle");
    }
}
