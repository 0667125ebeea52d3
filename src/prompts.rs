//! System prompts and message builders for each agent.
//!
//! Prompt wording is deliberately plain; the orchestration around it is what
//! this crate cares about. The [`Prompts`] in use by an invoker are checked
//! against the fingerprints taken from [`Prompts::default`] at startup.

use std::collections::BTreeMap;

use crate::state_machine::{AgentKind, AgentState};

const ROUTER_SYSTEM: &str = "You are the orchestrator of a multi-agent code generation system. \
Decide which agent runs next: planner, fe_executor, be_executor or validator. \
Start with planner when there is no spec. Run both executors before validator. \
Respond with ONLY a JSON object: {\"next_agent\": \"<agent>\", \"reason\": \"<short reason>\"}";

const PLANNER_SYSTEM: &str = "You are the Planner agent. Turn the user's request into a project \
specification. Respond with ONLY a JSON object: {\"spec\": \"<markdown spec>\", \"pages\": [..], \
\"endpoints\": [..], \"data_models\": [..]}";

const FE_SYSTEM: &str = "You are the Frontend Executor agent. Generate the frontend pages and \
components described by the spec. Respond with ONLY a JSON object mapping relative file paths \
to file contents.";

const BE_SYSTEM: &str = "You are the Backend Executor agent. Generate the backend endpoints and \
data models described by the spec. Respond with ONLY a JSON object mapping relative file paths \
to file contents.";

const VALIDATOR_SYSTEM: &str = "You are the Validator agent. Check the generated frontend and \
backend code against the spec. Respond with ONLY a JSON object: {\"passed\": bool, \"report\": \
\"<markdown>\", \"target\": \"\"}. On failure set target to planner, fe_executor or be_executor.";

/// System prompts in use, one per agent.
#[derive(Debug, Clone)]
pub struct Prompts {
    system: BTreeMap<AgentKind, String>,
}

impl Default for Prompts {
    fn default() -> Self {
        let system = [
            (AgentKind::Router, ROUTER_SYSTEM),
            (AgentKind::Planner, PLANNER_SYSTEM),
            (AgentKind::FeExecutor, FE_SYSTEM),
            (AgentKind::BeExecutor, BE_SYSTEM),
            (AgentKind::Validator, VALIDATOR_SYSTEM),
        ]
        .into_iter()
        .map(|(agent, text)| (agent, text.to_string()))
        .collect();
        Self { system }
    }
}

impl Prompts {
    pub fn system(&self, agent: AgentKind) -> &str {
        self.system.get(&agent).map(String::as_str).unwrap_or("")
    }

    /// Replace one prompt. The guardrails will reject it unless it matches
    /// the startup fingerprint.
    pub fn with_system(mut self, agent: AgentKind, text: impl Into<String>) -> Self {
        self.system.insert(agent, text.into());
        self
    }
}

/// Opaque similarity search returning ranked snippets of prior work.
pub trait ContextRetriever: Send + Sync {
    fn retrieve(&self, query: &str, k: usize) -> Vec<String>;
}

/// Retriever used when no context store is configured.
pub struct NoContext;

impl ContextRetriever for NoContext {
    fn retrieve(&self, _query: &str, _k: usize) -> Vec<String> {
        Vec::new()
    }
}

/// Untrusted text each agent receives, in the order it is rendered.
///
/// Everything returned here passes through input sanitization.
pub fn agent_inputs(agent: AgentKind, state: &AgentState, context: &[String]) -> Vec<String> {
    let spec_block = state
        .spec
        .as_ref()
        .map(|s| {
            format!(
                "Spec:\n{}\n\nPages: {}\nEndpoints: {}\nData models: {}",
                s.spec,
                s.pages.join(", "),
                s.endpoints.join(", "),
                s.data_models.join(", ")
            )
        })
        .unwrap_or_default();

    match agent {
        AgentKind::Planner => {
            let mut inputs = vec![state.job.request.clone()];
            if !context.is_empty() {
                inputs.push(format!("Similar projects:\n- {}", context.join("\n- ")));
            }
            if let Some(feedback) = validation_feedback(state, agent) {
                inputs.push(feedback);
            }
            inputs
        }
        AgentKind::FeExecutor | AgentKind::BeExecutor => {
            let mut inputs = vec![spec_block];
            if let Some(feedback) = validation_feedback(state, agent) {
                inputs.push(feedback);
            }
            inputs
        }
        AgentKind::Validator => vec![
            spec_block,
            format!("--- Frontend Code ---\n{}", code_block(&state.fe_code)),
            format!("--- Backend Code ---\n{}", code_block(&state.be_code)),
        ],
        AgentKind::Router => vec![format!(
            "Current state:\n- user_request: {}\n- spec exists: {}\n- fe_code files: {}\n- be_code files: {}\n- total_tokens: {}",
            state.job.request,
            state.spec.is_some(),
            state.fe_code.len(),
            state.be_code.len(),
            state.ledger.total_tokens(),
        )],
    }
}

fn validation_feedback(state: &AgentState, agent: AgentKind) -> Option<String> {
    let report = state.validation.as_ref()?;
    (!report.passed && report.target == Some(agent))
        .then(|| format!("Previous validation failed:\n{}", report.report))
}

fn code_block(files: &BTreeMap<String, String>) -> String {
    files
        .iter()
        .map(|(name, code)| format!("### {name}\n```\n{code}\n```"))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Render sanitized inputs into the user message.
pub fn render_user_message(agent: AgentKind, inputs: &[String]) -> String {
    match agent {
        AgentKind::Planner => format!("Request:\n{}", inputs.join("\n\n")),
        AgentKind::Router => format!("{}\n\nWhat agent should run next?", inputs.join("\n")),
        _ => inputs.join("\n\n"),
    }
}
