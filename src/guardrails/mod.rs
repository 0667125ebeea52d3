//! Guardrail pipeline applied around every agent call and artifact write.
//!
//! The pipeline is an ordered chain of six independent stage functions. Each
//! stage looks at the parts of an [`Inspection`] it cares about, may transform
//! them (sanitization rewrites inputs, schema validation fills in the parsed
//! output), and returns a [`GuardrailVerdict`]. Stages with nothing to inspect
//! are skipped. The chain stops at the first verdict that does not pass.
//!
//! | # | Stage               | On failure                         |
//! |---|---------------------|------------------------------------|
//! | 1 | prompt integrity    | fatal (tampering)                  |
//! | 2 | input sanitization  | never fails; inputs are cleaned    |
//! | 3 | output schema       | retryable                          |
//! | 4 | tool allowlist      | fatal                              |
//! | 5 | path sandbox        | fatal                              |
//! | 6 | risk-pattern scan   | suspend for review, or warn        |

mod integrity;
mod risk;
mod sandbox;
mod sanitize;
mod schema;

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use integrity::{PromptRegistry, fingerprint};
pub use risk::{DEFAULT_RISKY_PATTERNS, RiskFinding, RiskScanner};
pub use sandbox::{PathSandbox, SandboxViolation};
pub use sanitize::{DEFAULT_INJECTION_PATTERNS, REDACTED, Sanitized, Sanitizer};
pub use schema::{AgentOutput, extract_json, validate_output};

use crate::artifacts::{artifact_dir, artifact_path};
use crate::prompts::Prompts;
use crate::state_machine::AgentKind;

const MAX_OFFENDING_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    PromptIntegrity,
    InputSanitization,
    OutputSchema,
    ToolAllowlist,
    PathSandbox,
    RiskScan,
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageId::PromptIntegrity => "prompt_integrity",
            StageId::InputSanitization => "input_sanitization",
            StageId::OutputSchema => "output_schema",
            StageId::ToolAllowlist => "tool_allowlist",
            StageId::PathSandbox => "path_sandbox",
            StageId::RiskScan => "risk_scan",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    /// Passed after the stage rewrote its input.
    Sanitized,
    /// Passed with a recorded warning.
    Warn,
    /// Failed; the call may be retried.
    Retry,
    /// Failed; the job must stop.
    Fatal,
    /// Failed pending human review.
    Suspend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailVerdict {
    pub stage: StageId,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offending: Option<String>,
}

impl GuardrailVerdict {
    fn pass(stage: StageId) -> Self {
        Self {
            stage,
            verdict: Verdict::Pass,
            reason: None,
            offending: None,
        }
    }

    fn with(stage: StageId, verdict: Verdict, reason: impl Into<String>, offending: Option<&str>) -> Self {
        Self {
            stage,
            verdict,
            reason: Some(reason.into()),
            offending: offending.map(truncate),
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self.verdict, Verdict::Pass | Verdict::Sanitized | Verdict::Warn)
    }
}

fn truncate(s: &str) -> String {
    if s.len() <= MAX_OFFENDING_LEN {
        return s.to_string();
    }
    let mut end = MAX_OFFENDING_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

/// What a pipeline run looks at. Build one per guarded operation.
#[derive(Debug, Default, Clone)]
pub struct Inspection {
    pub prompt: Option<(AgentKind, String)>,
    pub inputs: Vec<String>,
    pub output: Option<(AgentKind, String)>,
    pub parsed: Option<AgentOutput>,
    pub tools: Vec<String>,
    pub paths: Vec<String>,
    pub code: Vec<(String, String)>,
}

impl Inspection {
    /// Checks run before a provider call.
    pub fn before_call(agent: AgentKind, system_prompt: &str, inputs: Vec<String>) -> Self {
        Self {
            prompt: Some((agent, system_prompt.to_string())),
            inputs,
            ..Self::default()
        }
    }

    /// Checks run on a provider response.
    pub fn after_call(agent: AgentKind, raw: &str) -> Self {
        Self {
            output: Some((agent, raw.to_string())),
            ..Self::default()
        }
    }

    /// Checks run before writing files with `tool`.
    pub fn before_write(tool: &str, paths: Vec<String>) -> Self {
        Self {
            tools: vec![tool.to_string()],
            paths,
            ..Self::default()
        }
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    pub verdicts: Vec<GuardrailVerdict>,
}

impl PipelineReport {
    /// The verdict that stopped the chain, if any.
    pub fn blocking(&self) -> Option<&GuardrailVerdict> {
        self.verdicts.last().filter(|v| !v.passed())
    }

    pub fn warnings(&self) -> Vec<String> {
        self.verdicts
            .iter()
            .filter(|v| matches!(v.verdict, Verdict::Warn | Verdict::Sanitized | Verdict::Suspend))
            .filter_map(|v| v.reason.clone().map(|r| format!("[{}] {r}", v.stage)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct GuardrailSettings {
    pub injection_patterns: Vec<String>,
    pub risky_patterns: Vec<String>,
    pub allowed_tools: Vec<String>,
    pub require_human_review: bool,
    pub output_root: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum GuardrailSetupError {
    #[error("invalid guardrail pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("cannot prepare output root: {0}")]
    OutputRoot(#[from] std::io::Error),
}

type StageFn = fn(&Guardrails, &mut Inspection) -> Option<GuardrailVerdict>;

const STAGES: [StageFn; 6] = [
    prompt_integrity,
    input_sanitization,
    output_schema,
    tool_allowlist,
    path_sandbox,
    risk_scan,
];

pub struct Guardrails {
    prompts: PromptRegistry,
    sanitizer: Sanitizer,
    allowed_tools: HashSet<String>,
    sandbox: PathSandbox,
    risk: RiskScanner,
    require_human_review: bool,
}

impl Guardrails {
    /// Fingerprints every prompt in `prompts` as the trusted baseline.
    pub fn new(settings: &GuardrailSettings, prompts: &Prompts) -> Result<Self, GuardrailSetupError> {
        let mut registry = PromptRegistry::default();
        for agent in AgentKind::ALL {
            registry.register(agent, prompts.system(agent));
        }
        Ok(Self {
            prompts: registry,
            sanitizer: Sanitizer::new(&settings.injection_patterns)?,
            allowed_tools: settings.allowed_tools.iter().cloned().collect(),
            sandbox: PathSandbox::new(&settings.output_root)?,
            risk: RiskScanner::new(&settings.risky_patterns)?,
            require_human_review: settings.require_human_review,
        })
    }

    pub fn sandbox(&self) -> &PathSandbox {
        &self.sandbox
    }

    pub fn sanitizer(&self) -> &Sanitizer {
        &self.sanitizer
    }

    /// Run every applicable stage in order, stopping at the first failure.
    pub fn run(&self, inspection: &mut Inspection) -> PipelineReport {
        let mut report = PipelineReport::default();
        for stage in STAGES {
            let Some(verdict) = stage(self, inspection) else {
                continue;
            };
            let stop = !verdict.passed();
            if stop {
                tracing::warn!(
                    stage = %verdict.stage,
                    verdict = ?verdict.verdict,
                    reason = verdict.reason.as_deref().unwrap_or(""),
                    "guardrail blocked"
                );
            }
            report.verdicts.push(verdict);
            if stop {
                break;
            }
        }
        report
    }
}

fn prompt_integrity(g: &Guardrails, i: &mut Inspection) -> Option<GuardrailVerdict> {
    let (agent, prompt) = i.prompt.as_ref()?;
    Some(match g.prompts.verify(*agent, prompt) {
        Ok(()) => GuardrailVerdict::pass(StageId::PromptIntegrity),
        Err(mismatch) => GuardrailVerdict::with(
            StageId::PromptIntegrity,
            Verdict::Fatal,
            format!("system prompt for {agent} does not match its startup fingerprint"),
            Some(&mismatch.actual),
        ),
    })
}

fn input_sanitization(g: &Guardrails, i: &mut Inspection) -> Option<GuardrailVerdict> {
    if i.inputs.is_empty() {
        return None;
    }
    let mut hits = Vec::new();
    for input in &mut i.inputs {
        let cleaned = g.sanitizer.sanitize(input);
        if cleaned.was_modified() {
            hits.extend(cleaned.hits);
            *input = cleaned.text;
        }
    }
    Some(if hits.is_empty() {
        GuardrailVerdict::pass(StageId::InputSanitization)
    } else {
        GuardrailVerdict::with(
            StageId::InputSanitization,
            Verdict::Sanitized,
            format!("removed {} injection marker(s)", hits.len()),
            Some(&hits.join(" | ")),
        )
    })
}

fn output_schema(_g: &Guardrails, i: &mut Inspection) -> Option<GuardrailVerdict> {
    let (agent, raw) = i.output.as_ref()?;
    let agent = *agent;
    match validate_output(agent, raw) {
        Ok(parsed) => {
            if let Some(files) = parsed.files() {
                if let Some(tool) = agent.tool() {
                    i.tools.push(tool.to_string());
                }
                for (name, code) in files {
                    i.paths.push(artifact_path(agent, name));
                    i.code.push((name.clone(), code.clone()));
                }
            }
            i.parsed = Some(parsed);
            Some(GuardrailVerdict::pass(StageId::OutputSchema))
        }
        Err(reason) => Some(GuardrailVerdict::with(
            StageId::OutputSchema,
            Verdict::Retry,
            format!("{agent} output does not match its schema: {reason}"),
            Some(raw),
        )),
    }
}

fn tool_allowlist(g: &Guardrails, i: &mut Inspection) -> Option<GuardrailVerdict> {
    if i.tools.is_empty() {
        return None;
    }
    Some(match i.tools.iter().find(|t| !g.allowed_tools.contains(*t)) {
        None => GuardrailVerdict::pass(StageId::ToolAllowlist),
        Some(tool) => GuardrailVerdict::with(
            StageId::ToolAllowlist,
            Verdict::Fatal,
            format!("tool '{tool}' is not allowed"),
            Some(tool),
        ),
    })
}

fn path_sandbox(g: &Guardrails, i: &mut Inspection) -> Option<GuardrailVerdict> {
    if i.paths.is_empty() {
        return None;
    }
    let subtree = i.output.as_ref().and_then(|(agent, _)| artifact_dir(*agent));
    for path in &i.paths {
        let resolved = match subtree {
            Some(dir) => g.sandbox.resolve_under(dir, path),
            None => g.sandbox.resolve(path),
        };
        if let Err(violation) = resolved {
            return Some(GuardrailVerdict::with(
                StageId::PathSandbox,
                Verdict::Fatal,
                violation.to_string(),
                Some(path),
            ));
        }
    }
    Some(GuardrailVerdict::pass(StageId::PathSandbox))
}

fn risk_scan(g: &Guardrails, i: &mut Inspection) -> Option<GuardrailVerdict> {
    if i.code.is_empty() {
        return None;
    }
    let findings = g
        .risk
        .scan(i.code.iter().map(|(f, c)| (f.as_str(), c.as_str())));
    if findings.is_empty() {
        return Some(GuardrailVerdict::pass(StageId::RiskScan));
    }
    let summary = findings
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    let verdict = if g.require_human_review {
        Verdict::Suspend
    } else {
        Verdict::Warn
    };
    Some(GuardrailVerdict::with(StageId::RiskScan, verdict, summary, None))
}
