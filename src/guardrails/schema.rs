//! Fixed per-agent output schemas.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::state_machine::{AgentKind, ProjectSpec, ValidationReport};

/// Parsed, schema-conformant agent output.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutput {
    Plan(ProjectSpec),
    Frontend(BTreeMap<String, String>),
    Backend(BTreeMap<String, String>),
    Validation(ValidationReport),
}

impl AgentOutput {
    /// Generated files, for the executors.
    pub fn files(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            AgentOutput::Frontend(files) | AgentOutput::Backend(files) => Some(files),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPlan {
    spec: String,
    pages: Vec<String>,
    endpoints: Vec<String>,
    data_models: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawValidation {
    passed: bool,
    report: String,
    #[serde(default)]
    target: String,
}

/// Models often wrap JSON in a fenced block; take what is inside.
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.trim_start_matches("json");
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Parse `raw` against the schema for `agent`.
pub fn validate_output(agent: AgentKind, raw: &str) -> Result<AgentOutput, String> {
    let json = extract_json(raw);
    match agent {
        AgentKind::Planner => {
            let plan: RawPlan = serde_json::from_str(json).map_err(|e| e.to_string())?;
            if plan.spec.trim().is_empty() {
                return Err("planner returned an empty spec".into());
            }
            Ok(AgentOutput::Plan(ProjectSpec {
                spec: plan.spec,
                pages: plan.pages,
                endpoints: plan.endpoints,
                data_models: plan.data_models,
            }))
        }
        AgentKind::FeExecutor | AgentKind::BeExecutor => {
            let files: BTreeMap<String, String> =
                serde_json::from_str(json).map_err(|e| e.to_string())?;
            if files.is_empty() {
                return Err(format!("{agent} returned no files"));
            }
            if files.keys().any(|name| name.trim().is_empty()) {
                return Err(format!("{agent} returned a file with an empty name"));
            }
            Ok(if agent == AgentKind::FeExecutor {
                AgentOutput::Frontend(files)
            } else {
                AgentOutput::Backend(files)
            })
        }
        AgentKind::Validator => {
            let raw: RawValidation = serde_json::from_str(json).map_err(|e| e.to_string())?;
            let target = if raw.passed {
                None
            } else if raw.target.trim().is_empty() {
                Some(AgentKind::FeExecutor)
            } else {
                match AgentKind::from_name(raw.target.trim()) {
                    Some(
                        t @ (AgentKind::Planner | AgentKind::FeExecutor | AgentKind::BeExecutor),
                    ) => Some(t),
                    _ => return Err(format!("unknown validation target '{}'", raw.target)),
                }
            };
            Ok(AgentOutput::Validation(ValidationReport {
                passed: raw.passed,
                report: raw.report,
                target,
            }))
        }
        AgentKind::Router => Err("router output is not validated by the pipeline".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planner_output_parses() {
        let raw = r#"{"spec":"A todo app","pages":["home"],"endpoints":["GET /todos"],"data_models":["Todo"]}"#;
        let out = validate_output(AgentKind::Planner, raw).unwrap();
        match out {
            AgentOutput::Plan(spec) => {
                assert_eq!(spec.pages, vec!["home"]);
                assert_eq!(spec.data_models, vec!["Todo"]);
            }
            other => panic!("expected plan, got {other:?}"),
        }
    }

    #[test]
    fn planner_missing_field_is_invalid() {
        let raw = r#"{"spec":"A todo app","pages":[]}"#;
        assert!(validate_output(AgentKind::Planner, raw).is_err());
    }

    #[test]
    fn fenced_json_is_accepted() {
        let raw = "```json\n{\"index.tsx\": \"export default () => null\"}\n```";
        let out = validate_output(AgentKind::FeExecutor, raw).unwrap();
        assert_eq!(out.files().unwrap().len(), 1);
    }

    #[test]
    fn executor_needs_files() {
        assert!(validate_output(AgentKind::BeExecutor, "{}").is_err());
        assert!(validate_output(AgentKind::BeExecutor, "not json").is_err());
        assert!(validate_output(AgentKind::BeExecutor, r#"{"main.py": 3}"#).is_err());
    }

    #[test]
    fn validator_failure_names_target() {
        let raw = r#"{"passed":false,"report":"missing route","target":"be_executor"}"#;
        let out = validate_output(AgentKind::Validator, raw).unwrap();
        assert_eq!(
            out,
            AgentOutput::Validation(ValidationReport {
                passed: false,
                report: "missing route".into(),
                target: Some(AgentKind::BeExecutor),
            })
        );
    }

    #[test]
    fn validator_failure_without_target_defaults_to_frontend() {
        let raw = r#"{"passed":false,"report":"broken"}"#;
        match validate_output(AgentKind::Validator, raw).unwrap() {
            AgentOutput::Validation(report) => assert_eq!(report.target, Some(AgentKind::FeExecutor)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn validator_cannot_target_itself() {
        let raw = r#"{"passed":false,"report":"x","target":"validator"}"#;
        assert!(validate_output(AgentKind::Validator, raw).is_err());
    }
}
