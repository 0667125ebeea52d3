//! Artifact commit to the output root.
//!
//! Every write goes through the tool allowlist and path sandbox stages, then
//! lands via temp file + rename so a duplicate delivery overwrites whole files
//! and a crash never leaves a partial one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::guardrails::{GuardrailVerdict, Guardrails, Inspection};
use crate::state_machine::{AgentKind, AgentState};

pub const WRITER_TOOL: &str = "file_writer";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("write blocked by {}: {}", .0.stage, .0.reason.as_deref().unwrap_or("no reason"))]
    Blocked(GuardrailVerdict),

    #[error("IO error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Directory under the output root that owns an agent's generated files.
pub fn artifact_dir(agent: AgentKind) -> Option<&'static str> {
    match agent {
        AgentKind::FeExecutor => Some("frontend"),
        AgentKind::BeExecutor => Some("backend"),
        _ => None,
    }
}

/// Output-root-relative location of a generated file.
pub fn artifact_path(agent: AgentKind, name: &str) -> String {
    match artifact_dir(agent) {
        Some(dir) => format!("{dir}/{name}"),
        None => name.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitSummary {
    pub root: PathBuf,
    pub written: Vec<PathBuf>,
}

pub struct ArtifactStore<'a> {
    guardrails: &'a Guardrails,
}

impl<'a> ArtifactStore<'a> {
    pub fn new(guardrails: &'a Guardrails) -> Self {
        Self { guardrails }
    }

    pub fn root(&self) -> &Path {
        self.guardrails.sandbox().root()
    }

    /// Write all artifacts carried by `state`.
    pub fn commit(&self, state: &AgentState) -> Result<CommitSummary, ArtifactError> {
        let files = Self::collect(state);
        let mut inspection =
            Inspection::before_write(WRITER_TOOL, files.iter().map(|(p, _)| p.clone()).collect());
        let report = self.guardrails.run(&mut inspection);
        if let Some(blocking) = report.blocking() {
            return Err(ArtifactError::Blocked(blocking.clone()));
        }

        let mut written = Vec::with_capacity(files.len());
        for (relative, contents) in &files {
            let target = self
                .guardrails
                .sandbox()
                .resolve(relative)
                .map_err(|v| ArtifactError::Blocked(sandbox_verdict(relative, &v.to_string())))?;
            atomic_write(&target, contents.as_bytes()).map_err(|source| ArtifactError::Io {
                path: target.clone(),
                source,
            })?;
            written.push(target);
        }

        tracing::info!(
            job_id = %state.job.id,
            root = %self.root().display(),
            files = written.len(),
            "artifacts committed"
        );
        Ok(CommitSummary {
            root: self.root().to_path_buf(),
            written,
        })
    }

    fn collect(state: &AgentState) -> Vec<(String, String)> {
        let mut files = Vec::new();
        for (name, code) in &state.fe_code {
            files.push((artifact_path(AgentKind::FeExecutor, name), code.clone()));
        }
        for (name, code) in &state.be_code {
            files.push((artifact_path(AgentKind::BeExecutor, name), code.clone()));
        }
        if let Some(spec) = &state.spec {
            files.push(("SPEC.md".to_string(), spec.spec.clone()));
        }

        let (status, body) = match &state.validation {
            Some(v) => (if v.passed { "PASSED" } else { "FAILED" }, v.report.as_str()),
            None => ("FAILED", "No validation run."),
        };
        files.push((
            "VALIDATION_REPORT.md".to_string(),
            format!("# Validation Report\n\n**Status:** {status}\n\n{body}\n"),
        ));
        files
    }
}

fn sandbox_verdict(path: &str, reason: &str) -> GuardrailVerdict {
    GuardrailVerdict {
        stage: crate::guardrails::StageId::PathSandbox,
        verdict: crate::guardrails::Verdict::Fatal,
        reason: Some(reason.to_string()),
        offending: Some(path.to_string()),
    }
}

/// Write `contents` to `path` through a temp file in the same directory.
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
