//! Job history: one summary record per job, kept after its message is gone.
//!
//! ```text
//! <queue_dir>/done/<job_id>.json   JobRecord
//! ```
//!
//! `forja submit` writes the pending record and workers overwrite it with the
//! final one right before acknowledging or dead-lettering the message, so a
//! crash in between only rewrites the same record on redelivery.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifacts::atomic_write;
use crate::error::ForjaError;
use crate::ledger::TokenUsageRecord;
use crate::state_machine::{AgentKind, AgentState, FailureReason, JobStatus, State};

/// Usage of one agent within a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentUsage {
    pub agent: AgentKind,
    #[serde(flatten)]
    pub usage: TokenUsageRecord,
}

/// Queryable summary of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub user_id: String,
    pub request: String,
    pub status: JobStatus,
    pub state: State,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    #[serde(default)]
    pub failure_detail: Option<String>,
    pub total_tokens: u64,
    pub cost_usd: f64,
    #[serde(default)]
    pub agents: Vec<AgentUsage>,
    pub retries: u32,
    pub validation_passed: bool,
    /// Distinct models called, in first-use order.
    #[serde(default)]
    pub models: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn from_state(state: &AgentState) -> Self {
        let current = state.current_state();
        let finished = current.is_terminal()
            || matches!(
                state.job.status,
                JobStatus::Succeeded | JobStatus::Failed | JobStatus::DeadLettered
            );

        let mut models: Vec<String> = Vec::new();
        for trace in &state.audit {
            if !models.contains(&trace.model) {
                models.push(trace.model.clone());
            }
        }

        Self {
            job_id: state.job.id.clone(),
            user_id: state.job.user_id.clone(),
            request: state.job.request.clone(),
            status: state.job.status,
            state: current,
            failure: state.failure,
            failure_detail: state.failure_detail.clone(),
            total_tokens: state.ledger.total_tokens(),
            cost_usd: state.ledger.total_cost_usd(),
            agents: state
                .ledger
                .breakdown()
                .into_iter()
                .map(|(agent, usage)| AgentUsage { agent, usage })
                .collect(),
            retries: state.retries.values().sum(),
            validation_passed: state.validation.as_ref().is_some_and(|v| v.passed),
            models,
            created_at: state.job.created_at,
            finished_at: finished.then(Utc::now),
        }
    }
}

pub struct JobStore {
    dir: PathBuf,
}

impl JobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The store kept next to a [`crate::queue::DirQueue`] rooted at `queue_dir`.
    pub fn for_queue(queue_dir: &Path) -> Self {
        Self::new(queue_dir.join("done"))
    }

    fn path(&self, job_id: &str) -> Option<PathBuf> {
        let plain = !job_id.is_empty()
            && !job_id.contains(['/', '\\'])
            && job_id != "."
            && job_id != "..";
        plain.then(|| self.dir.join(format!("{job_id}.json")))
    }

    /// Write (or overwrite) the record for `state`.
    pub fn record(&self, state: &AgentState) -> Result<JobRecord, ForjaError> {
        let record = JobRecord::from_state(state);
        let path = self
            .path(&record.job_id)
            .ok_or_else(|| ForjaError::Config(format!("unusable job id {:?}", record.job_id)))?;
        atomic_write(&path, &serde_json::to_vec_pretty(&record)?)?;
        tracing::debug!(job_id = %record.job_id, status = ?record.status, "job record written");
        Ok(record)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<JobRecord>, ForjaError> {
        let Some(path) = self.path(job_id) else {
            return Ok(None);
        };
        match fs::read_to_string(path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Most recent records first, optionally only those of `user_id`.
    ///
    /// Unreadable files are logged and skipped.
    pub fn list(&self, user_id: Option<&str>, limit: usize) -> Result<Vec<JobRecord>, ForjaError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let record: JobRecord = match fs::read_to_string(&path)
                .map_err(ForjaError::from)
                .and_then(|raw| serde_json::from_str(&raw).map_err(ForjaError::from))
            {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable job record");
                    continue;
                }
            };
            if user_id.is_none_or(|user| record.user_id == user) {
                records.push(record);
            }
        }

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{CallUsage, PricingTable};
    use crate::state_machine::{StateMachine, ValidationReport};

    fn finished(user: &str) -> AgentState {
        let mut state = AgentState::new("todo app", user);
        state
            .ledger
            .record(
                AgentKind::Planner,
                &CallUsage::new("claude-haiku-4-5", 1_000, 500),
                &PricingTable::default(),
                200_000,
            )
            .unwrap();
        state.retries.insert(AgentKind::BeExecutor, 2);
        state.validation = Some(ValidationReport {
            passed: true,
            report: "ok".into(),
            target: None,
        });
        StateMachine::advance(&mut state, State::Done, "validated");
        state
    }

    #[test]
    fn record_summarises_the_final_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::for_queue(dir.path());
        let state = finished("alice");

        let written = store.record(&state).unwrap();
        assert!(dir.path().join("done").join(format!("{}.json", state.job.id)).exists());

        let read = store.get(&state.job.id).unwrap().unwrap();
        assert_eq!(read, written);
        assert_eq!(read.state, State::Done);
        assert_eq!(read.total_tokens, 1_500);
        assert_eq!(read.retries, 2);
        assert!(read.validation_passed);
        assert!(read.finished_at.is_some());
        assert_eq!(read.agents.len(), 1);
        assert_eq!(read.agents[0].agent, AgentKind::Planner);
        assert_eq!(read.agents[0].usage.calls, 1);
    }

    #[test]
    fn pending_record_has_no_finish_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        let state = AgentState::new("todo app", "alice");
        let record = store.record(&state).unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert!(record.finished_at.is_none());
    }

    #[test]
    fn list_filters_by_user_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        let mut older = finished("alice");
        older.job.created_at -= chrono::Duration::minutes(5);
        let newer = finished("alice");
        store.record(&older).unwrap();
        store.record(&newer).unwrap();
        store.record(&finished("bob")).unwrap();
        fs::write(dir.path().join("junk.json"), "not a record").unwrap();

        let alice = store.list(Some("alice"), 20).unwrap();
        let ids: Vec<_> = alice.iter().map(|r| r.job_id.as_str()).collect();
        assert_eq!(ids, vec![newer.job.id.as_str(), older.job.id.as_str()]);

        assert_eq!(store.list(None, 20).unwrap().len(), 3);
        assert_eq!(store.list(None, 1).unwrap().len(), 1);
    }

    #[test]
    fn unknown_or_unsafe_ids_are_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path().join("done"));
        assert!(store.get("missing").unwrap().is_none());
        assert!(store.get("../secrets").unwrap().is_none());
        assert!(store.list(None, 20).unwrap().is_empty());
    }
}
