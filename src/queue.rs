//! Durable job queue with visibility timeouts and dead-letter redrive.
//!
//! A received message stays invisible to other workers until its lease
//! expires. Leases are refreshed by every checkpoint, so a worker making
//! progress never loses its job; a crashed worker's job reappears after
//! `visibility_timeout` with `receive_count` bumped. Messages received more
//! than `max_receives` times go to the dead-letter destination instead.
//!
//! A job parked in AWAITING_REVIEW is checkpointed but never acknowledged,
//! so each redelivery counts as a receive: the review window is roughly
//! `max_receives * visibility_timeout`.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifacts::atomic_write;
use crate::state_machine::AgentState;

pub const MAX_RECEIVES_EXCEEDED: &str = "max_receives_exceeded";

/// The serialized job as carried by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub job_id: String,
    #[serde(default)]
    pub receive_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub state: AgentState,
}

impl QueueMessage {
    pub fn new(state: AgentState) -> Self {
        Self {
            job_id: state.job.id.clone(),
            receive_count: 0,
            enqueued_at: Utc::now(),
            state,
        }
    }
}

/// A message that will not be processed again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub job_id: String,
    pub reason: String,
    pub receive_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
    pub state: AgentState,
}

impl DeadLetterRecord {
    fn from_message(message: QueueMessage, reason: impl Into<String>) -> Self {
        Self {
            job_id: message.job_id,
            reason: reason.into(),
            receive_count: message.receive_count,
            dead_lettered_at: Utc::now(),
            state: message.state,
        }
    }
}

/// One leased receive of a message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
}

impl Delivery {
    pub fn job_id(&self) -> &str {
        &self.message.job_id
    }

    /// Identifies this particular receive; a later redelivery of the same
    /// job gets a different receipt.
    pub fn receipt(&self) -> String {
        format!("{}:{}", self.message.job_id, self.message.receive_count)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub pending: usize,
    pub in_flight: usize,
    pub dead: usize,
}

impl QueueDepth {
    /// Messages still waiting for a worker to finish them.
    pub fn outstanding(&self) -> usize {
        self.pending + self.in_flight
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt queue message at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("lease lost for receipt {0}")]
    LeaseLost(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> QueueError + '_ {
    move |source| QueueError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Operations a worker needs from a queue backend.
pub trait JobQueue: Send + Sync {
    fn send(&self, state: &AgentState) -> Result<(), QueueError>;

    /// Lease the next visible message, if any. Never blocks.
    fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    /// Persist `state` into the leased message and extend the lease.
    fn checkpoint(&self, delivery: &Delivery, state: &AgentState) -> Result<(), QueueError>;

    /// Remove the leased message for good.
    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Move the leased message to the dead-letter destination with `state`.
    fn dead_letter(
        &self,
        delivery: &Delivery,
        state: &AgentState,
        reason: &str,
    ) -> Result<(), QueueError>;

    fn depth(&self) -> Result<QueueDepth, QueueError>;
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub visibility_timeout: Duration,
    pub max_receives: u32,
}

struct Lease {
    message: QueueMessage,
    expires: Instant,
}

#[derive(Default)]
struct MemoryInner {
    pending: VecDeque<QueueMessage>,
    in_flight: HashMap<String, Lease>,
    dead: Vec<DeadLetterRecord>,
}

/// Process-local queue used by `forja run` and the tests.
pub struct MemoryQueue {
    settings: QueueSettings,
    inner: Mutex<MemoryInner>,
}

impl MemoryQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.inner.lock().dead.clone()
    }

    fn owns(inner: &MemoryInner, delivery: &Delivery) -> bool {
        inner
            .in_flight
            .get(delivery.job_id())
            .is_some_and(|lease| lease.message.receive_count == delivery.message.receive_count)
    }
}

impl JobQueue for MemoryQueue {
    fn send(&self, state: &AgentState) -> Result<(), QueueError> {
        self.inner.lock().pending.push_back(QueueMessage::new(state.clone()));
        Ok(())
    }

    fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let expired: Vec<String> = inner
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.expires <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(lease) = inner.in_flight.remove(&id) {
                tracing::debug!(job_id = %id, "lease expired, message visible again");
                inner.pending.push_back(lease.message);
            }
        }

        while let Some(mut message) = inner.pending.pop_front() {
            message.receive_count += 1;
            if message.receive_count > self.settings.max_receives {
                tracing::warn!(job_id = %message.job_id, receives = message.receive_count, "redriving to dead letter");
                inner
                    .dead
                    .push(DeadLetterRecord::from_message(message, MAX_RECEIVES_EXCEEDED));
                continue;
            }
            inner.in_flight.insert(
                message.job_id.clone(),
                Lease {
                    message: message.clone(),
                    expires: now + self.settings.visibility_timeout,
                },
            );
            return Ok(Some(Delivery { message }));
        }
        Ok(None)
    }

    fn checkpoint(&self, delivery: &Delivery, state: &AgentState) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if !Self::owns(&inner, delivery) {
            return Err(QueueError::LeaseLost(delivery.receipt()));
        }
        let timeout = self.settings.visibility_timeout;
        if let Some(lease) = inner.in_flight.get_mut(delivery.job_id()) {
            lease.message.state = state.clone();
            lease.expires = Instant::now() + timeout;
        }
        Ok(())
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if !Self::owns(&inner, delivery) {
            return Err(QueueError::LeaseLost(delivery.receipt()));
        }
        inner.in_flight.remove(delivery.job_id());
        Ok(())
    }

    fn dead_letter(
        &self,
        delivery: &Delivery,
        state: &AgentState,
        reason: &str,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if !Self::owns(&inner, delivery) {
            return Err(QueueError::LeaseLost(delivery.receipt()));
        }
        if let Some(mut lease) = inner.in_flight.remove(delivery.job_id()) {
            lease.message.state = state.clone();
            inner.dead.push(DeadLetterRecord::from_message(lease.message, reason));
        }
        Ok(())
    }

    fn depth(&self) -> Result<QueueDepth, QueueError> {
        let inner = self.inner.lock();
        Ok(QueueDepth {
            pending: inner.pending.len(),
            in_flight: inner.in_flight.len(),
            dead: inner.dead.len(),
        })
    }
}

/// Queue backed by a directory tree shared between worker processes.
///
/// ```text
/// <root>/pending/<job_id>.json    QueueMessage
/// <root>/inflight/<job_id>.json   QueueMessage, lease = mtime + visibility
/// <root>/dead/<job_id>.json       DeadLetterRecord
/// ```
///
/// Claiming is a rename from `pending/` to `inflight/`, which only one
/// process can win.
pub struct DirQueue {
    root: PathBuf,
    settings: QueueSettings,
}

impl DirQueue {
    pub fn open(root: impl Into<PathBuf>, settings: QueueSettings) -> Result<Self, QueueError> {
        let queue = Self {
            root: root.into(),
            settings,
        };
        for dir in [queue.pending_dir(), queue.inflight_dir(), queue.dead_dir()] {
            fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        }
        Ok(queue)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pending_dir(&self) -> PathBuf {
        self.root.join("pending")
    }

    fn inflight_dir(&self) -> PathBuf {
        self.root.join("inflight")
    }

    fn dead_dir(&self) -> PathBuf {
        self.root.join("dead")
    }

    fn file_name(job_id: &str) -> String {
        format!("{job_id}.json")
    }

    /// `.json` entries of `dir`, oldest first.
    fn entries(dir: &Path) -> Result<Vec<(PathBuf, SystemTime)>, QueueError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_err(dir))? {
            let entry = entry.map_err(io_err(dir))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Vanished between listing and stat: another worker moved it.
            let Ok(meta) = entry.metadata() else { continue };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((path, modified));
        }
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(entries)
    }

    fn read_message(path: &Path) -> Result<QueueMessage, QueueError> {
        let raw = fs::read_to_string(path).map_err(io_err(path))?;
        serde_json::from_str(&raw).map_err(|source| QueueError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), QueueError> {
        let json = serde_json::to_vec_pretty(value).map_err(|source| QueueError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        atomic_write(path, &json).map_err(io_err(path))
    }

    /// Move in-flight messages whose lease ran out back to `pending/`.
    fn reclaim_expired(&self) -> Result<(), QueueError> {
        let now = SystemTime::now();
        for (path, modified) in Self::entries(&self.inflight_dir())? {
            let expired = modified
                .checked_add(self.settings.visibility_timeout)
                .is_none_or(|deadline| deadline <= now);
            if !expired {
                continue;
            }
            let Some(name) = path.file_name() else { continue };
            let target = self.pending_dir().join(name);
            match fs::rename(&path, &target) {
                Ok(()) => tracing::debug!(path = %target.display(), "lease expired, message visible again"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(&path)(e)),
            }
        }
        Ok(())
    }

    /// The in-flight message for `delivery`, if this receive still owns it.
    fn owned(&self, delivery: &Delivery) -> Result<PathBuf, QueueError> {
        let path = self.inflight_dir().join(Self::file_name(delivery.job_id()));
        match Self::read_message(&path) {
            Ok(current) if current.receive_count == delivery.message.receive_count => Ok(path),
            Ok(_) => Err(QueueError::LeaseLost(delivery.receipt())),
            Err(QueueError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                Err(QueueError::LeaseLost(delivery.receipt()))
            }
            Err(e) => Err(e),
        }
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>, QueueError> {
        let mut records = Vec::new();
        for (path, _) in Self::entries(&self.dead_dir())? {
            let raw = fs::read_to_string(&path).map_err(io_err(&path))?;
            let record = serde_json::from_str(&raw).map_err(|source| QueueError::Corrupt {
                path: path.clone(),
                source,
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

impl JobQueue for DirQueue {
    fn send(&self, state: &AgentState) -> Result<(), QueueError> {
        let message = QueueMessage::new(state.clone());
        let path = self.pending_dir().join(Self::file_name(&message.job_id));
        Self::write_json(&path, &message)?;
        tracing::info!(job_id = %message.job_id, "job enqueued");
        Ok(())
    }

    fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        self.reclaim_expired()?;

        for (path, _) in Self::entries(&self.pending_dir())? {
            let Some(name) = path.file_name() else { continue };
            let claimed = self.inflight_dir().join(name);
            match fs::rename(&path, &claimed) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(&path)(e)),
            }

            let mut message = match Self::read_message(&claimed) {
                Ok(message) => message,
                Err(err @ QueueError::Corrupt { .. }) => {
                    let quarantine = self.dead_dir().join(name).with_extension("corrupt");
                    fs::rename(&claimed, &quarantine).map_err(io_err(&claimed))?;
                    return Err(err);
                }
                Err(e) => return Err(e),
            };

            message.receive_count += 1;
            if message.receive_count > self.settings.max_receives {
                tracing::warn!(job_id = %message.job_id, receives = message.receive_count, "redriving to dead letter");
                let dead = self.dead_dir().join(Self::file_name(&message.job_id));
                Self::write_json(&dead, &DeadLetterRecord::from_message(message, MAX_RECEIVES_EXCEEDED))?;
                fs::remove_file(&claimed).map_err(io_err(&claimed))?;
                continue;
            }

            // Rewriting also stamps a fresh mtime, which starts the lease.
            Self::write_json(&claimed, &message)?;
            return Ok(Some(Delivery { message }));
        }
        Ok(None)
    }

    fn checkpoint(&self, delivery: &Delivery, state: &AgentState) -> Result<(), QueueError> {
        let path = self.owned(delivery)?;
        let mut message = delivery.message.clone();
        message.state = state.clone();
        Self::write_json(&path, &message)
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let path = self.owned(delivery)?;
        fs::remove_file(&path).map_err(io_err(&path))
    }

    fn dead_letter(
        &self,
        delivery: &Delivery,
        state: &AgentState,
        reason: &str,
    ) -> Result<(), QueueError> {
        let path = self.owned(delivery)?;
        let mut message = delivery.message.clone();
        message.state = state.clone();
        let dead = self.dead_dir().join(Self::file_name(delivery.job_id()));
        Self::write_json(&dead, &DeadLetterRecord::from_message(message, reason))?;
        fs::remove_file(&path).map_err(io_err(&path))
    }

    fn depth(&self) -> Result<QueueDepth, QueueError> {
        Ok(QueueDepth {
            pending: Self::entries(&self.pending_dir())?.len(),
            in_flight: Self::entries(&self.inflight_dir())?.len(),
            dead: Self::entries(&self.dead_dir())?.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{State, StateMachine};

    fn settings(visibility: Duration, max_receives: u32) -> QueueSettings {
        QueueSettings {
            visibility_timeout: visibility,
            max_receives,
        }
    }

    fn long() -> QueueSettings {
        settings(Duration::from_secs(300), 5)
    }

    #[test]
    fn memory_receive_hides_message_until_acked() {
        let q = MemoryQueue::new(long());
        q.send(&AgentState::new("todo app", "alice")).unwrap();

        let d = q.receive().unwrap().unwrap();
        assert_eq!(d.message.receive_count, 1);
        assert!(q.receive().unwrap().is_none());
        assert_eq!(q.depth().unwrap(), QueueDepth { pending: 0, in_flight: 1, dead: 0 });

        q.ack(&d).unwrap();
        assert_eq!(q.depth().unwrap().outstanding(), 0);
    }

    #[test]
    fn memory_expired_lease_redelivers_checkpointed_state() {
        let q = MemoryQueue::new(settings(Duration::ZERO, 5));
        q.send(&AgentState::new("todo app", "alice")).unwrap();

        let first = q.receive().unwrap().unwrap();
        let mut state = first.message.state.clone();
        StateMachine::advance(&mut state, State::FeExec, "planned");
        q.checkpoint(&first, &state).unwrap();

        let second = q.receive().unwrap().unwrap();
        assert_eq!(second.message.receive_count, 2);
        assert_eq!(second.message.state.current_state(), State::FeExec);

        // The first worker's receipt is stale now.
        assert!(matches!(q.ack(&first), Err(QueueError::LeaseLost(_))));
        q.ack(&second).unwrap();
    }

    #[test]
    fn memory_redrives_after_max_receives() {
        let q = MemoryQueue::new(settings(Duration::ZERO, 2));
        q.send(&AgentState::new("todo app", "alice")).unwrap();

        assert!(q.receive().unwrap().is_some());
        assert!(q.receive().unwrap().is_some());
        assert!(q.receive().unwrap().is_none());

        let dead = q.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, MAX_RECEIVES_EXCEEDED);
        assert_eq!(dead[0].receive_count, 3);
    }

    #[test]
    fn memory_dead_letter_keeps_final_state() {
        let q = MemoryQueue::new(long());
        q.send(&AgentState::new("todo app", "alice")).unwrap();
        let d = q.receive().unwrap().unwrap();
        let mut state = d.message.state.clone();
        StateMachine::fail(&mut state, crate::state_machine::FailureReason::BudgetExceeded, "over");

        q.dead_letter(&d, &state, "budget_exceeded").unwrap();
        let dead = q.dead_letters();
        assert_eq!(dead[0].state.current_state(), State::Failed);
        assert_eq!(q.depth().unwrap(), QueueDepth { pending: 0, in_flight: 0, dead: 1 });
    }

    #[test]
    fn dir_queue_round_trip_through_directories() {
        let dir = tempfile::tempdir().unwrap();
        let q = DirQueue::open(dir.path(), long()).unwrap();
        let state = AgentState::new("todo app", "alice");
        q.send(&state).unwrap();
        assert!(dir.path().join("pending").join(format!("{}.json", state.job.id)).exists());

        let d = q.receive().unwrap().unwrap();
        assert_eq!(d.job_id(), state.job.id);
        assert!(dir.path().join("inflight").join(format!("{}.json", state.job.id)).exists());
        assert!(q.receive().unwrap().is_none());

        q.ack(&d).unwrap();
        assert_eq!(q.depth().unwrap(), QueueDepth::default());
    }

    #[test]
    fn dir_queue_claim_is_exclusive_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let a = DirQueue::open(dir.path(), long()).unwrap();
        let b = DirQueue::open(dir.path(), long()).unwrap();
        a.send(&AgentState::new("todo app", "alice")).unwrap();

        let got_a = a.receive().unwrap();
        let got_b = b.receive().unwrap();
        assert!(got_a.is_some() ^ got_b.is_some());
    }

    #[test]
    fn dir_queue_redelivers_expired_and_checkpointed() {
        let dir = tempfile::tempdir().unwrap();
        let q = DirQueue::open(dir.path(), settings(Duration::ZERO, 5)).unwrap();
        q.send(&AgentState::new("todo app", "alice")).unwrap();

        let first = q.receive().unwrap().unwrap();
        let mut state = first.message.state.clone();
        StateMachine::advance(&mut state, State::BeExec, "frontend done");
        q.checkpoint(&first, &state).unwrap();

        let second = q.receive().unwrap().unwrap();
        assert_eq!(second.message.receive_count, 2);
        assert_eq!(second.message.state.current_state(), State::BeExec);
        assert!(matches!(q.checkpoint(&first, &state), Err(QueueError::LeaseLost(_))));
    }

    #[test]
    fn dir_queue_redrive_and_dead_letter_listing() {
        let dir = tempfile::tempdir().unwrap();
        let q = DirQueue::open(dir.path(), settings(Duration::ZERO, 1)).unwrap();
        q.send(&AgentState::new("todo app", "alice")).unwrap();

        assert!(q.receive().unwrap().is_some());
        assert!(q.receive().unwrap().is_none());

        let dead = q.dead_letters().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, MAX_RECEIVES_EXCEEDED);
        assert_eq!(q.depth().unwrap().dead, 1);
    }

    #[test]
    fn dir_queue_quarantines_corrupt_message() {
        let dir = tempfile::tempdir().unwrap();
        let q = DirQueue::open(dir.path(), long()).unwrap();
        fs::write(dir.path().join("pending/broken.json"), "{not json").unwrap();

        assert!(matches!(q.receive(), Err(QueueError::Corrupt { .. })));
        assert!(dir.path().join("dead/broken.corrupt").exists());
        assert!(q.receive().unwrap().is_none());
    }
}
