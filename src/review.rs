//! External review signals for jobs parked in AWAITING_REVIEW.
//!
//! One `<job_id>.json` file per decided job. `forja approve` writes them;
//! workers read them when a parked job is redelivered.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use crate::artifacts::atomic_write;
use crate::error::ForjaError;
use crate::state_machine::ReviewDecision;

pub struct ReviewStore {
    dir: PathBuf,
}

impl ReviewStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }

    pub fn decide(&self, job_id: &str, decision: &ReviewDecision) -> Result<PathBuf, ForjaError> {
        let path = self.path(job_id);
        atomic_write(&path, &serde_json::to_vec_pretty(decision)?)?;
        tracing::info!(job_id, approved = decision.approved, reviewer = %decision.reviewer, "review decision recorded");
        Ok(path)
    }

    pub fn decision(&self, job_id: &str) -> Result<Option<ReviewDecision>, ForjaError> {
        match fs::read_to_string(self.path(job_id)) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Forget a decision once it has been applied.
    pub fn clear(&self, job_id: &str) -> Result<(), ForjaError> {
        match fs::remove_file(self.path(job_id)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_round_trips_through_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReviewStore::new(dir.path().join("reviews"));
        assert!(store.decision("job-1").unwrap().is_none());

        store.decide("job-1", &ReviewDecision::new(true, "carol")).unwrap();
        let got = store.decision("job-1").unwrap().unwrap();
        assert!(got.approved);
        assert_eq!(got.reviewer, "carol");

        store.clear("job-1").unwrap();
        assert!(store.decision("job-1").unwrap().is_none());
        store.clear("job-1").unwrap();
    }

    #[test]
    fn garbage_decision_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("job-2.json"), "yes please").unwrap();
        let store = ReviewStore::new(dir.path());
        assert!(matches!(store.decision("job-2"), Err(ForjaError::Json(_))));
    }
}
