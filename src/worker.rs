//! Stateless queue worker.
//!
//! Pulls one serialized job at a time, drives it with the [`Orchestrator`]
//! until it finishes or parks, checkpointing after every step. Anything the
//! worker knows about a job lives in the queue message, so any worker can
//! pick up where another one crashed.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};

use crate::anthropic::MessageSender;
use crate::artifacts::{ArtifactError, ArtifactStore, CommitSummary};
use crate::error::ForjaError;
use crate::guardrails::StageId;
use crate::history::JobStore;
use crate::orchestrator::{Orchestrator, StepOutcome};
use crate::queue::{Delivery, JobQueue, QueueError};
use crate::rate_limiter::RateLimitResult;
use crate::review::ReviewStore;
use crate::state_machine::{AgentState, FailureReason, JobStatus, State, StateMachine};
use crate::telemetry;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What happened to a delivery.
#[derive(Debug)]
pub enum Processed {
    /// DONE, artifacts written, message acknowledged.
    Succeeded(CommitSummary),
    /// FAILED and moved to the dead-letter destination.
    DeadLettered(FailureReason),
    /// Parked in AWAITING_REVIEW; the message stays leased until it expires.
    AwaitingReview,
}

enum Poll {
    Delivery(Delivery),
    Empty,
    Shutdown,
}

pub struct QueueWorker<'a, C, Q> {
    orchestrator: Orchestrator<'a, C>,
    queue: &'a Q,
    reviews: &'a ReviewStore,
    history: Option<&'a JobStore>,
    poll_wait: Duration,
}

impl<'a, C: MessageSender, Q: JobQueue> QueueWorker<'a, C, Q> {
    pub fn new(orchestrator: Orchestrator<'a, C>, queue: &'a Q, reviews: &'a ReviewStore) -> Self {
        Self {
            orchestrator,
            queue,
            reviews,
            history: None,
            poll_wait: Duration::from_secs(2),
        }
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    /// Keep a final [`crate::history::JobRecord`] for every finished job.
    pub fn with_history(mut self, history: &'a JobStore) -> Self {
        self.history = Some(history);
        self
    }

    /// Poll until `shutdown` flips to `true` or its sender goes away.
    ///
    /// A job already in progress is driven to completion (or parked) before
    /// the loop exits. Returns how many deliveries were processed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<usize, ForjaError> {
        tracing::info!(poll_wait_ms = self.poll_wait.as_millis() as u64, "worker started");
        let mut processed = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.report_depth();
            match self.poll(&mut shutdown).await? {
                Poll::Delivery(delivery) => {
                    let job_id = delivery.job_id().to_string();
                    match self.process(delivery).await {
                        Ok(result) => tracing::debug!(job_id = %job_id, ?result, "delivery processed"),
                        Err(e) => tracing::error!(job_id = %job_id, error = %e, "delivery left for redelivery"),
                    }
                    processed += 1;
                }
                Poll::Empty => {}
                Poll::Shutdown => break,
            }
        }
        tracing::info!(processed, "worker stopped");
        Ok(processed)
    }

    /// Long-poll: retry `receive` until a message shows up or `poll_wait` ends.
    async fn poll(&self, shutdown: &mut watch::Receiver<bool>) -> Result<Poll, ForjaError> {
        let deadline = Instant::now() + self.poll_wait;
        loop {
            match self.queue.receive() {
                Ok(Some(delivery)) => return Ok(Poll::Delivery(delivery)),
                Ok(None) => {}
                Err(e @ QueueError::Corrupt { .. }) => {
                    tracing::error!(error = %e, "quarantined unreadable message");
                }
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Ok(Poll::Empty);
            }
            tokio::select! {
                _ = sleep(POLL_INTERVAL) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(Poll::Shutdown);
                    }
                }
            }
        }
    }

    fn report_depth(&self) {
        match self.queue.depth() {
            Ok(depth) => metrics::gauge!(telemetry::QUEUE_DEPTH).set(depth.outstanding() as f64),
            Err(e) => tracing::warn!(error = %e, "could not read queue depth"),
        }
    }

    /// Handle one delivery end to end.
    ///
    /// An `Err` means the message was neither acknowledged nor dead-lettered
    /// and will come back after its visibility timeout.
    pub async fn process(&self, delivery: Delivery) -> Result<Processed, ForjaError> {
        let mut state = delivery.message.state.clone();
        let ctx = self.orchestrator.context();
        tracing::info!(
            job_id = %state.job.id,
            user_id = %state.job.user_id,
            receive_count = delivery.message.receive_count,
            state = %state.current_state(),
            "processing delivery"
        );

        if state.job.status == JobStatus::Pending {
            if let RateLimitResult::Limited { retry_after, limit_type } = ctx.limiter.admit(&state.job.user_id) {
                metrics::counter!(telemetry::RATE_LIMIT_REJECTIONS_TOTAL, "user_id" => state.job.user_id.clone())
                    .increment(1);
                StateMachine::fail(
                    &mut state,
                    FailureReason::RateLimited,
                    format!("{limit_type} limit reached, retry after {}s", retry_after.as_secs()),
                );
                return self.dead_letter(&delivery, state);
            }
            state.job.status = JobStatus::Running;
            self.queue.checkpoint(&delivery, &state)?;
        }

        let mut reviewed = false;
        if state.current_state() == State::AwaitingReview
            && let Some(pending) = state.pending_review.as_mut()
            && pending.decision.is_none()
            && let Some(decision) = self.reviews.decision(&state.job.id)?
        {
            pending.decision = Some(decision);
            reviewed = true;
        }

        let outcome = loop {
            let outcome = self.orchestrator.step(&mut state).await;
            self.queue.checkpoint(&delivery, &state)?;
            if outcome != StepOutcome::Continue {
                break outcome;
            }
        };
        if reviewed {
            self.reviews.clear(&state.job.id)?;
        }

        match outcome {
            StepOutcome::Finished(State::Done) => self.complete(&delivery, state),
            StepOutcome::Finished(_) => self.dead_letter(&delivery, state),
            StepOutcome::Suspended | StepOutcome::Continue => {
                tracing::info!(job_id = %state.job.id, "awaiting review, message left leased");
                Ok(Processed::AwaitingReview)
            }
        }
    }

    fn complete(&self, delivery: &Delivery, mut state: AgentState) -> Result<Processed, ForjaError> {
        let artifacts = ArtifactStore::new(self.orchestrator.context().guardrails);
        match artifacts.commit(&state) {
            Ok(summary) => {
                self.archive(&state)?;
                self.queue.ack(delivery)?;
                record_duration(&state);
                Ok(Processed::Succeeded(summary))
            }
            Err(ArtifactError::Blocked(verdict)) => {
                let reason = match verdict.stage {
                    StageId::ToolAllowlist => FailureReason::ToolNotAllowed,
                    _ => FailureReason::PathTraversal,
                };
                let detail = verdict.reason.unwrap_or_else(|| verdict.stage.to_string());
                StateMachine::fail(&mut state, reason, format!("artifact commit blocked: {detail}"));
                self.dead_letter(delivery, state)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn dead_letter(&self, delivery: &Delivery, mut state: AgentState) -> Result<Processed, ForjaError> {
        let reason = state.failure.unwrap_or(FailureReason::RetryExhausted);
        state.job.status = JobStatus::DeadLettered;
        self.archive(&state)?;
        self.queue.dead_letter(delivery, &state, reason.as_str())?;
        record_duration(&state);
        tracing::warn!(job_id = %state.job.id, %reason, "job dead-lettered");
        Ok(Processed::DeadLettered(reason))
    }

    /// Written before the message is settled, so a failure here leaves the
    /// delivery for another attempt.
    fn archive(&self, state: &AgentState) -> Result<(), ForjaError> {
        if let Some(history) = self.history {
            history.record(state)?;
        }
        Ok(())
    }
}

fn record_duration(state: &AgentState) {
    let elapsed = (Utc::now() - state.job.created_at).num_milliseconds().max(0) as f64 / 1000.0;
    metrics::histogram!(telemetry::JOB_DURATION_SECONDS).record(elapsed);
}
