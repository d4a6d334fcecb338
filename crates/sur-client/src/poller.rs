//! Job poller: drives one job from `submitted` to a terminal state.
//!
//! ```text
//!   Idle ──► Querying ──► Completed            (status = completed)
//!              │   ▲  ├─► Failed(message)      (status = failed)
//!              │   │  └─► Errored(PollingError) (transport / parse failure)
//!              ▼   │
//!            Waiting ─────► Cancelled          (token fired)
//! ```
//!
//! Exactly one status query is in flight at a time: the next one is only
//! scheduled after the previous one resolved.  The cancellation token is
//! checked before every query and raced against every wait, so an abandoned
//! job leaves no pending timer behind.  Query failures are terminal and are
//! not retried.
//!
//! The poller is the only writer of the job snapshot; observers subscribe to
//! a `watch` channel.
use std::time::Duration;

use sur_proto::protocol::{JobStatus, SeparationJob};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::StatusSource;
use crate::error::PollingError;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum PollPhase {
    #[default]
    Idle,
    Querying,
    Waiting,
    Completed,
    Failed(String),
    Errored(PollingError),
    Cancelled,
}

impl PollPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PollPhase::Completed | PollPhase::Failed(_) | PollPhase::Errored(_) | PollPhase::Cancelled
        )
    }
}

/// What observers see: the latest job as reported and where the poller is.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobSnapshot {
    pub job: Option<SeparationJob>,
    pub phase: PollPhase,
    pub queries: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed(SeparationJob),
    /// The server reported `failed`; the message is passed through verbatim.
    Failed(String),
    Errored(PollingError),
    Cancelled,
}

pub struct JobPoller<S> {
    source: S,
    interval: Duration,
    snapshot_tx: watch::Sender<JobSnapshot>,
}

impl<S: StatusSource> JobPoller<S> {
    pub fn new(source: S, interval: Duration) -> Self {
        let (snapshot_tx, _) = watch::channel(JobSnapshot::default());
        Self {
            source,
            interval,
            snapshot_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Poll `job_id` until it settles.  `on_complete` runs at most once, with
    /// the final job, and only for a completed job.
    pub async fn run<F>(&self, job_id: &str, cancel: &CancellationToken, on_complete: F) -> PollOutcome
    where
        F: FnOnce(&SeparationJob),
    {
        self.drive(job_id, None, cancel, on_complete).await
    }

    /// Continue from a job returned by the upload.  A job that is already
    /// terminal settles without any query.
    pub async fn resume<F>(
        &self,
        job: SeparationJob,
        cancel: &CancellationToken,
        on_complete: F,
    ) -> PollOutcome
    where
        F: FnOnce(&SeparationJob),
    {
        let job_id = job.job_id.clone();
        self.drive(&job_id, Some(job), cancel, on_complete).await
    }

    async fn drive<F>(
        &self,
        job_id: &str,
        mut pending: Option<SeparationJob>,
        cancel: &CancellationToken,
        on_complete: F,
    ) -> PollOutcome
    where
        F: FnOnce(&SeparationJob),
    {
        let mut on_complete = Some(on_complete);
        let mut best_progress: Option<f32> = None;
        self.snapshot_tx.send_replace(JobSnapshot {
            job: pending.clone(),
            phase: PollPhase::Idle,
            queries: 0,
        });

        loop {
            let job = match pending.take() {
                Some(job) => job,
                None => {
                    if cancel.is_cancelled() {
                        return self.finish(PollPhase::Cancelled, PollOutcome::Cancelled);
                    }
                    self.set_phase(PollPhase::Querying);
                    let result = tokio::select! {
                        _ = cancel.cancelled() => {
                            return self.finish(PollPhase::Cancelled, PollOutcome::Cancelled);
                        }
                        result = self.source.job_status(job_id) => result,
                    };
                    self.snapshot_tx.send_modify(|s| s.queries += 1);

                    match result {
                        Ok(job) => job,
                        Err(e) => {
                            warn!("poller: status query for {} failed: {}", job_id, e);
                            return self.finish(PollPhase::Errored(e.clone()), PollOutcome::Errored(e));
                        }
                    }
                }
            };

            let job = hold_progress(job, &mut best_progress);
            debug!(
                "poller: {} status={} progress={:?}",
                job_id,
                job.status,
                job.progress()
            );

            match job.status {
                JobStatus::Completed => {
                    info!("poller: {} completed", job_id);
                    self.snapshot_tx.send_modify(|s| {
                        s.job = Some(job.clone());
                        s.phase = PollPhase::Completed;
                    });
                    if let Some(callback) = on_complete.take() {
                        callback(&job);
                    }
                    return PollOutcome::Completed(job);
                }
                JobStatus::Failed => {
                    let message = job
                        .failure_message()
                        .unwrap_or_else(|| "processing failed".to_string());
                    warn!("poller: {} failed: {}", job_id, message);
                    self.snapshot_tx.send_modify(|s| {
                        s.job = Some(job.clone());
                        s.phase = PollPhase::Failed(message.clone());
                    });
                    return PollOutcome::Failed(message);
                }
                // Submitted, processing and anything unrecognised keep polling.
                _ => {
                    self.snapshot_tx.send_modify(|s| {
                        s.job = Some(job);
                        s.phase = PollPhase::Waiting;
                    });
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return self.finish(PollPhase::Cancelled, PollOutcome::Cancelled);
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    fn set_phase(&self, phase: PollPhase) {
        self.snapshot_tx.send_modify(|s| s.phase = phase);
    }

    fn finish(&self, phase: PollPhase, outcome: PollOutcome) -> PollOutcome {
        if outcome == PollOutcome::Cancelled {
            info!("poller: cancelled");
        }
        self.set_phase(phase);
        outcome
    }
}

/// Keep reported progress non-decreasing while the job is still running.
fn hold_progress(mut job: SeparationJob, best: &mut Option<f32>) -> SeparationJob {
    if job.status.is_terminal() {
        return job;
    }
    match (job.progress(), *best) {
        (Some(p), Some(b)) if p < b => job.progress = Some(b),
        (Some(p), _) => *best = Some(p),
        (None, Some(b)) => job.progress = Some(b),
        (None, None) => {}
    }
    job
}
