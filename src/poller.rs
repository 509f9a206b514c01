use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::dispatch::registry::ModelDescriptor;
use crate::dispatch::{JobBackend, JobStatus};
use crate::error::ChorusError;
use crate::outcome::QueryOutcome;

/// Max consecutive poll failures before giving up on a job.
pub const MAX_POLL_FAILURES: u32 = 5;

/// Progress of a background job, emitted once per poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobProgressEvent {
    pub model: String,
    pub status: JobStatus,
    pub elapsed: Duration,
    pub job_id: String,
}

/// Drives submit-then-poll background jobs to a single outcome.
pub struct JobPoller {
    backend: Arc<dyn JobBackend>,
}

impl JobPoller {
    pub fn new(backend: Arc<dyn JobBackend>) -> Self {
        Self { backend }
    }

    /// Submit one job and poll it until it finishes or the model's max-wait budget runs out.
    /// The job is submitted exactly once.
    pub async fn run_job(
        &self,
        model: &ModelDescriptor,
        prompt: &str,
        on_progress: &(dyn Fn(JobProgressEvent) + Send + Sync),
    ) -> QueryOutcome {
        let start = Instant::now();
        let deadline = start + model.timeout();

        // Set once submission succeeds, so a timeout can still name the remote job.
        let submitted = OnceLock::new();
        let work = self.submit_and_poll(model, prompt, start, &submitted, on_progress);

        tokio::select! {
            outcome = work => outcome,
            _ = tokio::time::sleep_until(deadline) => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                let job_id = submitted.get().cloned();
                tracing::warn!(
                    model = model.id,
                    job_id = job_id.as_deref(),
                    elapsed_ms,
                    "background job exceeded its max wait"
                );
                QueryOutcome::timeout(&model.id, &model.provider, elapsed_ms).with_request_id(job_id)
            }
        }
    }

    async fn submit_and_poll(
        &self,
        model: &ModelDescriptor,
        prompt: &str,
        start: Instant,
        submitted: &OnceLock<String>,
        on_progress: &(dyn Fn(JobProgressEvent) + Send + Sync),
    ) -> QueryOutcome {
        let elapsed_ms = || start.elapsed().as_millis() as u64;

        let job_id = match self.backend.submit(model, prompt).await {
            Ok(id) => {
                let _ = submitted.set(id.clone());
                id
            }
            Err(e) => {
                tracing::warn!(model = model.id, "background job submission failed: {e}");
                return QueryOutcome::from_error(&model.id, &model.provider, &e, elapsed_ms());
            }
        };

        let interval = model.poll_interval();
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::time::sleep(interval).await;

            let snapshot = match self.backend.poll(model, &job_id).await {
                Ok(snapshot) => {
                    consecutive_failures = 0;
                    snapshot
                }
                // Auth failures are not transient
                Err(e @ ChorusError::AuthFailed { .. }) => {
                    return QueryOutcome::from_error(&model.id, &model.provider, &e, elapsed_ms())
                        .with_request_id(Some(job_id));
                }
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        model = model.id,
                        job_id = job_id,
                        failures = consecutive_failures,
                        "poll failed: {e}"
                    );
                    if consecutive_failures >= MAX_POLL_FAILURES {
                        let err = ChorusError::PollFailed {
                            provider: model.provider.clone(),
                            job_id: job_id.clone(),
                            message: format!("{consecutive_failures} consecutive failures: {e}"),
                        };
                        return QueryOutcome::from_error(&model.id, &model.provider, &err, elapsed_ms())
                            .with_request_id(Some(job_id));
                    }
                    continue;
                }
            };

            on_progress(JobProgressEvent {
                model: model.id.clone(),
                status: snapshot.status,
                elapsed: start.elapsed(),
                job_id: job_id.clone(),
            });

            match snapshot.status {
                JobStatus::Queued | JobStatus::InProgress => {
                    tracing::debug!(
                        model = model.id,
                        job_id = job_id,
                        status = snapshot.status.as_str(),
                        elapsed_ms = elapsed_ms(),
                        "job still running"
                    );
                }
                JobStatus::Completed => {
                    tracing::info!(
                        model = model.id,
                        job_id = job_id,
                        elapsed_ms = elapsed_ms(),
                        citations = snapshot.citations.len(),
                        "background job completed"
                    );
                    let text = snapshot.output.unwrap_or_default();
                    if text.trim().is_empty() {
                        return QueryOutcome::error(
                            &model.id,
                            &model.provider,
                            "job completed without any output".to_string(),
                            "job_failed",
                        )
                        .with_latency(elapsed_ms())
                        .with_request_id(Some(job_id));
                    }
                    return QueryOutcome::success(&model.id, &model.provider, text, elapsed_ms())
                        .with_request_id(Some(job_id))
                        .with_citations(snapshot.citations);
                }
                JobStatus::Failed | JobStatus::Cancelled => {
                    let message = snapshot
                        .error
                        .unwrap_or_else(|| format!("job {}", snapshot.status.as_str()));
                    tracing::warn!(
                        model = model.id,
                        job_id = job_id,
                        status = snapshot.status.as_str(),
                        "background job ended without a result: {message}"
                    );
                    let err = ChorusError::AsyncJobFailed {
                        provider: model.provider.clone(),
                        message,
                    };
                    return QueryOutcome::from_error(&model.id, &model.provider, &err, elapsed_ms())
                        .with_request_id(Some(job_id));
                }
            }
        }
    }
}
