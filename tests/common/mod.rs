//! Scripted capabilities shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use chorus::dispatch::registry::{ApiFormat, JobApi, ModelDescriptor, Registry};
use chorus::dispatch::{GenerateRequest, Generation, JobBackend, JobSnapshot, JobStatus, TextGenerator};
use chorus::error::ChorusError;
use chorus::outcome::{Citation, QueryOutcome};
use chorus::synthesis::{Summarizer, SynthesisDepth};

pub fn quick(id: &str) -> ModelDescriptor {
    ModelDescriptor::http(id, "test", "http://127.0.0.1:9/v1", "sk-test", ApiFormat::OpenAi)
}

pub fn slow(id: &str) -> ModelDescriptor {
    quick(id).with_slow(true).with_timeout_secs(600)
}

pub fn background(id: &str) -> ModelDescriptor {
    ModelDescriptor::background(id, "openai", JobApi::OpenAiResponses, "sk-test")
        .with_poll_interval_secs(10)
        .with_timeout_secs(1800)
}

pub fn registry(models: Vec<ModelDescriptor>) -> Registry {
    Registry::new(models)
}

pub fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Text generation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    RateLimited,
    Upstream(u16),
    /// Never answers; only a timeout ends the call.
    Hang,
}

pub struct FakeGenerator {
    replies: HashMap<String, (Duration, Reply)>,
    requests: Mutex<Vec<(String, GenerateRequest)>>,
}

impl FakeGenerator {
    pub fn new() -> Self {
        Self {
            replies: HashMap::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer `text` for `model` after `delay_ms`.
    pub fn reply(self, model: &str, delay_ms: u64, text: &str) -> Self {
        self.script(model, delay_ms, Reply::Text(text.to_string()))
    }

    pub fn script(mut self, model: &str, delay_ms: u64, reply: Reply) -> Self {
        self.replies
            .insert(model.to_string(), (Duration::from_millis(delay_ms), reply));
        self
    }

    pub fn requests_for(&self, model: &str) -> Vec<GenerateRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == model)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    async fn generate(
        &self,
        model: &ModelDescriptor,
        req: &GenerateRequest,
    ) -> Result<Generation, ChorusError> {
        self.requests
            .lock()
            .unwrap()
            .push((model.id.clone(), req.clone()));

        let (delay, reply) = self
            .replies
            .get(&model.id)
            .cloned()
            .unwrap_or((Duration::ZERO, Reply::Text(format!("answer from {}", model.id))));
        tokio::time::sleep(delay).await;

        match reply {
            Reply::Text(text) => Ok(Generation {
                text,
                tokens: Some(42),
                request_id: Some(format!("req-{}", model.id)),
            }),
            Reply::RateLimited => Err(ChorusError::RateLimited {
                provider: model.provider.clone(),
            }),
            Reply::Upstream(status) => Err(ChorusError::Upstream {
                provider: model.provider.clone(),
                message: "internal details http://10.0.0.1/secret".to_string(),
                status: Some(status),
            }),
            Reply::Hang => std::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Background jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum PollStep {
    Snapshot(JobSnapshot),
    /// Poll request failed; the job may still be alive.
    Transient,
    Auth,
}

pub fn pending(status: JobStatus) -> PollStep {
    PollStep::Snapshot(JobSnapshot::pending(status))
}

pub fn completed(text: &str, citations: Vec<Citation>) -> PollStep {
    PollStep::Snapshot(JobSnapshot {
        status: JobStatus::Completed,
        output: Some(text.to_string()),
        citations,
        error: None,
    })
}

pub fn ended(status: JobStatus, error: &str) -> PollStep {
    PollStep::Snapshot(JobSnapshot {
        error: Some(error.to_string()),
        ..JobSnapshot::pending(status)
    })
}

pub fn cite(url: &str, title: &str) -> Citation {
    Citation {
        url: url.to_string(),
        title: Some(title.to_string()),
    }
}

/// Replays a poll script per model; the last step repeats once the script runs out.
pub struct FakeJobBackend {
    scripts: HashMap<String, Vec<PollStep>>,
    reject_submit: bool,
    submits: AtomicUsize,
    polls: AtomicUsize,
}

impl FakeJobBackend {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            reject_submit: false,
            submits: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        }
    }

    pub fn script(mut self, model: &str, steps: Vec<PollStep>) -> Self {
        self.scripts.insert(model.to_string(), steps);
        self
    }

    pub fn rejecting_submit(mut self) -> Self {
        self.reject_submit = true;
        self
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobBackend for FakeJobBackend {
    async fn submit(&self, model: &ModelDescriptor, _prompt: &str) -> Result<String, ChorusError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if self.reject_submit {
            return Err(ChorusError::Upstream {
                provider: model.provider.clone(),
                message: "launch failed".to_string(),
                status: Some(500),
            });
        }
        Ok(format!("job-{}", model.id))
    }

    async fn poll(&self, model: &ModelDescriptor, job_id: &str) -> Result<JobSnapshot, ChorusError> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst);
        let steps = self
            .scripts
            .get(&model.id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let Some(step) = steps.get(n).or_else(|| steps.last()) else {
            return Ok(JobSnapshot::pending(JobStatus::InProgress));
        };
        match step.clone() {
            PollStep::Snapshot(snapshot) => Ok(snapshot),
            PollStep::Transient => Err(ChorusError::PollFailed {
                provider: model.provider.clone(),
                job_id: job_id.to_string(),
                message: "connection reset".to_string(),
            }),
            PollStep::Auth => Err(ChorusError::AuthFailed {
                provider: model.provider.clone(),
                message: "HTTP 401".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

/// Records every call; text names the models it combined. `delay_for` maps the number
/// of successes handed in to how long the call takes.
pub struct RecordingSummarizer {
    delay_for: Box<dyn Fn(usize) -> Duration + Send + Sync>,
    fail: bool,
    calls: Mutex<Vec<Vec<String>>>,
}

impl RecordingSummarizer {
    pub fn new() -> Self {
        Self {
            delay_for: Box::new(|_| Duration::ZERO),
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, f: impl Fn(usize) -> Duration + Send + Sync + 'static) -> Self {
        self.delay_for = Box::new(f);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Summarizer for RecordingSummarizer {
    async fn summarize(
        &self,
        _prompt: &str,
        outcomes: &[QueryOutcome],
        _depth: SynthesisDepth,
    ) -> Result<String, ChorusError> {
        let models: Vec<String> = outcomes.iter().map(|o| o.model.clone()).collect();
        self.calls.lock().unwrap().push(models.clone());
        tokio::time::sleep((self.delay_for)(outcomes.len())).await;
        if self.fail {
            return Err(ChorusError::Other("summarizer unavailable".to_string()));
        }
        Ok(format!("combined view of {}", models.join(" + ")))
    }
}
