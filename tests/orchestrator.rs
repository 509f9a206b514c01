mod common;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chorus::dispatch::registry::ModelDescriptor;
use chorus::dispatch::{ImageAttachment, JobStatus};
use chorus::document::LiveDocument;
use chorus::error::ChorusError;
use chorus::invoker::Invoker;
use chorus::orchestrator::{Orchestrator, QueryRequest};
use chorus::outcome::OutcomeStatus;
use chorus::poller::JobPoller;
use chorus::synthesis::{StageManager, SynthesisDepth, Trigger};
use common::{
    FakeGenerator, FakeJobBackend, RecordingSummarizer, Reply, background, cite, completed, ids,
    pending, quick, registry, slow,
};
use tokio_test::{assert_err, assert_ok};

struct Harness {
    orchestrator: Orchestrator,
    document: Arc<LiveDocument>,
    generator: Arc<FakeGenerator>,
    backend: Arc<FakeJobBackend>,
    _dir: tempfile::TempDir,
}

fn harness(models: Vec<ModelDescriptor>, generator: FakeGenerator, backend: FakeJobBackend) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let generator = Arc::new(generator);
    let backend = Arc::new(backend);
    let orchestrator = Orchestrator::new(
        Arc::new(registry(models)),
        Arc::new(Invoker::new(generator.clone())),
        Arc::new(JobPoller::new(backend.clone())),
    );
    Harness {
        orchestrator,
        document: Arc::new(LiveDocument::new(dir.path().join("out.md"), 1000)),
        generator,
        backend,
        _dir: dir,
    }
}

fn three_tier_models() -> Vec<ModelDescriptor> {
    vec![quick("fast-a"), quick("fast-b"), slow("slow-c")]
}

fn three_tier_generator() -> FakeGenerator {
    FakeGenerator::new()
        .reply("fast-a", 1000, "A")
        .reply("fast-b", 2000, "B")
        .reply("slow-c", 5000, "C")
}

#[tokio::test(start_paused = true)]
async fn preliminary_then_final_synthesis_across_tiers() {
    let h = harness(three_tier_models(), three_tier_generator(), FakeJobBackend::new());
    let summarizer = Arc::new(RecordingSummarizer::new());
    let manager = Arc::new(StageManager::new(
        summarizer.clone(),
        h.document.clone(),
        "Which is best?",
        SynthesisDepth::Executive,
    ));
    let req = QueryRequest::new("Which is best?", ids(&["fast-a", "fast-b", "slow-c"]));

    let run = h
        .orchestrator
        .run(&req, h.document.clone(), Some(manager))
        .await
        .unwrap();

    assert_eq!(run.success_count(), 3);
    assert_eq!(run.stages.len(), 2);

    let fast = &run.stages[0];
    assert_eq!(fast.trigger, Trigger::FastComplete);
    assert!(!fast.is_final);
    assert_eq!(fast.models, ids(&["fast-a", "fast-b"]));
    assert!((2000..2100).contains(&fast.fired_at_ms), "fired at {}", fast.fired_at_ms);

    let sync = &run.stages[1];
    assert_eq!(sync.trigger, Trigger::SyncComplete);
    assert!(sync.is_final);
    assert_eq!(sync.models, ids(&["fast-a", "fast-b", "slow-c"]));
    assert!((5000..5100).contains(&sync.fired_at_ms), "fired at {}", sync.fired_at_ms);

    assert_eq!(
        summarizer.calls(),
        vec![ids(&["fast-a", "fast-b"]), ids(&["fast-a", "fast-b", "slow-c"])]
    );

    let synthesis = run.synthesis.unwrap();
    assert_eq!(synthesis.trigger, Trigger::SyncComplete);
    assert!(!synthesis.preliminary);

    let text = tokio::fs::read_to_string(h.document.path()).await.unwrap();
    assert_eq!(text.matches("## Synthesis").count(), 1);
    assert!(text.contains("## Synthesis (final, after all direct models: 3 of 3 responses)"));
    assert!(text.contains("combined view of fast-a + fast-b + slow-c"));
}

#[tokio::test(start_paused = true)]
async fn fast_tier_error_counts_toward_fast_completion() {
    let generator = FakeGenerator::new()
        .reply("fast-a", 1000, "A")
        .script("fast-b", 2000, Reply::Upstream(502))
        .reply("slow-c", 30_000, "C");
    let h = harness(three_tier_models(), generator, FakeJobBackend::new());
    let summarizer = Arc::new(RecordingSummarizer::new());
    let manager = Arc::new(StageManager::new(
        summarizer.clone(),
        h.document.clone(),
        "Which is best?",
        SynthesisDepth::Executive,
    ));
    let req = QueryRequest::new("Which is best?", ids(&["fast-a", "fast-b", "slow-c"]));

    let run = h
        .orchestrator
        .run(&req, h.document.clone(), Some(manager))
        .await
        .unwrap();

    assert_eq!(run.stages.len(), 2);
    let fast = &run.stages[0];
    assert_eq!(fast.trigger, Trigger::FastComplete);
    assert!(!fast.is_final);
    assert_eq!(fast.models, ids(&["fast-a", "fast-b"]));
    assert!((2000..2100).contains(&fast.fired_at_ms), "fired at {}", fast.fired_at_ms);

    let sync = &run.stages[1];
    assert_eq!(sync.trigger, Trigger::SyncComplete);
    assert!(sync.is_final);
    assert_eq!(sync.models, ids(&["fast-a", "fast-b", "slow-c"]));
    assert!((30_000..30_100).contains(&sync.fired_at_ms), "fired at {}", sync.fired_at_ms);

    assert_eq!(run.outcomes[1].status, OutcomeStatus::Error);
    assert_eq!(run.outcomes[1].reason.as_deref(), Some("upstream"));

    // Only successes reach the summarizer.
    assert_eq!(
        summarizer.calls(),
        vec![ids(&["fast-a"]), ids(&["fast-a", "slow-c"])]
    );

    let text = tokio::fs::read_to_string(h.document.path()).await.unwrap();
    assert!(text.contains("## Synthesis (final, after all direct models: 2 of 3 responses)"));
}

#[tokio::test(start_paused = true)]
async fn outcomes_follow_request_order_not_completion_order() {
    let h = harness(three_tier_models(), three_tier_generator(), FakeJobBackend::new());
    let req = QueryRequest::new("q", ids(&["slow-c", "fast-b", "fast-a"]));

    let run = h.orchestrator.run(&req, h.document.clone(), None).await.unwrap();

    let order: Vec<&str> = run.outcomes.iter().map(|o| o.model.as_str()).collect();
    assert_eq!(order, vec!["slow-c", "fast-b", "fast-a"]);
    assert!(run.synthesis.is_none());
    assert!((5000..5100).contains(&run.elapsed_ms));

    let text = tokio::fs::read_to_string(h.document.path()).await.unwrap();
    let c = text.find("## slow-c").unwrap();
    let b = text.find("## fast-b").unwrap();
    let a = text.find("## fast-a").unwrap();
    assert!(c < b && b < a);
}

#[tokio::test(start_paused = true)]
async fn failures_and_timeouts_are_outcomes_not_errors() {
    let generator = FakeGenerator::new()
        .reply("fast-a", 100, "fine")
        .script("fast-b", 0, Reply::Hang)
        .script("slow-c", 50, Reply::RateLimited);
    let h = harness(three_tier_models(), generator, FakeJobBackend::new());
    let mut req = QueryRequest::new("q", ids(&["fast-a", "fast-b", "slow-c"]));
    req.default_timeout = Some(Duration::from_secs(2));

    let run = h.orchestrator.run(&req, h.document.clone(), None).await.unwrap();

    let statuses: Vec<OutcomeStatus> = run.outcomes.iter().map(|o| o.status).collect();
    assert_eq!(
        statuses,
        vec![OutcomeStatus::Success, OutcomeStatus::Timeout, OutcomeStatus::Error]
    );
    let timed_out = run.outcomes[1].latency_ms.unwrap();
    assert!((2000..2100).contains(&timed_out), "latency {timed_out}");
    assert_eq!(run.outcomes[2].reason.as_deref(), Some("rate_limited"));
}

#[tokio::test(start_paused = true)]
async fn per_model_timeouts_win_and_default_timeout_spares_slow_models() {
    let generator = FakeGenerator::new()
        .script("fast-a", 0, Reply::Hang)
        .script("fast-b", 0, Reply::Hang)
        .reply("slow-c", 8000, "took a while");
    let h = harness(three_tier_models(), generator, FakeJobBackend::new());
    let mut req = QueryRequest::new("q", ids(&["fast-a", "fast-b", "slow-c"]));
    req.default_timeout = Some(Duration::from_secs(3));
    req.model_timeouts = HashMap::from([("fast-a".to_string(), Duration::from_secs(1))]);

    let run = h.orchestrator.run(&req, h.document.clone(), None).await.unwrap();

    let a = run.outcomes[0].latency_ms.unwrap();
    let b = run.outcomes[1].latency_ms.unwrap();
    assert!((1000..1100).contains(&a), "fast-a {a}");
    assert!((3000..3100).contains(&b), "fast-b {b}");
    assert!(run.outcomes[2].is_success(), "slow model keeps its own timeout");
}

#[tokio::test(start_paused = true)]
async fn background_job_runs_alongside_direct_models() {
    let backend = FakeJobBackend::new().script(
        "deep",
        vec![
            pending(JobStatus::Queued),
            pending(JobStatus::InProgress),
            completed(
                "deep findings",
                vec![cite("https://x.example", "X"), cite("https://x.example", "X")],
            ),
        ],
    );
    let generator = FakeGenerator::new().reply("fast-a", 1000, "quick take");
    let h = harness(vec![quick("fast-a"), background("deep")], generator, backend);
    let summarizer = Arc::new(RecordingSummarizer::new());
    let manager = Arc::new(StageManager::new(
        summarizer.clone(),
        h.document.clone(),
        "q",
        SynthesisDepth::Full,
    ));
    let req = QueryRequest::new("q", ids(&["fast-a", "deep"]));

    let run = h
        .orchestrator
        .run(&req, h.document.clone(), Some(manager))
        .await
        .unwrap();

    assert_eq!(h.backend.submits(), 1);
    assert_eq!(h.generator.requests_for("deep").len(), 0, "background models never go through the invoker");

    let triggers: Vec<Trigger> = run.stages.iter().map(|s| s.trigger).collect();
    assert_eq!(
        triggers,
        vec![Trigger::FastComplete, Trigger::SyncComplete, Trigger::AsyncComplete]
    );
    assert!(run.stages[0].fired_at_ms < 1100);
    assert!(run.stages[2].is_final);
    assert!((30_000..30_500).contains(&run.stages[2].fired_at_ms));

    // Fast and sync fired together: one synthesis for both.
    assert_eq!(
        summarizer.calls(),
        vec![ids(&["fast-a"]), ids(&["fast-a", "deep"])]
    );

    let deep = &run.outcomes[1];
    assert!(deep.is_success());
    assert_eq!(deep.citations.len(), 1);

    let text = tokio::fs::read_to_string(h.document.path()).await.unwrap();
    assert!(text.contains("deep findings"));
    assert!(text.contains("(final, after deep research: 2 of 2 responses)"));
    assert!(!text.contains("Research job"), "progress must not overwrite the final outcome");
}

#[tokio::test(start_paused = true)]
async fn unknown_models_are_reported_and_skipped() {
    let h = harness(three_tier_models(), three_tier_generator(), FakeJobBackend::new());
    let req = QueryRequest::new("q", ids(&["fast-a", "mystery", "fast-a"]));

    let run = assert_ok!(h.orchestrator.run(&req, h.document.clone(), None).await);

    assert_eq!(run.outcomes.len(), 1);
    assert_eq!(run.unresolved, ids(&["mystery"]));
    assert_eq!(h.generator.call_count(), 1, "duplicates are queried once");
}

#[tokio::test]
async fn nothing_resolvable_fails_before_any_work() {
    let h = harness(three_tier_models(), three_tier_generator(), FakeJobBackend::new());
    let req = QueryRequest::new("q", ids(&["mystery", "ghost"]));

    let err = assert_err!(h.orchestrator.run(&req, h.document.clone(), None).await);

    assert!(matches!(err, ChorusError::NoModels { ref requested } if requested.len() == 2));
    assert!(err.is_fatal());
    assert_eq!(h.generator.call_count(), 0);
    assert!(!h.document.path().exists());
}

#[tokio::test(start_paused = true)]
async fn image_reaches_only_vision_models() {
    let models = vec![quick("eyes").with_vision(true), quick("blind")];
    let h = harness(models, FakeGenerator::new(), FakeJobBackend::new());
    let mut req = QueryRequest::new("describe", ids(&["eyes", "blind"]));
    req.image = Some(ImageAttachment::from_bytes(Path::new("photo.jpg"), "image/jpeg", b"jpg"));

    let run = h.orchestrator.run(&req, h.document.clone(), None).await.unwrap();

    assert_eq!(run.success_count(), 2);
    assert!(h.generator.requests_for("eyes")[0].image.is_some());
    let blind = &h.generator.requests_for("blind")[0];
    assert!(blind.image.is_none());
    assert!(blind.prompt.contains("photo.jpg"));
}

#[tokio::test(start_paused = true)]
async fn synthesis_is_skipped_when_every_model_fails() {
    let generator = FakeGenerator::new()
        .script("fast-a", 10, Reply::Upstream(500))
        .script("fast-b", 10, Reply::Upstream(503));
    let h = harness(vec![quick("fast-a"), quick("fast-b")], generator, FakeJobBackend::new());
    let summarizer = Arc::new(RecordingSummarizer::new());
    let manager = Arc::new(StageManager::new(
        summarizer.clone(),
        h.document.clone(),
        "q",
        SynthesisDepth::Brief,
    ));
    let req = QueryRequest::new("q", ids(&["fast-a", "fast-b"]));

    let run = h
        .orchestrator
        .run(&req, h.document.clone(), Some(manager))
        .await
        .unwrap();

    assert_eq!(run.success_count(), 0);
    assert_eq!(run.stages.len(), 2);
    assert!(run.synthesis.is_none());
    assert!(summarizer.calls().is_empty());
}
