use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{Id as TaskId, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::dispatch::ImageAttachment;
use crate::dispatch::registry::{ModelDescriptor, Registry, Tier};
use crate::document::{DocumentMeta, LiveDocument, SectionUpdate};
use crate::error::ChorusError;
use crate::invoker::Invoker;
use crate::outcome::QueryOutcome;
use crate::poller::{JobPoller, JobProgressEvent};
use crate::progress::{ProgressDisplay, ProgressState, ProgressTracker};
use crate::synthesis::{Stage, StageManager, SynthesisRecord, TierEvaluator};

/// Everything one run needs besides the models' own configuration.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub prompt: String,
    pub models: Vec<String>,
    /// Replaces the registry timeout of quick models.
    pub default_timeout: Option<Duration>,
    /// Per-model timeouts; win over everything else.
    pub model_timeouts: HashMap<String, Duration>,
    pub image: Option<ImageAttachment>,
    pub meta: DocumentMeta,
    /// Progress display interval; `None` disables the display.
    pub render_interval: Option<Duration>,
}

impl QueryRequest {
    pub fn new(prompt: impl Into<String>, models: Vec<String>) -> Self {
        Self {
            prompt: prompt.into(),
            models,
            ..Default::default()
        }
    }

    pub fn timeout_for(&self, model: &ModelDescriptor) -> Duration {
        if let Some(t) = self.model_timeouts.get(&model.id) {
            return *t;
        }
        match (model.tier(), self.default_timeout) {
            (Tier::Quick, Some(t)) => t,
            _ => model.timeout(),
        }
    }
}

/// Result of one run, in the caller's requested order.
#[derive(Debug, Clone, Serialize)]
pub struct QueryRun {
    pub prompt: String,
    pub started_at: DateTime<Utc>,
    pub outcomes: Vec<QueryOutcome>,
    pub unresolved: Vec<String>,
    pub stages: Vec<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<SynthesisRecord>,
    pub elapsed_ms: u64,
}

impl QueryRun {
    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }
}

/// Fans one prompt out to every requested model across the three tiers.
pub struct Orchestrator {
    registry: Arc<Registry>,
    invoker: Arc<Invoker>,
    poller: Arc<JobPoller>,
}

/// Mutable state of one run, owned by the collection loop.
struct RunState<'a> {
    models: &'a [ModelDescriptor],
    slots: Vec<Option<QueryOutcome>>,
    tracker: ProgressTracker,
    evaluator: TierEvaluator,
    stages: Vec<Stage>,
    start: Instant,
}

impl RunState<'_> {
    fn known_outcomes(&self) -> Vec<QueryOutcome> {
        self.slots.iter().flatten().cloned().collect()
    }

    /// Run the tier evaluator and record what fired. Returns the stage to synthesize:
    /// when several triggers fire at once they capture the same outcomes, so only the
    /// last one is worth a synthesis.
    fn fire_triggers(&mut self) -> Option<(Stage, Vec<QueryOutcome>)> {
        let fired = self.evaluator.evaluate(&self.tracker);
        if fired.is_empty() {
            return None;
        }

        let subset = self.known_outcomes();
        let models: Vec<String> = subset.iter().map(|o| o.model.clone()).collect();
        let fired_at_ms = self.start.elapsed().as_millis() as u64;

        let mut last = None;
        for (trigger, seq, is_final) in fired {
            tracing::info!(
                trigger = trigger.as_str(),
                outcomes = models.len(),
                fired_at_ms,
                is_final,
                "tier complete"
            );
            let stage = Stage {
                trigger,
                seq,
                is_final,
                fired_at_ms,
                models: models.clone(),
            };
            self.stages.push(stage.clone());
            last = Some(stage);
        }
        last.map(|stage| (stage, subset))
    }
}

impl Orchestrator {
    pub fn new(registry: Arc<Registry>, invoker: Arc<Invoker>, poller: Arc<JobPoller>) -> Self {
        Self {
            registry,
            invoker,
            poller,
        }
    }

    pub async fn run(
        &self,
        req: &QueryRequest,
        document: Arc<LiveDocument>,
        synthesis: Option<Arc<StageManager>>,
    ) -> Result<QueryRun, ChorusError> {
        let started_at = Utc::now();
        let start = Instant::now();

        let resolution = self.registry.resolve(&req.models);
        if resolution.resolved.is_empty() {
            return Err(ChorusError::NoModels {
                requested: req.models.clone(),
            });
        }
        let models = resolution.resolved;

        let ids: Vec<String> = models.iter().map(|m| m.id.clone()).collect();
        let meta = DocumentMeta {
            started_at: req.meta.started_at.or(Some(started_at)),
            ..req.meta.clone()
        };
        document.init(&req.prompt, &ids, &meta).await?;

        let mut state = RunState {
            models: &models,
            slots: vec![None; models.len()],
            tracker: ProgressTracker::new(models.iter().map(|m| (m.id.as_str(), m.tier()))),
            evaluator: TierEvaluator::new(),
            stages: Vec::new(),
            start,
        };

        let prompt: Arc<str> = Arc::from(req.prompt.as_str());
        let image = Arc::new(req.image.clone());
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<JobProgressEvent>();

        let mut set = JoinSet::new();
        // Track task ID → slot for panic attribution
        let mut task_slots: HashMap<TaskId, usize> = HashMap::new();

        // Background jobs first: they run independently of everything else.
        let launch_order = models
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_background())
            .chain(models.iter().enumerate().filter(|(_, m)| !m.is_background()));

        for (idx, model) in launch_order {
            let model = model.clone();
            let prompt = prompt.clone();
            let tier = model.tier();

            let handle = if model.is_background() {
                let poller = self.poller.clone();
                let tx = progress_tx.clone();
                set.spawn(async move {
                    let on_progress = move |event: JobProgressEvent| {
                        let _ = tx.send(event);
                    };
                    let outcome = poller.run_job(&model, &prompt, &on_progress).await;
                    (idx, outcome)
                })
            } else {
                let invoker = self.invoker.clone();
                let image = image.clone();
                let timeout = req.timeout_for(&model);
                set.spawn(async move {
                    let outcome = invoker
                        .invoke(&model, &prompt, timeout, (*image).as_ref())
                        .await;
                    (idx, outcome)
                })
            };
            task_slots.insert(handle.id(), idx);

            let id = &models[idx].id;
            state.tracker.set_status(id, ProgressState::Querying);
            document
                .update_model_section(id, SectionUpdate::Querying(tier))
                .await?;
        }
        // Only the background tasks hold senders now; the channel closes when they finish.
        drop(progress_tx);

        let mut stage_tasks = JoinSet::new();
        let mut schedule = |fired: Option<(Stage, Vec<QueryOutcome>)>| {
            if let (Some((stage, subset)), Some(manager)) = (fired, synthesis.as_ref()) {
                let manager = manager.clone();
                stage_tasks.spawn(async move { manager.maybe_synthesize(&stage, &subset).await });
            }
        };

        // Tiers with no members complete vacuously at launch.
        schedule(state.fire_triggers());

        let mut ticker = req.render_interval.map(|d| {
            let mut interval = tokio::time::interval(d);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        let mut display = ProgressDisplay::for_stderr();

        loop {
            tokio::select! {
                biased; // drain job progress before the completion it precedes
                Some(event) = progress_rx.recv() => {
                    tracing::debug!(
                        model = event.model,
                        status = event.status.as_str(),
                        elapsed_ms = event.elapsed.as_millis() as u64,
                        "job progress"
                    );
                    document
                        .update_model_section(&event.model, SectionUpdate::Job(&event))
                        .await?;
                }
                joined = set.join_next() => {
                    let (idx, outcome) = match joined {
                        None => break,
                        Some(Ok(done)) => done,
                        // Attribute panics to the correct model via task ID.
                        Some(Err(join_err)) => {
                            let Some(&idx) = task_slots.get(&join_err.id()) else {
                                tracing::error!("untracked task failed: {join_err}");
                                continue;
                            };
                            let model = &state.models[idx];
                            tracing::error!(model = model.id, "model task failed: {join_err}");
                            let reason = if join_err.is_panic() { "panic" } else { "cancelled" };
                            let outcome = QueryOutcome::error(
                                &model.id,
                                &model.provider,
                                format!("task failed: {join_err}"),
                                reason,
                            )
                            .with_latency(start.elapsed().as_millis() as u64);
                            (idx, outcome)
                        }
                    };

                    let fired = Self::record(&mut state, idx, outcome.clone());
                    document
                        .update_model_section(&outcome.model, SectionUpdate::Outcome(&outcome))
                        .await?;
                    schedule(fired);
                }
                _ = next_tick(&mut ticker) => {
                    display.tick(&state.tracker, &mut std::io::stderr().lock());
                }
            }
        }

        if ticker.is_some() {
            display.tick(&state.tracker, &mut std::io::stderr().lock());
        }

        // Synthesis stages may still be running; the final one must land before we return.
        while let Some(joined) = stage_tasks.join_next().await {
            match joined {
                Ok(result) => {
                    result?;
                }
                Err(e) => tracing::error!("synthesis task failed: {e}"),
            }
        }

        let synthesis = match synthesis {
            Some(ref manager) => manager.latest().await,
            None => None,
        };

        let RunState { slots, stages, .. } = state;
        let outcomes: Vec<QueryOutcome> = slots.into_iter().flatten().collect();
        debug_assert_eq!(outcomes.len(), models.len());

        Ok(QueryRun {
            prompt: req.prompt.clone(),
            started_at,
            outcomes,
            unresolved: resolution.unresolved,
            stages,
            synthesis,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Store a terminal outcome, advance the tracker and evaluate the tier triggers.
    fn record(
        state: &mut RunState<'_>,
        idx: usize,
        outcome: QueryOutcome,
    ) -> Option<(Stage, Vec<QueryOutcome>)> {
        if state.slots[idx].is_some() {
            tracing::warn!(model = outcome.model, "duplicate outcome ignored");
            return None;
        }
        state
            .tracker
            .set_status(&outcome.model, ProgressState::from(outcome.status));
        state.slots[idx] = Some(outcome);
        state.fire_triggers()
    }
}

/// Next render tick, or never when the display is disabled.
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
