use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::dispatch::registry::{ModelDescriptor, Tier};
use crate::dispatch::{GenerateRequest, TextGenerator};
use crate::document::LiveDocument;
use crate::error::ChorusError;
use crate::outcome::QueryOutcome;
use crate::progress::ProgressTracker;

/// How much detail the synthesis should go into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisDepth {
    Brief,
    #[default]
    Executive,
    Full,
}

impl SynthesisDepth {
    fn instructions(&self) -> &'static str {
        match self {
            Self::Brief => {
                "Write 3 to 5 short bullet points capturing the combined answer. \
                 Mention a disagreement only if it changes the answer."
            }
            Self::Executive => {
                "Write an executive summary under 400 words with three parts: \
                 where the models agree, where they disagree (name the models), \
                 and a clear bottom-line recommendation."
            }
            Self::Full => {
                "Write a comprehensive synthesis with sections for consensus, \
                 points of disagreement, insights unique to a single model, and \
                 an overall confidence assessment. Attribute claims to models."
            }
        }
    }
}

/// Tier-completion events, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    FastComplete,
    SyncComplete,
    AsyncComplete,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FastComplete => "fast-complete",
            Self::SyncComplete => "sync-complete",
            Self::AsyncComplete => "async-complete",
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::FastComplete => "after fast models",
            Self::SyncComplete => "after all direct models",
            Self::AsyncComplete => "after deep research",
        }
    }
}

/// A fired trigger. `seq` orders stages by firing time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub trigger: Trigger,
    pub seq: u64,
    /// Every model is terminal; this stage's synthesis is the final one.
    pub is_final: bool,
    pub fired_at_ms: u64,
    /// Models whose outcomes the stage captured, in request order.
    pub models: Vec<String>,
}

/// Fire-once checks of the tier predicates, run after every terminal transition.
#[derive(Debug, Default)]
pub struct TierEvaluator {
    fast_fired: bool,
    sync_fired: bool,
    async_fired: bool,
    next_seq: u64,
}

impl TierEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers that became true since the last call, in dependency order.
    /// `async-complete` only exists when background models were requested.
    pub fn evaluate(&mut self, tracker: &ProgressTracker) -> Vec<(Trigger, u64, bool)> {
        let mut fired = Vec::new();
        let is_final = tracker.all_complete();

        if !self.fast_fired && tracker.all_fast_complete() {
            self.fast_fired = true;
            fired.push(Trigger::FastComplete);
        }
        if self.fast_fired && !self.sync_fired && tracker.all_sync_complete() {
            self.sync_fired = true;
            fired.push(Trigger::SyncComplete);
        }
        if !self.async_fired
            && tracker.has_tier(Tier::Background)
            && tracker.all_background_complete()
        {
            self.async_fired = true;
            fired.push(Trigger::AsyncComplete);
        }

        fired
            .into_iter()
            .map(|t| {
                let seq = self.next_seq;
                self.next_seq += 1;
                (t, seq, is_final)
            })
            .collect()
    }
}

/// Applied synthesis, reported in the run record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisRecord {
    pub trigger: Trigger,
    pub text: String,
    pub preliminary: bool,
    pub successes: usize,
}

/// Turns successful outcomes into one synthesis text.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        prompt: &str,
        outcomes: &[QueryOutcome],
        depth: SynthesisDepth,
    ) -> Result<String, ChorusError>;
}

/// Summarizer backed by one configured model.
pub struct ModelSummarizer {
    generator: Arc<dyn TextGenerator>,
    model: ModelDescriptor,
    timeout: Duration,
}

impl ModelSummarizer {
    pub fn new(generator: Arc<dyn TextGenerator>, model: ModelDescriptor) -> Self {
        let timeout = model.timeout();
        Self {
            generator,
            model,
            timeout,
        }
    }

    pub fn build_prompt(prompt: &str, outcomes: &[QueryOutcome], depth: SynthesisDepth) -> String {
        let mut out = format!(
            "You are synthesizing answers from {} AI models to the same question.\n\n\
             <question>\n{prompt}\n</question>\n\n",
            outcomes.len()
        );
        for o in outcomes {
            out.push_str(&format!(
                "<response model=\"{}\">\n{}\n</response>\n\n",
                o.model,
                o.response.as_deref().unwrap_or("").trim()
            ));
        }
        out.push_str(depth.instructions());
        out
    }
}

#[async_trait]
impl Summarizer for ModelSummarizer {
    async fn summarize(
        &self,
        prompt: &str,
        outcomes: &[QueryOutcome],
        depth: SynthesisDepth,
    ) -> Result<String, ChorusError> {
        let req = GenerateRequest {
            prompt: Self::build_prompt(prompt, outcomes, depth),
            system_prompt: Some(
                "You compare and combine answers from several AI models. Be faithful to what \
                 they said and do not invent claims none of them made."
                    .to_string(),
            ),
            ..Default::default()
        };
        let generation = tokio::time::timeout(self.timeout, self.generator.generate(&self.model, &req))
            .await
            .map_err(|_| ChorusError::Timeout(self.timeout.as_millis() as u64))??;
        Ok(generation.text)
    }
}

#[derive(Default)]
struct Applied {
    seq: Option<u64>,
    record: Option<SynthesisRecord>,
}

/// Runs synthesis for fired stages and serializes their document writes.
pub struct StageManager {
    summarizer: Arc<dyn Summarizer>,
    document: Arc<LiveDocument>,
    prompt: String,
    depth: SynthesisDepth,
    applied: Mutex<Applied>,
}

impl StageManager {
    pub fn new(
        summarizer: Arc<dyn Summarizer>,
        document: Arc<LiveDocument>,
        prompt: impl Into<String>,
        depth: SynthesisDepth,
    ) -> Self {
        Self {
            summarizer,
            document,
            prompt: prompt.into(),
            depth,
            applied: Mutex::new(Applied::default()),
        }
    }

    /// Synthesize the successful part of `subset` and write it to the document.
    ///
    /// Skipped (`Ok(None)`) when there are no successes, when the summarizer fails, or
    /// when a later stage already wrote its synthesis. Only document write failures are
    /// returned as errors.
    pub async fn maybe_synthesize(
        &self,
        stage: &Stage,
        subset: &[QueryOutcome],
    ) -> Result<Option<SynthesisRecord>, ChorusError> {
        let successes: Vec<QueryOutcome> =
            subset.iter().filter(|o| o.is_success()).cloned().collect();
        if successes.is_empty() {
            tracing::info!(trigger = stage.trigger.as_str(), "no successful responses, skipping synthesis");
            return Ok(None);
        }

        tracing::info!(
            trigger = stage.trigger.as_str(),
            seq = stage.seq,
            successes = successes.len(),
            "synthesizing"
        );

        let text = match self
            .summarizer
            .summarize(&self.prompt, &successes, self.depth)
            .await
        {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                tracing::warn!(trigger = stage.trigger.as_str(), "synthesis came back empty, skipping");
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(trigger = stage.trigger.as_str(), "synthesis failed, keeping previous: {e}");
                return Ok(None);
            }
        };

        let mut applied = self.applied.lock().await;
        if applied.seq.is_some_and(|s| s > stage.seq) {
            tracing::debug!(
                trigger = stage.trigger.as_str(),
                seq = stage.seq,
                "discarding stale synthesis"
            );
            return Ok(None);
        }

        let label = format!(
            "{}: {} of {} responses",
            stage.trigger.describe(),
            successes.len(),
            subset.len()
        );
        self.document
            .update_synthesis_section(&text, !stage.is_final, &label)
            .await?;

        let record = SynthesisRecord {
            trigger: stage.trigger,
            text,
            preliminary: !stage.is_final,
            successes: successes.len(),
        };
        applied.seq = Some(stage.seq);
        applied.record = Some(record.clone());
        Ok(Some(record))
    }

    /// The synthesis currently shown in the document.
    pub async fn latest(&self) -> Option<SynthesisRecord> {
        self.applied.lock().await.record.clone()
    }
}
