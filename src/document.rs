//! The live markdown document: a header, an optional synthesis section and one
//! section per model, rewritten atomically on every update.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::dispatch::registry::Tier;
use crate::error::ChorusError;
use crate::outcome::{OutcomeStatus, QueryOutcome};
use crate::poller::JobProgressEvent;
use crate::progress::format_elapsed;

/// Characters of a long prompt shown inline next to the pointer to the full text.
const PROMPT_PREVIEW_CHARS: usize = 200;

/// References shown in the document header.
#[derive(Debug, Clone, Default)]
pub struct DocumentMeta {
    pub image: Option<PathBuf>,
    pub context: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
}

/// New content for one model's section.
#[derive(Debug, Clone, Copy)]
pub enum SectionUpdate<'a> {
    Querying(Tier),
    Job(&'a JobProgressEvent),
    Outcome(&'a QueryOutcome),
}

#[derive(Debug)]
struct ModelSection {
    model: String,
    body: String,
    /// Holds a final outcome; later progress is stale.
    finished: bool,
}

#[derive(Debug, Default)]
struct DocState {
    header: String,
    synthesis: Option<String>,
    sections: Vec<ModelSection>,
}

impl DocState {
    fn render(&self) -> String {
        let mut out = self.header.clone();
        if let Some(ref synthesis) = self.synthesis {
            out.push_str(synthesis);
        }
        for section in &self.sections {
            out.push_str(&format!("## {}\n\n{}\n\n", section.model, section.body.trim_end()));
        }
        out
    }
}

pub struct LiveDocument {
    path: PathBuf,
    long_prompt_threshold: usize,
    state: Mutex<DocState>,
}

impl LiveDocument {
    pub fn new(path: impl Into<PathBuf>, long_prompt_threshold: usize) -> Self {
        Self {
            path: path.into(),
            long_prompt_threshold,
            state: Mutex::new(DocState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where a long prompt is written: `<stem>.prompt.md` beside the document.
    pub fn prompt_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "chorus".to_string());
        self.path.with_file_name(format!("{stem}.prompt.md"))
    }

    /// Create the skeleton: header then one placeholder section per model, in order.
    pub async fn init(
        &self,
        prompt: &str,
        models: &[String],
        meta: &DocumentMeta,
    ) -> Result<(), ChorusError> {
        let prompt_line = if prompt.chars().count() > self.long_prompt_threshold {
            let prompt_path = self.prompt_path();
            write_atomic(&prompt_path, prompt.as_bytes())
                .await
                .map_err(|source| ChorusError::Document {
                    path: prompt_path.clone(),
                    source,
                })?;
            let preview: String = prompt.chars().take(PROMPT_PREVIEW_CHARS).collect();
            let name = prompt_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!(
                "**Prompt** ({} characters, full text in [{name}]({name})):\n\n> {}…\n",
                prompt.chars().count(),
                preview.replace('\n', " ")
            )
        } else {
            format!("**Prompt:**\n\n{}\n", quote(prompt))
        };

        let mut header = format!("# Multi-model query\n\n{prompt_line}\n");
        if let Some(ref image) = meta.image {
            header.push_str(&format!("**Image:** `{}`  \n", image.display()));
        }
        if let Some(ref context) = meta.context {
            header.push_str(&format!("**Context:** `{}`  \n", context.display()));
        }
        let started = meta.started_at.unwrap_or_else(Utc::now);
        header.push_str(&format!(
            "**Started:** {}  \n**Models:** {}\n\n---\n\n",
            started.format("%Y-%m-%d %H:%M:%S UTC"),
            models.join(", ")
        ));

        let mut state = self.state.lock().await;
        *state = DocState {
            header,
            synthesis: None,
            sections: models
                .iter()
                .map(|m| ModelSection {
                    model: m.clone(),
                    body: "_Pending…_".to_string(),
                    finished: false,
                })
                .collect(),
        };
        self.flush(&state).await
    }

    /// Replace one model's section in place. Other sections are untouched and the
    /// same update applied twice yields the same document.
    pub async fn update_model_section(
        &self,
        model: &str,
        update: SectionUpdate<'_>,
    ) -> Result<(), ChorusError> {
        let mut state = self.state.lock().await;
        let Some(section) = state.sections.iter_mut().find(|s| s.model == model) else {
            tracing::warn!(model, "no document section for model");
            return Ok(());
        };

        match update {
            SectionUpdate::Outcome(outcome) => {
                section.body = render_outcome(outcome);
                section.finished = true;
            }
            _ if section.finished => {
                tracing::debug!(model, "ignoring progress for finished model");
                return Ok(());
            }
            SectionUpdate::Querying(tier) => {
                section.body = match tier {
                    Tier::Background => "_Submitting background job…_".to_string(),
                    _ => format!("_Querying ({} model)…_", tier.as_str()),
                };
            }
            SectionUpdate::Job(event) => {
                section.body = format!(
                    "_Research job `{}`: {} after {}_",
                    event.job_id,
                    event.status.as_str().replace('_', " "),
                    format_elapsed(event.elapsed)
                );
            }
        }
        self.flush(&state).await
    }

    /// Insert or wholly replace the single synthesis section (always right after the header).
    pub async fn update_synthesis_section(
        &self,
        text: &str,
        preliminary: bool,
        label: &str,
    ) -> Result<(), ChorusError> {
        let heading = if preliminary {
            format!("## Synthesis (preliminary, {label})")
        } else {
            format!("## Synthesis (final, {label})")
        };
        let mut body = format!("{heading}\n\n{}\n\n", text.trim());
        if preliminary {
            body.push_str("_This synthesis will be replaced as more models finish._\n\n");
        }
        body.push_str("---\n\n");

        let mut state = self.state.lock().await;
        state.synthesis = Some(body);
        self.flush(&state).await
    }

    /// Current rendered document.
    pub async fn contents(&self) -> String {
        self.state.lock().await.render()
    }

    async fn flush(&self, state: &DocState) -> Result<(), ChorusError> {
        write_atomic(&self.path, state.render().as_bytes())
            .await
            .map_err(|source| ChorusError::Document {
                path: self.path.clone(),
                source,
            })
    }
}

fn quote(text: &str) -> String {
    text.lines()
        .map(|l| format!("> {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Markdown body for a finished model. Shared with the per-model result files.
pub fn render_outcome(outcome: &QueryOutcome) -> String {
    let icon = match outcome.status {
        OutcomeStatus::Success => "✓",
        OutcomeStatus::Error => "✗",
        OutcomeStatus::Timeout => "⏱",
    };

    let mut status = format!("**Status:** {icon} {}", outcome.status.as_str());
    if let Some(ms) = outcome.latency_ms {
        status.push_str(&format!(" · {}", format_elapsed(std::time::Duration::from_millis(ms))));
    }
    if let Some(tokens) = outcome.tokens {
        status.push_str(&format!(" · {tokens} tokens"));
    }

    let mut out = format!("{status}\n\n");
    match (&outcome.response, &outcome.error) {
        (Some(response), _) => {
            out.push_str(response.trim());
            out.push('\n');
        }
        (None, Some(error)) => {
            out.push_str(&format!("> {error}\n"));
        }
        (None, None) => {}
    }

    if !outcome.citations.is_empty() {
        out.push_str("\n**Sources**\n\n");
        for (i, c) in outcome.citations.iter().enumerate() {
            let title = c.title.as_deref().unwrap_or(&c.url);
            out.push_str(&format!("{}. [{title}]({})\n", i + 1, c.url));
        }
    }
    out
}

/// Atomic write: temp file + rename prevents partial reads.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);
    tokio::fs::write(&tmp_path, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}
