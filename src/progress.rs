//! Per-query progress state machine and the human-readable status display.

use std::io::{IsTerminal, Write};
use std::time::Duration;

use tokio::time::Instant;

use crate::dispatch::registry::Tier;
use crate::outcome::OutcomeStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Pending,
    Querying,
    Success,
    Error,
    Timeout,
}

impl ProgressState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Timeout)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Querying => 1,
            Self::Success | Self::Error | Self::Timeout => 2,
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            Self::Pending => "·",
            Self::Querying => "…",
            Self::Success => "✓",
            Self::Error => "✗",
            Self::Timeout => "⏱",
        }
    }
}

impl From<OutcomeStatus> for ProgressState {
    fn from(status: OutcomeStatus) -> Self {
        match status {
            OutcomeStatus::Success => Self::Success,
            OutcomeStatus::Error => Self::Error,
            OutcomeStatus::Timeout => Self::Timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelProgress {
    pub model: String,
    pub tier: Tier,
    pub state: ProgressState,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl ModelProgress {
    /// Time spent querying so far, or in total once terminal.
    pub fn elapsed(&self) -> Option<Duration> {
        let started = self.started_at?;
        Some(match self.finished_at {
            Some(finished) => finished.duration_since(started),
            None => started.elapsed(),
        })
    }
}

pub struct ProgressTracker {
    models: Vec<ModelProgress>,
    /// Bumped on every applied transition.
    version: u64,
}

impl ProgressTracker {
    pub fn new<'a>(models: impl IntoIterator<Item = (&'a str, Tier)>) -> Self {
        Self {
            models: models
                .into_iter()
                .map(|(model, tier)| ModelProgress {
                    model: model.to_string(),
                    tier,
                    state: ProgressState::Pending,
                    started_at: None,
                    finished_at: None,
                })
                .collect(),
            version: 0,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, model: &str) -> Option<&ModelProgress> {
        self.models.iter().find(|m| m.model == model)
    }

    pub fn models(&self) -> &[ModelProgress] {
        &self.models
    }

    /// Move a model forward. Backward or sideways moves (and any move out of a terminal
    /// state) are rejected; returns whether the transition was applied.
    pub fn set_status(&mut self, model: &str, state: ProgressState) -> bool {
        let Some(entry) = self.models.iter_mut().find(|m| m.model == model) else {
            tracing::warn!(model, "progress update for untracked model");
            return false;
        };

        if entry.state.is_terminal() || state.rank() <= entry.state.rank() {
            tracing::debug!(model, from = ?entry.state, to = ?state, "rejected progress transition");
            return false;
        }

        let now = Instant::now();
        if state.rank() >= ProgressState::Querying.rank() && entry.started_at.is_none() {
            entry.started_at = Some(now);
        }
        if state.is_terminal() {
            entry.finished_at = Some(now);
        }
        entry.state = state;
        self.version += 1;
        true
    }

    fn all_terminal(&self, pred: impl Fn(Tier) -> bool) -> bool {
        self.models
            .iter()
            .filter(|m| pred(m.tier))
            .all(|m| m.state.is_terminal())
    }

    /// Every quick-tier model is terminal. Vacuously true with no quick models.
    pub fn all_fast_complete(&self) -> bool {
        self.all_terminal(|t| t == Tier::Quick)
    }

    /// Every quick and slow model is terminal.
    pub fn all_sync_complete(&self) -> bool {
        self.all_terminal(|t| t.is_sync())
    }

    pub fn all_background_complete(&self) -> bool {
        self.all_terminal(|t| t == Tier::Background)
    }

    pub fn all_complete(&self) -> bool {
        self.all_terminal(|_| true)
    }

    pub fn has_tier(&self, tier: Tier) -> bool {
        self.models.iter().any(|m| m.tier == tier)
    }

    /// Write the grouped status display. Write errors are ignored; rendering never
    /// touches tracker state.
    pub fn render(&self, out: &mut dyn Write) {
        let _ = out.write_all(self.render_to_string().as_bytes());
        let _ = out.flush();
    }

    pub fn render_to_string(&self) -> String {
        let width = self.models.iter().map(|m| m.model.len()).max().unwrap_or(0);
        let done = self.models.iter().filter(|m| m.state.is_terminal()).count();

        let mut out = format!("── {done}/{} models complete ──\n", self.models.len());
        for (tier, title) in [
            (Tier::Quick, "Fast models"),
            (Tier::Slow, "Slow models"),
            (Tier::Background, "Deep research"),
        ] {
            let group: Vec<&ModelProgress> =
                self.models.iter().filter(|m| m.tier == tier).collect();
            if group.is_empty() {
                continue;
            }
            out.push_str(title);
            out.push('\n');
            for m in group {
                let elapsed = m.elapsed().map(format_elapsed).unwrap_or_default();
                out.push_str(&format!(
                    "  {} {:<width$}  {elapsed}\n",
                    m.state.icon(),
                    m.model
                ));
            }
        }
        out
    }
}

/// Decides when the tracker reaches the terminal. In redraw mode the previous block is
/// erased and drawn again on every tick; otherwise a block is appended only after a
/// model changed state.
pub struct ProgressDisplay {
    redraw: bool,
    last_version: Option<u64>,
    drawn_lines: usize,
}

impl ProgressDisplay {
    pub fn new(redraw: bool) -> Self {
        Self {
            redraw,
            last_version: None,
            drawn_lines: 0,
        }
    }

    /// Redraw in place only when stderr is a terminal.
    pub fn for_stderr() -> Self {
        Self::new(std::io::stderr().is_terminal())
    }

    /// Write the tracker if due. Returns whether anything was written.
    pub fn tick(&mut self, tracker: &ProgressTracker, out: &mut dyn Write) -> bool {
        if !self.redraw && self.last_version == Some(tracker.version()) {
            return false;
        }

        let block = tracker.render_to_string();
        let mut frame = String::new();
        if self.redraw && self.drawn_lines > 0 {
            // cursor up, clear to end of screen
            frame.push_str(&format!("\x1b[{}A\x1b[J", self.drawn_lines));
        }
        frame.push_str(&block);
        let _ = out.write_all(frame.as_bytes());
        let _ = out.flush();

        self.drawn_lines = block.lines().count();
        self.last_version = Some(tracker.version());
        true
    }
}

/// `4.2s` under a minute, `3m 07s` above.
pub fn format_elapsed(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        format!("{}m {:02}s", secs / 60, secs % 60)
    }
}
