use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::document::{render_outcome, write_atomic};
use crate::error::ChorusError;
use crate::orchestrator::QueryRun;

static PERSIST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Model ids become file names: anything outside `[A-Za-z0-9_-]` is replaced.
pub fn sanitize_model_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// File stems already taken by the run itself.
const RESERVED_STEMS: [&str; 2] = ["query", "synthesis"];

/// One distinct file stem per outcome, in order. Ids that sanitize to a taken stem get
/// `-2`, `-3`, ... appended. Compared case-insensitively.
pub fn outcome_file_stems<'a>(models: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut taken: HashSet<String> = RESERVED_STEMS.iter().map(|s| s.to_string()).collect();
    models
        .into_iter()
        .map(|model| {
            let base = sanitize_model_name(model);
            let mut stem = base.clone();
            let mut n = 2;
            while !taken.insert(stem.to_lowercase()) {
                stem = format!("{base}-{n}");
                n += 1;
            }
            stem
        })
        .collect()
}

fn persist_err(path: &Path) -> impl FnOnce(std::io::Error) -> ChorusError + use<> {
    let path = path.to_path_buf();
    move |source| ChorusError::Persist { path, source }
}

/// Write one run under `<dir>/<epoch-ms>_<pid>_<seq>/`: `query.json`, one `<model>.md`
/// per outcome (see [`outcome_file_stems`]) and `synthesis.md` when a synthesis was
/// applied. Returns the run directory.
pub async fn persist_run(dir: &Path, run: &QueryRun) -> Result<PathBuf, ChorusError> {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let pid = std::process::id();
    let seq = PERSIST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let run_dir = dir.join(format!("{ts}_{pid}_{seq}"));

    tokio::fs::create_dir_all(&run_dir)
        .await
        .map_err(persist_err(&run_dir))?;

    let json_path = run_dir.join("query.json");
    let json = serde_json::to_string_pretty(run)
        .map_err(std::io::Error::other)
        .map_err(persist_err(&json_path))?;
    write_atomic(&json_path, json.as_bytes())
        .await
        .map_err(persist_err(&json_path))?;

    let stems = outcome_file_stems(run.outcomes.iter().map(|o| o.model.as_str()));
    for (outcome, stem) in run.outcomes.iter().zip(stems) {
        let path = run_dir.join(format!("{stem}.md"));
        let body = format!("# {}\n\n{}", outcome.model, render_outcome(outcome));
        write_atomic(&path, body.as_bytes())
            .await
            .map_err(persist_err(&path))?;
    }

    if let Some(ref synthesis) = run.synthesis {
        let path = run_dir.join("synthesis.md");
        let kind = if synthesis.preliminary { "preliminary" } else { "final" };
        let body = format!(
            "# Synthesis ({kind}, {}, {} responses)\n\n{}\n",
            synthesis.trigger.as_str(),
            synthesis.successes,
            synthesis.text.trim()
        );
        write_atomic(&path, body.as_bytes())
            .await
            .map_err(persist_err(&path))?;
    }

    tracing::info!(path = %run_dir.display(), outcomes = run.outcomes.len(), "persisted run");
    Ok(run_dir)
}
