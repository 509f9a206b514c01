//! Context files prepended to the prompt.

use std::path::{Path, PathBuf};

/// Maximum bytes of file content to inject into the prompt.
pub const MAX_CONTEXT_BYTES: usize = 512 * 1024;

/// Maximum number of files read from a context directory.
pub const MAX_CONTEXT_FILES: usize = 200;

/// Loaded context, ready to prepend to a prompt.
#[derive(Debug, Default)]
pub struct LoadedContext {
    /// `<file>` blocks plus a trailing manifest comment for anything left out.
    pub text: String,
    pub files: Vec<PathBuf>,
    /// Files left out for budget or encoding reasons (path, reason).
    pub skipped: Vec<(PathBuf, String)>,
}

impl LoadedContext {
    pub fn apply(&self, prompt: &str) -> String {
        format!("<context>\n{}</context>\n\n{prompt}", self.text)
    }
}

/// Escape XML content characters: `<`, `>`, `&`.
pub fn escape_xml_content(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Escape XML attribute values: `"`, `<`, `>`, `&`.
pub fn escape_xml_attr(s: &str) -> String {
    escape_xml_content(s).replace('"', "&quot;")
}

/// XML comments cannot contain `--`.
fn escape_xml_comment(s: &str) -> String {
    s.replace("--", "&#45;&#45;")
}

/// Load a file, or every file under a directory, as prompt context.
///
/// A missing path is warned about and yields `None`; nothing here is fatal.
/// Hidden entries are skipped, files are read in sorted order, non-UTF-8 files and
/// files past `budget` are listed in a manifest comment instead.
pub async fn load_context(path: &Path, budget: usize) -> Option<LoadedContext> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(path = %path.display(), "context path unreadable, ignoring: {e}");
            return None;
        }
    };

    let (base, files) = if meta.is_dir() {
        (path.to_path_buf(), collect_files(path).await)
    } else {
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        (base, vec![path.to_path_buf()])
    };

    let mut loaded = LoadedContext::default();
    let mut used = 0usize;

    for file in files {
        let rel = file.strip_prefix(&base).unwrap_or(&file).to_path_buf();

        let size = match tokio::fs::metadata(&file).await {
            Ok(m) => m.len() as usize,
            Err(e) => {
                loaded.skipped.push((rel, e.to_string()));
                continue;
            }
        };
        // Raw size alone over the remaining budget: skip without reading.
        if size > budget.saturating_sub(used) {
            loaded.skipped.push((rel, format!("over budget ({size}B)")));
            continue;
        }

        let content = match tokio::fs::read(&file).await.map(String::from_utf8) {
            Ok(Ok(c)) => c,
            Ok(Err(_)) => {
                loaded.skipped.push((rel, "not UTF-8".to_string()));
                continue;
            }
            Err(e) => {
                loaded.skipped.push((rel, e.to_string()));
                continue;
            }
        };

        let entry = format!(
            "<file path=\"{}\">\n{}\n</file>\n",
            escape_xml_attr(&rel.to_string_lossy()),
            escape_xml_content(content.trim_end())
        );
        // Escaped content may be larger than raw
        if used + entry.len() > budget {
            loaded.skipped.push((rel, format!("over budget ({size}B)")));
            continue;
        }

        used += entry.len();
        loaded.text.push_str(&entry);
        loaded.files.push(rel);
    }

    if !loaded.skipped.is_empty() {
        let names: Vec<String> = loaded
            .skipped
            .iter()
            .map(|(p, why)| format!("{} ({why})", p.display()))
            .collect();
        tracing::warn!(skipped = ?names, "some context files were left out");
        loaded.text.push_str(&format!(
            "<!-- Skipped: {} -->\n",
            escape_xml_comment(&names.join(", "))
        ));
    }

    if loaded.files.is_empty() {
        tracing::warn!(path = %path.display(), "no usable context files");
        return None;
    }

    tracing::info!(files = loaded.files.len(), bytes = used, "loaded context");
    Some(loaded)
}

/// All regular files under `dir`, sorted, skipping hidden entries. Capped at
/// [`MAX_CONTEXT_FILES`].
async fn collect_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(path = %current.display(), "cannot read directory: {e}");
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            match entry.file_type().await {
                Ok(t) if t.is_dir() => pending.push(entry.path()),
                Ok(t) if t.is_file() => files.push(entry.path()),
                _ => {}
            }
        }
    }

    files.sort();
    if files.len() > MAX_CONTEXT_FILES {
        tracing::warn!(
            found = files.len(),
            max = MAX_CONTEXT_FILES,
            "context directory has too many files, truncating"
        );
        files.truncate(MAX_CONTEXT_FILES);
    }
    files
}
