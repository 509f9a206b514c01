pub mod async_poll;
pub mod http;
pub mod registry;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::dispatch::registry::ModelDescriptor;
use crate::error::ChorusError;
use crate::outcome::Citation;

/// Largest image accepted for attachment (providers reject bigger payloads anyway).
pub const MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

/// An image read from disk, ready to be inlined into a provider request.
#[derive(Clone)]
pub struct ImageAttachment {
    pub path: PathBuf,
    pub media_type: String,
    pub base64: String,
}

impl std::fmt::Debug for ImageAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageAttachment")
            .field("path", &self.path)
            .field("media_type", &self.media_type)
            .field("base64_len", &self.base64.len())
            .finish()
    }
}

impl ImageAttachment {
    pub async fn load(path: &Path) -> Result<Self, ChorusError> {
        let media_type = media_type_for(path).ok_or_else(|| {
            ChorusError::Image(format!("unsupported image type: {}", path.display()))
        })?;

        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| ChorusError::Image(format!("{}: {e}", path.display())))?;
        if meta.len() > MAX_IMAGE_BYTES {
            return Err(ChorusError::Image(format!(
                "{} is {} bytes (max {MAX_IMAGE_BYTES})",
                path.display(),
                meta.len()
            )));
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ChorusError::Image(format!("{}: {e}", path.display())))?;

        Ok(Self::from_bytes(path, media_type, &bytes))
    }

    pub fn from_bytes(path: &Path, media_type: &str, bytes: &[u8]) -> Self {
        Self {
            path: path.to_path_buf(),
            media_type: media_type.to_string(),
            base64: STANDARD.encode(bytes),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.base64)
    }
}

fn media_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// One text-generation call. The invoker has already decided whether the image
/// can be attached; backends attach `image` whenever it is present.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub image: Option<ImageAttachment>,
    pub web_search: bool,
    pub max_tokens: Option<u64>,
}

/// Text returned by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub tokens: Option<u64>,
    pub request_id: Option<String>,
}

/// Request/response text generation against one model.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        model: &ModelDescriptor,
        req: &GenerateRequest,
    ) -> Result<Generation, ChorusError>;
}

/// Remote status of a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// What one poll of a background job reported.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub output: Option<String>,
    pub citations: Vec<Citation>,
    pub error: Option<String>,
}

impl JobSnapshot {
    pub fn pending(status: JobStatus) -> Self {
        Self {
            status,
            output: None,
            citations: Vec::new(),
            error: None,
        }
    }
}

/// Submit-then-poll access to long-running (deep research) jobs.
#[async_trait]
pub trait JobBackend: Send + Sync {
    async fn submit(&self, model: &ModelDescriptor, prompt: &str) -> Result<String, ChorusError>;

    async fn poll(&self, model: &ModelDescriptor, job_id: &str)
    -> Result<JobSnapshot, ChorusError>;
}
