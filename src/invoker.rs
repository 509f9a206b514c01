use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::dispatch::registry::ModelDescriptor;
use crate::dispatch::{GenerateRequest, ImageAttachment, TextGenerator};
use crate::outcome::QueryOutcome;

/// Appended to the prompt when an image was supplied but the model can't see it.
pub fn image_omitted_note(image: &ImageAttachment) -> String {
    let name = image
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    format!(
        "\n\n[Note: an image ({name}) was attached to this question, but this model does not \
         accept image input. It was omitted; answer from the text alone.]"
    )
}

/// Runs one prompt against one request/response model and always produces an outcome.
pub struct Invoker {
    generator: Arc<dyn TextGenerator>,
    web_search: bool,
    max_tokens: Option<u64>,
}

impl Invoker {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator,
            web_search: false,
            max_tokens: None,
        }
    }

    pub fn with_web_search(mut self, enabled: bool) -> Self {
        self.web_search = enabled;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u64>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Build the capability request for this model. Non-vision models get the prompt
    /// with an omission note instead of the image.
    pub fn build_request(
        &self,
        model: &ModelDescriptor,
        prompt: &str,
        image: Option<&ImageAttachment>,
    ) -> GenerateRequest {
        let (prompt, image) = match image {
            Some(img) if model.vision => (prompt.to_string(), Some(img.clone())),
            Some(img) => {
                tracing::info!(model = model.id, "model lacks vision support, sending text only");
                (format!("{prompt}{}", image_omitted_note(img)), None)
            }
            None => (prompt.to_string(), None),
        };

        GenerateRequest {
            prompt,
            system_prompt: None,
            image,
            web_search: self.web_search,
            max_tokens: self.max_tokens,
        }
    }

    pub async fn invoke(
        &self,
        model: &ModelDescriptor,
        prompt: &str,
        timeout: Duration,
        image: Option<&ImageAttachment>,
    ) -> QueryOutcome {
        let req = self.build_request(model, prompt, image);
        let start = Instant::now();

        tracing::debug!(model = model.id, timeout_secs = timeout.as_secs(), "invoking model");

        // Dropping the generate future on expiry cancels the in-flight request.
        let result = tokio::time::timeout(timeout, self.generator.generate(model, &req)).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(generation)) => {
                tracing::info!(model = model.id, latency_ms, "model responded");
                QueryOutcome::success(&model.id, &model.provider, generation.text, latency_ms)
                    .with_tokens(generation.tokens)
                    .with_request_id(generation.request_id)
            }
            Ok(Err(e)) => {
                tracing::warn!(model = model.id, latency_ms, reason = e.reason(), "model failed: {e}");
                QueryOutcome::from_error(&model.id, &model.provider, &e, latency_ms)
            }
            Err(_) => {
                tracing::warn!(model = model.id, latency_ms, "model timed out");
                QueryOutcome::timeout(&model.id, &model.provider, latency_ms)
            }
        }
    }
}
