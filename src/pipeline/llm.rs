//! VLM backend: a [`RecognitionModel`] over any edgequake-llm provider.
//!
//! Hosted vision models do not stream grounded OCR tokens the way a local
//! recognition runtime does, so this adapter issues one chat completion per
//! crop and replays the reply as a token stream. The repeat filter then
//! sees it exactly as it would a local stream:
//!
//! * the reply is split on whitespace into pieces, one piece per token;
//! * a reply that stopped on its own (fewer completion tokens than the
//!   budget) gets the end marker appended;
//! * a reply that used the whole budget gets no marker, so the page is
//!   flagged degenerate.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors from LLM APIs are transient and frequent under
//! concurrent load. Exponential backoff (`retry_backoff_ms * 2^attempt`)
//! avoids thundering-herd: with 500 ms base and 3 retries the wait sequence
//! is 500 ms → 1 s → 2 s.

use crate::error::{Error, ModelError};
use crate::pipeline::recognize::{RecognitionModel, TokenStream};
use crate::prompts::{instruction_text, is_grounded, END_MARKER, GROUNDING_SYSTEM_PROMPT};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use futures::stream::{self, StreamExt};
use image::DynamicImage;
use std::io::Cursor;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Model used when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Recognition through a hosted vision-language model.
#[derive(Clone)]
pub struct LlmRecognitionModel {
    provider: Arc<dyn LLMProvider>,
    temperature: f32,
    max_tokens: usize,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl LlmRecognitionModel {
    pub fn new(provider: Arc<dyn LLMProvider>, max_tokens: usize) -> Self {
        Self {
            provider,
            temperature: 0.0,
            max_tokens,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn retries(mut self, max_retries: u32, backoff_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl RecognitionModel for LlmRecognitionModel {
    async fn recognize(&self, image: &DynamicImage, prompt: &str) -> Result<TokenStream, ModelError> {
        let image_data = encode_crop(image).map_err(|e| ModelError::InvalidInput(e.to_string()))?;

        let mut messages = Vec::with_capacity(2);
        if is_grounded(prompt) {
            messages.push(ChatMessage::system(GROUNDING_SYSTEM_PROMPT));
        }
        messages.push(ChatMessage::user_with_images(
            &instruction_text(prompt),
            vec![image_data],
        ));

        let options = self.options();
        let mut last_err: Option<String> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!("VLM retry {}/{} after {}ms", attempt, self.max_retries, backoff);
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    debug!(
                        "VLM: {} input tokens, {} output tokens",
                        response.prompt_tokens, response.completion_tokens
                    );
                    let finished = response.completion_tokens < self.max_tokens;
                    let pieces = reply_pieces(&response.content, finished);
                    return Ok(stream::iter(pieces.into_iter().map(Ok)).boxed());
                }
                Err(e) => {
                    warn!("VLM attempt {} failed: {}", attempt + 1, e);
                    last_err = Some(e.to_string());
                }
            }
        }

        Err(ModelError::Runtime(
            last_err.unwrap_or_else(|| "unknown error".to_string()),
        ))
    }
}

/// Split a completed reply into token pieces, closing it with the end marker
/// when the model stopped on its own.
pub fn reply_pieces(content: &str, finished: bool) -> Vec<String> {
    let mut pieces: Vec<String> = content
        .split_inclusive(char::is_whitespace)
        .map(str::to_string)
        .collect();
    if finished {
        pieces.push(END_MARKER.to_string());
    }
    pieces
}

/// Encode a crop as a base64 PNG ready for the VLM API.
///
/// ## Why PNG?
/// Lossless compression preserves text crispness. JPEG artefacts on rendered
/// text confuse vision models and degrade OCR accuracy.
pub fn encode_crop(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded crop → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Named provider + model**: `name` (e.g. `"openai"`) and optional
///    `model`, via [`ProviderFactory::create_llm_provider`], which reads the
///    matching API key from the environment.
/// 2. **Environment pair**: `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`,
///    honoured even when several API keys are present.
/// 3. **Full auto-detection** via [`ProviderFactory::from_env`].
pub fn resolve_provider(name: Option<&str>, model: Option<&str>) -> Result<Arc<dyn LLMProvider>, Error> {
    if let Some(name) = name {
        return create_vision_provider(name, model.unwrap_or(DEFAULT_MODEL));
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    let (llm_provider, _embedding) = ProviderFactory::from_env().map_err(|e| {
        Error::InvalidConfig(format!(
            "no LLM provider could be auto-detected from environment; \
             set OPENAI_API_KEY, ANTHROPIC_API_KEY, or name a provider ({e})"
        ))
    })?;
    Ok(llm_provider)
}

fn create_vision_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, Error> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        Error::InvalidConfig(format!("provider '{provider_name}' is not configured: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn finished_reply_ends_with_marker() {
        let pieces = reply_pieces("# Title\nSome text", true);
        assert_eq!(pieces.concat(), format!("# Title\nSome text{END_MARKER}"));
        assert_eq!(pieces.len(), 5);
    }

    #[test]
    fn truncated_reply_has_no_marker() {
        let pieces = reply_pieces("row row row", false);
        assert!(!pieces.concat().contains(END_MARKER));
    }

    #[test]
    fn encode_small_crop() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let data = encode_crop(&img).unwrap();
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).unwrap();
        assert!(!decoded.is_empty());
    }
}
