//! Recognition: run the model over a page's crops under the accelerator gate.
//!
//! The model is an opaque collaborator ([`RecognitionModel`]) that turns one
//! crop and a prompt into a token stream. The invoker:
//!
//! 1. takes one accelerator permit for the whole page,
//! 2. runs the crops in tiling order, reading each stream until the end
//!    marker or the generation budget,
//! 3. merges the crop texts in that same order and maps detection boxes
//!    back into page space,
//! 4. releases the permit (on every path, the permit is an RAII guard).
//!
//! ## Repeat filter
//!
//! The known failure mode of grounded OCR models is runaway repetition: the
//! same table row or phrase emitted until the budget runs out. A crop whose
//! stream neither yields the end marker within `max_tokens` tokens nor ends
//! with it is cut off there and marks the page degenerate. Whether a
//! degenerate page is omitted or replaced by a placeholder is the
//! assembler's decision, not ours.

use crate::error::{JobError, ModelError, PageError};
use crate::limiter::{Gate, ResourceLimiter};
use crate::output::{Rect, RecognitionResult};
use crate::pipeline::grounding;
use crate::pipeline::preprocess::Crop;
use crate::prompts::END_MARKER;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use image::DynamicImage;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Token pieces as the model produces them.
pub type TokenStream = BoxStream<'static, Result<String, ModelError>>;

/// The external recognition model.
#[async_trait]
pub trait RecognitionModel: Send + Sync {
    /// Start generating for one crop. The returned stream may be dropped early.
    async fn recognize(&self, image: &DynamicImage, prompt: &str) -> Result<TokenStream, ModelError>;
}

/// Why a page could not be recognised.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognizeError {
    /// This page failed; the job continues.
    Page(PageError),
    /// The accelerator gate timed out; the job fails.
    Job(JobError),
}

/// One crop's generation after the repeat filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub tokens: usize,
    /// Whether the end marker arrived within budget.
    pub terminated: bool,
}

/// Serialises model access through the accelerator gate.
#[derive(Clone)]
pub struct RecognitionInvoker {
    model: Arc<dyn RecognitionModel>,
    limiter: ResourceLimiter,
    max_tokens: usize,
}

impl RecognitionInvoker {
    pub fn new(model: Arc<dyn RecognitionModel>, limiter: ResourceLimiter, max_tokens: usize) -> Self {
        Self {
            model,
            limiter,
            max_tokens,
        }
    }

    /// Recognise page `page` (0-based) from its crops, in tiling order.
    pub async fn recognize(
        &self,
        page: usize,
        crops: &[Crop],
        prompt: &str,
    ) -> Result<RecognitionResult, RecognizeError> {
        let permit = self
            .limiter
            .acquire(Gate::Accelerator)
            .await
            .map_err(RecognizeError::Job)?;
        let start = Instant::now();

        let mut text = String::new();
        let mut segments: Vec<(usize, Rect)> = Vec::with_capacity(crops.len());
        let mut tokens = 0;
        let mut degenerate = false;

        for (i, crop) in crops.iter().enumerate() {
            if i > 0 {
                text.push('\n');
            }
            segments.push((text.len(), crop.region));

            let generation = self.generate(&crop.image, prompt).await.map_err(|e| {
                RecognizeError::Page(PageError::Recognition {
                    page,
                    detail: format!("crop {}/{}: {e}", i + 1, crops.len()),
                })
            })?;

            if !generation.terminated {
                warn!(
                    "Page {}: crop {}/{} hit the {}-token budget without an end marker",
                    page + 1,
                    i + 1,
                    crops.len(),
                    self.max_tokens
                );
                degenerate = true;
            }
            tokens += generation.tokens;
            text.push_str(&generation.text);
        }

        drop(permit);
        let duration = start.elapsed();
        let layout = grounding::layout_boxes(&text, &segments);
        debug!(
            "Page {}: {} crops, {} tokens, {} boxes, {:?}",
            page + 1,
            crops.len(),
            tokens,
            layout.len(),
            duration
        );

        Ok(RecognitionResult {
            text,
            layout,
            degenerate,
            crop_count: crops.len(),
            tokens,
            duration_ms: duration.as_millis() as u64,
        })
    }

    /// Read one crop's stream through the repeat filter.
    async fn generate(&self, image: &DynamicImage, prompt: &str) -> Result<Generation, ModelError> {
        let mut stream = self.model.recognize(image, prompt).await?;
        let mut text = String::new();
        let mut tokens = 0;

        while tokens < self.max_tokens {
            let Some(piece) = stream.next().await else {
                break;
            };
            let piece = piece?;
            tokens += 1;

            // The marker may straddle two pieces.
            let mut from = text.len().saturating_sub(END_MARKER.len());
            while !text.is_char_boundary(from) {
                from -= 1;
            }
            text.push_str(&piece);
            if let Some(pos) = text[from..].find(END_MARKER) {
                text.truncate(from + pos);
                return Ok(Generation {
                    text,
                    tokens,
                    terminated: true,
                });
            }
        }

        Ok(Generation {
            text,
            tokens,
            terminated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Emits a fixed list of pieces per call.
    struct Scripted {
        pieces: Vec<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RecognitionModel for Scripted {
        async fn recognize(&self, _image: &DynamicImage, _prompt: &str) -> Result<TokenStream, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let items: Vec<Result<String, ModelError>> =
                self.pieces.iter().map(|p| Ok(p.to_string())).collect();
            Ok(stream::iter(items).boxed())
        }
    }

    /// Repeats one piece forever.
    struct Runaway;

    #[async_trait]
    impl RecognitionModel for Runaway {
        async fn recognize(&self, _image: &DynamicImage, _prompt: &str) -> Result<TokenStream, ModelError> {
            Ok(stream::repeat_with(|| Ok("| a | b |\n".to_string())).boxed())
        }
    }

    struct Broken;

    #[async_trait]
    impl RecognitionModel for Broken {
        async fn recognize(&self, _image: &DynamicImage, _prompt: &str) -> Result<TokenStream, ModelError> {
            Err(ModelError::Runtime("device lost".into()))
        }
    }

    fn crops(n: u32) -> Vec<Crop> {
        (0..n)
            .map(|i| Crop {
                image: DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]))),
                region: Rect::new(i * 100, 0, (i + 1) * 100, 100),
                row: 0,
                col: i,
            })
            .collect()
    }

    fn invoker(model: Arc<dyn RecognitionModel>, max_tokens: usize) -> (RecognitionInvoker, ResourceLimiter) {
        let limiter = ResourceLimiter::new(1, 1, None, None);
        (RecognitionInvoker::new(model, limiter.clone(), max_tokens), limiter)
    }

    #[tokio::test]
    async fn merges_crops_in_order_and_strips_marker() {
        let model = Arc::new(Scripted {
            pieces: vec!["Hello ", "world", "<｜end▁of▁sentence｜>"],
            calls: AtomicUsize::new(0),
        });
        let (inv, limiter) = invoker(model.clone(), 100);
        let result = inv.recognize(0, &crops(2), "p").await.unwrap();

        assert_eq!(result.text, "Hello world\nHello world");
        assert!(!result.degenerate);
        assert_eq!(result.crop_count, 2);
        assert_eq!(result.tokens, 6);
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
        assert_eq!(limiter.available(Gate::Accelerator), 1);
    }

    #[tokio::test]
    async fn marker_split_across_pieces_is_found() {
        let model = Arc::new(Scripted {
            pieces: vec!["done<｜end▁of", "▁sentence｜>trailing"],
            calls: AtomicUsize::new(0),
        });
        let (inv, _) = invoker(model, 100);
        let result = inv.recognize(0, &crops(1), "p").await.unwrap();
        assert_eq!(result.text, "done");
        assert!(!result.degenerate);
    }

    #[tokio::test]
    async fn runaway_generation_is_degenerate() {
        let (inv, limiter) = invoker(Arc::new(Runaway), 50);
        let result = inv.recognize(2, &crops(1), "p").await.unwrap();
        assert!(result.degenerate);
        assert_eq!(result.tokens, 50);
        assert_eq!(limiter.available(Gate::Accelerator), 1);
    }

    #[tokio::test]
    async fn stream_ending_without_marker_is_degenerate() {
        let model = Arc::new(Scripted {
            pieces: vec!["truncated"],
            calls: AtomicUsize::new(0),
        });
        let (inv, _) = invoker(model, 100);
        assert!(inv.recognize(0, &crops(1), "p").await.unwrap().degenerate);
    }

    #[tokio::test]
    async fn model_error_is_page_level_and_releases_permit() {
        let (inv, limiter) = invoker(Arc::new(Broken), 100);
        let err = inv.recognize(5, &crops(2), "p").await.unwrap_err();
        match err {
            RecognizeError::Page(PageError::Recognition { page, detail }) => {
                assert_eq!(page, 5);
                assert!(detail.contains("device lost"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(limiter.available(Gate::Accelerator), 1);
    }

    #[tokio::test]
    async fn boxes_are_mapped_per_crop() {
        let model = Arc::new(Scripted {
            pieces: vec![
                "<|ref|>text<|/ref|><|det|>[[0, 0, 999, 999]]<|/det|>x",
                "<｜end▁of▁sentence｜>",
            ],
            calls: AtomicUsize::new(0),
        });
        let (inv, _) = invoker(model, 100);
        let result = inv.recognize(0, &crops(2), "p").await.unwrap();
        assert_eq!(result.layout.len(), 2);
        assert_eq!(result.layout[0].rect, Rect::new(0, 0, 100, 100));
        assert_eq!(result.layout[1].rect, Rect::new(100, 0, 200, 100));
    }
}
