//! # edgequake-ocr-jobs
//!
//! Asynchronous OCR job orchestration: accept documents, run every page
//! through a grounded vision model, and assemble Markdown, a layout-annotated
//! PDF and the extracted figures.
//!
//! ## Why this crate?
//!
//! An OCR model on one accelerator can serve only a few generations at a
//! time, while uploads arrive in bursts of many multi-page documents. This
//! crate sits between the two: jobs are queued and admitted through a job
//! gate, pages fan out across a CPU preprocessing pool, and recognition
//! calls funnel through an accelerator gate. A caller polls job status and
//! downloads artifacts once the job completes.
//!
//! ## Pipeline Overview
//!
//! ```text
//! submit(bytes)
//!  │
//!  ├─ 1. Queue      job registered as `queued`, waits for a job permit
//!  ├─ 2. Render     rasterise pages via pdfium (CPU-bound, spawn_blocking)
//!  ├─ 3. Tile       crop each page into model-sized tiles (bounded pool)
//!  ├─ 4. Recognise  grounded OCR per crop, one accelerator permit per page
//!  ├─ 5. Assemble   ordered Markdown, annotated PDF, images.zip, manifest
//!  └─ 6. Done       `completed` or `failed`; job permit released
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_ocr_jobs::pipeline::llm::{resolve_provider, LlmRecognitionModel};
//! use edgequake_ocr_jobs::pipeline::render::PdfiumRasterizer;
//! use edgequake_ocr_jobs::{ArtifactKind, Orchestrator, OrchestratorConfig, SubmitOptions};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = OrchestratorConfig::builder().max_concurrent_jobs(2).build()?;
//!     let provider = resolve_provider(None, None)?;
//!     let orchestrator = Orchestrator::new(
//!         config.clone(),
//!         Arc::new(PdfiumRasterizer::new(config.render_dpi)),
//!         Arc::new(LlmRecognitionModel::new(provider, config.max_tokens)),
//!     );
//!
//!     let bytes = std::fs::read("document.pdf")?;
//!     let id = orchestrator.submit(bytes, SubmitOptions::default()).await?;
//!     let status = orchestrator.wait(id, Duration::from_millis(500)).await?;
//!     println!("{}: {}", id, status.state);
//!
//!     let markdown = orchestrator.artifact(id, ArtifactKind::Markdown).await?;
//!     println!("{}", String::from_utf8_lossy(&markdown));
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `ocr-jobs` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! edgequake-ocr-jobs = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod assemble;
pub mod config;
pub mod error;
pub mod job;
pub mod limiter;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod prompts;
pub mod registry;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{OrchestratorConfig, OrchestratorConfigBuilder, SubmitOptions};
pub use error::{DocumentError, Error, JobError, ModelError, PageError};
pub use job::{JobId, JobState, JobStatus};
pub use limiter::{Gate, ResourceLimiter};
pub use orchestrator::{Orchestrator, OrchestratorStats};
pub use output::{ArtifactKind, OutcomeKind, PageDisposition, RecognitionResult};
pub use pipeline::recognize::{RecognitionModel, TokenStream};
pub use pipeline::render::Rasterizer;
pub use registry::TaskStats;
