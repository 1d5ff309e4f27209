//! Pipeline stages for one page of an OCR job.
//!
//! Each submodule implements exactly one transformation step, so each is
//! independently testable and the external collaborators (rasteriser,
//! recognition model) can be swapped without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! render ──▶ preprocess ──▶ recognize ──▶ grounding
//! (pages)     (crops)        (tokens)      (boxes, clean text)
//! ```
//!
//! 1. [`render`]     — rasterise the document; runs in `spawn_blocking`
//!    because pdfium is not async-safe
//! 2. [`preprocess`] — tile each page into model-sized crops on a bounded
//!    CPU pool
//! 3. [`recognize`]  — run the model over the crops under the accelerator
//!    gate, with the repeat filter
//! 4. [`grounding`]  — parse reference/detection tags, map boxes to page
//!    space, produce clean text
//!
//! [`llm`] is the hosted-VLM implementation of the recognition model.

pub mod grounding;
pub mod llm;
pub mod preprocess;
pub mod recognize;
pub mod render;
