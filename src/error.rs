//! Error types for the edgequake-ocr-jobs library.
//!
//! Failures live at three levels, and each level has its own type:
//!
//! * [`Error`] — returned as `Err` from the public [`crate::Orchestrator`]
//!   surface: unknown job, artifact not ready, rejected submission.
//!
//! * [`JobError`] — **fatal to one job**: the document could not be
//!   rasterised, a gate could not be acquired in time, or an artifact could
//!   not be written. Stored in the job record and reported by
//!   `status()`; never raised to any other job.
//!
//! * [`PageError`] — **non-fatal**: a single page failed preprocessing or
//!   recognition. Stored in that page's result slot; the job keeps going and
//!   the page contributes a marked placeholder to the aggregated text.
//!
//! [`DocumentError`] and [`ModelError`] are what the external collaborators
//! (rasteriser, recognition model) report.

use crate::job::JobId;
use crate::limiter::Gate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by the [`crate::Orchestrator`] API.
#[derive(Debug, Error)]
pub enum Error {
    /// No job with this identifier is registered (never existed or deleted).
    #[error("Job '{job_id}' not found")]
    JobNotFound { job_id: JobId },

    /// The job exists but has not completed, so it has no artifacts yet.
    #[error("Job '{job_id}' is {state}; artifacts are available once it completes")]
    ArtifactNotReady { job_id: JobId, state: String },

    /// Submitted document exceeds `max_document_bytes`.
    #[error("Document is {size} bytes, limit is {limit} bytes")]
    DocumentTooLarge { size: usize, limit: usize },

    /// Submitted document has no bytes at all.
    #[error("Document is empty")]
    EmptyDocument,

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reading an artifact or removing job storage failed.
    #[error("Storage error at '{path}': {source}")]
    Storage {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failure that ends one job in the `failed` state.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobError {
    /// The document could not be rasterised.
    #[error("Document error: {0}")]
    Document(DocumentError),

    /// A gate could not be acquired within its wait ceiling.
    #[error("{gate} gate exhausted after waiting {waited_ms}ms; retry the job later")]
    ResourceExhausted { gate: Gate, waited_ms: u64 },

    /// An artifact could not be written. Nothing partial is referenced.
    #[error("Failed to write artifact '{artifact}': {detail}")]
    Storage { artifact: String, detail: String },

    /// Unexpected internal error (e.g. a pipeline task panicked).
    #[error("Internal error: {detail}")]
    Internal { detail: String },
}

impl JobError {
    /// Whether resubmitting the same document could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::ResourceExhausted { .. })
    }
}

/// A non-fatal error for a single page. `page` is the 0-based index; the
/// message shows the 1-based page number.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageError {
    /// Crop generation failed (malformed or zero-sized page image).
    #[error("Page {}: preprocessing failed: {detail}", .page + 1)]
    Preprocess { page: usize, detail: String },

    /// The recognition model returned an error for one of the page's crops.
    #[error("Page {}: recognition failed: {detail}", .page + 1)]
    Recognition { page: usize, detail: String },

    /// The page task died before producing a result.
    #[error("Page {}: internal error: {detail}", .page + 1)]
    Internal { page: usize, detail: String },
}

impl PageError {
    pub fn page(&self) -> usize {
        match self {
            PageError::Preprocess { page, .. }
            | PageError::Recognition { page, .. }
            | PageError::Internal { page, .. } => *page,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            PageError::Preprocess { detail, .. }
            | PageError::Recognition { detail, .. }
            | PageError::Internal { detail, .. } => detail,
        }
    }
}

/// Reported by a [`crate::pipeline::render::Rasterizer`].
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DocumentError {
    /// The document header/xref is corrupt or the format is unsupported.
    #[error("document is corrupt or unsupported: {detail}")]
    Corrupt { detail: String },

    /// The document parsed but contains no pages.
    #[error("document has no pages")]
    NoPages,

    /// A page could not be rendered to an image.
    #[error("rendering page {page} failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// Page images could not be composed back into a document.
    #[error("composing document failed: {detail}")]
    ComposeFailed { detail: String },
}

/// Reported by a [`crate::pipeline::recognize::RecognitionModel`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    /// Accelerator or runtime failure while generating.
    #[error("model runtime error: {0}")]
    Runtime(String),

    /// The crop could not be handed to the model (encoding failed).
    #[error("invalid model input: {0}")]
    InvalidInput(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_exhausted_suggests_retry() {
        let e = JobError::ResourceExhausted {
            gate: Gate::Job,
            waited_ms: 1500,
        };
        let msg = e.to_string();
        assert!(msg.contains("1500ms"), "got: {msg}");
        assert!(msg.contains("retry"), "got: {msg}");
        assert!(e.is_retryable());
    }

    #[test]
    fn document_error_not_retryable() {
        let e = JobError::Document(DocumentError::NoPages);
        assert!(!e.is_retryable());
        assert!(e.to_string().contains("no pages"));
    }

    #[test]
    fn page_error_display_names_page() {
        let e = PageError::Recognition {
            page: 2,
            detail: "CUDA out of memory".into(),
        };
        assert!(e.to_string().contains("Page 3"));
        assert_eq!(e.page(), 2);
        assert_eq!(e.detail(), "CUDA out of memory");
        assert!(e.to_string().contains("CUDA"));
    }

    #[test]
    fn job_error_serialises_with_kind_tag() {
        let e = JobError::Storage {
            artifact: "markdown".into(),
            detail: "disk full".into(),
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "storage");
        assert_eq!(json["artifact"], "markdown");
    }

    #[test]
    fn every_job_error_round_trips_through_json() {
        let errors = [
            JobError::Document(DocumentError::NoPages),
            JobError::Document(DocumentError::Corrupt {
                detail: "bad xref".into(),
            }),
            JobError::ResourceExhausted {
                gate: Gate::Accelerator,
                waited_ms: 250,
            },
            JobError::Storage {
                artifact: "manifest".into(),
                detail: "read-only fs".into(),
            },
            JobError::Internal {
                detail: "assemble task panicked".into(),
            },
        ];
        for e in errors {
            let json = serde_json::to_string(&e).unwrap();
            let back: JobError = serde_json::from_str(&json).unwrap();
            assert_eq!(back, e, "via {json}");
        }
        let json = serde_json::to_value(JobError::Internal { detail: "x".into() }).unwrap();
        assert_eq!(json["kind"], "internal");
        assert_eq!(json["detail"], "x");
    }
}
