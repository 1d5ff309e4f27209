//! Per-page results and the artifacts assembled from them.

use crate::error::PageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Axis-aligned rectangle in page pixel coordinates (`x1`/`y1` exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Rect {
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Clip to a `width` × `height` image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Rect {
        Rect {
            x0: self.x0.min(width),
            y0: self.y0.min(height),
            x1: self.x1.min(width),
            y1: self.y1.min(height),
        }
    }
}

/// A labelled region the model detected on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutBox {
    /// Detection label, e.g. `title`, `text`, `table`, `image`.
    pub label: String,
    /// Region in page pixel coordinates.
    pub rect: Rect,
    /// Index of the reference tag (in page text order) this box came from.
    pub reference: usize,
}

/// What the recognition pass produced for one page. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    /// Crop outputs merged in tiling order, end markers stripped, tags kept.
    pub text: String,
    /// Detected regions, mapped from crop space into page space.
    pub layout: Vec<LayoutBox>,
    /// Set when any crop ran out of budget without emitting the end marker.
    pub degenerate: bool,
    /// Number of crops the page was tiled into.
    pub crop_count: usize,
    /// Tokens consumed across all crops.
    pub tokens: usize,
    /// Wall-clock time spent holding the accelerator gate.
    pub duration_ms: u64,
}

/// The tri-state outcome of one page, as consumed by the assembler.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    /// Recognised and terminated normally.
    Ok(RecognitionResult),
    /// Recognition ran away (no end marker within budget).
    Degenerate(RecognitionResult),
    /// Preprocessing or recognition failed for this page.
    Error(PageError),
}

impl PageOutcome {
    pub fn from_result(result: RecognitionResult) -> Self {
        if result.degenerate {
            PageOutcome::Degenerate(result)
        } else {
            PageOutcome::Ok(result)
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            PageOutcome::Ok(_) => OutcomeKind::Ok,
            PageOutcome::Degenerate(_) => OutcomeKind::Degenerate,
            PageOutcome::Error(_) => OutcomeKind::Error,
        }
    }

    pub fn result(&self) -> Option<&RecognitionResult> {
        match self {
            PageOutcome::Ok(r) | PageOutcome::Degenerate(r) => Some(r),
            PageOutcome::Error(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Ok,
    Degenerate,
    Error,
}

/// How a page ended up in the aggregated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageDisposition {
    /// Recognised text included as-is.
    Included,
    /// Replaced by an explicit "unrecognized" marker.
    Placeholder,
    /// Left out entirely (degenerate page with `skip_repeat`).
    Omitted,
}

/// One entry of the per-job manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageManifest {
    pub page: usize,
    pub outcome: OutcomeKind,
    pub disposition: PageDisposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub crops: usize,
    pub tokens: usize,
    pub layout_boxes: usize,
    pub extracted_images: usize,
}

/// The audit record written next to the other artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobManifest {
    pub job_id: String,
    pub document_name: String,
    pub skip_repeat: bool,
    pub crop_mode: bool,
    pub pages: Vec<PageManifest>,
}

/// The downloadable outputs of a completed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Clean text, pages in order, page boundaries marked.
    Markdown,
    /// Same text with reference/detection tags kept.
    MarkdownDet,
    /// The document with layout boxes drawn on every page.
    PdfLayout,
    /// Extracted figures, zipped.
    ImagesZip,
    /// Per-page outcome record (JSON).
    Manifest,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::Markdown,
        ArtifactKind::MarkdownDet,
        ArtifactKind::PdfLayout,
        ArtifactKind::ImagesZip,
        ArtifactKind::Manifest,
    ];

    /// File name inside the job directory for a document named `stem`.
    pub fn file_name(&self, stem: &str) -> String {
        match self {
            ArtifactKind::Markdown => format!("{stem}.md"),
            ArtifactKind::MarkdownDet => format!("{stem}_det.md"),
            ArtifactKind::PdfLayout => format!("{stem}_layouts.pdf"),
            ArtifactKind::ImagesZip => "images.zip".to_string(),
            ArtifactKind::Manifest => "manifest.json".to_string(),
        }
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            ArtifactKind::Markdown | ArtifactKind::MarkdownDet => "text/markdown",
            ArtifactKind::PdfLayout => "application/pdf",
            ArtifactKind::ImagesZip => "application/zip",
            ArtifactKind::Manifest => "application/json",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Markdown => "markdown",
            ArtifactKind::MarkdownDet => "markdown_det",
            ArtifactKind::PdfLayout => "pdf_layout",
            ArtifactKind::ImagesZip => "images_zip",
            ArtifactKind::Manifest => "manifest",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArtifactKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| {
                format!("unknown artifact '{s}' (expected markdown | markdown_det | pdf_layout | images_zip | manifest)")
            })
    }
}

/// Where a completed job's artifacts live. Only fully written files appear here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub markdown: PathBuf,
    pub markdown_det: PathBuf,
    pub pdf_layout: PathBuf,
    pub images_zip: PathBuf,
    pub manifest: PathBuf,
}

impl ArtifactSet {
    pub fn path(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::Markdown => &self.markdown,
            ArtifactKind::MarkdownDet => &self.markdown_det,
            ArtifactKind::PdfLayout => &self.pdf_layout,
            ArtifactKind::ImagesZip => &self.images_zip,
            ArtifactKind::Manifest => &self.manifest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(degenerate: bool) -> RecognitionResult {
        RecognitionResult {
            text: "hello".into(),
            layout: vec![],
            degenerate,
            crop_count: 1,
            tokens: 2,
            duration_ms: 0,
        }
    }

    #[test]
    fn outcome_from_result_follows_flag() {
        assert_eq!(PageOutcome::from_result(result(false)).kind(), OutcomeKind::Ok);
        assert_eq!(
            PageOutcome::from_result(result(true)).kind(),
            OutcomeKind::Degenerate
        );
    }

    #[test]
    fn artifact_kind_parses_wire_names() {
        for kind in ArtifactKind::ALL {
            assert_eq!(kind.as_str().parse::<ArtifactKind>().unwrap(), kind);
        }
        assert!("pdf".parse::<ArtifactKind>().is_err());
    }

    #[test]
    fn artifact_file_names_use_stem() {
        assert_eq!(ArtifactKind::Markdown.file_name("paper"), "paper.md");
        assert_eq!(ArtifactKind::MarkdownDet.file_name("paper"), "paper_det.md");
        assert_eq!(ArtifactKind::PdfLayout.file_name("paper"), "paper_layouts.pdf");
    }

    #[test]
    fn rect_clamps_to_image() {
        let r = Rect::new(10, 10, 500, 300).clamp_to(200, 100);
        assert_eq!(r, Rect::new(10, 10, 200, 100));
        assert!(!r.is_empty());
        assert!(Rect::new(5, 5, 5, 9).is_empty());
    }
}
