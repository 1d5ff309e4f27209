//! Artifact assembly: ordered page outcomes → the job's output files.
//!
//! ## Two phases
//!
//! 1. **Render** ([`render_artifacts`]) builds every artifact in memory. It
//!    is a pure function of the page images and outcomes, so the same input
//!    always yields the same text, figures and manifest.
//! 2. **Write** ([`ArtifactAssembler::assemble`]) persists each artifact
//!    with temp-file-then-rename inside the job directory. A rename is
//!    atomic on the same filesystem, so an artifact path either holds the
//!    complete file or does not exist. If any write fails, the ones already
//!    persisted are removed and the job gets a storage error instead of an
//!    artifact set.
//!
//! ## Page dispositions
//!
//! | Outcome      | `skip_repeat` | Aggregated text            |
//! |--------------|---------------|----------------------------|
//! | `ok`         | any           | recognised text            |
//! | `degenerate` | true          | omitted                    |
//! | `degenerate` | false         | "unrecognized" placeholder |
//! | `error`      | any           | "unrecognized" placeholder |
//!
//! Every page, whatever its disposition, is recorded in `manifest.json`.

use crate::config::JobOptions;
use crate::error::JobError;
use crate::job::JobId;
use crate::output::{
    ArtifactKind, ArtifactSet, JobManifest, LayoutBox, PageDisposition, PageManifest, PageOutcome,
    Rect,
};
use crate::pipeline::grounding::{self, IMAGE_LABEL};
use crate::pipeline::render::Rasterizer;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::borrow::Borrow;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Appended after every page section of the aggregated text.
pub const PAGE_SEPARATOR: &str = "\n<--- Page Split --->\n";

/// Label whose boxes are drawn with a heavier outline.
const TITLE_LABEL: &str = "title";

const PALETTE: [[u8; 3]; 8] = [
    [230, 25, 75],
    [60, 180, 75],
    [0, 130, 200],
    [245, 130, 48],
    [145, 30, 180],
    [70, 240, 240],
    [240, 50, 230],
    [128, 128, 0],
];

/// Everything a job produces, before it touches the filesystem.
#[derive(Debug, Clone)]
pub struct RenderedArtifacts {
    pub markdown: String,
    pub markdown_det: String,
    /// Page images with layout boxes drawn on them, in page order.
    pub layout_pages: Vec<DynamicImage>,
    pub images_zip: Vec<u8>,
    pub manifest: JobManifest,
}

/// Text for a page that contributes a marker instead of its content.
pub fn placeholder(page: usize, reason: &str) -> String {
    format!("[unrecognized page {}: {}]", page + 1, reason)
}

/// Build all artifacts in memory. `pages` and `outcomes` are in page order.
pub fn render_artifacts<P: Borrow<DynamicImage>>(
    job_id: JobId,
    options: &JobOptions,
    pages: &[P],
    outcomes: &[PageOutcome],
) -> Result<RenderedArtifacts, JobError> {
    if pages.len() != outcomes.len() {
        return Err(JobError::Internal {
            detail: format!(
                "{} page images but {} page outcomes",
                pages.len(),
                outcomes.len()
            ),
        });
    }

    let mut markdown = String::new();
    let mut markdown_det = String::new();
    let mut layout_pages = Vec::with_capacity(pages.len());
    let mut manifest_pages = Vec::with_capacity(pages.len());
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let zip_options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .last_modified_time(zip::DateTime::default());

    for (page, (image, outcome)) in pages.iter().zip(outcomes).enumerate() {
        let image: &DynamicImage = image.borrow();
        let mut entry = PageManifest {
            page,
            outcome: outcome.kind(),
            disposition: PageDisposition::Included,
            error: None,
            crops: outcome.result().map(|r| r.crop_count).unwrap_or(0),
            tokens: outcome.result().map(|r| r.tokens).unwrap_or(0),
            layout_boxes: 0,
            extracted_images: 0,
        };

        match outcome {
            PageOutcome::Ok(result) => {
                // Figures that clip to nothing get neither a file nor a link.
                let figures = extract_figures(image, &result.layout);
                let mut extracted = figures.iter().map(Option::is_some);
                let linked: Vec<LayoutBox> = result
                    .layout
                    .iter()
                    .filter(|b| b.label != IMAGE_LABEL || extracted.next().unwrap_or(false))
                    .cloned()
                    .collect();
                let dropped = figures.iter().filter(|f| f.is_none()).count();
                if dropped > 0 {
                    warn!("Page {}: {} figure(s) lie outside the page", page + 1, dropped);
                }

                markdown.push_str(&grounding::clean_text(&result.text, page, &linked));
                markdown.push_str(PAGE_SEPARATOR);
                markdown_det.push_str(&result.text);
                markdown_det.push_str(PAGE_SEPARATOR);

                for (n, bytes) in figures.into_iter().flatten().enumerate() {
                    zip.start_file(grounding::image_file_name(page, n), zip_options)
                        .map_err(|e| storage_error(ArtifactKind::ImagesZip, e))?;
                    zip.write_all(&bytes)
                        .map_err(|e| storage_error(ArtifactKind::ImagesZip, e))?;
                    entry.extracted_images += 1;
                }
                entry.layout_boxes = result.layout.len();
                layout_pages.push(draw_layout(image, &result.layout));
            }
            PageOutcome::Degenerate(_) if options.skip_repeat => {
                entry.disposition = PageDisposition::Omitted;
                layout_pages.push(image.clone());
            }
            PageOutcome::Degenerate(_) => {
                let text = placeholder(page, "generation did not terminate");
                push_placeholder(&mut markdown, &mut markdown_det, &text);
                entry.disposition = PageDisposition::Placeholder;
                layout_pages.push(image.clone());
            }
            PageOutcome::Error(e) => {
                let text = placeholder(page, e.detail());
                push_placeholder(&mut markdown, &mut markdown_det, &text);
                entry.disposition = PageDisposition::Placeholder;
                entry.error = Some(e.to_string());
                layout_pages.push(image.clone());
            }
        }
        manifest_pages.push(entry);
    }

    let images_zip = zip
        .finish()
        .map_err(|e| storage_error(ArtifactKind::ImagesZip, e))?
        .into_inner();

    Ok(RenderedArtifacts {
        markdown,
        markdown_det,
        layout_pages,
        images_zip,
        manifest: JobManifest {
            job_id: job_id.to_string(),
            document_name: options.document_name.clone(),
            skip_repeat: options.skip_repeat,
            crop_mode: options.crop_mode,
            pages: manifest_pages,
        },
    })
}

fn push_placeholder(markdown: &mut String, markdown_det: &mut String, text: &str) {
    for out in [markdown, markdown_det] {
        out.push_str(text);
        out.push_str(PAGE_SEPARATOR);
    }
}

fn storage_error(kind: ArtifactKind, e: impl std::fmt::Display) -> JobError {
    JobError::Storage {
        artifact: kind.to_string(),
        detail: e.to_string(),
    }
}

/// JPEG bytes for every `image` box, in layout order. `None` marks a box
/// that clips to nothing.
fn extract_figures(page: &DynamicImage, layout: &[LayoutBox]) -> Vec<Option<Vec<u8>>> {
    layout
        .iter()
        .filter(|b| b.label == IMAGE_LABEL)
        .map(|b| {
            let rect = b.rect.clamp_to(page.width(), page.height());
            if rect.is_empty() {
                return None;
            }
            let crop = page
                .crop_imm(rect.x0, rect.y0, rect.width(), rect.height())
                .to_rgb8();
            let mut buf = Vec::new();
            DynamicImage::ImageRgb8(crop)
                .write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
                .ok()?;
            Some(buf)
        })
        .collect()
}

/// Copy of `page` with every layout box outlined.
fn draw_layout(page: &DynamicImage, layout: &[LayoutBox]) -> DynamicImage {
    let mut canvas = page.to_rgb8();
    for b in layout {
        let thickness = if b.label == TITLE_LABEL { 4 } else { 2 };
        draw_outline(&mut canvas, b.rect, thickness, label_colour(&b.label));
    }
    DynamicImage::ImageRgb8(canvas)
}

/// Deterministic colour per label.
fn label_colour(label: &str) -> Rgb<u8> {
    let hash = label
        .bytes()
        .fold(2166136261u32, |h, b| (h ^ b as u32).wrapping_mul(16777619));
    Rgb(PALETTE[hash as usize % PALETTE.len()])
}

fn draw_outline(canvas: &mut RgbImage, rect: Rect, thickness: u32, colour: Rgb<u8>) {
    let rect = rect.clamp_to(canvas.width(), canvas.height());
    if rect.is_empty() {
        return;
    }
    let t = thickness.min(rect.width()).min(rect.height());
    for y in rect.y0..rect.y1 {
        for x in rect.x0..rect.x1 {
            let on_edge = x < rect.x0 + t || x >= rect.x1 - t || y < rect.y0 + t || y >= rect.y1 - t;
            if on_edge {
                canvas.put_pixel(x, y, colour);
            }
        }
    }
}

/// Writes a job's artifacts into its job-scoped directory.
#[derive(Clone)]
pub struct ArtifactAssembler {
    rasterizer: Arc<dyn Rasterizer>,
}

impl ArtifactAssembler {
    pub fn new(rasterizer: Arc<dyn Rasterizer>) -> Self {
        Self { rasterizer }
    }

    /// Build and persist every artifact. Blocking; call from `spawn_blocking`.
    ///
    /// On error no artifact file is left in `job_dir`.
    pub fn assemble<P: Borrow<DynamicImage>>(
        &self,
        job_dir: &Path,
        job_id: JobId,
        options: &JobOptions,
        pages: &[P],
        outcomes: &[PageOutcome],
    ) -> Result<ArtifactSet, JobError> {
        let rendered = render_artifacts(job_id, options, pages, outcomes)?;
        let layout_pdf = self
            .rasterizer
            .compose(&rendered.layout_pages)
            .map_err(JobError::Document)?;
        let manifest = serde_json::to_vec_pretty(&rendered.manifest)
            .map_err(|e| storage_error(ArtifactKind::Manifest, e))?;

        std::fs::create_dir_all(job_dir).map_err(|e| JobError::Storage {
            artifact: "job directory".to_string(),
            detail: format!("{}: {}", job_dir.display(), e),
        })?;

        let stem = &options.document_name;
        let contents: [(ArtifactKind, &[u8]); 5] = [
            (ArtifactKind::Markdown, rendered.markdown.as_bytes()),
            (ArtifactKind::MarkdownDet, rendered.markdown_det.as_bytes()),
            (ArtifactKind::PdfLayout, &layout_pdf),
            (ArtifactKind::ImagesZip, &rendered.images_zip),
            (ArtifactKind::Manifest, &manifest),
        ];

        let mut written: Vec<PathBuf> = Vec::with_capacity(contents.len());
        for (kind, bytes) in contents {
            let path = job_dir.join(kind.file_name(stem));
            match write_atomic(job_dir, &path, bytes) {
                Ok(()) => {
                    debug!("Wrote {} ({} bytes)", path.display(), bytes.len());
                    written.push(path);
                }
                Err(e) => {
                    for p in &written {
                        let _ = std::fs::remove_file(p);
                    }
                    return Err(storage_error(kind, format!("{}: {}", path.display(), e)));
                }
            }
        }

        info!("Job {}: {} artifacts written to {}", job_id, written.len(), job_dir.display());
        Ok(ArtifactSet {
            markdown: job_dir.join(ArtifactKind::Markdown.file_name(stem)),
            markdown_det: job_dir.join(ArtifactKind::MarkdownDet.file_name(stem)),
            pdf_layout: job_dir.join(ArtifactKind::PdfLayout.file_name(stem)),
            images_zip: job_dir.join(ArtifactKind::ImagesZip.file_name(stem)),
            manifest: job_dir.join(ArtifactKind::Manifest.file_name(stem)),
        })
    }
}

/// Write to a temp file in `dir`, then rename over `path`.
fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrchestratorConfig, SubmitOptions};
    use crate::error::{DocumentError, PageError};
    use crate::output::{OutcomeKind, RecognitionResult};
    use std::io::Read;

    struct NullRasterizer;

    impl Rasterizer for NullRasterizer {
        fn rasterize(&self, _document: &[u8]) -> Result<Vec<DynamicImage>, DocumentError> {
            Err(DocumentError::NoPages)
        }

        fn compose(&self, pages: &[DynamicImage]) -> Result<Vec<u8>, DocumentError> {
            Ok(format!("PDF {} pages", pages.len()).into_bytes())
        }
    }

    fn options(skip_repeat: bool) -> JobOptions {
        SubmitOptions::default()
            .skip_repeat(skip_repeat)
            .document_name("report.pdf")
            .resolve(&OrchestratorConfig::default())
    }

    fn page() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 100, Rgb([255, 255, 255])))
    }

    fn ok(text: &str, layout: Vec<LayoutBox>) -> PageOutcome {
        PageOutcome::Ok(RecognitionResult {
            text: text.into(),
            layout,
            degenerate: false,
            crop_count: 1,
            tokens: 3,
            duration_ms: 1,
        })
    }

    fn degenerate() -> PageOutcome {
        PageOutcome::Degenerate(RecognitionResult {
            text: "row row row".into(),
            layout: vec![],
            degenerate: true,
            crop_count: 1,
            tokens: 8192,
            duration_ms: 1,
        })
    }

    fn figure_page() -> PageOutcome {
        let text = "<|ref|>image<|/ref|><|det|>[[0, 0, 500, 999]]<|/det|>\ncaption";
        let layout = grounding::layout_boxes(text, &[(0, Rect::new(0, 0, 200, 100))]);
        ok(text, layout)
    }

    #[test]
    fn pages_appear_in_order_with_separators() {
        let outcomes = vec![ok("one", vec![]), ok("two", vec![]), ok("three", vec![])];
        let pages = vec![page(), page(), page()];
        let r = render_artifacts(JobId::new(), &options(true), &pages, &outcomes).unwrap();
        let sections: Vec<&str> = r.markdown.split(PAGE_SEPARATOR).collect();
        assert_eq!(sections, vec!["one", "two", "three", ""]);
        assert_eq!(r.layout_pages.len(), 3);
    }

    #[test]
    fn degenerate_page_omitted_with_skip_repeat() {
        let outcomes = vec![ok("a", vec![]), degenerate(), ok("c", vec![])];
        let pages = vec![page(), page(), page()];
        let r = render_artifacts(JobId::new(), &options(true), &pages, &outcomes).unwrap();
        assert_eq!(r.markdown, format!("a{PAGE_SEPARATOR}c{PAGE_SEPARATOR}"));
        assert_eq!(r.manifest.pages[1].outcome, OutcomeKind::Degenerate);
        assert_eq!(r.manifest.pages[1].disposition, PageDisposition::Omitted);
    }

    #[test]
    fn degenerate_page_is_placeholder_without_skip_repeat() {
        let outcomes = vec![ok("a", vec![]), degenerate()];
        let pages = vec![page(), page()];
        let r = render_artifacts(JobId::new(), &options(false), &pages, &outcomes).unwrap();
        assert!(r.markdown.contains("[unrecognized page 2"));
        assert!(!r.markdown.contains("row row row"));
        assert_eq!(r.manifest.pages[1].disposition, PageDisposition::Placeholder);
    }

    #[test]
    fn page_error_becomes_marked_placeholder() {
        let outcomes = vec![PageOutcome::Error(PageError::Recognition {
            page: 0,
            detail: "device lost".into(),
        })];
        let r = render_artifacts(JobId::new(), &options(true), &[page()], &outcomes).unwrap();
        assert!(r.markdown.starts_with("[unrecognized page 1"));
        assert!(r.markdown.contains("device lost"));
        assert!(r.manifest.pages[0].error.is_some());
    }

    #[test]
    fn figures_are_extracted_and_linked() {
        let r = render_artifacts(JobId::new(), &options(true), &[page()], &[figure_page()]).unwrap();
        assert!(r.markdown.contains("![](images/0_0.jpg)"));
        assert!(r.markdown_det.contains("<|ref|>image<|/ref|>"));
        assert_eq!(r.manifest.pages[0].extracted_images, 1);

        let mut archive = zip::ZipArchive::new(Cursor::new(r.images_zip)).unwrap();
        assert_eq!(archive.len(), 1);
        let mut file = archive.by_name("0_0.jpg").unwrap();
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).unwrap();
        let img = image::load_from_memory(&bytes).unwrap();
        assert_eq!((img.width(), img.height()), (100, 100));
    }

    #[test]
    fn figure_outside_page_is_neither_extracted_nor_linked() {
        let text = "<|ref|>image<|/ref|><|det|>[[0, 0, 999, 999]]<|/det|>\n\
<|ref|>image<|/ref|><|det|>[[0, 0, 500, 999]]<|/det|>\ncaption";
        let layout = vec![
            LayoutBox {
                label: IMAGE_LABEL.into(),
                rect: Rect::new(300, 0, 400, 100),
                reference: 0,
            },
            LayoutBox {
                label: IMAGE_LABEL.into(),
                rect: Rect::new(0, 0, 100, 100),
                reference: 1,
            },
        ];
        let r = render_artifacts(JobId::new(), &options(true), &[page()], &[ok(text, layout)]).unwrap();

        assert_eq!(r.markdown.matches("![](images/").count(), 1, "got: {}", r.markdown);
        assert!(r.markdown.contains("![](images/0_0.jpg)"));
        assert_eq!(r.manifest.pages[0].extracted_images, 1);
        assert_eq!(r.manifest.pages[0].layout_boxes, 2);

        let mut archive = zip::ZipArchive::new(Cursor::new(r.images_zip)).unwrap();
        assert_eq!(archive.len(), 1);
        assert!(archive.by_name("0_0.jpg").is_ok());
    }

    #[test]
    fn layout_boxes_are_drawn() {
        let r = render_artifacts(JobId::new(), &options(true), &[page()], &[figure_page()]).unwrap();
        let drawn = r.layout_pages[0].to_rgb8();
        assert_ne!(*drawn.get_pixel(0, 0), Rgb([255, 255, 255]));
        assert_eq!(*drawn.get_pixel(50, 50), Rgb([255, 255, 255]));
    }

    #[test]
    fn rendering_is_deterministic() {
        let outcomes = vec![figure_page(), degenerate()];
        let pages = vec![page(), page()];
        let id = JobId::new();
        let a = render_artifacts(id, &options(false), &pages, &outcomes).unwrap();
        let b = render_artifacts(id, &options(false), &pages, &outcomes).unwrap();
        assert_eq!(a.markdown, b.markdown);
        assert_eq!(a.images_zip, b.images_zip);
        assert_eq!(a.manifest, b.manifest);
    }

    #[test]
    fn assemble_writes_every_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let job_dir = dir.path().join("job");
        let assembler = ArtifactAssembler::new(Arc::new(NullRasterizer));
        let set = assembler
            .assemble(&job_dir, JobId::new(), &options(true), &[page()], &[ok("x", vec![])])
            .unwrap();
        for kind in ArtifactKind::ALL {
            assert!(set.path(kind).is_file(), "{kind} missing");
        }
        assert!(set.markdown.ends_with("report.md"));
        assert_eq!(std::fs::read(&set.pdf_layout).unwrap(), b"PDF 1 pages");
        // Only the five artifacts, no leftover temp files.
        assert_eq!(std::fs::read_dir(&job_dir).unwrap().count(), 5);
    }

    #[test]
    fn unwritable_job_dir_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("job");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let assembler = ArtifactAssembler::new(Arc::new(NullRasterizer));
        let err = assembler
            .assemble(&blocker, JobId::new(), &options(true), &[page()], &[ok("x", vec![])])
            .unwrap_err();
        assert!(matches!(err, JobError::Storage { .. }));
    }

    #[test]
    fn mismatched_inputs_are_rejected() {
        let err = render_artifacts(JobId::new(), &options(true), &[page()], &[]).unwrap_err();
        assert!(matches!(err, JobError::Internal { .. }));
    }
}
