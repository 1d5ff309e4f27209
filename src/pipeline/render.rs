//! Document rasterisation and layout-document composition.
//!
//! The pipeline treats the rasteriser as an external collaborator behind the
//! [`Rasterizer`] trait: bytes in, one image per page out, and page images
//! back into a document for the layout artifact. [`PdfiumRasterizer`] is the
//! production implementation.
//!
//! ## Why blocking methods?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! The trait is synchronous and the orchestrator always calls it through
//! `tokio::task::spawn_blocking`, so Tokio worker threads never stall during
//! CPU-heavy rendering.

use crate::error::DocumentError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use tracing::{debug, info};

/// PDF user-space units per inch.
const POINTS_PER_INCH: f32 = 72.0;

/// Turns documents into page images and page images into documents.
pub trait Rasterizer: Send + Sync {
    /// Render every page of `document`, in page order.
    fn rasterize(&self, document: &[u8]) -> Result<Vec<DynamicImage>, DocumentError>;

    /// Build a document with one full-bleed page per image.
    fn compose(&self, pages: &[DynamicImage]) -> Result<Vec<u8>, DocumentError>;
}

/// Rasteriser backed by the system pdfium library.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    dpi: u32,
}

impl PdfiumRasterizer {
    pub fn new(dpi: u32) -> Self {
        Self { dpi }
    }

    pub fn dpi(&self) -> u32 {
        self.dpi
    }
}

/// Render scale that turns page points into pixels at `dpi`.
pub fn scale_for_dpi(dpi: u32) -> f32 {
    dpi as f32 / POINTS_PER_INCH
}

/// Page size in points for an image rendered at `dpi`.
pub fn points_for_pixels(pixels: u32, dpi: u32) -> f32 {
    pixels as f32 / scale_for_dpi(dpi)
}

impl Rasterizer for PdfiumRasterizer {
    fn rasterize(&self, document: &[u8]) -> Result<Vec<DynamicImage>, DocumentError> {
        let pdfium = Pdfium::default();
        let doc = pdfium
            .load_pdf_from_byte_slice(document, None)
            .map_err(|e| DocumentError::Corrupt {
                detail: format!("{:?}", e),
            })?;

        let pages = doc.pages();
        let total = pages.len() as usize;
        if total == 0 {
            return Err(DocumentError::NoPages);
        }
        info!("PDF loaded: {} pages", total);

        let render_config = PdfRenderConfig::new().scale_page_by_factor(scale_for_dpi(self.dpi));

        let mut images = Vec::with_capacity(total);
        for idx in 0..total {
            let page = pages
                .get(idx as u16)
                .map_err(|e| DocumentError::RenderFailed {
                    page: idx,
                    detail: format!("{:?}", e),
                })?;
            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| DocumentError::RenderFailed {
                    page: idx,
                    detail: format!("{:?}", e),
                })?;
            let image = bitmap.as_image();
            debug!(
                "Rendered page {} → {}x{} px",
                idx + 1,
                image.width(),
                image.height()
            );
            images.push(image);
        }
        Ok(images)
    }

    fn compose(&self, pages: &[DynamicImage]) -> Result<Vec<u8>, DocumentError> {
        let compose_err = |e: PdfiumError| DocumentError::ComposeFailed {
            detail: format!("{:?}", e),
        };

        let pdfium = Pdfium::default();
        let mut doc = pdfium.create_new_pdf().map_err(compose_err)?;

        for image in pages {
            let width = PdfPoints::new(points_for_pixels(image.width(), self.dpi));
            let height = PdfPoints::new(points_for_pixels(image.height(), self.dpi));
            let object = PdfPageImageObject::new_with_width(&doc, image, width).map_err(compose_err)?;
            let mut page = doc
                .pages_mut()
                .create_page_at_end(PdfPagePaperSize::from_points(width, height))
                .map_err(compose_err)?;
            page.objects_mut()
                .add_image_object(object)
                .map_err(compose_err)?;
        }

        let bytes = doc.save_to_bytes().map_err(compose_err)?;
        debug!("Composed {} pages → {} bytes", pages.len(), bytes.len());
        Ok(bytes)
    }
}
