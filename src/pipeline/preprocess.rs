//! Page preprocessing: raw page image → normalised crops for recognition.
//!
//! ## Why a separate pool?
//!
//! Resizing and tiling a 150-DPI page is pure CPU work. It runs on tokio's
//! blocking threads (like rasterisation), but at most `preprocess_workers`
//! pages are tiled at once so a 500-page upload cannot flood the blocking
//! pool. This pool is independent of the accelerator gate: pages can be
//! tiled ahead while the model is busy.
//!
//! ## Tiling
//!
//! With crop mode off, the page becomes a single crop scaled to fit
//! `base_size`. With crop mode on, the page is split into a `cols × rows`
//! grid with `min_crops ≤ cols·rows ≤ max_crops`, picking the grid whose
//! aspect ratio is closest to the page's. Tiles are exact integer
//! partitions of the page, so they cover it with no gaps or overlap, and
//! each tile is resized to `image_size²`.

use crate::config::PreprocessOptions;
use crate::error::PageError;
use crate::output::Rect;
use image::imageops::FilterType;
use image::DynamicImage;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// One normalised piece of a page, ready for the model.
#[derive(Debug, Clone)]
pub struct Crop {
    pub image: DynamicImage,
    /// Source region in page pixel coordinates.
    pub region: Rect,
    pub row: u32,
    pub col: u32,
}

/// Bounded pool of CPU workers that tile pages.
#[derive(Debug, Clone)]
pub struct PreprocessPool {
    slots: Arc<Semaphore>,
    workers: usize,
}

impl PreprocessPool {
    pub fn new(workers: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Workers currently tiling a page.
    pub fn busy(&self) -> usize {
        self.workers
            .saturating_sub(self.slots.available_permits())
    }

    /// Tile `image` (page `page`, 0-based) into crops, in row-major order.
    ///
    /// Waits for a free worker first. Failures are reported for this page
    /// only.
    pub async fn preprocess(
        &self,
        page: usize,
        image: Arc<DynamicImage>,
        options: PreprocessOptions,
    ) -> Result<Vec<Crop>, PageError> {
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|e| PageError::Internal {
                page,
                detail: format!("preprocess pool closed: {e}"),
            })?;

        tokio::task::spawn_blocking(move || {
            // Held until the blocking work ends, even if the caller goes away.
            let _slot = slot;
            tile_page(&image, &options).map_err(|detail| PageError::Preprocess { page, detail })
        })
        .await
        .map_err(|e| PageError::Internal {
            page,
            detail: format!("preprocess task panicked: {e}"),
        })?
    }
}

/// Blocking implementation of [`PreprocessPool::preprocess`].
pub fn tile_page(image: &DynamicImage, options: &PreprocessOptions) -> Result<Vec<Crop>, String> {
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return Err(format!("page image is empty ({width}x{height})"));
    }

    if !options.crop_mode {
        let size = options.base_size;
        let resized = image.resize(size, size, FilterType::Lanczos3);
        debug!("Whole-page crop {}x{} → {}x{}", width, height, resized.width(), resized.height());
        return Ok(vec![Crop {
            image: resized,
            region: Rect::new(0, 0, width, height),
            row: 0,
            col: 0,
        }]);
    }

    let (cols, rows) = choose_grid(
        width,
        height,
        options.image_size,
        options.min_crops,
        options.max_crops,
    );
    if width < cols || height < rows {
        return Err(format!(
            "page {width}x{height} is too small for a {cols}x{rows} grid"
        ));
    }

    let mut crops = Vec::with_capacity((cols * rows) as usize);
    for row in 0..rows {
        let y0 = partition(height, rows, row);
        let y1 = partition(height, rows, row + 1);
        for col in 0..cols {
            let x0 = partition(width, cols, col);
            let x1 = partition(width, cols, col + 1);
            let tile = image
                .crop_imm(x0, y0, x1 - x0, y1 - y0)
                .resize_exact(options.image_size, options.image_size, FilterType::Lanczos3);
            crops.push(Crop {
                image: tile,
                region: Rect::new(x0, y0, x1, y1),
                row,
                col,
            });
        }
    }
    debug!("Tiled {}x{} page into {}x{} grid", width, height, cols, rows);
    Ok(crops)
}

/// Start of the `index`-th of `parts` equal integer spans over `len`.
fn partition(len: u32, parts: u32, index: u32) -> u32 {
    ((len as u64 * index as u64) / parts as u64) as u32
}

/// Pick the `(cols, rows)` grid for a `width × height` page.
///
/// Candidates are every grid whose tile count lies in `[min, max]`, visited
/// by ascending tile count. The closest aspect ratio wins; on a tie the
/// larger grid wins only if the page has enough pixels to fill more than half
/// of it at `image_size` per tile.
pub fn choose_grid(width: u32, height: u32, image_size: u32, min: usize, max: usize) -> (u32, u32) {
    let mut candidates: Vec<(u32, u32)> = Vec::new();
    for cols in 1..=max as u32 {
        for rows in 1..=max as u32 {
            let n = (cols * rows) as usize;
            if n >= min && n <= max {
                candidates.push((cols, rows));
            }
        }
    }
    candidates.sort_by_key(|&(c, r)| (c * r, c, r));

    let aspect = width as f64 / height.max(1) as f64;
    let area = width as f64 * height as f64;
    let tile_area = image_size as f64 * image_size as f64;

    let mut best = candidates.first().copied().unwrap_or((1, 1));
    let mut best_diff = f64::INFINITY;
    for (cols, rows) in candidates {
        let diff = (aspect - cols as f64 / rows as f64).abs();
        if diff < best_diff {
            best_diff = diff;
            best = (cols, rows);
        } else if diff == best_diff && area > 0.5 * tile_area * (cols * rows) as f64 {
            best = (cols, rows);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn page(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([255, 255, 255])))
    }

    fn options(crop_mode: bool) -> PreprocessOptions {
        PreprocessOptions {
            base_size: 1024,
            image_size: 640,
            min_crops: 2,
            max_crops: 6,
            crop_mode,
        }
    }

    #[test]
    fn crop_mode_off_yields_single_resized_crop() {
        let crops = tile_page(&page(2000, 1000), &options(false)).unwrap();
        assert_eq!(crops.len(), 1);
        assert_eq!(crops[0].image.width(), 1024);
        assert_eq!(crops[0].image.height(), 512);
        assert_eq!(crops[0].region, Rect::new(0, 0, 2000, 1000));
    }

    #[test]
    fn grid_tracks_aspect_ratio() {
        // Portrait A4-ish page → more rows than columns.
        let (c, r) = choose_grid(1190, 1684, 640, 2, 6);
        assert!(r > c, "got {c}x{r}");
        // Wide page → more columns.
        let (c, r) = choose_grid(3000, 1000, 640, 2, 6);
        assert_eq!((c, r), (3, 1));
    }

    #[test]
    fn grid_count_stays_in_bounds() {
        for (w, h) in [(100, 5000), (5000, 100), (640, 640), (1, 1), (4000, 4000)] {
            for (min, max) in [(2, 6), (1, 1), (3, 9), (4, 4)] {
                let (c, r) = choose_grid(w, h, 640, min, max);
                let n = (c * r) as usize;
                assert!(n >= min && n <= max, "{w}x{h} [{min},{max}] → {c}x{r}");
            }
        }
    }

    #[test]
    fn tiles_cover_page_without_gaps() {
        let crops = tile_page(&page(1001, 1403), &options(true)).unwrap();
        assert!((2..=6).contains(&crops.len()));

        let covered: u64 = crops
            .iter()
            .map(|c| c.region.width() as u64 * c.region.height() as u64)
            .sum();
        assert_eq!(covered, 1001 * 1403);
        for crop in &crops {
            assert_eq!((crop.image.width(), crop.image.height()), (640, 640));
        }
        // Row-major order.
        let order: Vec<(u32, u32)> = crops.iter().map(|c| (c.row, c.col)).collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
        assert_eq!(crops.last().unwrap().region.x1, 1001);
        assert_eq!(crops.last().unwrap().region.y1, 1403);
    }

    #[test]
    fn empty_page_is_an_error() {
        let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(tile_page(&empty, &options(true)).is_err());
    }

    #[tokio::test]
    async fn pool_reports_page_error() {
        let pool = PreprocessPool::new(2);
        let empty = Arc::new(DynamicImage::ImageRgb8(RgbImage::new(0, 0)));
        let err = pool.preprocess(7, empty, options(true)).await.unwrap_err();
        assert!(matches!(err, PageError::Preprocess { page: 7, .. }));
        assert_eq!(pool.busy(), 0);
    }
}
