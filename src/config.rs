//! Configuration types for the job orchestrator.
//!
//! Every knob lives in [`OrchestratorConfig`], built once at startup through
//! [`OrchestratorConfigBuilder`] and cloned by value into each component.
//! Per-job overrides travel in [`SubmitOptions`] and are resolved against
//! the config into [`JobOptions`] when the job is registered.

use crate::error::Error;
use crate::prompts::DEFAULT_PROMPT;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Smallest crop edge the tiler will produce.
pub const MIN_IMAGE_SIZE: u32 = 28;

/// Largest tile count a page may be split into.
pub const MAX_CROPS: usize = 64;

/// Configuration for an [`crate::Orchestrator`].
///
/// # Example
/// ```rust
/// use edgequake_ocr_jobs::OrchestratorConfig;
///
/// let config = OrchestratorConfig::builder()
///     .max_concurrent_jobs(2)
///     .max_concurrent_recognitions(1)
///     .crop_bounds(2, 6)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_concurrent_jobs, 2);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Job gate ceiling: pipelines in `processing` at once. Default: 8.
    pub max_concurrent_jobs: usize,

    /// Accelerator gate ceiling: simultaneous recognition calls. Default: 4.
    pub max_concurrent_recognitions: usize,

    /// Preprocessing pool size (CPU-bound crop generation). Default: available parallelism.
    pub preprocess_workers: usize,

    /// Longest a job may wait in `queued` before failing as exhausted. Default: wait forever.
    pub job_gate_timeout: Option<Duration>,

    /// Longest a page may wait for the accelerator before its job fails. Default: wait forever.
    pub accelerator_gate_timeout: Option<Duration>,

    /// Edge length of the whole-page view when crop mode is off. Default: 1024.
    pub base_size: u32,

    /// Edge length of each tile in crop mode. Default: 640.
    pub image_size: u32,

    /// Fewest tiles per page in crop mode. Default: 2.
    pub min_crops: usize,

    /// Most tiles per page in crop mode. Default: 6.
    pub max_crops: usize,

    /// Tile pages unless a job says otherwise. Default: true.
    pub crop_mode: bool,

    /// Generation budget per crop, in tokens. Default: 8192.
    ///
    /// A crop that reaches the budget without the end marker is degenerate.
    pub max_tokens: usize,

    /// Drop degenerate pages unless a job says otherwise. Default: true.
    pub skip_repeat: bool,

    /// Prompt used when a job supplies none.
    pub default_prompt: String,

    /// Root of the job-scoped directories. Default: `$TMPDIR/edgequake-ocr-jobs`.
    pub work_dir: PathBuf,

    /// Largest accepted document. Default: 100 MiB.
    pub max_document_bytes: usize,

    /// Rasterisation resolution for the pdfium backend. Default: 144.
    pub render_dpi: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 8,
            max_concurrent_recognitions: 4,
            preprocess_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            job_gate_timeout: None,
            accelerator_gate_timeout: None,
            base_size: 1024,
            image_size: 640,
            min_crops: 2,
            max_crops: 6,
            crop_mode: true,
            max_tokens: 8192,
            skip_repeat: true,
            default_prompt: DEFAULT_PROMPT.to_string(),
            work_dir: std::env::temp_dir().join("edgequake-ocr-jobs"),
            max_document_bytes: 100 * 1024 * 1024,
            render_dpi: 144,
        }
    }
}

impl OrchestratorConfig {
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder {
            config: Self::default(),
        }
    }

    /// Preprocessing options for a job, honouring its crop-mode choice.
    pub fn preprocess_options(&self, crop_mode: bool) -> PreprocessOptions {
        PreprocessOptions {
            base_size: self.base_size,
            image_size: self.image_size,
            min_crops: self.min_crops,
            max_crops: self.max_crops,
            crop_mode,
        }
    }
}

/// Builder for [`OrchestratorConfig`].
#[derive(Debug)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    pub fn max_concurrent_jobs(mut self, n: usize) -> Self {
        self.config.max_concurrent_jobs = n;
        self
    }

    pub fn max_concurrent_recognitions(mut self, n: usize) -> Self {
        self.config.max_concurrent_recognitions = n;
        self
    }

    pub fn preprocess_workers(mut self, n: usize) -> Self {
        self.config.preprocess_workers = n;
        self
    }

    pub fn job_gate_timeout(mut self, timeout: Duration) -> Self {
        self.config.job_gate_timeout = Some(timeout);
        self
    }

    pub fn accelerator_gate_timeout(mut self, timeout: Duration) -> Self {
        self.config.accelerator_gate_timeout = Some(timeout);
        self
    }

    pub fn base_size(mut self, px: u32) -> Self {
        self.config.base_size = px;
        self
    }

    pub fn image_size(mut self, px: u32) -> Self {
        self.config.image_size = px;
        self
    }

    pub fn crop_bounds(mut self, min: usize, max: usize) -> Self {
        self.config.min_crops = min;
        self.config.max_crops = max;
        self
    }

    pub fn crop_mode(mut self, v: bool) -> Self {
        self.config.crop_mode = v;
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn skip_repeat(mut self, v: bool) -> Self {
        self.config.skip_repeat = v;
        self
    }

    pub fn default_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.default_prompt = prompt.into();
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = dir.into();
        self
    }

    pub fn max_document_bytes(mut self, n: usize) -> Self {
        self.config.max_document_bytes = n;
        self
    }

    pub fn render_dpi(mut self, dpi: u32) -> Self {
        self.config.render_dpi = dpi.clamp(72, 400);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<OrchestratorConfig, Error> {
        let c = &self.config;
        if c.max_concurrent_jobs == 0 {
            return Err(Error::InvalidConfig("max_concurrent_jobs must be ≥ 1".into()));
        }
        if c.max_concurrent_recognitions == 0 {
            return Err(Error::InvalidConfig(
                "max_concurrent_recognitions must be ≥ 1".into(),
            ));
        }
        if c.preprocess_workers == 0 {
            return Err(Error::InvalidConfig("preprocess_workers must be ≥ 1".into()));
        }
        if c.min_crops == 0 || c.min_crops > c.max_crops {
            return Err(Error::InvalidConfig(format!(
                "crop bounds must satisfy 1 ≤ min ≤ max, got {}..{}",
                c.min_crops, c.max_crops
            )));
        }
        if c.max_crops > MAX_CROPS {
            return Err(Error::InvalidConfig(format!(
                "max_crops must be ≤ {MAX_CROPS}, got {}",
                c.max_crops
            )));
        }
        if c.base_size < MIN_IMAGE_SIZE || c.image_size < MIN_IMAGE_SIZE {
            return Err(Error::InvalidConfig(format!(
                "base_size and image_size must be ≥ {MIN_IMAGE_SIZE}px"
            )));
        }
        if c.max_tokens == 0 {
            return Err(Error::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if c.max_document_bytes == 0 {
            return Err(Error::InvalidConfig("max_document_bytes must be ≥ 1".into()));
        }
        Ok(self.config)
    }
}

/// Inputs to the preprocessing pool for one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocessOptions {
    pub base_size: u32,
    pub image_size: u32,
    pub min_crops: usize,
    pub max_crops: usize,
    pub crop_mode: bool,
}

/// Per-job overrides supplied at submission. Unset fields fall back to the config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitOptions {
    pub prompt: Option<String>,
    pub crop_mode: Option<bool>,
    pub skip_repeat: Option<bool>,
    /// Stem for artifact file names, e.g. the uploaded file's name.
    pub document_name: Option<String>,
}

impl SubmitOptions {
    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn crop_mode(mut self, v: bool) -> Self {
        self.crop_mode = Some(v);
        self
    }

    pub fn skip_repeat(mut self, v: bool) -> Self {
        self.skip_repeat = Some(v);
        self
    }

    pub fn document_name(mut self, name: impl Into<String>) -> Self {
        self.document_name = Some(name.into());
        self
    }

    /// Resolve against the orchestrator defaults.
    pub fn resolve(self, config: &OrchestratorConfig) -> JobOptions {
        JobOptions {
            prompt: self
                .prompt
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| config.default_prompt.clone()),
            crop_mode: self.crop_mode.unwrap_or(config.crop_mode),
            skip_repeat: self.skip_repeat.unwrap_or(config.skip_repeat),
            document_name: sanitize_stem(self.document_name.as_deref()),
        }
    }
}

/// Fully resolved options of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub prompt: String,
    pub crop_mode: bool,
    pub skip_repeat: bool,
    pub document_name: String,
}

/// Reduce a user-supplied file name to a safe artifact stem.
///
/// Drops any directory part and a trailing `.pdf`, and replaces characters
/// outside `[A-Za-z0-9._-]` so artifacts never escape the job directory.
fn sanitize_stem(name: Option<&str>) -> String {
    let raw = name.unwrap_or_default();
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let base = base
        .strip_suffix(".pdf")
        .or_else(|| base.strip_suffix(".PDF"))
        .unwrap_or(base);
    let stem: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim_matches('.');
    if stem.is_empty() {
        "document".to_string()
    } else {
        stem.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let c = OrchestratorConfig::builder().build().unwrap();
        assert_eq!(c.base_size, 1024);
        assert_eq!(c.image_size, 640);
        assert_eq!((c.min_crops, c.max_crops), (2, 6));
        assert_eq!(c.max_tokens, 8192);
        assert!(c.skip_repeat && c.crop_mode);
    }

    #[test]
    fn rejects_zero_gates() {
        assert!(OrchestratorConfig::builder().max_concurrent_jobs(0).build().is_err());
        assert!(OrchestratorConfig::builder()
            .max_concurrent_recognitions(0)
            .build()
            .is_err());
    }

    #[test]
    fn rejects_inverted_crop_bounds() {
        let err = OrchestratorConfig::builder().crop_bounds(5, 2).build().unwrap_err();
        assert!(err.to_string().contains("crop bounds"));
    }

    #[test]
    fn rejects_oversized_crop_ceiling() {
        assert!(OrchestratorConfig::builder().crop_bounds(1, MAX_CROPS).build().is_ok());
        let err = OrchestratorConfig::builder()
            .crop_bounds(2, 70_000)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(err.to_string().contains("max_crops"));
    }

    #[test]
    fn submit_options_fall_back_to_config() {
        let config = OrchestratorConfig::builder().skip_repeat(false).build().unwrap();
        let opts = SubmitOptions::default().crop_mode(false).resolve(&config);
        assert_eq!(opts.prompt, DEFAULT_PROMPT);
        assert!(!opts.crop_mode);
        assert!(!opts.skip_repeat);
        assert_eq!(opts.document_name, "document");
    }

    #[test]
    fn blank_prompt_uses_default() {
        let config = OrchestratorConfig::default();
        let opts = SubmitOptions::default().prompt("   ").resolve(&config);
        assert_eq!(opts.prompt, config.default_prompt);
    }

    #[test]
    fn stem_is_sanitised() {
        assert_eq!(sanitize_stem(Some("../../etc/passwd")), "passwd");
        assert_eq!(sanitize_stem(Some("Annual Report.pdf")), "Annual_Report");
        assert_eq!(sanitize_stem(Some("C:\\docs\\scan.PDF")), "scan");
        assert_eq!(sanitize_stem(Some("..")), "document");
        assert_eq!(sanitize_stem(None), "document");
    }
}
