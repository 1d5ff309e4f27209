//! Job orchestration: the page pipeline and the public job API.
//!
//! ## Pipeline Overview
//!
//! ```text
//! submit ─▶ queued ─(job permit)─▶ rasterize ─▶ pages ─▶ assemble ─▶ completed
//!                                      │          │          │
//!                                      └──────────┴──────────┴──▶ failed
//! ```
//!
//! Every job runs as one Tokio task; every page of a processing job runs as
//! its own task (preprocess, then recognise). Page results arrive in any
//! order and are written into their page's slot, so the assembled output is
//! always in page order.
//!
//! ## Resource accounting
//!
//! The job permit is acquired before `queued → processing` and stored in the
//! job record, which drops it on entry into `completed` or `failed`. A job
//! therefore counts against the job gate for its whole pipeline, including
//! the time its pages wait on the accelerator gate.
//!
//! ## Deletion
//!
//! [`Orchestrator::delete_job`] removes the job from the registry at once
//! and flags it cancelled. A queued job stops waiting for the job gate
//! immediately. A processing job notices at its next page boundary, aborts
//! the remaining page tasks, removes anything it wrote and releases its
//! permit.

use crate::assemble::ArtifactAssembler;
use crate::config::{OrchestratorConfig, SubmitOptions};
use crate::error::{DocumentError, Error, JobError, PageError};
use crate::job::{JobId, JobState, JobStatus, ResultSlots};
use crate::limiter::{Gate, ResourceLimiter};
use crate::output::{ArtifactKind, PageOutcome};
use crate::pipeline::preprocess::PreprocessPool;
use crate::pipeline::recognize::{RecognitionInvoker, RecognitionModel, RecognizeError};
use crate::pipeline::render::Rasterizer;
use crate::registry::{JobEntry, JobRegistry, TaskStats};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Job counts plus gate occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub jobs: TaskStats,
    pub max_concurrent_jobs: usize,
    pub max_concurrent_recognitions: usize,
    /// Job permits currently held.
    pub jobs_admitted: usize,
    /// Accelerator permits currently held.
    pub recognitions_in_flight: usize,
    /// Job pipeline tasks still running, including those of deleted jobs
    /// that have not yet wound down.
    pub pipelines_running: usize,
}

/// Accepts documents and runs them through the OCR pipeline.
///
/// Cheap to clone; clones share the registry and both gates.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrchestratorConfig,
    registry: JobRegistry,
    limiter: ResourceLimiter,
    pool: PreprocessPool,
    invoker: RecognitionInvoker,
    rasterizer: Arc<dyn Rasterizer>,
    assembler: ArtifactAssembler,
    pipelines: AtomicUsize,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        rasterizer: Arc<dyn Rasterizer>,
        model: Arc<dyn RecognitionModel>,
    ) -> Self {
        let limiter = ResourceLimiter::new(
            config.max_concurrent_recognitions,
            config.max_concurrent_jobs,
            config.accelerator_gate_timeout,
            config.job_gate_timeout,
        );
        let invoker = RecognitionInvoker::new(model, limiter.clone(), config.max_tokens);
        info!(
            "Orchestrator ready: {} jobs, {} recognitions, {} preprocess workers",
            config.max_concurrent_jobs, config.max_concurrent_recognitions, config.preprocess_workers
        );

        Self {
            inner: Arc::new(Inner {
                pool: PreprocessPool::new(config.preprocess_workers),
                assembler: ArtifactAssembler::new(Arc::clone(&rasterizer)),
                registry: JobRegistry::new(),
                limiter,
                invoker,
                rasterizer,
                config,
                pipelines: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn limiter(&self) -> &ResourceLimiter {
        &self.inner.limiter
    }

    /// Register a document and start its pipeline in the background.
    ///
    /// Returns as soon as the job is visible in `queued`.
    pub async fn submit(&self, document: Vec<u8>, options: SubmitOptions) -> Result<JobId, Error> {
        if document.is_empty() {
            return Err(Error::EmptyDocument);
        }
        let limit = self.inner.config.max_document_bytes;
        if document.len() > limit {
            return Err(Error::DocumentTooLarge {
                size: document.len(),
                limit,
            });
        }

        let options = options.resolve(&self.inner.config);
        let (id, entry) = self.inner.registry.create(options);
        info!("Job {}: queued ({} bytes)", id, document.len());

        let inner = Arc::clone(&self.inner);
        inner.pipelines.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            Arc::clone(&inner).run_job(id, entry, document).await;
            inner.pipelines.fetch_sub(1, Ordering::AcqRel);
        });
        Ok(id)
    }

    pub fn status(&self, id: JobId) -> Result<JobStatus, Error> {
        self.inner
            .registry
            .status(id)
            .ok_or(Error::JobNotFound { job_id: id })
    }

    /// Poll until the job is terminal.
    pub async fn wait(&self, id: JobId, poll: Duration) -> Result<JobStatus, Error> {
        loop {
            let status = self.status(id)?;
            if status.state.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Location of a completed job's artifact.
    pub fn artifact_path(&self, id: JobId, kind: ArtifactKind) -> Result<PathBuf, Error> {
        let entry = self
            .inner
            .registry
            .get(id)
            .ok_or(Error::JobNotFound { job_id: id })?;
        let record = entry.lock();
        match (record.state(), record.artifacts()) {
            (JobState::Completed, Some(artifacts)) => Ok(artifacts.path(kind).to_path_buf()),
            (state, _) => Err(Error::ArtifactNotReady {
                job_id: id,
                state: state.to_string(),
            }),
        }
    }

    /// Contents of a completed job's artifact.
    pub async fn artifact(&self, id: JobId, kind: ArtifactKind) -> Result<Vec<u8>, Error> {
        let path = self.artifact_path(id, kind)?;
        tokio::fs::read(&path)
            .await
            .map_err(|source| Error::Storage { path, source })
    }

    /// Remove a job and its storage. A processing job stops at its next page
    /// boundary.
    pub async fn delete_job(&self, id: JobId) -> Result<(), Error> {
        self.inner
            .registry
            .remove(id)
            .ok_or(Error::JobNotFound { job_id: id })?;
        let dir = self.inner.job_dir(id);
        remove_dir_if_present(&dir)
            .await
            .map_err(|source| Error::Storage { path: dir, source })?;
        info!("Job {}: deleted", id);
        Ok(())
    }

    pub fn stats(&self) -> OrchestratorStats {
        let config = &self.inner.config;
        let limiter = &self.inner.limiter;
        OrchestratorStats {
            jobs: self.inner.registry.stats(),
            max_concurrent_jobs: config.max_concurrent_jobs,
            max_concurrent_recognitions: config.max_concurrent_recognitions,
            jobs_admitted: limiter.in_use(Gate::Job),
            recognitions_in_flight: limiter.in_use(Gate::Accelerator),
            pipelines_running: self.inner.pipelines.load(Ordering::Acquire),
        }
    }
}

async fn remove_dir_if_present(dir: &std::path::Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl Inner {
    fn job_dir(&self, id: JobId) -> PathBuf {
        self.config.work_dir.join(id.to_string())
    }

    async fn run_job(self: Arc<Self>, id: JobId, entry: Arc<JobEntry>, document: Vec<u8>) {
        let start = Instant::now();
        let result = Arc::clone(&self).process(id, &entry, document).await;

        if entry.is_cancelled() {
            let dir = self.job_dir(id);
            if let Err(e) = remove_dir_if_present(&dir).await {
                warn!("Job {}: could not remove {}: {}", id, dir.display(), e);
            }
            entry.lock().abandon();
            debug!("Job {}: pipeline stopped after deletion", id);
            return;
        }

        match result {
            Ok(()) => info!("Job {}: completed in {:?}", id, start.elapsed()),
            Err(e) => {
                warn!("Job {}: failed: {}", id, e);
                // Only the assembler writes here, and it cleans up after itself.
                let _ = remove_dir_if_present(&self.job_dir(id)).await;
                if let Err(transition) = entry.lock().fail(e) {
                    warn!("Job {}: {}", id, transition);
                }
            }
        }
    }

    /// Drive one job from `queued` to just before its terminal transition.
    /// A cancelled job returns `Ok(())` early; the caller checks the flag.
    async fn process(self: Arc<Self>, id: JobId, entry: &Arc<JobEntry>, document: Vec<u8>) -> Result<(), JobError> {
        // ── Step 1: Admission ───────────────────────────────────────────────
        // A job deleted while queued leaves the gate's wait list at once and
        // drops its document.
        let permit = tokio::select! {
            biased;
            _ = entry.cancelled() => return Ok(()),
            permit = self.limiter.acquire(Gate::Job) => permit?,
        };
        if entry.is_cancelled() {
            return Ok(());
        }
        entry.lock().start_processing(permit)?;
        info!("Job {}: processing", id);

        // ── Step 2: Rasterise ───────────────────────────────────────────────
        let rasterizer = Arc::clone(&self.rasterizer);
        let pages = tokio::task::spawn_blocking(move || rasterizer.rasterize(&document))
            .await
            .map_err(|e| JobError::Internal {
                detail: format!("Rasterize task panicked: {}", e),
            })?
            .map_err(JobError::Document)?;
        if pages.is_empty() {
            return Err(JobError::Document(DocumentError::NoPages));
        }
        entry.lock().set_page_count(pages.len())?;
        info!("Job {}: {} pages", id, pages.len());
        let pages: Vec<Arc<DynamicImage>> = pages.into_iter().map(Arc::new).collect();

        // ── Step 3: Pages ───────────────────────────────────────────────────
        let options = entry.lock().options().clone();
        let preprocess = self.config.preprocess_options(options.crop_mode);
        let prompt: Arc<str> = Arc::from(options.prompt.as_str());

        let mut aborts = Vec::with_capacity(pages.len());
        let mut tasks: FuturesUnordered<_> = pages
            .iter()
            .enumerate()
            .map(|(idx, image)| {
                let handle = tokio::spawn(run_page(
                    self.pool.clone(),
                    self.invoker.clone(),
                    Arc::clone(entry),
                    idx,
                    Arc::clone(image),
                    preprocess,
                    Arc::clone(&prompt),
                ));
                aborts.push(handle.abort_handle());
                handle.map(move |joined| (idx, joined))
            })
            .collect();

        while let Some((idx, joined)) = tasks.next().await {
            let outcome = match joined {
                Ok(Ok(Some(outcome))) => outcome,
                Ok(Ok(None)) => PageOutcome::Error(cancelled(idx)),
                Ok(Err(e)) => {
                    aborts.iter().for_each(|h| h.abort());
                    return Err(e);
                }
                Err(e) => PageOutcome::Error(PageError::Internal {
                    page: idx,
                    detail: format!("page task panicked: {}", e),
                }),
            };
            if entry.is_cancelled() {
                aborts.iter().for_each(|h| h.abort());
                return Ok(());
            }
            let mut record = entry.lock();
            record.fill_slot(idx, outcome)?;
            debug!(
                "Job {}: page {} done ({}/{})",
                id,
                idx + 1,
                record.slots().map(ResultSlots::filled).unwrap_or(0),
                pages.len()
            );
        }

        // ── Step 4: Assemble ────────────────────────────────────────────────
        if entry.is_cancelled() {
            return Ok(());
        }
        let outcomes = entry
            .lock()
            .slots()
            .and_then(ResultSlots::ordered)
            .ok_or_else(|| JobError::Internal {
                detail: "page slots incomplete after all pages finished".into(),
            })?;

        let assembler = self.assembler.clone();
        let dir = self.job_dir(id);
        let artifacts = tokio::task::spawn_blocking(move || {
            assembler.assemble(&dir, id, &options, &pages, &outcomes)
        })
        .await
        .map_err(|e| JobError::Internal {
            detail: format!("Assemble task panicked: {}", e),
        })??;

        let mut record = entry.lock();
        if entry.is_cancelled() {
            return Ok(());
        }
        record.complete(artifacts)?;
        Ok(())
    }
}

fn cancelled(page: usize) -> PageError {
    PageError::Internal {
        page,
        detail: "job cancelled".into(),
    }
}

/// One page: preprocess, then recognise. `Ok(None)` means the job was
/// cancelled before the page was recognised.
async fn run_page(
    pool: PreprocessPool,
    invoker: RecognitionInvoker,
    entry: Arc<JobEntry>,
    page: usize,
    image: Arc<DynamicImage>,
    preprocess: crate::config::PreprocessOptions,
    prompt: Arc<str>,
) -> Result<Option<PageOutcome>, JobError> {
    if entry.is_cancelled() {
        return Ok(None);
    }
    let crops = match pool.preprocess(page, image, preprocess).await {
        Ok(crops) => crops,
        Err(e) => {
            warn!("{}", e);
            return Ok(Some(PageOutcome::Error(e)));
        }
    };

    if entry.is_cancelled() {
        return Ok(None);
    }
    match invoker.recognize(page, &crops, &prompt).await {
        Ok(result) => Ok(Some(PageOutcome::from_result(result))),
        Err(RecognizeError::Page(e)) => {
            warn!("{}", e);
            Ok(Some(PageOutcome::Error(e)))
        }
        Err(RecognizeError::Job(e)) => Err(e),
    }
}
