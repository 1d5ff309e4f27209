//! Job identity, lifecycle state and the per-page result slots.
//!
//! ```text
//!  queued ──(job permit)──▶ processing ──▶ completed
//!     │                         │
//!     └──────────────┬──────────┘
//!                    ▼
//!                  failed
//! ```
//!
//! A [`JobRecord`] enforces these transitions itself; the registry only
//! decides who may touch which record.

use crate::config::JobOptions;
use crate::error::{JobError, PageError};
use crate::limiter::GatePermit;
use crate::output::{ArtifactSet, PageOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Opaque job identifier (random UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    fn message(&self) -> &'static str {
        match self {
            JobState::Queued => "Job queued, waiting for a processing slot",
            JobState::Processing => "Conversion in progress",
            JobState::Completed => "Document converted successfully",
            JobState::Failed => "Conversion failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Misuse of the slot array or the state machine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("slot {index} written twice")]
    AlreadyFilled { index: usize },

    #[error("slot {index} out of range (job has {len} pages)")]
    OutOfRange { index: usize, len: usize },

    #[error("page count already set to {len}")]
    AlreadySized { len: usize },

    #[error("page count not known yet")]
    NotSized,

    #[error("cannot move job from {from} to {to}")]
    InvalidTransition { from: JobState, to: JobState },
}

impl From<SlotError> for JobError {
    fn from(e: SlotError) -> Self {
        JobError::Internal { detail: e.to_string() }
    }
}

/// Fixed-length, write-once storage for page outcomes, indexed by page.
#[derive(Debug, Clone)]
pub struct ResultSlots {
    slots: Vec<Option<PageOutcome>>,
    filled: usize,
}

impl ResultSlots {
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![None; len],
            filled: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.slots.len()
    }

    /// Write the outcome of page `index`. Each slot accepts exactly one write.
    pub fn fill(&mut self, index: usize, outcome: PageOutcome) -> Result<(), SlotError> {
        let len = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(SlotError::OutOfRange { index, len })?;
        if slot.is_some() {
            return Err(SlotError::AlreadyFilled { index });
        }
        *slot = Some(outcome);
        self.filled += 1;
        Ok(())
    }

    /// All outcomes in page order, or `None` while any slot is empty.
    pub fn ordered(&self) -> Option<Vec<PageOutcome>> {
        self.slots.iter().cloned().collect()
    }

    /// Page errors recorded so far, in page order.
    pub fn page_errors(&self) -> Vec<PageError> {
        self.slots
            .iter()
            .flatten()
            .filter_map(|o| match o {
                PageOutcome::Error(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Everything the registry knows about one job.
#[derive(Debug)]
pub struct JobRecord {
    id: JobId,
    options: JobOptions,
    state: JobState,
    created_at: DateTime<Utc>,
    submitted: Instant,
    started: Option<Instant>,
    slots: Option<ResultSlots>,
    artifacts: Option<ArtifactSet>,
    error: Option<JobError>,
    duration: Option<Duration>,
    permit: Option<GatePermit>,
}

impl JobRecord {
    /// A fresh record in `queued`.
    pub fn new(id: JobId, options: JobOptions) -> Self {
        Self {
            id,
            options,
            state: JobState::Queued,
            created_at: Utc::now(),
            submitted: Instant::now(),
            started: None,
            slots: None,
            artifacts: None,
            error: None,
            duration: None,
            permit: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn page_count(&self) -> Option<usize> {
        self.slots.as_ref().map(ResultSlots::len)
    }

    pub fn slots(&self) -> Option<&ResultSlots> {
        self.slots.as_ref()
    }

    pub fn artifacts(&self) -> Option<&ArtifactSet> {
        self.artifacts.as_ref()
    }

    pub fn error(&self) -> Option<&JobError> {
        self.error.as_ref()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// `queued → processing`. The job permit is held by the record from now
    /// until the record enters a terminal state.
    pub fn start_processing(&mut self, permit: GatePermit) -> Result<(), SlotError> {
        if self.state != JobState::Queued {
            return Err(SlotError::InvalidTransition {
                from: self.state,
                to: JobState::Processing,
            });
        }
        self.state = JobState::Processing;
        self.started = Some(Instant::now());
        self.permit = Some(permit);
        Ok(())
    }

    /// Size the slot array once the page count is known.
    pub fn set_page_count(&mut self, pages: usize) -> Result<(), SlotError> {
        if let Some(ref s) = self.slots {
            return Err(SlotError::AlreadySized { len: s.len() });
        }
        self.slots = Some(ResultSlots::new(pages));
        Ok(())
    }

    pub fn fill_slot(&mut self, index: usize, outcome: PageOutcome) -> Result<(), SlotError> {
        self.slots
            .as_mut()
            .ok_or(SlotError::NotSized)?
            .fill(index, outcome)
    }

    /// `processing → completed`; releases the job permit.
    pub fn complete(&mut self, artifacts: ArtifactSet) -> Result<(), SlotError> {
        if self.state != JobState::Processing {
            return Err(SlotError::InvalidTransition {
                from: self.state,
                to: JobState::Completed,
            });
        }
        self.artifacts = Some(artifacts);
        self.finish(JobState::Completed);
        Ok(())
    }

    /// `queued | processing → failed`; releases the job permit if held.
    pub fn fail(&mut self, error: JobError) -> Result<(), SlotError> {
        if self.state.is_terminal() {
            return Err(SlotError::InvalidTransition {
                from: self.state,
                to: JobState::Failed,
            });
        }
        self.error = Some(error);
        self.finish(JobState::Failed);
        Ok(())
    }

    /// Release the job permit of a deleted job without a state transition.
    pub fn abandon(&mut self) {
        self.permit = None;
    }

    fn finish(&mut self, state: JobState) {
        self.state = state;
        self.duration = Some(self.started.unwrap_or(self.submitted).elapsed());
        // Drop the permit while the caller still holds the record lock, so a
        // status read that sees the terminal state also sees the permit free.
        self.permit = None;
    }

    /// Point-in-time view for status callers.
    pub fn status(&self, queue_position: Option<usize>) -> JobStatus {
        JobStatus {
            job_id: self.id,
            state: self.state,
            message: self.state.message().to_string(),
            created_at: self.created_at,
            page_count: self.page_count(),
            pages_done: self.slots.as_ref().map(ResultSlots::filled).unwrap_or(0),
            error: self.error.clone(),
            duration_ms: self.duration.map(|d| d.as_millis() as u64),
            queue_position,
        }
    }
}

/// What `status()` reports about a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub message: String,
    pub created_at: DateTime<Utc>,
    /// Known once the document has been rasterised.
    pub page_count: Option<usize>,
    /// Slots filled so far.
    pub pages_done: usize,
    pub error: Option<JobError>,
    /// Set once the job is terminal.
    pub duration_ms: Option<u64>,
    /// 1-based position among queued jobs, oldest first.
    pub queue_position: Option<usize>,
}
