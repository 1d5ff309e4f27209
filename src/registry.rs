//! Concurrent map from job identifier to job record.
//!
//! The map itself sits behind a read-write lock that is only ever held long
//! enough to insert, look up or remove an `Arc`. Each record has its own
//! mutex, so a pipeline updating job N never blocks a status read of job M.
//! Never lock a record while holding the map lock.

use crate::config::JobOptions;
use crate::job::{JobId, JobRecord, JobState, JobStatus};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// A registered job: its record plus the cancellation flag the pipeline polls.
#[derive(Debug)]
pub struct JobEntry {
    seq: u64,
    record: Mutex<JobRecord>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

impl JobEntry {
    /// Lock the record. Keep the guard short-lived and never across `.await`.
    pub fn lock(&self) -> MutexGuard<'_, JobRecord> {
        self.record.lock()
    }

    /// Set once the job has been deleted; the pipeline stops at its next checkpoint.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once the job has been deleted.
    pub async fn cancelled(&self) {
        let notified = self.cancel_notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.cancel_notify.notify_waiters();
    }
}

/// Job counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    /// Jobs ever submitted to this registry, deleted ones included.
    pub total: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// The in-memory job table. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<JobId, Arc<JobEntry>>>>,
    next_seq: Arc<AtomicU64>,
    submitted: Arc<AtomicUsize>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job in `queued` and return its handle.
    pub fn create(&self, options: JobOptions) -> (JobId, Arc<JobEntry>) {
        let id = JobId::new();
        let entry = Arc::new(JobEntry {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            record: Mutex::new(JobRecord::new(id, options)),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        });
        self.jobs.write().insert(id, Arc::clone(&entry));
        self.submitted.fetch_add(1, Ordering::Relaxed);
        debug!("Registered job {}", id);
        (id, entry)
    }

    pub fn get(&self, id: JobId) -> Option<Arc<JobEntry>> {
        self.jobs.read().get(&id).cloned()
    }

    /// Run `f` on the record of `id` under its lock.
    pub fn mutate<R>(&self, id: JobId, f: impl FnOnce(&mut JobRecord) -> R) -> Option<R> {
        let entry = self.get(id)?;
        let mut record = entry.lock();
        Some(f(&mut record))
    }

    /// Remove `id` and flag it cancelled. Returns the entry if it existed.
    pub fn remove(&self, id: JobId) -> Option<Arc<JobEntry>> {
        let entry = self.jobs.write().remove(&id)?;
        entry.cancel();
        debug!("Removed job {}", id);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    fn entries(&self) -> Vec<Arc<JobEntry>> {
        self.jobs.read().values().cloned().collect()
    }

    /// Status of `id`, with its queue position if it is still queued.
    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        let entry = self.get(id)?;
        let state = entry.lock().state();

        let position = if state == JobState::Queued {
            let ahead = self
                .entries()
                .iter()
                .filter(|e| e.seq < entry.seq && e.lock().state() == JobState::Queued)
                .count();
            Some(ahead + 1)
        } else {
            None
        };

        let record = entry.lock();
        // The job may have left `queued` since the first look.
        let position = position.filter(|_| record.state() == JobState::Queued);
        Some(record.status(position))
    }

    /// Identifiers of jobs currently in `state`, oldest first.
    pub fn ids_in_state(&self, state: JobState) -> Vec<JobId> {
        let mut matching: Vec<(u64, JobId)> = self
            .entries()
            .iter()
            .filter_map(|e| {
                let record = e.lock();
                (record.state() == state).then(|| (e.seq, record.id()))
            })
            .collect();
        matching.sort_unstable_by_key(|(seq, _)| *seq);
        matching.into_iter().map(|(_, id)| id).collect()
    }

    pub fn stats(&self) -> TaskStats {
        let mut stats = TaskStats {
            total: self.submitted.load(Ordering::Relaxed),
            ..TaskStats::default()
        };
        for entry in self.entries() {
            match entry.lock().state() {
                JobState::Queued => stats.queued += 1,
                JobState::Processing => stats.processing += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        stats
    }
}
