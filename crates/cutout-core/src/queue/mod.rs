//! Bounded-concurrency segmentation queue.
//!
//! [`Queue`] is the public handle.  It wires the [`QueueStore`] (state),
//! the [`Scheduler`] (admission control) and the task executor (one remote
//! call per admitted task) together, and re-runs admission after every
//! change that can free a slot or add work.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cutout_core::{HttpSegmentClient, InputFile, Queue, QueueConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let client = HttpSegmentClient::new("http://localhost:8000")?;
//! let queue = Queue::new(QueueConfig::default(), Arc::new(client));
//! let ids = queue.submit(vec![InputFile::read("shoe.jpg").await?]);
//! queue.wait_idle().await;
//! println!("{:?}", queue.task(ids[0]).map(|t| t.status));
//! # Ok(())
//! # }
//! ```

pub mod classify;
mod executor;
pub mod registry;
pub mod scheduler;
pub mod selection;
pub mod store;
pub mod types;


use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::{SegmentClient, SegmentParams, SegmentResult};
use crate::config::QueueConfig;
use crate::queue::executor::TaskExecutor;
use crate::queue::scheduler::Scheduler;
use crate::queue::store::QueueStore;
use crate::queue::types::{InputFile, QueueError, QueueState, Task, TaskId, TaskStatus, ViewState};
use crate::thumbnail::{ImageThumbnailer, Thumbnailer};

struct QueueInner {
    store: QueueStore,
    scheduler: Scheduler,
    executor: TaskExecutor,
    client: Arc<dyn SegmentClient>,
    thumbnailer: Arc<dyn Thumbnailer>,
    config: QueueConfig,
}

/// Cloneable handle to a running queue.
///
/// Every method must be called from within a Tokio runtime: admissions spawn
/// executor tasks.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("store", &self.inner.store)
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

impl Queue {
    /// Create a queue that generates thumbnails with [`ImageThumbnailer`].
    pub fn new(config: QueueConfig, client: Arc<dyn SegmentClient>) -> Self {
        Self::with_thumbnailer(config, client, Arc::new(ImageThumbnailer))
    }

    pub fn with_thumbnailer(
        config: QueueConfig,
        client: Arc<dyn SegmentClient>,
        thumbnailer: Arc<dyn Thumbnailer>,
    ) -> Self {
        let store = QueueStore::new();
        let executor = TaskExecutor::new(
            store.clone(),
            Arc::clone(&client),
            config.request_timeout,
            config.milestones.clone(),
        );
        Self {
            inner: Arc::new(QueueInner {
                store,
                scheduler: Scheduler::new(config.concurrency),
                executor,
                client,
                thumbnailer,
                config,
            }),
        }
    }

    // ── Mutations ────────────────────────────────────────────────────────────

    /// Validate and enqueue `files`.  Returns the new task ids in order.
    ///
    /// Never blocks: rejected files become `Failed` tasks, and thumbnails are
    /// generated in the background.
    pub fn submit(&self, files: Vec<InputFile>) -> Vec<TaskId> {
        let config = &self.inner.config;
        let ids = self
            .inner
            .store
            .submit_with(files, config.default_params, config.max_upload_bytes);
        info!(count = ids.len(), "files submitted");
        for &task_id in &ids {
            self.spawn_thumbnail(task_id);
        }
        self.schedule();
        ids
    }

    /// Cancel a task in any state.  Idempotent.
    pub fn cancel(&self, task_id: TaskId) -> Result<(), QueueError> {
        let fired = self.inner.store.cancel(task_id)?;
        info!(task_id, in_flight = fired, "task canceled by user");
        self.schedule();
        Ok(())
    }

    /// Cancel every queued or active task.  Returns how many were canceled.
    pub fn cancel_pending(&self) -> usize {
        let pending: Vec<TaskId> = self
            .snapshot()
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued || t.status.is_active())
            .map(|t| t.id)
            .collect();
        for &task_id in &pending {
            if let Err(e) = self.inner.store.cancel(task_id) {
                debug!(task_id, error = %e, "cancel skipped");
            }
        }
        pending.len()
    }

    /// Re-queue a failed or canceled task.
    pub fn retry(&self, task_id: TaskId) -> Result<(), QueueError> {
        self.inner.store.retry(task_id)?;
        info!(task_id, "task retried");
        self.schedule();
        Ok(())
    }

    /// Replace a task's parameters.  Does not re-run it.
    pub fn update_parameters(&self, task_id: TaskId, params: SegmentParams) -> Result<(), QueueError> {
        self.inner.store.update_parameters(task_id, params)
    }

    /// Replace a task's display hints.
    pub fn set_view(&self, task_id: TaskId, view: ViewState) -> Result<(), QueueError> {
        self.inner.store.set_view(task_id, view)
    }

    /// Re-run a task with its current parameters, re-using the server-side
    /// upload when one is known.
    pub fn mark_for_reprocess(&self, task_id: TaskId) -> Result<(), QueueError> {
        let reuse = self.inner.store.mark_for_reprocess(task_id)?;
        info!(task_id, reuse_upload = reuse, "task marked for reprocess");
        self.schedule();
        Ok(())
    }

    /// Re-run a task with a specific candidate from its last result.
    pub fn select_candidate(&self, task_id: TaskId, index: u32) -> Result<(), QueueError> {
        let reuse = self.inner.store.select_candidate(task_id, index)?;
        info!(task_id, candidate = index, reuse_upload = reuse, "candidate selected");
        self.schedule();
        Ok(())
    }

    pub fn select(&self, task_id: TaskId) -> Result<(), QueueError> {
        self.inner.store.select(task_id)
    }

    /// Remove finished and canceled tasks.
    pub fn clear_completed(&self) -> usize {
        self.inner.store.clear_completed()
    }

    /// Cancel everything and empty the queue.
    pub fn clear_all(&self) -> usize {
        self.inner.store.clear_all()
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> QueueState {
        self.inner.store.snapshot()
    }

    pub fn task(&self, task_id: TaskId) -> Option<Task> {
        self.inner.store.task(task_id)
    }

    /// Receive a fresh [`QueueState`] after every change.
    pub fn subscribe(&self) -> watch::Receiver<QueueState> {
        self.inner.store.subscribe()
    }

    pub fn concurrency(&self) -> usize {
        self.inner.scheduler.bound()
    }

    /// Number of live cancellation handles.
    pub fn in_flight(&self) -> usize {
        self.inner.store.registry().len()
    }

    /// Resolve once nothing is queued or active.
    pub async fn wait_idle(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(QueueState::is_idle).await;
    }

    // ── Remote lookups ───────────────────────────────────────────────────────

    /// Fetch the server's current record for a finished task.
    pub async fn lookup(&self, task_id: TaskId) -> Result<SegmentResult, QueueError> {
        let task = self
            .task(task_id)
            .ok_or(QueueError::TaskNotFound { task_id })?;
        let job_id = task
            .result
            .map(|r| r.id)
            .filter(|id| !id.is_empty())
            .ok_or(QueueError::NoResult { task_id })?;
        Ok(self.inner.client.job(&job_id).await?)
    }

    /// Download the cutouts of the given finished tasks as one ZIP archive.
    ///
    /// Tasks without a result are skipped.  Task state is never touched.
    pub async fn export(&self, task_ids: &[TaskId]) -> Result<Bytes, QueueError> {
        let state = self.snapshot();
        let job_ids: Vec<String> = task_ids
            .iter()
            .filter_map(|&id| state.get(id))
            .filter_map(|t| t.result.as_ref())
            .map(|r| r.id.clone())
            .filter(|id| !id.is_empty())
            .collect();
        if job_ids.is_empty() {
            return Err(QueueError::NothingToExport);
        }
        let archive = self.inner.client.download_zip(&job_ids).await.map_err(|e| {
            warn!(error = %e, "export failed");
            QueueError::Remote(e)
        })?;
        info!(jobs = job_ids.len(), bytes = archive.len(), "export downloaded");
        Ok(archive)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Admit whatever fits and spawn an executor per admitted task.
    fn schedule(&self) {
        for dispatch in self.inner.scheduler.evaluate(&self.inner.store) {
            let queue = self.clone();
            tokio::spawn(async move {
                let task_id = dispatch.task_id;
                let outcome = queue.inner.executor.run(dispatch).await;
                debug!(task_id, ?outcome, "dispatch finished");
                queue.schedule();
            });
        }
    }

    fn spawn_thumbnail(&self, task_id: TaskId) {
        let Some(task) = self.task(task_id) else {
            return;
        };
        if task.status == TaskStatus::Failed {
            return;
        }
        let store = self.inner.store.clone();
        let thumbnailer = Arc::clone(&self.inner.thumbnailer);
        let size = self.inner.config.thumbnail_size;
        tokio::task::spawn_blocking(move || match thumbnailer.thumbnail(&task.file, size) {
            Ok(url) => store.set_preview(task_id, url),
            Err(e) => warn!(task_id, error = %e, "thumbnail failed; keeping file reference"),
        });
    }
}
