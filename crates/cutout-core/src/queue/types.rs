use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::client::{RemoteError, SegmentParams, SegmentResult};

/// Unique identifier for a submitted task.  Allocated from a counter and
/// never reused.
pub type TaskId = u64;

/// Lifecycle state of a [`Task`].
///
/// ```text
/// queued ──► uploading ──► processing ──► done
///              │               │
///              ├───────────────┴──► failed
///              └───────────────┴──► canceled ◄── queued
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    /// Placeholder before submission; never stored in the queue.
    #[default]
    Idle,
    Queued,
    Uploading,
    Processing,
    Done,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// `true` while a remote call may be in flight.  These are the states
    /// counted against the concurrency bound.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Uploading | TaskStatus::Processing)
    }

    /// `true` for states no automatic transition leaves.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

/// A user-supplied image.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub name: String,
    pub mime: Option<String>,
    /// Where the file was read from, if anywhere.
    pub path: Option<PathBuf>,
    pub bytes: Bytes,
}

impl InputFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime: None,
            path: None,
            bytes: bytes.into(),
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    /// Read a file from disk, keeping its path for preview fallbacks.
    pub async fn read(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_owned());
        Ok(Self {
            name,
            mime: None,
            path: Some(path.to_path_buf()),
            bytes: bytes.into(),
        })
    }

    /// Lower-cased extension without the dot.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
    }

    /// File stem used to name exported cutouts.
    pub fn stem(&self) -> &str {
        Path::new(&self.name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("upload")
    }
}

/// Display hints that travel with a task.  Never read by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewState {
    /// Show the mask overlay instead of the cutout.
    pub show_mask: bool,
    /// Candidate the user picked from a multi-candidate result.
    pub selected_candidate: Option<u32>,
}

/// One file's journey through the queue.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    /// 0–100; cosmetic while active.
    pub progress: u8,
    pub params: SegmentParams,
    pub view: ViewState,
    pub file: InputFile,
    /// Thumbnail data URL, or an object reference to the original file.
    pub preview_url: String,
    /// Present only while `status == Done`.
    pub result: Option<SegmentResult>,
    /// Classified message; present only while `status == Failed`.
    pub error: Option<String>,
    /// Upload id assigned by the server on a previous successful run.
    pub server_file_id: Option<String>,
    /// Send `server_file_id` instead of the payload on the next dispatch.
    pub reuse_upload: bool,
    /// Dispatch generation.  Bumped on every admission; executor writes
    /// carrying an older generation are discarded.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub(crate) fn new(id: TaskId, file: InputFile, preview_url: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TaskStatus::Queued,
            progress: 0,
            params: SegmentParams::default(),
            view: ViewState::default(),
            file,
            preview_url,
            result: None,
            error: None,
            server_file_id: None,
            reuse_upload: false,
            attempt: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Move back to `Queued` with progress, error and result cleared.
    pub(crate) fn requeue(&mut self) {
        self.status = TaskStatus::Queued;
        self.progress = 0;
        self.error = None;
        self.result = None;
        self.touch();
    }
}

/// Counts per status, for summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub queued: usize,
    pub active: usize,
    pub done: usize,
    pub failed: usize,
    pub canceled: usize,
}

/// Everything the queue store owns.  Subscribers receive clones of this.
#[derive(Debug, Clone, Default)]
pub struct QueueState {
    /// Tasks in submission order.
    pub tasks: Vec<Task>,
    pub selected: Option<TaskId>,
}

impl QueueState {
    pub fn get(&self, task_id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub(crate) fn get_mut(&mut self, task_id: TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    pub fn selected_task(&self) -> Option<&Task> {
        self.selected.and_then(|id| self.get(id))
    }

    pub fn active_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.status.is_active()).count()
    }

    /// `true` when nothing is queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| !t.status.is_active() && t.status != TaskStatus::Queued)
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in &self.tasks {
            match task.status {
                TaskStatus::Queued => counts.queued += 1,
                TaskStatus::Uploading | TaskStatus::Processing => counts.active += 1,
                TaskStatus::Done => counts.done += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Canceled => counts.canceled += 1,
                TaskStatus::Idle => {}
            }
        }
        counts
    }
}

/// Errors returned by queue operations.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The referenced task does not exist.
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: TaskId },

    /// The operation is not legal from the task's current status.
    #[error("cannot {action} task {task_id} while {status}")]
    InvalidTransition {
        task_id: TaskId,
        status: TaskStatus,
        action: &'static str,
    },

    /// The task has no result to look up.
    #[error("task {task_id} has no result")]
    NoResult { task_id: TaskId },

    /// None of the requested tasks has a finished result.
    #[error("no finished results to export")]
    NothingToExport,

    #[error(transparent)]
    Remote(#[from] RemoteError),
}
