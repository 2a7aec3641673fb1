use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::client::{SegmentParams, SegmentRequest, SegmentResult, Upload};
use crate::queue::classify;
use crate::queue::registry::{CancelHandle, CancellationRegistry};
use crate::queue::selection;
use crate::queue::types::{InputFile, QueueError, QueueState, Task, TaskId, TaskStatus, ViewState};
use crate::thumbnail;

/// Validation message for files outside the allow-list.
pub const UNSUPPORTED_FILE_TYPE: &str = "Unsupported file type";

/// Progress shown as soon as a task is admitted.
pub(crate) const ADMITTED_PROGRESS: u8 = 20;

const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
const ALLOWED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp"];

/// Work handed from the store to the executor when a task is admitted.
#[derive(Debug)]
pub(crate) struct Dispatch {
    pub task_id: TaskId,
    pub attempt: u32,
    pub handle: CancelHandle,
    pub request: SegmentRequest,
}

/// Single source of truth for every task.
///
/// All state lives behind one `watch` channel.  Every operation is a single
/// read-modify-write over the whole [`QueueState`], so no reader ever sees a
/// half-updated task, and subscribers are notified after each change.
///
/// The cancellation registry is owned here so that the handle invariant
/// (one live handle per active task) is updated in the same critical section
/// as the status it mirrors.
#[derive(Debug, Clone)]
pub struct QueueStore {
    state: Arc<watch::Sender<QueueState>>,
    registry: CancellationRegistry,
    next_id: Arc<AtomicU64>,
}

impl Default for QueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(QueueState::default());
        Self {
            state: Arc::new(tx),
            registry: CancellationRegistry::new(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Apply `f` atomically.  `f` returns whether it changed anything plus
    /// its output; on change the selection is reconciled and subscribers are
    /// woken.
    fn modify<R>(&self, f: impl FnOnce(&mut QueueState) -> (bool, R)) -> R {
        let mut output = None;
        self.state.send_if_modified(|state| {
            let (changed, out) = f(state);
            if changed {
                state.selected = selection::reconcile(&state.tasks, state.selected);
            }
            output = Some(out);
            changed
        });
        output.unwrap_or_else(|| unreachable!("send_if_modified always runs its closure"))
    }

    /// Apply `f` to one task, or fail with [`QueueError::TaskNotFound`].
    fn modify_task<R>(
        &self,
        task_id: TaskId,
        f: impl FnOnce(&mut Task, &CancellationRegistry) -> Result<R, QueueError>,
    ) -> Result<R, QueueError> {
        let registry = &self.registry;
        self.modify(|state| match state.get_mut(task_id) {
            None => (false, Err(QueueError::TaskNotFound { task_id })),
            Some(task) => {
                let out = f(task, registry);
                (out.is_ok(), out)
            }
        })
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> QueueState {
        self.state.borrow().clone()
    }

    pub fn task(&self, task_id: TaskId) -> Option<Task> {
        self.state.borrow().get(task_id).cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueState> {
        self.state.subscribe()
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    // ── Caller operations ────────────────────────────────────────────────────

    /// Validate and append `files`.  Never blocks; rejected files are stored
    /// as `Failed` and never enter the queue.
    ///
    /// Returns the new ids in submission order.
    pub fn submit(&self, files: Vec<InputFile>, max_upload_bytes: Option<u64>) -> Vec<TaskId> {
        self.submit_with(files, SegmentParams::default(), max_upload_bytes)
    }

    /// [`submit`](Self::submit) with explicit starting parameters.
    pub fn submit_with(
        &self,
        files: Vec<InputFile>,
        params: SegmentParams,
        max_upload_bytes: Option<u64>,
    ) -> Vec<TaskId> {
        let params = params.clamped();
        let tasks: Vec<Task> = files
            .into_iter()
            .map(|file| {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let preview_url = thumbnail::object_url(&file);
                let rejection = validate(&file, max_upload_bytes);
                let mut task = Task::new(id, file, preview_url);
                task.params = params;
                if let Some(message) = rejection {
                    task.status = TaskStatus::Failed;
                    task.error = Some(message.to_owned());
                    info!(task_id = id, name = %task.file.name, error = message, "file rejected");
                } else {
                    debug!(task_id = id, name = %task.file.name, "task queued");
                }
                task
            })
            .collect();
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();

        self.modify(|state| {
            if tasks.is_empty() {
                return (false, ());
            }
            if state.selected.is_none() {
                state.selected = tasks.first().map(|t| t.id);
            }
            state.tasks.extend(tasks);
            (true, ())
        });
        ids
    }

    /// Force `task_id` into `Canceled`, firing its live handle if any.
    ///
    /// Idempotent, and legal from every status.  Returns whether a live
    /// handle was fired.
    pub fn cancel(&self, task_id: TaskId) -> Result<bool, QueueError> {
        self.modify_task(task_id, |task, registry| {
            let fired = registry.cancel(task_id);
            task.status = TaskStatus::Canceled;
            task.progress = 0;
            task.error = None;
            task.result = None;
            task.touch();
            Ok(fired)
        })
    }

    /// Re-queue a `Failed` or `Canceled` task.
    pub fn retry(&self, task_id: TaskId) -> Result<(), QueueError> {
        self.modify_task(task_id, |task, _| match task.status {
            TaskStatus::Failed | TaskStatus::Canceled => {
                task.requeue();
                Ok(())
            }
            status => Err(QueueError::InvalidTransition {
                task_id,
                status,
                action: "retry",
            }),
        })
    }

    /// Replace a task's parameters.  Status is never changed.
    pub fn update_parameters(&self, task_id: TaskId, params: SegmentParams) -> Result<(), QueueError> {
        self.modify_task(task_id, |task, _| {
            task.params = params.clamped();
            task.touch();
            Ok(())
        })
    }

    /// Replace a task's display hints.
    pub fn set_view(&self, task_id: TaskId, view: ViewState) -> Result<(), QueueError> {
        self.modify_task(task_id, |task, _| {
            task.view = view;
            task.touch();
            Ok(())
        })
    }

    /// Send any task back to `Queued`.
    ///
    /// Returns `true` when the next dispatch can skip re-uploading because the
    /// server already holds the file.
    pub fn mark_for_reprocess(&self, task_id: TaskId) -> Result<bool, QueueError> {
        self.modify_task(task_id, |task, registry| Ok(reprocess(task, registry)))
    }

    /// Pick a candidate from a multi-candidate result and re-run with it.
    pub fn select_candidate(&self, task_id: TaskId, index: u32) -> Result<bool, QueueError> {
        self.modify_task(task_id, |task, registry| {
            task.params.candidate_index = Some(index);
            task.view.selected_candidate = Some(index);
            Ok(reprocess(task, registry))
        })
    }

    /// Make `task_id` the current selection.
    pub fn select(&self, task_id: TaskId) -> Result<(), QueueError> {
        self.modify(|state| {
            if state.get(task_id).is_none() {
                return (false, Err(QueueError::TaskNotFound { task_id }));
            }
            let changed = state.selected != Some(task_id);
            state.selected = Some(task_id);
            (changed, Ok(()))
        })
    }

    /// Remove every `Done` and `Canceled` task.  Returns how many were removed.
    pub fn clear_completed(&self) -> usize {
        self.modify(|state| {
            let before = state.tasks.len();
            state
                .tasks
                .retain(|t| !matches!(t.status, TaskStatus::Done | TaskStatus::Canceled));
            let removed = before - state.tasks.len();
            (removed > 0, removed)
        })
    }

    /// Cancel everything in flight and remove every task.
    pub fn clear_all(&self) -> usize {
        let registry = &self.registry;
        self.modify(|state| {
            let fired = registry.cancel_all();
            let removed = state.tasks.len();
            state.tasks.clear();
            debug!(removed, fired, "queue cleared");
            (removed > 0, removed)
        })
    }

    /// Attach a generated thumbnail.
    pub(crate) fn set_preview(&self, task_id: TaskId, preview_url: String) {
        let _ = self.modify_task(task_id, |task, _| {
            task.preview_url = preview_url;
            Ok(())
        });
    }

    // ── Scheduler / executor operations ──────────────────────────────────────

    /// Admit the tasks chosen by `pick` in one atomic step: each moves to
    /// `Uploading`, gets a fresh attempt number and a registered handle.
    pub(crate) fn admit(&self, pick: impl FnOnce(&[Task]) -> Vec<TaskId>) -> Vec<Dispatch> {
        let registry = &self.registry;
        self.modify(|state| {
            let chosen = pick(&state.tasks);
            let mut dispatches = Vec::with_capacity(chosen.len());
            for task_id in chosen {
                let Some(task) = state.get_mut(task_id) else {
                    continue;
                };
                if task.status != TaskStatus::Queued {
                    continue;
                }
                task.attempt += 1;
                task.status = TaskStatus::Uploading;
                task.progress = ADMITTED_PROGRESS;
                task.error = None;
                task.touch();

                let handle = CancelHandle::new();
                registry.register(task_id, handle.clone());
                dispatches.push(Dispatch {
                    task_id,
                    attempt: task.attempt,
                    handle,
                    request: request_for(task),
                });
            }
            (!dispatches.is_empty(), dispatches)
        })
    }

    /// Raise progress of an active dispatch.  Never lowers progress and
    /// never touches a task that left the dispatch's lifecycle.
    pub(crate) fn advance(&self, task_id: TaskId, attempt: u32, status: TaskStatus, progress: u8) -> bool {
        self.modify_fenced(task_id, attempt, |task| {
            if progress <= task.progress {
                return false;
            }
            task.status = status;
            task.progress = progress;
            true
        })
    }

    /// Record a successful result.  The task's handle is dropped in the same
    /// step.
    pub(crate) fn complete(&self, task_id: TaskId, attempt: u32, result: SegmentResult) -> bool {
        self.modify_fenced(task_id, attempt, |task| {
            self.registry.forget(task_id);
            if let Some(file_id) = result.file_id.clone() {
                task.server_file_id = Some(file_id);
            }
            task.reuse_upload = false;
            task.status = TaskStatus::Done;
            task.progress = 100;
            task.error = None;
            task.result = Some(result);
            true
        })
    }

    /// Record a failure with an already classified message.
    pub(crate) fn fail(&self, task_id: TaskId, attempt: u32, message: String) -> bool {
        self.modify_fenced(task_id, attempt, |task| {
            self.registry.forget(task_id);
            task.status = TaskStatus::Failed;
            task.progress = 0;
            task.result = None;
            task.error = Some(message);
            true
        })
    }

    /// Drop the registry entry of a finished dispatch.
    pub(crate) fn release(&self, task_id: TaskId, handle: &CancelHandle) {
        self.registry.release(task_id, handle);
    }

    /// Apply `f` only while the task is still active in `attempt`.
    fn modify_fenced(&self, task_id: TaskId, attempt: u32, f: impl FnOnce(&mut Task) -> bool) -> bool {
        self.modify(|state| {
            let Some(task) = state.get_mut(task_id) else {
                return (false, false);
            };
            if task.attempt != attempt || !task.status.is_active() {
                debug!(task_id, attempt, status = %task.status, "stale write discarded");
                return (false, false);
            }
            let applied = f(task);
            if applied {
                task.touch();
            }
            (applied, applied)
        })
    }
}

/// Allow-list and size check.  Returns the rejection message, if any.
fn validate(file: &InputFile, max_upload_bytes: Option<u64>) -> Option<&'static str> {
    let allowed = match (&file.mime, file.extension()) {
        (_, Some(ext)) => ALLOWED_EXTENSIONS.contains(&ext.as_str()),
        // Only extensionless files (e.g. pasted images) fall back to the MIME type.
        (Some(mime), None) => ALLOWED_MIME_TYPES.contains(&mime.to_ascii_lowercase().as_str()),
        (None, None) => false,
    };
    if !allowed {
        return Some(UNSUPPORTED_FILE_TYPE);
    }
    match max_upload_bytes {
        Some(limit) if file.bytes.len() as u64 > limit => Some(classify::FILE_TOO_LARGE),
        _ => None,
    }
}

fn reprocess(task: &mut Task, registry: &CancellationRegistry) -> bool {
    registry.cancel(task.id);
    if let Some(file_id) = task.result.as_ref().and_then(|r| r.file_id.clone()) {
        task.server_file_id = Some(file_id);
    }
    task.reuse_upload = task.server_file_id.is_some();
    task.requeue();
    task.reuse_upload
}

fn request_for(task: &Task) -> SegmentRequest {
    let upload = match (&task.server_file_id, task.reuse_upload) {
        (Some(file_id), true) => Upload::FileId(file_id.clone()),
        _ => Upload::File {
            name: task.file.name.clone(),
            mime: task.file.mime.clone(),
            bytes: task.file.bytes.clone(),
        },
    };
    SegmentRequest {
        upload,
        params: task.params,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(name: &str) -> InputFile {
        InputFile::new(name, vec![0u8; 16])
    }

    fn admit_all(store: &QueueStore) -> Vec<Dispatch> {
        store.admit(|tasks| {
            tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Queued)
                .map(|t| t.id)
                .collect()
        })
    }

    #[test]
    fn submit_validates_and_selects_first_new_task() {
        let store = QueueStore::new();
        let ids = store.submit(vec![png("a.png"), png("notes.txt"), png("c.WEBP")], None);
        let state = store.snapshot();

        assert_eq!(state.tasks.len(), 3);
        assert_eq!(state.tasks[0].status, TaskStatus::Queued);
        assert_eq!(state.tasks[1].status, TaskStatus::Failed);
        assert_eq!(state.tasks[1].error.as_deref(), Some(UNSUPPORTED_FILE_TYPE));
        assert_eq!(state.tasks[2].status, TaskStatus::Queued);
        assert_eq!(state.selected, Some(ids[0]));
        assert!(state.tasks.iter().all(|t| !t.preview_url.is_empty()));
    }

    #[test]
    fn mime_type_admits_extensionless_file() {
        let store = QueueStore::new();
        store.submit(vec![png("clipboard").with_mime("image/PNG")], None);
        assert_eq!(store.snapshot().tasks[0].status, TaskStatus::Queued);
    }

    #[test]
    fn submit_with_applies_clamped_params() {
        let store = QueueStore::new();
        let params = SegmentParams {
            feather: 99,
            threshold: 7,
            ..Default::default()
        };
        let ids = store.submit_with(vec![png("a.png")], params, None);
        let task = store.task(ids[0]).unwrap();
        assert_eq!(task.params.threshold, 7);
        assert_eq!(task.params.feather, SegmentParams::MAX_FEATHER);
    }

    #[test]
    fn disallowed_extension_is_rejected_despite_allowed_mime() {
        let store = QueueStore::new();
        let ids = store.submit(vec![png("anim.gif").with_mime("image/png")], None);
        let task = store.task(ids[0]).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some(UNSUPPORTED_FILE_TYPE));
        assert!(admit_all(&store).is_empty());
    }

    #[test]
    fn oversized_file_is_rejected_locally() {
        let store = QueueStore::new();
        store.submit(vec![png("big.jpg")], Some(8));
        let task = &store.snapshot().tasks[0];
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("File too large"));
    }

    #[test]
    fn ids_are_never_reused() {
        let store = QueueStore::new();
        let first = store.submit(vec![png("a.png")], None);
        store.cancel(first[0]).unwrap();
        store.clear_completed();
        let second = store.submit(vec![png("b.png")], None);
        assert!(second[0] > first[0]);
    }

    #[test]
    fn admit_registers_handle_and_builds_request() {
        let store = QueueStore::new();
        let ids = store.submit(vec![png("a.png").with_mime("image/png")], None);
        let dispatches = admit_all(&store);

        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].attempt, 1);
        assert!(matches!(
            &dispatches[0].request.upload,
            Upload::File { name, mime: Some(mime), .. } if name == "a.png" && mime == "image/png"
        ));
        let task = store.task(ids[0]).unwrap();
        assert_eq!(task.status, TaskStatus::Uploading);
        assert_eq!(task.progress, ADMITTED_PROGRESS);
        assert!(store.registry().contains(ids[0]));
    }

    #[test]
    fn cancel_is_idempotent_and_clears_handle() {
        let store = QueueStore::new();
        let ids = store.submit(vec![png("a.png"), png("b.png")], None);
        let dispatches = admit_all(&store);
        let signal = dispatches[0].handle.signal();

        assert!(store.cancel(ids[0]).unwrap());
        assert!(signal.is_cancelled());
        assert!(!store.registry().contains(ids[0]));
        assert!(!store.cancel(ids[0]).unwrap(), "no handle left to fire");

        let task = store.task(ids[0]).unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(task.progress, 0);
        assert!(matches!(store.cancel(99), Err(QueueError::TaskNotFound { task_id: 99 })));
    }

    #[test]
    fn late_writes_after_cancel_are_discarded() {
        let store = QueueStore::new();
        let ids = store.submit(vec![png("a.png")], None);
        let dispatch = admit_all(&store).pop().unwrap();
        store.cancel(ids[0]).unwrap();

        assert!(!store.complete(ids[0], dispatch.attempt, SegmentResult::default()));
        assert!(!store.fail(ids[0], dispatch.attempt, "boom".into()));
        assert!(!store.advance(ids[0], dispatch.attempt, TaskStatus::Processing, 60));
        let task = store.task(ids[0]).unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert!(task.result.is_none());
    }

    #[test]
    fn writes_from_an_older_attempt_are_discarded() {
        let store = QueueStore::new();
        let ids = store.submit(vec![png("a.png")], None);
        let first = admit_all(&store).pop().unwrap();
        store.mark_for_reprocess(ids[0]).unwrap();
        let second = admit_all(&store).pop().unwrap();
        assert_eq!(second.attempt, first.attempt + 1);
        assert!(first.handle.is_cancelled());

        assert!(!store.complete(ids[0], first.attempt, SegmentResult::default()));
        store.release(ids[0], &first.handle);
        assert!(store.registry().contains(ids[0]), "newer handle survives");
        assert!(store.complete(ids[0], second.attempt, SegmentResult::default()));
    }

    #[test]
    fn progress_never_decreases() {
        let store = QueueStore::new();
        let ids = store.submit(vec![png("a.png")], None);
        let dispatch = admit_all(&store).pop().unwrap();
        assert!(store.advance(ids[0], dispatch.attempt, TaskStatus::Processing, 85));
        assert!(!store.advance(ids[0], dispatch.attempt, TaskStatus::Processing, 60));
        assert_eq!(store.task(ids[0]).unwrap().progress, 85);
    }

    #[test]
    fn retry_only_from_failed_or_canceled() {
        let store = QueueStore::new();
        let ids = store.submit(vec![png("a.png"), png("b.png")], None);
        let dispatches = admit_all(&store);

        let err = store.retry(ids[0]).unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition { status: TaskStatus::Uploading, action: "retry", .. }
        ));

        store.fail(ids[0], dispatches[0].attempt, "Request timed out".into());
        store.release(ids[0], &dispatches[0].handle);
        store.retry(ids[0]).unwrap();
        let task = store.task(ids[0]).unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.error, None);
        assert_eq!(task.progress, 0);
    }

    #[test]
    fn update_parameters_keeps_status() {
        let store = QueueStore::new();
        let ids = store.submit(vec![png("a.png")], None);
        admit_all(&store);
        let before = store.task(ids[0]).unwrap();
        let params = SegmentParams {
            threshold: 200,
            padding: 90,
            ..Default::default()
        };
        store.update_parameters(ids[0], params).unwrap();

        let after = store.task(ids[0]).unwrap();
        assert_eq!(after.status, TaskStatus::Uploading);
        assert_eq!(after.params.threshold, 200);
        assert_eq!(after.params.padding, SegmentParams::MAX_PADDING);
        assert!(after.updated_at >= before.updated_at);
    }

    #[test]
    fn reprocess_reuses_server_file_id() {
        let store = QueueStore::new();
        let ids = store.submit(vec![png("a.png")], None);
        let dispatch = admit_all(&store).pop().unwrap();
        let result = SegmentResult {
            id: "job-1".into(),
            file_id: Some("upload-1".into()),
            ..Default::default()
        };
        assert!(store.complete(ids[0], dispatch.attempt, result));
        assert!(!store.registry().contains(ids[0]), "terminal write drops the handle");
        assert!(!dispatch.handle.is_cancelled());

        assert!(store.select_candidate(ids[0], 2).unwrap());
        let task = store.task(ids[0]).unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.result.is_none());
        assert_eq!(task.params.candidate_index, Some(2));
        assert_eq!(task.view.selected_candidate, Some(2));

        let next = admit_all(&store).pop().unwrap();
        assert!(matches!(&next.request.upload, Upload::FileId(id) if id == "upload-1"));
        assert_eq!(next.request.params.candidate_index, Some(2));
    }

    #[test]
    fn clear_completed_keeps_pending_work_in_order() {
        let store = QueueStore::new();
        let ids = store.submit(
            vec![png("a.png"), png("b.png"), png("c.png"), png("d.txt"), png("e.png")],
            None,
        );
        let dispatches = admit_all(&store);
        store.complete(ids[0], dispatches[0].attempt, SegmentResult::default());
        store.cancel(ids[1]).unwrap();
        store.retry(ids[1]).unwrap();
        store.cancel(ids[2]).unwrap();

        assert_eq!(store.clear_completed(), 2);
        let remaining: Vec<TaskId> = store.snapshot().tasks.iter().map(|t| t.id).collect();
        assert_eq!(remaining, vec![ids[1], ids[3], ids[4]]);
    }

    #[test]
    fn clear_all_fires_every_handle() {
        let store = QueueStore::new();
        store.submit(vec![png("a.png"), png("b.png")], None);
        let dispatches = admit_all(&store);
        assert_eq!(store.clear_all(), 2);
        assert!(dispatches.iter().all(|d| d.handle.is_cancelled()));
        assert!(store.registry().is_empty());
        assert_eq!(store.snapshot().selected, None);
    }

    #[test]
    fn removing_selected_task_moves_selection() {
        let store = QueueStore::new();
        let ids = store.submit(vec![png("a.png"), png("b.png")], None);
        let dispatches = admit_all(&store);
        store.complete(ids[1], dispatches[1].attempt, SegmentResult::default());
        store.cancel(ids[0]).unwrap();
        store.select(ids[0]).unwrap();

        store.clear_completed();
        assert_eq!(store.snapshot().selected, None);

        let more = store.submit(vec![png("c.png")], None);
        assert_eq!(store.snapshot().selected, Some(more[0]));
    }
}
