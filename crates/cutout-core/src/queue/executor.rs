use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{RemoteError, SegmentClient};
use crate::config::Milestone;
use crate::queue::classify::{self, classify_error};
use crate::queue::registry::CancelHandle;
use crate::queue::store::{Dispatch, QueueStore};
use crate::queue::types::TaskId;

/// How one dispatch ended, as seen by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Done,
    Failed,
    TimedOut,
    Canceled,
    /// The task left this dispatch's lifecycle (canceled, re-queued or
    /// removed) before the outcome could be written.
    Superseded,
}

/// Drives one admitted task from `Uploading` to a terminal state.
pub(crate) struct TaskExecutor {
    store: QueueStore,
    client: Arc<dyn SegmentClient>,
    timeout: Duration,
    milestones: Arc<[Milestone]>,
}

impl TaskExecutor {
    pub(crate) fn new(
        store: QueueStore,
        client: Arc<dyn SegmentClient>,
        timeout: Duration,
        milestones: Vec<Milestone>,
    ) -> Self {
        Self {
            store,
            client,
            timeout,
            milestones: milestones.into(),
        }
    }

    pub(crate) async fn run(&self, dispatch: Dispatch) -> Outcome {
        let Dispatch {
            task_id,
            attempt,
            handle,
            request,
        } = dispatch;

        // Timers and the registry entry are released when this goes out of
        // scope, on every path out of this function.
        let _guard = DispatchGuard::arm(self, task_id, attempt, &handle);
        let signal = handle.signal();

        let result = tokio::select! {
            biased;
            _ = signal.cancelled() => Err(RemoteError::Aborted),
            result = self.client.segment(request, signal.clone()) => result,
        };

        match result {
            Ok(result) => {
                let total_ms = result.total_ms();
                if self.store.complete(task_id, attempt, result) {
                    info!(task_id, attempt, total_ms, "task done");
                    Outcome::Done
                } else {
                    debug!(task_id, attempt, "late success discarded");
                    Outcome::Superseded
                }
            }
            Err(_) if handle.is_cancelled() && handle.timed_out() => {
                if self.store.fail(task_id, attempt, classify::TIMED_OUT.to_owned()) {
                    warn!(task_id, attempt, timeout_secs = self.timeout.as_secs(), "task timed out");
                    Outcome::TimedOut
                } else {
                    Outcome::Superseded
                }
            }
            Err(_) if handle.is_cancelled() => {
                info!(task_id, attempt, "task canceled");
                Outcome::Canceled
            }
            Err(err) => {
                let message = classify_error(&err.to_string());
                if self.store.fail(task_id, attempt, message.clone()) {
                    warn!(task_id, attempt, error = %err, classified = %message, "task failed");
                    Outcome::Failed
                } else {
                    debug!(task_id, attempt, error = %err, "late failure discarded");
                    Outcome::Superseded
                }
            }
        }
    }
}

/// Owns the deadline and milestone timers of one dispatch.
struct DispatchGuard<'a> {
    store: &'a QueueStore,
    task_id: TaskId,
    handle: &'a CancelHandle,
    timers: Vec<JoinHandle<()>>,
}

impl<'a> DispatchGuard<'a> {
    fn arm(executor: &'a TaskExecutor, task_id: TaskId, attempt: u32, handle: &'a CancelHandle) -> Self {
        let started = Instant::now();

        let deadline = {
            let handle = handle.clone();
            let timeout = executor.timeout;
            tokio::spawn(async move {
                tokio::time::sleep_until(started + timeout).await;
                debug!(task_id, attempt, "deadline reached; aborting request");
                handle.expire();
            })
        };

        let milestones = {
            let store = executor.store.clone();
            let steps = Arc::clone(&executor.milestones);
            tokio::spawn(async move {
                for step in steps.iter() {
                    tokio::time::sleep_until(started + step.after).await;
                    if store.advance(task_id, attempt, step.status, step.progress) {
                        debug!(task_id, attempt, progress = step.progress, status = %step.status, "milestone");
                    }
                }
            })
        };

        Self {
            store: &executor.store,
            task_id,
            handle,
            timers: vec![deadline, milestones],
        }
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        for timer in &self.timers {
            timer.abort();
        }
        self.store.release(self.task_id, self.handle);
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::client::{SegmentRequest, SegmentResult};
    use crate::queue::registry::CancelSignal;
    use crate::queue::types::{InputFile, TaskStatus};

    /// A provider that never answers and never looks at its cancel signal.
    struct StalledClient;

    #[async_trait]
    impl SegmentClient for StalledClient {
        async fn segment(
            &self,
            _request: SegmentRequest,
            _cancel: CancelSignal,
        ) -> Result<SegmentResult, RemoteError> {
            std::future::pending().await
        }

        async fn job(&self, _job_id: &str) -> Result<SegmentResult, RemoteError> {
            Err(RemoteError::Aborted)
        }

        async fn download_zip(&self, _job_ids: &[String]) -> Result<Bytes, RemoteError> {
            Err(RemoteError::Aborted)
        }
    }

    fn admitted(store: &QueueStore) -> Dispatch {
        store.submit(vec![InputFile::new("a.png", vec![0u8; 16])], None);
        let mut dispatches = store.admit(|tasks| tasks.iter().map(|t| t.id).collect());
        assert_eq!(dispatches.len(), 1);
        dispatches.remove(0)
    }

    fn executor(store: &QueueStore) -> TaskExecutor {
        TaskExecutor::new(store.clone(), Arc::new(StalledClient), Duration::from_secs(5), Vec::new())
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fails_a_stalled_request() {
        let store = QueueStore::new();
        let dispatch = admitted(&store);
        let task_id = dispatch.task_id;

        let outcome = executor(&store).run(dispatch).await;

        assert_eq!(outcome, Outcome::TimedOut);
        let task = store.task(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some(classify::TIMED_OUT));
        assert!(store.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn user_cancel_wins_over_a_later_deadline() {
        let store = QueueStore::new();
        let dispatch = admitted(&store);
        let task_id = dispatch.task_id;
        let handle = dispatch.handle.clone();

        let executor = executor(&store);
        let run = tokio::spawn(async move { executor.run(dispatch).await });
        tokio::task::yield_now().await;

        // The user cancel commits first; the deadline then marks the same
        // handle as expired before the executor observes either.
        store.cancel(task_id).unwrap();
        handle.expire();
        assert!(handle.timed_out());

        let outcome = run.await.unwrap();
        assert_eq!(outcome, Outcome::Superseded);
        let task = store.task(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(task.error, None);
        assert_eq!(task.progress, 0);
        assert!(store.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_without_deadline_reports_canceled() {
        let store = QueueStore::new();
        let dispatch = admitted(&store);
        let task_id = dispatch.task_id;

        let executor = executor(&store);
        let run = tokio::spawn(async move { executor.run(dispatch).await });
        tokio::task::yield_now().await;
        store.cancel(task_id).unwrap();

        assert_eq!(run.await.unwrap(), Outcome::Canceled);
        assert_eq!(store.task(task_id).unwrap().status, TaskStatus::Canceled);
    }
}
