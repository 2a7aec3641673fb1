use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::queue::types::TaskId;

#[derive(Debug)]
struct HandleInner {
    /// Becomes `true` exactly once, when the handle fires.
    tx: watch::Sender<bool>,
    /// Set only by the deadline timer, before it fires the handle.
    timed_out: AtomicBool,
}

/// Cooperative cancellation handle for one dispatch of one task.
///
/// Clones share the same underlying signal.  Firing is idempotent.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    inner: Arc<HandleInner>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(HandleInner {
                tx,
                timed_out: AtomicBool::new(false),
            }),
        }
    }

    /// Receiver side handed to the remote call.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.inner.tx.subscribe(),
        }
    }

    /// Fire the handle on behalf of the user.
    pub fn cancel(&self) {
        self.inner.tx.send_replace(true);
    }

    /// Fire the handle on behalf of the deadline timer.
    pub fn expire(&self) {
        self.inner.timed_out.store(true, Ordering::SeqCst);
        self.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.tx.borrow()
    }

    pub fn timed_out(&self) -> bool {
        self.inner.timed_out.load(Ordering::SeqCst)
    }

    fn same_as(&self, other: &CancelHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a [`CancelHandle`], passed into remote calls.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the handle fires.  Pends forever if the handle is
    /// dropped without firing.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Live cancellation handles, keyed by task id.
///
/// Holds an entry only while the task is uploading or processing.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    handles: Arc<Mutex<HashMap<TaskId, CancelHandle>>>,
}

impl std::fmt::Debug for CancellationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CancellationRegistry({} handles)", self.len())
    }
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` for `task_id`, firing any stale handle it replaces.
    pub fn register(&self, task_id: TaskId, handle: CancelHandle) {
        if let Ok(mut map) = self.handles.lock() {
            if let Some(stale) = map.insert(task_id, handle) {
                stale.cancel();
            }
        }
    }

    /// Fire and remove the handle for `task_id`.  Returns `true` if one was live.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        if let Ok(mut map) = self.handles.lock() {
            if let Some(handle) = map.remove(&task_id) {
                handle.cancel();
                return true;
            }
        }
        false
    }

    /// Fire and remove every live handle.  Returns how many were live.
    pub fn cancel_all(&self) -> usize {
        match self.handles.lock() {
            Ok(mut map) => {
                let count = map.len();
                for (_, handle) in map.drain() {
                    handle.cancel();
                }
                count
            }
            Err(_) => 0,
        }
    }

    /// Remove the entry for `task_id` only if it is still `handle`.
    ///
    /// A newer dispatch of the same task may already have registered its own
    /// handle; that one must survive the old dispatch's cleanup.
    pub fn release(&self, task_id: TaskId, handle: &CancelHandle) -> bool {
        if let Ok(mut map) = self.handles.lock() {
            if map.get(&task_id).is_some_and(|live| live.same_as(handle)) {
                map.remove(&task_id);
                return true;
            }
        }
        false
    }

    /// Remove the entry for `task_id` without firing it.
    pub(crate) fn forget(&self, task_id: TaskId) -> bool {
        self.handles
            .lock()
            .map(|mut map| map.remove(&task_id).is_some())
            .unwrap_or(false)
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.handles
            .lock()
            .map(|map| map.contains_key(&task_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.handles.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_fires_and_removes_handle() {
        let registry = CancellationRegistry::new();
        let handle = CancelHandle::new();
        let signal = handle.signal();
        registry.register(7, handle.clone());

        assert!(registry.cancel(7));
        assert!(signal.is_cancelled());
        assert!(!handle.timed_out());
        assert!(!registry.contains(7));
        assert!(!registry.cancel(7), "second cancel finds nothing");
    }

    #[test]
    fn expire_marks_timeout_before_firing() {
        let handle = CancelHandle::new();
        handle.expire();
        assert!(handle.is_cancelled());
        assert!(handle.timed_out());
    }

    #[test]
    fn release_ignores_a_newer_handle() {
        let registry = CancellationRegistry::new();
        let old = CancelHandle::new();
        let new = CancelHandle::new();
        registry.register(1, old.clone());
        registry.register(1, new.clone());

        assert!(old.is_cancelled(), "replaced handle is fired");
        assert!(!registry.release(1, &old));
        assert!(registry.contains(1));
        assert!(registry.release(1, &new));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn signal_resolves_after_cancel() {
        let handle = CancelHandle::new();
        let signal = handle.signal();
        let waiter = tokio::spawn(async move { signal.cancelled().await });
        handle.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("signal should resolve")
            .expect("waiter should not panic");
    }

    #[tokio::test(start_paused = true)]
    async fn never_signal_does_not_resolve() {
        let signal = CancelSignal::never();
        let result =
            tokio::time::timeout(std::time::Duration::from_secs(5), signal.cancelled()).await;
        assert!(result.is_err());
        assert!(!signal.is_cancelled());
    }
}
