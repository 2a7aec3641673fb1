use tracing::info;

use crate::queue::store::{Dispatch, QueueStore};
use crate::queue::types::{Task, TaskId, TaskStatus};

/// Admission control: keeps the number of active tasks at or below `bound`.
///
/// The scheduler never polls.  The queue calls [`Scheduler::evaluate`] after
/// every change that can free a slot or add work.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    bound: usize,
}

impl Scheduler {
    pub fn new(bound: usize) -> Self {
        Self { bound: bound.max(1) }
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Admit as many queued tasks as there are free slots, oldest first.
    pub(crate) fn evaluate(&self, store: &QueueStore) -> Vec<Dispatch> {
        let bound = self.bound;
        let dispatches = store.admit(|tasks| pick_admissions(tasks, bound));
        for dispatch in &dispatches {
            info!(
                task_id = dispatch.task_id,
                attempt = dispatch.attempt,
                "task admitted"
            );
        }
        dispatches
    }
}

/// FIFO choice of the queued tasks that fit under `bound`.
pub fn pick_admissions(tasks: &[Task], bound: usize) -> Vec<TaskId> {
    let active = tasks.iter().filter(|t| t.status.is_active()).count();
    let free = bound.saturating_sub(active);
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Queued)
        .take(free)
        .map(|t| t.id)
        .collect()
}
