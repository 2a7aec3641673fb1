use crate::queue::types::{Task, TaskId, TaskStatus};

/// Reconcile the selected task id against the current collection.
///
/// Keeps `selected` while it still exists; otherwise prefers the first
/// finished task, then the first task overall.
pub fn reconcile(tasks: &[Task], selected: Option<TaskId>) -> Option<TaskId> {
    if tasks.is_empty() {
        return None;
    }
    if let Some(id) = selected {
        if tasks.iter().any(|t| t.id == id) {
            return Some(id);
        }
    }
    tasks
        .iter()
        .find(|t| t.status == TaskStatus::Done)
        .or_else(|| tasks.first())
        .map(|t| t.id)
}
