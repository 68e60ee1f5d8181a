// Task / tasks list primitives shared by the Download and Upload Streams
// (spec.md §3, §4.5, §4.6; original_source/include/ocland/common/downloadStream.h).
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::handle::HandleWrapper;

/// Dispatched with the payload bytes a stream frame carried (empty for a
/// zero-length bulk transfer, per spec.md §8's boundary behaviors).
pub type Callback = Box<dyn FnMut(&[u8]) + Send>;

/// `(identifier, callback, user_data, propagating-flag)` from spec.md §3.
/// `user_data` lives inside the boxed closure rather than as a separate
/// field — the FFI edge (oclproxy-client's dispatch-table functions) is
/// where a raw `void*` gets captured into one of these closures.
struct Task {
    id: u64,
    identifier: HandleWrapper,
    callback: Callback,
    propagating: bool,
}

/// Ordered, mutex-guarded container of tasks (spec.md §3's "Tasks list").
///
/// A single list implementation serves both the *normal* tasks (matched by
/// identifier) and the *error* tasks (fired unconditionally, never matching
/// on identifier) of spec.md §4.5 — callers pick `dispatch` or `fire_all`.
pub struct TasksList {
    next_id: AtomicU64,
    tasks: Mutex<Vec<Task>>,
}

impl Default for TasksList {
    fn default() -> Self {
        Self::new()
    }
}

impl TasksList {
    pub fn new() -> Self {
        TasksList {
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a new task; returns its id, used later with `unregister`.
    pub fn register(
        &self,
        identifier: HandleWrapper,
        propagating: bool,
        callback: Callback,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().unwrap().push(Task {
            id,
            identifier,
            callback,
            propagating,
        });
        id
    }

    pub fn unregister(&self, task_id: u64) -> bool {
        let mut guard = self.tasks.lock().unwrap();
        let before = guard.len();
        guard.retain(|t| t.id != task_id);
        guard.len() != before
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every task whose identifier equals `identifier`, under the
    /// list's mutex (spec.md §4.5 step 3). Stops at, and reports, the first
    /// non-propagating match — its caller unregisters it *outside* the lock
    /// (step 4), so a callback that re-enters the registry cannot deadlock
    /// against this same mutex.
    pub fn dispatch(&self, identifier: HandleWrapper, payload: &[u8]) -> Option<u64> {
        let mut guard = self.tasks.lock().unwrap();
        for task in guard.iter_mut() {
            if task.identifier == identifier {
                (task.callback)(payload);
                if !task.propagating {
                    return Some(task.id);
                }
            }
        }
        None
    }

    /// Invoke every registered task regardless of identifier (error tasks).
    pub fn fire_all(&self, payload: &[u8]) {
        let mut guard = self.tasks.lock().unwrap();
        for task in guard.iter_mut() {
            (task.callback)(payload);
        }
    }
}
