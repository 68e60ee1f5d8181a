// Event Engine (spec.md §4.7; original_source/src/client/event.c).
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use oclproxy_common::{status, HandleWrapper};

use crate::objects::DispatchTable;
use crate::registry::{RefCount, RemoteHandle, Registry};
use crate::server::ServerRecord;
use crate::upload_stream::GatingEvent;

const BUSY_WAIT_SLEEP: Duration = Duration::from_micros(10);

/// Fired with the status that triggered it. `user_data` lives inside the
/// boxed closure, as in [`oclproxy_common::task::Callback`].
type EventCallback = Box<dyn FnMut(i32) + Send>;

/// Per-callback `(threshold, callback)`; spec.md §3 stores these as
/// parallel arrays growing together.
struct CallbackEntry {
    threshold: i32,
    callback: EventCallback,
}

/// `original_source/src/client/event.c`'s handling of `clGetEventProfilingInfo`
/// when the owning queue lacks the profiling property (spec.md §4.9's
/// profiling-info supplement): a fixed "not available" status, never
/// reconstructed timestamps.
pub const PROFILING_INFO_NOT_AVAILABLE: i32 = -7;

pub struct EventHandle {
    pub dispatch: DispatchTable,
    remote: HandleWrapper,
    /// Guards the reference count specifically (spec.md §5's "per-event
    /// mutex" over the refcount); the status itself is a plain atomic since
    /// `set_status` and readers don't need a broader critical section.
    rc_guard: Mutex<()>,
    rc: RefCount,
    pub server: Arc<ServerRecord>,
    pub context: HandleWrapper,
    pub queue: Option<HandleWrapper>,
    status: AtomicI32,
    callbacks: Mutex<Vec<CallbackEntry>>,
    has_profiling: bool,
}

impl RemoteHandle for EventHandle {
    fn remote(&self) -> HandleWrapper {
        self.remote
    }
}

impl GatingEvent for EventHandle {
    fn poll_status(&self) -> i32 {
        self.status()
    }
}

impl EventHandle {
    pub fn new(
        remote: HandleWrapper,
        server: Arc<ServerRecord>,
        context: HandleWrapper,
        queue: Option<HandleWrapper>,
        has_profiling: bool,
    ) -> Self {
        EventHandle {
            dispatch: std::ptr::null(),
            remote,
            rc_guard: Mutex::new(()),
            rc: RefCount::new(),
            server,
            context,
            queue,
            status: AtomicI32::new(status::QUEUED),
            callbacks: Mutex::new(Vec::new()),
            has_profiling,
        }
    }

    /// A user event (`clCreateUserEvent`): not bound to a queue, created
    /// already `queued`, its status only ever changed by
    /// `set_user_event_status` (spec.md §4.7).
    pub fn new_user_event(remote: HandleWrapper, server: Arc<ServerRecord>, context: HandleWrapper) -> Self {
        EventHandle::new(remote, server, context, None, false)
    }

    pub fn status(&self) -> i32 {
        self.status.load(Ordering::SeqCst)
    }

    pub fn is_terminal(&self) -> bool {
        status::is_terminal(self.status())
    }

    /// Updates the status and invokes every registered callback whose
    /// threshold either equals `s` or is `COMPLETE` when `s` is negative
    /// (spec.md §4.7). Non-propagating download tasks may only drive a
    /// transition to `COMPLETE`; user-event updates may set any status —
    /// that restriction is enforced by the caller, not here.
    pub fn set_status(&self, s: i32) {
        let prev = self.status.swap(s, Ordering::SeqCst);
        debug_assert!(
            status::is_valid_transition(prev, s),
            "event status regressed from {prev} to {s} outside the error path"
        );
        let mut callbacks = self.callbacks.lock().unwrap();
        for entry in callbacks.iter_mut() {
            let matches =
                entry.threshold == s || (status::is_error(s) && entry.threshold == status::COMPLETE);
            if matches {
                (entry.callback)(s);
            }
        }
    }

    pub fn add_callback(&self, threshold: i32, callback: EventCallback) {
        self.callbacks
            .lock()
            .unwrap()
            .push(CallbackEntry { threshold, callback });
    }

    pub fn retain(&self) {
        let _guard = self.rc_guard.lock().unwrap();
        self.rc.retain();
    }

    pub fn release(&self) -> bool {
        let _guard = self.rc_guard.lock().unwrap();
        self.rc.release()
    }

    pub fn profiling_info(&self) -> Result<(), i32> {
        if self.has_profiling {
            Ok(())
        } else {
            Err(PROFILING_INFO_NOT_AVAILABLE)
        }
    }
}

/// The process-wide events table (spec.md §5: "a process-wide mutex to
/// protect concurrent wait/flush/finish scanning against concurrent
/// destruction"). `Registry<EventHandle>`'s single mutex already gives us
/// exactly that critical section, so the table is just a registry; the
/// free functions below are the wait/flush/finish operations layered over
/// it.
pub type EventsTable = Registry<EventHandle>;

/// Busy-wait until every listed event is `complete` or negative
/// (spec.md §4.7). Per this crate's resolution of §9's open question on
/// lock scope: events are snapshotted once and the sleep loop holds no
/// registry lock, so a concurrent `discard` on an unrelated event is
/// never blocked by a long-running wait.
pub fn wait_for_events(events: &[Arc<EventHandle>]) {
    loop {
        if events.iter().all(|e| e.is_terminal()) {
            return;
        }
        std::thread::sleep(BUSY_WAIT_SLEEP);
    }
}

/// Wait until every event belonging to `queue` has left the
/// queued/submitted region (spec.md §4.7). Takes a snapshot under the
/// table's lock, then spins without holding it.
pub fn flush(table: &EventsTable, queue: HandleWrapper) {
    let snapshot = snapshot_for_queue(table, queue);
    loop {
        if snapshot
            .iter()
            .all(|e| e.status() != status::QUEUED && e.status() != status::SUBMITTED)
        {
            return;
        }
        std::thread::sleep(BUSY_WAIT_SLEEP);
    }
}

/// As `flush`, but waits until every event reaches `complete`/negative.
pub fn finish(table: &EventsTable, queue: HandleWrapper) {
    let snapshot = snapshot_for_queue(table, queue);
    wait_for_events(&snapshot);
}

fn snapshot_for_queue(table: &EventsTable, queue: HandleWrapper) -> Vec<Arc<EventHandle>> {
    table.retain_matching(|e| e.queue == Some(queue))
}
