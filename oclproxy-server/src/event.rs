// Extended event wrapper (spec.md §3, §4.6, §4.8; original_source/include/ocland/server/ocland_event.h).
//
// A server-side event tracks more than the real handle: bulk-transfer
// commands (EnqueueReadBuffer/EnqueueWriteBuffer) keep the event pinned at
// `CL_SUBMITTED` until the data itself has finished crossing the wire, even
// after the real local command completes, so `ocland_event.h`'s distinct
// server-local status field survives here too (spec.md §4.6 "the server's
// event tracks socket completion, not just device completion").
use std::sync::atomic::{AtomicI32, Ordering};

use oclproxy_common::status;

/// Wraps a real event handle with the extra state the dispatcher needs to
/// decide when it is safe to report completion to the client.
pub struct ExtendedEvent {
    real: u64,
    context: u64,
    queue: Option<u64>,
    command_type: u32,
    server_status: AtomicI32,
}

impl ExtendedEvent {
    pub fn new(real: u64, context: u64, queue: Option<u64>, command_type: u32) -> Self {
        ExtendedEvent {
            real,
            context,
            queue,
            command_type,
            server_status: AtomicI32::new(status::QUEUED as i32),
        }
    }

    pub fn real(&self) -> u64 {
        self.real
    }

    pub fn context(&self) -> u64 {
        self.context
    }

    pub fn queue(&self) -> Option<u64> {
        self.queue
    }

    pub fn command_type(&self) -> u32 {
        self.command_type
    }

    pub fn server_status(&self) -> i32 {
        self.server_status.load(Ordering::SeqCst)
    }

    /// Advance the server-local status, refusing a backward transition
    /// (`status::is_valid_transition`, shared with the client-side event
    /// engine so both halves agree on the same state machine).
    pub fn set_server_status(&self, next: i32) -> Result<(), &'static str> {
        let current = self.server_status.load(Ordering::SeqCst);
        if !status::is_valid_transition(current, next) {
            return Err("invalid event status transition");
        }
        self.server_status.store(next, Ordering::SeqCst);
        Ok(())
    }

    /// True once the bulk transfer (if any) this event gates has finished
    /// and the real command has also completed.
    pub fn is_complete(&self) -> bool {
        status::is_terminal(self.server_status.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_queued_and_advances_to_complete() {
        let ev = ExtendedEvent::new(1, 10, Some(20), 0);
        assert_eq!(ev.server_status(), status::QUEUED as i32);
        assert!(!ev.is_complete());
        ev.set_server_status(status::SUBMITTED as i32).unwrap();
        ev.set_server_status(status::RUNNING as i32).unwrap();
        ev.set_server_status(status::COMPLETE as i32).unwrap();
        assert!(ev.is_complete());
    }

    #[test]
    fn rejects_backward_transition() {
        let ev = ExtendedEvent::new(1, 10, None, 0);
        ev.set_server_status(status::COMPLETE as i32).unwrap();
        assert!(ev.set_server_status(status::QUEUED as i32).is_err());
    }

    #[test]
    fn negative_status_is_terminal_error_and_bypasses_transition_check() {
        let ev = ExtendedEvent::new(1, 10, None, 0);
        ev.set_server_status(-5).unwrap();
        assert!(ev.is_complete());
    }
}
