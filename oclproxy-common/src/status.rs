// Event status constants shared by both peers (spec.md §4.7's event
// states; original_source/include/ocland/common/CLinfo.h's ordering).
//
// Any negative value is an error status and is terminal from any state;
// the specific negative value is the real API's status code, forwarded
// verbatim (spec.md §7, error kind 4).
pub const QUEUED: i32 = 0;
pub const SUBMITTED: i32 = 1;
pub const RUNNING: i32 = 2;
pub const COMPLETE: i32 = 3;

pub fn is_error(status: i32) -> bool {
    status < 0
}

pub fn is_terminal(status: i32) -> bool {
    status == COMPLETE || is_error(status)
}

/// Monotonic in the standard ordering queued→submitted→running→complete,
/// except that error is reachable (and terminal) from any state
/// (spec.md §3's event invariant).
pub fn is_valid_transition(from: i32, to: i32) -> bool {
    if is_error(to) {
        return true;
    }
    if is_error(from) {
        return false;
    }
    to >= from
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_is_reachable_from_any_state_and_terminal() {
        for from in [QUEUED, SUBMITTED, RUNNING, COMPLETE] {
            assert!(is_valid_transition(from, -1));
        }
        assert!(!is_valid_transition(-1, COMPLETE));
        assert!(is_terminal(-1));
    }

    #[test]
    fn forward_progress_is_monotonic() {
        assert!(is_valid_transition(QUEUED, SUBMITTED));
        assert!(!is_valid_transition(SUBMITTED, QUEUED));
        assert!(is_valid_transition(COMPLETE, COMPLETE));
    }
}
