// Server-side validator (spec.md §3 "Server-side validator", §4.8;
// original_source/include/ocland/server/validator.h, src/server/validator.c).
//
// `validator.c`'s eight parallel `cl_uint num_X` / `cl_*[] X` arrays are
// folded here into one `Vec<HandleWrapper>` per class behind a single
// mutex (the dispatcher is already strictly single-threaded per
// connection per spec.md §4.8, so this mutex is uncontended in practice
// and exists only so `Validator` can be shared behind an `Arc` the same
// way the rest of this workspace shares state).
use std::sync::Mutex;

use oclproxy_common::HandleWrapper;

#[derive(Default)]
struct Table {
    entries: Mutex<Vec<HandleWrapper>>,
}

impl Table {
    fn contains(&self, h: HandleWrapper) -> bool {
        self.entries.lock().unwrap().iter().any(|e| *e == h)
    }

    /// Register `h`, ignoring repeats (`validator.c`'s documented
    /// "if repeated X are detected will be ignored"). Returns the new count.
    fn register(&self, h: HandleWrapper) -> usize {
        let mut guard = self.entries.lock().unwrap();
        if !guard.iter().any(|e| *e == h) {
            guard.push(h);
        }
        guard.len()
    }

    /// Returns the new count.
    fn unregister(&self, h: HandleWrapper) -> usize {
        let mut guard = self.entries.lock().unwrap();
        guard.retain(|e| *e != h);
        guard.len()
    }
}

/// Per-client table of every handle that client has been granted
/// (spec.md §3): devices, contexts, queues, memory, samplers, programs,
/// kernels, events. Every dispatcher handler looks a handle up here
/// before forwarding to [`crate::local_device::LocalDevice`]; an absent
/// handle never reaches the real API (spec.md §4.8 step 3).
#[derive(Default)]
pub struct Validator {
    devices: Table,
    contexts: Table,
    queues: Table,
    memory: Table,
    samplers: Table,
    programs: Table,
    kernels: Table,
    events: Table,
}

macro_rules! class_methods {
    ($field:ident, $is:ident, $register:ident, $unregister:ident) => {
        pub fn $is(&self, h: HandleWrapper) -> bool {
            self.$field.contains(h)
        }

        pub fn $register(&self, h: HandleWrapper) -> usize {
            self.$field.register(h)
        }

        pub fn $unregister(&self, h: HandleWrapper) -> usize {
            self.$field.unregister(h)
        }
    };
}

impl Validator {
    pub fn new() -> Self {
        Validator::default()
    }

    class_methods!(devices, is_device, register_device, unregister_device);
    class_methods!(contexts, is_context, register_context, unregister_context);
    class_methods!(queues, is_queue, register_queue, unregister_queue);
    class_methods!(memory, is_memory, register_memory, unregister_memory);
    class_methods!(samplers, is_sampler, register_sampler, unregister_sampler);
    class_methods!(programs, is_program, register_program, unregister_program);
    class_methods!(kernels, is_kernel, register_kernel, unregister_kernel);
    class_methods!(events, is_event, register_event, unregister_event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use oclproxy_common::ObjectClass;

    #[test]
    fn register_is_idempotent_and_absent_handles_are_rejected() {
        let v = Validator::new();
        let h = HandleWrapper::from_local_ptr(0x10, ObjectClass::Context);
        assert!(!v.is_context(h));
        assert_eq!(v.register_context(h), 1);
        assert_eq!(v.register_context(h), 1, "repeated registration is a no-op");
        assert!(v.is_context(h));

        let other = HandleWrapper::from_local_ptr(0x20, ObjectClass::Context);
        assert!(!v.is_context(other));
    }

    #[test]
    fn unregister_removes_exactly_one_entry() {
        let v = Validator::new();
        let a = HandleWrapper::from_local_ptr(1, ObjectClass::Kernel);
        let b = HandleWrapper::from_local_ptr(2, ObjectClass::Kernel);
        v.register_kernel(a);
        v.register_kernel(b);
        assert_eq!(v.unregister_kernel(a), 1);
        assert!(!v.is_kernel(a));
        assert!(v.is_kernel(b));
    }
}
