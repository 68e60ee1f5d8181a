// Client-side handle objects (spec.md §3's "Client-side handle object",
// per-class metadata; §4.3's retain/release asymmetry for devices;
// §4.9's kernel-arg-info cache and program source/binary cache).
//
// Every class shares the same head shape (dispatch pointer, remote handle,
// reference count, owning server) per §9's "dynamic dispatch / first field"
// redesign note — `dispatch` is always the first field so a `#[repr(C)]`
// handle can be handed to the host ICD loader as an opaque `cl_*` pointer.
use std::sync::{Arc, Mutex};

use oclproxy_common::{HandleWrapper, ObjectClass};

use crate::registry::{RefCount, RemoteHandle};
use crate::server::ServerRecord;

/// Every handle class carries this dispatch-table pointer as its first
/// field (original_source/include/ocland/client/ocland_icd.h). `ffi.rs` is
/// the only place it is ever dereferenced.
pub type DispatchTable = *const std::ffi::c_void;

pub struct PlatformHandle {
    pub dispatch: DispatchTable,
    remote: HandleWrapper,
    rc: RefCount,
    pub server: Arc<ServerRecord>,
}

impl RemoteHandle for PlatformHandle {
    fn remote(&self) -> HandleWrapper {
        self.remote
    }
}

impl PlatformHandle {
    pub fn new(remote: HandleWrapper, server: Arc<ServerRecord>) -> Self {
        PlatformHandle {
            dispatch: std::ptr::null(),
            remote,
            rc: RefCount::new(),
            server,
        }
    }
}

/// Devices returned directly by `clGetDeviceIDs` are "root" and ignore
/// retain/release per §4.3's supplement (original_source/src/client/device_id.c);
/// devices returned by `clCreateSubDevices` count normally.
pub struct DeviceHandle {
    pub dispatch: DispatchTable,
    remote: HandleWrapper,
    rc: RefCount,
    pub server: Arc<ServerRecord>,
    pub is_root: bool,
}

impl RemoteHandle for DeviceHandle {
    fn remote(&self) -> HandleWrapper {
        self.remote
    }
}

impl DeviceHandle {
    pub fn new(remote: HandleWrapper, server: Arc<ServerRecord>, is_root: bool) -> Self {
        DeviceHandle {
            dispatch: std::ptr::null(),
            remote,
            rc: RefCount::new(),
            server,
            is_root,
        }
    }

    /// `true` once this was the release that should trigger destruction —
    /// always `false` for root devices (spec.md §4.3).
    pub fn retain(&self) {
        if !self.is_root {
            self.rc.retain();
        }
    }

    pub fn release(&self) -> bool {
        if self.is_root {
            false
        } else {
            self.rc.release()
        }
    }
}

type NotifyCallback = Box<dyn FnMut(&str, &[u8]) + Send>;

/// A context always holds a strong reference to its server's download
/// stream for as long as any callback is registered (spec.md §3's
/// context-specific invariant); `stream_task_id` is `Some` exactly while
/// that reference is held, and is taken (released exactly once) by
/// `release_stream_task`.
pub struct ContextHandle {
    pub dispatch: DispatchTable,
    remote: HandleWrapper,
    rc: RefCount,
    pub server: Arc<ServerRecord>,
    pub devices: Vec<HandleWrapper>,
    pub properties: Vec<u64>,
    notify: Mutex<Option<NotifyCallback>>,
    stream_task_id: Mutex<Option<u64>>,
}

impl RemoteHandle for ContextHandle {
    fn remote(&self) -> HandleWrapper {
        self.remote
    }
}

impl ContextHandle {
    pub fn new(
        remote: HandleWrapper,
        server: Arc<ServerRecord>,
        devices: Vec<HandleWrapper>,
        properties: Vec<u64>,
        notify: Option<NotifyCallback>,
    ) -> Self {
        ContextHandle {
            dispatch: std::ptr::null(),
            remote,
            rc: RefCount::new(),
            server,
            devices,
            properties,
            notify: Mutex::new(notify),
            stream_task_id: Mutex::new(None),
        }
    }

    pub fn retain(&self) {
        self.rc.retain();
    }

    pub fn release(&self) -> bool {
        self.rc.release()
    }

    pub fn bind_stream_task(&self, task_id: u64) {
        *self.stream_task_id.lock().unwrap() = Some(task_id);
    }

    /// Release the context's download-stream reference exactly once; a
    /// second call is a no-op (spec.md §4.3's "released exactly once
    /// regardless of error path" invariant).
    pub fn release_stream_task(&self) -> Option<u64> {
        self.stream_task_id.lock().unwrap().take()
    }

    pub fn notify(&self, error_text: &str, binary_info: &[u8]) {
        if let Some(cb) = self.notify.lock().unwrap().as_mut() {
            cb(error_text, binary_info);
        }
    }
}

pub struct CommandQueueHandle {
    pub dispatch: DispatchTable,
    remote: HandleWrapper,
    rc: RefCount,
    pub server: Arc<ServerRecord>,
    pub context: HandleWrapper,
    pub device: HandleWrapper,
}

impl RemoteHandle for CommandQueueHandle {
    fn remote(&self) -> HandleWrapper {
        self.remote
    }
}

impl CommandQueueHandle {
    pub fn new(
        remote: HandleWrapper,
        server: Arc<ServerRecord>,
        context: HandleWrapper,
        device: HandleWrapper,
    ) -> Self {
        CommandQueueHandle {
            dispatch: std::ptr::null(),
            remote,
            rc: RefCount::new(),
            server,
            context,
            device,
        }
    }

    pub fn retain(&self) {
        self.rc.retain();
    }

    pub fn release(&self) -> bool {
        self.rc.release()
    }
}

type DestructorCallback = Box<dyn FnMut() + Send>;

/// A memory object's `host_ptr` is non-null iff one of the host-pointer
/// flags is set; for a sub-buffer it is `parent.host_ptr + offset`
/// (spec.md §3, tested by §8's sub-buffer invariant).
pub struct MemoryHandle {
    pub dispatch: DispatchTable,
    remote: HandleWrapper,
    rc: RefCount,
    pub server: Arc<ServerRecord>,
    pub size: usize,
    pub flags: u64,
    pub host_ptr: Option<usize>,
    pub parent: Option<Arc<MemoryHandle>>,
    pub offset: usize,
    destructors: Mutex<Vec<DestructorCallback>>,
}

impl RemoteHandle for MemoryHandle {
    fn remote(&self) -> HandleWrapper {
        self.remote
    }
}

/// Host-pointer allocation flags (`CL_MEM_USE_HOST_PTR`, `CL_MEM_ALLOC_HOST_PTR`,
/// `CL_MEM_COPY_HOST_PTR`) whose presence makes `host_ptr` non-null.
pub const MEM_HOST_PTR_FLAGS: u64 = 0b0000_0001_1100_0000;

impl MemoryHandle {
    pub fn new_buffer(
        remote: HandleWrapper,
        server: Arc<ServerRecord>,
        size: usize,
        flags: u64,
        host_ptr: Option<usize>,
    ) -> Self {
        MemoryHandle {
            dispatch: std::ptr::null(),
            remote,
            rc: RefCount::new(),
            server,
            size,
            flags,
            host_ptr: if flags & MEM_HOST_PTR_FLAGS != 0 {
                host_ptr
            } else {
                None
            },
            parent: None,
            offset: 0,
            destructors: Mutex::new(Vec::new()),
        }
    }

    /// Sub-buffer flag inheritance (original_source/src/client/mem.c,
    /// around `clCreateSubBuffer`): three independent flag groups — access
    /// (read/write/read-only/write-only), host-ptr-allocation, and
    /// host-access — each inherited from the parent only if the child did
    /// not specify anything in that particular group. Groups never mix.
    pub fn new_sub_buffer(
        remote: HandleWrapper,
        parent: Arc<MemoryHandle>,
        requested_flags: u64,
        size: usize,
        offset: usize,
    ) -> Self {
        const ACCESS_MASK: u64 = 0b0000_0000_0000_0111; // RW / READ_ONLY / WRITE_ONLY
        const HOST_PTR_MASK: u64 = MEM_HOST_PTR_FLAGS;
        const HOST_ACCESS_MASK: u64 = 0b0000_0110_0000_0000; // HOST_READ_ONLY / HOST_WRITE_ONLY / HOST_NO_ACCESS

        let mut flags = requested_flags;
        if flags & ACCESS_MASK == 0 {
            flags |= parent.flags & ACCESS_MASK;
        }
        if flags & HOST_PTR_MASK == 0 {
            flags |= parent.flags & HOST_PTR_MASK;
        }
        if flags & HOST_ACCESS_MASK == 0 {
            flags |= parent.flags & HOST_ACCESS_MASK;
        }

        let host_ptr = parent.host_ptr.map(|p| p + offset);
        let server = parent.server.clone();
        MemoryHandle {
            dispatch: std::ptr::null(),
            remote,
            rc: RefCount::new(),
            server,
            size,
            flags,
            host_ptr,
            parent: Some(parent),
            offset,
            destructors: Mutex::new(Vec::new()),
        }
    }

    pub fn add_destructor(&self, cb: DestructorCallback) {
        self.destructors.lock().unwrap().push(cb);
    }

    /// Run destructor callbacks in LIFO order (spec.md §4.3 step (a) of
    /// release-to-zero), the same order `clSetMemObjectDestructorCallback`
    /// documents.
    pub fn run_destructors(&self) {
        let mut cbs = self.destructors.lock().unwrap();
        while let Some(mut cb) = cbs.pop() {
            cb();
        }
    }

    pub fn retain(&self) {
        self.rc.retain();
    }

    pub fn release(&self) -> bool {
        self.rc.release()
    }
}

pub struct SamplerHandle {
    pub dispatch: DispatchTable,
    remote: HandleWrapper,
    rc: RefCount,
    pub server: Arc<ServerRecord>,
}

impl RemoteHandle for SamplerHandle {
    fn remote(&self) -> HandleWrapper {
        self.remote
    }
}

impl SamplerHandle {
    pub fn new(remote: HandleWrapper, server: Arc<ServerRecord>) -> Self {
        SamplerHandle {
            dispatch: std::ptr::null(),
            remote,
            rc: RefCount::new(),
            server,
        }
    }

    pub fn retain(&self) {
        self.rc.retain();
    }

    pub fn release(&self) -> bool {
        self.rc.release()
    }
}

/// Program source/binaries are cached client-side on every build/compile/
/// link so later getters (`GetProgramInfo`, `GetProgramBuildInfo`) answer
/// locally (spec.md §4.9).
pub struct ProgramHandle {
    pub dispatch: DispatchTable,
    remote: HandleWrapper,
    rc: RefCount,
    pub server: Arc<ServerRecord>,
    pub source: Mutex<Option<String>>,
    pub binaries: Mutex<Vec<(HandleWrapper, Vec<u8>)>>,
    pub kernel_names: Mutex<Vec<String>>,
}

impl RemoteHandle for ProgramHandle {
    fn remote(&self) -> HandleWrapper {
        self.remote
    }
}

impl ProgramHandle {
    pub fn with_source(remote: HandleWrapper, server: Arc<ServerRecord>, source: String) -> Self {
        ProgramHandle {
            dispatch: std::ptr::null(),
            remote,
            rc: RefCount::new(),
            server,
            source: Mutex::new(Some(source)),
            binaries: Mutex::new(Vec::new()),
            kernel_names: Mutex::new(Vec::new()),
        }
    }

    pub fn record_binary(&self, device: HandleWrapper, binary: Vec<u8>) {
        let mut binaries = self.binaries.lock().unwrap();
        if let Some(entry) = binaries.iter_mut().find(|(d, _)| *d == device) {
            entry.1 = binary;
        } else {
            binaries.push((device, binary));
        }
    }

    pub fn retain(&self) {
        self.rc.retain();
    }

    pub fn release(&self) -> bool {
        self.rc.release()
    }
}

/// Per-argument cached metadata from `clGetKernelArgInfo`
/// (original_source/src/client/kernel.c); `None` means "not yet fetched",
/// distinct from the kernel-wide `arg_info_unavailable` flag.
#[derive(Debug, Clone)]
pub struct KernelArgInfo {
    pub address_qualifier: u32,
    pub access_qualifier: u32,
    pub type_name: String,
    pub type_qualifier: u64,
    pub name: String,
}

pub struct KernelHandle {
    pub dispatch: DispatchTable,
    remote: HandleWrapper,
    rc: RefCount,
    pub server: Arc<ServerRecord>,
    pub program: HandleWrapper,
    arg_cache: Mutex<Vec<Option<KernelArgInfo>>>,
    /// Set once the server reports `CL_KERNEL_ARG_INFO_NOT_AVAILABLE`;
    /// every subsequent query short-circuits to the same status
    /// (spec.md §4.9's kernel-arg-info caching rule).
    arg_info_unavailable: std::sync::atomic::AtomicBool,
}

impl RemoteHandle for KernelHandle {
    fn remote(&self) -> HandleWrapper {
        self.remote
    }
}

impl KernelHandle {
    pub fn new(
        remote: HandleWrapper,
        server: Arc<ServerRecord>,
        program: HandleWrapper,
        num_args: usize,
    ) -> Self {
        KernelHandle {
            dispatch: std::ptr::null(),
            remote,
            rc: RefCount::new(),
            server,
            program,
            arg_cache: Mutex::new(vec![None; num_args]),
            arg_info_unavailable: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn mark_arg_info_unavailable(&self) {
        self.arg_info_unavailable
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn arg_info_is_unavailable(&self) -> bool {
        self.arg_info_unavailable
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn cache_arg_info(&self, index: usize, info: KernelArgInfo) {
        let mut cache = self.arg_cache.lock().unwrap();
        if index < cache.len() {
            cache[index] = Some(info);
        }
    }

    pub fn cached_arg_info(&self, index: usize) -> Option<KernelArgInfo> {
        self.arg_cache.lock().unwrap().get(index).cloned().flatten()
    }

    pub fn retain(&self) {
        self.rc.retain();
    }

    pub fn release(&self) -> bool {
        self.rc.release()
    }
}
