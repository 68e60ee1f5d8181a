// Bundled client registries (spec.md §9's "global mutable state" redesign
// note: "bundle registries into a single ClientRuntime constructed at
// library init, owned by the loader entry").
use std::sync::Arc;

use oclproxy_common::Compressor;

use crate::event::EventsTable;
use crate::objects::{
    CommandQueueHandle, ContextHandle, DeviceHandle, KernelHandle, MemoryHandle, PlatformHandle,
    ProgramHandle, SamplerHandle,
};
use crate::registry::Registry;
use crate::server::{default_compressor, ServerDirectory};

/// Owns every per-class [`Registry`] plus the [`ServerDirectory`]; this is
/// what the ICD entry point constructs once and what every RPC marshaler
/// in `rpc.rs` is handed.
pub struct ClientRuntime {
    pub directory: ServerDirectory,
    pub platforms: Registry<PlatformHandle>,
    pub devices: Registry<DeviceHandle>,
    pub contexts: Registry<ContextHandle>,
    pub queues: Registry<CommandQueueHandle>,
    pub memory: Registry<MemoryHandle>,
    pub samplers: Registry<SamplerHandle>,
    pub programs: Registry<ProgramHandle>,
    pub kernels: Registry<KernelHandle>,
    pub events: EventsTable,
    /// Shared by every upload package this process sends (spec.md §4.2:
    /// the compression algorithm is a compile-time choice identical on
    /// both peers, not a per-call one).
    pub compressor: Arc<dyn Compressor>,
}

impl ClientRuntime {
    pub fn new(directory: ServerDirectory) -> Arc<Self> {
        Arc::new(ClientRuntime {
            directory,
            platforms: Registry::new(),
            devices: Registry::new(),
            contexts: Registry::new(),
            queues: Registry::new(),
            memory: Registry::new(),
            samplers: Registry::new(),
            programs: Registry::new(),
            kernels: Registry::new(),
            events: Registry::new(),
            compressor: default_compressor(),
        })
    }
}
