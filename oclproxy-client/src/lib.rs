//! The loadable driver half of the proxy-protocol engine: the client-side
//! Handle Registry, Server Directory, Download/Upload Streams, Event
//! Engine, and a representative RPC Surface, bundled behind one
//! [`runtime::ClientRuntime`] per spec.md §9's "global mutable state"
//! redesign note.
//!
//! The actual ICD dispatch-table plumbing an OpenCL loader `dlopen()`s is
//! out of scope (spec.md §1) — this crate stops at the point where a
//! `#[repr(C)]` wrapper would dereference [`objects::DispatchTable`] and
//! hand typed results back across the C ABI.

pub mod download_stream;
pub mod event;
pub mod objects;
pub mod registry;
pub mod rpc;
pub mod runtime;
pub mod server;
pub mod upload_stream;

pub use event::{EventHandle, EventsTable};
pub use registry::{RefCount, Registry, RemoteHandle};
pub use runtime::ClientRuntime;
pub use server::{ServerDirectory, ServerRecord};
