//! Shared vocabulary of the proxy-protocol engine: the Wire Codec, the
//! portable handle wrapper, the Compression Pipeline, the closed command
//! enum, and the task/tasks-list primitives used by both streams.
//!
//! Nothing here owns a socket beyond [`codec::Socket`] itself, and nothing
//! here runs a thread — that belongs to `oclproxy-client` and
//! `oclproxy-server`.

pub mod cl_status;
pub mod codec;
pub mod command;
pub mod compress;
pub mod error;
pub mod handle;
pub mod status;
pub mod task;

pub use codec::{Availability, Socket, Turn};
pub use command::Command;
pub use compress::{Compressor, Identity};
pub use error::{ProxyError, ProxyResult};
pub use handle::{Arch, HandleWrapper, ObjectClass};
pub use task::TasksList;

/// Default base port for the command channel (spec.md §6); callbacks use
/// `base + 1`.
pub const DEFAULT_BASE_PORT: u16 = 51000;
