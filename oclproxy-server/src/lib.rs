//! The daemon half of the proxy-protocol engine: the server-side Handle
//! Validator, the Command Dispatcher, the extended context/event wrappers,
//! and the `LocalDevice` boundary behind which the real local OpenCL
//! driver would sit.
//!
//! `main.rs` is the only piece that is not exercised by this crate's own
//! test suite — everything else is driven in-process against
//! [`local_device::FakeDevice`] the way `oclproxy-client`'s tests drive
//! `ServerRecord` against an in-process `TcpListener`.

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod event;
pub mod local_device;
pub mod validator;

pub use config::Config;
pub use context::ExtendedContext;
pub use dispatcher::{run_client_session, ClientSession};
pub use event::ExtendedEvent;
pub use local_device::{FakeDevice, KernelArgInfo, LocalDevice};
pub use validator::Validator;
