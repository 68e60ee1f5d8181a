// Closed error kinds from the proxy-protocol engine (see DESIGN.md, ocland/common/dataExchange.c).
use thiserror::Error;

/// The six error kinds the proxy-protocol engine can raise internally.
///
/// Every RPC-facing function collapses one of these, at the edge, into the
/// single OpenCL status code the host sees (`cl_int`); nothing here crosses
/// the ICD boundary directly.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Socket broken: short read/write, or the peer closed early.
    #[error("transport error on {peer}: {detail}")]
    Transport { peer: String, detail: String },

    /// Handle-class mismatch or an oversized/ill-formed control field.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Host-side allocation failed while building or unwinding state.
    #[error("out of host memory: {0}")]
    OutOfHostMemory(String),

    /// The real API on the server returned an error; forwarded verbatim.
    #[error("remote API error {0}")]
    RemoteApi(i32),

    /// The client referenced a handle absent from the server's validator.
    #[error("invalid object: {0}")]
    InvalidObject(&'static str),

    /// A download/upload stream thread detected a failure and is exiting.
    #[error("asynchronous stream error: {0}")]
    StreamError(String),
}

impl ProxyError {
    /// True once the socket backing this error must not be reused.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProxyError::Transport { .. })
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
