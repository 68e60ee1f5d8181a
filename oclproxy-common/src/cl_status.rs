// Standard OpenCL status codes the proxy-protocol engine forwards or
// raises itself (spec.md §4.8 "an absent or wrong-class handle yields an
// invalid-object status"; §7 error kind 5 "Validator miss"). These are the
// real `cl_int` values from the OpenCL 1.2 spec (CL/cl.h), reproduced here
// so both `oclproxy-client` and `oclproxy-server` agree on one set of
// constants instead of each hardcoding magic numbers.
pub const SUCCESS: i32 = 0;
pub const OUT_OF_HOST_MEMORY: i32 = -6;
pub const PROFILING_INFO_NOT_AVAILABLE: i32 = -7;
pub const INVALID_VALUE: i32 = -30;
pub const INVALID_PLATFORM: i32 = -32;
pub const INVALID_DEVICE: i32 = -33;
pub const INVALID_CONTEXT: i32 = -34;
pub const INVALID_COMMAND_QUEUE: i32 = -36;
pub const INVALID_MEM_OBJECT: i32 = -38;
pub const INVALID_PROGRAM: i32 = -44;
pub const INVALID_KERNEL: i32 = -48;
pub const INVALID_ARG_INDEX: i32 = -49;
pub const INVALID_EVENT: i32 = -58;
pub const INVALID_OPERATION: i32 = -59;
pub const KERNEL_ARG_INFO_NOT_AVAILABLE: i32 = -19;

/// Maps a [`crate::error::ProxyError`] to the single status code the
/// host-facing edge returns (spec.md §7: "all RPC functions are total and
/// return a single status code to the host").
pub fn from_proxy_error(err: &crate::error::ProxyError) -> i32 {
    use crate::error::ProxyError::*;
    match err {
        Transport { .. } => -5, // CL_OUT_OF_RESOURCES
        Protocol(_) => INVALID_OPERATION,
        OutOfHostMemory(_) => OUT_OF_HOST_MEMORY,
        RemoteApi(code) => *code,
        InvalidObject(_) => INVALID_VALUE,
        StreamError(_) => -5, // CL_OUT_OF_RESOURCES
    }
}
