// The `LocalDevice` collaborator boundary (SPEC_FULL.md §4.8 supplement;
// spec.md §1's "the server's interaction with the real local compute
// driver is treated as a black-box collaborator"). Production builds
// would wire this trait to the real OpenCL ICD via FFI declarations
// matching `original_source/include/ocland/server/ocland_cl.h`'s
// signatures; that binding itself is out of scope here. `FakeDevice`
// is the in-memory stand-in the dispatcher's own test suite drives.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use oclproxy_common::cl_status;

/// Per-argument metadata `clGetKernelArgInfo` would report
/// (SPEC_FULL.md §3 supplement; mirrors `oclproxy_client::objects::KernelArgInfo`,
/// kept as a separate type here since the server and client caches never
/// share a process).
#[derive(Debug, Clone)]
pub struct KernelArgInfo {
    pub address_qualifier: u32,
    pub access_qualifier: u32,
    pub type_name: String,
    pub type_qualifier: u64,
    pub name: String,
}

/// The real local OpenCL driver, behind the one boundary the dispatcher
/// calls through (spec.md §4.8 supplement). Every method takes opaque
/// `u64` handles — the validator is what keeps these honest, not this
/// trait — and returns `Result<_, i32>`, the real API's own `cl_int`
/// error convention, which the dispatcher forwards verbatim (spec.md §7
/// error kind 4, "Remote API error").
pub trait LocalDevice: Send + Sync {
    fn platform_ids(&self) -> Vec<u64>;
    fn platform_info(&self, platform: u64, param_name: u32) -> Result<Vec<u8>, i32>;
    fn device_ids(&self, platform: u64, device_type: u64) -> Result<Vec<u64>, i32>;
    fn device_info(&self, device: u64, param_name: u32) -> Result<Vec<u8>, i32>;

    fn create_context(&self, devices: &[u64], properties: &[u64]) -> Result<u64, i32>;
    fn release_context(&self, context: u64) -> Result<(), i32>;

    fn create_command_queue(&self, context: u64, device: u64, properties: u64) -> Result<u64, i32>;
    fn retain_command_queue(&self, queue: u64) -> Result<(), i32>;
    fn release_command_queue(&self, queue: u64) -> Result<(), i32>;
    fn flush(&self, queue: u64) -> Result<(), i32>;
    fn finish(&self, queue: u64) -> Result<(), i32>;

    fn create_buffer(&self, context: u64, flags: u64, size: usize) -> Result<u64, i32>;
    fn retain_mem_object(&self, mem: u64) -> Result<(), i32>;
    fn release_mem_object(&self, mem: u64) -> Result<(), i32>;
    fn enqueue_write_buffer(&self, queue: u64, buffer: u64, offset: usize, data: &[u8]) -> Result<(), i32>;
    fn enqueue_read_buffer(&self, queue: u64, buffer: u64, offset: usize, len: usize) -> Result<Vec<u8>, i32>;

    fn create_user_event(&self, context: u64) -> Result<u64, i32>;
    fn set_user_event_status(&self, event: u64, status: i32) -> Result<(), i32>;

    fn create_program_with_source(&self, context: u64, source: &str) -> Result<u64, i32>;
    fn retain_program(&self, program: u64) -> Result<(), i32>;
    fn release_program(&self, program: u64) -> Result<(), i32>;
    /// Returns one binary blob per requested device, in the same order.
    fn build_program(&self, program: u64, devices: &[u64], options: &str) -> Result<Vec<Vec<u8>>, i32>;

    /// Returns `(kernel handle, argument count)`.
    fn create_kernel(&self, program: u64, name: &str) -> Result<(u64, u32), i32>;
    fn retain_kernel(&self, kernel: u64) -> Result<(), i32>;
    fn release_kernel(&self, kernel: u64) -> Result<(), i32>;
    fn set_kernel_arg(&self, kernel: u64, index: u32, size: usize, value: Option<&[u8]>) -> Result<(), i32>;
    fn kernel_arg_info(&self, kernel: u64, index: u32) -> Result<KernelArgInfo, i32>;
}

/// An in-memory `LocalDevice` used by `oclproxy-server`'s own test suite
/// and by `tests/` integration tests driving S1-S6 against a real
/// `TcpListener` — never against real hardware.
pub struct FakeDevice {
    next: AtomicU64,
    buffers: Mutex<HashMap<u64, Vec<u8>>>,
    kernel_args: Mutex<HashMap<u64, usize>>,
}

impl Default for FakeDevice {
    fn default() -> Self {
        FakeDevice {
            next: AtomicU64::new(1),
            buffers: Mutex::new(HashMap::new()),
            kernel_args: Mutex::new(HashMap::new()),
        }
    }
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

const FAKE_PLATFORM: u64 = 0xF1A7;
const FAKE_DEVICE: u64 = 0xDE71CE;

impl LocalDevice for FakeDevice {
    fn platform_ids(&self) -> Vec<u64> {
        vec![FAKE_PLATFORM]
    }

    fn platform_info(&self, platform: u64, _param_name: u32) -> Result<Vec<u8>, i32> {
        if platform != FAKE_PLATFORM {
            return Err(cl_status::INVALID_PLATFORM);
        }
        Ok(b"FakeDevice OpenCL Platform\0".to_vec())
    }

    fn device_ids(&self, platform: u64, _device_type: u64) -> Result<Vec<u64>, i32> {
        if platform != FAKE_PLATFORM {
            return Err(cl_status::INVALID_PLATFORM);
        }
        Ok(vec![FAKE_DEVICE])
    }

    fn device_info(&self, device: u64, _param_name: u32) -> Result<Vec<u8>, i32> {
        if device != FAKE_DEVICE {
            return Err(cl_status::INVALID_DEVICE);
        }
        Ok(b"FakeDevice\0".to_vec())
    }

    fn create_context(&self, devices: &[u64], _properties: &[u64]) -> Result<u64, i32> {
        if devices.iter().any(|d| *d != FAKE_DEVICE) {
            return Err(cl_status::INVALID_DEVICE);
        }
        Ok(self.alloc())
    }

    fn release_context(&self, _context: u64) -> Result<(), i32> {
        Ok(())
    }

    fn create_command_queue(&self, _context: u64, device: u64, _properties: u64) -> Result<u64, i32> {
        if device != FAKE_DEVICE {
            return Err(cl_status::INVALID_DEVICE);
        }
        Ok(self.alloc())
    }

    fn retain_command_queue(&self, _queue: u64) -> Result<(), i32> {
        Ok(())
    }

    fn release_command_queue(&self, _queue: u64) -> Result<(), i32> {
        Ok(())
    }

    fn flush(&self, _queue: u64) -> Result<(), i32> {
        Ok(())
    }

    fn finish(&self, _queue: u64) -> Result<(), i32> {
        Ok(())
    }

    fn create_buffer(&self, _context: u64, _flags: u64, size: usize) -> Result<u64, i32> {
        let handle = self.alloc();
        self.buffers.lock().unwrap().insert(handle, vec![0u8; size]);
        Ok(handle)
    }

    fn retain_mem_object(&self, _mem: u64) -> Result<(), i32> {
        Ok(())
    }

    fn release_mem_object(&self, mem: u64) -> Result<(), i32> {
        self.buffers.lock().unwrap().remove(&mem);
        Ok(())
    }

    fn enqueue_write_buffer(&self, _queue: u64, buffer: u64, offset: usize, data: &[u8]) -> Result<(), i32> {
        let mut buffers = self.buffers.lock().unwrap();
        let buf = buffers.get_mut(&buffer).ok_or(cl_status::INVALID_MEM_OBJECT)?;
        let end = offset + data.len();
        if end > buf.len() {
            return Err(cl_status::INVALID_VALUE);
        }
        buf[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn enqueue_read_buffer(&self, _queue: u64, buffer: u64, offset: usize, len: usize) -> Result<Vec<u8>, i32> {
        let buffers = self.buffers.lock().unwrap();
        let buf = buffers.get(&buffer).ok_or(cl_status::INVALID_MEM_OBJECT)?;
        let end = offset + len;
        if end > buf.len() {
            return Err(cl_status::INVALID_VALUE);
        }
        Ok(buf[offset..end].to_vec())
    }

    fn create_user_event(&self, _context: u64) -> Result<u64, i32> {
        Ok(self.alloc())
    }

    fn set_user_event_status(&self, _event: u64, _status: i32) -> Result<(), i32> {
        Ok(())
    }

    fn create_program_with_source(&self, _context: u64, _source: &str) -> Result<u64, i32> {
        Ok(self.alloc())
    }

    fn retain_program(&self, _program: u64) -> Result<(), i32> {
        Ok(())
    }

    fn release_program(&self, _program: u64) -> Result<(), i32> {
        Ok(())
    }

    fn build_program(&self, _program: u64, devices: &[u64], _options: &str) -> Result<Vec<Vec<u8>>, i32> {
        Ok(devices.iter().map(|_| b"FAKEBIN".to_vec()).collect())
    }

    fn create_kernel(&self, _program: u64, name: &str) -> Result<(u64, u32), i32> {
        let handle = self.alloc();
        let num_args = if name == "vector_add" { 3 } else { 1 };
        self.kernel_args.lock().unwrap().insert(handle, num_args);
        Ok((handle, num_args as u32))
    }

    fn retain_kernel(&self, _kernel: u64) -> Result<(), i32> {
        Ok(())
    }

    fn release_kernel(&self, kernel: u64) -> Result<(), i32> {
        self.kernel_args.lock().unwrap().remove(&kernel);
        Ok(())
    }

    fn set_kernel_arg(&self, kernel: u64, index: u32, _size: usize, _value: Option<&[u8]>) -> Result<(), i32> {
        let args = self.kernel_args.lock().unwrap();
        let num_args = *args.get(&kernel).ok_or(cl_status::INVALID_KERNEL)?;
        if index as usize >= num_args {
            return Err(cl_status::INVALID_ARG_INDEX);
        }
        Ok(())
    }

    fn kernel_arg_info(&self, _kernel: u64, _index: u32) -> Result<KernelArgInfo, i32> {
        // FakeDevice never built with `-cl-kernel-arg-info`, matching
        // real drivers that omit the metadata unless asked; the
        // dedicated status lets the client cache "don't bother asking
        // again" (spec.md §4.9).
        Err(cl_status::KERNEL_ARG_INFO_NOT_AVAILABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dev = FakeDevice::new();
        let ctx = dev.create_context(&[FAKE_DEVICE], &[]).unwrap();
        let queue = dev.create_command_queue(ctx, FAKE_DEVICE, 0).unwrap();
        let buf = dev.create_buffer(ctx, 0, 1024).unwrap();
        let pattern = vec![0xA5u8; 1024];
        dev.enqueue_write_buffer(queue, buf, 0, &pattern).unwrap();
        let got = dev.enqueue_read_buffer(queue, buf, 0, 1024).unwrap();
        assert_eq!(got, pattern);
    }

    #[test]
    fn kernel_arg_info_is_not_available() {
        let dev = FakeDevice::new();
        let program = dev.create_program_with_source(1, "kernel void k(){}").unwrap();
        let (kernel, num_args) = dev.create_kernel(program, "k").unwrap();
        assert_eq!(num_args, 1);
        assert_eq!(
            dev.kernel_arg_info(kernel, 0).unwrap_err(),
            cl_status::KERNEL_ARG_INFO_NOT_AVAILABLE
        );
    }

    #[test]
    fn out_of_bounds_read_is_invalid_value() {
        let dev = FakeDevice::new();
        let ctx = dev.create_context(&[FAKE_DEVICE], &[]).unwrap();
        let queue = dev.create_command_queue(ctx, FAKE_DEVICE, 0).unwrap();
        let buf = dev.create_buffer(ctx, 0, 16).unwrap();
        assert_eq!(
            dev.enqueue_read_buffer(queue, buf, 10, 10).unwrap_err(),
            cl_status::INVALID_VALUE
        );
    }
}
