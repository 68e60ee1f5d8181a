// Command Dispatcher (spec.md §4.8, §6; original_source/include/ocland/server/dispatcher.h,
// src/server/dispatcher.c).
//
// One `ClientSession` per accepted client pair, run on its own thread
// (spec.md §4.8: "strictly single-threaded per connection"). Every
// request is one `Socket::turn` on the command channel: the whole
// argument block is read and the whole reply is written under one lock,
// matching how `oclproxy-client`'s `rpc.rs` builds each call. Bulk
// transfers that cross the callbacks channel (`EnqueueReadBuffer`/
// `EnqueueWriteBuffer` with `blocking=false`) are the one place a second
// thread exists per session — a receiver polling for upload frames the
// way `oclproxy_client::download_stream` polls for download frames.
use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use oclproxy_common::{
    cl_status, Availability, Command, Compressor, HandleWrapper, ObjectClass, ProxyResult, Socket,
    TasksList,
};

use crate::context::ExtendedContext;
use crate::event::ExtendedEvent;
use crate::local_device::LocalDevice;
use crate::validator::Validator;

const UPLOAD_POLL_SLEEP: Duration = Duration::from_micros(10);

/// Per-connection state: the validator, the real handles this client has
/// been granted, and the two sockets paired at accept time (spec.md §6).
pub struct ClientSession {
    command: Socket,
    callbacks: Arc<Socket>,
    device: Arc<dyn LocalDevice>,
    compressor: Arc<dyn Compressor>,
    validator: Validator,
    label: String,
    contexts: Mutex<HashMap<u64, Arc<ExtendedContext>>>,
    events: Mutex<HashMap<u64, Arc<ExtendedEvent>>>,
    pending_uploads: Arc<TasksList>,
}

fn send_status(t: &mut oclproxy_common::codec::Turn<'_>, code: i32, more: bool) -> ProxyResult<()> {
    t.send_size(code as i64 as u64, more)
}

fn send_string(t: &mut oclproxy_common::codec::Turn<'_>, s: &str, more: bool) -> ProxyResult<()> {
    t.send_size(s.len() as u64, true)?;
    t.send_bytes(s.as_bytes(), more)
}

impl ClientSession {
    fn new(
        command: Socket,
        callbacks: Arc<Socket>,
        device: Arc<dyn LocalDevice>,
        compressor: Arc<dyn Compressor>,
        label: String,
    ) -> Self {
        ClientSession {
            command,
            callbacks,
            device,
            compressor,
            validator: Validator::new(),
            label,
            contexts: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            pending_uploads: Arc::new(TasksList::new()),
        }
    }

    /// Block for the next command-channel request and answer it. `Ok(false)`
    /// means the peer closed cleanly (spec.md §4.1's `RemoteClosed`); `Err`
    /// is any other transport failure, both of which end the session.
    fn serve_one(&self) -> ProxyResult<bool> {
        let label = &self.label;
        let result = self.command.turn(|t| -> ProxyResult<bool> {
            let mut code_bytes = [0u8; 4];
            t.recv_bytes(&mut code_bytes)?;
            let code = u32::from_le_bytes(code_bytes);
            let Some(command) = Command::from_wire(code) else {
                tracing::warn!(client = %label, code, "unknown command code, closing session");
                return Ok(false);
            };
            self.dispatch(command, t)?;
            Ok(true)
        });
        result
    }

    fn dispatch(&self, command: Command, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        use Command::*;
        match command {
            GetPlatformIDs => self.get_platform_ids(t),
            GetPlatformInfo => self.get_platform_info(t),
            GetDeviceIDs => self.get_device_ids(t),
            GetDeviceInfo => self.get_device_info(t),
            CreateContext => self.create_context(t),
            ReleaseContext => self.release_context(t),
            CreateCommandQueue => self.create_command_queue(t),
            RetainCommandQueue => self.retain_release_queue(t, true),
            ReleaseCommandQueue => self.retain_release_queue(t, false),
            CreateBuffer => self.create_buffer(t),
            RetainMemObject => self.retain_release_memory(t, true),
            ReleaseMemObject => self.retain_release_memory(t, false),
            EnqueueWriteBuffer => self.enqueue_write_buffer(t),
            EnqueueReadBuffer => self.enqueue_read_buffer(t),
            CreateUserEvent => self.create_user_event(t),
            SetUserEventStatus => self.set_user_event_status(t),
            CreateProgramWithSource => self.create_program_with_source(t),
            RetainProgram => self.retain_release_program(t, true),
            ReleaseProgram => self.retain_release_program(t, false),
            BuildProgram => self.build_program(t),
            CreateKernel => self.create_kernel(t),
            RetainKernel => self.retain_release_kernel(t, true),
            ReleaseKernel => self.retain_release_kernel(t, false),
            SetKernelArg => self.set_kernel_arg(t),
            GetKernelArgInfo => self.get_kernel_arg_info(t),
            Flush => self.flush(t),
            Finish => self.finish(t),
            // The remaining commands (spec.md's full 75-entry surface) have
            // no handler in this representative subset; see DESIGN.md.
            // They are rejected without attempting to parse further
            // argument bytes, so any client that issues one desyncs the
            // stream — acceptable only because no code path in
            // oclproxy-client's rpc.rs emits them.
            other => {
                tracing::warn!(client = %self.label, ?other, "unimplemented command");
                send_status(t, cl_status::INVALID_OPERATION, false)
            }
        }
    }

    fn get_platform_ids(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let num_entries = t.recv_size()? as usize;
        let ids = self.device.platform_ids();
        let take = if num_entries == 0 { ids.len() } else { num_entries.min(ids.len()) };
        send_status(t, cl_status::SUCCESS, true)?;
        t.send_size(ids.len() as u64, take > 0)?;
        for (i, id) in ids.iter().take(take).enumerate() {
            let last = i + 1 == take;
            t.send_handle_wrapper(HandleWrapper::from_opaque(*id, ObjectClass::Platform), !last)?;
        }
        Ok(())
    }

    fn get_platform_info(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let platform = t.recv_handle_wrapper(Some(ObjectClass::Platform))?;
        let param_name = t.recv_size()? as u32;
        let _requested_len = t.recv_size()?;
        match self.device.platform_info(platform.as_u64(), param_name) {
            Ok(raw) => {
                send_status(t, cl_status::SUCCESS, true)?;
                t.send_size(raw.len() as u64, !raw.is_empty())?;
                if !raw.is_empty() {
                    t.send_bytes(&raw, false)?;
                }
                Ok(())
            }
            Err(code) => send_status(t, code, false),
        }
    }

    fn get_device_ids(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let platform = t.recv_handle_wrapper(Some(ObjectClass::Platform))?;
        let device_type = t.recv_size()?;
        let num_entries = t.recv_size()? as usize;
        match self.device.device_ids(platform.as_u64(), device_type) {
            Ok(ids) => {
                let take = if num_entries == 0 { ids.len() } else { num_entries.min(ids.len()) };
                send_status(t, cl_status::SUCCESS, true)?;
                t.send_size(ids.len() as u64, take > 0)?;
                for (i, id) in ids.iter().take(take).enumerate() {
                    let last = i + 1 == take;
                    t.send_handle_wrapper(HandleWrapper::from_opaque(*id, ObjectClass::Device), !last)?;
                }
                Ok(())
            }
            Err(code) => send_status(t, code, false),
        }
    }

    /// `GetDeviceInfo` mirrors `oclproxy_client::rpc::get_info_call`'s
    /// shared shape: the client only reads back as many content bytes as
    /// `requested_len` it sent, capped by `actual_len` — a size-query call
    /// (`requested_len == 0`) consumes no content bytes at all.
    fn get_device_info(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let device = t.recv_handle_wrapper(Some(ObjectClass::Device))?;
        let param_name = t.recv_size()? as u32;
        let requested_len = t.recv_size()? as usize;
        match self.device.device_info(device.as_u64(), param_name) {
            Ok(raw) => {
                let to_copy = raw.len().min(requested_len);
                send_status(t, cl_status::SUCCESS, true)?;
                t.send_size(raw.len() as u64, to_copy > 0)?;
                if to_copy > 0 {
                    t.send_bytes(&raw[..to_copy], false)?;
                }
                Ok(())
            }
            Err(code) => send_status(t, code, false),
        }
    }

    fn create_context(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let notify_id = t.recv_handle_wrapper(Some(ObjectClass::Context))?;
        let devices = t.recv_size_array()?;
        let properties = t.recv_size_array()?;
        match self.device.create_context(&devices, &properties) {
            Ok(real) => {
                let remote = HandleWrapper::from_opaque(real, ObjectClass::Context);
                let ctx = Arc::new(ExtendedContext::new(
                    real,
                    self.label.clone(),
                    notify_id,
                    self.callbacks.clone(),
                ));
                self.contexts.lock().unwrap().insert(real, ctx);
                self.validator.register_context(remote);
                send_status(t, cl_status::SUCCESS, true)?;
                t.send_handle_wrapper(remote, false)
            }
            Err(code) => send_status(t, code, false),
        }
    }

    fn release_context(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let context = t.recv_handle_wrapper(Some(ObjectClass::Context))?;
        if !self.validator.is_context(context) {
            return send_status(t, cl_status::INVALID_CONTEXT, false);
        }
        let real = context.as_u64();
        let should_release = {
            let contexts = self.contexts.lock().unwrap();
            contexts.get(&real).map(|ctx| ctx.release() == 0).unwrap_or(true)
        };
        if should_release {
            self.contexts.lock().unwrap().remove(&real);
            self.validator.unregister_context(context);
            return match self.device.release_context(real) {
                Ok(()) => send_status(t, cl_status::SUCCESS, false),
                Err(code) => send_status(t, code, false),
            };
        }
        send_status(t, cl_status::SUCCESS, false)
    }

    fn create_command_queue(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let context = t.recv_handle_wrapper(Some(ObjectClass::Context))?;
        let device = t.recv_handle_wrapper(Some(ObjectClass::Device))?;
        let properties = t.recv_size()?;
        if !self.validator.is_context(context) {
            return send_status(t, cl_status::INVALID_CONTEXT, false);
        }
        match self
            .device
            .create_command_queue(context.as_u64(), device.as_u64(), properties)
        {
            Ok(real) => {
                let remote = HandleWrapper::from_opaque(real, ObjectClass::CommandQueue);
                self.validator.register_queue(remote);
                send_status(t, cl_status::SUCCESS, true)?;
                t.send_handle_wrapper(remote, false)
            }
            Err(code) => send_status(t, code, false),
        }
    }

    fn retain_release_queue(&self, t: &mut oclproxy_common::codec::Turn<'_>, retain: bool) -> ProxyResult<()> {
        let queue = t.recv_handle_wrapper(Some(ObjectClass::CommandQueue))?;
        if !self.validator.is_queue(queue) {
            return send_status(t, cl_status::INVALID_COMMAND_QUEUE, false);
        }
        let result = if retain {
            self.device.retain_command_queue(queue.as_u64())
        } else {
            self.validator.unregister_queue(queue);
            self.device.release_command_queue(queue.as_u64())
        };
        match result {
            Ok(()) => send_status(t, cl_status::SUCCESS, false),
            Err(code) => send_status(t, code, false),
        }
    }

    fn create_buffer(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let context = t.recv_handle_wrapper(Some(ObjectClass::Context))?;
        let flags = t.recv_size()?;
        let size = t.recv_size()? as usize;
        if !self.validator.is_context(context) {
            return send_status(t, cl_status::INVALID_CONTEXT, false);
        }
        match self.device.create_buffer(context.as_u64(), flags, size) {
            Ok(real) => {
                let remote = HandleWrapper::from_opaque(real, ObjectClass::Memory);
                self.validator.register_memory(remote);
                send_status(t, cl_status::SUCCESS, true)?;
                t.send_handle_wrapper(remote, false)
            }
            Err(code) => send_status(t, code, false),
        }
    }

    fn retain_release_memory(&self, t: &mut oclproxy_common::codec::Turn<'_>, retain: bool) -> ProxyResult<()> {
        let mem = t.recv_handle_wrapper(Some(ObjectClass::Memory))?;
        if !self.validator.is_memory(mem) {
            return send_status(t, cl_status::INVALID_MEM_OBJECT, false);
        }
        let result = if retain {
            self.device.retain_mem_object(mem.as_u64())
        } else {
            self.validator.unregister_memory(mem);
            self.device.release_mem_object(mem.as_u64())
        };
        match result {
            Ok(()) => send_status(t, cl_status::SUCCESS, false),
            Err(code) => send_status(t, code, false),
        }
    }

    fn enqueue_write_buffer(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let queue = t.recv_handle_wrapper(Some(ObjectClass::CommandQueue))?;
        let buffer = t.recv_handle_wrapper(Some(ObjectClass::Memory))?;
        let blocking = t.recv_size()? != 0;
        if !self.validator.is_queue(queue) || !self.validator.is_memory(buffer) {
            if blocking {
                let _offset = t.recv_size()?;
                let len = t.recv_size()? as usize;
                let mut scratch = vec![0u8; len];
                if len > 0 {
                    t.recv_bytes(&mut scratch)?;
                }
            } else {
                let _ = t.recv_handle_wrapper(None)?;
            }
            return send_status(t, cl_status::INVALID_MEM_OBJECT, false);
        }
        if blocking {
            let offset = t.recv_size()? as usize;
            let len = t.recv_size()? as usize;
            let mut data = vec![0u8; len];
            if len > 0 {
                t.recv_bytes(&mut data)?;
            }
            let result = self
                .device
                .enqueue_write_buffer(queue.as_u64(), buffer.as_u64(), offset, &data);
            return match result {
                Ok(()) => send_status(t, cl_status::SUCCESS, false),
                Err(code) => send_status(t, code, false),
            };
        }

        // Non-blocking: the command channel only carries an
        // acknowledgement; the bytes follow later on the callbacks
        // channel, matching `oclproxy_client::upload_stream`'s frame
        // shape (spec.md §4.6). `rpc.rs`'s async write path sends no
        // offset/length on this channel, so the pending task always
        // writes at offset zero with the frame's own (decompressed)
        // length — a known simplification of the representative subset,
        // noted in DESIGN.md.
        let identifier = t.recv_handle_wrapper(None)?;
        let device = self.device.clone();
        let queue_real = queue.as_u64();
        let buffer_real = buffer.as_u64();
        let compressor = self.compressor.clone();
        self.pending_uploads.register(
            identifier,
            false,
            Box::new(move |payload: &[u8]| {
                let data = compressor.unpack(payload, payload.len());
                if let Err(code) = device.enqueue_write_buffer(queue_real, buffer_real, 0, &data) {
                    tracing::warn!(code, "async write buffer failed after data arrived");
                }
            }),
        );
        send_status(t, cl_status::SUCCESS, false)
    }

    fn enqueue_read_buffer(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let queue = t.recv_handle_wrapper(Some(ObjectClass::CommandQueue))?;
        let buffer = t.recv_handle_wrapper(Some(ObjectClass::Memory))?;
        let blocking = t.recv_size()? != 0;
        let offset = t.recv_size()? as usize;
        let len = t.recv_size()? as usize;

        if !self.validator.is_queue(queue) || !self.validator.is_memory(buffer) {
            if blocking {
                // no further fields to drain; dst length is implicit below
            } else {
                let _identifier = t.recv_handle_wrapper(None)?;
            }
            return send_status(t, cl_status::INVALID_MEM_OBJECT, false);
        }

        if blocking {
            return match self.device.enqueue_read_buffer(queue.as_u64(), buffer.as_u64(), offset, len) {
                Ok(data) => {
                    send_status(t, cl_status::SUCCESS, true)?;
                    t.send_bytes(&data, false)
                }
                Err(code) => send_status(t, code, false),
            };
        }

        let identifier = t.recv_handle_wrapper(None)?;
        send_status(t, cl_status::SUCCESS, false)?;
        // The actual transfer happens right after acknowledging, still on
        // this session's single thread (spec.md §4.8) — `FakeDevice` reads
        // are immediate, so there is no benefit to a dedicated worker here,
        // unlike the upload direction which must wait on data the client
        // hasn't sent yet.
        match self.device.enqueue_read_buffer(queue.as_u64(), buffer.as_u64(), offset, len) {
            Ok(data) => {
                let packed = self.compressor.pack(&data);
                self.callbacks.turn(|ct| {
                    ct.send_handle_wrapper(identifier, true)?;
                    ct.send_size(packed.len() as u64, true)?;
                    ct.send_bytes(&packed, false)
                })
            }
            Err(code) => {
                tracing::warn!(code, "async read buffer failed");
                Ok(())
            }
        }
    }

    fn create_user_event(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let context = t.recv_handle_wrapper(Some(ObjectClass::Context))?;
        let identifier = t.recv_handle_wrapper(Some(ObjectClass::Event))?;
        // One-way call: `oclproxy_client::rpc::create_user_event` never
        // reads a reply, so failures here have nowhere to go but the log.
        if !self.validator.is_context(context) {
            tracing::warn!(client = %self.label, "CreateUserEvent against unknown context");
            return Ok(());
        }
        match self.device.create_user_event(context.as_u64()) {
            Ok(real) => {
                self.validator.register_event(identifier);
                self.events.lock().unwrap().insert(
                    identifier.as_u64(),
                    Arc::new(ExtendedEvent::new(real, context.as_u64(), None, 0)),
                );
            }
            Err(code) => tracing::warn!(code, "CreateUserEvent failed on the real device"),
        }
        Ok(())
    }

    fn set_user_event_status(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let event = t.recv_handle_wrapper(Some(ObjectClass::Event))?;
        let new_status = t.recv_size()? as i32;
        // One-way call, same as `CreateUserEvent`.
        let Some(ext) = self.events.lock().unwrap().get(&event.as_u64()).cloned() else {
            tracing::warn!(client = %self.label, "SetUserEventStatus against unknown event");
            return Ok(());
        };
        if let Err(e) = ext.set_server_status(new_status) {
            tracing::warn!(error = e, "invalid user event status transition");
        }
        if let Err(code) = self.device.set_user_event_status(ext.real(), new_status) {
            tracing::warn!(code, "SetUserEventStatus failed on the real device");
        }
        Ok(())
    }

    fn create_program_with_source(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let context = t.recv_handle_wrapper(Some(ObjectClass::Context))?;
        let len = t.recv_size()? as usize;
        let mut bytes = vec![0u8; len];
        if len > 0 {
            t.recv_bytes(&mut bytes)?;
        }
        if !self.validator.is_context(context) {
            return send_status(t, cl_status::INVALID_CONTEXT, false);
        }
        let source = String::from_utf8_lossy(&bytes);
        match self.device.create_program_with_source(context.as_u64(), &source) {
            Ok(real) => {
                let remote = HandleWrapper::from_opaque(real, ObjectClass::Program);
                self.validator.register_program(remote);
                send_status(t, cl_status::SUCCESS, true)?;
                t.send_handle_wrapper(remote, false)
            }
            Err(code) => send_status(t, code, false),
        }
    }

    fn retain_release_program(&self, t: &mut oclproxy_common::codec::Turn<'_>, retain: bool) -> ProxyResult<()> {
        let program = t.recv_handle_wrapper(Some(ObjectClass::Program))?;
        if !self.validator.is_program(program) {
            return send_status(t, cl_status::INVALID_PROGRAM, false);
        }
        let result = if retain {
            self.device.retain_program(program.as_u64())
        } else {
            self.validator.unregister_program(program);
            self.device.release_program(program.as_u64())
        };
        match result {
            Ok(()) => send_status(t, cl_status::SUCCESS, false),
            Err(code) => send_status(t, code, false),
        }
    }

    fn build_program(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let program = t.recv_handle_wrapper(Some(ObjectClass::Program))?;
        let devices = t.recv_size_array()?;
        let options_len = t.recv_size()? as usize;
        let mut options_bytes = vec![0u8; options_len];
        if options_len > 0 {
            t.recv_bytes(&mut options_bytes)?;
        }
        if !self.validator.is_program(program) {
            return send_status(t, cl_status::INVALID_PROGRAM, false);
        }
        let options = String::from_utf8_lossy(&options_bytes);
        match self.device.build_program(program.as_u64(), &devices, &options) {
            Ok(binaries) => {
                send_status(t, cl_status::SUCCESS, !binaries.is_empty())?;
                for (i, binary) in binaries.iter().enumerate() {
                    let last = i + 1 == binaries.len();
                    t.send_size(binary.len() as u64, true)?;
                    t.send_bytes(binary, !last)?;
                }
                Ok(())
            }
            Err(code) => send_status(t, code, false),
        }
    }

    fn create_kernel(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let program = t.recv_handle_wrapper(Some(ObjectClass::Program))?;
        let name_len = t.recv_size()? as usize;
        let mut name_bytes = vec![0u8; name_len];
        if name_len > 0 {
            t.recv_bytes(&mut name_bytes)?;
        }
        if !self.validator.is_program(program) {
            return send_status(t, cl_status::INVALID_PROGRAM, false);
        }
        let name = String::from_utf8_lossy(&name_bytes);
        match self.device.create_kernel(program.as_u64(), &name) {
            Ok((real, _num_args)) => {
                let remote = HandleWrapper::from_opaque(real, ObjectClass::Kernel);
                self.validator.register_kernel(remote);
                send_status(t, cl_status::SUCCESS, true)?;
                t.send_handle_wrapper(remote, false)
            }
            Err(code) => send_status(t, code, false),
        }
    }

    fn retain_release_kernel(&self, t: &mut oclproxy_common::codec::Turn<'_>, retain: bool) -> ProxyResult<()> {
        let kernel = t.recv_handle_wrapper(Some(ObjectClass::Kernel))?;
        if !self.validator.is_kernel(kernel) {
            return send_status(t, cl_status::INVALID_KERNEL, false);
        }
        let result = if retain {
            self.device.retain_kernel(kernel.as_u64())
        } else {
            self.validator.unregister_kernel(kernel);
            self.device.release_kernel(kernel.as_u64())
        };
        match result {
            Ok(()) => send_status(t, cl_status::SUCCESS, false),
            Err(code) => send_status(t, code, false),
        }
    }

    fn set_kernel_arg(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let kernel = t.recv_handle_wrapper(Some(ObjectClass::Kernel))?;
        let arg_index = t.recv_size()? as u32;
        let arg_size = t.recv_size()? as usize;
        let has_value = t.recv_size()? != 0;
        let value = if has_value {
            let mut buf = vec![0u8; arg_size];
            if arg_size > 0 {
                t.recv_bytes(&mut buf)?;
            }
            Some(buf)
        } else {
            None
        };
        if !self.validator.is_kernel(kernel) {
            return send_status(t, cl_status::INVALID_KERNEL, false);
        }
        let result = self
            .device
            .set_kernel_arg(kernel.as_u64(), arg_index, arg_size, value.as_deref());
        match result {
            Ok(()) => send_status(t, cl_status::SUCCESS, false),
            Err(code) => send_status(t, code, false),
        }
    }

    fn get_kernel_arg_info(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let kernel = t.recv_handle_wrapper(Some(ObjectClass::Kernel))?;
        let arg_index = t.recv_size()? as u32;
        if !self.validator.is_kernel(kernel) {
            return send_status(t, cl_status::INVALID_KERNEL, false);
        }
        match self.device.kernel_arg_info(kernel.as_u64(), arg_index) {
            Ok(info) => {
                send_status(t, cl_status::SUCCESS, true)?;
                t.send_size(info.address_qualifier as u64, true)?;
                t.send_size(info.access_qualifier as u64, true)?;
                send_string(t, &info.type_name, true)?;
                t.send_size(info.type_qualifier, true)?;
                send_string(t, &info.name, false)
            }
            Err(code) => send_status(t, code, false),
        }
    }

    fn flush(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let queue = t.recv_handle_wrapper(Some(ObjectClass::CommandQueue))?;
        if !self.validator.is_queue(queue) {
            return send_status(t, cl_status::INVALID_COMMAND_QUEUE, false);
        }
        match self.device.flush(queue.as_u64()) {
            Ok(()) => send_status(t, cl_status::SUCCESS, false),
            Err(code) => send_status(t, code, false),
        }
    }

    fn finish(&self, t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<()> {
        let queue = t.recv_handle_wrapper(Some(ObjectClass::CommandQueue))?;
        if !self.validator.is_queue(queue) {
            return send_status(t, cl_status::INVALID_COMMAND_QUEUE, false);
        }
        match self.device.finish(queue.as_u64()) {
            Ok(()) => send_status(t, cl_status::SUCCESS, false),
            Err(code) => send_status(t, code, false),
        }
    }
}

/// Poll the callbacks socket for upload frames and dispatch them to
/// pending tasks registered by `enqueue_write_buffer` (mirrors
/// `oclproxy_client::download_stream::reader_loop`, from the other end of
/// the same wire shape).
fn upload_receiver_loop(socket: Arc<Socket>, pending: Arc<TasksList>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match socket.check_data_available() {
            Availability::NotYet => {
                std::thread::sleep(UPLOAD_POLL_SLEEP);
                continue;
            }
            Availability::RemoteClosed | Availability::Error => return,
            Availability::Ready => {}
        }
        let frame = socket.turn(|t| -> ProxyResult<(HandleWrapper, Vec<u8>)> {
            let identifier = t.recv_handle_wrapper(None)?;
            let len = t.recv_size()? as usize;
            let mut payload = vec![0u8; len];
            if len > 0 {
                t.recv_bytes(&mut payload)?;
            }
            Ok((identifier, payload))
        });
        let Ok((identifier, payload)) = frame else { return };
        if let Some(task_id) = pending.dispatch(identifier, &payload) {
            pending.unregister(task_id);
        }
    }
}

/// Run a client's command/callbacks pair until it disconnects. Spawns the
/// one extra thread this session needs (the upload-frame receiver) and
/// joins it on the way out.
pub fn run_client_session(
    command_stream: TcpStream,
    callbacks_stream: TcpStream,
    peer: String,
    device: Arc<dyn LocalDevice>,
    compressor: Arc<dyn Compressor>,
) -> ProxyResult<()> {
    let command = Socket::new(command_stream, format!("{peer} (command)"))?;
    let callbacks = Arc::new(Socket::new(callbacks_stream, format!("{peer} (callbacks)"))?);
    let session = ClientSession::new(command, callbacks.clone(), device, compressor, peer.clone());

    let running = Arc::new(AtomicBool::new(true));
    let pending = session.pending_uploads.clone();
    let reader_socket = callbacks.clone();
    let reader_running = running.clone();
    let reader = std::thread::Builder::new()
        .name("oclproxy-upload-recv".into())
        .spawn(move || upload_receiver_loop(reader_socket, pending, reader_running))
        .expect("spawn upload receiver thread");

    let outcome = loop {
        match session.serve_one() {
            Ok(true) => continue,
            Ok(false) => break Ok(()),
            Err(e) => {
                if e.is_transport() {
                    break Ok(());
                }
                break Err(e);
            }
        }
    };

    running.store(false, Ordering::SeqCst);
    let _ = reader.join();
    tracing::info!(client = %peer, "session ended");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_device::FakeDevice;
    use oclproxy_common::{Identity, ObjectClass};
    use std::net::{TcpListener, TcpStream};

    fn command_pair() -> (Socket, Socket) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server_stream, _) = listener.accept().unwrap();
        let client_stream = client.join().unwrap();
        (
            Socket::new(server_stream, "server".into()).unwrap(),
            Socket::new(client_stream, "client".into()).unwrap(),
        )
    }

    fn session_with(device: Arc<dyn LocalDevice>) -> (ClientSession, Socket) {
        let (command, peer) = command_pair();
        let (cb_a, _cb_b) = command_pair();
        let session = ClientSession::new(command, Arc::new(cb_a), device, Arc::new(Identity), "t".into());
        (session, peer)
    }

    #[test]
    fn get_platform_ids_returns_the_fake_platform() {
        let (session, peer) = session_with(Arc::new(FakeDevice::new()));
        let server_thread = std::thread::spawn(move || session.serve_one());

        peer.turn(|t| {
            t.send_bytes(&(Command::GetPlatformIDs as u32).to_le_bytes(), true)?;
            t.send_size(0, false)?;
            let status_code = t.recv_size()? as i32;
            assert_eq!(status_code, cl_status::SUCCESS);
            let count = t.recv_size()?;
            assert_eq!(count, 1);
            let _platform = t.recv_handle_wrapper(Some(ObjectClass::Platform))?;
            Ok(())
        })
        .unwrap();

        assert!(server_thread.join().unwrap().unwrap());
    }

    #[test]
    fn create_context_then_release_round_trips() {
        let (session, peer) = session_with(Arc::new(FakeDevice::new()));
        let session = Arc::new(session);
        let s2 = session.clone();
        let server_thread = std::thread::spawn(move || {
            s2.serve_one().unwrap();
            s2.serve_one().unwrap();
        });

        let context = peer
            .turn(|t| {
                t.send_bytes(&(Command::CreateContext as u32).to_le_bytes(), true)?;
                t.send_handle_wrapper(HandleWrapper::from_opaque(1, ObjectClass::Context), true)?;
                t.send_size_array(&[0xDE71CE], true)?;
                t.send_size_array(&[], false)?;
                let status_code = t.recv_size()? as i32;
                assert_eq!(status_code, cl_status::SUCCESS);
                t.recv_handle_wrapper(Some(ObjectClass::Context))
            })
            .unwrap();

        peer.turn(|t| {
            t.send_bytes(&(Command::ReleaseContext as u32).to_le_bytes(), true)?;
            t.send_handle_wrapper(context, false)?;
            let status_code = t.recv_size()? as i32;
            assert_eq!(status_code, cl_status::SUCCESS);
            Ok(())
        })
        .unwrap();

        server_thread.join().unwrap();
    }

    #[test]
    fn unknown_handle_is_rejected_with_invalid_status() {
        let (session, peer) = session_with(Arc::new(FakeDevice::new()));
        let server_thread = std::thread::spawn(move || session.serve_one());

        peer.turn(|t| {
            t.send_bytes(&(Command::ReleaseContext as u32).to_le_bytes(), true)?;
            t.send_handle_wrapper(HandleWrapper::from_opaque(999, ObjectClass::Context), false)?;
            let status_code = t.recv_size()? as i32;
            assert_eq!(status_code, cl_status::INVALID_CONTEXT);
            Ok(())
        })
        .unwrap();

        assert!(server_thread.join().unwrap().unwrap());
    }
}
