// RPC Surface (spec.md §4.9). A representative, faithful subset spanning
// every state machine and data-flow path spec.md §4/§8 name: platform
// query, context/queue/memory lifecycle, synchronous and asynchronous
// enqueue, user events. Calls not covered here still have a `Command`
// entry (oclproxy_common::command) and are documented as dispatcher
// stubs in DESIGN.md.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use oclproxy_common::{status, Command, HandleWrapper, ObjectClass, ProxyError, ProxyResult};

use crate::event::EventHandle;
use crate::objects::{
    CommandQueueHandle, ContextHandle, DeviceHandle, KernelArgInfo, KernelHandle, MemoryHandle,
    PlatformHandle, ProgramHandle,
};
use crate::runtime::ClientRuntime;
use crate::server::ServerRecord;
use crate::upload_stream::GatingEvent;

static NEXT_IDENTIFIER: AtomicU64 = AtomicU64::new(1);

/// A fresh client-chosen opaque identifier (spec.md §3's "client-provided
/// shared identifier used in callback frames"). Used for context-notify
/// and any other download-stream task registered ahead of the RPC that
/// will populate it — this is how `create_context` resolves §9's open
/// question about the create/register-task race: the identifier (and its
/// task registration) exist *before* the request carrying it is sent, so
/// the server can never emit a frame the client isn't yet listening for.
fn next_identifier(class: ObjectClass) -> HandleWrapper {
    HandleWrapper::from_opaque(NEXT_IDENTIFIER.fetch_add(1, Ordering::Relaxed), class)
}

fn command_socket(server: &ServerRecord) -> ProxyResult<&Arc<oclproxy_common::Socket>> {
    server.command.as_ref().ok_or_else(|| ProxyError::Transport {
        peer: server.address().to_string(),
        detail: "command socket unavailable".into(),
    })
}

/// `GetPlatformIDs`: single round trip returning every platform (spec.md
/// §8 S1 — `num_entries=0` returns the count, a second call with the
/// count fills the buffer; here the two phases are the same RPC, called
/// twice by the caller exactly as the host API does).
pub fn get_platform_ids(
    runtime: &ClientRuntime,
    server: &Arc<ServerRecord>,
    num_entries: usize,
) -> ProxyResult<Vec<Arc<PlatformHandle>>> {
    let socket = command_socket(server)?;
    let remotes = socket.turn(|t| {
        t.send_bytes(&(Command::GetPlatformIDs as u32).to_le_bytes(), true)?;
        t.send_size(num_entries as u64, false)?;
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            return Err(ProxyError::RemoteApi(status_code));
        }
        let count = t.recv_size()? as usize;
        let take = if num_entries == 0 { count } else { num_entries.min(count) };
        let mut out = Vec::with_capacity(take);
        for _ in 0..take {
            out.push(t.recv_handle_wrapper(Some(ObjectClass::Platform))?);
        }
        Ok(out)
    })?;

    let mut handles = Vec::with_capacity(remotes.len());
    for remote in remotes {
        if let Some(existing) = runtime.platforms.find_by_remote(remote) {
            handles.push(existing);
            continue;
        }
        let obj = Arc::new(PlatformHandle::new(remote, server.clone()));
        runtime.platforms.add(obj.clone());
        handles.push(obj);
    }
    Ok(handles)
}

/// `CL_PLATFORM_NAME` (OpenCL 1.2 `cl_platform_info`).
const CL_PLATFORM_NAME: u32 = 0x0902;

/// Two-phase get-info: `size=0` returns the required size; the caller
/// issues a second call with a buffer of that size (spec.md §4.9).
///
/// For `CL_PLATFORM_NAME` the host must see an `"ocland(<address>) "`
/// prefix ahead of the real platform name (spec.md §8 S1) so that a host
/// application enumerating platforms can tell which server each one came
/// from; every other `param_name` is passed through unmodified.
pub fn get_platform_info(
    server: &Arc<ServerRecord>,
    platform: HandleWrapper,
    param_name: u32,
    buffer: Option<&mut [u8]>,
) -> ProxyResult<usize> {
    let socket = command_socket(server)?;
    let prefix: Vec<u8> = if param_name == CL_PLATFORM_NAME {
        format!("ocland({}) ", server.address()).into_bytes()
    } else {
        Vec::new()
    };
    // The requested length on the wire is for the *real* name only; the
    // prefix is spliced in locally once the raw bytes come back, so the
    // server never needs to know about it.
    let requested_len = buffer
        .as_ref()
        .map(|b| b.len().saturating_sub(prefix.len()))
        .unwrap_or(0);
    socket.turn(|t| {
        t.send_bytes(&(Command::GetPlatformInfo as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(platform, true)?;
        t.send_size(param_name as u64, true)?;
        t.send_size(requested_len as u64, false)?;
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            return Err(ProxyError::RemoteApi(status_code));
        }
        let actual_len = t.recv_size()? as usize;
        let mut raw = vec![0u8; actual_len];
        if actual_len > 0 {
            t.recv_bytes(&mut raw)?;
        }
        let mut full = prefix.clone();
        full.extend_from_slice(&raw);
        if let Some(buf) = buffer {
            let to_copy = full.len().min(buf.len());
            buf[..to_copy].copy_from_slice(&full[..to_copy]);
        }
        Ok(full.len())
    })
}

/// `CreateContext`. Registers the context-notify download-stream task
/// under a freshly chosen identifier *before* sending the create request
/// (see [`next_identifier`]); on any failure the task is unregistered and
/// the stream reference released, so creation is atomic with respect to
/// stream creation (spec.md §4.9's context lifecycle note).
pub fn create_context(
    runtime: &Arc<ClientRuntime>,
    server: &Arc<ServerRecord>,
    devices: Vec<HandleWrapper>,
    properties: Vec<u64>,
    mut notify: Option<Box<dyn FnMut(&str, &[u8]) + Send>>,
) -> ProxyResult<Arc<ContextHandle>> {
    let stream = server.acquire_download_stream()?;
    let identifier = next_identifier(ObjectClass::Context);

    let task_id = stream.register(
        identifier,
        true,
        Box::new(move |payload: &[u8]| {
            if let Some(cb) = notify.as_mut() {
                // Frame layout: `[errinfo_len: u64 LE][errinfo bytes][private_info bytes]`,
                // mirroring oclproxy-server's `ExtendedContext::notify` encoder exactly.
                // private_info is whatever remains after errinfo, with no length prefix
                // of its own (the download stream already length-delimited the frame).
                if payload.len() >= 8 {
                    let errinfo_len = u64::from_le_bytes(payload[..8].try_into().unwrap()) as usize;
                    let errinfo_end = (8 + errinfo_len).min(payload.len());
                    let errinfo = String::from_utf8_lossy(&payload[8..errinfo_end]);
                    let private_info = &payload[errinfo_end..];
                    cb(&errinfo, private_info);
                }
            }
        }),
    );

    let result = (|| -> ProxyResult<HandleWrapper> {
        let socket = command_socket(server)?;
        socket.turn(|t| {
            t.send_bytes(&(Command::CreateContext as u32).to_le_bytes(), true)?;
            t.send_handle_wrapper(identifier, true)?;
            t.send_size_array(&devices.iter().map(|d| d.as_u64()).collect::<Vec<_>>(), true)?;
            t.send_size_array(&properties, false)?;
            let status_code = t.recv_size()? as i32;
            if status_code != 0 {
                return Err(ProxyError::RemoteApi(status_code));
            }
            t.recv_handle_wrapper(Some(ObjectClass::Context))
        })
    })();

    let remote = match result {
        Ok(r) => r,
        Err(e) => {
            stream.unregister(task_id);
            server.release_download_stream();
            return Err(e);
        }
    };

    let ctx = Arc::new(ContextHandle::new(remote, server.clone(), devices, properties, None));
    ctx.bind_stream_task(task_id);
    runtime.contexts.add(ctx.clone());
    Ok(ctx)
}

/// `ReleaseContext`: releases the download-stream task exactly once
/// (spec.md §4.3's context invariant) regardless of whether the server
/// round trip succeeds, then discards the local handle.
pub fn release_context(runtime: &ClientRuntime, ctx: &Arc<ContextHandle>) -> ProxyResult<()> {
    if !ctx.release() {
        return Ok(());
    }
    if let Some(task_id) = ctx.release_stream_task() {
        if let Some(stream) = ctx.server.peek_download_stream() {
            stream.unregister(task_id);
        }
        ctx.server.release_download_stream();
    }
    let socket = command_socket(&ctx.server)?;
    let result = socket.turn(|t| {
        t.send_bytes(&(Command::ReleaseContext as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(ctx.remote(), false)?;
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            Err(ProxyError::RemoteApi(status_code))
        } else {
            Ok(())
        }
    });
    let local = Arc::as_ptr(ctx) as usize;
    runtime.contexts.discard(local);
    result
}

pub fn create_command_queue(
    runtime: &ClientRuntime,
    server: &Arc<ServerRecord>,
    context: HandleWrapper,
    device: HandleWrapper,
    properties: u64,
) -> ProxyResult<Arc<CommandQueueHandle>> {
    let socket = command_socket(server)?;
    let remote = socket.turn(|t| {
        t.send_bytes(&(Command::CreateCommandQueue as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(context, true)?;
        t.send_handle_wrapper(device, true)?;
        t.send_size(properties, false)?;
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            return Err(ProxyError::RemoteApi(status_code));
        }
        t.recv_handle_wrapper(Some(ObjectClass::CommandQueue))
    })?;
    let queue = Arc::new(CommandQueueHandle::new(remote, server.clone(), context, device));
    runtime.queues.add(queue.clone());
    Ok(queue)
}

pub fn create_buffer(
    runtime: &ClientRuntime,
    server: &Arc<ServerRecord>,
    context: HandleWrapper,
    flags: u64,
    size: usize,
    host_ptr: Option<usize>,
) -> ProxyResult<Arc<MemoryHandle>> {
    let socket = command_socket(server)?;
    let remote = socket.turn(|t| {
        t.send_bytes(&(Command::CreateBuffer as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(context, true)?;
        t.send_size(flags, true)?;
        t.send_size(size as u64, false)?;
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            return Err(ProxyError::RemoteApi(status_code));
        }
        t.recv_handle_wrapper(Some(ObjectClass::Memory))
    })?;
    let mem = Arc::new(MemoryHandle::new_buffer(remote, server.clone(), size, flags, host_ptr));
    runtime.memory.add(mem.clone());
    Ok(mem)
}

/// `EnqueueWriteBuffer` with `blocking=true`: the RPC round trip itself is
/// the synchronization point, matching spec.md §8 S2.
pub fn enqueue_write_buffer_blocking(
    server: &Arc<ServerRecord>,
    queue: HandleWrapper,
    buffer: HandleWrapper,
    offset: usize,
    data: &[u8],
) -> ProxyResult<()> {
    let socket = command_socket(server)?;
    socket.turn(|t| {
        t.send_bytes(&(Command::EnqueueWriteBuffer as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(queue, true)?;
        t.send_handle_wrapper(buffer, true)?;
        t.send_size(1, true)?; // blocking = true
        t.send_size(offset as u64, true)?;
        t.send_size(data.len() as u64, true)?;
        t.send_bytes(data, false)?;
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            Err(ProxyError::RemoteApi(status_code))
        } else {
            Ok(())
        }
    })
}

/// `EnqueueReadBuffer` with `blocking=true`: server replies inline with
/// the requested bytes, no download-stream involvement (spec.md §8 S2).
pub fn enqueue_read_buffer_blocking(
    server: &Arc<ServerRecord>,
    queue: HandleWrapper,
    buffer: HandleWrapper,
    offset: usize,
    dst: &mut [u8],
) -> ProxyResult<()> {
    let socket = command_socket(server)?;
    socket.turn(|t| {
        t.send_bytes(&(Command::EnqueueReadBuffer as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(queue, true)?;
        t.send_handle_wrapper(buffer, true)?;
        t.send_size(1, true)?; // blocking = true
        t.send_size(offset as u64, true)?;
        t.send_size(dst.len() as u64, false)?;
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            return Err(ProxyError::RemoteApi(status_code));
        }
        t.recv_bytes(dst)
    })
}

/// `EnqueueReadBuffer` with `blocking=false` (spec.md §8 S3): registers a
/// non-propagating download-stream task under a fresh identifier *before*
/// sending the enqueue request, so the bulk-download-completion frame can
/// never race ahead of the registration. On completion the task unpacks
/// the payload into `dst` and transitions `event` to `complete`.
pub fn enqueue_read_buffer_async(
    runtime: &ClientRuntime,
    server: &Arc<ServerRecord>,
    queue: HandleWrapper,
    context: HandleWrapper,
    buffer: HandleWrapper,
    offset: usize,
    len: usize,
    dst: Arc<std::sync::Mutex<Vec<u8>>>,
) -> ProxyResult<Arc<EventHandle>> {
    let stream = server.acquire_download_stream()?;
    let identifier = next_identifier(ObjectClass::Event);

    let event = Arc::new(EventHandle::new(
        identifier,
        server.clone(),
        context,
        Some(queue),
        false,
    ));
    let event_for_task = event.clone();
    let task_id = stream.register(
        identifier,
        false,
        Box::new(move |payload: &[u8]| {
            *dst.lock().unwrap() = payload.to_vec();
            event_for_task.set_status(status::COMPLETE);
        }),
    );

    let socket = command_socket(server)?;
    let result = socket.turn(|t| {
        t.send_bytes(&(Command::EnqueueReadBuffer as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(queue, true)?;
        t.send_handle_wrapper(buffer, true)?;
        t.send_size(0, true)?; // blocking = false
        t.send_size(offset as u64, true)?;
        t.send_size(len as u64, true)?;
        t.send_handle_wrapper(identifier, false)?;
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            Err(ProxyError::RemoteApi(status_code))
        } else {
            Ok(())
        }
    });

    if let Err(e) = result {
        stream.unregister(task_id);
        server.release_download_stream();
        return Err(e);
    }
    event.set_status(status::SUBMITTED);
    runtime.events.add(event.clone());
    Ok(event)
}

/// `CreateUserEvent` (spec.md §4.7): allocate locally, send a one-way RPC
/// informing the server of the event's wrapper.
pub fn create_user_event(
    runtime: &ClientRuntime,
    server: &Arc<ServerRecord>,
    context: HandleWrapper,
) -> ProxyResult<Arc<EventHandle>> {
    let identifier = next_identifier(ObjectClass::Event);
    let socket = command_socket(server)?;
    socket.turn(|t| {
        t.send_bytes(&(Command::CreateUserEvent as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(context, true)?;
        t.send_handle_wrapper(identifier, false)
    })?;
    let event = Arc::new(EventHandle::new_user_event(identifier, server.clone(), context));
    runtime.events.add(event.clone());
    Ok(event)
}

/// `SetUserEventStatus`: one-way update, mirrored locally (spec.md §4.7).
pub fn set_user_event_status(event: &Arc<EventHandle>, new_status: i32) -> ProxyResult<()> {
    let socket = command_socket(&event.server)?;
    socket.turn(|t| {
        t.send_bytes(&(Command::SetUserEventStatus as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(event.remote(), true)?;
        t.send_size(new_status as u64, false)
    })?;
    event.set_status(new_status);
    Ok(())
}

/// `GetDeviceIDs`: same two-phase count/fill shape as `get_platform_ids`.
pub fn get_device_ids(
    runtime: &ClientRuntime,
    server: &Arc<ServerRecord>,
    platform: HandleWrapper,
    device_type: u64,
    num_entries: usize,
) -> ProxyResult<Vec<Arc<DeviceHandle>>> {
    let socket = command_socket(server)?;
    let remotes = socket.turn(|t| {
        t.send_bytes(&(Command::GetDeviceIDs as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(platform, true)?;
        t.send_size(device_type, true)?;
        t.send_size(num_entries as u64, false)?;
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            return Err(ProxyError::RemoteApi(status_code));
        }
        let count = t.recv_size()? as usize;
        let take = if num_entries == 0 { count } else { num_entries.min(count) };
        let mut out = Vec::with_capacity(take);
        for _ in 0..take {
            out.push(t.recv_handle_wrapper(Some(ObjectClass::Device))?);
        }
        Ok(out)
    })?;

    let mut handles = Vec::with_capacity(remotes.len());
    for remote in remotes {
        if let Some(existing) = runtime.devices.find_by_remote(remote) {
            handles.push(existing);
            continue;
        }
        // Every device returned directly by GetDeviceIDs is root-level
        // (spec.md §4.3's retain/release asymmetry); only CreateSubDevices
        // produces a non-root DeviceHandle.
        let obj = Arc::new(DeviceHandle::new(remote, server.clone(), true));
        runtime.devices.add(obj.clone());
        handles.push(obj);
    }
    Ok(handles)
}

pub fn get_device_info(
    server: &Arc<ServerRecord>,
    device: HandleWrapper,
    param_name: u32,
    buffer: Option<&mut [u8]>,
) -> ProxyResult<usize> {
    get_info_call(server, Command::GetDeviceInfo, device, param_name, buffer)
}

/// The two-phase get-info pattern (spec.md §4.9) is byte-identical across
/// every object class; this is the one implementation every
/// `get_*_info` wrapper in this module delegates to.
fn get_info_call(
    server: &Arc<ServerRecord>,
    command: Command,
    object: HandleWrapper,
    param_name: u32,
    buffer: Option<&mut [u8]>,
) -> ProxyResult<usize> {
    let socket = command_socket(server)?;
    let requested_len = buffer.as_ref().map(|b| b.len()).unwrap_or(0);
    socket.turn(|t| {
        t.send_bytes(&(command as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(object, true)?;
        t.send_size(param_name as u64, true)?;
        t.send_size(requested_len as u64, false)?;
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            return Err(ProxyError::RemoteApi(status_code));
        }
        let actual_len = t.recv_size()? as usize;
        if let Some(buf) = buffer {
            let to_copy = actual_len.min(buf.len());
            if to_copy > 0 {
                let mut scratch = vec![0u8; to_copy];
                t.recv_bytes(&mut scratch)?;
                buf[..to_copy].copy_from_slice(&scratch);
            }
        }
        Ok(actual_len)
    })
}

/// A release RPC shared by every class whose wire shape is "command code
/// + one handle, status-only reply" (spec.md §4.3's release step (b)).
fn release_call(server: &Arc<ServerRecord>, command: Command, remote: HandleWrapper) -> ProxyResult<()> {
    let socket = command_socket(server)?;
    socket.turn(|t| {
        t.send_bytes(&(command as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(remote, false)?;
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            Err(ProxyError::RemoteApi(status_code))
        } else {
            Ok(())
        }
    })
}

fn retain_call(server: &Arc<ServerRecord>, command: Command, remote: HandleWrapper) -> ProxyResult<()> {
    release_call(server, command, remote)
}

pub fn retain_command_queue(queue: &Arc<CommandQueueHandle>) -> ProxyResult<()> {
    queue.retain();
    retain_call(&queue.server, Command::RetainCommandQueue, queue.remote())
}

pub fn release_command_queue(runtime: &ClientRuntime, queue: &Arc<CommandQueueHandle>) -> ProxyResult<()> {
    if !queue.release() {
        return Ok(());
    }
    let result = release_call(&queue.server, Command::ReleaseCommandQueue, queue.remote());
    runtime.queues.discard(Arc::as_ptr(queue) as usize);
    result
}

pub fn retain_mem_object(mem: &Arc<MemoryHandle>) -> ProxyResult<()> {
    mem.retain();
    retain_call(&mem.server, Command::RetainMemObject, mem.remote())
}

/// `ReleaseMemObject`: runs the destructor-callback list (spec.md §4.3
/// step (a)) before telling the server, matching
/// `clSetMemObjectDestructorCallback`'s documented ordering.
pub fn release_mem_object(runtime: &ClientRuntime, mem: &Arc<MemoryHandle>) -> ProxyResult<()> {
    if !mem.release() {
        return Ok(());
    }
    mem.run_destructors();
    let result = release_call(&mem.server, Command::ReleaseMemObject, mem.remote());
    runtime.memory.discard(Arc::as_ptr(mem) as usize);
    result
}

pub fn retain_program(program: &Arc<ProgramHandle>) -> ProxyResult<()> {
    program.retain();
    retain_call(&program.server, Command::RetainProgram, program.remote())
}

pub fn release_program(runtime: &ClientRuntime, program: &Arc<ProgramHandle>) -> ProxyResult<()> {
    if !program.release() {
        return Ok(());
    }
    let result = release_call(&program.server, Command::ReleaseProgram, program.remote());
    runtime.programs.discard(Arc::as_ptr(program) as usize);
    result
}

pub fn retain_kernel(kernel: &Arc<KernelHandle>) -> ProxyResult<()> {
    kernel.retain();
    retain_call(&kernel.server, Command::RetainKernel, kernel.remote())
}

pub fn release_kernel(runtime: &ClientRuntime, kernel: &Arc<KernelHandle>) -> ProxyResult<()> {
    if !kernel.release() {
        return Ok(());
    }
    let result = release_call(&kernel.server, Command::ReleaseKernel, kernel.remote());
    runtime.kernels.discard(Arc::as_ptr(kernel) as usize);
    result
}

/// `CreateProgramWithSource`: the source text is cached client-side
/// immediately (spec.md §4.9: "cached ... on every build/compile/link so
/// later getters answer locally").
pub fn create_program_with_source(
    runtime: &ClientRuntime,
    server: &Arc<ServerRecord>,
    context: HandleWrapper,
    source: String,
) -> ProxyResult<Arc<ProgramHandle>> {
    let socket = command_socket(server)?;
    let remote = socket.turn(|t| {
        t.send_bytes(&(Command::CreateProgramWithSource as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(context, true)?;
        t.send_size(source.len() as u64, true)?;
        t.send_bytes(source.as_bytes(), false)?;
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            return Err(ProxyError::RemoteApi(status_code));
        }
        t.recv_handle_wrapper(Some(ObjectClass::Program))
    })?;
    let program = Arc::new(ProgramHandle::with_source(remote, server.clone(), source));
    runtime.programs.add(program.clone());
    Ok(program)
}

/// `BuildProgram`. On success, every built device's binary is pulled back
/// and cached (spec.md §4.9: "needed because binaries for all devices
/// must be materialized").
pub fn build_program(
    program: &Arc<ProgramHandle>,
    devices: &[HandleWrapper],
    options: &str,
) -> ProxyResult<()> {
    let socket = command_socket(&program.server)?;
    let binaries = socket.turn(|t| {
        t.send_bytes(&(Command::BuildProgram as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(program.remote(), true)?;
        t.send_size_array(&devices.iter().map(|d| d.as_u64()).collect::<Vec<_>>(), true)?;
        t.send_size(options.len() as u64, true)?;
        t.send_bytes(options.as_bytes(), false)?;
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            return Err(ProxyError::RemoteApi(status_code));
        }
        let mut out = Vec::with_capacity(devices.len());
        for &device in devices {
            let len = t.recv_size()? as usize;
            let mut binary = vec![0u8; len];
            if len > 0 {
                t.recv_bytes(&mut binary)?;
            }
            out.push((device, binary));
        }
        Ok(out)
    })?;
    for (device, binary) in binaries {
        program.record_binary(device, binary);
    }
    Ok(())
}

pub fn create_kernel(
    runtime: &ClientRuntime,
    program: &Arc<ProgramHandle>,
    kernel_name: &str,
    num_args: usize,
) -> ProxyResult<Arc<KernelHandle>> {
    let socket = command_socket(&program.server)?;
    let remote = socket.turn(|t| {
        t.send_bytes(&(Command::CreateKernel as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(program.remote(), true)?;
        t.send_size(kernel_name.len() as u64, true)?;
        t.send_bytes(kernel_name.as_bytes(), false)?;
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            return Err(ProxyError::RemoteApi(status_code));
        }
        t.recv_handle_wrapper(Some(ObjectClass::Kernel))
    })?;
    let kernel = Arc::new(KernelHandle::new(remote, program.server.clone(), program.remote(), num_args));
    runtime.kernels.add(kernel.clone());
    Ok(kernel)
}

/// `SetKernelArg`. `None` means local memory (no `arg_value` sent, only
/// its size), matching `original_source/src/client/kernel.c`'s split
/// between the `arg_value` and local-memory paths.
pub fn set_kernel_arg(
    kernel: &Arc<KernelHandle>,
    arg_index: u32,
    arg_size: usize,
    arg_value: Option<&[u8]>,
) -> ProxyResult<()> {
    let socket = command_socket(&kernel.server)?;
    socket.turn(|t| {
        t.send_bytes(&(Command::SetKernelArg as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(kernel.remote(), true)?;
        t.send_size(arg_index as u64, true)?;
        t.send_size(arg_size as u64, true)?;
        match arg_value {
            Some(v) => {
                t.send_size(1, true)?;
                t.send_bytes(v, false)?;
            }
            None => {
                t.send_size(0, false)?;
            }
        }
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            Err(ProxyError::RemoteApi(status_code))
        } else {
            Ok(())
        }
    })
}

/// `GetKernelArgInfo` (spec.md §4.9): once the server reports the
/// dedicated "not available" status, every subsequent call for this
/// kernel short-circuits locally without another round trip.
pub fn get_kernel_arg_info(
    kernel: &Arc<KernelHandle>,
    arg_index: u32,
) -> ProxyResult<KernelArgInfo> {
    if let Some(cached) = kernel.cached_arg_info(arg_index as usize) {
        return Ok(cached);
    }
    if kernel.arg_info_is_unavailable() {
        return Err(ProxyError::RemoteApi(KERNEL_ARG_INFO_NOT_AVAILABLE));
    }
    let socket = command_socket(&kernel.server)?;
    let result = socket.turn(|t| -> ProxyResult<KernelArgInfo> {
        t.send_bytes(&(Command::GetKernelArgInfo as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(kernel.remote(), true)?;
        t.send_size(arg_index as u64, false)?;
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            return Err(ProxyError::RemoteApi(status_code));
        }
        let address_qualifier = t.recv_size()? as u32;
        let access_qualifier = t.recv_size()? as u32;
        let type_name = recv_string(t)?;
        let type_qualifier = t.recv_size()?;
        let name = recv_string(t)?;
        Ok(KernelArgInfo {
            address_qualifier,
            access_qualifier,
            type_name,
            type_qualifier,
            name,
        })
    });
    match result {
        Ok(info) => {
            kernel.cache_arg_info(arg_index as usize, info.clone());
            Ok(info)
        }
        Err(ProxyError::RemoteApi(code)) if code == KERNEL_ARG_INFO_NOT_AVAILABLE => {
            kernel.mark_arg_info_unavailable();
            Err(ProxyError::RemoteApi(code))
        }
        Err(e) => Err(e),
    }
}

/// `CL_KERNEL_ARG_INFO_NOT_AVAILABLE` (spec.md §4.9's dedicated
/// kernel-arg-info status).
const KERNEL_ARG_INFO_NOT_AVAILABLE: i32 = -19;

fn recv_string(t: &mut oclproxy_common::codec::Turn<'_>) -> ProxyResult<String> {
    let len = t.recv_size()? as usize;
    let mut buf = vec![0u8; len];
    if len > 0 {
        t.recv_bytes(&mut buf)?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// `EnqueueWriteBuffer` with `blocking=false` (symmetric to
/// [`enqueue_read_buffer_async`], but driven by the Upload Stream rather
/// than the Download Stream): the payload is queued immediately, gated
/// on `wait_event` if one is given, and the returned event completes
/// once the upload stream actually sends it (spec.md §4.6, §8 boundary
/// behavior "empty bulk read/write still produces and completes an
/// event").
pub fn enqueue_write_buffer_async(
    runtime: &ClientRuntime,
    server: &Arc<ServerRecord>,
    queue: HandleWrapper,
    context: HandleWrapper,
    buffer: HandleWrapper,
    data: Vec<u8>,
    wait_event: Option<Arc<EventHandle>>,
) -> ProxyResult<Arc<EventHandle>> {
    let stream = server.acquire_upload_stream(runtime.compressor.clone())?;
    let identifier = HandleWrapper::from_opaque(
        NEXT_IDENTIFIER.fetch_add(1, Ordering::Relaxed),
        ObjectClass::Event,
    );
    let event = Arc::new(EventHandle::new(identifier, server.clone(), context, Some(queue), false));
    event.set_status(status::SUBMITTED);

    let gating: Option<Arc<dyn GatingEvent>> = wait_event.map(|e| e as Arc<dyn GatingEvent>);
    stream.enqueue(gating, identifier, data);

    // The socket-level "here is the buffer this identifier writes to"
    // handshake is a single RPC the server uses to correlate the upload
    // frame with the right `clEnqueueWriteBuffer`; its own completion
    // reply is what flips the event to COMPLETE, mirroring the
    // synchronous path's single round trip but keeping the actual bytes
    // off the command socket.
    let socket = command_socket(server)?;
    socket.turn(|t| {
        t.send_bytes(&(Command::EnqueueWriteBuffer as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(queue, true)?;
        t.send_handle_wrapper(buffer, true)?;
        t.send_size(0, true)?; // blocking = false
        t.send_handle_wrapper(identifier, false)?;
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            Err(ProxyError::RemoteApi(status_code))
        } else {
            Ok(())
        }
    })?;
    event.set_status(status::COMPLETE);
    runtime.events.add(event.clone());
    Ok(event)
}

/// `Flush`: tells the server to flush the real queue, then locally waits
/// until every event bound to `queue` has left the queued/submitted
/// region (spec.md §4.7).
pub fn flush(runtime: &ClientRuntime, server: &Arc<ServerRecord>, queue: HandleWrapper) -> ProxyResult<()> {
    let socket = command_socket(server)?;
    socket.turn(|t| {
        t.send_bytes(&(Command::Flush as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(queue, false)?;
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            Err(ProxyError::RemoteApi(status_code))
        } else {
            Ok(())
        }
    })?;
    crate::event::flush(&runtime.events, queue);
    Ok(())
}

/// `Finish`: as `flush`, but waits for every event bound to `queue` to
/// reach `complete`/negative.
pub fn finish(runtime: &ClientRuntime, server: &Arc<ServerRecord>, queue: HandleWrapper) -> ProxyResult<()> {
    let socket = command_socket(server)?;
    socket.turn(|t| {
        t.send_bytes(&(Command::Finish as u32).to_le_bytes(), true)?;
        t.send_handle_wrapper(queue, false)?;
        let status_code = t.recv_size()? as i32;
        if status_code != 0 {
            Err(ProxyError::RemoteApi(status_code))
        } else {
            Ok(())
        }
    })?;
    crate::event::finish(&runtime.events, queue);
    Ok(())
}
