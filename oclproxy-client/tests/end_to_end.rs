// Crate-level integration tests driving a real, dispatcher-backed
// `oclproxy-server` session over loopback TCP: the end-to-end scenarios
// S1-S6.  Each test binds its own command/callbacks listener pair, runs
// one `run_client_session` against `FakeDevice`, and drives it through
// the public client surface (`rpc`, `ClientRuntime`, `ServerDirectory`)
// exactly as a host application would.
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use oclproxy_client::runtime::ClientRuntime;
use oclproxy_client::server::{ServerDirectory, ServerRecord};
use oclproxy_client::{rpc, RemoteHandle};
use oclproxy_common::{status, Command, HandleWrapper, ObjectClass, Socket};
use oclproxy_server::{run_client_session, FakeDevice, LocalDevice};

/// Command channel on an ephemeral port, callbacks channel on the next
/// one up (spec.md §6); retried on the rare port-already-taken race.
fn bind_server_ports() -> (TcpListener, TcpListener, u16) {
    loop {
        let command = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_port = command.local_addr().unwrap().port();
        if let Ok(callbacks) = TcpListener::bind(("127.0.0.1", base_port + 1)) {
            return (command, callbacks, base_port);
        }
    }
}

/// Accepts exactly one client pair and serves it with the real
/// dispatcher until the client disconnects.
fn spawn_server(
    command_listener: TcpListener,
    callbacks_listener: TcpListener,
    device: Arc<dyn LocalDevice>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let (command_stream, peer) = command_listener.accept().unwrap();
        let (callbacks_stream, _) = callbacks_listener.accept().unwrap();
        run_client_session(
            command_stream,
            callbacks_stream,
            peer.to_string(),
            device,
            Arc::new(oclproxy_common::Identity),
        )
        .unwrap();
    })
}

/// A `ClientRuntime` with its one server loaded through a scratch
/// endpoint file, the way a real client process would (spec.md §6).
fn setup_client(base_port: u16) -> (Arc<ClientRuntime>, Arc<ServerRecord>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("endpoints.txt");
    std::fs::write(&path, format!("127.0.0.1:{base_port}\n")).unwrap();
    let directory = ServerDirectory::from_file(&path).unwrap();
    let server_record = directory.servers()[0].clone();
    assert!(server_record.is_reachable(), "client failed to reach the test server");
    let runtime = ClientRuntime::new(directory);
    (runtime, server_record)
}

/// `CL_PLATFORM_NAME`.
const CL_PLATFORM_NAME: u32 = 0x0902;

#[test]
fn s1_platform_enumeration_prefixes_platform_name_with_server_address() {
    let (command_listener, callbacks_listener, base_port) = bind_server_ports();
    let server_thread = spawn_server(command_listener, callbacks_listener, Arc::new(FakeDevice::new()));

    {
        let (runtime, server_record) = setup_client(base_port);
        let address = server_record.address().to_string();

        let platforms = rpc::get_platform_ids(&runtime, &server_record, 0).unwrap();
        assert_eq!(platforms.len(), 1);

        let mut buf = vec![0u8; 64];
        let len = rpc::get_platform_info(&server_record, platforms[0].remote(), CL_PLATFORM_NAME, Some(&mut buf))
            .unwrap();
        let expected = format!("ocland({address}) FakeDevice OpenCL Platform\0");
        assert_eq!(&buf[..len], expected.as_bytes());
    }
    server_thread.join().unwrap();
}

#[test]
fn s2_synchronous_buffer_write_then_read_round_trips() {
    let (command_listener, callbacks_listener, base_port) = bind_server_ports();
    let server_thread = spawn_server(command_listener, callbacks_listener, Arc::new(FakeDevice::new()));

    {
        let (runtime, server_record) = setup_client(base_port);
        let platforms = rpc::get_platform_ids(&runtime, &server_record, 0).unwrap();
        let devices = rpc::get_device_ids(&runtime, &server_record, platforms[0].remote(), 0, 0).unwrap();
        let device = devices[0].remote();

        let ctx = rpc::create_context(&runtime, &server_record, vec![device], vec![], None).unwrap();
        let queue = rpc::create_command_queue(&runtime, &server_record, ctx.remote(), device, 0).unwrap();
        let mem = rpc::create_buffer(&runtime, &server_record, ctx.remote(), 0, 64, None).unwrap();

        let pattern: Vec<u8> = (0..64).collect();
        rpc::enqueue_write_buffer_blocking(&server_record, queue.remote(), mem.remote(), 0, &pattern).unwrap();

        let mut readback = vec![0u8; 64];
        rpc::enqueue_read_buffer_blocking(&server_record, queue.remote(), mem.remote(), 0, &mut readback).unwrap();
        assert_eq!(readback, pattern);

        rpc::release_mem_object(&runtime, &mem).unwrap();
        rpc::release_command_queue(&runtime, &queue).unwrap();
        rpc::release_context(&runtime, &ctx).unwrap();
    }
    server_thread.join().unwrap();
}

#[test]
fn s3_asynchronous_read_completes_via_download_stream_callback() {
    let (command_listener, callbacks_listener, base_port) = bind_server_ports();
    let server_thread = spawn_server(command_listener, callbacks_listener, Arc::new(FakeDevice::new()));

    {
        let (runtime, server_record) = setup_client(base_port);
        let platforms = rpc::get_platform_ids(&runtime, &server_record, 0).unwrap();
        let devices = rpc::get_device_ids(&runtime, &server_record, platforms[0].remote(), 0, 0).unwrap();
        let device = devices[0].remote();

        let ctx = rpc::create_context(&runtime, &server_record, vec![device], vec![], None).unwrap();
        let queue = rpc::create_command_queue(&runtime, &server_record, ctx.remote(), device, 0).unwrap();
        let mem = rpc::create_buffer(&runtime, &server_record, ctx.remote(), 0, 32, None).unwrap();

        let pattern: Vec<u8> = (0..32u32).map(|i| (i ^ 0xA5) as u8).collect();
        rpc::enqueue_write_buffer_blocking(&server_record, queue.remote(), mem.remote(), 0, &pattern).unwrap();

        let dst = Arc::new(Mutex::new(Vec::new()));
        let event = rpc::enqueue_read_buffer_async(
            &runtime,
            &server_record,
            queue.remote(),
            ctx.remote(),
            mem.remote(),
            0,
            32,
            dst.clone(),
        )
        .unwrap();

        // `finish` must not return until the async read's event does, which
        // only holds if `enqueue_read_buffer_async` registered the event in
        // `runtime.events` — otherwise this would return immediately while
        // the read is still in flight and the assertions below could race.
        rpc::finish(&runtime, &server_record, queue.remote()).unwrap();
        assert_eq!(event.status(), status::COMPLETE);
        assert_eq!(*dst.lock().unwrap(), pattern);

        rpc::release_mem_object(&runtime, &mem).unwrap();
        rpc::release_command_queue(&runtime, &queue).unwrap();
        rpc::release_context(&runtime, &ctx).unwrap();
    }
    server_thread.join().unwrap();
}

#[test]
fn s4_write_gated_on_a_user_event_is_deferred_until_status_is_set() {
    let (command_listener, callbacks_listener, base_port) = bind_server_ports();
    let server_thread = spawn_server(command_listener, callbacks_listener, Arc::new(FakeDevice::new()));

    {
        let (runtime, server_record) = setup_client(base_port);
        let platforms = rpc::get_platform_ids(&runtime, &server_record, 0).unwrap();
        let devices = rpc::get_device_ids(&runtime, &server_record, platforms[0].remote(), 0, 0).unwrap();
        let device = devices[0].remote();

        let ctx = rpc::create_context(&runtime, &server_record, vec![device], vec![], None).unwrap();
        let queue = rpc::create_command_queue(&runtime, &server_record, ctx.remote(), device, 0).unwrap();
        let mem = rpc::create_buffer(&runtime, &server_record, ctx.remote(), 0, 16, None).unwrap();

        let gate = rpc::create_user_event(&runtime, &server_record, ctx.remote()).unwrap();
        let pattern = vec![0x7Eu8; 16];

        let write_event = rpc::enqueue_write_buffer_async(
            &runtime,
            &server_record,
            queue.remote(),
            ctx.remote(),
            mem.remote(),
            pattern.clone(),
            Some(gate.clone()),
        )
        .unwrap();

        // Enqueuing never blocks on the gate -- only the byte transfer
        // does -- so the buffer must still read back as the all-zero
        // bytes `FakeDevice::create_buffer` initialized it with.
        let mut still_unwritten = vec![0xFFu8; 16];
        rpc::enqueue_read_buffer_blocking(&server_record, queue.remote(), mem.remote(), 0, &mut still_unwritten)
            .unwrap();
        assert_eq!(
            still_unwritten,
            vec![0u8; 16],
            "gated write bytes landed before the user event completed"
        );

        rpc::set_user_event_status(&gate, status::COMPLETE).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let mut readback = vec![0u8; 16];
            rpc::enqueue_read_buffer_blocking(&server_record, queue.remote(), mem.remote(), 0, &mut readback)
                .unwrap();
            if readback == pattern {
                break;
            }
            assert!(Instant::now() < deadline, "gated write never landed after the event completed");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(write_event.status(), status::COMPLETE);

        rpc::release_mem_object(&runtime, &mem).unwrap();
        rpc::release_command_queue(&runtime, &queue).unwrap();
        rpc::release_context(&runtime, &ctx).unwrap();
    }
    server_thread.join().unwrap();
}

/// S5: the server vanishes while a download-stream task is outstanding.
/// A hand-rolled peer answers exactly the `CreateContext` handshake
/// `rpc::create_context` sends, then drops both connections instead of
/// ever answering again -- modeling a server process that dies mid-wait.
/// The client's download-stream error-task list must fire exactly once.
#[test]
fn s5_server_disconnect_mid_wait_fires_error_task_exactly_once() {
    let (command_listener, callbacks_listener, base_port) = bind_server_ports();

    let peer_thread = thread::spawn(move || {
        let (command_stream, _) = command_listener.accept().unwrap();
        let (callbacks_stream, _) = callbacks_listener.accept().unwrap();
        let command = Socket::new(command_stream, "peer-cmd".into()).unwrap();
        let callbacks = Socket::new(callbacks_stream, "peer-cb".into()).unwrap();

        command
            .turn(|t| {
                let mut code = [0u8; 4];
                t.recv_bytes(&mut code)?;
                assert_eq!(u32::from_le_bytes(code), Command::CreateContext as u32);
                let _identifier = t.recv_handle_wrapper(None)?;
                let _devices = t.recv_size_array()?;
                let _properties = t.recv_size_array()?;
                t.send_size(0, true)?;
                t.send_handle_wrapper(HandleWrapper::from_opaque(0xC0FFEE, ObjectClass::Context), false)
            })
            .unwrap();

        // The server process disappears: both connections close without
        // ever answering another request.
        drop(command);
        drop(callbacks);
    });

    let hits = Arc::new(AtomicUsize::new(0));
    {
        let (runtime, server_record) = setup_client(base_port);
        let device = HandleWrapper::from_opaque(1, ObjectClass::Device);
        let ctx = rpc::create_context(&runtime, &server_record, vec![device], vec![], None).unwrap();

        let stream = ctx.server.peek_download_stream().expect("context holds a download stream");
        let h = hits.clone();
        stream.register_error_task(Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "error task never fired after the server disappeared");
            thread::sleep(Duration::from_millis(5));
        }
        // Give a stray second delivery a moment to show up, if one would.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
    peer_thread.join().unwrap();
}

/// S6: a handle minted with a non-native architecture tag (standing in
/// for a differently-pointer-width client sharing the same server) must
/// still be accepted -- the dispatcher and `LocalDevice` boundary only
/// ever look at the class tag and the opaque payload, never the arch tag
/// (spec.md §9: "handles are architecture-tagged, not
/// architecture-converted").
#[test]
fn s6_object_handle_round_trips_regardless_of_its_carried_arch_tag() {
    let (command_listener, callbacks_listener, base_port) = bind_server_ports();
    let server_thread = spawn_server(command_listener, callbacks_listener, Arc::new(FakeDevice::new()));

    {
        let (runtime, server_record) = setup_client(base_port);
        let platforms = rpc::get_platform_ids(&runtime, &server_record, 0).unwrap();
        let devices = rpc::get_device_ids(&runtime, &server_record, platforms[0].remote(), 0, 0).unwrap();
        let native_device = devices[0].remote();

        let foreign_arch_device = HandleWrapper::from_opaque(native_device.as_u64(), ObjectClass::Device);
        assert_ne!(foreign_arch_device.arch(), native_device.arch());

        let mut buf = vec![0u8; 32];
        let len = rpc::get_device_info(&server_record, foreign_arch_device, 0, Some(&mut buf)).unwrap();
        assert_eq!(&buf[..len], b"FakeDevice\0");
    }
    server_thread.join().unwrap();
}
