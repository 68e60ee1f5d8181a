// Crate-level integration tests driving the real dispatcher
// (`run_client_session`) over loopback TCP from the server's side of the
// protocol. `oclproxy-client/tests/end_to_end.rs` covers the S1-S6
// scenarios from a single client's perspective; these tests instead
// exercise concerns that only show up with the dispatcher's own threading
// and per-connection isolation (spec.md §4.8, §6).
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use oclproxy_client::runtime::ClientRuntime;
use oclproxy_client::server::ServerDirectory;
use oclproxy_client::rpc;
use oclproxy_server::{run_client_session, FakeDevice, LocalDevice};

fn bind_server_ports() -> (TcpListener, TcpListener, u16) {
    loop {
        let command = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_port = command.local_addr().unwrap().port();
        if let Ok(callbacks) = TcpListener::bind(("127.0.0.1", base_port + 1)) {
            return (command, callbacks, base_port);
        }
    }
}

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

fn setup_client(base_port: u16) -> Arc<ClientRuntime> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("endpoints.txt");
    std::fs::write(&path, format!("127.0.0.1:{base_port}\n")).unwrap();
    let directory = ServerDirectory::from_file(&path).unwrap();
    assert!(directory.servers()[0].is_reachable());
    ClientRuntime::new(directory)
}

/// One dispatcher thread per accepted pair (spec.md §4.8, §6): two
/// independent clients against two independent `run_client_session`
/// instances must never observe each other's buffers, even though both
/// run against the same `FakeDevice` instance they happen to share here
/// via separate listeners -- each gets its own context and its own
/// buffer handle, so the isolation is per-handle, not per-process.
#[test]
fn two_concurrent_sessions_do_not_cross_contaminate_buffers() {
    let device: Arc<dyn LocalDevice> = Arc::new(FakeDevice::new());

    let (cmd_a, cb_a, port_a) = bind_server_ports();
    let server_a = spawn_server(cmd_a, cb_a, device.clone());
    let (cmd_b, cb_b, port_b) = bind_server_ports();
    let server_b = spawn_server(cmd_b, cb_b, device.clone());

    let run_one = |base_port: u16, fill: u8| {
        let runtime = setup_client(base_port);
        let server = runtime.directory.servers()[0].clone();
        let platforms = rpc::get_platform_ids(&runtime, &server, 0).unwrap();
        let devices = rpc::get_device_ids(&runtime, &server, platforms[0].remote(), 0, 0).unwrap();
        let ctx = rpc::create_context(&runtime, &server, vec![devices[0].remote()], vec![], None).unwrap();
        let queue =
            rpc::create_command_queue(&runtime, &server, ctx.remote(), devices[0].remote(), 0).unwrap();
        let mem = rpc::create_buffer(&runtime, &server, ctx.remote(), 0, 8, None).unwrap();
        let data = vec![fill; 8];
        rpc::enqueue_write_buffer_blocking(&server, queue.remote(), mem.remote(), 0, &data).unwrap();
        let mut readback = vec![0u8; 8];
        rpc::enqueue_read_buffer_blocking(&server, queue.remote(), mem.remote(), 0, &mut readback).unwrap();
        readback
    };

    let handle_a = thread::spawn(move || run_one(port_a, 0x11));
    let handle_b = thread::spawn(move || run_one(port_b, 0x22));

    assert_eq!(handle_a.join().unwrap(), vec![0x11u8; 8]);
    assert_eq!(handle_b.join().unwrap(), vec![0x22u8; 8]);

    server_a.join().unwrap();
    server_b.join().unwrap();
}

/// When the client vanishes mid-session -- here, right after an
/// in-flight async write has been registered but before its bytes ever
/// arrive on the callbacks channel -- `run_client_session` must still
/// return cleanly rather than hang or panic (spec.md §4.8's per-session
/// thread is expected to unwind on a dropped connection like any other
/// transport error).
#[test]
fn session_thread_exits_cleanly_when_client_vanishes_mid_async_write() {
    let (command_listener, callbacks_listener, base_port) = bind_server_ports();
    let server_thread = spawn_server(command_listener, callbacks_listener, Arc::new(FakeDevice::new()));

    {
        let runtime = setup_client(base_port);
        let server = runtime.directory.servers()[0].clone();
        let platforms = rpc::get_platform_ids(&runtime, &server, 0).unwrap();
        let devices = rpc::get_device_ids(&runtime, &server, platforms[0].remote(), 0, 0).unwrap();
        let ctx = rpc::create_context(&runtime, &server, vec![devices[0].remote()], vec![], None).unwrap();
        let queue =
            rpc::create_command_queue(&runtime, &server, ctx.remote(), devices[0].remote(), 0).unwrap();
        let mem = rpc::create_buffer(&runtime, &server, ctx.remote(), 0, 4, None).unwrap();

        // Gate the write on a user event that is never completed, so the
        // upload stream never actually sends the frame before the client
        // drops every socket at the end of this scope.
        let gate = rpc::create_user_event(&runtime, &server, ctx.remote()).unwrap();
        let _write_event = rpc::enqueue_write_buffer_async(
            &runtime,
            &server,
            queue.remote(),
            ctx.remote(),
            mem.remote(),
            vec![0u8; 4],
            Some(gate),
        )
        .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while !server_thread.is_finished() {
        assert!(Instant::now() < deadline, "server session never exited after the client disconnected");
        thread::sleep(Duration::from_millis(5));
    }
    server_thread.join().unwrap();
}
