// Upload Stream (spec.md §4.6; original_source/src/common/uploadStream.c).
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use oclproxy_common::{status, HandleWrapper, Socket};

const SPIN_SLEEP: Duration = Duration::from_micros(10);

/// Anything the upload stream can gate a package's send on. `event.rs`
/// implements this for `EventHandle`; kept as a trait so this module
/// doesn't need to depend on the Event Engine's internals.
pub trait GatingEvent: Send + Sync {
    fn poll_status(&self) -> i32;
}

struct Package {
    gating: Option<Arc<dyn GatingEvent>>,
    identifier: HandleWrapper,
    data: Vec<u8>,
}

/// A FIFO of pending packages and a sender thread (spec.md §4.6). Each
/// package is sent in order; a package with a gating event is held until
/// that event leaves the pre-complete ("submitted") region.
pub struct UploadStream {
    queue: Arc<(Mutex<VecDeque<Package>>, Condvar)>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl UploadStream {
    pub fn spawn(socket: Arc<Socket>, compressor: Arc<dyn oclproxy_common::Compressor>) -> Arc<Self> {
        let queue = Arc::new((Mutex::new(VecDeque::new()), Condvar::new()));
        let running = Arc::new(AtomicBool::new(true));

        let sender_queue = queue.clone();
        let sender_running = running.clone();
        let handle = std::thread::Builder::new()
            .name("oclproxy-upload".into())
            .spawn(move || sender_loop(socket, sender_queue, sender_running, compressor))
            .expect("spawn upload-stream sender thread");

        Arc::new(UploadStream {
            queue,
            running,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue a package; `gating` is the event (if any) that must leave
    /// the submitted region before this package is sent.
    pub fn enqueue(&self, gating: Option<Arc<dyn GatingEvent>>, identifier: HandleWrapper, data: Vec<u8>) {
        let (lock, cvar) = &*self.queue;
        lock.lock().unwrap().push_back(Package {
            gating,
            identifier,
            data,
        });
        cvar.notify_one();
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.1.notify_all();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn sender_loop(
    socket: Arc<Socket>,
    queue: Arc<(Mutex<VecDeque<Package>>, Condvar)>,
    running: Arc<AtomicBool>,
    compressor: Arc<dyn oclproxy_common::Compressor>,
) {
    let (lock, cvar) = &*queue;
    while running.load(Ordering::SeqCst) {
        let package = {
            let mut guard = lock.lock().unwrap();
            loop {
                if let Some(pkg) = guard.pop_front() {
                    break Some(pkg);
                }
                if !running.load(Ordering::SeqCst) {
                    break None;
                }
                let (g, timeout) = cvar
                    .wait_timeout(guard, Duration::from_millis(50))
                    .unwrap();
                guard = g;
                let _ = timeout;
            }
        };
        let Some(package) = package else { break };

        // Spin while the gating event is still pre-complete; this avoids a
        // blocking wait that would serialize the whole RPC surface behind
        // one upload (spec.md §4.6). A negative (error) status is logged
        // and the data is sent anyway rather than aborting — the original
        // implementation's documented behavior for this path
        // (original_source/src/common/uploadStream.c).
        if let Some(gate) = &package.gating {
            loop {
                let s = gate.poll_status();
                if s != status::SUBMITTED && s != status::QUEUED {
                    if status::is_error(s) {
                        tracing::warn!(
                            status = s,
                            "upload stream: gating event finished with an error status, \
                             sending data anyway"
                        );
                    }
                    break;
                }
                std::thread::sleep(SPIN_SLEEP);
            }
        }

        let packed = compressor.pack(&package.data);
        let result = socket.turn(|t| {
            t.send_handle_wrapper(package.identifier, true)?;
            t.send_size(packed.len() as u64, true)?;
            t.send_bytes(&packed, false)
        });
        if let Err(e) = result {
            tracing::error!(error = %e, "upload stream: transport failure, sender exiting");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oclproxy_common::{Identity, ObjectClass};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::AtomicI32;

    struct FakeEvent(AtomicI32);

    impl GatingEvent for FakeEvent {
        fn poll_status(&self) -> i32 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn pair() -> (Arc<Socket>, Arc<Socket>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let sender = std::thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server_side, _) = listener.accept().unwrap();
        let client_side = sender.join().unwrap();
        (
            Arc::new(Socket::new(server_side, "server".into()).unwrap()),
            Arc::new(Socket::new(client_side, "client".into()).unwrap()),
        )
    }

    #[test]
    fn sends_package_only_after_gating_event_completes() {
        let (sender_socket, receiver_socket) = pair();
        let stream = UploadStream::spawn(sender_socket, Arc::new(Identity));
        let gate = Arc::new(FakeEvent(AtomicI32::new(status::SUBMITTED)));
        let identifier = HandleWrapper::from_local_ptr(7, ObjectClass::Event);
        stream.enqueue(Some(gate.clone() as Arc<dyn GatingEvent>), identifier, b"payload".to_vec());

        // Give the sender a moment to observe the still-submitted gate.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(receiver_socket.check_data_available(), oclproxy_common::Availability::NotYet);

        gate.0.store(status::COMPLETE, Ordering::SeqCst);

        let got_id = receiver_socket.recv_handle_wrapper(Some(ObjectClass::Event)).unwrap();
        let len = receiver_socket.recv_size().unwrap();
        let mut buf = vec![0u8; len as usize];
        receiver_socket.recv_bytes(&mut buf).unwrap();
        assert_eq!(got_id.as_u64(), 7);
        assert_eq!(buf, b"payload");
        stream.shutdown();
    }

    #[test]
    fn ungated_package_sends_immediately() {
        let (sender_socket, receiver_socket) = pair();
        let stream = UploadStream::spawn(sender_socket, Arc::new(Identity));
        let identifier = HandleWrapper::from_local_ptr(9, ObjectClass::Memory);
        stream.enqueue(None, identifier, b"abc".to_vec());

        let got_id = receiver_socket.recv_handle_wrapper(Some(ObjectClass::Memory)).unwrap();
        let len = receiver_socket.recv_size().unwrap();
        let mut buf = vec![0u8; len as usize];
        receiver_socket.recv_bytes(&mut buf).unwrap();
        assert_eq!(got_id.as_u64(), 9);
        assert_eq!(buf, b"abc");
        stream.shutdown();
    }
}
