// Download Stream (spec.md §4.5; original_source/src/common/downloadStream.c).
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use oclproxy_common::{Availability, HandleWrapper, ObjectClass, Socket, TasksList};

const POLL_SLEEP: Duration = Duration::from_micros(10);

/// A dedicated reader thread per server, dispatching callback-channel
/// frames to registered tasks keyed by shared identifier (spec.md §4.5).
/// Reference-counted by [`crate::server::ServerRecord`]; at zero
/// references the owner calls [`DownloadStream::shutdown`], which joins
/// the reader thread.
pub struct DownloadStream {
    normal_tasks: Arc<TasksList>,
    error_tasks: Arc<TasksList>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadStream {
    pub fn spawn(socket: Arc<Socket>) -> Arc<Self> {
        let normal_tasks = Arc::new(TasksList::new());
        let error_tasks = Arc::new(TasksList::new());
        let running = Arc::new(AtomicBool::new(true));

        let reader_tasks = normal_tasks.clone();
        let reader_errors = error_tasks.clone();
        let reader_running = running.clone();
        let reader_socket = socket.clone();
        let handle = std::thread::Builder::new()
            .name("oclproxy-download".into())
            .spawn(move || {
                reader_loop(reader_socket, reader_tasks, reader_errors, reader_running)
            })
            .expect("spawn download-stream reader thread");

        Arc::new(DownloadStream {
            normal_tasks,
            error_tasks,
            running,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Register a task matched against frames bearing `identifier`
    /// (spec.md §4.5 step 3); see [`TasksList::register`].
    pub fn register(
        &self,
        identifier: HandleWrapper,
        propagating: bool,
        callback: oclproxy_common::task::Callback,
    ) -> u64 {
        self.normal_tasks.register(identifier, propagating, callback)
    }

    pub fn unregister(&self, task_id: u64) -> bool {
        self.normal_tasks.unregister(task_id)
    }

    /// Registered with a description-taking callback; fired once on
    /// transport failure and never again (spec.md §4.5's error-task list).
    pub fn register_error_task(&self, callback: oclproxy_common::task::Callback) -> u64 {
        self.error_tasks
            .register(HandleWrapper::from_opaque(0, ObjectClass::Unset), true, callback)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn reader_loop(
    socket: Arc<Socket>,
    normal_tasks: Arc<TasksList>,
    error_tasks: Arc<TasksList>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match socket.check_data_available() {
            Availability::NotYet => {
                std::thread::sleep(POLL_SLEEP);
                continue;
            }
            Availability::RemoteClosed => {
                error_tasks.fire_all(b"download stream: remote closed the callbacks socket");
                return;
            }
            Availability::Error => {
                error_tasks.fire_all(b"download stream: transport error on callbacks socket");
                return;
            }
            Availability::Ready => {}
        }

        let frame = socket.turn(|t| -> oclproxy_common::ProxyResult<(HandleWrapper, Vec<u8>)> {
            let identifier = t.recv_handle_wrapper(None)?;
            let len = t.recv_size()? as usize;
            let mut payload = vec![0u8; len];
            if len > 0 {
                t.recv_bytes(&mut payload)?;
            }
            Ok((identifier, payload))
        });

        let (identifier, payload) = match frame {
            Ok(v) => v,
            Err(e) => {
                error_tasks.fire_all(e.to_string().as_bytes());
                return;
            }
        };

        if let Some(task_id) = normal_tasks.dispatch(identifier, &payload) {
            normal_tasks.unregister(task_id);
        }
    }
}
