// Extended context wrapper (spec.md §3, §4.8; original_source/include/ocland/server/ocland_context.h).
//
// The original wraps each real `cl_context` with a linked list of
// callback registrations and the socket to fire them over. This
// collapses the registration bookkeeping (oclproxy-client drives its own
// notify dispatch client-side; see `oclproxy_client::objects::ContextHandle`)
// down to what the server actually needs: the real handle, a refcount
// mirroring what the client believes it holds, the client-identifying
// label used in log lines, and the callbacks socket to notify over.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use oclproxy_common::Socket;

/// A context as tracked on the server side: the real `LocalDevice` handle
/// plus everything the dispatcher needs to route notifications back to
/// the one client that owns it (spec.md §3's context notify channel is
/// per-context, carried over the callbacks socket established at connect
/// time — spec.md §6).
pub struct ExtendedContext {
    real: u64,
    rc: AtomicU32,
    client: String,
    notify_id: oclproxy_common::HandleWrapper,
    callbacks: Arc<Socket>,
}

impl ExtendedContext {
    pub fn new(
        real: u64,
        client: impl Into<String>,
        notify_id: oclproxy_common::HandleWrapper,
        callbacks: Arc<Socket>,
    ) -> Self {
        ExtendedContext {
            real,
            rc: AtomicU32::new(1),
            client: client.into(),
            notify_id,
            callbacks,
        }
    }

    pub fn real(&self) -> u64 {
        self.real
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn notify_id(&self) -> oclproxy_common::HandleWrapper {
        self.notify_id
    }

    pub fn retain(&self) -> u32 {
        self.rc.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the count after release; `0` means the caller must also
    /// release the real context and drop this wrapper.
    pub fn release(&self) -> u32 {
        self.rc.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn ref_count(&self) -> u32 {
        self.rc.load(Ordering::SeqCst)
    }

    /// Fire a `CL_CONTEXT_NOTIFY` callback over this context's callbacks
    /// socket (spec.md §3). `private_info` mirrors the real API's
    /// `(const void *, size_t)` pair — always forwarded as raw bytes, never
    /// interpreted by the proxy-protocol engine itself.
    pub fn notify(&self, errinfo: &str, private_info: &[u8]) -> oclproxy_common::ProxyResult<()> {
        let mut payload = Vec::with_capacity(8 + errinfo.len() + private_info.len());
        payload.extend_from_slice(&(errinfo.len() as u64).to_le_bytes());
        payload.extend_from_slice(errinfo.as_bytes());
        payload.extend_from_slice(private_info);
        self.callbacks.turn(|t| {
            t.send_handle_wrapper(self.notify_id, true)?;
            t.send_size(payload.len() as u64, true)?;
            t.send_bytes(&payload, false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oclproxy_common::{HandleWrapper, ObjectClass};
    use std::net::{TcpListener, TcpStream};

    fn socket_pair() -> (Arc<Socket>, Socket) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server_stream, _) = listener.accept().unwrap();
        let client_stream = client.join().unwrap();
        (
            Arc::new(Socket::new(server_stream, "server".into()).unwrap()),
            Socket::new(client_stream, "client".into()).unwrap(),
        )
    }

    fn notify_id() -> HandleWrapper {
        HandleWrapper::from_opaque(9, ObjectClass::Context)
    }

    #[test]
    fn retain_and_release_track_count() {
        let (callbacks, _peer) = socket_pair();
        let ctx = ExtendedContext::new(0x42, "client-a", notify_id(), callbacks);
        assert_eq!(ctx.ref_count(), 1);
        assert_eq!(ctx.retain(), 2);
        assert_eq!(ctx.release(), 1);
        assert_eq!(ctx.release(), 0);
    }

    #[test]
    fn notify_delivers_identifier_errinfo_and_private_info() {
        let (callbacks, peer) = socket_pair();
        let id = notify_id();
        let ctx = ExtendedContext::new(1, "client-a", id, callbacks);
        let sender = std::thread::spawn(move || ctx.notify("boom", &[1, 2, 3]).unwrap());
        let (got_id, errinfo, info) = peer
            .turn(|t| {
                let got_id = t.recv_handle_wrapper(None)?;
                let frame_len = t.recv_size()? as usize;
                let mut frame = vec![0u8; frame_len];
                t.recv_bytes(&mut frame)?;
                let errinfo_len = u64::from_le_bytes(frame[..8].try_into().unwrap()) as usize;
                let errinfo = frame[8..8 + errinfo_len].to_vec();
                let info = frame[8 + errinfo_len..].to_vec();
                Ok((got_id, errinfo, info))
            })
            .unwrap();
        sender.join().unwrap();
        assert_eq!(got_id, id);
        assert_eq!(errinfo, b"boom");
        assert_eq!(info, vec![1, 2, 3]);
    }
}
