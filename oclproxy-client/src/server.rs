// Server Directory (spec.md §4.4; original_source/include/ocland/client/ocland.h).
use std::io::BufRead;
use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, Mutex};

use oclproxy_common::{Compressor, Identity, ProxyError, ProxyResult, Socket, DEFAULT_BASE_PORT};

use crate::download_stream::DownloadStream;
use crate::upload_stream::UploadStream;

/// One listed endpoint: address string, the two sockets §4.4 opens, and
/// the lazily-created, reference-counted download stream (spec.md §3's
/// "Server record").
///
/// §4.4 only ever opens two TCP connections per server (command,
/// callbacks); §6's upload channel is "symmetric to the callback channel"
/// rather than a third connection, so the upload stream's sender shares
/// the same full-duplex `callbacks` socket the download stream reads
/// from — each direction is independent at the TCP level, and
/// `Socket::turn` already serializes the handful of primitives any one
/// exchange needs, so the two stream threads never tear each other's
/// frames.
pub struct ServerRecord {
    address: String,
    pub command: Option<Arc<Socket>>,
    pub callbacks: Option<Arc<Socket>>,
    download_stream: Mutex<Option<(Arc<DownloadStream>, usize)>>,
    upload_stream: Mutex<Option<(Arc<UploadStream>, usize)>>,
}

impl ServerRecord {
    /// Parse `host[:port]` (IPv4 dotted, or bracketed IPv6), connect the
    /// command socket on the given base port and the callbacks socket on
    /// `base + 1`. Per §4.4, a failed connection does not remove the
    /// endpoint: it is retained with `command`/`callbacks` left `None` and
    /// the client proceeds with whatever succeeded.
    pub fn connect(line: &str) -> Self {
        let (host, base_port) = parse_endpoint(line);
        let address = format!("{host}:{base_port}");
        let command = TcpStream::connect((host.as_str(), base_port))
            .ok()
            .and_then(|s| Socket::new(s, address.clone()).ok())
            .map(Arc::new);
        let callbacks_addr = format!("{host}:{}", base_port + 1);
        let callbacks = TcpStream::connect((host.as_str(), base_port + 1))
            .ok()
            .and_then(|s| Socket::new(s, callbacks_addr).ok())
            .map(Arc::new);
        ServerRecord {
            address,
            command,
            callbacks,
            download_stream: Mutex::new(None),
            upload_stream: Mutex::new(None),
        }
    }

    /// A record for an endpoint that never connected (e.g. host
    /// unreachable), or a stand-in used by tests that only exercise
    /// handle-object bookkeeping, not real I/O.
    pub fn unconnected(address: String) -> Self {
        ServerRecord {
            address,
            command: None,
            callbacks: None,
            download_stream: Mutex::new(None),
            upload_stream: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_reachable(&self) -> bool {
        self.command.is_some() && self.callbacks.is_some()
    }

    /// Created on first context creation, released when the last context
    /// on this server releases it (spec.md §4.4); the returned count is the
    /// new reference count after this call, for callers that need to know
    /// whether they are the first referent.
    pub fn acquire_download_stream(self: &Arc<Self>) -> ProxyResult<Arc<DownloadStream>> {
        let mut guard = self.download_stream.lock().unwrap();
        if let Some((stream, count)) = guard.as_mut() {
            *count += 1;
            return Ok(stream.clone());
        }
        let callbacks = self
            .callbacks
            .as_ref()
            .ok_or_else(|| ProxyError::Transport {
                peer: self.address.clone(),
                detail: "callbacks socket unavailable".into(),
            })?;
        let stream = DownloadStream::spawn(callbacks.clone());
        *guard = Some((stream.clone(), 1));
        Ok(stream)
    }

    /// The currently-live download stream, if any, without affecting its
    /// reference count. Used by callers that already hold a reference
    /// (e.g. a context releasing its own stream task) and just need the
    /// stream object to call `unregister` on.
    pub fn peek_download_stream(&self) -> Option<Arc<DownloadStream>> {
        self.download_stream.lock().unwrap().as_ref().map(|(s, _)| s.clone())
    }

    /// Release one reference; tears the stream down and joins its reader
    /// thread when the count reaches zero (spec.md §4.4).
    pub fn release_download_stream(&self) {
        let mut guard = self.download_stream.lock().unwrap();
        let should_drop = if let Some((_, count)) = guard.as_mut() {
            *count -= 1;
            *count == 0
        } else {
            false
        };
        if should_drop {
            if let Some((stream, _)) = guard.take() {
                stream.shutdown();
            }
        }
    }

    /// Mirror of [`Self::acquire_download_stream`] for the upload
    /// direction; shares the callbacks socket (see the struct doc).
    pub fn acquire_upload_stream(
        self: &Arc<Self>,
        compressor: Arc<dyn Compressor>,
    ) -> ProxyResult<Arc<UploadStream>> {
        let mut guard = self.upload_stream.lock().unwrap();
        if let Some((stream, count)) = guard.as_mut() {
            *count += 1;
            return Ok(stream.clone());
        }
        let callbacks = self
            .callbacks
            .as_ref()
            .ok_or_else(|| ProxyError::Transport {
                peer: self.address.clone(),
                detail: "callbacks socket unavailable".into(),
            })?;
        let stream = UploadStream::spawn(callbacks.clone(), compressor);
        *guard = Some((stream.clone(), 1));
        Ok(stream)
    }

    pub fn peek_upload_stream(&self) -> Option<Arc<UploadStream>> {
        self.upload_stream.lock().unwrap().as_ref().map(|(s, _)| s.clone())
    }

    pub fn release_upload_stream(&self) {
        let mut guard = self.upload_stream.lock().unwrap();
        let should_drop = if let Some((_, count)) = guard.as_mut() {
            *count -= 1;
            *count == 0
        } else {
            false
        };
        if should_drop {
            if let Some((stream, _)) = guard.take() {
                stream.shutdown();
            }
        }
    }
}

/// The compression algorithm a [`ServerRecord`]'s streams use to pack/
/// unpack bulk data; `Identity` unless the `deflate` feature picks
/// otherwise (spec.md §4.2's "compile-time, identical on both peers").
pub fn default_compressor() -> Arc<dyn Compressor> {
    #[cfg(feature = "deflate")]
    {
        Arc::new(oclproxy_common::compress::Deflate)
    }
    #[cfg(not(feature = "deflate"))]
    {
        Arc::new(Identity)
    }
}

fn parse_endpoint(line: &str) -> (String, u16) {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix('[') {
        // Bracketed IPv6: [addr] or [addr]:port
        if let Some(end) = rest.find(']') {
            let addr = &rest[..end];
            let after = &rest[end + 1..];
            let port = after
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_BASE_PORT);
            return (addr.to_string(), port);
        }
    }
    match line.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            (host.to_string(), port.parse().unwrap_or(DEFAULT_BASE_PORT))
        }
        _ => (line.to_string(), DEFAULT_BASE_PORT),
    }
}

/// Loads the endpoint-list file at client init and owns every
/// [`ServerRecord`] for the process's lifetime (spec.md §3, §4.4).
pub struct ServerDirectory {
    servers: Vec<Arc<ServerRecord>>,
}

impl ServerDirectory {
    pub fn from_file(path: impl AsRef<Path>) -> ProxyResult<Self> {
        let file = std::fs::File::open(path.as_ref()).map_err(|e| ProxyError::Transport {
            peer: path.as_ref().display().to_string(),
            detail: e.to_string(),
        })?;
        let reader = std::io::BufReader::new(file);
        let mut servers = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| ProxyError::Transport {
                peer: path.as_ref().display().to_string(),
                detail: e.to_string(),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            servers.push(Arc::new(ServerRecord::connect(&line)));
        }
        Ok(ServerDirectory { servers })
    }

    pub fn servers(&self) -> &[Arc<ServerRecord>] {
        &self.servers
    }

    pub fn reachable(&self) -> impl Iterator<Item = &Arc<ServerRecord>> {
        self.servers.iter().filter(|s| s.is_reachable())
    }
}
