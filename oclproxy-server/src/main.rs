// Entry point (SPEC_FULL.md §2, §6; original_source/src/server/ocland.c's
// `main`). Binds the two listeners spec.md §6 calls for, pairs accepted
// connections by arrival order, and hands each pair to
// `dispatcher::run_client_session` on its own thread.
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

use oclproxy_server::config::{self, ParsedArgs};
use oclproxy_server::{run_client_session, FakeDevice, LocalDevice};

fn init_tracing(log_file: Option<&std::path::Path>) -> Result<()> {
    use tracing_subscriber::fmt;
    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            fmt().with_writer(move || file.try_clone().expect("clone log file handle")).init();
        }
        None => fmt().with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let parsed = config::parse_args(args).map_err(|e| anyhow::anyhow!(e))?;

    let config = match parsed {
        ParsedArgs::ShowHelp => {
            print!("{}", config::usage());
            return Ok(());
        }
        ParsedArgs::ShowVersion => {
            println!("{}", config::version_string());
            return Ok(());
        }
        ParsedArgs::Run(config) => config,
    };

    init_tracing(config.log_file.as_deref())?;

    let command_addr = format!("0.0.0.0:{}", config.base_port);
    let callbacks_addr = format!("0.0.0.0:{}", config.base_port + 1);
    let command_listener = TcpListener::bind(&command_addr)
        .with_context(|| format!("binding command channel on {command_addr}"))?;
    let callbacks_listener = TcpListener::bind(&callbacks_addr)
        .with_context(|| format!("binding callbacks channel on {callbacks_addr}"))?;

    tracing::info!(
        command = %command_addr,
        callbacks = %callbacks_addr,
        max_clients = config.max_clients,
        "oclproxyd listening"
    );

    // Production builds would resolve `LocalDevice` to the real ICD via FFI
    // (see local_device.rs); this binary runs against the in-memory stand-in
    // so the whole accept/dispatch loop is exercisable without hardware.
    let device: Arc<dyn LocalDevice> = Arc::new(FakeDevice::new());
    let compressor: Arc<dyn oclproxy_common::Compressor> = Arc::new(oclproxy_common::Identity);
    let active_clients = Arc::new(AtomicUsize::new(0));

    loop {
        // Pairing by accept order mirrors the original's two-listener
        // scheme (spec.md §6): a client always opens its command
        // connection first, then its callbacks connection, so accepting
        // one from each listener in lockstep keeps them paired correctly
        // even across multiple concurrent clients.
        let (command_stream, command_peer) = command_listener
            .accept()
            .context("accepting command connection")?;
        let (callbacks_stream, _callbacks_peer) = callbacks_listener
            .accept()
            .context("accepting callbacks connection")?;

        if active_clients.load(Ordering::SeqCst) >= config.max_clients {
            tracing::warn!(peer = %command_peer, "refusing connection: max_clients reached");
            drop(command_stream);
            drop(callbacks_stream);
            continue;
        }

        let peer = command_peer.to_string();
        let device = device.clone();
        let compressor = compressor.clone();
        let active_clients = active_clients.clone();
        active_clients.fetch_add(1, Ordering::SeqCst);

        std::thread::Builder::new()
            .name(format!("oclproxy-client-{peer}"))
            .spawn(move || {
                if let Err(e) = run_client_session(command_stream, callbacks_stream, peer.clone(), device, compressor) {
                    tracing::warn!(client = %peer, error = %e, "client session ended with error");
                }
                active_clients.fetch_sub(1, Ordering::SeqCst);
            })
            .expect("spawn client session thread");
    }
}
