// twin-linux: host-side peer for the inter-controller link, served over TCP.

mod config;
mod transport;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use twin_core::config::LinkConfig;
use twin_core::{EventId, Link, LinkError, PeerEvent, Responder, TransportError};

use crate::transport::TcpTransport;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("twin-linux {} (protocol v{})", VERSION, twin_core::PROTOCOL_VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load()?;
    let listen: SocketAddr = cfg
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {:?}", cfg.listen))?;

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(listen, cfg.link));
    // Connection threads poll the stop flag every poll interval.
    rt.shutdown_timeout(Duration::from_secs(2));
    result
}

async fn run(listen: SocketAddr, link: LinkConfig) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    tracing::info!(addr = %listener.local_addr()?, "waiting for controller link");

    let stop = Arc::new(AtomicBool::new(false));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(x) => x,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let stream = stream.into_std()?;
                let link = link.clone();
                let stop = stop.clone();
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = serve_connection(stream, peer, &link, &stop) {
                        tracing::warn!(%peer, error = %e, "link session ended with error");
                    }
                });
            }
            res = &mut shutdown => {
                res?;
                tracing::info!("shutting down");
                break;
            }
        }
    }
    stop.store(true, Ordering::Relaxed);
    Ok(())
}

/// Serve one controller until it disconnects or shutdown is requested.
fn serve_connection(
    stream: std::net::TcpStream,
    peer: SocketAddr,
    cfg: &LinkConfig,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    tracing::info!(%peer, "controller connected");
    let transport = TcpTransport::new(stream).context("configuring socket")?;
    let mut responder = Responder::new(Link::new(transport).with_poll_interval(cfg.poll_interval_ms));

    while !stop.load(Ordering::Relaxed) {
        match responder.serve_once(cfg.poll_interval_ms) {
            Ok(None) => {}
            Ok(Some(PeerEvent::Command { command, sequence, args })) => {
                tracing::info!(%peer, ?command, sequence, args = args.len(), "command");
            }
            Ok(Some(PeerEvent::Event { id, sequence, data })) => match EventId::from_u32(id) {
                Some(event) => tracing::info!(%peer, ?event, sequence, data = data.len(), "event"),
                None => tracing::warn!(%peer, id, sequence, "unassigned event id"),
            },
            Ok(Some(PeerEvent::Data { channel, bytes })) => {
                tracing::debug!(%peer, channel, len = bytes.len(), "stream chunk");
            }
            Ok(Some(PeerEvent::Rejected { sequence, opcode })) => {
                tracing::warn!(%peer, sequence, opcode, "rejected unknown command");
            }
            Ok(Some(PeerEvent::Ignored { packet_type, sequence })) => {
                tracing::debug!(%peer, ?packet_type, sequence, "ignored");
            }
            Err(LinkError::Transport(TransportError::Closed)) => break,
            Err(e) => return Err(e.into()),
        }
    }
    tracing::info!(%peer, packets = responder.packets_seen(), "controller disconnected");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
