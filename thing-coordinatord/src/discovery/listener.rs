use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use shared::tweet::{self, Tweet};
use crate::config::DiscoveryConfig;

/// An announcement worth merging, tagged with the address it came from
#[derive(Debug)]
pub enum DiscoveryEvent {
    Announced { tweet: Tweet, source: IpAddr },
}

/// Bind the announcement port and join the multicast group.
/// Failing here is fatal: without the socket there is no discovery.
pub fn bind(config: &DiscoveryConfig) -> Result<UdpSocket> {
    let socket = bind_shared(config.port)?;

    socket
        .join_multicast_v4(config.group, config.interface)
        .with_context(|| {
            format!("Failed to join multicast group {} on {}", config.group, config.interface)
        })?;

    tracing::info!(
        "Joined announcement group {}:{} on {}",
        config.group,
        config.port,
        config.interface
    );
    Ok(socket)
}

/// UDP socket on `port` with `SO_REUSEADDR`, so other receivers on this
/// host can listen to the same announcements.
fn bind_shared(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("Failed to create discovery socket")?;
    socket
        .set_reuse_address(true)
        .context("Failed to set SO_REUSEADDR on discovery socket")?;
    socket
        .set_nonblocking(true)
        .context("Failed to make discovery socket non-blocking")?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind discovery port {}", port))?;

    UdpSocket::from_std(socket.into()).context("Failed to register discovery socket")
}

/// Receive announcements until cancelled.
///
/// Per-packet problems (bad encoding, bad JSON, unknown tweet types) are
/// logged and the packet is dropped; the loop itself only ends on cancel.
pub async fn run_listener(
    socket: UdpSocket,
    buffer_size: usize,
    tx: mpsc::Sender<DiscoveryEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!("Starting announcement listener");

    let mut buf = vec![0u8; buffer_size.max(1)];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, from)) => {
                        match tweet::decode(&buf[..len]) {
                            Ok(Tweet::Unrecognized(kind)) => {
                                tracing::debug!("Ignoring {} announcement from {}", kind, from);
                            }
                            Ok(tweet) => {
                                tracing::debug!("Received {} from {}", tweet.kind(), from);
                                let event = DiscoveryEvent::Announced { tweet, source: from.ip() };
                                if let Err(e) = tx.send(event).await {
                                    tracing::error!("Failed to forward announcement: {}", e);
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Dropping announcement from {}: {}", from, e);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Error receiving announcement: {}", e);
                    }
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("Announcement listener shutting down");
                break;
            }
        }
    }

    Ok(())
}
