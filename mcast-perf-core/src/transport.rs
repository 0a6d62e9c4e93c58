use anyhow::{Context, Result};
use mio::net::UdpSocket;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use tracing::{info, warn};

use crate::config::GroupEndpoint;
use crate::transmitter::DatagramSink;

fn new_udp_socket() -> Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("Failed to create UDP socket")?;
    socket
        .set_reuse_address(true)
        .context("Failed to set SO_REUSEADDR")?;
    Ok(socket)
}

/// Apply a socket buffer request and report what the kernel actually granted.
///
/// A shortfall is only warned about: the run proceeds with the smaller buffer.
fn request_buffer(
    name: &str,
    requested: usize,
    set: impl FnOnce(usize) -> io::Result<()>,
    get: impl FnOnce() -> io::Result<usize>,
) -> Result<usize> {
    if requested > 0 {
        set(requested).with_context(|| format!("Failed to set {} to {}", name, requested))?;
    }
    let granted = get().with_context(|| format!("Failed to read back {}", name))?;
    if granted < requested {
        warn!(
            "Tried to set {} to {}, only got {}",
            name, requested, granted
        );
    }
    Ok(granted)
}

/// Open the collector's socket: bound to the group port, joined on the
/// configured interface, non-blocking and ready to register with a poller.
pub fn open_receiver(endpoint: &GroupEndpoint, rcvbuf_size: usize) -> Result<UdpSocket> {
    let socket = new_udp_socket()?;

    let granted = request_buffer(
        "SO_RCVBUF",
        rcvbuf_size,
        |size| socket.set_recv_buffer_size(size),
        || socket.recv_buffer_size(),
    )?;

    let addr = SocketAddrV4::new(endpoint.group, endpoint.port);
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind {}", addr))?;

    socket
        .join_multicast_v4(&endpoint.group, &endpoint.interface)
        .with_context(|| {
            format!(
                "Failed to join {} on interface {}",
                endpoint.group, endpoint.interface
            )
        })?;

    socket
        .set_nonblocking(true)
        .context("Failed to make socket non-blocking")?;

    info!(
        "Joined {}:{} on {} (SO_RCVBUF={})",
        endpoint.group, endpoint.port, endpoint.interface, granted
    );
    Ok(UdpSocket::from_std(socket.into()))
}

/// Socket-backed sink aimed at one multicast group
pub struct MulticastSender {
    socket: Socket,
    dest: SockAddr,
}

impl MulticastSender {
    pub fn dest_addr(&self) -> Option<SocketAddr> {
        self.dest.as_socket()
    }
}

impl DatagramSink for MulticastSender {
    fn send_datagram(&mut self, payload: &[u8]) -> io::Result<()> {
        let sent = self.socket.send_to(payload, &self.dest)?;
        if sent != payload.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short send: {} of {} bytes", sent, payload.len()),
            ));
        }
        Ok(())
    }
}

/// Open the transmitter's socket, sending out of the configured interface
pub fn open_sender(endpoint: &GroupEndpoint, sndbuf_size: usize) -> Result<MulticastSender> {
    let socket = new_udp_socket()?;

    let granted = request_buffer(
        "SO_SNDBUF",
        sndbuf_size,
        |size| socket.set_send_buffer_size(size),
        || socket.send_buffer_size(),
    )?;

    socket
        .set_multicast_if_v4(&endpoint.interface)
        .with_context(|| format!("Failed to set IP_MULTICAST_IF to {}", endpoint.interface))?;

    let dest = SocketAddrV4::new(endpoint.group, endpoint.port);
    info!(
        "Sending to {} via {} (SO_SNDBUF={})",
        dest, endpoint.interface, granted
    );

    Ok(MulticastSender {
        socket,
        dest: dest.into(),
    })
}
