use crate::config::EngineConfig;
use anyhow::Context;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::future::Future;
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddrV4};
use tokio::io::unix::AsyncFd;

/// Datagram carrier the echo engine sends requests over and reads replies from.
///
/// Implementations are driven from the engine's worker thread only, so they
/// need to be `Send` but not `Sync`. `recv` must be cancel safe: the engine
/// polls it inside `select!` and drops it whenever another event wins.
pub trait Transport: Send + 'static {
    fn send_to(&self, packet: &[u8], dest: Ipv4Addr) -> io::Result<usize>;

    /// Reads one inbound datagram, IPv4 header included.
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>>;
}

/// Raw IPv4 ICMP socket registered with the worker's Tokio reactor.
pub struct IcmpSocket {
    inner: AsyncFd<Socket>,
}

impl IcmpSocket {
    /// Opens the socket. Must run inside a Tokio runtime.
    pub fn open(config: &EngineConfig) -> anyhow::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
            .map_err(|e| anyhow::anyhow!("Failed to create raw socket: {}. Root or CAP_NET_RAW may be required.", e))?;

        socket.set_nonblocking(true)?;

        if let Some(ttl) = config.ttl {
            socket
                .set_ttl(ttl)
                .map_err(|e| anyhow::anyhow!("Failed to set IPv4 TTL: {}", e))?;
        }

        let inner = AsyncFd::new(socket).context("Failed to register ICMP socket with the runtime")?;
        Ok(Self { inner })
    }
}

impl Transport for IcmpSocket {
    fn send_to(&self, packet: &[u8], dest: Ipv4Addr) -> io::Result<usize> {
        let target = SockAddr::from(SocketAddrV4::new(dest, 0));
        log::debug!("Sending ICMP packet to {}: {} bytes", dest, packet.len());
        self.inner.get_ref().send_to(packet, &target)
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}
