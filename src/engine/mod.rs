//! The echo engine.
//!
//! One worker thread per engine runs a current-thread Tokio runtime and owns
//! the ICMP transport, the request registry and every deadline timer. Callers
//! on any thread or runtime talk to it through a command channel and wait on
//! a per-request oneshot, so each `ping` observes exactly one outcome.

mod registry;

pub use registry::{PendingRequest, Registry};

use crate::config::EngineConfig;
use crate::dns;
use crate::icmp::{self, EngineError, IcmpSocket, Outcome, TOKEN_LEN, Transport};
use anyhow::Context;
use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Every request is a single packet, so the sequence number never moves.
pub const ECHO_SEQUENCE: u16 = 1;

const RECV_BACKOFF_MIN: Duration = Duration::from_millis(10);
const RECV_BACKOFF_MAX: Duration = Duration::from_secs(1);

enum Target {
    Host(String),
    Addr(Ipv4Addr),
}

impl Target {
    /// Runs on the worker's runtime; `dns::resolve_ipv4` needs one.
    async fn resolve(self) -> Result<Ipv4Addr, EngineError> {
        match self {
            Target::Addr(dest) => Ok(dest),
            Target::Host(host) => match dns::resolve_ipv4(&host).await {
                Ok(dest) => Ok(dest),
                Err(e) => {
                    log::debug!("Could not resolve '{}': {:#}", host, e);
                    Err(EngineError::ResolutionFailure(host))
                }
            },
        }
    }
}

/// A resolved request waiting to be registered and sent.
struct Submission {
    dest: Ipv4Addr,
    timeout: Duration,
    reply: oneshot::Sender<Outcome>,
}

enum Command {
    Ping {
        target: Target,
        timeout: Duration,
        reply: oneshot::Sender<Outcome>,
    },
    PendingCount(oneshot::Sender<usize>),
}

/// Handle to a running echo engine.
///
/// Clones share the same worker and socket. The worker shuts down once the
/// last handle is dropped; requests still in flight then resolve to
/// `Error("Engine stopped")`.
#[derive(Clone)]
pub struct EchoEngine {
    commands: mpsc::UnboundedSender<Command>,
}

impl EchoEngine {
    /// Starts an engine over a raw ICMP socket.
    ///
    /// Failing to open the socket does not fail construction: the engine
    /// starts anyway and answers every ping with `Error("Socket not available")`.
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        let socket_config = config.clone();
        Self::with_transport(config, move || IcmpSocket::open(&socket_config))
    }

    /// Starts an engine whose transport is produced by `open` on the worker
    /// thread, inside the worker's runtime.
    pub fn with_transport<T, F>(config: EngineConfig, open: F) -> anyhow::Result<Self>
    where
        T: Transport,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let (commands, receiver) = mpsc::unbounded_channel();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build echo engine runtime")?;

        let buffer_size = config.recv_buffer_size;
        thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                runtime.block_on(async move {
                    match open() {
                        Ok(transport) => Worker::new(transport, buffer_size).run(receiver).await,
                        Err(e) => {
                            log::warn!("ICMP socket unavailable, all pings will fail: {:#}", e);
                            serve_unavailable(receiver).await;
                        }
                    }
                });
                log::debug!("Echo engine worker stopped");
            })
            .context("Failed to spawn echo engine worker")?;

        Ok(Self { commands })
    }

    /// Sends one Echo Request to `host` and waits for its outcome.
    ///
    /// The host is resolved on the worker, so the returned future only
    /// waits on channels and can be driven by any executor.
    pub async fn ping(&self, host: &str, timeout: Duration) -> Outcome {
        self.request(Target::Host(host.to_string()), timeout).await
    }

    /// Same as [`EchoEngine::ping`] for an already resolved address.
    pub async fn ping_addr(&self, dest: Ipv4Addr, timeout: Duration) -> Outcome {
        self.request(Target::Addr(dest), timeout).await
    }

    async fn request(&self, target: Target, timeout: Duration) -> Outcome {
        if timeout.is_zero() {
            return EngineError::InvalidTimeout.into();
        }

        let (reply, outcome) = oneshot::channel();
        if self.commands.send(Command::Ping { target, timeout, reply }).is_err() {
            return EngineError::EngineStopped.into();
        }

        outcome.await.unwrap_or_else(|_| EngineError::EngineStopped.into())
    }

    /// Number of requests currently waiting for a reply or a deadline.
    pub async fn pending_requests(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::PendingCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

async fn serve_unavailable(mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Ping { target, reply, .. } => {
                // A bad hostname is reported as such even without a socket
                tokio::spawn(async move {
                    let outcome = match target.resolve().await {
                        Ok(_) => EngineError::SocketUnavailable.into(),
                        Err(e) => e.into(),
                    };
                    let _ = reply.send(outcome);
                });
            }
            Command::PendingCount(tx) => {
                let _ = tx.send(0);
            }
        }
    }
}

struct Worker<T> {
    transport: T,
    registry: Registry,
    next_ticket: u64,
    expiry_tx: mpsc::UnboundedSender<(u16, u64)>,
    expiries: mpsc::UnboundedReceiver<(u16, u64)>,
    resolved_tx: mpsc::UnboundedSender<Submission>,
    resolved: mpsc::UnboundedReceiver<Submission>,
    buffer: Vec<u8>,
    recv_failures: u32,
    recv_resume: Option<Instant>,
}

impl<T: Transport> Worker<T> {
    fn new(transport: T, buffer_size: usize) -> Self {
        let (expiry_tx, expiries) = mpsc::unbounded_channel();
        let (resolved_tx, resolved) = mpsc::unbounded_channel();
        Self {
            transport,
            registry: Registry::new(),
            next_ticket: 0,
            expiry_tx,
            expiries,
            resolved_tx,
            resolved,
            buffer: vec![0u8; buffer_size],
            recv_failures: 0,
            recv_resume: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Ping { target: Target::Addr(dest), timeout, reply }) => {
                        self.submit(Submission { dest, timeout, reply });
                    }
                    Some(Command::Ping { target, timeout, reply }) => self.resolve_then_submit(target, timeout, reply),
                    Some(Command::PendingCount(tx)) => {
                        let _ = tx.send(self.registry.len());
                    }
                    None => break,
                },
                Some(submission) = self.resolved.recv() => self.submit(submission),
                Some((identifier, ticket)) = self.expiries.recv() => self.expire(identifier, ticket),
                received = self.transport.recv(&mut self.buffer), if self.recv_resume.is_none() => match received {
                    Ok(len) => {
                        self.recv_failures = 0;
                        self.dispatch(len);
                    }
                    Err(e) => self.pause_receiving(e),
                },
                _ = tokio::time::sleep_until(self.recv_resume.unwrap_or_else(Instant::now)), if self.recv_resume.is_some() => {
                    self.recv_resume = None;
                }
            }
        }

        for request in self.registry.drain() {
            request.resolve(EngineError::EngineStopped.into());
        }
    }

    fn resolve_then_submit(&self, target: Target, timeout: Duration, reply: oneshot::Sender<Outcome>) {
        let resolved = self.resolved_tx.clone();
        tokio::spawn(async move {
            match target.resolve().await {
                Ok(dest) => {
                    let _ = resolved.send(Submission { dest, timeout, reply });
                }
                Err(e) => {
                    let _ = reply.send(e.into());
                }
            }
        });
    }

    /// Backs off exponentially while the transport keeps failing.
    fn pause_receiving(&mut self, err: std::io::Error) {
        self.recv_failures = self.recv_failures.saturating_add(1);
        let backoff = RECV_BACKOFF_MIN
            .saturating_mul(1u32 << (self.recv_failures - 1).min(7))
            .min(RECV_BACKOFF_MAX);

        if self.recv_failures == 1 {
            log::warn!("ICMP receive failed: {}", err);
        } else {
            log::debug!("ICMP receive failed {} times in a row: {}", self.recv_failures, err);
        }
        self.recv_resume = Some(Instant::now() + backoff);
    }

    fn submit(&mut self, submission: Submission) {
        let Submission { dest, timeout, reply } = submission;
        let Some(identifier) = self.registry.allocate_identifier(&mut rand::thread_rng()) else {
            let _ = reply.send(EngineError::IdentifiersExhausted.into());
            return;
        };

        let token: [u8; TOKEN_LEN] = rand::random();
        let packet = icmp::build_echo_request(identifier, ECHO_SEQUENCE, token);

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let deadline = self.arm_deadline(identifier, ticket, timeout);
        self.registry
            .insert(PendingRequest::new(identifier, ECHO_SEQUENCE, ticket, reply, deadline));

        if let Err(e) = self.transport.send_to(&packet, dest) {
            log::debug!("Sending echo request {} to {} failed: {}", identifier, dest, e);
            if let Some(request) = self.registry.claim(identifier) {
                request.resolve(EngineError::SendFailure.into());
            }
        }
    }

    fn arm_deadline(&self, identifier: u16, ticket: u64, timeout: Duration) -> AbortHandle {
        let expiries = self.expiry_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = expiries.send((identifier, ticket));
        })
        .abort_handle()
    }

    fn expire(&mut self, identifier: u16, ticket: u64) {
        // Already resolved by a reply when this is None
        if let Some(request) = self.registry.claim_ticket(identifier, ticket) {
            log::debug!("Echo request {} timed out", identifier);
            let sequence = request.sequence;
            request.resolve(Outcome::Timeout { sequence });
        }
    }

    fn dispatch(&mut self, len: usize) {
        let Some(reply) = icmp::parse_inbound_datagram(&self.buffer[..len]) else {
            log::trace!("Ignoring {} byte datagram that is not an echo reply", len);
            return;
        };

        let matches = self
            .registry
            .get(reply.identifier)
            .is_some_and(|request| request.sequence == reply.sequence);
        if !matches {
            log::trace!("Ignoring echo reply from {} with unknown identifier {}", reply.source, reply.identifier);
            return;
        }

        if let Some(request) = self.registry.claim(reply.identifier) {
            let elapsed_ms = request.elapsed_ms();
            log::debug!(
                "Echo reply {} from {}: time={:.3}ms ttl={}",
                reply.identifier,
                reply.source,
                elapsed_ms,
                reply.ttl
            );
            request.resolve(Outcome::Pong {
                sequence: reply.sequence,
                elapsed_ms,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icmp::{EchoPacket, ICMP_ECHO_REPLY, internet_checksum};
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[derive(Clone, Copy)]
    enum Peer {
        Silent,
        Echo(Duration),
        Unreachable,
    }

    /// In-memory stand-in for the raw socket. Echoing peers answer each
    /// request after a delay, preceded by the kind of noise a raw socket sees.
    struct LoopbackTransport {
        peer: Peer,
        sent: Arc<AtomicUsize>,
        inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    impl LoopbackTransport {
        fn new(peer: Peer) -> (Self, Arc<AtomicUsize>) {
            let (inbound_tx, inbound) = mpsc::unbounded_channel();
            let sent = Arc::new(AtomicUsize::new(0));
            let transport = Self {
                peer,
                sent: sent.clone(),
                inbound_tx,
                inbound,
            };
            (transport, sent)
        }
    }

    fn ip_datagram(source: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
        let mut datagram = vec![0x45, 0, 0, 0, 0, 0, 0, 0, 64, protocol, 0, 0];
        datagram.extend_from_slice(&source.octets());
        datagram.extend_from_slice(&[192, 168, 1, 10]);
        datagram.extend_from_slice(payload);
        datagram
    }

    fn echo_reply_for(request: &[u8], source: Ipv4Addr) -> Vec<u8> {
        let mut packet = EchoPacket::from_bytes(request).unwrap();
        packet.icmp_type = ICMP_ECHO_REPLY;
        packet.checksum = 0;
        packet.checksum = internet_checksum(&packet.to_bytes());
        ip_datagram(source, 1, &packet.to_bytes())
    }

    impl Transport for LoopbackTransport {
        fn send_to(&self, packet: &[u8], dest: Ipv4Addr) -> io::Result<usize> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            match self.peer {
                Peer::Silent => Ok(packet.len()),
                Peer::Unreachable => Err(io::Error::new(io::ErrorKind::Other, "network is unreachable")),
                Peer::Echo(delay) => {
                    let reflected = ip_datagram(Ipv4Addr::LOCALHOST, 1, packet);
                    let reply = echo_reply_for(packet, dest);
                    let inbound = self.inbound_tx.clone();
                    let _ = inbound.send(vec![0x45, 0x00, 0x01]);
                    let _ = inbound.send(ip_datagram(dest, 17, &reply[20..]));
                    let _ = inbound.send(reflected);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = inbound.send(reply);
                    });
                    Ok(packet.len())
                }
            }
        }

        async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.inbound.recv().await {
                Some(datagram) => {
                    let len = datagram.len().min(buf.len());
                    buf[..len].copy_from_slice(&datagram[..len]);
                    Ok(len)
                }
                None => std::future::pending().await,
            }
        }
    }

    fn engine(peer: Peer) -> (EchoEngine, Arc<AtomicUsize>) {
        let (transport, sent) = LoopbackTransport::new(peer);
        let engine = EchoEngine::with_transport(EngineConfig::default(), move || Ok(transport)).unwrap();
        (engine, sent)
    }

    #[tokio::test]
    async fn test_reply_resolves_pong() {
        let (engine, sent) = engine(Peer::Echo(Duration::from_millis(5)));

        let outcome = engine.ping("127.0.0.1", Duration::from_secs(1)).await;
        match outcome {
            Outcome::Pong { sequence, elapsed_ms } => {
                assert_eq!(sequence, ECHO_SEQUENCE);
                assert!(elapsed_ms >= 5.0, "elapsed {}", elapsed_ms);
            }
            other => panic!("expected pong, got {:?}", other),
        }
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert_eq!(engine.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_silent_host_times_out() {
        let (engine, sent) = engine(Peer::Silent);
        let timeout = Duration::from_millis(200);

        let started = Instant::now();
        let outcome = engine.ping("10.0.0.1", timeout).await;
        let waited = started.elapsed();

        assert_eq!(outcome, Outcome::Timeout { sequence: 1 });
        assert!(waited >= timeout, "resolved after {:?}", waited);
        assert!(waited < timeout + Duration::from_millis(500), "resolved after {:?}", waited);
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert_eq!(engine.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_hostname_fails_fast() {
        let (engine, sent) = engine(Peer::Silent);

        let started = Instant::now();
        let outcome = engine.ping("256.256.256.256", Duration::from_secs(1)).await;

        assert_eq!(outcome, Outcome::Error("Invalid hostname: 256.256.256.256".to_string()));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_failure_cleans_up() {
        let (engine, sent) = engine(Peer::Unreachable);

        let outcome = engine.ping("10.0.0.1", Duration::from_secs(5)).await;
        assert_eq!(outcome, Outcome::Error("Failed to send ping".to_string()));
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert_eq!(engine.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_socket_unavailable_is_permanent() {
        let engine = EchoEngine::with_transport::<LoopbackTransport, _>(EngineConfig::default(), || {
            Err(anyhow::anyhow!("Operation not permitted"))
        })
        .unwrap();

        for _ in 0..3 {
            let outcome = engine.ping("10.0.0.1", Duration::from_secs(1)).await;
            assert_eq!(outcome, Outcome::Error("Socket not available".to_string()));
        }
    }

    #[tokio::test]
    async fn test_resolution_checked_before_socket() {
        let engine = EchoEngine::with_transport::<LoopbackTransport, _>(EngineConfig::default(), || {
            Err(anyhow::anyhow!("Operation not permitted"))
        })
        .unwrap();

        let outcome = engine.ping("999.1.1.1", Duration::from_secs(1)).await;
        assert_eq!(outcome, Outcome::Error("Invalid hostname: 999.1.1.1".to_string()));
    }

    #[tokio::test]
    async fn test_zero_timeout_rejected() {
        let (engine, sent) = engine(Peer::Silent);

        let outcome = engine.ping("10.0.0.1", Duration::ZERO).await;
        assert_eq!(outcome, Outcome::Error("Timeout must be positive".to_string()));
        assert_eq!(sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_late_reply_is_discarded() {
        let (engine, _sent) = engine(Peer::Echo(Duration::from_millis(300)));

        let outcome = engine.ping("10.0.0.2", Duration::from_millis(100)).await;
        assert_eq!(outcome, Outcome::Timeout { sequence: 1 });

        // Let the stale reply arrive while nothing is waiting for it
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(engine.pending_requests().await, 0);

        let outcome = engine.ping("10.0.0.2", Duration::from_secs(2)).await;
        assert!(outcome.is_pong(), "got {:?}", outcome);
    }

    #[tokio::test]
    async fn test_concurrent_pings_each_resolve_once() {
        let (engine, sent) = engine(Peer::Echo(Duration::from_millis(10)));

        let mut handles = Vec::new();
        for i in 0..64u8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.ping_addr(Ipv4Addr::new(10, 0, 1, i), Duration::from_secs(2)).await
            }));
        }

        for handle in handles {
            let outcome = handle.await.unwrap();
            assert!(outcome.is_pong(), "got {:?}", outcome);
        }
        assert_eq!(sent.load(Ordering::SeqCst), 64);
        assert_eq!(engine.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_mixed_outcomes_do_not_interfere() {
        let (silent, _) = engine(Peer::Silent);
        let (echoing, _) = engine(Peer::Echo(Duration::from_millis(5)));

        let (timeout, pong) = tokio::join!(
            silent.ping("10.0.0.1", Duration::from_millis(100)),
            echoing.ping("10.0.0.1", Duration::from_secs(1)),
        );
        assert_eq!(timeout, Outcome::Timeout { sequence: 1 });
        assert!(pong.is_pong());
    }

    #[test]
    fn test_ping_from_plain_thread_without_runtime() {
        let (engine, _sent) = engine(Peer::Silent);

        let outcomes = thread::spawn(move || {
            futures::executor::block_on(async {
                let by_name = engine.ping("localhost", Duration::from_millis(50)).await;
                let malformed = engine.ping("256.256.256.256", Duration::from_millis(50)).await;
                let numeric = engine.ping("10.0.0.1", Duration::from_millis(50)).await;
                (by_name, malformed, numeric)
            })
        })
        .join()
        .unwrap();

        let (by_name, malformed, numeric) = outcomes;
        // localhost depends on the resolver configuration of the test host
        assert!(
            matches!(&by_name, Outcome::Timeout { sequence: 1 })
                || by_name == Outcome::Error("Invalid hostname: localhost".to_string()),
            "got {:?}",
            by_name
        );
        assert_eq!(malformed, Outcome::Error("Invalid hostname: 256.256.256.256".to_string()));
        assert_eq!(numeric, Outcome::Timeout { sequence: 1 });
    }

    /// A transport whose receive side is permanently broken.
    struct BrokenTransport {
        recv_calls: Arc<AtomicUsize>,
    }

    impl Transport for BrokenTransport {
        fn send_to(&self, packet: &[u8], _dest: Ipv4Addr) -> io::Result<usize> {
            Ok(packet.len())
        }

        async fn recv(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            self.recv_calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::Other, "bad file descriptor"))
        }
    }

    #[tokio::test]
    async fn test_receive_errors_back_off() {
        let recv_calls = Arc::new(AtomicUsize::new(0));
        let transport = BrokenTransport {
            recv_calls: recv_calls.clone(),
        };
        let engine = EchoEngine::with_transport(EngineConfig::default(), move || Ok(transport)).unwrap();

        let outcome = engine.ping_addr(Ipv4Addr::new(10, 0, 0, 1), Duration::from_millis(300)).await;
        assert_eq!(outcome, Outcome::Timeout { sequence: 1 });
        assert_eq!(engine.pending_requests().await, 0);

        // 10, 20, 40, 80, 160ms pauses fit about six attempts into 300ms
        let calls = recv_calls.load(Ordering::SeqCst);
        assert!(calls >= 1 && calls < 20, "recv called {} times", calls);
    }
}
