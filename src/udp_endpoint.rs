//! Direct UDP endpoint with full-cone or symmetric NAT behavior.
//!
//! In full-cone mode every datagram goes through the one bound socket and any
//! peer may reach us through it.
//!
//! In symmetric mode each distinct peer gets its own socket. The first peer
//! borrows the primary socket; later peers get freshly bound ephemeral
//! sockets. Every peer socket has a read loop that only accepts datagrams from
//! its own peer and pushes them into a bounded fan-in queue, which is what
//! `read_message` drains. A read loop that idles past the peer timeout, or
//! fails, removes its own table entry and drops its socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::address::{Addr, AddrKey, Network};
use crate::buffer_pool::BufferPool;
use crate::endpoint::{
    AddrData, MessageEndpoint, closed_error, is_timeout, with_idle_timeout,
};
use crate::resolver::{NativeResolver, Resolver, ResolverCache};
use crate::socket_util::{ephemeral_bind_addr, new_udp_socket};

/// Full-cone sockets must outlive individual flows.
pub const DEFAULT_FULL_CONE_TIMEOUT: Duration = Duration::from_secs(600);

// Informed by https://stackoverflow.com/questions/14856639/udp-hole-punching-timeout
pub const DEFAULT_SYMMETRIC_TIMEOUT: Duration = Duration::from_secs(200);

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatMode {
    FullCone,
    Symmetric,
}

#[derive(Clone)]
pub struct UdpEndpointOptions {
    /// Idle deadline of `read_message`.
    pub idle_timeout: Duration,
    /// Idle deadline of each symmetric peer socket.
    pub peer_idle_timeout: Duration,
    /// Capacity of the symmetric fan-in queue.
    pub queue_capacity: usize,
    pub bind_interface: Option<String>,
    pub resolver: Arc<dyn Resolver>,
    pub pool: Arc<BufferPool>,
}

impl Default for UdpEndpointOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_FULL_CONE_TIMEOUT,
            peer_idle_timeout: DEFAULT_SYMMETRIC_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            bind_interface: None,
            resolver: Arc::new(NativeResolver::new()),
            pool: BufferPool::global().clone(),
        }
    }
}

pub struct UdpEndpoint {
    primary: Arc<UdpSocket>,
    local_addr: SocketAddr,
    idle_timeout: Duration,
    resolver_cache: ResolverCache,
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
    mode: Mode,
}

enum Mode {
    FullCone,
    Symmetric(SymmetricState),
}

struct SymmetricState {
    peers: Arc<Mutex<PeerTable>>,
    sender: mpsc::Sender<(u64, AddrData)>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<(u64, AddrData)>>,
    // Checked by read loops before queueing, so nothing is pushed once close() started.
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    tracker: TaskTracker,
    peer_idle_timeout: Duration,
    bind_interface: Option<String>,
}

#[derive(Default)]
struct PeerTable {
    entries: FxHashMap<AddrKey, PeerSocket>,
    primary_in_use: bool,
}

impl PeerTable {
    fn is_live(&self, key: &AddrKey, id: u64) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.id == id)
    }

    /// Removes the entry for `key`, but only if it is still generation `id`.
    fn remove_if(&mut self, key: &AddrKey, id: u64) -> bool {
        if !self.is_live(key, id) {
            return false;
        }
        if let Some(entry) = self.entries.remove(key) {
            entry.release(self);
        }
        true
    }
}

struct PeerSocket {
    id: u64,
    socket: Arc<UdpSocket>,
    is_primary: bool,
    cancel: CancellationToken,
}

impl PeerSocket {
    fn release(self, table: &mut PeerTable) {
        if self.is_primary {
            table.primary_in_use = false;
        }
        self.cancel.cancel();
    }
}

impl UdpEndpoint {
    pub fn full_cone(socket: UdpSocket, options: UdpEndpointOptions) -> std::io::Result<Self> {
        Self::new(socket, NatMode::FullCone, options)
    }

    pub fn symmetric(socket: UdpSocket, options: UdpEndpointOptions) -> std::io::Result<Self> {
        Self::new(socket, NatMode::Symmetric, options)
    }

    pub fn bind(
        bind_addr: SocketAddr,
        mode: NatMode,
        options: UdpEndpointOptions,
    ) -> std::io::Result<Self> {
        let socket = new_udp_socket(bind_addr, options.bind_interface.as_deref())?;
        Self::new(socket, mode, options)
    }

    pub fn new(
        socket: UdpSocket,
        mode: NatMode,
        options: UdpEndpointOptions,
    ) -> std::io::Result<Self> {
        let local_addr = socket.local_addr()?;
        let UdpEndpointOptions {
            idle_timeout,
            peer_idle_timeout,
            queue_capacity,
            bind_interface,
            resolver,
            pool,
        } = options;

        let mode = match mode {
            NatMode::FullCone => Mode::FullCone,
            NatMode::Symmetric => {
                let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
                Mode::Symmetric(SymmetricState {
                    peers: Arc::new(Mutex::new(PeerTable::default())),
                    sender,
                    receiver: tokio::sync::Mutex::new(receiver),
                    closed: Arc::new(AtomicBool::new(false)),
                    next_id: AtomicU64::new(0),
                    tracker: TaskTracker::new(),
                    peer_idle_timeout,
                    bind_interface,
                })
            }
        };

        debug!(
            "[UdpEndpoint {}] created in {} mode",
            local_addr,
            if matches!(mode, Mode::FullCone) {
                "full-cone"
            } else {
                "symmetric"
            }
        );

        Ok(Self {
            primary: Arc::new(socket),
            local_addr,
            idle_timeout,
            resolver_cache: ResolverCache::new(resolver),
            pool,
            cancel: CancellationToken::new(),
            mode,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live symmetric peer mappings. Always 0 in full-cone mode.
    pub fn peer_count(&self) -> usize {
        match &self.mode {
            Mode::FullCone => 0,
            Mode::Symmetric(state) => state.peers.lock().entries.len(),
        }
    }

    /// The local address of the socket mapped to `peer`, if any.
    pub fn mapped_addr(&self, peer: &SocketAddr) -> Option<SocketAddr> {
        let Mode::Symmetric(state) = &self.mode else {
            return Some(self.local_addr);
        };
        let key = AddrKey::from_socket_addr(*peer, Network::Udp);
        let peers = state.peers.lock();
        peers
            .entries
            .get(&key)
            .and_then(|entry| entry.socket.local_addr().ok())
    }

    async fn resolve(&self, peer: &Addr) -> std::io::Result<SocketAddr> {
        self.resolver_cache.resolve(peer.location()).await
    }

    async fn read_full_cone(&self) -> std::io::Result<AddrData> {
        let mut buf = self.pool.acquire();
        let (n, from) = tokio::select! {
            _ = self.cancel.cancelled() => return Err(closed_error()),
            result = with_idle_timeout(
                "full-cone socket",
                self.idle_timeout,
                self.primary.recv_from(buf.spare_mut()),
            ) => result?,
        };
        buf.set_len(n);
        Ok(AddrData::new(buf, Addr::from_socket_addr(from, Network::Udp)))
    }

    async fn read_symmetric(&self, state: &SymmetricState) -> std::io::Result<AddrData> {
        let mut receiver = tokio::select! {
            _ = self.cancel.cancelled() => return Err(closed_error()),
            receiver = state.receiver.lock() => receiver,
        };
        loop {
            let (id, data) = tokio::select! {
                _ = self.cancel.cancelled() => return Err(closed_error()),
                result = with_idle_timeout("symmetric endpoint", self.idle_timeout, async {
                    receiver.recv().await.ok_or_else(closed_error)
                }) => result?,
            };

            // The sending loop may have been torn down while this datagram sat in the queue.
            let key = data.addr.key()?;
            if state.peers.lock().is_live(&key, id) {
                return Ok(data);
            }
            debug!(
                "[UdpEndpoint {}] dropping datagram from removed mapping {}",
                self.local_addr, data.addr
            );
        }
    }

    /// Finds or creates the socket mapped to `target`.
    fn peer_socket(
        &self,
        state: &SymmetricState,
        target: SocketAddr,
    ) -> std::io::Result<Arc<UdpSocket>> {
        if state.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }

        let key = AddrKey::from_socket_addr(target, Network::Udp);
        let mut peers = state.peers.lock();
        if let Some(entry) = peers.entries.get(&key) {
            return Ok(entry.socket.clone());
        }

        let (socket, is_primary) = if peers.primary_in_use {
            let bind_addr = ephemeral_bind_addr(&target, Some(&self.local_addr));
            let socket = new_udp_socket(bind_addr, state.bind_interface.as_deref())?;
            (Arc::new(socket), false)
        } else {
            (self.primary.clone(), true)
        };

        let id = state.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        if is_primary {
            peers.primary_in_use = true;
        }
        peers.entries.insert(
            key,
            PeerSocket {
                id,
                socket: socket.clone(),
                is_primary,
                cancel: cancel.clone(),
            },
        );

        debug!(
            "[UdpEndpoint {}] mapped {} to {}",
            self.local_addr,
            target,
            socket
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_string())
        );

        state.tracker.spawn(peer_read_loop(PeerReadLoop {
            socket: socket.clone(),
            peer: target,
            key,
            id,
            peers: state.peers.clone(),
            sender: state.sender.clone(),
            closed: state.closed.clone(),
            cancel,
            idle_timeout: state.peer_idle_timeout,
            pool: self.pool.clone(),
        }));

        Ok(socket)
    }
}

struct PeerReadLoop {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    key: AddrKey,
    id: u64,
    peers: Arc<Mutex<PeerTable>>,
    sender: mpsc::Sender<(u64, AddrData)>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
    idle_timeout: Duration,
    pool: Arc<BufferPool>,
}

async fn peer_read_loop(state: PeerReadLoop) {
    let PeerReadLoop {
        socket,
        peer,
        key,
        id,
        peers,
        sender,
        closed,
        cancel,
        idle_timeout,
        pool,
    } = state;

    loop {
        let mut buf = pool.acquire();
        // A cancelled loop must not take datagrams meant for the socket's next owner.
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = with_idle_timeout(
                "symmetric peer socket",
                idle_timeout,
                socket.recv_from(buf.spare_mut()),
            ) => result,
        };

        let (n, from) = match result {
            Ok(r) => r,
            Err(e) => {
                if is_timeout(&e) {
                    debug!("[UdpEndpoint] mapping for {peer} idle, removing");
                } else {
                    debug!("[UdpEndpoint] mapping for {peer} failed: {e}");
                }
                break;
            }
        };

        if AddrKey::from_socket_addr(from, Network::Udp) != key {
            debug!("[UdpEndpoint] dropping datagram from {from}, mapping is restricted to {peer}");
            continue;
        }

        buf.set_len(n);
        if closed.load(Ordering::Acquire) {
            break;
        }
        let data = AddrData::new(buf, Addr::from_socket_addr(from, Network::Udp));
        let sent = tokio::select! {
            _ = cancel.cancelled() => false,
            result = sender.send((id, data)) => result.is_ok(),
        };
        if !sent {
            break;
        }
    }

    peers.lock().remove_if(&key, id);
}

#[async_trait]
impl MessageEndpoint for UdpEndpoint {
    async fn read_message(&self) -> std::io::Result<AddrData> {
        match &self.mode {
            Mode::FullCone => self.read_full_cone().await,
            Mode::Symmetric(state) => self.read_symmetric(state).await,
        }
    }

    async fn write_message(&self, data: &[u8], peer: &Addr) -> std::io::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(closed_error());
        }
        let target = self.resolve(peer).await?;
        let socket = match &self.mode {
            Mode::FullCone => self.primary.clone(),
            Mode::Symmetric(state) => self.peer_socket(state, target)?,
        };
        let n = socket.send_to(data, target).await?;
        if n != data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("partial datagram send to {target} ({n} of {} bytes)", data.len()),
            ));
        }
        Ok(())
    }

    async fn close_with_peer(&self, peer: &Addr) -> std::io::Result<()> {
        let Mode::Symmetric(state) = &self.mode else {
            return Ok(());
        };
        let target = self.resolve(peer).await?;
        let key = AddrKey::from_socket_addr(target, Network::Udp);
        let mut peers = state.peers.lock();
        if let Some(entry) = peers.entries.remove(&key) {
            debug!("[UdpEndpoint {}] closing mapping for {}", self.local_addr, target);
            entry.release(&mut peers);
        }
        Ok(())
    }

    async fn close(&self) -> std::io::Result<()> {
        self.cancel.cancel();
        if let Mode::Symmetric(state) = &self.mode {
            state.closed.store(true, Ordering::Release);
            {
                let mut peers = state.peers.lock();
                let entries: Vec<PeerSocket> =
                    peers.entries.drain().map(|(_, entry)| entry).collect();
                for entry in entries {
                    entry.release(&mut peers);
                }
            }
            state.tracker.close();
            state.tracker.wait().await;
            state.receiver.lock().await.close();
        }
        Ok(())
    }

    fn is_full_cone(&self) -> bool {
        matches!(self.mode, Mode::FullCone)
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Mode::Symmetric(state) = &self.mode {
            state.closed.store(true, Ordering::Release);
        }
    }
}
