//! Relaying each local peer over its own lazily dialed remote endpoint.
//!
//! The main loop reads the local endpoint, looks up the peer's remote
//! endpoint and forwards the datagram. A peer seen for the first time gets a
//! pending slot and a dial task, so a slow dial never holds up other peers.
//! Datagrams arriving for a peer while its dial is in flight wait in the slot
//! and are flushed in order once the dial completes. Every dialed endpoint
//! gets a reverse pump task that copies replies back to the local endpoint.
//!
//! Locking: the peer table is guarded by a sync mutex that is never held
//! across an await, and writes to the shared local endpoint are serialized by
//! an async mutex. The table lock is never held while waiting for the write
//! lock.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::address::{Addr, AddrKey};
use crate::endpoint::{AddrData, SharedEndpoint, is_closed, is_timeout};
use crate::relay::dial_backoff::DialBackoff;
use crate::traffic_stats::TrafficStats;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Datagrams held per peer while its dial is in flight. Later ones are dropped.
pub const MAX_PENDING_DATAGRAMS: usize = 32;

/// Produces the remote endpoint for a newly seen local peer.
#[async_trait]
pub trait PeerDialer: Send + Sync {
    async fn dial(&self, peer: &Addr) -> std::io::Result<SharedEndpoint>;
}

#[async_trait]
impl<F, Fut> PeerDialer for F
where
    F: Fn(Addr) -> Fut + Send + Sync,
    Fut: Future<Output = std::io::Result<SharedEndpoint>> + Send + 'static,
{
    async fn dial(&self, peer: &Addr) -> std::io::Result<SharedEndpoint> {
        self(peer.clone()).await
    }
}

/// Which address replies are tagged with when written to the local endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplyAddress {
    /// The address the remote endpoint reported the reply came from.
    #[default]
    Source,
    /// The local peer the remote endpoint was dialed for.
    Peer,
}

struct PeerEntry {
    id: u64,
    endpoint: SharedEndpoint,
    cancel: CancellationToken,
}

enum PeerSlot {
    Dialing { id: u64, pending: Vec<AddrData> },
    Ready(PeerEntry),
}

impl PeerSlot {
    fn id(&self) -> u64 {
        match self {
            PeerSlot::Dialing { id, .. } => *id,
            PeerSlot::Ready(entry) => entry.id,
        }
    }
}

struct Shared {
    local: SharedEndpoint,
    peers: Mutex<FxHashMap<AddrKey, PeerSlot>>,
    local_write_lock: tokio::sync::Mutex<()>,
    stats: Arc<TrafficStats>,
    cancel: CancellationToken,
}

impl Shared {
    /// Removes `key` if it still belongs to generation `id`.
    fn remove_if(&self, key: &AddrKey, id: u64) -> Option<PeerSlot> {
        let mut peers = self.peers.lock();
        if peers.get(key).is_some_and(|slot| slot.id() == id) {
            peers.remove(key)
        } else {
            None
        }
    }
}

enum Route {
    Send(u64, SharedEndpoint),
    Dial,
}

pub struct SeparateChannelRelay {
    shared: Arc<Shared>,
    dialer: Arc<dyn PeerDialer>,
    backoff: Arc<Mutex<DialBackoff>>,
    dial_timeout: Duration,
    reply_address: ReplyAddress,
    next_id: AtomicU64,
    tracker: TaskTracker,
}

impl SeparateChannelRelay {
    pub fn new(
        local: SharedEndpoint,
        dialer: Arc<dyn PeerDialer>,
        stats: Arc<TrafficStats>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                local,
                peers: Mutex::new(FxHashMap::default()),
                local_write_lock: tokio::sync::Mutex::new(()),
                stats,
                cancel: CancellationToken::new(),
            }),
            dialer,
            backoff: Arc::new(Mutex::new(DialBackoff::default())),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            reply_address: ReplyAddress::default(),
            next_id: AtomicU64::new(0),
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_reply_address(mut self, reply_address: ReplyAddress) -> Self {
        self.reply_address = reply_address;
        self
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: DialBackoff) -> Self {
        self.backoff = Arc::new(Mutex::new(backoff));
        self
    }

    /// Number of peers with a live remote endpoint. Peers still being dialed
    /// are not counted.
    pub fn peer_count(&self) -> usize {
        self.shared
            .peers
            .lock()
            .values()
            .filter(|slot| matches!(slot, PeerSlot::Ready(_)))
            .count()
    }

    /// Runs until the local endpoint fails or [`shutdown`](Self::shutdown) is
    /// called, then tears everything down.
    ///
    /// Returns the local endpoint's error, or `Ok(())` after a shutdown.
    pub async fn run(&self) -> std::io::Result<()> {
        let result = self.run_loop().await;
        self.teardown().await;
        result
    }

    /// Stops the relay, closing every remote endpoint and then the local one.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.teardown().await;
    }

    async fn run_loop(&self) -> std::io::Result<()> {
        let shared = &self.shared;
        loop {
            let data = tokio::select! {
                _ = shared.cancel.cancelled() => return Ok(()),
                result = shared.local.read_message() => match result {
                    Ok(data) => data,
                    Err(e) => {
                        if shared.cancel.is_cancelled() {
                            return Ok(());
                        }
                        if is_timeout(&e) || is_closed(&e) {
                            debug!("[SeparateRelay] local endpoint finished: {e}");
                        } else {
                            error!("[SeparateRelay] local endpoint failed: {e}");
                        }
                        return Err(e);
                    }
                },
            };

            let key = match data.addr.key() {
                Ok(key) => key,
                Err(e) => {
                    debug!("[SeparateRelay] dropping datagram: {e}");
                    continue;
                }
            };

            let route = {
                let mut peers = shared.peers.lock();
                match peers.get_mut(&key) {
                    Some(PeerSlot::Ready(entry)) => Route::Send(entry.id, entry.endpoint.clone()),
                    Some(PeerSlot::Dialing { pending, .. }) => {
                        if pending.len() < MAX_PENDING_DATAGRAMS {
                            pending.push(data);
                        } else {
                            debug!(
                                "[SeparateRelay] dropping datagram for {}, dial still pending",
                                data.addr
                            );
                        }
                        continue;
                    }
                    None => Route::Dial,
                }
            };

            let (id, endpoint) = match route {
                Route::Send(id, endpoint) => (id, endpoint),
                Route::Dial => {
                    self.start_dial(key, data);
                    continue;
                }
            };

            let n = data.len();
            let write_result = tokio::select! {
                _ = shared.cancel.cancelled() => return Ok(()),
                result = endpoint.write_message(&data.data, &data.addr) => result,
            };
            match write_result {
                Ok(()) => shared.stats.add_upload(n),
                Err(e) => {
                    debug!("[SeparateRelay] remote write for {} failed: {e}", data.addr);
                    if let Some(PeerSlot::Ready(entry)) = shared.remove_if(&key, id) {
                        close_remote(&data.addr, entry).await;
                    }
                }
            }
        }
    }

    /// Parks `first` in a new pending slot for `key` and dials in the background.
    fn start_dial(&self, key: AddrKey, first: AddrData) {
        if let Err(e) = self.backoff.lock().check(&key) {
            debug!("[SeparateRelay] dropping datagram for {}: {e}", first.addr);
            return;
        }

        let peer = first.addr.clone();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.peers.lock().insert(
            key,
            PeerSlot::Dialing {
                id,
                pending: vec![first],
            },
        );

        self.tracker.spawn(dial_peer(DialTask {
            shared: self.shared.clone(),
            dialer: self.dialer.clone(),
            backoff: self.backoff.clone(),
            dial_timeout: self.dial_timeout,
            reply_address: self.reply_address,
            tracker: self.tracker.clone(),
            key,
            id,
            peer,
        }));
    }

    async fn teardown(&self) {
        let shared = &self.shared;
        shared.cancel.cancel();

        let slots: Vec<PeerSlot> = shared.peers.lock().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let PeerSlot::Ready(entry) = slot {
                entry.cancel.cancel();
                if let Err(e) = entry.endpoint.close().await {
                    debug!("[SeparateRelay] failed to close remote endpoint: {e}");
                }
            }
        }
        if let Err(e) = shared.local.close().await {
            debug!("[SeparateRelay] failed to close local endpoint: {e}");
        }

        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn close_remote(peer: &Addr, entry: PeerEntry) {
    entry.cancel.cancel();
    if let Err(e) = entry.endpoint.close().await {
        debug!("[SeparateRelay] failed to close remote for {peer}: {e}");
    }
}

struct DialTask {
    shared: Arc<Shared>,
    dialer: Arc<dyn PeerDialer>,
    backoff: Arc<Mutex<DialBackoff>>,
    dial_timeout: Duration,
    reply_address: ReplyAddress,
    tracker: TaskTracker,
    key: AddrKey,
    id: u64,
    peer: Addr,
}

async fn dial_peer(task: DialTask) {
    let DialTask {
        shared,
        dialer,
        backoff,
        dial_timeout,
        reply_address,
        tracker,
        key,
        id,
        peer,
    } = task;

    let dialed = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => return,
        result = tokio::time::timeout(dial_timeout, dialer.dial(&peer)) => match result {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("dial timed out after {}ms", dial_timeout.as_millis()),
            )),
        },
    };
    let endpoint = match dialed {
        Ok(endpoint) => endpoint,
        Err(e) => {
            let delay = backoff.lock().record_failure(key);
            let dropped = match shared.remove_if(&key, id) {
                Some(PeerSlot::Dialing { pending, .. }) => pending.len(),
                _ => 0,
            };
            debug!(
                "[SeparateRelay] dial for {peer} failed, backing off {}ms, dropped {dropped} datagrams: {e}",
                delay.as_millis()
            );
            return;
        }
    };
    backoff.lock().record_success(&key);
    debug!("[SeparateRelay] dialed remote for {peer}");

    let entry = PeerEntry {
        id,
        endpoint: endpoint.clone(),
        cancel: shared.cancel.child_token(),
    };
    tracker.spawn(reverse_pump(
        shared.clone(),
        key,
        id,
        peer.clone(),
        endpoint.clone(),
        reply_address,
        entry.cancel.clone(),
    ));

    // Flush what queued up during the dial. The slot only turns ready once
    // the queue is empty, so later datagrams cannot overtake queued ones.
    loop {
        let batch = {
            let mut peers = shared.peers.lock();
            let batch = match peers.get_mut(&key) {
                Some(PeerSlot::Dialing { id: slot_id, pending })
                    if *slot_id == id && !shared.cancel.is_cancelled() =>
                {
                    Some(std::mem::take(pending))
                }
                _ => None,
            };
            match batch {
                Some(batch) if batch.is_empty() => {
                    peers.insert(key, PeerSlot::Ready(entry));
                    return;
                }
                batch => batch,
            }
        };

        let Some(batch) = batch else {
            // Torn down or removed by the reverse pump while dialing.
            close_remote(&peer, entry).await;
            return;
        };

        for data in batch {
            let n = data.len();
            match endpoint.write_message(&data.data, &data.addr).await {
                Ok(()) => shared.stats.add_upload(n),
                Err(e) => {
                    debug!("[SeparateRelay] remote write for {peer} failed: {e}");
                    shared.remove_if(&key, id);
                    close_remote(&peer, entry).await;
                    return;
                }
            }
        }
    }
}

async fn reverse_pump(
    shared: Arc<Shared>,
    key: AddrKey,
    id: u64,
    peer: Addr,
    endpoint: SharedEndpoint,
    reply_address: ReplyAddress,
    cancel: CancellationToken,
) {
    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => return,
            result = endpoint.read_message() => match result {
                Ok(data) => data,
                Err(e) => {
                    debug!("[SeparateRelay] remote for {peer} finished: {e}");
                    if shared.remove_if(&key, id).is_some()
                        && let Err(e) = endpoint.close().await
                    {
                        debug!("[SeparateRelay] failed to close remote for {peer}: {e}");
                    }
                    return;
                }
            },
        };

        let reply_to = match reply_address {
            ReplyAddress::Source => &data.addr,
            ReplyAddress::Peer => &peer,
        };
        let n = data.len();
        let write_result = {
            let _guard = tokio::select! {
                _ = cancel.cancelled() => return,
                guard = shared.local_write_lock.lock() => guard,
            };
            shared.local.write_message(&data.data, reply_to).await
        };
        match write_result {
            Ok(()) => shared.stats.add_download(n),
            Err(e) => debug!("[SeparateRelay] local write to {reply_to} failed: {e}"),
        }
    }
}
