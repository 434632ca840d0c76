//! The addressed-message endpoint abstraction shared by both relay strategies.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::address::Addr;
use crate::buffer_pool::PooledBuf;

/// One datagram together with the peer it belongs to.
///
/// Produced by [`MessageEndpoint::read_message`]. The payload goes back to
/// the buffer pool when this value is dropped, so it is meant to be consumed
/// by exactly one write.
#[derive(Debug)]
pub struct AddrData {
    pub data: PooledBuf,
    pub addr: Addr,
}

impl AddrData {
    pub fn new(data: PooledBuf, addr: Addr) -> Self {
        Self { data, addr }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Reads and writes single datagrams tagged with a peer address.
///
/// All methods take `&self` so that one task can block in `read_message`
/// while others write. Implementations must make `close` unblock pending
/// reads, which then fail with an [`is_closed`] error.
#[async_trait]
pub trait MessageEndpoint: Send + Sync {
    /// Reads the next datagram.
    ///
    /// Fails with an [`is_timeout`] error when the endpoint's idle deadline
    /// elapses, and with an [`is_closed`] error once the endpoint is closed.
    async fn read_message(&self) -> std::io::Result<AddrData>;

    /// Sends one datagram to `peer`.
    async fn write_message(&self, data: &[u8], peer: &Addr) -> std::io::Result<()>;

    /// Releases whatever the endpoint holds for `peer` alone. A no-op for
    /// endpoints without per-peer resources.
    async fn close_with_peer(&self, peer: &Addr) -> std::io::Result<()>;

    /// Closes the endpoint and everything it owns. Idempotent.
    async fn close(&self) -> std::io::Result<()>;

    /// Whether any peer may reach this endpoint, regardless of who it sent to.
    fn is_full_cone(&self) -> bool;
}

pub type SharedEndpoint = Arc<dyn MessageEndpoint>;

pub fn timeout_error(what: &str, timeout: Duration) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{what} idle for {}s", timeout.as_secs_f32()),
    )
}

pub fn closed_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "endpoint closed")
}

pub fn is_timeout(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::TimedOut
}

pub fn is_closed(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::UnexpectedEof
}

/// Runs `future` with an idle deadline, mapping expiry to a timeout error.
pub async fn with_idle_timeout<T, F>(what: &str, timeout: Duration, future: F) -> std::io::Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(timeout_error(what, timeout)),
    }
}
