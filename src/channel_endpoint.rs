//! A pair of in-process endpoints connected by bounded queues.
//!
//! A datagram written on one side with address `addr` is read on the other
//! side tagged with that same `addr`. Either side can therefore play a tunnel
//! client: write with the source address to inject traffic, read to see where
//! the other side is sending.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::address::Addr;
use crate::buffer_pool::BufferPool;
use crate::endpoint::{AddrData, MessageEndpoint, closed_error};

pub struct ChannelEndpoint {
    sender: Mutex<Option<mpsc::Sender<AddrData>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<AddrData>>,
    cancel: CancellationToken,
    full_cone: bool,
    pool: Arc<BufferPool>,
}

pub fn channel_endpoint_pair(capacity: usize, full_cone: bool) -> (ChannelEndpoint, ChannelEndpoint) {
    let capacity = capacity.max(1);
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        ChannelEndpoint::new(a_tx, b_rx, full_cone),
        ChannelEndpoint::new(b_tx, a_rx, full_cone),
    )
}

impl ChannelEndpoint {
    fn new(sender: mpsc::Sender<AddrData>, receiver: mpsc::Receiver<AddrData>, full_cone: bool) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
            cancel: CancellationToken::new(),
            full_cone,
            pool: BufferPool::global().clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
impl MessageEndpoint for ChannelEndpoint {
    async fn read_message(&self) -> std::io::Result<AddrData> {
        let mut receiver = tokio::select! {
            _ = self.cancel.cancelled() => return Err(closed_error()),
            receiver = self.receiver.lock() => receiver,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(closed_error()),
            data = receiver.recv() => data.ok_or_else(closed_error),
        }
    }

    async fn write_message(&self, data: &[u8], peer: &Addr) -> std::io::Result<()> {
        let sender = self.sender.lock().clone().ok_or_else(closed_error)?;
        let data = AddrData::new(self.pool.acquire_from(data)?, peer.clone());
        tokio::select! {
            _ = self.cancel.cancelled() => Err(closed_error()),
            result = sender.send(data) => result.map_err(|_| closed_error()),
        }
    }

    async fn close_with_peer(&self, _peer: &Addr) -> std::io::Result<()> {
        Ok(())
    }

    async fn close(&self) -> std::io::Result<()> {
        self.cancel.cancel();
        // Lets the other side drain what was already queued, then see EOF.
        self.sender.lock().take();
        self.receiver.lock().await.close();
        Ok(())
    }

    fn is_full_cone(&self) -> bool {
        self.full_cone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Network;
    use crate::endpoint::is_closed;
    use std::time::Duration;

    fn addr(s: &str) -> Addr {
        Addr::from_socket_addr(s.parse().unwrap(), Network::Udp)
    }

    #[tokio::test]
    async fn test_address_passes_through() {
        let (a, b) = channel_endpoint_pair(4, true);
        assert!(a.is_full_cone());

        a.write_message(b"ping", &addr("10.0.0.1:53")).await.unwrap();
        let data = b.read_message().await.unwrap();
        assert_eq!(&data.data[..], b"ping");
        assert_eq!(data.addr, addr("10.0.0.1:53"));

        b.write_message(b"pong", &addr("10.0.0.2:53")).await.unwrap();
        let data = a.read_message().await.unwrap();
        assert_eq!(&data.data[..], b"pong");
        assert_eq!(data.addr, addr("10.0.0.2:53"));
    }

    #[tokio::test]
    async fn test_close_is_seen_by_both_sides() {
        let (a, b) = channel_endpoint_pair(4, false);
        a.write_message(b"queued", &addr("10.0.0.1:1")).await.unwrap();
        a.close().await.unwrap();
        assert!(a.is_closed());

        assert!(is_closed(&a.read_message().await.unwrap_err()));
        assert!(is_closed(
            &a.write_message(b"x", &addr("10.0.0.1:1")).await.unwrap_err()
        ));

        // Already queued data is still delivered before EOF.
        assert_eq!(&b.read_message().await.unwrap().data[..], b"queued");
        assert!(is_closed(&b.read_message().await.unwrap_err()));
        assert!(is_closed(
            &b.write_message(b"x", &addr("10.0.0.1:1")).await.unwrap_err()
        ));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (a, _b) = channel_endpoint_pair(4, false);
        let a = Arc::new(a);
        let reader = {
            let a = a.clone();
            tokio::spawn(async move { a.read_message().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close().await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(is_closed(&err));
    }

    #[tokio::test]
    async fn test_close_with_peer_keeps_endpoint_open() {
        let (a, b) = channel_endpoint_pair(4, false);
        a.close_with_peer(&addr("10.0.0.1:1")).await.unwrap();
        assert!(!a.is_closed());

        a.write_message(b"still-open", &addr("10.0.0.1:1")).await.unwrap();
        let data = b.read_message().await.unwrap();
        assert_eq!(&data.data[..], b"still-open");
    }
}
