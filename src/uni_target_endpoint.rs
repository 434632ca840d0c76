//! An endpoint bound to exactly one target.
//!
//! Wraps a message stream that can only talk to one peer, eg. a connected
//! UDP socket or a length-framed byte stream. Every datagram read is reported
//! as coming from the target, and every write goes to the target regardless of
//! the address it was addressed to.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;

use crate::address::{Addr, Network};
use crate::async_stream::{AsyncMessageStream, AsyncReadMessage, AsyncWriteMessage};
use crate::buffer_pool::BufferPool;
use crate::endpoint::{AddrData, MessageEndpoint};
use crate::framed_message_stream::FramedMessageStream;
use crate::socket_util::{ephemeral_bind_addr, new_udp_socket};
use crate::stream_cell::StreamCell;

pub struct UniTargetEndpoint {
    cell: StreamCell<Box<dyn AsyncMessageStream>>,
    target: Addr,
}

impl UniTargetEndpoint {
    pub fn new(stream: Box<dyn AsyncMessageStream>, target: Addr) -> Self {
        Self {
            cell: StreamCell::new(stream, None, BufferPool::global().clone()),
            target,
        }
    }

    /// Fails reads that see no traffic for `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.cell.set_idle_timeout(Some(timeout));
        self
    }

    pub fn from_connected_udp(socket: UdpSocket) -> std::io::Result<Self> {
        let peer = socket.peer_addr()?;
        Ok(Self::new(
            Box::new(socket),
            Addr::from_socket_addr(peer, Network::Udp),
        ))
    }

    /// Binds an ephemeral socket and connects it to `target`.
    pub async fn connect_udp(
        target: SocketAddr,
        bind_interface: Option<&str>,
    ) -> std::io::Result<Self> {
        let socket = new_udp_socket(ephemeral_bind_addr(&target, None), bind_interface)?;
        socket.connect(target).await?;
        debug!(
            "[UniTargetEndpoint] connected {} -> {}",
            socket.local_addr()?,
            target
        );
        Self::from_connected_udp(socket)
    }

    /// Carries datagrams over `stream` with a 2-byte length prefix.
    pub fn from_stream<S>(stream: S, target: Addr) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(Box::new(FramedMessageStream::new(stream)), target)
    }

    pub fn target(&self) -> &Addr {
        &self.target
    }
}

#[async_trait]
impl MessageEndpoint for UniTargetEndpoint {
    async fn read_message(&self) -> std::io::Result<AddrData> {
        let (data, ()) = self
            .cell
            .read_with("uni-target stream", |stream, cx, buf| {
                stream.poll_read_message(cx, buf)
            })
            .await?;
        Ok(AddrData::new(data, self.target.clone()))
    }

    async fn write_message(&self, data: &[u8], _peer: &Addr) -> std::io::Result<()> {
        self.cell
            .write_with(|stream, cx| stream.poll_write_message(cx, data))
            .await
    }

    async fn close_with_peer(&self, _peer: &Addr) -> std::io::Result<()> {
        // The only peer is the target, so this releases everything.
        self.close().await
    }

    async fn close(&self) -> std::io::Result<()> {
        self.cell.close().await;
        Ok(())
    }

    fn is_full_cone(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::address::NetLocation;
    use crate::endpoint::{is_closed, is_timeout};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connected_udp_ignores_write_address() {
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let endpoint = UniTargetEndpoint::connect_udp(target_addr, None).await.unwrap();
        assert!(!endpoint.is_full_cone());
        assert_eq!(
            endpoint.target(),
            &Addr::from_socket_addr(target_addr, Network::Udp)
        );

        let elsewhere = Addr::udp(NetLocation::from_str("10.9.9.9:1", None).unwrap());
        endpoint.write_message(b"hello", &elsewhere).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = target.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        target.send_to(b"world", from).await.unwrap();
        let reply = endpoint.read_message().await.unwrap();
        assert_eq!(&reply.data[..], b"world");
        assert_eq!(reply.addr, *endpoint.target());
    }

    #[tokio::test]
    async fn test_stream_framing_both_ways() {
        let (a, mut b) = tokio::io::duplex(1024);
        let target = Addr::udp(NetLocation::from_str("192.0.2.1:53", None).unwrap());
        let endpoint = UniTargetEndpoint::from_stream(a, target.clone());

        endpoint.write_message(b"query", &target).await.unwrap();
        let mut raw = [0u8; 7];
        b.read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw, b"\x00\x05query");

        b.write_all(b"\x00\x06answer").await.unwrap();
        let reply = endpoint.read_message().await.unwrap();
        assert_eq!(&reply.data[..], b"answer");
        assert_eq!(reply.addr, target);
    }

    #[tokio::test]
    async fn test_read_and_write_run_concurrently() {
        let (a, mut b) = tokio::io::duplex(1024);
        let target = Addr::udp(NetLocation::from_str("192.0.2.1:53", None).unwrap());
        let endpoint = Arc::new(UniTargetEndpoint::from_stream(a, target.clone()));

        let reader = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.read_message().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The pending read must not block this write.
        tokio::time::timeout(
            Duration::from_secs(1),
            endpoint.write_message(b"out", &target),
        )
        .await
        .expect("write blocked by pending read")
        .unwrap();

        b.write_all(b"\x00\x02in").await.unwrap();
        let data = reader.await.unwrap().unwrap();
        assert_eq!(&data.data[..], b"in");
    }

    #[tokio::test]
    async fn test_idle_timeout_and_close() {
        let (a, _b) = tokio::io::duplex(1024);
        let target = Addr::udp(NetLocation::from_str("192.0.2.1:53", None).unwrap());
        let endpoint = UniTargetEndpoint::from_stream(a, target.clone())
            .with_idle_timeout(Duration::from_millis(30));

        let err = endpoint.read_message().await.unwrap_err();
        assert!(is_timeout(&err));

        endpoint.close_with_peer(&target).await.unwrap();
        let err = endpoint.read_message().await.unwrap_err();
        assert!(is_closed(&err));
        let err = endpoint.write_message(b"x", &target).await.unwrap_err();
        assert!(is_closed(&err));

        // Closing twice is fine.
        endpoint.close().await.unwrap();
    }
}
