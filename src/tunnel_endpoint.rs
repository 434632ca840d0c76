//! Endpoints over multiplexed tunnel message streams.
//!
//! [`TunnelEndpoint`] is the outbound side: we tell the tunnel where each
//! datagram should go and it tells us where replies came from.
//! [`ServerTunnelEndpoint`] is the inbound side facing a tunnel client: the
//! client tells us where it wants each datagram delivered, and replies are
//! written back tagged with the address they came from.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::address::{Addr, Network};
use crate::async_stream::{
    AsyncReadSourcedMessage, AsyncReadTargetedMessage, AsyncSourcedMessageStream,
    AsyncTargetedMessageStream, AsyncWriteSourcedMessage, AsyncWriteTargetedMessage,
};
use crate::buffer_pool::BufferPool;
use crate::endpoint::{AddrData, MessageEndpoint};
use crate::stream_cell::StreamCell;

pub struct TunnelEndpoint {
    cell: StreamCell<Box<dyn AsyncSourcedMessageStream>>,
    full_cone: bool,
}

impl TunnelEndpoint {
    /// `full_cone` reports whether the far end of the tunnel accepts
    /// datagrams from peers it never sent to.
    pub fn new(stream: Box<dyn AsyncSourcedMessageStream>, full_cone: bool) -> Self {
        Self {
            cell: StreamCell::new(stream, None, BufferPool::global().clone()),
            full_cone,
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.cell.set_idle_timeout(Some(timeout));
        self
    }
}

#[async_trait]
impl MessageEndpoint for TunnelEndpoint {
    async fn read_message(&self) -> std::io::Result<AddrData> {
        let (data, source) = self
            .cell
            .read_with("tunnel stream", |stream, cx, buf| {
                stream.poll_read_sourced_message(cx, buf)
            })
            .await?;
        Ok(AddrData::new(data, Addr::from_socket_addr(source, Network::Udp)))
    }

    async fn write_message(&self, data: &[u8], peer: &Addr) -> std::io::Result<()> {
        let target = peer.location();
        self.cell
            .write_with(|stream, cx| stream.poll_write_targeted_message(cx, data, target))
            .await
    }

    async fn close_with_peer(&self, _peer: &Addr) -> std::io::Result<()> {
        Ok(())
    }

    async fn close(&self) -> std::io::Result<()> {
        self.cell.close().await;
        Ok(())
    }

    fn is_full_cone(&self) -> bool {
        self.full_cone
    }
}

pub struct ServerTunnelEndpoint {
    cell: StreamCell<Box<dyn AsyncTargetedMessageStream>>,
}

impl ServerTunnelEndpoint {
    pub fn new(stream: Box<dyn AsyncTargetedMessageStream>) -> Self {
        Self {
            cell: StreamCell::new(stream, None, BufferPool::global().clone()),
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.cell.set_idle_timeout(Some(timeout));
        self
    }
}

#[async_trait]
impl MessageEndpoint for ServerTunnelEndpoint {
    /// Reads a datagram the tunnel client wants delivered; the returned
    /// address is its destination.
    async fn read_message(&self) -> std::io::Result<AddrData> {
        let (data, target) = self
            .cell
            .read_with("server tunnel stream", |stream, cx, buf| {
                stream.poll_read_targeted_message(cx, buf)
            })
            .await?;
        Ok(AddrData::new(data, Addr::udp(target)))
    }

    /// Writes a reply that came from `peer`.
    async fn write_message(&self, data: &[u8], peer: &Addr) -> std::io::Result<()> {
        let source: SocketAddr = peer.to_socket_addr_nonblocking().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("reply source {peer} is not an IP address"),
            )
        })?;
        self.cell
            .write_with(|stream, cx| stream.poll_write_sourced_message(cx, data, &source))
            .await
    }

    async fn close_with_peer(&self, _peer: &Addr) -> std::io::Result<()> {
        Ok(())
    }

    async fn close(&self) -> std::io::Result<()> {
        self.cell.close().await;
        Ok(())
    }

    fn is_full_cone(&self) -> bool {
        // Replies from any peer can be relayed back to the client.
        true
    }
}
