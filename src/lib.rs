//! nat-relay - UDP relaying with full-cone and symmetric NAT behavior.
//!
//! The library is built around [`endpoint::MessageEndpoint`], an addressed
//! datagram read/write abstraction, and two relay strategies over it:
//!
//! - [`relay::relay_single_channel`] carries every flow of a local endpoint
//!   over one shared remote endpoint.
//! - [`relay::SeparateChannelRelay`] dials a dedicated remote endpoint for
//!   each local peer.
//!
//! Endpoints:
//!
//! - [`udp_endpoint::UdpEndpoint`]: direct UDP, full-cone or symmetric
//! - [`uni_target_endpoint::UniTargetEndpoint`]: a connected socket or
//!   length-framed stream bound to one target
//! - [`tunnel_endpoint`]: adapters for tunnel protocol message streams
//! - [`channel_endpoint`]: an in-process endpoint pair
//!
//! The `nat-relay` binary uses these to run UDP port forwarders described by
//! a YAML config, see [`config`] and [`forwarder`].

pub mod address;
pub mod async_stream;
pub mod buffer_pool;
pub mod channel_endpoint;
pub mod config;
pub mod endpoint;
pub mod forwarder;
pub mod framed_message_stream;
pub mod relay;
pub mod resolver;
pub mod socket_util;
mod stream_cell;
pub mod traffic_stats;
pub mod tunnel_endpoint;
pub mod udp_endpoint;
pub mod uni_target_endpoint;
