//! The two relay strategies.
//!
//! [`relay_single_channel`] multiplexes every flow of a local endpoint over a
//! single remote endpoint. [`SeparateChannelRelay`] dials one remote endpoint
//! per local peer.

pub mod dial_backoff;
pub mod separate_channel;
pub mod single_channel;

pub use dial_backoff::DialBackoff;
pub use separate_channel::{PeerDialer, ReplyAddress, SeparateChannelRelay};
pub use single_channel::relay_single_channel;
