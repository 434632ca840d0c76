//! Relaying every flow of a local endpoint over one shared remote endpoint.

use std::sync::Arc;

use log::{debug, error};
use tokio_util::sync::CancellationToken;

use crate::endpoint::{SharedEndpoint, is_closed, is_timeout};
use crate::traffic_stats::TrafficStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Side::Local => write!(f, "local"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

struct Relay {
    local: SharedEndpoint,
    remote: SharedEndpoint,
    stats: Arc<TrafficStats>,
    cancel: CancellationToken,
}

/// Copies datagrams between `local` and `remote` until one side fails or
/// `cancel` fires.
///
/// When both endpoints are full-cone, a remote failure only closes the
/// remote endpoint so that `local` can be handed to a new remote session.
/// Any other failure closes both. Cancellation closes neither.
///
/// Returns `Ok(())` when cancelled and the first failure otherwise.
pub async fn relay_single_channel(
    local: SharedEndpoint,
    remote: SharedEndpoint,
    stats: Arc<TrafficStats>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let relay = Arc::new(Relay {
        local,
        remote,
        stats,
        cancel: cancel.child_token(),
    });

    let uplink = tokio::spawn({
        let relay = relay.clone();
        async move { relay.pump(Side::Local).await }
    });
    let downlink_result = relay.pump(Side::Remote).await;
    let uplink_result = match uplink.await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::other(format!("uplink task failed: {e}"))),
    };

    // Whichever direction failed first is the interesting error.
    downlink_result.and(uplink_result)
}

impl Relay {
    async fn pump(&self, from: Side) -> std::io::Result<()> {
        let (reader, writer) = match from {
            Side::Local => (&self.local, &self.remote),
            Side::Remote => (&self.remote, &self.local),
        };
        let to = match from {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        };

        loop {
            let data = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                result = reader.read_message() => match result {
                    Ok(data) => data,
                    Err(e) => return Err(self.fail(from, e).await),
                },
            };

            let n = data.len();
            let write_result = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                result = writer.write_message(&data.data, &data.addr) => result,
            };
            if let Err(e) = write_result {
                return Err(self.fail(to, e).await);
            }

            match from {
                Side::Local => self.stats.add_upload(n),
                Side::Remote => self.stats.add_download(n),
            }
        }
    }

    async fn fail(&self, side: Side, e: std::io::Error) -> std::io::Error {
        if self.cancel.is_cancelled() {
            // The other direction already tore things down.
            return e;
        }

        let keep_local =
            side == Side::Remote && self.local.is_full_cone() && self.remote.is_full_cone();

        if side == Side::Local && !is_timeout(&e) && !is_closed(&e) {
            error!("[SingleRelay] local endpoint failed: {e}");
        } else {
            debug!("[SingleRelay] {side} endpoint finished: {e}");
        }

        self.cancel.cancel();
        if let Err(e) = self.remote.close().await {
            debug!("[SingleRelay] failed to close remote endpoint: {e}");
        }
        if !keep_local && let Err(e) = self.local.close().await {
            debug!("[SingleRelay] failed to close local endpoint: {e}");
        }
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::address::{Addr, Network};
    use crate::channel_endpoint::{ChannelEndpoint, channel_endpoint_pair};
    use crate::endpoint::MessageEndpoint;

    fn addr(s: &str) -> Addr {
        Addr::from_socket_addr(s.parse().unwrap(), Network::Udp)
    }

    fn pair(full_cone: bool) -> (Arc<ChannelEndpoint>, Arc<ChannelEndpoint>) {
        let (a, b) = channel_endpoint_pair(16, full_cone);
        (Arc::new(a), Arc::new(b))
    }

    fn spawn_relay(
        local: &Arc<ChannelEndpoint>,
        remote: &Arc<ChannelEndpoint>,
        stats: &Arc<TrafficStats>,
        cancel: &CancellationToken,
    ) -> tokio::task::JoinHandle<std::io::Result<()>> {
        tokio::spawn(relay_single_channel(
            local.clone(),
            remote.clone(),
            stats.clone(),
            cancel.clone(),
        ))
    }

    async fn read(endpoint: &ChannelEndpoint) -> (Vec<u8>, Addr) {
        let data = tokio::time::timeout(Duration::from_secs(2), endpoint.read_message())
            .await
            .expect("timed out")
            .unwrap();
        (data.data.to_vec(), data.addr)
    }

    #[tokio::test]
    async fn test_relays_both_directions() {
        let (local, client) = pair(true);
        let (remote, server) = pair(true);
        let stats = TrafficStats::new();
        let cancel = CancellationToken::new();
        let relay = spawn_relay(&local, &remote, &stats, &cancel);

        client.write_message(b"hello", &addr("10.0.0.1:53")).await.unwrap();
        assert_eq!(read(&server).await, (b"hello".to_vec(), addr("10.0.0.1:53")));

        server.write_message(b"hi!", &addr("10.0.0.1:53")).await.unwrap();
        assert_eq!(read(&client).await, (b"hi!".to_vec(), addr("10.0.0.1:53")));

        cancel.cancel();
        relay.await.unwrap().unwrap();
        assert_eq!(stats.upload(), 5);
        assert_eq!(stats.download(), 3);

        // Cancellation leaves both endpoints open.
        assert!(!local.is_closed());
        assert!(!remote.is_closed());
    }

    #[tokio::test]
    async fn test_full_cone_remote_failure_keeps_local_usable() {
        let (local, client) = pair(true);
        let (remote, server) = pair(true);
        let stats = TrafficStats::new();
        let cancel = CancellationToken::new();
        let relay = spawn_relay(&local, &remote, &stats, &cancel);

        client.write_message(b"one", &addr("10.0.0.1:1")).await.unwrap();
        read(&server).await;

        // Kill the remote session.
        server.close().await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(is_closed(&err));
        assert!(remote.is_closed());
        assert!(!local.is_closed());

        // The same local endpoint carries a new remote session.
        let (remote2, server2) = pair(true);
        let relay2 = spawn_relay(&local, &remote2, &stats, &cancel);
        client.write_message(b"two", &addr("10.0.0.1:1")).await.unwrap();
        assert_eq!(read(&server2).await.0, b"two");
        server2.write_message(b"back", &addr("10.0.0.1:1")).await.unwrap();
        assert_eq!(read(&client).await.0, b"back");

        cancel.cancel();
        relay2.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_restricted_remote_failure_closes_both() {
        let (local, _client) = pair(false);
        let (remote, server) = pair(true);
        let stats = TrafficStats::new();
        let relay = spawn_relay(&local, &remote, &stats, &CancellationToken::new());

        server.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        assert!(remote.is_closed());
        assert!(local.is_closed());
    }

    #[tokio::test]
    async fn test_local_failure_closes_both() {
        let (local, client) = pair(true);
        let (remote, _server) = pair(true);
        let stats = TrafficStats::new();
        let relay = spawn_relay(&local, &remote, &stats, &CancellationToken::new());

        client.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        assert!(remote.is_closed());
        assert!(local.is_closed());
    }
}
