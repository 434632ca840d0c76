//! UDP port forwarding built from relay configs.
//!
//! Each forwarder listens on a full-cone UDP endpoint and relays every client
//! over its own connected upstream socket to the configured target, so the
//! target sees one distinct source port per client.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::task::JoinHandle;

use crate::address::{Addr, NetLocation};
use crate::config::RelayConfig;
use crate::endpoint::{SharedEndpoint, is_closed, is_timeout};
use crate::relay::{PeerDialer, ReplyAddress, SeparateChannelRelay};
use crate::resolver::{NativeResolver, Resolver, ResolverCache};
use crate::traffic_stats::TrafficStats;
use crate::udp_endpoint::{NatMode, UdpEndpoint, UdpEndpointOptions};
use crate::uni_target_endpoint::UniTargetEndpoint;

const RESTART_DELAY: Duration = Duration::from_secs(1);

fn bind_listener(config: &RelayConfig) -> std::io::Result<UdpEndpoint> {
    let bind_addr = config.bind_location.to_socket_addr_nonblocking().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("bind_location {} is not an IP address", config.bind_location),
        )
    })?;
    let options = UdpEndpointOptions {
        idle_timeout: config.timeouts.full_cone(),
        peer_idle_timeout: config.timeouts.symmetric(),
        queue_capacity: config.queue_capacity,
        bind_interface: config.bind_interface.clone(),
        ..Default::default()
    };
    UdpEndpoint::bind(bind_addr, NatMode::FullCone, options)
}

fn create_dialer(config: &RelayConfig, resolver: Arc<dyn Resolver>) -> Arc<dyn PeerDialer> {
    let resolver_cache = Arc::new(ResolverCache::new(resolver));
    let target: NetLocation = config.target.clone();
    let bind_interface = config.bind_interface.clone();
    let idle_timeout = config.timeouts.symmetric();

    Arc::new(move |client: Addr| {
        let resolver_cache = resolver_cache.clone();
        let target = target.clone();
        let bind_interface = bind_interface.clone();
        async move {
            let target_addr = resolver_cache.resolve(&target).await?;
            let endpoint =
                match UniTargetEndpoint::connect_udp(target_addr, bind_interface.as_deref()).await {
                    Ok(endpoint) => endpoint.with_idle_timeout(idle_timeout),
                    Err(e) => {
                        resolver_cache.forget(&target);
                        return Err(e);
                    }
                };
            debug!("[Forwarder] new upstream for {client} to {target_addr}");
            Ok(Arc::new(endpoint) as SharedEndpoint)
        }
    })
}

/// Relays traffic arriving on `local` to `config.target` until `local` fails.
pub async fn run_forwarder(
    local: SharedEndpoint,
    config: &RelayConfig,
    stats: Arc<TrafficStats>,
) -> std::io::Result<()> {
    let dialer = create_dialer(config, Arc::new(NativeResolver::new()));
    let relay = SeparateChannelRelay::new(local, dialer, stats)
        .with_reply_address(ReplyAddress::Peer)
        .with_dial_timeout(config.timeouts.dial())
        .with_backoff(config.backoff.create_backoff());
    relay.run().await
}

async fn forwarder_loop(config: RelayConfig, mut listener: UdpEndpoint, stats: Arc<TrafficStats>) {
    loop {
        let local_addr = listener.local_addr();
        match run_forwarder(Arc::new(listener), &config, stats.clone()).await {
            Ok(()) => return,
            Err(e) if is_timeout(&e) || is_closed(&e) => {
                debug!("[Forwarder {local_addr}] listener finished ({e}), restarting");
            }
            Err(e) => {
                error!("[Forwarder {local_addr}] listener failed: {e}, restarting");
                tokio::time::sleep(RESTART_DELAY).await;
            }
        }

        listener = loop {
            match bind_listener(&config) {
                Ok(listener) => break listener,
                Err(e) => {
                    error!("[Forwarder {}] failed to rebind: {e}", config.bind_location);
                    tokio::time::sleep(RESTART_DELAY).await;
                }
            }
        };
    }
}

async fn log_stats(stats: Arc<TrafficStats>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    let (mut last_upload, mut last_download) = (stats.upload(), stats.download());
    loop {
        ticker.tick().await;
        let (upload, download) = (stats.upload(), stats.download());
        info!(
            "[Stats] upload {} bytes (+{}), download {} bytes (+{})",
            upload,
            upload - last_upload,
            download,
            download - last_download
        );
        (last_upload, last_download) = (upload, download);
    }
}

/// Binds every configured listener and starts its forwarder.
///
/// Fails without starting anything if any listener cannot be bound.
pub async fn start_forwarders(configs: Vec<RelayConfig>) -> std::io::Result<Vec<JoinHandle<()>>> {
    let stats = TrafficStats::global().clone();

    let mut listeners = Vec::with_capacity(configs.len());
    for config in configs {
        let listener = bind_listener(&config)?;
        listeners.push((config, listener));
    }

    let stats_interval = listeners
        .iter()
        .map(|(config, _)| config.stats_interval_secs)
        .filter(|secs| *secs > 0)
        .min();

    let mut join_handles = Vec::with_capacity(listeners.len() + 1);
    for (config, listener) in listeners {
        info!(
            "[Forwarder] relaying {} -> {}",
            listener.local_addr(),
            config.target
        );
        join_handles.push(tokio::spawn(forwarder_loop(config, listener, stats.clone())));
    }

    if let Some(secs) = stats_interval {
        join_handles.push(tokio::spawn(log_stats(stats, Duration::from_secs(secs))));
    }

    Ok(join_handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffConfig, TimeoutConfig};
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use tokio::net::UdpSocket;

    fn config(target: SocketAddr) -> RelayConfig {
        RelayConfig {
            bind_location: NetLocation::from_str("127.0.0.1:0", None).unwrap(),
            target: NetLocation::from_socket_addr(target),
            bind_interface: None,
            timeouts: TimeoutConfig::default(),
            backoff: BackoffConfig::default(),
            queue_capacity: 64,
            stats_interval_secs: 0,
        }
    }

    async fn spawn_echo_server() -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<SocketAddr>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                let (n, from) = socket.recv_from(&mut buf).await.unwrap();
                let _ = tx.send(from);
                socket.send_to(&buf[..n], from).await.unwrap();
            }
        });
        (addr, rx)
    }

    async fn roundtrip(client: &UdpSocket, listener: SocketAddr, payload: &[u8]) -> SocketAddr {
        client.send_to(payload, listener).await.unwrap();
        let mut buf = [0u8; 1500];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("no reply")
            .unwrap();
        assert_eq!(&buf[..n], payload);
        from
    }

    #[tokio::test]
    async fn test_forwards_each_client_over_its_own_upstream() {
        let (target, mut seen) = spawn_echo_server().await;
        let config = config(target);
        let listener = bind_listener(&config).unwrap();
        let listen_addr = listener.local_addr();
        let stats = TrafficStats::new();

        let forwarder = {
            let stats = stats.clone();
            tokio::spawn(async move { run_forwarder(Arc::new(listener), &config, stats).await })
        };

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Replies come back from the listener address, not the upstream socket.
        assert_eq!(roundtrip(&a, listen_addr, b"from-a").await, listen_addr);
        assert_eq!(roundtrip(&b, listen_addr, b"from-b").await, listen_addr);
        assert_eq!(roundtrip(&a, listen_addr, b"again-a").await, listen_addr);

        let mut upstreams = HashSet::new();
        for _ in 0..3 {
            upstreams.insert(seen.recv().await.unwrap());
        }
        assert_eq!(upstreams.len(), 2);

        let expected = (6 + 6 + 7) as u64;
        for _ in 0..200 {
            if stats.upload() == expected && stats.download() == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(stats.upload(), expected);
        assert_eq!(stats.download(), expected);

        forwarder.abort();
    }

    #[tokio::test]
    async fn test_start_forwarders_fails_on_bind_conflict() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = config("127.0.0.1:9".parse().unwrap());
        config.bind_location = NetLocation::from_socket_addr(taken.local_addr().unwrap());
        assert!(start_forwarders(vec![config]).await.is_err());
    }
}
