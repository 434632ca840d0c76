use std::future::Future;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use lru::LruCache;
use parking_lot::Mutex;

use crate::address::NetLocation;

/// Resolved locations remembered per cache.
const RESOLVE_CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(128).unwrap();

pub const DEFAULT_RESOLVE_TTL: Duration = Duration::from_secs(60);

pub type ResolveFuture = Pin<Box<dyn Future<Output = std::io::Result<Vec<SocketAddr>>> + Send>>;

pub trait Resolver: Send + Sync {
    fn resolve_location(&self, location: &NetLocation) -> ResolveFuture;
}

pub struct NativeResolver;

impl NativeResolver {
    pub fn new() -> Self {
        NativeResolver {}
    }
}

impl Default for NativeResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for NativeResolver {
    fn resolve_location(&self, location: &NetLocation) -> ResolveFuture {
        let address = location.address().clone();
        let port = location.port();
        use futures::future::FutureExt;
        Box::pin(
            tokio::net::lookup_host((address.to_string(), port)).map(move |result| {
                let ret = result.map(|r| {
                    r.filter(|addr| !addr.ip().is_unspecified())
                        .collect::<Vec<_>>()
                });
                debug!("NativeResolver resolved {}:{} -> {:?}", address, port, ret);
                ret
            }),
        )
    }
}

pub async fn resolve_single_address(
    resolver: &Arc<dyn Resolver>,
    location: &NetLocation,
) -> std::io::Result<SocketAddr> {
    if let Some(addr) = location.to_socket_addr_nonblocking() {
        return Ok(addr);
    }
    let resolve_results = resolver.resolve_location(location).await?;
    match resolve_results.into_iter().next() {
        Some(addr) => Ok(addr),
        None => Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("could not resolve location: {location}"),
        )),
    }
}

/// Remembers the first resolved address of recently used hostnames for up
/// to `ttl`, after which the hostname is resolved again.
pub struct ResolverCache {
    resolver: Arc<dyn Resolver>,
    cache: Mutex<LruCache<NetLocation, (SocketAddr, Instant)>>,
    ttl: Duration,
}

impl ResolverCache {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self::with_ttl(resolver, DEFAULT_RESOLVE_TTL)
    }

    pub fn with_ttl(resolver: Arc<dyn Resolver>, ttl: Duration) -> Self {
        Self {
            resolver,
            cache: Mutex::new(LruCache::new(RESOLVE_CACHE_SIZE)),
            ttl,
        }
    }

    pub async fn resolve(&self, location: &NetLocation) -> std::io::Result<SocketAddr> {
        if let Some(addr) = location.to_socket_addr_nonblocking() {
            return Ok(addr);
        }

        {
            let mut cache = self.cache.lock();
            match cache.get(location).copied() {
                Some((addr, resolved_at)) if resolved_at.elapsed() < self.ttl => return Ok(addr),
                Some(_) => {
                    cache.pop(location);
                }
                None => {}
            }
        }

        let addr = resolve_single_address(&self.resolver, location).await?;
        self.cache
            .lock()
            .put(location.clone(), (addr, Instant::now()));
        Ok(addr)
    }

    /// Drops the cached address of `location`, eg. after it stopped working.
    pub fn forget(&self, location: &NetLocation) {
        self.cache.lock().pop(location);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: AtomicUsize,
        result: Vec<SocketAddr>,
    }

    impl Resolver for CountingResolver {
        fn resolve_location(&self, _location: &NetLocation) -> ResolveFuture {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = self.result.clone();
            Box::pin(async move { Ok(result) })
        }
    }

    #[tokio::test]
    async fn test_cache_resolves_hostname_once() {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
            result: vec!["10.0.0.1:53".parse().unwrap()],
        });
        let cache = ResolverCache::new(resolver.clone());
        let location = NetLocation::new(Address::Hostname("dns.test".to_string()), 53);

        for _ in 0..3 {
            let addr = cache.resolve(&location).await.unwrap();
            assert_eq!(addr, "10.0.0.1:53".parse().unwrap());
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    /// Hands out a new port on every lookup, as if the record kept changing.
    struct RotatingResolver {
        calls: AtomicUsize,
    }

    impl Resolver for RotatingResolver {
        fn resolve_location(&self, _location: &NetLocation) -> ResolveFuture {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let addr = SocketAddr::new("10.0.0.1".parse().unwrap(), 1000 + n as u16);
            Box::pin(async move { Ok(vec![addr]) })
        }
    }

    #[tokio::test]
    async fn test_cached_address_expires_after_ttl() {
        let resolver = Arc::new(RotatingResolver {
            calls: AtomicUsize::new(0),
        });
        let cache = ResolverCache::with_ttl(resolver.clone(), Duration::from_millis(50));
        let location = NetLocation::new(Address::Hostname("moving.test".to_string()), 53);

        let first = cache.resolve(&location).await.unwrap();
        assert_eq!(cache.resolve(&location).await.unwrap(), first);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let later = cache.resolve(&location).await.unwrap();
        assert_ne!(later, first);
        assert_eq!(later.port(), 1001);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_forget_forces_new_lookup() {
        let resolver = Arc::new(RotatingResolver {
            calls: AtomicUsize::new(0),
        });
        let cache = ResolverCache::new(resolver.clone());
        let location = NetLocation::new(Address::Hostname("moving.test".to_string()), 53);

        let first = cache.resolve(&location).await.unwrap();
        cache.forget(&location);
        assert_ne!(cache.resolve(&location).await.unwrap(), first);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ip_location_skips_resolver() {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
            result: vec![],
        });
        let cache = ResolverCache::new(resolver.clone());
        let location = NetLocation::from_str("192.168.1.1:80", None).unwrap();
        assert_eq!(
            cache.resolve(&location).await.unwrap(),
            "192.168.1.1:80".parse().unwrap()
        );
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_resolution_is_not_found() {
        let resolver: Arc<dyn Resolver> = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
            result: vec![],
        });
        let location = NetLocation::new(Address::Hostname("missing.test".to_string()), 53);
        let err = resolve_single_address(&resolver, &location)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
