//! Relayed byte counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

static GLOBAL_STATS: OnceLock<Arc<TrafficStats>> = OnceLock::new();

/// Upload (local to remote) and download (remote to local) payload byte
/// counters, fed by every relay pump loop.
#[derive(Debug, Default)]
pub struct TrafficStats {
    upload: AtomicU64,
    download: AtomicU64,
}

impl TrafficStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Counters shared by every relay that isn't given its own.
    pub fn global() -> &'static Arc<TrafficStats> {
        GLOBAL_STATS.get_or_init(TrafficStats::new)
    }

    #[inline]
    pub fn add_upload(&self, n: usize) {
        self.upload.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_download(&self, n: usize) {
        self.download.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = TrafficStats::new();
        stats.add_upload(7);
        stats.add_upload(5);
        stats.add_download(3);
        assert_eq!(stats.upload(), 12);
        assert_eq!(stats.download(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_not_lost() {
        let stats = TrafficStats::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stats = stats.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    stats.add_upload(3);
                    stats.add_download(1);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(stats.upload(), 8 * 1000 * 3);
        assert_eq!(stats.download(), 8 * 1000);
    }

    #[test]
    fn test_global_is_shared() {
        let a = TrafficStats::global();
        let b = TrafficStats::global();
        assert!(Arc::ptr_eq(a, b));
    }
}
