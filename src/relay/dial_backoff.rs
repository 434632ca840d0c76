//! Per-peer exponential backoff for lazy dials.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::address::AddrKey;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_TRACKED: usize = 256;

#[derive(Debug, Clone, Copy)]
struct FailureState {
    failures: u32,
    retry_at: Instant,
}

/// Remembers recent dial failures per peer and refuses new dials until the
/// peer's backoff delay has elapsed.
///
/// The delay doubles with every consecutive failure, from `base` up to `max`.
/// Only the `max_tracked` most recently failing peers are remembered.
pub struct DialBackoff {
    failures: LruCache<AddrKey, FailureState>,
    base: Duration,
    max: Duration,
}

impl DialBackoff {
    pub fn new(base: Duration, max: Duration, max_tracked: usize) -> Self {
        let max_tracked = NonZeroUsize::new(max_tracked).unwrap_or(NonZeroUsize::MIN);
        Self {
            failures: LruCache::new(max_tracked),
            base,
            max: max.max(base),
        }
    }

    /// Fails with `ConnectionRefused` if `key` is still backing off.
    pub fn check(&mut self, key: &AddrKey) -> std::io::Result<()> {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&mut self, key: &AddrKey, now: Instant) -> std::io::Result<()> {
        match self.failures.get(key) {
            Some(state) if state.retry_at > now => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!(
                    "dial to {key} suppressed for {}ms after {} failures",
                    (state.retry_at - now).as_millis(),
                    state.failures
                ),
            )),
            _ => Ok(()),
        }
    }

    /// Records a failed dial and returns how long `key` now backs off.
    pub fn record_failure(&mut self, key: AddrKey) -> Duration {
        self.record_failure_at(key, Instant::now())
    }

    pub fn record_failure_at(&mut self, key: AddrKey, now: Instant) -> Duration {
        let failures = self
            .failures
            .peek(&key)
            .map_or(1, |state| state.failures.saturating_add(1));
        let delay = self.delay_for(failures);
        self.failures.put(
            key,
            FailureState {
                failures,
                retry_at: now + delay,
            },
        );
        delay
    }

    pub fn record_success(&mut self, key: &AddrKey) {
        self.failures.pop(key);
    }

    /// Number of peers currently remembered as failing.
    pub fn tracked(&self) -> usize {
        self.failures.len()
    }

    fn delay_for(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << shift)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for DialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_MAX_TRACKED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Network;

    fn key(port: u16) -> AddrKey {
        AddrKey::from_socket_addr(format!("10.0.0.1:{port}").parse().unwrap(), Network::Udp)
    }

    #[test]
    fn test_delay_doubles_up_to_max() {
        let mut backoff = DialBackoff::new(Duration::from_millis(100), Duration::from_secs(1), 8);
        let now = Instant::now();
        let delays: Vec<_> = (0..6)
            .map(|_| backoff.record_failure_at(key(1), now).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_check_refuses_until_delay_elapses() {
        let mut backoff = DialBackoff::new(Duration::from_millis(100), Duration::from_secs(1), 8);
        let now = Instant::now();
        backoff.check_at(&key(1), now).unwrap();

        backoff.record_failure_at(key(1), now);
        let err = backoff
            .check_at(&key(1), now + Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);

        // Other peers are unaffected.
        backoff.check_at(&key(2), now).unwrap();

        backoff
            .check_at(&key(1), now + Duration::from_millis(100))
            .unwrap();
    }

    #[test]
    fn test_success_resets() {
        let mut backoff = DialBackoff::default();
        let now = Instant::now();
        backoff.record_failure_at(key(1), now);
        backoff.record_failure_at(key(1), now);
        backoff.record_success(&key(1));
        assert_eq!(backoff.tracked(), 0);
        backoff.check_at(&key(1), now).unwrap();
        assert_eq!(backoff.record_failure_at(key(1), now), DEFAULT_BACKOFF_BASE);
    }

    #[test]
    fn test_tracking_is_bounded() {
        let mut backoff = DialBackoff::new(Duration::from_secs(10), Duration::from_secs(10), 2);
        let now = Instant::now();
        for port in 1..=3 {
            backoff.record_failure_at(key(port), now);
        }
        assert_eq!(backoff.tracked(), 2);
        // The oldest peer was evicted and may dial again.
        backoff.check_at(&key(1), now).unwrap();
        assert!(backoff.check_at(&key(3), now).is_err());
    }
}
