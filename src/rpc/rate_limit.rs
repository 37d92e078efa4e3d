// Per-peer token buckets for the overlay RPC gate.
//
// Buckets live in a concurrent map with per-entry locks; the hot path
// never takes a global lock. Tokens refill lazily from the elapsed time
// on each `allow` call. The cleanup pass collects stale keys first and
// removes them afterwards, so no entry lock is held across the scan.

use dashmap::DashMap;
use libp2p::PeerId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

pub struct RateLimiter {
    buckets: DashMap<PeerId, Mutex<Bucket>>,
    requests_per_second: f64,
    burst_size: f64,
    cleanup_interval: Duration,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64, burst_size: f64, cleanup_interval: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            requests_per_second,
            burst_size,
            cleanup_interval,
        }
    }

    /// Take one token from the peer's bucket, refilling it lazily first.
    pub fn allow(&self, peer: &PeerId) -> bool {
        self.allow_at(peer, Instant::now())
    }

    fn allow_at(&self, peer: &PeerId, now: Instant) -> bool {
        let entry = self.buckets.entry(*peer).or_insert_with(|| {
            Mutex::new(Bucket {
                tokens: self.burst_size,
                last_refill: now,
                last_used: now,
            })
        });
        let mut bucket = entry.lock();

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.requests_per_second)
            .min(self.burst_size);
        bucket.last_refill = now;
        bucket.last_used = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Evict buckets unused for longer than twice the cleanup interval.
    pub fn cleanup(&self) {
        let cutoff = 2 * self.cleanup_interval;
        let now = Instant::now();

        let stale: Vec<PeerId> = self
            .buckets
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.value().lock().last_used) > cutoff)
            .map(|entry| *entry.key())
            .collect();
        for peer in stale {
            self.buckets.remove(&peer);
        }
    }

    pub fn tracked_peers(&self) -> usize {
        self.buckets.len()
    }

    pub fn start_cleanup(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(limiter.cleanup_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => limiter.cleanup(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_denial() {
        let limiter = RateLimiter::new(1.0, 5.0, Duration::from_secs(60));
        let peer = PeerId::random();
        let now = Instant::now();

        for _ in 0..5 {
            assert!(limiter.allow_at(&peer, now));
        }
        // Bucket drained within the same instant.
        assert!(!limiter.allow_at(&peer, now));
    }

    #[test]
    fn test_refill_grants_exactly_one() {
        let limiter = RateLimiter::new(2.0, 3.0, Duration::from_secs(60));
        let peer = PeerId::random();
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.allow_at(&peer, now));
        }
        assert!(!limiter.allow_at(&peer, now));

        // After 1/rps seconds exactly one token is back.
        let later = now + Duration::from_millis(500);
        assert!(limiter.allow_at(&peer, later));
        assert!(!limiter.allow_at(&peer, later));
    }

    #[test]
    fn test_refill_caps_at_burst() {
        let limiter = RateLimiter::new(10.0, 2.0, Duration::from_secs(60));
        let peer = PeerId::random();
        let now = Instant::now();

        assert!(limiter.allow_at(&peer, now));
        // A long idle stretch cannot bank more than burst_size tokens.
        let later = now + Duration::from_secs(3600);
        assert!(limiter.allow_at(&peer, later));
        assert!(limiter.allow_at(&peer, later));
        assert!(!limiter.allow_at(&peer, later));
    }

    #[test]
    fn test_cleanup_evicts_stale_buckets() {
        let limiter = RateLimiter::new(1.0, 1.0, Duration::from_millis(0));
        let peer = PeerId::random();
        limiter.allow(&peer);
        assert_eq!(limiter.tracked_peers(), 1);

        std::thread::sleep(Duration::from_millis(5));
        limiter.cleanup();
        assert_eq!(limiter.tracked_peers(), 0);
    }

    #[test]
    fn test_buckets_are_per_peer() {
        let limiter = RateLimiter::new(1.0, 1.0, Duration::from_secs(60));
        let a = PeerId::random();
        let b = PeerId::random();
        let now = Instant::now();

        assert!(limiter.allow_at(&a, now));
        assert!(!limiter.allow_at(&a, now));
        // Peer b has its own bucket.
        assert!(limiter.allow_at(&b, now));
    }
}
