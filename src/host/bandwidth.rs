// Byte accounting at the stream framing layer.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative transfer totals for the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthStats {
    pub total_in: u64,
    pub total_out: u64,
}

/// Shared counters fed by the protocol client/server and the stream-RPC
/// transport. Disabled counters drop updates so metering can be switched
/// off without touching call sites.
#[derive(Debug)]
pub struct BandwidthCounter {
    inbound: AtomicU64,
    outbound: AtomicU64,
    enabled: bool,
}

impl BandwidthCounter {
    pub fn new(enabled: bool) -> Self {
        Self {
            inbound: AtomicU64::new(0),
            outbound: AtomicU64::new(0),
            enabled,
        }
    }

    pub fn record_in(&self, bytes: u64) {
        if self.enabled {
            self.inbound.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn record_out(&self, bytes: u64) {
        if self.enabled {
            self.outbound.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> BandwidthStats {
        BandwidthStats {
            total_in: self.inbound.load(Ordering::Relaxed),
            total_out: self.outbound.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let counter = BandwidthCounter::new(true);
        counter.record_in(100);
        counter.record_in(28);
        counter.record_out(64);
        assert_eq!(
            counter.stats(),
            BandwidthStats {
                total_in: 128,
                total_out: 64
            }
        );
    }

    #[test]
    fn test_disabled_counter_is_inert() {
        let counter = BandwidthCounter::new(false);
        counter.record_in(100);
        counter.record_out(100);
        assert_eq!(
            counter.stats(),
            BandwidthStats {
                total_in: 0,
                total_out: 0
            }
        );
    }
}
