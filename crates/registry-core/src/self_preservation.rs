//! Self-preservation: refuse mass eviction when renewals dry up.
//!
//! Renewals are counted in fixed windows. The rate observed over the last
//! complete window is compared against the rate the registered instances
//! promise; if too few renewals arrive the problem is assumed to be on our
//! side of the network, and eviction is held back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

/// Default fraction of expected renewals that must be observed.
pub const DEFAULT_RENEWAL_PERCENT_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone)]
pub struct SelfPreservationConfig {
    pub enabled: bool,
    pub renewal_percent_threshold: f64,
    /// Length of one counting window
    pub window: Duration,
}

impl Default for SelfPreservationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            renewal_percent_threshold: DEFAULT_RENEWAL_PERCENT_THRESHOLD,
            window: Duration::from_secs(60),
        }
    }
}

/// Result of evaluating the gate at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    /// Renewals per minute over the last complete window
    pub observed: f64,
    /// Renewals per minute promised by registered instances
    pub expected: f64,
    /// `observed / expected`; `None` when nothing is expected
    pub ratio: Option<f64>,
    /// Whether eviction may proceed
    pub allowed: bool,
}

/// Shared renewal counters. All updates are lock-free.
///
/// Each window counter packs the window index (high 32 bits) with its count
/// (low 32 bits), so opening a new window and counting into it is one CAS.
#[derive(Debug)]
pub struct SelfPreservation {
    config: SelfPreservationConfig,
    started_at_ms: u64,
    current: AtomicU64,
    previous: AtomicU64,
    expected_bits: AtomicU64,
    anomalies: AtomicU64,
}

fn pack(window: u64, count: u64) -> u64 {
    (window.min(u64::from(u32::MAX)) << 32) | count.min(u64::from(u32::MAX))
}

fn unpack(packed: u64) -> (u64, u64) {
    (packed >> 32, packed & u64::from(u32::MAX))
}

impl SelfPreservation {
    pub fn new(config: SelfPreservationConfig, now_ms: u64) -> Self {
        Self {
            config,
            started_at_ms: now_ms,
            current: AtomicU64::new(pack(0, 0)),
            previous: AtomicU64::new(pack(0, 0)),
            expected_bits: AtomicU64::new(0f64.to_bits()),
            anomalies: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SelfPreservationConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Count one renewal in the window `now_ms` falls in.
    ///
    /// A renewal stamped earlier than the open window is counted in the open
    /// window; a closed window is never written again.
    pub fn record_renewal(&self, now_ms: u64) {
        let window = self.window_index(now_ms);
        let mut packed = self.current.load(Ordering::SeqCst);
        loop {
            let (open, count) = unpack(packed);
            let next = if window > open {
                pack(window, 1)
            } else {
                pack(open, count + 1)
            };
            match self
                .current
                .compare_exchange(packed, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    if window > open {
                        // Newest closed window wins if closers race
                        self.previous.fetch_max(packed, Ordering::SeqCst);
                    }
                    return;
                }
                Err(actual) => packed = actual,
            }
        }
    }

    /// Renewals per minute seen during the last complete window.
    ///
    /// A window in which nothing was recorded counts as zero renewals.
    pub fn observed_per_min(&self, now_ms: u64) -> f64 {
        let window = self.window_index(now_ms);
        if window == 0 {
            return 0.0;
        }
        let last = window - 1;
        let count = [&self.current, &self.previous]
            .into_iter()
            .map(|slot| unpack(slot.load(Ordering::SeqCst)))
            .find(|(index, _)| *index == last)
            .map_or(0, |(_, count)| count);
        count as f64 * 60_000.0 / self.window_ms() as f64
    }

    pub fn set_expected(&self, per_min: f64) {
        self.expected_bits.store(per_min.to_bits(), Ordering::SeqCst);
    }

    pub fn expected_per_min(&self) -> f64 {
        f64::from_bits(self.expected_bits.load(Ordering::SeqCst))
    }

    pub fn evaluate(&self, now_ms: u64) -> Verdict {
        let observed = self.observed_per_min(now_ms);
        let expected = self.expected_per_min();
        let ratio = (expected > 0.0).then(|| observed / expected);
        let healthy = ratio.is_none_or(|r| r >= self.config.renewal_percent_threshold);

        Verdict {
            observed,
            expected,
            ratio,
            allowed: !self.config.enabled || healthy,
        }
    }

    /// Count one suppressed eviction cycle.
    pub fn record_anomaly(&self, verdict: &Verdict) {
        let total = self.anomalies.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            "Self-preservation engaged: {:.1} renewals/min observed, {:.1} expected (anomaly #{})",
            verdict.observed, verdict.expected, total
        );
    }

    pub fn anomaly_count(&self) -> u64 {
        self.anomalies.load(Ordering::SeqCst)
    }

    fn window_ms(&self) -> u64 {
        (self.config.window.as_millis() as u64).max(1)
    }

    fn window_index(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.started_at_ms) / self.window_ms()
    }
}
