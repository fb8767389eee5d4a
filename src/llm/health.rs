//! Rolling per-vendor health used for fallback routing.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Calls kept in the rolling window.
const WINDOW_SIZE: usize = 50;

/// Vendors scoring below this are temporarily skipped.
pub const SCORE_FLOOR: f64 = 20.0;

/// One finished call against a vendor.
#[derive(Debug, Clone, Copy)]
pub struct CallSample {
    pub success: bool,
    pub rate_limited: bool,
    pub latency: Duration,
}

/// Rolling success/latency/rate-limit counters and the blended score.
#[derive(Debug)]
pub struct VendorHealth {
    window: VecDeque<CallSample>,
    last_success: Option<Instant>,
}

impl VendorHealth {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(WINDOW_SIZE),
            last_success: None,
        }
    }

    pub fn record(&mut self, sample: CallSample) {
        if self.window.len() == WINDOW_SIZE {
            self.window.pop_front();
        }
        if sample.success {
            self.last_success = Some(Instant::now());
        }
        self.window.push_back(sample);
    }

    /// Blended health score in [0, 100]: recent success rate (0.4),
    /// inverse recent latency (0.3), rate-limit hit fraction (0.2),
    /// recency of success (0.1). A vendor with no history scores 100 so
    /// fresh vendors are eligible immediately.
    pub fn score(&self) -> f64 {
        if self.window.is_empty() {
            return 100.0;
        }

        let total = self.window.len() as f64;
        let successes = self.window.iter().filter(|s| s.success).count() as f64;
        let rate_limited = self.window.iter().filter(|s| s.rate_limited).count() as f64;

        let success_part = successes / total;
        // Latency credit comes from completed calls only; 1s or faster is
        // perfect, 30s or slower is worthless.
        let latency_part = if successes > 0.0 {
            let avg: f64 = self
                .window
                .iter()
                .filter(|s| s.success)
                .map(|s| s.latency.as_secs_f64())
                .sum::<f64>()
                / successes;
            (1.0 - (avg - 1.0) / 29.0).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let rate_limit_part = 1.0 - rate_limited / total;
        let recency_part = match self.last_success {
            Some(at) => {
                let age = at.elapsed().as_secs_f64();
                // Full credit within a minute, fading to zero at ten.
                (1.0 - (age - 60.0) / 540.0).clamp(0.0, 1.0)
            }
            None => 0.0,
        };

        100.0
            * (0.4 * success_part + 0.3 * latency_part + 0.2 * rate_limit_part + 0.1 * recency_part)
    }

    pub fn is_healthy(&self) -> bool {
        self.score() >= SCORE_FLOOR
    }
}

impl Default for VendorHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_sample() -> CallSample {
        CallSample {
            success: true,
            rate_limited: false,
            latency: Duration::from_millis(800),
        }
    }

    fn rate_limited_sample() -> CallSample {
        CallSample {
            success: false,
            rate_limited: true,
            latency: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_fresh_vendor_scores_full() {
        assert_eq!(VendorHealth::new().score(), 100.0);
    }

    #[test]
    fn test_healthy_vendor_scores_high() {
        let mut health = VendorHealth::new();
        for _ in 0..10 {
            health.record(ok_sample());
        }
        assert!(health.score() > 90.0);
        assert!(health.is_healthy());
    }

    #[test]
    fn test_repeated_429s_drop_below_floor() {
        let mut health = VendorHealth::new();
        for _ in 0..5 {
            health.record(rate_limited_sample());
        }
        // No successes, all rate-limited: every component is zero.
        assert_eq!(health.score(), 0.0);
        assert!(!health.is_healthy());
    }

    #[test]
    fn test_window_is_bounded() {
        let mut health = VendorHealth::new();
        for _ in 0..200 {
            health.record(ok_sample());
        }
        assert_eq!(health.window.len(), WINDOW_SIZE);
    }

    #[test]
    fn test_recovery_after_failures() {
        let mut health = VendorHealth::new();
        for _ in 0..50 {
            health.record(rate_limited_sample());
        }
        let low = health.score();
        for _ in 0..50 {
            health.record(ok_sample());
        }
        assert!(health.score() > low + 40.0);
    }
}
