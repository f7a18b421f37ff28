/// Jittered delays for retries and periodic work
use rand::Rng;
use std::time::Duration;

/// Scale `base` by a random factor in `[1 - ratio, 1 + ratio)`.
///
/// A ratio of zero (or less) returns `base` unchanged; ratios are clamped below 1.0
/// so the result never collapses to zero.
pub fn jittered(base: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 || base.is_zero() {
        return base;
    }
    let ratio = ratio.min(0.99);
    let factor = 1.0 + rand::thread_rng().gen_range(-ratio..ratio);
    Duration::from_millis((base.as_millis() as f64 * factor).max(1.0) as u64)
}

/// Fixed base interval with per-tick jitter.
#[derive(Debug, Clone, Copy)]
pub struct JitteredInterval {
    base: Duration,
    ratio: f64,
}

impl JitteredInterval {
    pub fn new(base: Duration, ratio: f64) -> Self {
        Self { base, ratio }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay before the next tick.
    pub fn next_delay(&self) -> Duration {
        jittered(self.base, self.ratio)
    }

    /// Upper bound of any delay this interval can produce.
    pub fn max_delay(&self) -> Duration {
        let ratio = self.ratio.clamp(0.0, 0.99);
        Duration::from_millis((self.base.as_millis() as f64 * (1.0 + ratio)).ceil() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_ratio_is_identity() {
        let base = Duration::from_millis(3000);
        assert_eq!(jittered(base, 0.0), base);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let base = Duration::from_millis(3000);
        for _ in 0..200 {
            let delay = jittered(base, 0.1);
            assert!(delay >= Duration::from_millis(2699), "{:?}", delay);
            assert!(delay <= Duration::from_millis(3301), "{:?}", delay);
        }
    }

    #[test]
    fn test_interval_max_delay() {
        let interval = JitteredInterval::new(Duration::from_millis(1000), 0.25);
        assert_eq!(interval.max_delay(), Duration::from_millis(1250));
        for _ in 0..50 {
            assert!(interval.next_delay() <= interval.max_delay());
        }
    }
}
