use std::time::{Duration, Instant};

pub const DEFAULT_FAST_VELOCITY: f64 = 1800.0;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(700);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollPolicy {
    /// Pixels per second above which a scroll counts as fast.
    pub fast_velocity: f64,
    pub cooldown: Duration,
}

impl Default for ScrollPolicy {
    fn default() -> Self {
        Self {
            fast_velocity: DEFAULT_FAST_VELOCITY,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

pub fn is_fast_velocity(px_per_sec: f64, threshold: f64) -> bool {
    px_per_sec.is_finite() && px_per_sec.abs() > threshold
}

/// Fast-scroll latch. A fast sample arms it until `cooldown` after that
/// sample; later fast samples push the deadline out, slow samples never cut it
/// short.
#[derive(Debug, Clone)]
pub struct ScrollGovernor {
    policy: ScrollPolicy,
    fast_until: Option<Instant>,
}

impl ScrollGovernor {
    pub fn new(policy: ScrollPolicy) -> Self {
        Self {
            policy,
            fast_until: None,
        }
    }

    /// Feeds one velocity sample and returns whether the latch is armed
    /// afterwards.
    pub fn observe(&mut self, px_per_sec: f64, now: Instant) -> bool {
        if is_fast_velocity(px_per_sec, self.policy.fast_velocity) {
            self.fast_until = Some(now + self.policy.cooldown);
        }
        self.is_fast(now)
    }

    pub fn is_fast(&self, now: Instant) -> bool {
        self.fast_until.is_some_and(|until| now < until)
    }

    /// Instant at which the widened window narrows again, if armed.
    pub fn expires_at(&self, now: Instant) -> Option<Instant> {
        self.fast_until.filter(|until| now < *until)
    }
}

impl Default for ScrollGovernor {
    fn default() -> Self {
        Self::new(ScrollPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_exclusive() {
        assert!(!is_fast_velocity(1800.0, 1800.0));
        assert!(is_fast_velocity(1800.5, 1800.0));
        assert!(is_fast_velocity(-3000.0, 1800.0));
        assert!(!is_fast_velocity(f64::NAN, 1800.0));
    }

    #[test]
    fn cooldown_expires() {
        let t0 = Instant::now();
        let mut gov = ScrollGovernor::default();
        assert!(gov.observe(3000.0, t0));
        assert!(gov.is_fast(t0 + Duration::from_millis(699)));
        assert!(!gov.is_fast(t0 + Duration::from_millis(700)));
    }

    #[test]
    fn slow_sample_keeps_latch_and_fast_sample_extends() {
        let t0 = Instant::now();
        let mut gov = ScrollGovernor::default();
        gov.observe(2500.0, t0);
        assert!(gov.observe(100.0, t0 + Duration::from_millis(300)));
        gov.observe(2500.0, t0 + Duration::from_millis(600));
        assert!(gov.is_fast(t0 + Duration::from_millis(1200)));
        assert!(!gov.is_fast(t0 + Duration::from_millis(1300)));
        assert_eq!(gov.expires_at(t0 + Duration::from_millis(1300)), None);
    }
}
