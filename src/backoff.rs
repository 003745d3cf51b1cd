//! Wait-time strategies applied between two attempts of one logical request.
//!
//! Every variant is a pure function of the attempt ordinal (starting at 1),
//! except [`BackoffStrategy::DecorrelatedJitter`], whose next range depends on
//! the previous sleep. That rolling value is never stored in the strategy
//! itself: each request obtains its own [`Backoff`] through
//! [`BackoffStrategy::start`], so concurrent requests sharing one client
//! configuration never observe each other's history.
//!
//! ```
//! use std::time::Duration;
//! use recast::BackoffStrategy;
//!
//! let strategy = BackoffStrategy::exponential(Duration::from_secs(1), Duration::from_secs(10));
//! let waits: Vec<_> = (1..=5).map(|attempt| strategy.backoff(attempt)).collect();
//! assert_eq!(
//!     waits,
//!     [2, 4, 8, 10, 10].map(Duration::from_secs).to_vec(),
//! );
//! ```

use std::time::Duration;

use rand::RngExt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// `attempt * slope`
    Linear { slope: Duration },
    /// `interval`, whatever the attempt.
    Constant { interval: Duration },
    /// `min(cap, base * 2^attempt)`
    Exponential { base: Duration, cap: Duration },
    /// Half of the exponential value, plus a uniform draw over the other half.
    EqualJitter { base: Duration, cap: Duration },
    /// Uniform draw between zero and the exponential value.
    FullJitter { base: Duration, cap: Duration },
    /// `min(cap, uniform(base, 3 * previous_sleep))`
    DecorrelatedJitter { base: Duration, cap: Duration },
}

impl BackoffStrategy {
    pub const fn linear(slope: Duration) -> Self {
        Self::Linear { slope }
    }

    pub const fn constant(interval: Duration) -> Self {
        Self::Constant { interval }
    }

    pub fn exponential(base: Duration, cap: Duration) -> Self {
        Self::Exponential {
            base,
            cap: cap.max(base),
        }
    }

    pub fn equal_jitter(base: Duration, cap: Duration) -> Self {
        Self::EqualJitter {
            base,
            cap: cap.max(base),
        }
    }

    pub fn full_jitter(base: Duration, cap: Duration) -> Self {
        Self::FullJitter {
            base,
            cap: cap.max(base),
        }
    }

    pub fn decorrelated_jitter(base: Duration, cap: Duration) -> Self {
        Self::DecorrelatedJitter {
            base,
            cap: cap.max(base),
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Linear { .. } => "linear",
            Self::Constant { .. } => "constant",
            Self::Exponential { .. } => "exponential",
            Self::EqualJitter { .. } => "equal_jitter",
            Self::FullJitter { .. } => "full_jitter",
            Self::DecorrelatedJitter { .. } => "decorrelated_jitter",
        }
    }

    /// Stateless wait for `attempt`.
    ///
    /// Decorrelated jitter is computed as if the previous sleep were `base`,
    /// i.e. the first step of a fresh [`Backoff`].
    pub fn backoff(&self, attempt: usize) -> Duration {
        compute_backoff(*self, attempt, self.initial_sleep())
    }

    /// Per-request state, seeded for the first retry.
    pub fn start(&self) -> Backoff {
        Backoff {
            strategy: *self,
            previous_sleep: self.initial_sleep(),
        }
    }

    fn initial_sleep(&self) -> Duration {
        match self {
            Self::DecorrelatedJitter { base, .. } => *base,
            _ => Duration::ZERO,
        }
    }
}

/// Rolling backoff state owned by a single logical request.
#[derive(Clone, Debug)]
pub struct Backoff {
    strategy: BackoffStrategy,
    previous_sleep: Duration,
}

impl Backoff {
    pub fn next(&mut self, attempt: usize) -> Duration {
        let delay = compute_backoff(self.strategy, attempt, self.previous_sleep);
        if matches!(self.strategy, BackoffStrategy::DecorrelatedJitter { .. }) {
            self.previous_sleep = delay;
        }
        delay
    }

    pub fn strategy(&self) -> BackoffStrategy {
        self.strategy
    }

    pub fn reset(&mut self) {
        self.previous_sleep = self.strategy.initial_sleep();
    }
}

fn compute_backoff(strategy: BackoffStrategy, attempt: usize, previous_sleep: Duration) -> Duration {
    let delay_ns = match strategy {
        BackoffStrategy::Linear { slope } => {
            let attempt = attempt.min(u64::MAX as usize) as u64;
            as_nanos(slope).saturating_mul(attempt)
        }
        BackoffStrategy::Constant { interval } => as_nanos(interval),
        BackoffStrategy::Exponential { base, cap } => exponential_nanos(base, cap, attempt),
        BackoffStrategy::EqualJitter { base, cap } => {
            let value = exponential_nanos(base, cap, attempt);
            let half = value / 2;
            half.saturating_add(uniform(0, value - half))
        }
        BackoffStrategy::FullJitter { base, cap } => {
            uniform(0, exponential_nanos(base, cap, attempt))
        }
        BackoffStrategy::DecorrelatedJitter { base, cap } => {
            let base_ns = as_nanos(base);
            let cap_ns = as_nanos(cap).max(base_ns);
            let upper = as_nanos(previous_sleep).saturating_mul(3);
            uniform(base_ns, upper).min(cap_ns)
        }
    };
    Duration::from_nanos(delay_ns)
}

fn exponential_nanos(base: Duration, cap: Duration, attempt: usize) -> u64 {
    let base_ns = as_nanos(base);
    let cap_ns = as_nanos(cap).max(base_ns);
    let exponent = attempt.min(63) as u32;
    base_ns.saturating_mul(1_u64 << exponent).min(cap_ns)
}

/// Uniform draw over `[min, max)`; an empty range collapses to `min`.
fn uniform(min: u64, max: u64) -> u64 {
    if max <= min {
        return min;
    }
    let mut rng = rand::rng();
    rng.random_range(min..max)
}

fn as_nanos(duration: Duration) -> u64 {
    duration.as_nanos().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{BackoffStrategy, uniform};

    const SAMPLES: usize = 512;

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let strategy = BackoffStrategy::linear(Duration::from_secs(1));
        for attempt in 1..=3 {
            assert_eq!(
                strategy.backoff(attempt),
                Duration::from_secs(attempt as u64)
            );
        }
    }

    #[test]
    fn constant_backoff_ignores_attempt() {
        let strategy = BackoffStrategy::constant(Duration::from_secs(2));
        for attempt in 1..=16 {
            assert_eq!(strategy.backoff(attempt), Duration::from_secs(2));
        }
    }

    #[test]
    fn exponential_backoff_doubles_until_cap() {
        let strategy =
            BackoffStrategy::exponential(Duration::from_secs(1), Duration::from_secs(10));
        let waits: Vec<_> = (1..=5).map(|attempt| strategy.backoff(attempt)).collect();
        assert_eq!(
            waits,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ]
        );
    }

    #[test]
    fn exponential_backoff_saturates_for_huge_attempts() {
        let strategy =
            BackoffStrategy::exponential(Duration::from_millis(250), Duration::from_secs(30));
        assert_eq!(strategy.backoff(10_000), Duration::from_secs(30));
        assert_eq!(strategy.backoff(usize::MAX), Duration::from_secs(30));
    }

    #[test]
    fn exponential_cap_is_never_below_base() {
        let strategy =
            BackoffStrategy::exponential(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(strategy.backoff(1), Duration::from_secs(5));
    }

    #[test]
    fn equal_jitter_keeps_half_of_exponential_value() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(2);
        let strategy = BackoffStrategy::equal_jitter(base, cap);
        let reference = BackoffStrategy::exponential(base, cap);
        for attempt in 1..=8 {
            let ceiling = reference.backoff(attempt);
            for _ in 0..SAMPLES {
                let wait = strategy.backoff(attempt);
                assert!(wait >= ceiling / 2, "attempt {attempt}: {wait:?} below floor");
                assert!(wait <= ceiling, "attempt {attempt}: {wait:?} above ceiling");
            }
        }
    }

    #[test]
    fn full_jitter_stays_under_exponential_value() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(2);
        let strategy = BackoffStrategy::full_jitter(base, cap);
        let reference = BackoffStrategy::exponential(base, cap);
        for attempt in 1..=8 {
            let ceiling = reference.backoff(attempt);
            for _ in 0..SAMPLES {
                assert!(strategy.backoff(attempt) <= ceiling);
            }
        }
    }

    #[test]
    fn decorrelated_jitter_stays_between_base_and_cap() {
        let base = Duration::from_millis(10);
        let cap = Duration::from_millis(500);
        let strategy = BackoffStrategy::decorrelated_jitter(base, cap);
        let mut backoff = strategy.start();
        for attempt in 1..=SAMPLES {
            let wait = backoff.next(attempt);
            assert!(wait >= base && wait <= cap, "attempt {attempt}: {wait:?}");
        }
    }

    #[test]
    fn decorrelated_jitter_grows_from_previous_sleep() {
        let base = Duration::from_millis(10);
        let cap = Duration::from_secs(3600);
        let mut backoff = BackoffStrategy::decorrelated_jitter(base, cap).start();

        let mut previous = base;
        for attempt in 1..=32 {
            let wait = backoff.next(attempt);
            assert!(wait < previous * 3 || wait == base, "{wait:?} escaped 3x{previous:?}");
            previous = wait;
        }
    }

    #[test]
    fn reset_restores_seed_sleep() {
        let base = Duration::from_millis(10);
        let mut backoff =
            BackoffStrategy::decorrelated_jitter(base, Duration::from_secs(1)).start();
        for attempt in 1..=8 {
            backoff.next(attempt);
        }
        backoff.reset();
        assert!(backoff.next(1) < base * 3);
    }

    #[test]
    fn zero_durations_never_panic() {
        let strategies = [
            BackoffStrategy::linear(Duration::ZERO),
            BackoffStrategy::constant(Duration::ZERO),
            BackoffStrategy::exponential(Duration::ZERO, Duration::ZERO),
            BackoffStrategy::equal_jitter(Duration::ZERO, Duration::ZERO),
            BackoffStrategy::full_jitter(Duration::ZERO, Duration::ZERO),
            BackoffStrategy::decorrelated_jitter(Duration::ZERO, Duration::ZERO),
        ];
        for strategy in strategies {
            let mut backoff = strategy.start();
            for attempt in 1..=4 {
                assert_eq!(backoff.next(attempt), Duration::ZERO, "{}", strategy.name());
            }
        }
    }

    #[test]
    fn uniform_stays_in_half_open_range() {
        for _ in 0..SAMPLES {
            let value = uniform(3, 10);
            assert!((3..10).contains(&value));
        }
        assert_eq!(uniform(7, 7), 7);
        assert_eq!(uniform(9, 2), 9);
    }
}
