//! Named circuit breakers.
//!
//! A breaker counts attempt outcomes in a time-bucketed rolling window while
//! closed. Once enough attempts were seen and the failure share reaches the
//! configured percentage, it opens and rejects attempts without touching the
//! transport. After the sleep window a limited number of probes are let
//! through; enough consecutive probe successes close it again, a single probe
//! failure reopens it.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::Error;
use crate::extensions::{Clock, SystemClock};
use crate::util::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitBreakerPolicy {
    error_threshold_percentage: u8,
    request_volume_threshold: usize,
    rolling_duration: Duration,
    num_buckets: usize,
    sleep_window: Duration,
    half_open_attempts: usize,
    required_concurrent_successful: usize,
}

impl CircuitBreakerPolicy {
    pub const fn standard() -> Self {
        Self {
            error_threshold_percentage: 60,
            request_volume_threshold: 50,
            rolling_duration: Duration::from_secs(10),
            num_buckets: 10,
            sleep_window: Duration::from_secs(10),
            half_open_attempts: 1,
            required_concurrent_successful: 1,
        }
    }

    pub const fn error_threshold_percentage(mut self, error_threshold_percentage: u8) -> Self {
        self.error_threshold_percentage = error_threshold_percentage;
        self
    }

    pub const fn request_volume_threshold(mut self, request_volume_threshold: usize) -> Self {
        self.request_volume_threshold = request_volume_threshold;
        self
    }

    pub const fn rolling_window(mut self, rolling_duration: Duration, num_buckets: usize) -> Self {
        self.rolling_duration = rolling_duration;
        self.num_buckets = num_buckets;
        self
    }

    pub const fn sleep_window(mut self, sleep_window: Duration) -> Self {
        self.sleep_window = sleep_window;
        self
    }

    pub const fn half_open_attempts(mut self, half_open_attempts: usize) -> Self {
        self.half_open_attempts = half_open_attempts;
        self
    }

    pub const fn required_concurrent_successful(
        mut self,
        required_concurrent_successful: usize,
    ) -> Self {
        self.required_concurrent_successful = required_concurrent_successful;
        self
    }

    pub const fn configured_sleep_window(self) -> Duration {
        self.sleep_window
    }

    pub(crate) fn validate(self, circuit: &str) -> crate::Result<()> {
        let invalid = |message: &'static str| Error::InvalidCircuitPolicy {
            circuit: circuit.to_owned(),
            message,
        };
        if self.error_threshold_percentage == 0 || self.error_threshold_percentage > 100 {
            return Err(invalid("error_threshold_percentage must be within 1..=100"));
        }
        if self.num_buckets == 0 {
            return Err(invalid("num_buckets must be >= 1"));
        }
        if self.num_buckets > u32::MAX as usize {
            return Err(invalid("num_buckets is too large"));
        }
        if self.rolling_duration.as_nanos() < self.num_buckets as u128 {
            return Err(invalid("rolling_duration must leave every bucket a non-zero width"));
        }
        if self.half_open_attempts == 0 {
            return Err(invalid("half_open_attempts must be >= 1"));
        }
        if self.required_concurrent_successful == 0 {
            return Err(invalid("required_concurrent_successful must be >= 1"));
        }
        Ok(())
    }

    fn bucket_width(self) -> Duration {
        let buckets = self.num_buckets.clamp(1, u32::MAX as usize) as u32;
        (self.rolling_duration / buckets).max(Duration::from_nanos(1))
    }

    fn should_open(self, totals: WindowTotals) -> bool {
        let attempts = totals.attempts();
        if attempts == 0 || (attempts as u128) < self.request_volume_threshold as u128 {
            return false;
        }
        totals.failures as u128 * 100 >= self.error_threshold_percentage as u128 * attempts as u128
    }
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowTotals {
    pub successes: u64,
    pub failures: u64,
}

impl WindowTotals {
    pub fn attempts(self) -> u64 {
        self.successes.saturating_add(self.failures)
    }

    pub fn error_percentage(self) -> f64 {
        let attempts = self.attempts();
        if attempts == 0 {
            return 0.0;
        }
        self.failures as f64 * 100.0 / attempts as f64
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Bucket {
    epoch: u64,
    successes: u64,
    failures: u64,
}

#[derive(Debug)]
struct RollingWindow {
    origin: Instant,
    bucket_width: Duration,
    buckets: Vec<Bucket>,
}

impl RollingWindow {
    fn new(policy: CircuitBreakerPolicy, origin: Instant) -> Self {
        Self {
            origin,
            bucket_width: policy.bucket_width(),
            buckets: vec![Bucket::default(); policy.num_buckets.max(1)],
        }
    }

    fn epoch_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin);
        let epoch = elapsed.as_nanos() / self.bucket_width.as_nanos().max(1);
        epoch.min(u64::MAX as u128) as u64
    }

    fn current_bucket(&mut self, now: Instant) -> &mut Bucket {
        let epoch = self.epoch_at(now);
        let slot = (epoch % self.buckets.len() as u64) as usize;
        let bucket = &mut self.buckets[slot];
        if bucket.epoch != epoch {
            *bucket = Bucket {
                epoch,
                successes: 0,
                failures: 0,
            };
        }
        bucket
    }

    fn record_success(&mut self, now: Instant) {
        let bucket = self.current_bucket(now);
        bucket.successes = bucket.successes.saturating_add(1);
    }

    fn record_failure(&mut self, now: Instant) {
        let bucket = self.current_bucket(now);
        bucket.failures = bucket.failures.saturating_add(1);
    }

    fn totals(&self, now: Instant) -> WindowTotals {
        let newest = self.epoch_at(now);
        let oldest = newest.saturating_sub(self.buckets.len() as u64 - 1);
        self.buckets
            .iter()
            .filter(|bucket| bucket.epoch >= oldest && bucket.epoch <= newest)
            .fold(WindowTotals::default(), |totals, bucket| WindowTotals {
                successes: totals.successes.saturating_add(bucket.successes),
                failures: totals.failures.saturating_add(bucket.failures),
            })
    }

    fn reset(&mut self, now: Instant) {
        self.origin = now;
        self.buckets.fill(Bucket::default());
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitStatus {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        formatter.write_str(text)
    }
}

#[derive(Debug)]
enum CircuitState {
    Closed,
    Open {
        opened_at: Instant,
    },
    HalfOpen {
        active_probes: usize,
        consecutive_successes: usize,
    },
    ForcedOpen,
}

impl CircuitState {
    fn status(&self) -> CircuitStatus {
        match self {
            Self::Closed => CircuitStatus::Closed,
            Self::Open { .. } | Self::ForcedOpen => CircuitStatus::Open,
            Self::HalfOpen { .. } => CircuitStatus::HalfOpen,
        }
    }
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    window: RollingWindow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CircuitAttemptKind {
    Closed,
    HalfOpen,
}

/// Why an attempt was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitRejection {
    status: CircuitStatus,
    retry_after: Duration,
}

impl CircuitRejection {
    pub fn status(&self) -> CircuitStatus {
        self.status
    }

    /// Time until the breaker will admit a probe; zero when probes are merely
    /// saturated.
    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CircuitSnapshot {
    pub name: String,
    pub status: CircuitStatus,
    pub window: WindowTotals,
    pub rejections: u64,
}

pub struct CircuitBreaker {
    name: String,
    policy: CircuitBreakerPolicy,
    clock: Arc<dyn Clock>,
    inner: Mutex<CircuitInner>,
    rejections: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("status", &self.status())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, policy: CircuitBreakerPolicy) -> Self {
        Self::with_clock(name, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: impl Into<String>,
        policy: CircuitBreakerPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let origin = clock.now();
        Self {
            name: name.into(),
            policy,
            clock,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                window: RollingWindow::new(policy, origin),
            }),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> CircuitBreakerPolicy {
        self.policy
    }

    pub fn status(&self) -> CircuitStatus {
        lock_unpoisoned(&self.inner).state.status()
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = lock_unpoisoned(&self.inner);
        let window = inner.window.totals(self.clock.now());
        CircuitSnapshot {
            name: self.name.clone(),
            status: inner.state.status(),
            window,
            rejections: self.rejections(),
        }
    }

    /// Open the circuit until [`CircuitBreaker::force_closed`] is called.
    pub fn force_open(&self) {
        let mut inner = lock_unpoisoned(&self.inner);
        inner.state = CircuitState::ForcedOpen;
        warn!(circuit = %self.name, "circuit forced open");
    }

    pub fn force_closed(&self) {
        let mut inner = lock_unpoisoned(&self.inner);
        let now = self.clock.now();
        inner.state = CircuitState::Closed;
        inner.window.reset(now);
        info!(circuit = %self.name, "circuit forced closed");
    }

    /// Admit one attempt, or report why it must not reach the transport.
    ///
    /// The returned guard records a failure if dropped before
    /// [`CircuitAttempt::mark_success`] is called.
    pub fn begin(self: &Arc<Self>) -> Result<CircuitAttempt, CircuitRejection> {
        let mut guard = lock_unpoisoned(&self.inner);
        let inner = &mut *guard;
        let now = self.clock.now();
        let admitted = match &mut inner.state {
            CircuitState::Closed => Ok(CircuitAttemptKind::Closed),
            CircuitState::Open { opened_at } => {
                let elapsed = now.saturating_duration_since(*opened_at);
                if elapsed >= self.policy.sleep_window {
                    inner.state = CircuitState::HalfOpen {
                        active_probes: 1,
                        consecutive_successes: 0,
                    };
                    info!(circuit = %self.name, "circuit half-open; admitting probe");
                    Ok(CircuitAttemptKind::HalfOpen)
                } else {
                    Err(CircuitRejection {
                        status: CircuitStatus::Open,
                        retry_after: self.policy.sleep_window - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen { active_probes, .. } => {
                if *active_probes >= self.policy.half_open_attempts.max(1) {
                    Err(CircuitRejection {
                        status: CircuitStatus::HalfOpen,
                        retry_after: Duration::ZERO,
                    })
                } else {
                    *active_probes = active_probes.saturating_add(1);
                    Ok(CircuitAttemptKind::HalfOpen)
                }
            }
            CircuitState::ForcedOpen => Err(CircuitRejection {
                status: CircuitStatus::Open,
                retry_after: self.policy.sleep_window,
            }),
        };
        drop(guard);

        match admitted {
            Ok(kind) => Ok(CircuitAttempt {
                breaker: Arc::clone(self),
                kind,
                completed: false,
            }),
            Err(rejection) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                Err(rejection)
            }
        }
    }

    /// Run `attempt` when the circuit admits it and record its result;
    /// otherwise hand the rejection to `fallback` without running `attempt`.
    pub async fn execute<T, E, F, Fut, Fb>(self: &Arc<Self>, attempt: F, fallback: Fb) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Fb: FnOnce(CircuitRejection) -> Result<T, E>,
    {
        let guard = match self.begin() {
            Ok(guard) => guard,
            Err(rejection) => return fallback(rejection),
        };
        let result = attempt().await;
        if result.is_ok() {
            guard.mark_success();
        } else {
            guard.mark_failure();
        }
        result
    }

    fn record_success(&self, kind: CircuitAttemptKind) {
        let mut guard = lock_unpoisoned(&self.inner);
        let inner = &mut *guard;
        let now = self.clock.now();
        match (&mut inner.state, kind) {
            (CircuitState::Closed, CircuitAttemptKind::Closed) => {
                inner.window.record_success(now);
            }
            (
                CircuitState::HalfOpen {
                    active_probes,
                    consecutive_successes,
                },
                CircuitAttemptKind::HalfOpen,
            ) => {
                *active_probes = active_probes.saturating_sub(1);
                *consecutive_successes = consecutive_successes.saturating_add(1);
                if *consecutive_successes >= self.policy.required_concurrent_successful.max(1) {
                    inner.state = CircuitState::Closed;
                    inner.window.reset(now);
                    info!(circuit = %self.name, "circuit closed after successful probes");
                }
            }
            _ => {}
        }
    }

    fn record_failure(&self, kind: CircuitAttemptKind) {
        let mut guard = lock_unpoisoned(&self.inner);
        let inner = &mut *guard;
        let now = self.clock.now();
        match (&inner.state, kind) {
            (CircuitState::Closed, CircuitAttemptKind::Closed) => {
                inner.window.record_failure(now);
                let totals = inner.window.totals(now);
                if self.policy.should_open(totals) {
                    inner.state = CircuitState::Open { opened_at: now };
                    warn!(
                        circuit = %self.name,
                        failures = totals.failures,
                        attempts = totals.attempts(),
                        error_percentage = totals.error_percentage(),
                        "circuit opened"
                    );
                }
            }
            (CircuitState::HalfOpen { .. }, CircuitAttemptKind::HalfOpen) => {
                inner.state = CircuitState::Open { opened_at: now };
                warn!(circuit = %self.name, "half-open probe failed; circuit reopened");
            }
            _ => {}
        }
    }
}

/// Admission ticket for one attempt through a [`CircuitBreaker`].
pub struct CircuitAttempt {
    breaker: Arc<CircuitBreaker>,
    kind: CircuitAttemptKind,
    completed: bool,
}

impl CircuitAttempt {
    pub fn mark_success(mut self) {
        self.breaker.record_success(self.kind);
        self.completed = true;
    }

    pub fn mark_failure(mut self) {
        self.breaker.record_failure(self.kind);
        self.completed = true;
    }

    pub fn is_probe(&self) -> bool {
        self.kind == CircuitAttemptKind::HalfOpen
    }
}

impl Drop for CircuitAttempt {
    fn drop(&mut self) {
        if !self.completed {
            self.breaker.record_failure(self.kind);
            self.completed = true;
        }
    }
}

/// Client-level registry of named circuits.
#[derive(Clone)]
pub struct CircuitManager {
    circuits: BTreeMap<String, Arc<CircuitBreaker>>,
    default_circuit: Option<String>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitManager {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CircuitManager")
            .field("circuits", &self.circuits.keys().collect::<Vec<_>>())
            .field("default_circuit", &self.default_circuit)
            .finish()
    }
}

impl Default for CircuitManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            circuits: BTreeMap::new(),
            default_circuit: None,
            clock,
        }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        policy: CircuitBreakerPolicy,
    ) -> crate::Result<Arc<CircuitBreaker>> {
        let name = name.into();
        policy.validate(&name)?;
        if self.circuits.contains_key(&name) {
            return Err(Error::DuplicateCircuit { circuit: name });
        }
        let breaker = Arc::new(CircuitBreaker::with_clock(
            name.clone(),
            policy,
            Arc::clone(&self.clock),
        ));
        self.circuits.insert(name, Arc::clone(&breaker));
        Ok(breaker)
    }

    /// Route requests that name no circuit through `name`.
    pub fn set_default(&mut self, name: impl Into<String>) -> crate::Result<()> {
        let name = name.into();
        if !self.circuits.contains_key(&name) {
            return Err(Error::UnknownCircuit { circuit: name });
        }
        self.default_circuit = Some(name);
        Ok(())
    }

    pub fn default_circuit(&self) -> Option<&str> {
        self.default_circuit.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.circuits.get(name).cloned()
    }

    /// Pick the breaker for one request.
    ///
    /// A named circuit must exist. Without a name, the default circuit is
    /// used, then the sole registered circuit when there is exactly one;
    /// otherwise no breaker applies.
    pub fn resolve(&self, requested: Option<&str>) -> crate::Result<Option<Arc<CircuitBreaker>>> {
        if let Some(name) = requested.or(self.default_circuit.as_deref()) {
            return self
                .get(name)
                .map(Some)
                .ok_or_else(|| Error::UnknownCircuit {
                    circuit: name.to_owned(),
                });
        }
        if self.circuits.len() == 1 {
            return Ok(self.circuits.values().next().cloned());
        }
        Ok(None)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.circuits.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        self.circuits
            .values()
            .map(|breaker| breaker.snapshot())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant, SystemTime};

    use super::{
        CircuitBreaker, CircuitBreakerPolicy, CircuitManager, CircuitStatus, WindowTotals,
    };
    use crate::error::Error;
    use crate::extensions::Clock;

    struct ManualClock {
        origin: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                origin: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            })
        }

        fn advance(&self, by: Duration) {
            let mut offset = self.offset.lock().expect("clock lock");
            *offset += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.origin + *self.offset.lock().expect("clock lock")
        }

        fn now_system(&self) -> SystemTime {
            SystemTime::UNIX_EPOCH + *self.offset.lock().expect("clock lock")
        }
    }

    fn small_policy() -> CircuitBreakerPolicy {
        CircuitBreakerPolicy::standard()
            .error_threshold_percentage(50)
            .request_volume_threshold(4)
            .rolling_window(Duration::from_secs(10), 10)
            .sleep_window(Duration::from_secs(5))
            .half_open_attempts(1)
            .required_concurrent_successful(1)
    }

    fn breaker(clock: &Arc<ManualClock>, policy: CircuitBreakerPolicy) -> Arc<CircuitBreaker> {
        let clock: Arc<dyn Clock> = Arc::clone(clock) as Arc<dyn Clock>;
        Arc::new(CircuitBreaker::with_clock("payments", policy, clock))
    }

    fn succeed(breaker: &Arc<CircuitBreaker>) {
        breaker
            .begin()
            .expect("attempt should be admitted")
            .mark_success();
    }

    fn fail(breaker: &Arc<CircuitBreaker>) {
        breaker
            .begin()
            .expect("attempt should be admitted")
            .mark_failure();
    }

    #[test]
    fn stays_closed_below_request_volume() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, small_policy());
        for _ in 0..3 {
            fail(&breaker);
        }
        assert_eq!(breaker.status(), CircuitStatus::Closed);
    }

    #[test]
    fn opens_when_error_percentage_reaches_threshold() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, small_policy());
        succeed(&breaker);
        succeed(&breaker);
        fail(&breaker);
        assert_eq!(breaker.status(), CircuitStatus::Closed);
        fail(&breaker);
        assert_eq!(breaker.status(), CircuitStatus::Open);

        let rejection = breaker.begin().err().expect("open circuit must reject");
        assert_eq!(rejection.status(), CircuitStatus::Open);
        assert_eq!(rejection.retry_after(), Duration::from_secs(5));
        assert_eq!(breaker.rejections(), 1);
    }

    #[test]
    fn successes_keep_error_share_under_threshold() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, small_policy());
        for _ in 0..6 {
            succeed(&breaker);
        }
        for _ in 0..5 {
            fail(&breaker);
        }
        assert_eq!(breaker.status(), CircuitStatus::Closed);
        fail(&breaker);
        assert_eq!(breaker.status(), CircuitStatus::Open);
    }

    #[test]
    fn rolling_window_forgets_old_failures() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, small_policy());
        for _ in 0..3 {
            fail(&breaker);
        }
        clock.advance(Duration::from_secs(11));
        fail(&breaker);
        assert_eq!(breaker.status(), CircuitStatus::Closed);
        assert_eq!(
            breaker.snapshot().window,
            WindowTotals {
                successes: 0,
                failures: 1
            }
        );
    }

    #[test]
    fn rolling_window_keeps_recent_buckets() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, small_policy());
        for _ in 0..3 {
            fail(&breaker);
            clock.advance(Duration::from_secs(2));
        }
        fail(&breaker);
        assert_eq!(breaker.status(), CircuitStatus::Open);
    }

    #[test]
    fn half_open_after_sleep_window_and_closes_on_success() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, small_policy().request_volume_threshold(1));
        fail(&breaker);
        assert_eq!(breaker.status(), CircuitStatus::Open);

        clock.advance(Duration::from_secs(4));
        assert!(breaker.begin().is_err());

        clock.advance(Duration::from_secs(1));
        let probe = breaker
            .begin()
            .expect("sleep window elapsed, probe should be admitted");
        assert!(probe.is_probe());
        assert_eq!(breaker.status(), CircuitStatus::HalfOpen);
        assert!(
            breaker.begin().is_err(),
            "only one probe may run at a time"
        );
        probe.mark_success();
        assert_eq!(breaker.status(), CircuitStatus::Closed);
        succeed(&breaker);
    }

    #[test]
    fn probe_failure_reopens_circuit() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, small_policy().request_volume_threshold(1));
        fail(&breaker);
        clock.advance(Duration::from_secs(5));
        drop(breaker.begin().expect("probe should be admitted"));
        assert_eq!(breaker.status(), CircuitStatus::Open);
        assert!(breaker.begin().is_err());
    }

    #[test]
    fn closing_requires_consecutive_probe_successes() {
        let clock = ManualClock::new();
        let breaker = breaker(
            &clock,
            small_policy()
                .request_volume_threshold(1)
                .half_open_attempts(2)
                .required_concurrent_successful(2),
        );
        fail(&breaker);
        clock.advance(Duration::from_secs(5));

        let first = breaker.begin().expect("first probe");
        let second = breaker.begin().expect("second probe");
        assert!(breaker.begin().is_err());
        first.mark_success();
        assert_eq!(breaker.status(), CircuitStatus::HalfOpen);
        second.mark_success();
        assert_eq!(breaker.status(), CircuitStatus::Closed);
    }

    #[test]
    fn forced_open_ignores_sleep_window() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, small_policy());
        breaker.force_open();
        clock.advance(Duration::from_secs(60));
        assert!(breaker.begin().is_err());
        breaker.force_closed();
        succeed(&breaker);
        assert_eq!(breaker.status(), CircuitStatus::Closed);
    }

    #[test]
    fn stale_closed_attempt_does_not_disturb_open_circuit() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, small_policy().request_volume_threshold(1));
        let in_flight = breaker.begin().expect("closed attempt");
        fail(&breaker);
        assert_eq!(breaker.status(), CircuitStatus::Open);
        in_flight.mark_success();
        assert_eq!(breaker.status(), CircuitStatus::Open);
    }

    #[test]
    fn concurrent_recording_counts_every_outcome_once() {
        let breaker = Arc::new(CircuitBreaker::new(
            "shared",
            CircuitBreakerPolicy::standard().request_volume_threshold(usize::MAX),
        ));
        let workers: Vec<_> = (0..8)
            .map(|index| {
                let breaker = Arc::clone(&breaker);
                thread::spawn(move || {
                    for _ in 0..250 {
                        let attempt = breaker.begin().expect("closed circuit admits");
                        if index % 2 == 0 {
                            attempt.mark_success();
                        } else {
                            attempt.mark_failure();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker should not panic");
        }

        let window = breaker.snapshot().window;
        assert_eq!(window.successes, 1000);
        assert_eq!(window.failures, 1000);
    }

    #[tokio::test]
    async fn execute_skips_attempt_when_open() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, small_policy());
        breaker.force_open();

        let mut attempted = false;
        let result: Result<u8, String> = breaker
            .execute(
                || {
                    attempted = true;
                    async { Ok(1) }
                },
                |rejection| Err(format!("rejected while {}", rejection.status())),
            )
            .await;

        assert!(!attempted);
        assert_eq!(result, Err("rejected while open".to_owned()));
    }

    #[tokio::test]
    async fn execute_records_attempt_result() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, small_policy().request_volume_threshold(1));
        let result: Result<(), &str> = breaker
            .execute(|| async { Err("boom") }, |_| Ok(()))
            .await;
        assert_eq!(result, Err("boom"));
        assert_eq!(breaker.status(), CircuitStatus::Open);
    }

    #[test]
    fn manager_resolves_by_name_or_sole_circuit() {
        let mut manager = CircuitManager::new();
        assert!(manager.resolve(None).expect("resolve").is_none());

        manager
            .register("search", CircuitBreakerPolicy::standard())
            .expect("register search");
        let sole = manager
            .resolve(None)
            .expect("resolve")
            .expect("sole circuit is the default");
        assert_eq!(sole.name(), "search");

        manager
            .register("billing", CircuitBreakerPolicy::standard())
            .expect("register billing");
        assert!(manager.resolve(None).expect("resolve").is_none());
        let billing = manager
            .resolve(Some("billing"))
            .expect("resolve")
            .expect("named circuit");
        assert_eq!(billing.name(), "billing");
        assert_eq!(manager.names().collect::<Vec<_>>(), vec!["billing", "search"]);

        manager.set_default("search").expect("search is registered");
        let fallback = manager
            .resolve(None)
            .expect("resolve")
            .expect("default circuit applies");
        assert_eq!(fallback.name(), "search");
        assert!(matches!(
            manager.set_default("missing"),
            Err(Error::UnknownCircuit { .. })
        ));
    }

    #[test]
    fn manager_rejects_unknown_duplicate_and_invalid_circuits() {
        let mut manager = CircuitManager::new();
        manager
            .register("search", CircuitBreakerPolicy::standard())
            .expect("register search");

        assert!(matches!(
            manager.resolve(Some("missing")),
            Err(Error::UnknownCircuit { circuit }) if circuit == "missing"
        ));
        assert!(matches!(
            manager.register("search", CircuitBreakerPolicy::standard()),
            Err(Error::DuplicateCircuit { .. })
        ));
        assert!(matches!(
            manager.register(
                "broken",
                CircuitBreakerPolicy::standard().rolling_window(Duration::from_secs(1), 0)
            ),
            Err(Error::InvalidCircuitPolicy { .. })
        ));
        assert!(matches!(
            manager.register(
                "broken",
                CircuitBreakerPolicy::standard().error_threshold_percentage(0)
            ),
            Err(Error::InvalidCircuitPolicy { .. })
        ));
    }
}
