use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Error, TimeoutPhase};
use crate::response::HttpResponse;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HttpClientMetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub attempts: u64,
    pub retries: u64,
    pub circuit_rejections: u64,
    pub timeout_transport: u64,
    pub timeout_response_body: u64,
    pub deadline_exceeded: u64,
    pub transport_errors: u64,
    pub read_body_errors: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct HttpClientMetrics {
    inner: Arc<HttpClientMetricsInner>,
}

#[derive(Debug, Default)]
struct HttpClientMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    circuit_rejections: AtomicU64,
    timeout_transport: AtomicU64,
    timeout_response_body: AtomicU64,
    deadline_exceeded: AtomicU64,
    transport_errors: AtomicU64,
    read_body_errors: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    metrics: HttpClientMetrics,
}

impl HttpClientMetrics {
    pub(crate) fn record_request_started(&self) {
        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            metrics: self.clone(),
        }
    }

    pub(crate) fn record_attempt(&self) {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_circuit_rejection(&self) {
        self.inner
            .circuit_rejections
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_completed(
        &self,
        result: &Result<HttpResponse, Error>,
        latency: Duration,
    ) {
        self.record_latency(latency);
        match result {
            Ok(response) => {
                self.inner
                    .requests_succeeded
                    .fetch_add(1, Ordering::Relaxed);
                self.add_status_count(response.status().as_u16());
            }
            Err(error) => self.record_request_failed(error),
        }
    }

    fn record_request_failed(&self, error: &Error) {
        self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        match error {
            Error::Timeout { phase, .. } => {
                let counter = match phase {
                    TimeoutPhase::Transport => &self.inner.timeout_transport,
                    TimeoutPhase::ResponseBody => &self.inner.timeout_response_body,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                self.add_error_count(format!("timeout:{phase}"));
            }
            Error::DeadlineExceeded { .. } => {
                self.inner.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
                self.add_error_count(error.code().as_str().to_owned());
            }
            Error::Transport { kind, .. } => {
                self.inner.transport_errors.fetch_add(1, Ordering::Relaxed);
                self.add_error_count(format!("transport:{kind}"));
            }
            Error::ReadBody { .. } => {
                self.inner.read_body_errors.fetch_add(1, Ordering::Relaxed);
                self.add_error_count(error.code().as_str().to_owned());
            }
            _ => self.add_error_count(error.code().as_str().to_owned()),
        }
    }

    pub(crate) fn snapshot(&self) -> HttpClientMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let latency_samples = load(&self.inner.latency_samples);
        let latency_total_ms = load(&self.inner.latency_total_ms);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        HttpClientMetricsSnapshot {
            requests_started: load(&self.inner.requests_started),
            requests_succeeded: load(&self.inner.requests_succeeded),
            requests_failed: load(&self.inner.requests_failed),
            attempts: load(&self.inner.attempts),
            retries: load(&self.inner.retries),
            circuit_rejections: load(&self.inner.circuit_rejections),
            timeout_transport: load(&self.inner.timeout_transport),
            timeout_response_body: load(&self.inner.timeout_response_body),
            deadline_exceeded: load(&self.inner.deadline_exceeded),
            transport_errors: load(&self.inner.transport_errors),
            read_body_errors: load(&self.inner.read_body_errors),
            in_flight: load(&self.inner.in_flight),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&self.inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&self.inner.error_counts).clone(),
        }
    }

    fn record_latency(&self, latency: Duration) {
        self.inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        self.inner.latency_total_ms.fetch_add(
            latency.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
    }

    fn add_status_count(&self, status: u16) {
        let mut status_counts = lock_unpoisoned(&self.inner.status_counts);
        *status_counts.entry(status).or_insert(0) += 1;
    }

    fn add_error_count(&self, error_key: String) {
        let mut error_counts = lock_unpoisoned(&self.inner.error_counts);
        *error_counts.entry(error_key).or_insert(0) += 1;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
