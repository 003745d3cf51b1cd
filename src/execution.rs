use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Uri};
use http_body_util::BodyExt;
use tracing::{Instrument, debug, info_span, warn};

use crate::backoff::BackoffStrategy;
use crate::error::{BoxError, Error, TimeoutPhase};
use crate::extensions::{Clock, SystemClock};
use crate::metrics::HttpClientMetrics;
use crate::observe::{AttemptRecord, Interceptor, NoopObserver, Observer, RequestContext};
use crate::resilience::{CircuitBreaker, CircuitManager, CircuitRejection};
use crate::response::{HttpResponse, ResponseTiming};
use crate::retry::{RetryBudget, RetryDecision, RetryPolicy};
use crate::transport::{ResponseBody, Transport};
use crate::util::{bounded_retry_delay, deadline_exceeded_error, redact_uri_for_logs};

/// A request ready to be replayed on every attempt.
#[derive(Clone, Debug)]
pub struct PreparedRequest {
    method: Method,
    uri: Uri,
    redacted_uri: String,
    headers: HeaderMap,
    body: Bytes,
}

impl PreparedRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let redacted_uri = redact_uri_for_logs(&uri.to_string());
        Self {
            method,
            uri,
            redacted_uri,
            headers,
            body: body.into(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn redacted_uri(&self) -> &str {
        &self.redacted_uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    fn to_http_request(&self) -> Result<Request<Bytes>, Error> {
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(self.headers.clone());
        }
        builder
            .body(self.body.clone())
            .map_err(|source| Error::RequestBuild { source })
    }
}

/// Knobs governing one logical request.
#[derive(Clone, Debug, Default)]
pub struct ExecutionPlan {
    pub budget: RetryBudget,
    pub retry_policy: RetryPolicy,
    /// Without a strategy the first outcome is final, whatever the policy says.
    pub backoff: Option<BackoffStrategy>,
    pub circuit: Option<String>,
    pub attempt_timeout: Option<Duration>,
    pub total_timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct ExecutionResult {
    pub attempts: usize,
    pub elapsed: Duration,
    pub result: Result<HttpResponse, Error>,
}

impl ExecutionResult {
    pub fn into_result(self) -> Result<HttpResponse, Error> {
        self.result
    }
}

struct AttemptFailure {
    error: Error,
    response: Option<HttpResponse>,
}

impl AttemptFailure {
    fn bare(error: Error) -> Self {
        Self {
            error,
            response: None,
        }
    }
}

enum AttemptError {
    Rejected(CircuitRejection),
    Failed(AttemptFailure),
}

enum ReadBodyError {
    Read(BoxError),
    TooLarge { actual_bytes: usize },
}

#[derive(Clone, Copy)]
struct AttemptScope<'a> {
    request: &'a PreparedRequest,
    limit: AttemptLimit,
    total_timeout: Option<Duration>,
    started_system: SystemTime,
    attempt: usize,
}

/// Limit applied to one attempt and whether it comes from the overall deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct AttemptLimit {
    limit: Option<Duration>,
    bounded_by_deadline: bool,
}

fn attempt_limit(
    attempt_timeout: Option<Duration>,
    total_timeout: Option<Duration>,
    elapsed: Duration,
) -> Option<AttemptLimit> {
    let remaining = match total_timeout {
        Some(total_timeout) if elapsed >= total_timeout => return None,
        Some(total_timeout) => Some(total_timeout - elapsed),
        None => None,
    };
    let limit = match (attempt_timeout, remaining) {
        (Some(attempt_timeout), Some(remaining)) => Some(attempt_timeout.min(remaining)),
        (attempt_timeout, remaining) => attempt_timeout.or(remaining),
    };
    let bounded_by_deadline = match (attempt_timeout, remaining) {
        (Some(attempt_timeout), Some(remaining)) => remaining <= attempt_timeout,
        (None, Some(_)) => true,
        _ => false,
    };
    Some(AttemptLimit {
        limit,
        bounded_by_deadline,
    })
}

fn millis_u64(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn within<F>(deadline: Option<tokio::time::Instant>, future: F) -> Option<F::Output>
where
    F: Future,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future).await.ok(),
        None => Some(future.await),
    }
}

async fn read_body_limited(
    mut body: ResponseBody,
    max_bytes: usize,
) -> Result<Bytes, ReadBodyError> {
    let mut collected = Vec::new();
    let mut total_len = 0_usize;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(ReadBodyError::Read)?;
        if let Some(data) = frame.data_ref() {
            total_len = total_len.saturating_add(data.len());
            if total_len > max_bytes {
                return Err(ReadBodyError::TooLarge {
                    actual_bytes: total_len,
                });
            }
            collected.extend_from_slice(data);
        }
    }

    Ok(Bytes::from(collected))
}

/// Drives a prepared request through breaker, transport, retry policy and
/// backoff until it succeeds, fails terminally or runs out of attempts.
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    circuits: Arc<CircuitManager>,
    observer: Arc<dyn Observer>,
    interceptors: Arc<[Arc<dyn Interceptor>]>,
    clock: Arc<dyn Clock>,
    metrics: HttpClientMetrics,
    client_name: String,
    max_response_body_bytes: usize,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestExecutor")
            .field("client_name", &self.client_name)
            .field("circuits", &self.circuits)
            .field("interceptors", &self.interceptors.len())
            .field("max_response_body_bytes", &self.max_response_body_bytes)
            .finish()
    }
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            circuits: Arc::new(CircuitManager::new()),
            observer: Arc::new(NoopObserver),
            interceptors: Arc::from(Vec::new()),
            clock: Arc::new(SystemClock),
            metrics: HttpClientMetrics::default(),
            client_name: "recast".to_owned(),
            max_response_body_bytes: 8 * 1024 * 1024,
        }
    }

    pub fn with_circuits(mut self, circuits: Arc<CircuitManager>) -> Self {
        self.circuits = circuits;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Replace the interceptor chain. Order is kept for every request.
    pub fn with_interceptors(mut self, interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        self.interceptors = Arc::from(interceptors);
        self
    }

    /// Clock for reported timestamps and latencies. Timeouts and the overall
    /// deadline always follow the tokio timer.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn with_max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes;
        self
    }

    pub(crate) fn with_metrics(mut self, metrics: HttpClientMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn circuits(&self) -> &CircuitManager {
        &self.circuits
    }

    pub fn metrics_snapshot(&self) -> crate::metrics::HttpClientMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn execute(&self, request: PreparedRequest, plan: ExecutionPlan) -> ExecutionResult {
        let started = self.clock.now();
        let timer_started = tokio::time::Instant::now();
        let started_system = self.clock.now_system();
        let max_attempts = plan.budget.max_attempts();
        self.metrics.record_request_started();
        let _in_flight = self.metrics.enter_in_flight();

        let circuit = match self.circuits.resolve(plan.circuit.as_deref()) {
            Ok(circuit) => circuit,
            Err(error) => {
                let context = RequestContext::new(
                    request.method.clone(),
                    request.redacted_uri.clone(),
                    0,
                    max_attempts,
                    plan.circuit.clone(),
                );
                return self.finish(&context, started, 0, Err(error));
            }
        };
        let base_context = RequestContext::new(
            request.method.clone(),
            request.redacted_uri.clone(),
            1,
            max_attempts,
            circuit.as_ref().map(|breaker| breaker.name().to_owned()),
        );
        self.observer.on_request_start(&base_context);

        let mut backoff = plan.backoff.as_ref().map(BackoffStrategy::start);
        let mut attempts = 0_usize;

        let result = loop {
            let attempt = attempts + 1;
            let context = base_context.with_attempt(attempt);
            let Some(limit) =
                attempt_limit(plan.attempt_timeout, plan.total_timeout, timer_started.elapsed())
            else {
                break Err(deadline_exceeded_error(
                    plan.total_timeout,
                    &request.method,
                    &request.redacted_uri,
                ));
            };
            let mut http_request = match request.to_http_request() {
                Ok(http_request) => http_request,
                Err(error) => break Err(error),
            };
            if let Err(source) = self.run_request_interceptors(&context, http_request.headers_mut())
            {
                let error = Error::RequestRejected {
                    method: request.method.clone(),
                    uri: request.redacted_uri.clone(),
                    source,
                };
                self.run_error_interceptors(&context, &error);
                break Err(error);
            }

            let span = info_span!(
                "recast.request",
                client = %self.client_name,
                method = %request.method,
                uri = %request.redacted_uri,
                attempt = attempt,
                max_attempts = max_attempts,
                circuit = context.circuit().unwrap_or("")
            );
            let attempt_started = self.clock.now();
            let attempt_started_system = self.clock.now_system();
            let scope = AttemptScope {
                request: &request,
                limit,
                total_timeout: plan.total_timeout,
                started_system,
                attempt,
            };
            let outcome = self
                .gated_attempt(circuit.as_ref(), scope, http_request)
                .instrument(span)
                .await;

            let outcome = match outcome {
                Ok(response) => Ok(response),
                Err(AttemptError::Failed(failure)) => Err(failure),
                Err(AttemptError::Rejected(rejection)) => {
                    self.metrics.record_circuit_rejection();
                    self.observer.on_circuit_rejected(&context, &rejection);
                    let circuit_name = context.circuit().unwrap_or_default().to_owned();
                    warn!(
                        circuit = %circuit_name,
                        method = %request.method,
                        uri = %request.redacted_uri,
                        attempt = attempt,
                        status = %rejection.status(),
                        retry_after_ms = millis_u64(rejection.retry_after()),
                        "circuit rejected request attempt"
                    );
                    let error = Error::CircuitOpen {
                        circuit: circuit_name,
                        method: request.method.clone(),
                        uri: request.redacted_uri.clone(),
                        retry_after_ms: rejection.retry_after().as_millis(),
                    };
                    self.run_error_interceptors(&context, &error);
                    break Err(error);
                }
            };
            attempts = attempt;
            self.metrics.record_attempt();

            let (response, error) = match &outcome {
                Ok(response) => {
                    self.run_response_interceptors(&context, response);
                    (Some(response), None)
                }
                Err(failure) => {
                    self.run_error_interceptors(&context, &failure.error);
                    (failure.response.as_ref(), Some(&failure.error))
                }
            };
            let terminal = matches!(error, Some(Error::DeadlineExceeded { .. }));
            let retryable = !terminal && plan.retry_policy.should_retry(response, error);
            let attempt_finished = self.clock.now();
            self.observer.on_attempt_complete(
                &context,
                &AttemptRecord {
                    attempt,
                    started_at: attempt_started_system,
                    finished_at: self.clock.now_system(),
                    cost: attempt_finished.saturating_duration_since(attempt_started),
                    status: response.map(HttpResponse::status),
                    error_code: error.map(Error::code),
                    retryable,
                },
            );

            if retryable
                && plan.budget.allows_attempt_after(attempt)
                && let Some(backoff) = backoff.as_mut()
            {
                let delay = backoff.next(attempt);
                let Some(delay) =
                    bounded_retry_delay(delay, plan.total_timeout, timer_started.elapsed())
                else {
                    break Err(deadline_exceeded_error(
                        plan.total_timeout,
                        &request.method,
                        &request.redacted_uri,
                    ));
                };
                let decision = RetryDecision {
                    attempt,
                    max_attempts,
                    method: request.method.clone(),
                    uri: request.redacted_uri.clone(),
                    status: response.map(HttpResponse::status),
                    error_code: error.map(Error::code),
                };
                match error {
                    Some(error) => warn!(
                        delay_ms = millis_u64(delay),
                        attempt = attempt,
                        error = %error,
                        "retrying request after error"
                    ),
                    None => warn!(
                        delay_ms = millis_u64(delay),
                        attempt = attempt,
                        status = response.map(|response| response.status().as_u16()).unwrap_or(0),
                        "retrying request after response"
                    ),
                }
                self.metrics.record_retry();
                self.observer.on_retry_scheduled(&context, &decision, delay);
                drop(outcome);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                continue;
            }

            break outcome.map_err(|failure| failure.error);
        };

        let context = base_context.with_attempt(attempts.max(1));
        self.finish(&context, started, attempts, result)
    }

    async fn gated_attempt(
        &self,
        circuit: Option<&Arc<CircuitBreaker>>,
        scope: AttemptScope<'_>,
        http_request: Request<Bytes>,
    ) -> Result<HttpResponse, AttemptError> {
        let run = move || async move {
            self.run_attempt(scope, http_request)
                .await
                .map_err(AttemptError::Failed)
        };
        match circuit {
            Some(breaker) => {
                breaker
                    .execute(run, |rejection| Err(AttemptError::Rejected(rejection)))
                    .await
            }
            None => run().await,
        }
    }

    async fn run_attempt(
        &self,
        scope: AttemptScope<'_>,
        http_request: Request<Bytes>,
    ) -> Result<HttpResponse, AttemptFailure> {
        let AttemptScope {
            request,
            limit,
            total_timeout,
            started_system,
            attempt,
        } = scope;
        let deadline = limit
            .limit
            .and_then(|limit| tokio::time::Instant::now().checked_add(limit));
        let timed_out = |phase: TimeoutPhase| {
            if limit.bounded_by_deadline {
                deadline_exceeded_error(total_timeout, &request.method, &request.redacted_uri)
            } else {
                Error::Timeout {
                    phase,
                    timeout_ms: limit.limit.unwrap_or_default().as_millis(),
                    method: request.method.clone(),
                    uri: request.redacted_uri.clone(),
                }
            }
        };

        debug!("sending request");
        let response = match within(deadline, self.transport.send(http_request)).await {
            Some(Ok(response)) => response,
            Some(Err(source)) => {
                return Err(AttemptFailure::bare(Error::Transport {
                    kind: source.kind(),
                    method: request.method.clone(),
                    uri: request.redacted_uri.clone(),
                    source: source.into_source(),
                }));
            }
            None => return Err(AttemptFailure::bare(timed_out(TimeoutPhase::Transport))),
        };

        let (parts, body) = response.into_parts();
        let body = match within(
            deadline,
            read_body_limited(body, self.max_response_body_bytes),
        )
        .await
        {
            Some(Ok(body)) => body,
            Some(Err(ReadBodyError::Read(source))) => {
                let partial = HttpResponse::new(
                    parts.status,
                    parts.headers,
                    Bytes::new(),
                    ResponseTiming::new(started_system, self.clock.now_system(), attempt),
                );
                return Err(AttemptFailure {
                    error: Error::ReadBody {
                        method: request.method.clone(),
                        uri: request.redacted_uri.clone(),
                        source,
                    },
                    response: Some(partial),
                });
            }
            Some(Err(ReadBodyError::TooLarge { actual_bytes })) => {
                return Err(AttemptFailure::bare(Error::ResponseBodyTooLarge {
                    limit_bytes: self.max_response_body_bytes,
                    actual_bytes,
                    method: request.method.clone(),
                    uri: request.redacted_uri.clone(),
                }));
            }
            None => return Err(AttemptFailure::bare(timed_out(TimeoutPhase::ResponseBody))),
        };

        debug!(status = parts.status.as_u16(), "response received");
        Ok(HttpResponse::new(
            parts.status,
            parts.headers,
            body,
            ResponseTiming::new(started_system, self.clock.now_system(), attempt),
        ))
    }

    fn run_request_interceptors(
        &self,
        context: &RequestContext,
        headers: &mut HeaderMap,
    ) -> Result<(), BoxError> {
        for interceptor in self.interceptors.iter() {
            interceptor.on_request(context, headers)?;
        }
        Ok(())
    }

    fn run_response_interceptors(&self, context: &RequestContext, response: &HttpResponse) {
        for interceptor in self.interceptors.iter() {
            interceptor.on_response(context, response);
        }
    }

    fn run_error_interceptors(&self, context: &RequestContext, error: &Error) {
        for interceptor in self.interceptors.iter() {
            interceptor.on_error(context, error);
        }
    }

    fn elapsed_since(&self, started: Instant) -> Duration {
        self.clock.now().saturating_duration_since(started)
    }

    fn finish(
        &self,
        context: &RequestContext,
        started: Instant,
        attempts: usize,
        result: Result<HttpResponse, Error>,
    ) -> ExecutionResult {
        let elapsed = self.elapsed_since(started);
        self.metrics.record_request_completed(&result, elapsed);
        self.observer
            .on_request_complete(context, attempts, elapsed, result.as_ref().err());
        ExecutionResult {
            attempts,
            elapsed,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{AttemptLimit, attempt_limit, millis_u64};

    #[test]
    fn attempt_limit_prefers_tighter_bound() {
        assert_eq!(
            attempt_limit(
                Some(Duration::from_millis(100)),
                Some(Duration::from_secs(1)),
                Duration::from_millis(200)
            ),
            Some(AttemptLimit {
                limit: Some(Duration::from_millis(100)),
                bounded_by_deadline: false,
            })
        );
        assert_eq!(
            attempt_limit(
                Some(Duration::from_millis(500)),
                Some(Duration::from_secs(1)),
                Duration::from_millis(700)
            ),
            Some(AttemptLimit {
                limit: Some(Duration::from_millis(300)),
                bounded_by_deadline: true,
            })
        );
    }

    #[test]
    fn attempt_limit_handles_missing_bounds() {
        assert_eq!(
            attempt_limit(None, None, Duration::from_secs(3)),
            Some(AttemptLimit {
                limit: None,
                bounded_by_deadline: false,
            })
        );
        assert_eq!(
            attempt_limit(None, Some(Duration::from_secs(1)), Duration::ZERO),
            Some(AttemptLimit {
                limit: Some(Duration::from_secs(1)),
                bounded_by_deadline: true,
            })
        );
    }

    #[test]
    fn millis_saturate_instead_of_truncating() {
        assert_eq!(millis_u64(Duration::from_millis(1500)), 1500);
        assert_eq!(millis_u64(Duration::MAX), u64::MAX);
    }

    #[test]
    fn attempt_limit_is_none_once_deadline_passed() {
        assert_eq!(
            attempt_limit(
                Some(Duration::from_millis(10)),
                Some(Duration::from_secs(1)),
                Duration::from_secs(1)
            ),
            None
        );
    }
}
