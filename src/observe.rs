use std::time::{Duration, SystemTime};

use http::{HeaderMap, Method, StatusCode};

use crate::error::{BoxError, Error, ErrorCode};
use crate::resilience::CircuitRejection;
use crate::response::HttpResponse;
use crate::retry::RetryDecision;

#[derive(Clone, Debug)]
pub struct RequestContext {
    method: Method,
    uri: String,
    attempt: usize,
    max_attempts: usize,
    circuit: Option<String>,
}

impl RequestContext {
    pub(crate) fn new(
        method: Method,
        uri: String,
        attempt: usize,
        max_attempts: usize,
        circuit: Option<String>,
    ) -> Self {
        Self {
            method,
            uri,
            attempt,
            max_attempts,
            circuit,
        }
    }

    pub(crate) fn with_attempt(&self, attempt: usize) -> Self {
        let mut context = self.clone();
        context.attempt = attempt;
        context
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request URI with credentials, query and fragment removed.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn circuit(&self) -> Option<&str> {
        self.circuit.as_deref()
    }
}

/// One transport call and what came of it.
#[derive(Clone, Debug)]
pub struct AttemptRecord {
    pub attempt: usize,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    pub cost: Duration,
    pub status: Option<StatusCode>,
    pub error_code: Option<ErrorCode>,
    pub retryable: bool,
}

/// Hooks into the lifecycle of a logical request.
///
/// Every method has an empty default so implementors pick what they need.
/// Hooks run inline on the request task and must not block.
pub trait Observer: Send + Sync {
    fn on_request_start(&self, _context: &RequestContext) {}

    fn on_attempt_complete(&self, _context: &RequestContext, _record: &AttemptRecord) {}

    fn on_retry_scheduled(
        &self,
        _context: &RequestContext,
        _decision: &RetryDecision,
        _delay: Duration,
    ) {
    }

    fn on_circuit_rejected(&self, _context: &RequestContext, _rejection: &CircuitRejection) {}

    fn on_request_complete(
        &self,
        _context: &RequestContext,
        _attempts: usize,
        _elapsed: Duration,
        _error: Option<&Error>,
    ) {
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Request and response hooks that may edit outgoing headers.
///
/// Interceptors run in registration order. `on_request` runs before every
/// attempt; returning an error ends the request without calling the
/// transport.
pub trait Interceptor: Send + Sync {
    fn on_request(
        &self,
        _context: &RequestContext,
        _headers: &mut HeaderMap,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    fn on_response(&self, _context: &RequestContext, _response: &HttpResponse) {}

    fn on_error(&self, _context: &RequestContext, _error: &Error) {}
}
