use std::collections::BTreeSet;
use std::sync::Arc;

use http::{Method, StatusCode};

use crate::error::{Error, ErrorCode};
use crate::response::HttpResponse;

/// Number of additional attempts allowed after the first one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryBudget {
    max_retries: usize,
}

impl RetryBudget {
    pub const fn new(max_retries: usize) -> Self {
        Self { max_retries }
    }

    pub const fn none() -> Self {
        Self::new(0)
    }

    pub const fn max_retries(self) -> usize {
        self.max_retries
    }

    pub const fn max_attempts(self) -> usize {
        self.max_retries.saturating_add(1)
    }

    /// Whether another attempt may follow attempt number `attempt`.
    pub const fn allows_attempt_after(self, attempt: usize) -> bool {
        attempt < self.max_attempts()
    }
}

/// Outcome summary handed to observers when a retry is scheduled.
#[derive(Clone, Debug)]
pub struct RetryDecision {
    pub attempt: usize,
    pub max_attempts: usize,
    pub method: Method,
    pub uri: String,
    pub status: Option<StatusCode>,
    pub error_code: Option<ErrorCode>,
}

/// One vote in a [`RetryPolicy`].
///
/// Both channels are always supplied; either may be absent. A transport
/// failure has no response, and a truncated body read carries both the
/// partial response and the read error.
pub trait RetryCondition: Send + Sync {
    fn should_retry(&self, response: Option<&HttpResponse>, error: Option<&Error>) -> bool;
}

/// Retries network timeouts, transient connection failures and bodies that
/// ended before their declared length.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransientErrorCondition;

impl RetryCondition for TransientErrorCondition {
    fn should_retry(&self, _response: Option<&HttpResponse>, error: Option<&Error>) -> bool {
        error.is_some_and(Error::is_transient)
    }
}

#[derive(Clone, Debug, Default)]
pub struct StatusCondition {
    statuses: BTreeSet<u16>,
}

impl StatusCondition {
    pub fn new(statuses: impl IntoIterator<Item = StatusCode>) -> Self {
        Self {
            statuses: statuses.into_iter().map(|status| status.as_u16()).collect(),
        }
    }

    pub fn too_many_requests() -> Self {
        Self::new([StatusCode::TOO_MANY_REQUESTS])
    }

    pub fn internal_server_error() -> Self {
        Self::new([StatusCode::INTERNAL_SERVER_ERROR])
    }
}

impl RetryCondition for StatusCondition {
    fn should_retry(&self, response: Option<&HttpResponse>, _error: Option<&Error>) -> bool {
        response.is_some_and(|response| self.statuses.contains(&response.status().as_u16()))
    }
}

struct FnCondition<F>(F);

impl<F> RetryCondition for FnCondition<F>
where
    F: Fn(Option<&HttpResponse>, Option<&Error>) -> bool + Send + Sync,
{
    fn should_retry(&self, response: Option<&HttpResponse>, error: Option<&Error>) -> bool {
        (self.0)(response, error)
    }
}

/// Ordered, immutable list of retry conditions.
///
/// Conditions are consulted in registration order and the first positive vote
/// wins. An empty policy never retries.
#[derive(Clone, Default)]
pub struct RetryPolicy {
    conditions: Vec<Arc<dyn RetryCondition>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("conditions", &self.conditions.len())
            .finish()
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            conditions: Vec::new(),
        }
    }

    pub fn standard() -> Self {
        Self::none().condition(TransientErrorCondition)
    }

    pub fn condition<C>(self, condition: C) -> Self
    where
        C: RetryCondition + 'static,
    {
        self.condition_arc(Arc::new(condition))
    }

    pub fn condition_arc(mut self, condition: Arc<dyn RetryCondition>) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn retry_if<F>(self, predicate: F) -> Self
    where
        F: Fn(Option<&HttpResponse>, Option<&Error>) -> bool + Send + Sync + 'static,
    {
        self.condition(FnCondition(predicate))
    }

    pub fn retry_on_status(self, statuses: impl IntoIterator<Item = StatusCode>) -> Self {
        self.condition(StatusCondition::new(statuses))
    }

    pub fn retry_when_too_many_requests(self) -> Self {
        self.condition(StatusCondition::too_many_requests())
    }

    pub fn retry_when_internal_server_error(self) -> Self {
        self.condition(StatusCondition::internal_server_error())
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn should_retry(&self, response: Option<&HttpResponse>, error: Option<&Error>) -> bool {
        self.conditions
            .iter()
            .any(|condition| condition.should_retry(response, error))
    }
}
