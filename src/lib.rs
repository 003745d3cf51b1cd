//! `recast` is an async HTTP client with retries, backoff and named circuit breakers.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use recast::prelude::{BackoffStrategy, CircuitBreakerPolicy, HttpClient, RetryPolicy};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct CreateItemResponse {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HttpClient::builder("http://api.example.com")
//!         .client_name("my-sdk")
//!         .request_timeout(Duration::from_secs(3))
//!         .total_timeout(Duration::from_secs(8))
//!         .max_retries(3)
//!         .retry_policy(RetryPolicy::standard().retry_when_too_many_requests())
//!         .backoff(BackoffStrategy::equal_jitter(
//!             Duration::from_millis(100),
//!             Duration::from_millis(800),
//!         ))
//!         .circuit("items", CircuitBreakerPolicy::standard())
//!         .try_build()?;
//!
//!     let created: CreateItemResponse = client
//!         .post("/v1/items")
//!         .circuit("items")
//!         .json(&serde_json::json!({ "name": "demo" }))?
//!         .send_json()
//!         .await?;
//!
//!     println!("created id={}", created.id);
//!     Ok(())
//! }
//! ```
//!
//! # Retry Semantics
//!
//! - A request is retried only when the retry policy votes for it, attempts
//!   remain in the budget, and a backoff strategy is configured.
//! - An open circuit rejects the attempt without touching the transport; the
//!   rejection is final.
//! - Once the total timeout elapses no further attempt is made. The deadline
//!   runs on the tokio timer, not on the injected `Clock`.
//! - Interceptors run before every attempt; an interceptor error ends the
//!   request without calling the transport.

mod backoff;
mod client;
mod config;
mod error;
mod execution;
mod extensions;
mod metrics;
mod observe;
mod request;
mod resilience;
mod response;
mod retry;
mod transport;
mod util;

pub use crate::backoff::{Backoff, BackoffStrategy};
pub use crate::client::{HttpClient, HttpClientBuilder};
pub use crate::config::{ClientProfile, ProfileDefaults};
pub use crate::error::{BoxError, Error, ErrorCode, TimeoutPhase, TransportErrorKind};
pub use crate::execution::{ExecutionPlan, ExecutionResult, PreparedRequest, RequestExecutor};
pub use crate::extensions::{Clock, SystemClock};
pub use crate::metrics::HttpClientMetricsSnapshot;
pub use crate::observe::{AttemptRecord, Interceptor, NoopObserver, Observer, RequestContext};
pub use crate::request::RequestBuilder;
pub use crate::resilience::{
    CircuitAttempt, CircuitBreaker, CircuitBreakerPolicy, CircuitManager, CircuitRejection,
    CircuitSnapshot, CircuitStatus, WindowTotals,
};
pub use crate::response::{HttpResponse, ResponseTiming};
pub use crate::retry::{
    RetryBudget, RetryCondition, RetryDecision, RetryPolicy, StatusCondition,
    TransientErrorCondition,
};
pub use crate::transport::{
    HyperTransport, ResponseBody, Transport, TransportError, TransportFuture, full_body,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        BackoffStrategy, CircuitBreakerPolicy, ClientProfile, Error, HttpClient, HttpResponse,
        Result, RetryPolicy,
    };
}

#[cfg(test)]
mod tests;
