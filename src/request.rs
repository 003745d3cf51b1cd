use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::backoff::BackoffStrategy;
use crate::client::HttpClient;
use crate::error::Error;
use crate::execution::ExecutionResult;
use crate::response::HttpResponse;
use crate::retry::{RetryBudget, RetryPolicy};
use crate::util::{parse_header_name, parse_header_value};

/// Per-request settings; `None` falls back to the client's defaults.
#[derive(Clone, Debug, Default)]
pub(crate) struct RequestOverrides {
    pub(crate) retry_budget: Option<RetryBudget>,
    pub(crate) retry_policy: Option<RetryPolicy>,
    pub(crate) backoff: Option<Option<BackoffStrategy>>,
    pub(crate) circuit: Option<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) total_timeout: Option<Duration>,
}

pub struct RequestBuilder<'a> {
    client: &'a HttpClient,
    method: Method,
    path: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
    overrides: RequestOverrides,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a HttpClient, method: Method, path: String) -> Self {
        Self {
            client,
            method,
            path,
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            overrides: RequestOverrides::default(),
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::SerializeJson { source })?;
        Ok(self
            .body(body)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.overrides.retry_budget = Some(RetryBudget::new(max_retries));
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.overrides.retry_policy = Some(retry_policy);
        self
    }

    pub fn backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.overrides.backoff = Some(Some(backoff));
        self
    }

    /// Drop the client's backoff strategy, which also disables retries.
    pub fn no_backoff(mut self) -> Self {
        self.overrides.backoff = Some(None);
        self
    }

    pub fn circuit(mut self, name: impl Into<String>) -> Self {
        self.overrides.circuit = Some(name.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.overrides.timeout = Some(timeout);
        self
    }

    pub fn total_timeout(mut self, total_timeout: Duration) -> Self {
        self.overrides.total_timeout = Some(total_timeout);
        self
    }

    /// Run the request and report attempt count and elapsed time alongside
    /// the outcome.
    pub async fn execute(self) -> ExecutionResult {
        self.client
            .execute_request(
                self.method,
                self.path,
                self.query_pairs,
                self.headers,
                self.body,
                self.overrides,
            )
            .await
    }

    pub async fn send(self) -> crate::Result<HttpResponse> {
        self.execute().await.into_result()
    }

    pub async fn send_json<T>(self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        let response = self.send().await?;
        response.json()
    }
}
