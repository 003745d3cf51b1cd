use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};

use crate::backoff::BackoffStrategy;
use crate::config::ClientProfile;
use crate::error::Error;
use crate::execution::{ExecutionPlan, ExecutionResult, PreparedRequest, RequestExecutor};
use crate::extensions::{Clock, SystemClock};
use crate::metrics::{HttpClientMetrics, HttpClientMetricsSnapshot};
use crate::observe::{Interceptor, NoopObserver, Observer};
use crate::request::{RequestBuilder, RequestOverrides};
use crate::resilience::{CircuitBreaker, CircuitBreakerPolicy, CircuitManager, CircuitSnapshot};
use crate::retry::{RetryBudget, RetryPolicy};
use crate::transport::{HyperTransport, HyperTransportOptions, Transport};
use crate::util::{
    merge_headers, parse_header_name, parse_header_value, resolve_uri, validate_base_url,
};

const DEFAULT_CLIENT_NAME: &str = "recast";
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

pub struct HttpClientBuilder {
    base_url: String,
    default_headers: HeaderMap,
    request_timeout: Duration,
    total_timeout: Option<Duration>,
    max_response_body_bytes: usize,
    connect_timeout: Duration,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
    retry_budget: RetryBudget,
    retry_policy: RetryPolicy,
    backoff: Option<BackoffStrategy>,
    circuits: Vec<(String, CircuitBreakerPolicy)>,
    default_circuit: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    observer: Arc<dyn Observer>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    clock: Arc<dyn Clock>,
    client_name: String,
}

impl HttpClientBuilder {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        let defaults = ClientProfile::default().defaults();
        Self {
            base_url: base_url.into(),
            default_headers: HeaderMap::new(),
            request_timeout: defaults.request_timeout,
            total_timeout: defaults.total_timeout,
            max_response_body_bytes: defaults.max_response_body_bytes,
            connect_timeout: defaults.connect_timeout,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            retry_budget: defaults.retry_budget,
            retry_policy: defaults.retry_policy,
            backoff: defaults.backoff,
            circuits: Vec::new(),
            default_circuit: None,
            transport: None,
            observer: Arc::new(NoopObserver),
            interceptors: Vec::new(),
            clock: Arc::new(SystemClock),
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
        }
    }

    /// Replace timeouts, retry settings and body limits with a preset.
    pub fn profile(mut self, profile: ClientProfile) -> Self {
        let defaults = profile.defaults();
        self.request_timeout = defaults.request_timeout;
        self.total_timeout = defaults.total_timeout;
        self.max_response_body_bytes = defaults.max_response_body_bytes;
        self.connect_timeout = defaults.connect_timeout;
        self.retry_budget = defaults.retry_budget;
        self.retry_policy = defaults.retry_policy;
        self.backoff = defaults.backoff;
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn total_timeout(mut self, total_timeout: Duration) -> Self {
        self.total_timeout = Some(total_timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host.max(1);
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.retry_budget = RetryBudget::new(max_retries);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Set the wait between attempts. Requests are only retried when a
    /// strategy is configured.
    pub fn backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn no_backoff(mut self) -> Self {
        self.backoff = None;
        self
    }

    pub fn circuit(mut self, name: impl Into<String>, policy: CircuitBreakerPolicy) -> Self {
        self.circuits.push((name.into(), policy));
        self
    }

    pub fn default_circuit(mut self, name: impl Into<String>) -> Self {
        self.default_circuit = Some(name.into());
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn interceptor_arc(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Append an interceptor; they run in the order they were added.
    pub fn interceptor<I>(self, interceptor: I) -> Self
    where
        I: Interceptor + 'static,
    {
        self.interceptor_arc(Arc::new(interceptor))
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn try_build(self) -> crate::Result<HttpClient> {
        validate_base_url(&self.base_url)?;

        let mut circuits = CircuitManager::with_clock(Arc::clone(&self.clock));
        for (name, policy) in self.circuits {
            circuits.register(name, policy)?;
        }
        if let Some(default_circuit) = self.default_circuit {
            circuits.set_default(default_circuit)?;
        }

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::with_options(HyperTransportOptions {
                connect_timeout: self.connect_timeout,
                pool_idle_timeout: self.pool_idle_timeout,
                pool_max_idle_per_host: self.pool_max_idle_per_host,
            })?),
        };
        let executor = RequestExecutor::new(transport)
            .with_circuits(Arc::new(circuits))
            .with_observer(self.observer)
            .with_interceptors(self.interceptors)
            .with_clock(self.clock)
            .with_client_name(self.client_name)
            .with_max_response_body_bytes(self.max_response_body_bytes)
            .with_metrics(HttpClientMetrics::default());

        Ok(HttpClient {
            base_url: self.base_url,
            default_headers: self.default_headers,
            request_timeout: self.request_timeout,
            total_timeout: self.total_timeout,
            retry_budget: self.retry_budget,
            retry_policy: self.retry_policy,
            backoff: self.backoff,
            executor,
        })
    }
}

#[derive(Clone, Debug)]
pub struct HttpClient {
    base_url: String,
    default_headers: HeaderMap,
    request_timeout: Duration,
    total_timeout: Option<Duration>,
    retry_budget: RetryBudget,
    retry_policy: RetryPolicy,
    backoff: Option<BackoffStrategy>,
    executor: RequestExecutor,
}

impl HttpClient {
    pub fn builder(base_url: impl Into<String>) -> HttpClientBuilder {
        HttpClientBuilder::new(base_url)
    }

    pub fn request(&self, method: Method, path: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, path.into())
    }

    pub fn get(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, path)
    }

    pub fn head(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::HEAD, path)
    }

    pub fn circuit(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.executor.circuits().get(name)
    }

    pub fn circuit_snapshots(&self) -> Vec<CircuitSnapshot> {
        self.executor.circuits().snapshots()
    }

    pub fn metrics_snapshot(&self) -> HttpClientMetricsSnapshot {
        self.executor.metrics_snapshot()
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    pub(crate) async fn execute_request(
        &self,
        method: Method,
        path: String,
        query_pairs: Vec<(String, String)>,
        headers: HeaderMap,
        body: Bytes,
        overrides: RequestOverrides,
    ) -> ExecutionResult {
        let request = match self.prepare(method, &path, &query_pairs, &headers, body) {
            Ok(request) => request,
            Err(error) => {
                return ExecutionResult {
                    attempts: 0,
                    elapsed: Duration::ZERO,
                    result: Err(error),
                };
            }
        };
        let plan = ExecutionPlan {
            budget: overrides.retry_budget.unwrap_or(self.retry_budget),
            retry_policy: overrides
                .retry_policy
                .unwrap_or_else(|| self.retry_policy.clone()),
            backoff: overrides.backoff.unwrap_or(self.backoff),
            circuit: overrides.circuit,
            attempt_timeout: Some(overrides.timeout.unwrap_or(self.request_timeout)),
            total_timeout: overrides.total_timeout.or(self.total_timeout),
        };
        self.executor.execute(request, plan).await
    }

    fn prepare(
        &self,
        method: Method,
        path: &str,
        query_pairs: &[(String, String)],
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<PreparedRequest, Error> {
        let (uri_text, _) = resolve_uri(&self.base_url, path)?;
        let uri_text = append_query_pairs(&uri_text, query_pairs);
        let uri = uri_text
            .parse()
            .map_err(|_| Error::InvalidUri { uri: uri_text })?;
        let headers = merge_headers(&self.default_headers, headers);
        Ok(PreparedRequest::new(method, uri, headers, body))
    }
}

fn append_query_pairs(uri_text: &str, query_pairs: &[(String, String)]) -> String {
    if query_pairs.is_empty() {
        return uri_text.to_owned();
    }
    let (without_fragment, fragment) = match uri_text.split_once('#') {
        Some((head, fragment)) => (head, Some(fragment)),
        None => (uri_text, None),
    };
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in query_pairs {
        serializer.append_pair(name, value);
    }
    let encoded = serializer.finish();
    let separator = if !without_fragment.contains('?') {
        "?"
    } else if without_fragment.ends_with('?') || without_fragment.ends_with('&') {
        ""
    } else {
        "&"
    };
    let mut joined = format!("{without_fragment}{separator}{encoded}");
    if let Some(fragment) = fragment {
        joined.push('#');
        joined.push_str(fragment);
    }
    joined
}
