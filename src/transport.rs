use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::{Request, Response};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

use crate::error::{BoxError, Error, TransportErrorKind};
use crate::util::classify_transport_error;

pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;
pub type TransportFuture<'a> = BoxFuture<'a, Result<Response<ResponseBody>, TransportError>>;

/// Sends one HTTP request and resolves once response headers arrived.
///
/// The body is streamed back to the executor, which reads it under the same
/// attempt deadline. Dropping the future or the body aborts the exchange.
pub trait Transport: Send + Sync {
    fn send(&self, request: Request<Bytes>) -> TransportFuture<'_>;
}

#[derive(Debug, Error)]
#[error("{kind} transport failure: {source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn into_source(self) -> BoxError {
        self.source
    }
}

/// Wrap fully buffered bytes as a response body.
pub fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct HyperTransportOptions {
    pub(crate) connect_timeout: Duration,
    pub(crate) pool_idle_timeout: Duration,
    pub(crate) pool_max_idle_per_host: usize,
}

impl Default for HyperTransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 8,
        }
    }
}

/// Pooled HTTP/1.1 transport for `http` and `https` URLs.
///
/// TLS uses rustls on the ring provider with the bundled webpki roots.
#[derive(Clone, Debug)]
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

fn rustls_client_config() -> crate::Result<rustls::ClientConfig> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|source| Error::TlsBackendInit {
        message: source.to_string(),
    })?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    Ok(config)
}

impl HyperTransport {
    pub fn new() -> crate::Result<Self> {
        Self::with_options(HyperTransportOptions::default())
    }

    pub(crate) fn with_options(options: HyperTransportOptions) -> crate::Result<Self> {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(options.connect_timeout));
        connector.set_nodelay(true);
        connector.enforce_http(false);
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(rustls_client_config()?)
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(options.pool_idle_timeout)
            .pool_max_idle_per_host(options.pool_max_idle_per_host)
            .build(https);
        Ok(Self { client })
    }
}

impl Transport for HyperTransport {
    fn send(&self, request: Request<Bytes>) -> TransportFuture<'_> {
        let request = request.map(Full::new);
        let client = self.client.clone();
        async move {
            let response = client.request(request).await.map_err(|error| {
                let kind = classify_transport_error(&error);
                TransportError::new(kind, error)
            })?;
            Ok(response.map(|body| {
                body.map_err(|error| Box::new(error) as BoxError)
                    .boxed_unsync()
            }))
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::rustls_client_config;

    #[test]
    fn tls_config_loads_bundled_roots() {
        let config = rustls_client_config().expect("ring provider supports default versions");
        assert!(config.alpn_protocols.is_empty());
    }
}
