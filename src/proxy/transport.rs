//! # Upstream Transport
//!
//! [`RoundTrip`] sends one buffered request upstream and returns the streamed response.
//! [`HttpClientTransport`] is the pooled `reqwest` implementation; [`TransportBuilder`]
//! wraps any transport with bounded retries and timeouts:
//!
//! - `ws`/`wss` requests are forwarded once, without retries or timeouts.
//! - other requests get up to `retries + 1` attempts; the first success wins and the last
//!   error is returned when every attempt fails.
//! - `request_timeout` bounds each attempt, `retry_timeout` bounds all attempts together
//!   measured from the first one. Zero disables either.
//!
//! A request carrying `Connection: upgrade` is sent over HTTP/1.1. When the upstream
//! answers `101 Switching Protocols` the upgraded connection travels with the response as
//! an [`UpstreamUpgrade`] extension for the proxy to tunnel.

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Request, Response, StatusCode, Uri, Version};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::errors::{GatewayError, Result};
use crate::resources::GatewayService;

#[async_trait]
pub trait RoundTrip: Send + Sync {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Body>>;
}

/// Copy of a buffered request; extensions are not carried over.
pub fn clone_request(req: &Request<Bytes>) -> Request<Bytes> {
    let mut copy = Request::new(req.body().clone());
    *copy.method_mut() = req.method().clone();
    *copy.uri_mut() = req.uri().clone();
    *copy.version_mut() = req.version();
    *copy.headers_mut() = req.headers().clone();
    copy
}

fn is_websocket(uri: &Uri) -> bool {
    matches!(uri.scheme_str(), Some("ws") | Some("wss"))
}

/// Protocol requested in `Upgrade` when `Connection` lists `upgrade`.
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<&HeaderValue> {
    let requested = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if requested {
        headers.get(header::UPGRADE)
    } else {
        None
    }
}

/// Byte stream of an upgraded connection.
pub trait UpgradedIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpgradedIo for T {}

/// Upstream half of an upgraded connection, attached to `101` responses.
#[derive(Clone)]
pub struct UpstreamUpgrade(Arc<Mutex<Option<Box<dyn UpgradedIo>>>>);

impl UpstreamUpgrade {
    pub fn new(io: impl UpgradedIo + 'static) -> Self {
        Self(Arc::new(Mutex::new(Some(Box::new(io)))))
    }

    /// The connection, once.
    pub fn take(&self) -> Option<Box<dyn UpgradedIo>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Connection settings for an upstream client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct UpstreamClientOptions {
    pub connect_timeout: Option<Duration>,
    pub max_idle_per_host: Option<usize>,
    pub tls_skip_verify: bool,
    pub http2_only: bool,
}

impl UpstreamClientOptions {
    /// Proxy-wide settings overridden by the service's own.
    pub fn for_service(config: &TransportConfig, service: &GatewayService) -> Self {
        Self {
            connect_timeout: if service.connect_timeout.is_zero() {
                config.connect_timeout()
            } else {
                Some(service.connect_timeout)
            },
            max_idle_per_host: Some(config.max_idle_per_host),
            tls_skip_verify: service.tls_skip_verify,
            http2_only: service.http2_only,
        }
    }
}

/// Pooled HTTP client transport. Redirects are passed back to the caller untouched.
#[derive(Clone)]
pub struct HttpClientTransport {
    client: reqwest::Client,
}

impl HttpClientTransport {
    pub fn new(options: &UpstreamClientOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(options.tls_skip_verify);
        if let Some(timeout) = options.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(max_idle) = options.max_idle_per_host {
            builder = builder.pool_max_idle_per_host(max_idle);
        }
        if options.http2_only {
            builder = builder.http2_prior_knowledge();
        }
        let client = builder
            .build()
            .map_err(|e| GatewayError::config_with_source("failed to build upstream client", Box::new(e)))?;
        Ok(Self { client })
    }
}

fn upstream_url(uri: &Uri) -> Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(&uri.to_string())
        .map_err(|e| GatewayError::transport(format!("invalid upstream url {}: {}", uri, e)))?;
    let scheme = match url.scheme() {
        "ws" => Some("http"),
        "wss" => Some("https"),
        _ => None,
    };
    if let Some(scheme) = scheme {
        // ws and http urls share a parser class, so the swap cannot fail
        let _ = url.set_scheme(scheme);
    }
    Ok(url)
}

#[async_trait]
impl RoundTrip for HttpClientTransport {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Body>> {
        let (parts, body) = req.into_parts();
        let url = upstream_url(&parts.uri)?;
        let upgrade = upgrade_protocol(&parts.headers).is_some();
        let mut request = reqwest::Request::new(parts.method, url);
        *request.headers_mut() = parts.headers;
        *request.body_mut() = Some(reqwest::Body::from(body));
        if upgrade {
            *request.version_mut() = Version::HTTP_11;
        }

        let upstream = self
            .client
            .execute(request)
            .await
            .map_err(|e| GatewayError::transport(format!("upstream request failed: {}", e)))?;

        let mut response = Response::builder()
            .status(upstream.status())
            .version(upstream.version());
        if let Some(headers) = response.headers_mut() {
            *headers = upstream.headers().clone();
        }
        if upgrade && upstream.status() == StatusCode::SWITCHING_PROTOCOLS {
            let io = upstream
                .upgrade()
                .await
                .map_err(|e| GatewayError::transport(format!("upstream upgrade failed: {}", e)))?;
            return response
                .extension(UpstreamUpgrade::new(io))
                .body(Body::empty())
                .map_err(|e| GatewayError::internal(format!("failed to build upstream response: {}", e)));
        }
        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| GatewayError::internal(format!("failed to build upstream response: {}", e)))
    }
}

/// Builder for a retrying transport. Cloning yields an independent copy of the settings.
#[derive(Clone, Default)]
pub struct TransportBuilder {
    transport: Option<Arc<dyn RoundTrip>>,
    request_timeout: Duration,
    retries: i32,
    retry_timeout: Duration,
}

impl TransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(mut self, transport: Arc<dyn RoundTrip>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: i32) -> Self {
        self.retries = retries;
        self
    }

    pub fn retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }

    /// Build the transport. Without retries or a request timeout the inner transport is
    /// returned as is.
    pub fn build(&self) -> Result<Arc<dyn RoundTrip>> {
        let retries = u32::try_from(self.retries)
            .map_err(|_| GatewayError::config("retries must be greater than or equal to 0"))?;
        let transport = match &self.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(HttpClientTransport::new(&UpstreamClientOptions::default())?),
        };
        if retries == 0 && self.request_timeout.is_zero() && self.retry_timeout.is_zero() {
            return Ok(transport);
        }
        Ok(Arc::new(RetryTransport {
            transport,
            retries,
            request_timeout: self.request_timeout,
            retry_timeout: self.retry_timeout,
        }))
    }
}

struct RetryTransport {
    transport: Arc<dyn RoundTrip>,
    retries: u32,
    request_timeout: Duration,
    retry_timeout: Duration,
}

impl RetryTransport {
    /// Timeout for the next attempt, or `None` when neither bound applies.
    fn attempt_timeout(&self, deadline: Option<Instant>) -> Option<Duration> {
        let per_attempt = (!self.request_timeout.is_zero()).then_some(self.request_timeout);
        match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                Some(per_attempt.map_or(remaining, |t| t.min(remaining)))
            }
            None => per_attempt,
        }
    }
}

#[async_trait]
impl RoundTrip for RetryTransport {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Body>> {
        if is_websocket(req.uri()) {
            return self.transport.round_trip(req).await;
        }

        let deadline = (!self.retry_timeout.is_zero()).then(|| Instant::now() + self.retry_timeout);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let request = clone_request(&req);
            let result = match self.attempt_timeout(deadline) {
                Some(timeout) => match tokio::time::timeout(timeout, self.transport.round_trip(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::transport(format!(
                        "upstream request timed out after {}ms",
                        timeout.as_millis()
                    ))),
                },
                None => self.transport.round_trip(request).await,
            };

            let err = match result {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            if attempt > self.retries {
                return Err(err);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(
                    attempt,
                    retry_timeout_ms = self.retry_timeout.as_millis() as u64,
                    error = %err,
                    "retry budget exhausted"
                );
                return Err(err);
            }
            debug!(attempt, uri = %req.uri(), error = %err, "retrying upstream request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, optionally sleeping before answering.
    struct Flaky {
        failures: u32,
        delay: Duration,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                failures,
                delay,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RoundTrip for Flaky {
        async fn round_trip(&self, _req: Request<Bytes>) -> Result<Response<Body>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if call <= self.failures {
                return Err(GatewayError::transport("connection refused"));
            }
            Ok(Response::new(Body::from("ok")))
        }
    }

    fn get(uri: &str) -> Request<Bytes> {
        Request::builder().uri(uri).body(Bytes::new()).unwrap()
    }

    #[test]
    fn test_negative_retries_rejected() {
        let err = TransportBuilder::new()
            .transport(Flaky::new(0, Duration::ZERO))
            .retries(-1)
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("retries must be greater than or equal to 0"));
    }

    #[tokio::test]
    async fn test_without_retries_inner_is_called_once() {
        let inner = Flaky::new(1, Duration::ZERO);
        let transport = TransportBuilder::new().transport(inner.clone()).build().unwrap();
        assert!(transport.round_trip(get("http://upstream/")).await.is_err());
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let inner = Flaky::new(2, Duration::ZERO);
        let transport = TransportBuilder::new()
            .transport(inner.clone())
            .retries(3)
            .build()
            .unwrap();
        let response = transport.round_trip(get("http://upstream/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test]
    async fn test_last_error_after_all_attempts() {
        let inner = Flaky::new(10, Duration::ZERO);
        let transport = TransportBuilder::new()
            .transport(inner.clone())
            .retries(2)
            .build()
            .unwrap();
        let err = transport.round_trip(get("http://upstream/")).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test]
    async fn test_websocket_forwarded_once() {
        let inner = Flaky::new(10, Duration::ZERO);
        let transport = TransportBuilder::new()
            .transport(inner.clone())
            .retries(5)
            .build()
            .unwrap();
        assert!(transport.round_trip(get("ws://upstream/socket")).await.is_err());
        assert!(transport.round_trip(get("wss://upstream/socket")).await.is_err());
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test]
    async fn test_request_timeout_per_attempt() {
        let inner = Flaky::new(0, Duration::from_millis(500));
        let transport = TransportBuilder::new()
            .transport(inner.clone())
            .retries(1)
            .request_timeout(Duration::from_millis(20))
            .build()
            .unwrap();
        let err = transport.round_trip(get("http://upstream/")).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test]
    async fn test_retry_timeout_caps_attempts() {
        let inner = Flaky::new(100, Duration::from_millis(40));
        let transport = TransportBuilder::new()
            .transport(inner.clone())
            .retries(50)
            .retry_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        assert!(transport.round_trip(get("http://upstream/")).await.is_err());
        let calls = inner.calls();
        assert!((2..=4).contains(&calls), "unexpected attempt count {}", calls);
    }

    #[test]
    fn test_clone_is_independent() {
        let base = TransportBuilder::new().retries(2);
        let derived = base.clone().retries(-4);
        assert!(derived.build().is_err());
        assert_eq!(base.retries, 2);
    }

    #[test]
    fn test_upgrade_protocol_requires_connection_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(upgrade_protocol(&headers).is_none());
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert_eq!(upgrade_protocol(&headers).unwrap(), "websocket");
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        assert!(upgrade_protocol(&headers).is_none());
    }

    #[test]
    fn test_upstream_upgrade_taken_once() {
        let (io, _peer) = tokio::io::duplex(64);
        let upgrade = UpstreamUpgrade::new(io);
        let copy = upgrade.clone();
        assert!(copy.take().is_some());
        assert!(upgrade.take().is_none());
    }

    #[test]
    fn test_websocket_scheme_mapped_for_client() {
        let uri: Uri = "wss://upstream:9443/socket?x=1".parse().unwrap();
        assert_eq!(upstream_url(&uri).unwrap().as_str(), "https://upstream:9443/socket?x=1");
    }
}
