//! Integration tests for the retrying upstream transport

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use flowgate::errors::{GatewayError, Result};
use flowgate::proxy::{ReverseProxyBuilder, RoundTrip, TransportBuilder};
use http::{Method, Request, Response, StatusCode};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

/// Fails until `succeed_on` is reached and keeps the bodies it was sent.
struct Countdown {
    succeed_on: u32,
    calls: AtomicU32,
    bodies: Mutex<Vec<Bytes>>,
}

impl Countdown {
    fn new(succeed_on: u32) -> Arc<Self> {
        Arc::new(Self {
            succeed_on,
            calls: AtomicU32::new(0),
            bodies: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoundTrip for Countdown {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Body>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.bodies.lock().unwrap().push(req.body().clone());
        if call < self.succeed_on {
            return Err(GatewayError::transport(format!("attempt {} failed", call)));
        }
        Ok(Response::new(Body::from("finally")))
    }
}

fn post(uri: &str, body: &'static str) -> Request<Bytes> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Bytes::from_static(body.as_bytes()))
        .unwrap()
}

#[tokio::test]
async fn test_five_attempts_until_success() {
    let inner = Countdown::new(5);
    let transport = TransportBuilder::new()
        .transport(inner.clone())
        .retries(5)
        .build()
        .unwrap();

    let response = transport.round_trip(post("http://upstream/orders", "{}")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(inner.calls(), 5);
}

#[tokio::test]
async fn test_body_resent_on_every_attempt() {
    let inner = Countdown::new(3);
    let transport = TransportBuilder::new()
        .transport(inner.clone())
        .retries(3)
        .build()
        .unwrap();

    transport
        .round_trip(post("http://upstream/orders", r#"{"qty":2}"#))
        .await
        .unwrap();
    let bodies = inner.bodies.lock().unwrap();
    assert_eq!(bodies.len(), 3);
    assert!(bodies.iter().all(|b| &b[..] == br#"{"qty":2}"#));
}

#[tokio::test]
async fn test_exhausted_retries_return_last_error() {
    let inner = Countdown::new(u32::MAX);
    let transport = TransportBuilder::new()
        .transport(inner.clone())
        .retries(2)
        .build()
        .unwrap();

    let err = transport.round_trip(post("http://upstream/", "")).await.unwrap_err();
    assert_eq!(err.to_string(), "Transport error: attempt 3 failed");
    assert_eq!(inner.calls(), 3);
}

#[tokio::test]
async fn test_retry_timeout_without_retries_still_bounds_the_attempt() {
    struct Slow;

    #[async_trait]
    impl RoundTrip for Slow {
        async fn round_trip(&self, _req: Request<Bytes>) -> Result<Response<Body>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Response::new(Body::empty()))
        }
    }

    let transport = TransportBuilder::new()
        .transport(Arc::new(Slow))
        .retry_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let err = transport.round_trip(post("http://upstream/", "")).await.unwrap_err();
    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn test_reverse_proxy_over_retrying_transport() {
    let inner = Countdown::new(2);
    let transport = TransportBuilder::new()
        .transport(inner.clone())
        .retries(1)
        .build()
        .unwrap();
    let proxy = ReverseProxyBuilder::new()
        .transport(transport)
        .proxy_rewrite(false, false, false, false)
        .build(Some(Url::parse("http://example.com").unwrap()), "/orders")
        .unwrap();

    let request = Request::builder()
        .uri("/orders")
        .header("host", "gateway.local")
        .body(Bytes::new())
        .unwrap();
    let response = proxy
        .serve(flowgate::proxy::InboundRequest::new(request, None, false))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(inner.calls(), 2);
}
