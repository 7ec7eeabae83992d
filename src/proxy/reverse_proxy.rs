//! # Reverse Proxy
//!
//! [`ReverseProxyBuilder`] assembles a handler forwarding to one upstream URL. Each
//! request goes through:
//!
//! 1. the custom rewrite, when set;
//! 2. the standard rewrite pipeline from [`ReverseProxyBuilder::proxy_rewrite`]
//!    (scheme/host, strip-path, host preservation, query merge, `X-Forwarded-*`);
//! 3. the transport;
//! 4. the response modifier, when set.
//!
//! Transport and modifier errors go to the error handler, which answers
//! `502 Bad Gateway` with the error text unless replaced.
//!
//! Protocol upgrades (WebSocket and friends) keep their `Connection: upgrade` and
//! `Upgrade` headers. When the upstream switches protocols the client and upstream
//! connections are joined and bytes are copied both ways until either side closes.

use axum::body::Body;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::transport::{upgrade_protocol, RoundTrip, TransportBuilder, UpstreamUpgrade};
use crate::errors::{GatewayError, Result};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_REAL_IP: &str = "x-real-ip";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

/// Client half of a pending protocol upgrade.
#[derive(Debug, Clone)]
pub struct ClientUpgrade(Arc<Mutex<Option<OnUpgrade>>>);

impl ClientUpgrade {
    pub fn new(on_upgrade: OnUpgrade) -> Self {
        Self(Arc::new(Mutex::new(Some(on_upgrade))))
    }

    fn take(&self) -> Option<OnUpgrade> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// A client request as received by the data plane.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    /// Host the client addressed, port included when given
    pub host: String,
    pub headers: HeaderMap,
    /// Client address; `ip:port` when known
    pub remote_addr: String,
    pub tls: bool,
    pub body: Bytes,
    /// Set when the client asked for a protocol upgrade the server can hand over
    pub upgrade: Option<ClientUpgrade>,
}

impl InboundRequest {
    pub fn new(request: Request<Bytes>, remote_addr: Option<SocketAddr>, tls: bool) -> Self {
        let (parts, body) = request.into_parts();
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();
        Self {
            method: parts.method,
            uri: parts.uri,
            host,
            headers: parts.headers,
            remote_addr: remote_addr.map(|a| a.to_string()).unwrap_or_default(),
            tls,
            body,
            upgrade: None,
        }
    }

    pub fn with_upgrade(mut self, on_upgrade: OnUpgrade) -> Self {
        self.upgrade = Some(ClientUpgrade::new(on_upgrade));
        self
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Host without the port.
    pub fn hostname(&self) -> &str {
        split_host(&self.host)
    }
}

fn split_host(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// The request about to be sent upstream. Rewrites operate on this.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub scheme: String,
    /// `host[:port]` the connection is made to
    pub authority: String,
    pub path: String,
    pub query: Option<String>,
    /// `Host` header value
    pub host: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    fn from_inbound(inbound: &InboundRequest) -> Self {
        let mut headers = inbound.headers.clone();
        let upgrade = upgrade_protocol(&headers).cloned();
        strip_hop_headers(&mut headers);
        if let Some(protocol) = upgrade {
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(header::UPGRADE, protocol);
        }
        for name in [X_FORWARDED_FOR, X_FORWARDED_HOST, X_FORWARDED_PROTO] {
            headers.remove(name);
        }
        headers.remove(header::HOST);
        Self {
            method: inbound.method.clone(),
            scheme: String::new(),
            authority: String::new(),
            path: inbound.uri.path().to_string(),
            query: inbound.uri.query().map(str::to_string),
            host: inbound.host.clone(),
            headers,
            body: inbound.body.clone(),
        }
    }

    pub fn url(&self) -> String {
        let path = if self.path.is_empty() { "/" } else { self.path.as_str() };
        let path = if path.starts_with('/') { path.to_string() } else { format!("/{}", path) };
        match self.query.as_deref().filter(|q| !q.is_empty()) {
            Some(query) => format!("{}://{}{}?{}", self.scheme, self.authority, path, query),
            None => format!("{}://{}{}", self.scheme, self.authority, path),
        }
    }

    fn into_request(self) -> Result<Request<Bytes>> {
        let url = self.url();
        let uri: Uri = url
            .parse()
            .map_err(|e| GatewayError::transport(format!("invalid upstream url {}: {}", url, e)))?;
        let mut request = Request::new(self.body);
        *request.method_mut() = self.method;
        *request.uri_mut() = uri;
        *request.headers_mut() = self.headers;
        if !self.host.is_empty() {
            let host = HeaderValue::from_str(&self.host)
                .map_err(|_| GatewayError::transport(format!("invalid host header {:?}", self.host)))?;
            request.headers_mut().insert(header::HOST, host);
        }
        Ok(request)
    }
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    // headers listed in Connection are hop-by-hop as well
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(header::TRANSFER_ENCODING);
}

/// Join path elements and clean the result: empty elements are skipped, `.` and `..`
/// are resolved and repeated or trailing slashes dropped. Returns `""` when every element
/// is empty.
pub fn join_path(base: &str, rest: &str) -> String {
    let joined = match (base.is_empty(), rest.is_empty()) {
        (true, true) => return String::new(),
        (true, false) => rest.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{}/{}", base, rest),
    };
    clean_path(&joined)
}

fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                _ if !rooted => segments.push(".."),
                _ => {}
            },
            other => segments.push(other),
        }
    }
    let body = segments.join("/");
    match (rooted, body.is_empty()) {
        (true, _) => format!("/{}", body),
        (false, true) => ".".to_string(),
        (false, false) => body,
    }
}

fn merge_query(upstream: Option<&str>, inbound: Option<&str>) -> Option<String> {
    match (upstream.filter(|q| !q.is_empty()), inbound.filter(|q| !q.is_empty())) {
        (Some(a), Some(b)) => Some(format!("{}&{}", a, b)),
        (Some(q), None) | (None, Some(q)) => Some(q.to_string()),
        (None, None) => None,
    }
}

pub type RewriteFn = Arc<dyn Fn(&InboundRequest, &mut OutboundRequest) + Send + Sync>;
pub type ModifyResponseFn = Arc<dyn Fn(&mut Response<Body>) -> Result<()> + Send + Sync>;
pub type ErrorHandlerFn = Arc<dyn Fn(&InboundRequest, &GatewayError) -> Response<Body> + Send + Sync>;

/// Switches for the standard rewrite pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteOptions {
    pub strip_path: bool,
    pub preserve_host: bool,
    pub disable_query_params: bool,
    pub x_forwarded_headers: bool,
}

/// Builder for [`ReverseProxy`]. Cloning yields an independent copy of the settings.
#[derive(Clone, Default)]
pub struct ReverseProxyBuilder {
    flush_interval: Option<Duration>,
    custom_rewrite: Option<RewriteFn>,
    modify_response: Option<ModifyResponseFn>,
    error_handler: Option<ErrorHandlerFn>,
    transport: Option<Arc<dyn RoundTrip>>,
    rewrite: Option<RewriteOptions>,
}

impl ReverseProxyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    pub fn custom_rewrite(
        mut self,
        rewrite: impl Fn(&InboundRequest, &mut OutboundRequest) + Send + Sync + 'static,
    ) -> Self {
        self.custom_rewrite = Some(Arc::new(rewrite));
        self
    }

    pub fn modify_response(
        mut self,
        modify: impl Fn(&mut Response<Body>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.modify_response = Some(Arc::new(modify));
        self
    }

    pub fn error_handler(
        mut self,
        handler: impl Fn(&InboundRequest, &GatewayError) -> Response<Body> + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn transport(mut self, transport: Arc<dyn RoundTrip>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn proxy_rewrite(
        mut self,
        strip_path: bool,
        preserve_host: bool,
        disable_query_params: bool,
        x_forwarded_headers: bool,
    ) -> Self {
        self.rewrite = Some(RewriteOptions {
            strip_path,
            preserve_host,
            disable_query_params,
            x_forwarded_headers,
        });
        self
    }

    pub fn build(&self, upstream: Option<Url>, pattern: &str) -> Result<ReverseProxy> {
        let upstream = upstream.ok_or_else(|| GatewayError::config("upstream url cannot be nil"))?;
        if pattern.is_empty() {
            return Err(GatewayError::config("proxy pattern cannot be empty"));
        }
        let transport = match &self.transport {
            Some(transport) => transport.clone(),
            None => TransportBuilder::new().build()?,
        };
        Ok(ReverseProxy {
            upstream,
            pattern: pattern.to_string(),
            flush_interval: self.flush_interval.unwrap_or(DEFAULT_FLUSH_INTERVAL),
            custom_rewrite: self.custom_rewrite.clone(),
            modify_response: self.modify_response.clone(),
            error_handler: self.error_handler.clone().unwrap_or_else(|| Arc::new(bad_gateway)),
            transport,
            rewrite: self.rewrite,
        })
    }
}

/// Default error handler.
pub fn bad_gateway(_req: &InboundRequest, err: &GatewayError) -> Response<Body> {
    let mut response = Response::new(Body::from(format!("{}\n", err)));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

pub struct ReverseProxy {
    upstream: Url,
    pattern: String,
    flush_interval: Duration,
    custom_rewrite: Option<RewriteFn>,
    modify_response: Option<ModifyResponseFn>,
    error_handler: ErrorHandlerFn,
    transport: Arc<dyn RoundTrip>,
    rewrite: Option<RewriteOptions>,
}

impl ReverseProxy {
    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Apply the rewrites to `inbound` without sending anything.
    pub fn rewrite(&self, inbound: &InboundRequest) -> OutboundRequest {
        let mut out = OutboundRequest::from_inbound(inbound);
        if let Some(custom) = &self.custom_rewrite {
            custom(inbound, &mut out);
        }
        if let Some(options) = self.rewrite {
            self.apply_rewrite(options, inbound, &mut out);
        }
        if out.path == "/" {
            out.path.clear();
        }
        out
    }

    fn apply_rewrite(&self, options: RewriteOptions, inbound: &InboundRequest, out: &mut OutboundRequest) {
        let upstream_authority = authority(&self.upstream);
        out.scheme = self.upstream.scheme().to_string();
        out.authority = upstream_authority.clone();

        let upstream_path = self.upstream.path();
        let request_path = inbound.path();
        out.path = if options.strip_path {
            match self.pattern.strip_suffix('*') {
                Some(prefix) => join_path(
                    upstream_path,
                    request_path.strip_prefix(prefix).unwrap_or(request_path),
                ),
                None => upstream_path.to_string(),
            }
        } else {
            join_path(upstream_path, request_path)
        };

        let scheme = if options.preserve_host {
            out.host = if inbound.host.is_empty() {
                upstream_authority
            } else {
                inbound.host.clone()
            };
            if inbound.tls { "https" } else { "http" }
        } else {
            out.host = upstream_authority;
            self.upstream.scheme()
        };
        if out.scheme.is_empty() {
            out.scheme = scheme.to_string();
        }

        out.query = if options.disable_query_params {
            None
        } else {
            merge_query(self.upstream.query(), inbound.uri.query())
        };

        if options.x_forwarded_headers {
            let client_ip = inbound
                .remote_addr
                .parse::<SocketAddr>()
                .map(|a| a.ip().to_string())
                .unwrap_or_else(|_| inbound.remote_addr.clone());
            if let Ok(value) = HeaderValue::from_str(&client_ip) {
                out.headers.append(X_FORWARDED_FOR, value.clone());
                out.headers.insert(X_REAL_IP, value);
            }
            if let Ok(value) = HeaderValue::from_str(&inbound.host) {
                out.headers.insert(X_FORWARDED_HOST, value);
            }
            let proto = if inbound.tls { "https" } else { "http" };
            out.headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
        } else {
            for name in [X_FORWARDED_FOR, X_FORWARDED_HOST, X_FORWARDED_PROTO, X_REAL_IP] {
                out.headers.remove(name);
            }
        }
    }

    /// Forward `inbound` upstream and produce the client response.
    pub async fn serve(&self, inbound: InboundRequest) -> Response<Body> {
        let out = self.rewrite(&inbound);
        debug!(method = %out.method, url = %out.url(), pattern = %self.pattern, "forwarding request");
        match self.forward(out, inbound.upgrade.as_ref()).await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, upstream = %self.upstream, "proxy error");
                (self.error_handler)(&inbound, &e)
            }
        }
    }

    async fn forward(&self, out: OutboundRequest, client: Option<&ClientUpgrade>) -> Result<Response<Body>> {
        let request = out.into_request()?;
        let mut response = self.transport.round_trip(request).await?;
        let switched = response.status() == StatusCode::SWITCHING_PROTOCOLS;
        let protocol = response.headers().get(header::UPGRADE).cloned();
        strip_hop_headers(response.headers_mut());
        if switched {
            self.tunnel(&mut response, client, protocol)?;
        }
        if let Some(modify) = &self.modify_response {
            modify(&mut response)?;
        }
        Ok(response)
    }

    /// Join the upgraded upstream connection carried by `response` with the client's.
    fn tunnel(
        &self,
        response: &mut Response<Body>,
        client: Option<&ClientUpgrade>,
        protocol: Option<HeaderValue>,
    ) -> Result<()> {
        let upstream = response
            .extensions_mut()
            .remove::<UpstreamUpgrade>()
            .and_then(|u| u.take())
            .ok_or_else(|| GatewayError::transport("upstream switched protocols without an upgraded connection"))?;
        let client = client
            .and_then(ClientUpgrade::take)
            .ok_or_else(|| GatewayError::transport("upstream switched protocols but the client did not ask to"))?;
        let protocol =
            protocol.ok_or_else(|| GatewayError::transport("upstream switched protocols without an upgrade header"))?;

        let headers = response.headers_mut();
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, protocol);

        let target = self.upstream.to_string();
        tokio::spawn(async move {
            let mut upstream = upstream;
            match client.await {
                Ok(upgraded) => {
                    let mut client = TokioIo::new(upgraded);
                    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                        Ok((sent, received)) => debug!(upstream = %target, sent, received, "upgraded connection closed"),
                        Err(e) => debug!(upstream = %target, error = %e, "upgraded connection failed"),
                    }
                }
                Err(e) => debug!(upstream = %target, error = %e, "client upgrade failed"),
            }
        });
        Ok(())
    }
}

fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}
