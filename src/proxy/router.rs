//! # Routing Table
//!
//! An immutable view of the resource graph used by the data plane. A request is routed in
//! two steps:
//!
//! 1. **Namespace**: domains are tried by descending priority (then by name) and the
//!    first one with a pattern matching the request host selects its namespace. Without
//!    any domains every request goes to the default namespace.
//! 2. **Route**: the namespace's route paths are matched against the request path, most
//!    specific first. Exact paths beat `{param}` segments, which beat trailing `*`
//!    wildcards; longer literal text wins ties.
//!
//! Each route path owns a [`ReverseProxy`] built from the route's service. Upstream
//! clients come from a [`ClientCache`] keyed by connection settings, so rebuilding the
//! table keeps existing connection pools.

use axum::body::Body;
use dashmap::DashMap;
use http::header::{HeaderName, HeaderValue};
use http::{Response, StatusCode};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::pattern::match_any;
use super::reverse_proxy::{InboundRequest, ReverseProxy, ReverseProxyBuilder};
use super::transport::{HttpClientTransport, RoundTrip, TransportBuilder, UpstreamClientOptions};
use crate::config::{AppConfig, TransportConfig};
use crate::errors::{GatewayError, Result};
use crate::resources::{GatewayRoute, GatewayService, ResourceManager, DEFAULT_NAMESPACE};

const SERVICE_HEADER: &str = "x-flowgate-service";
const ROUTE_HEADER: &str = "x-flowgate-route";
const NAMESPACE_HEADER: &str = "x-flowgate-namespace";
const TAGS_HEADER: &str = "x-flowgate-tags";
const VIA: &str = "flowgate";

#[derive(Debug, Clone, Default)]
pub struct RouterOptions {
    pub transport: TransportConfig,
    pub x_forwarded_headers: bool,
    /// Node tags added to upstream requests
    pub tags: Vec<String>,
}

impl From<&AppConfig> for RouterOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            transport: config.proxy.transport.clone(),
            x_forwarded_headers: !config.proxy.disable_x_forwarded_headers,
            tags: config.node.tags.clone(),
        }
    }
}

/// Upstream clients shared across routing table rebuilds.
#[derive(Default)]
pub struct ClientCache {
    clients: DashMap<UpstreamClientOptions, Arc<dyn RoundTrip>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(&self, options: &UpstreamClientOptions) -> Result<Arc<dyn RoundTrip>> {
        if let Some(client) = self.clients.get(options) {
            return Ok(client.clone());
        }
        let client: Arc<dyn RoundTrip> = Arc::new(HttpClientTransport::new(options)?);
        Ok(self.clients.entry(options.clone()).or_insert(client).clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Compiled route path.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    regex: Regex,
    literal_len: usize,
    params: bool,
    wildcard: bool,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(GatewayError::validation_field("route path cannot be empty", "paths"));
        }
        let (body, wildcard) = match raw.strip_suffix('*') {
            Some(body) => (body, true),
            None => (raw, false),
        };
        let mut expr = String::from("^");
        let mut literal_len = 0;
        let mut params = false;
        let mut rest = body;
        while let Some(start) = rest.find('{') {
            let end = rest[start..]
                .find('}')
                .map(|i| start + i)
                .ok_or_else(|| GatewayError::validation_field(format!("unclosed parameter in {}", raw), "paths"))?;
            expr.push_str(&regex::escape(&rest[..start]));
            literal_len += start;
            expr.push_str("[^/]+");
            params = true;
            rest = &rest[end + 1..];
        }
        expr.push_str(&regex::escape(rest));
        literal_len += rest.len();
        expr.push_str(if wildcard { ".*$" } else { "$" });

        let regex = Regex::new(&expr)
            .map_err(|e| GatewayError::validation_field(format!("invalid route path {}: {}", raw, e), "paths"))?;
        Ok(Self {
            raw: raw.to_string(),
            regex,
            literal_len,
            params,
            wildcard,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    fn rank(&self) -> (u8, std::cmp::Reverse<usize>) {
        let class = match (self.wildcard, self.params) {
            (false, false) => 0,
            (false, true) => 1,
            (true, _) => 2,
        };
        (class, std::cmp::Reverse(self.literal_len))
    }
}

/// Handler for one route path.
pub struct RouteHandler {
    pub namespace: String,
    pub route: String,
    pub service: Option<String>,
    methods: Vec<String>,
    schemes: Vec<String>,
    proxy: Option<ReverseProxy>,
}

impl RouteHandler {
    fn allows_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == "*" || m.eq_ignore_ascii_case(method))
    }

    fn allows_scheme(&self, tls: bool) -> bool {
        let scheme = if tls { "https" } else { "http" };
        self.schemes.is_empty() || self.schemes.iter().any(|s| s.eq_ignore_ascii_case(scheme))
    }
}

struct RouteEntry {
    pattern: PathPattern,
    handler: Arc<RouteHandler>,
}

struct DomainEntry {
    name: String,
    namespace: String,
    patterns: Vec<String>,
}

/// Outcome of routing a request.
pub enum RouteMatch<'a> {
    Found(&'a Arc<RouteHandler>),
    NoNamespace,
    NotFound,
    MethodNotAllowed,
}

#[derive(Default)]
pub struct RoutingTable {
    domains: Vec<DomainEntry>,
    routes: HashMap<String, Vec<RouteEntry>>,
}

impl RoutingTable {
    /// Build the table from the current resource graph. Routes whose proxy cannot be
    /// built are logged and left out.
    pub fn build(resources: &ResourceManager, options: &RouterOptions, clients: &ClientCache) -> Self {
        let domains = resources
            .domains_by_priority()
            .into_iter()
            .map(|d| DomainEntry {
                name: d.name.clone(),
                namespace: d.namespace.clone(),
                patterns: d.patterns.clone(),
            })
            .collect::<Vec<_>>();

        let mut routes: HashMap<String, Vec<RouteEntry>> = HashMap::new();
        for (namespace, ns_routes) in resources.namespace_routes_map() {
            let mut entries = Vec::new();
            for route in ns_routes {
                let service = resources.route_service(route);
                for path in &route.paths {
                    match route_entry(route, service, path, options, clients) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => warn!(
                            namespace = %route.namespace,
                            route = %route.name,
                            path = %path,
                            error = %e,
                            "skipping route path"
                        ),
                    }
                }
            }
            entries.sort_by(|a, b| a.pattern.rank().cmp(&b.pattern.rank()));
            routes.insert(namespace, entries);
        }

        debug!(domains = domains.len(), namespaces = routes.len(), "routing table built");
        Self { domains, routes }
    }

    /// Namespace serving `host` (port already removed).
    pub fn find_namespace(&self, host: &str) -> Option<&str> {
        if self.domains.is_empty() {
            return Some(DEFAULT_NAMESPACE);
        }
        for domain in &self.domains {
            match match_any(host, &domain.patterns) {
                Ok(Some(_)) => return Some(&domain.namespace),
                Ok(None) => {}
                Err(e) => warn!(domain = %domain.name, error = %e, "invalid domain pattern"),
            }
        }
        None
    }

    pub fn find_route(&self, req: &InboundRequest) -> RouteMatch<'_> {
        let Some(namespace) = self.find_namespace(req.hostname()) else {
            return RouteMatch::NoNamespace;
        };
        let Some(entries) = self.routes.get(namespace) else {
            return RouteMatch::NotFound;
        };
        let mut path_matched = false;
        for entry in entries.iter().filter(|e| e.pattern.matches(req.path())) {
            path_matched = true;
            if entry.handler.allows_method(req.method.as_str()) && entry.handler.allows_scheme(req.tls) {
                return RouteMatch::Found(&entry.handler);
            }
        }
        if path_matched {
            RouteMatch::MethodNotAllowed
        } else {
            RouteMatch::NotFound
        }
    }

    pub async fn handle(&self, req: InboundRequest) -> Response<Body> {
        let handler = match self.find_route(&req) {
            RouteMatch::Found(handler) => handler.clone(),
            RouteMatch::NoNamespace => {
                debug!(host = %req.host, path = %req.path(), "no namespace for request");
                return status_response(StatusCode::NOT_FOUND);
            }
            RouteMatch::NotFound => return status_response(StatusCode::NOT_FOUND),
            RouteMatch::MethodNotAllowed => return status_response(StatusCode::METHOD_NOT_ALLOWED),
        };
        match &handler.proxy {
            Some(proxy) => proxy.serve(req).await,
            None => {
                debug!(route = %handler.route, namespace = %handler.namespace, "route has no service");
                status_response(StatusCode::NOT_IMPLEMENTED)
            }
        }
    }
}

pub fn status_response(status: StatusCode) -> Response<Body> {
    let text = format!(
        "{} {}\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default()
    );
    let mut response = Response::new(Body::from(text));
    *response.status_mut() = status;
    response
}

fn route_entry(
    route: &GatewayRoute,
    service: Option<&GatewayService>,
    path: &str,
    options: &RouterOptions,
    clients: &ClientCache,
) -> Result<RouteEntry> {
    let pattern = PathPattern::parse(path)?;
    let proxy = match service {
        Some(service) => Some(service_proxy(route, service, path, options, clients)?),
        None => None,
    };
    Ok(RouteEntry {
        pattern,
        handler: Arc::new(RouteHandler {
            namespace: route.namespace.clone(),
            route: route.name.clone(),
            service: service.map(|s| s.name.clone()),
            methods: route.methods.clone(),
            schemes: route.schemes.clone(),
            proxy,
        }),
    })
}

fn service_proxy(
    route: &GatewayRoute,
    service: &GatewayService,
    path: &str,
    options: &RouterOptions,
    clients: &ClientCache,
) -> Result<ReverseProxy> {
    let upstream = service.urls.first().cloned();
    let client = clients.get_or_build(&UpstreamClientOptions::for_service(&options.transport, service))?;
    let request_timeout = non_zero_or(
        service.request_timeout,
        Duration::from_millis(options.transport.request_timeout_ms),
    );
    let retry_timeout = non_zero_or(
        service.retry_timeout,
        Duration::from_millis(options.transport.retry_timeout_ms),
    );
    let transport = TransportBuilder::new()
        .transport(client)
        .retries(i32::try_from(service.retries).unwrap_or(i32::MAX))
        .request_timeout(request_timeout)
        .retry_timeout(retry_timeout)
        .build()?;

    let mut builder = ReverseProxyBuilder::new()
        .transport(transport)
        .flush_interval(options.transport.flush_interval())
        .proxy_rewrite(
            route.strip_path,
            route.preserve_host,
            service.disable_query_params,
            options.x_forwarded_headers,
        );

    if !service.hide_gateway_headers {
        let identity = gateway_headers(route, service, &options.tags);
        builder = builder
            .custom_rewrite(move |_, out| {
                for (name, value) in &identity {
                    out.headers.append(name.clone(), value.clone());
                }
            })
            .modify_response(|response| {
                response.headers_mut().insert(http::header::VIA, HeaderValue::from_static(VIA));
                Ok(())
            });
    }

    builder.build(upstream, path)
}

fn gateway_headers(route: &GatewayRoute, service: &GatewayService, tags: &[String]) -> Vec<(HeaderName, HeaderValue)> {
    let mut headers = Vec::new();
    let mut push = |name: &'static str, value: &str| {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.push((HeaderName::from_static(name), value));
        }
    };
    push(SERVICE_HEADER, &service.name);
    push(ROUTE_HEADER, &route.name);
    push(NAMESPACE_HEADER, &route.namespace);
    for tag in tags {
        push(TAGS_HEADER, tag);
    }
    headers
}

fn non_zero_or(value: Duration, fallback: Duration) -> Duration {
    if value.is_zero() {
        fallback
    } else {
        value
    }
}
