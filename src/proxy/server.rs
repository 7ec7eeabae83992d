//! Data-plane HTTP server.
//!
//! Every request is buffered, wrapped in an [`InboundRequest`] and handed to the current
//! [`RoutingTable`]. The table is swapped whenever the gateway state publishes a new
//! revision. Requests asking for a protocol upgrade carry the connection's pending
//! upgrade so the proxy can tunnel it.

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::response::Response;
use axum::Router;
use http::StatusCode;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use super::reverse_proxy::InboundRequest;
use super::router::{status_response, ClientCache, RouterOptions, RoutingTable};
use super::transport::upgrade_protocol;
use crate::errors::{GatewayError, Result};
use crate::request_span;
use crate::state::GatewayState;

/// Largest request body buffered for forwarding.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub struct DataPlane {
    options: RouterOptions,
    clients: ClientCache,
    table: RwLock<Arc<RoutingTable>>,
}

impl DataPlane {
    pub fn new(options: RouterOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            clients: ClientCache::new(),
            table: RwLock::new(Arc::new(RoutingTable::default())),
        })
    }

    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Rebuild the routing table from the current resource graph.
    pub async fn reload(&self, state: &GatewayState) {
        let table = {
            let resources = state.resources().await;
            RoutingTable::build(&resources, &self.options, &self.clients)
        };
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
        debug!("routing table reloaded");
    }

    /// Reload on every state revision until `shutdown` fires.
    pub fn spawn_reloader(self: &Arc<Self>, state: Arc<GatewayState>, shutdown: CancellationToken) -> JoinHandle<()> {
        let plane = self.clone();
        tokio::spawn(async move {
            let mut revision = state.subscribe_revision();
            plane.reload(&state).await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = revision.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = *revision.borrow_and_update();
                        debug!(revision = current, "state revision changed");
                        plane.reload(&state).await;
                    }
                }
            }
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new().fallback(proxy_request).with_state(self.clone())
    }

    /// Serve the data plane on `listener` until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener.local_addr()?;
        info!(address = %local, "data plane listening");
        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| GatewayError::transport(format!("data plane server failed: {}", e)))
    }
}

async fn proxy_request(State(plane): State<Arc<DataPlane>>, mut request: Request) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let span = request_span!(request.method(), request.uri().path());
    async move {
        let on_upgrade = upgrade_protocol(request.headers())
            .is_some()
            .then(|| hyper::upgrade::on(&mut request));
        let (parts, body) = request.into_parts();
        let body = match to_bytes(body, MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "failed to read request body");
                return status_response(StatusCode::PAYLOAD_TOO_LARGE);
            }
        };
        let mut inbound = InboundRequest::new(http::Request::from_parts(parts, body), remote, false);
        if let Some(on_upgrade) = on_upgrade {
            inbound = inbound.with_upgrade(on_upgrade);
        }
        let response: http::Response<Body> = plane.table().handle(inbound).await;
        debug!(status = response.status().as_u16(), "request completed");
        response
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::{ChangeLog, Command, Resource};
    use crate::resources::{Route, Service};
    use crate::state::StateOptions;
    use crate::storage::MemoryStorage;
    use crate::store::Store;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tower::ServiceExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_proxies_to_upstream_after_reload() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/items"))
            .and(header("x-flowgate-route", "items"))
            .respond_with(ResponseTemplate::new(200).set_body_string("upstream says hi"))
            .mount(&upstream)
            .await;

        let state = GatewayState::new(
            Arc::new(Store::new(Arc::new(MemoryStorage::new()))),
            StateOptions::default(),
        );
        state.start().await.unwrap();
        let service = Service::new("items", "default", vec![format!("{}/v1", upstream.uri())]);
        state
            .apply_change_log(ChangeLog::new(Command::add(Resource::Service), "default", "items", &service).unwrap())
            .await
            .unwrap();
        let mut route = Route::new("items", "default");
        route.paths = vec!["/api/*".to_string()];
        route.strip_path = true;
        route.service = Some("items".to_string());
        state
            .apply_change_log(ChangeLog::new(Command::add(Resource::Route), "default", "items", &route).unwrap())
            .await
            .unwrap();

        let plane = DataPlane::new(RouterOptions::default());
        plane.reload(&state).await;

        let response = plane
            .router()
            .oneshot(
                http::Request::builder()
                    .uri("/api/items")
                    .header("host", "gateway.local")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["via"], "flowgate");
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"upstream says hi");
    }

    async fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[tokio::test]
    async fn test_websocket_upgrade_is_tunneled() {
        // upstream that switches protocols and then echoes
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();
            let head = read_head(&mut stream).await.to_ascii_lowercase();
            assert!(head.contains("upgrade: websocket"), "{}", head);
            stream
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nconnection: upgrade\r\nupgrade: websocket\r\n\r\n")
                .await
                .unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                stream.write_all(&buf[..n]).await.unwrap();
            }
        });

        let state = GatewayState::new(
            Arc::new(Store::new(Arc::new(MemoryStorage::new()))),
            StateOptions::default(),
        );
        state.start().await.unwrap();
        let service = Service::new("chat", "default", vec![format!("http://{}", upstream_addr)]);
        state
            .apply_change_log(ChangeLog::new(Command::add(Resource::Service), "default", "chat", &service).unwrap())
            .await
            .unwrap();
        let mut route = Route::new("chat", "default");
        route.paths = vec!["/ws".to_string()];
        route.service = Some("chat".to_string());
        state
            .apply_change_log(ChangeLog::new(Command::add(Resource::Route), "default", "chat", &route).unwrap())
            .await
            .unwrap();

        let plane = DataPlane::new(RouterOptions::default());
        plane.reload(&state).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(plane.clone().serve(listener, shutdown.clone()));

        let mut client = TcpStream::connect(address).await.unwrap();
        client
            .write_all(b"GET /ws HTTP/1.1\r\nhost: gateway.local\r\nconnection: Upgrade\r\nupgrade: websocket\r\n\r\n")
            .await
            .unwrap();
        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 101"), "{}", head);
        assert!(head.to_ascii_lowercase().contains("upgrade: websocket"), "{}", head);

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        tokio::time::timeout(std::time::Duration::from_secs(5), client.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, b"ping");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let plane = DataPlane::new(RouterOptions::default());
        let response = plane
            .router()
            .oneshot(http::Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
