//! HTTP listener and request dispatch.
//!
//! Every connection goes through one service. Upgrade requests are routed
//! straight to the [`UpgradeRouter`]; everything else passes the access log
//! layer and is then answered under the matched route's CORS policy, or the
//! global one.

use crate::{
    config::{CorsConfig, RevxConfig},
    health::HealthMonitor,
    proxy::{json_response, ProxyHandler, UpstreamClient},
    routes::{PathMatcher, ProxyRegistration, RouteTable},
    upgrade::{is_upgrade_request, UpgradeRouter},
    Error, Result,
};
use chrono::Utc;
use futures_util::{future::BoxFuture, stream};
use hyper::{
    body::HttpBody,
    header::{HeaderName, HeaderValue},
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use metrics::counter;
use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc};
use tower::{util::BoxCloneService, BoxError, Layer, ServiceBuilder, ServiceExt};
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use uuid::Uuid;

type HttpService = BoxCloneService<Request<Body>, Response<Body>, Infallible>;

/// Peer address of the connection, carried through the tower stack.
#[derive(Debug, Clone, Copy)]
struct ClientAddr(SocketAddr);

/// Immutable dispatch state shared by all connections.
#[derive(Debug)]
pub struct ProxyState {
    routes: Arc<RouteTable>,
    client: UpstreamClient,
    request_id_header: Option<HeaderName>,
    cors: Option<CorsLayer>,
}

impl ProxyState {
    /// Compile every configured route into the route table.
    pub fn new(config: &RevxConfig) -> Result<Self> {
        let registrations = config
            .routes
            .iter()
            .map(|route| {
                let handler = ProxyHandler::new(route, config.global.timeout)?;
                Ok(ProxyRegistration {
                    route: route.clone(),
                    matcher: PathMatcher::compile(&route.path),
                    handler,
                    cors: route.cors.as_ref().and_then(cors_layer),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let request_id_header = match config.request_id_header() {
            Some(name) => Some(HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                Error::config(format!("Invalid request id header name '{}'", name))
            })?),
            None => None,
        };

        Ok(Self {
            routes: Arc::new(RouteTable::new(registrations)),
            client: UpstreamClient::new(config.max_sockets()),
            request_id_header,
            cors: cors_layer(&config.global.cors),
        })
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    async fn dispatch(&self, mut req: Request<Body>) -> Response<Body> {
        counter!("revx_requests_total", 1);

        let remote_addr = req
            .extensions()
            .get::<ClientAddr>()
            .map(|addr| addr.0)
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let request_id = self.assign_request_id(&mut req);

        let mut response = self.route(req, remote_addr).await;

        if let Some((name, value)) = request_id {
            response.headers_mut().insert(name, value);
        }
        response
    }

    /// Answer under the matched route's CORS policy, else the global one.
    async fn route(&self, req: Request<Body>, remote_addr: SocketAddr) -> Response<Body> {
        let registration = self.routes.find(req.uri().path());
        let cors = registration
            .and_then(|r| r.cors.as_ref())
            .or(self.cors.as_ref());

        let respond = service_fn(move |req: Request<Body>| async move {
            Ok::<_, Infallible>(self.respond(registration, req, remote_addr).await)
        });
        let result = match cors {
            Some(layer) => layer.clone().layer(respond).oneshot(req).await,
            None => respond.oneshot(req).await,
        };
        match result {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }

    async fn respond(
        &self,
        registration: Option<&ProxyRegistration>,
        req: Request<Body>,
        remote_addr: SocketAddr,
    ) -> Response<Body> {
        if let Some(registration) = registration {
            return registration.handler.handle(&self.client, req, remote_addr).await;
        }

        let method = req.method();
        if req.uri().path() == "/health" && (method == Method::GET || method == Method::HEAD) {
            return health_response();
        }

        let err = Error::RouteNotFound {
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
        };
        json_response(
            err.http_status_code(),
            serde_json::json!({ "error": "Not Found", "message": err.to_string() }),
        )
    }

    /// Mint a fresh id, replacing any the client sent; returns the id to echo.
    fn assign_request_id(&self, req: &mut Request<Body>) -> Option<(HeaderName, HeaderValue)> {
        let name = self.request_id_header.as_ref()?;
        let value = HeaderValue::from_str(&Uuid::new_v4().to_string()).ok()?;
        req.headers_mut().insert(name.clone(), value.clone());
        Some((name.clone(), value))
    }
}

fn health_response() -> Response<Body> {
    json_response(
        StatusCode::OK,
        serde_json::json!({ "status": "ok", "timestamp": Utc::now().to_rfc3339() }),
    )
}

/// CORS policy for a global or route block, or `None` when disabled.
pub fn cors_layer(cors: &CorsConfig) -> Option<CorsLayer> {
    if !cors.enabled {
        return None;
    }

    let methods: Vec<Method> = cors
        .methods
        .iter()
        .filter_map(|m| Method::from_bytes(m.as_bytes()).ok())
        .collect();
    let origins = cors.origin.values();
    let layer = CorsLayer::new().allow_methods(methods);

    // Wildcards cannot be combined with credentials, so the request's own
    // origin and headers are echoed instead.
    let layer = if origins.contains(&"*") {
        if cors.credentials {
            layer
                .allow_origin(AllowOrigin::mirror_request())
                .allow_headers(AllowHeaders::mirror_request())
                .allow_credentials(true)
        } else {
            layer.allow_origin(Any).allow_headers(Any)
        }
    } else {
        let origins: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        layer
            .allow_origin(AllowOrigin::list(origins))
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(cors.credentials)
    };

    Some(layer)
}

/// Flatten any body type back into a `hyper::Body`.
fn into_body<B>(response: Response<B>) -> Response<Body>
where
    B: HttpBody<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let (parts, body) = response.into_parts();
    let chunks = stream::unfold(Box::pin(body), |mut body| async move {
        body.data()
            .await
            .map(|chunk| (chunk.map_err(Into::<BoxError>::into), body))
    });
    Response::from_parts(parts, Body::wrap_stream(chunks))
}

/// The per-connection service: upgrade dispatch plus the HTTP stack.
#[derive(Clone)]
pub struct ProxyService {
    upgrades: UpgradeRouter,
    http: HttpService,
}

impl ProxyService {
    pub fn new(state: Arc<ProxyState>, config: &RevxConfig) -> Self {
        let level = if config.global.logging.enabled {
            Level::INFO
        } else {
            Level::TRACE
        };
        let trace = TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(level))
            .on_request(DefaultOnRequest::new().level(level))
            .on_response(DefaultOnResponse::new().level(level));

        let upgrades = UpgradeRouter::new(state.routes.clone(), state.client.clone());
        let inner = service_fn(move |req: Request<Body>| {
            let state = state.clone();
            async move { Ok::<_, Infallible>(state.dispatch(req).await) }
        });

        let http = ServiceBuilder::new()
            .map_response(into_body)
            .layer(trace)
            .service(inner);

        Self {
            upgrades,
            http: BoxCloneService::new(http),
        }
    }

    /// Handle one request. `Err` closes the connection without a response.
    pub fn call(self, mut req: Request<Body>, remote_addr: SocketAddr) -> BoxFuture<'static, Result<Response<Body>>> {
        let ProxyService { upgrades, http } = self;
        Box::pin(async move {
            if is_upgrade_request(&req) {
                return upgrades.handle(req, remote_addr).await;
            }

            req.extensions_mut().insert(ClientAddr(remote_addr));
            match http.oneshot(req).await {
                Ok(response) => Ok(response),
                Err(never) => match never {},
            }
        })
    }
}

/// Serve on an already bound listener until `shutdown` resolves, then drain
/// in-flight requests.
pub async fn serve<F>(
    config: RevxConfig,
    listener: std::net::TcpListener,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let address = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    let state = Arc::new(ProxyState::new(&config)?);
    let monitor = HealthMonitor::start(state.routes());
    let service = ProxyService::new(state, &config);

    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let remote_addr = conn.remote_addr();
        let service = service.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| service.clone().call(req, remote_addr)))
        }
    });

    let server = Server::from_tcp(listener)
        .map_err(|e| Error::Bind {
            address: address.clone(),
            reason: e.to_string(),
        })?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown);

    info!(address = %address, "Reverse proxy listening");
    let result = server.await.map_err(|e| Error::server(e.to_string()));

    monitor.shutdown();
    info!("Server stopped");
    result
}

/// Bind the configured host and port.
pub fn bind(config: &RevxConfig) -> Result<std::net::TcpListener> {
    let address = format!("{}:{}", config.server.host, config.server.port);
    std::net::TcpListener::bind(&address).map_err(|e| Error::Bind {
        address,
        reason: e.to_string(),
    })
}

/// Resolve on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
