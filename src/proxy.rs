//! HTTP forwarding for a single route.
//!
//! A [`ProxyHandler`] is compiled once per route at startup. For each request
//! it picks a target, rewrites the path, edits headers, forwards through the
//! shared [`UpstreamClient`] and normalizes the response before relaying it.

use crate::{
    config::{HeaderRules, RouteConfig},
    error::is_length_mismatch,
    routing::LoadBalancer,
    Error, Result,
};
use futures_util::StreamExt;
use hyper::{
    client::HttpConnector,
    header::{
        HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST,
        LOCATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
    },
    Body, Client, Request, Response, StatusCode, Uri, Version,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use metrics::{counter, histogram};
use regex::Regex;
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};

type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Outbound connection pool shared by every route.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: HttpClient,
    /// Caps concurrent upstream exchanges at `maxSockets`
    permits: Arc<Semaphore>,
}

impl UpstreamClient {
    pub fn new(max_sockets: usize) -> Self {
        let https_connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(max_sockets)
            .build(https_connector);

        Self {
            client,
            permits: Arc::new(Semaphore::new(max_sockets.max(1))),
        }
    }

    /// Number of upstream exchanges that can start right now.
    pub fn available_sockets(&self) -> usize {
        self.permits.available_permits()
    }

    pub(crate) async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::server("Upstream connection pool is closed"))
    }

    pub(crate) async fn send(
        &self,
        req: Request<Body>,
        timeout: Option<Duration>,
        target: &str,
    ) -> Result<Response<Body>> {
        let call = self.client.request(req);
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                Error::UpstreamTimeout {
                    target: target.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                }
            })?,
            None => call.await,
        };

        result.map_err(|source| Error::Upstream {
            target: target.to_string(),
            source,
        })
    }
}

/// Where a route sends its traffic.
#[derive(Debug)]
pub enum Upstream {
    Single(String),
    Balanced(Arc<LoadBalancer>),
}

/// Parsed upstream base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    scheme: &'static str,
    authority: String,
    base_path: String,
}

impl UpstreamTarget {
    /// Parse a configured target; `ws`/`wss` are dialed as `http`/`https`.
    pub fn parse(target: &str) -> Result<Self> {
        let uri: Uri = target
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| Error::invalid_upstream(target, e.to_string()))?;

        let scheme = match uri.scheme_str() {
            Some("http") | Some("ws") => "http",
            Some("https") | Some("wss") => "https",
            Some(other) => {
                return Err(Error::invalid_upstream(
                    target,
                    format!("unsupported scheme '{}'", other),
                ))
            }
            None => return Err(Error::invalid_upstream(target, "missing scheme")),
        };
        let authority = uri
            .authority()
            .ok_or_else(|| Error::invalid_upstream(target, "missing host"))?
            .to_string();

        Ok(Self {
            scheme,
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
        })
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Join the target's base path with a request path and query.
    pub fn uri_for(&self, path_and_query: &str) -> Result<Uri> {
        let separator = if path_and_query.starts_with('/') { "" } else { "/" };
        let uri = format!(
            "{}://{}{}{}{}",
            self.scheme, self.authority, self.base_path, separator, path_and_query
        );
        uri.parse()
            .map_err(|e: hyper::http::uri::InvalidUri| Error::invalid_upstream(uri.clone(), e.to_string()))
    }

    fn host_header(&self) -> Result<HeaderValue> {
        HeaderValue::from_str(&self.authority)
            .map_err(|e| Error::invalid_upstream(self.authority.clone(), e.to_string()))
    }
}

/// Ordered path rewrite rules; the first matching pattern is applied.
#[derive(Debug, Default)]
pub struct PathRewriter {
    rules: Vec<(Regex, String)>,
}

impl PathRewriter {
    pub fn compile(route: &RouteConfig) -> Result<Self> {
        let rules = route
            .path_rewrite
            .rules()
            .map(|(pattern, replacement)| {
                Regex::new(pattern)
                    .map(|re| (re, replacement.to_string()))
                    .map_err(|e| Error::route(&route.path, format!("has invalid pathRewrite pattern '{}': {}", pattern, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn rewrite(&self, path: &str) -> String {
        for (pattern, replacement) in &self.rules {
            if pattern.is_match(path) {
                return pattern.replace(path, replacement.as_str()).into_owned();
            }
        }
        path.to_string()
    }
}

/// Header edits: sets applied in order, then removals.
#[derive(Debug, Default)]
pub struct HeaderEdits {
    set: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

impl HeaderEdits {
    fn compile<'a, I>(route: &str, sets: I, remove: &[String]) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let set = sets
            .into_iter()
            .map(|(name, value)| -> Result<(HeaderName, HeaderValue)> {
                Ok((header_name(route, name)?, header_value(route, name, value)?))
            })
            .collect::<Result<Vec<_>>>()?;
        let remove = remove
            .iter()
            .map(|name| header_name(route, name))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { set, remove })
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
        for name in &self.remove {
            headers.remove(name);
        }
    }
}

fn header_name(route: &str, name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| Error::route(route, format!("has invalid header name '{}'", name)))
}

fn header_value(route: &str, name: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| Error::route(route, format!("has invalid value for header '{}'", name)))
}

/// Per-route forwarding state.
#[derive(Debug)]
pub struct ProxyHandler {
    route: String,
    upstream: Upstream,
    rewriter: PathRewriter,
    change_origin: bool,
    request_headers: HeaderEdits,
    response_headers: HeaderEdits,
    timeout: Option<Duration>,
    /// Connection failures flip the target unhealthy; only set when an
    /// active health check exists to flip it back.
    mark_on_failure: bool,
}

impl ProxyHandler {
    /// Compile a route. `default_timeout_ms` applies when the route sets none.
    pub fn new(route: &RouteConfig, default_timeout_ms: Option<u64>) -> Result<Self> {
        let upstream = match (&route.target, &route.targets) {
            (Some(target), None) => Upstream::Single(target.clone()),
            (None, Some(targets)) if !targets.is_empty() => Upstream::Balanced(Arc::new(
                LoadBalancer::new(route.path.clone(), targets.clone(), route.strategy()),
            )),
            _ => {
                return Err(Error::route(
                    &route.path,
                    "must have exactly one of target or targets",
                ))
            }
        };

        let request_sets = route
            .options
            .headers
            .iter()
            .chain(&route.transform.request.headers.add);
        let HeaderRules { add, remove } = &route.transform.response.headers;

        Ok(Self {
            route: route.path.clone(),
            upstream,
            rewriter: PathRewriter::compile(route)?,
            change_origin: route.change_origin,
            request_headers: HeaderEdits::compile(
                &route.path,
                request_sets,
                &route.transform.request.headers.remove,
            )?,
            response_headers: HeaderEdits::compile(&route.path, add, remove)?,
            timeout: route.options.timeout.or(default_timeout_ms).map(Duration::from_millis),
            mark_on_failure: route.health_check_enabled(),
        })
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Load balancer of a multi-target route.
    pub fn balancer(&self) -> Option<&Arc<LoadBalancer>> {
        match &self.upstream {
            Upstream::Balanced(lb) => Some(lb),
            Upstream::Single(_) => None,
        }
    }

    pub fn select_target(&self, remote_addr: SocketAddr) -> String {
        match &self.upstream {
            Upstream::Single(target) => target.clone(),
            Upstream::Balanced(lb) => lb.get_target(Some(remote_addr.ip())).to_string(),
        }
    }

    /// Forward one request. Failures before the response head is relayed
    /// become a 502; the response is never an `Err`.
    pub async fn handle(
        &self,
        client: &UpstreamClient,
        req: Request<Body>,
        remote_addr: SocketAddr,
    ) -> Response<Body> {
        let start = Instant::now();
        let target = self.select_target(remote_addr);

        match self.forward(client, req, &target).await {
            Ok(response) => {
                histogram!(
                    "revx_upstream_duration_seconds",
                    start.elapsed().as_secs_f64(),
                    "route" => self.route.clone()
                );
                response
            }
            Err(err) => self.fail(&target, err),
        }
    }

    async fn forward(
        &self,
        client: &UpstreamClient,
        req: Request<Body>,
        target: &str,
    ) -> Result<Response<Body>> {
        let upstream = UpstreamTarget::parse(target)?;
        let client_host = req.headers().get(HOST).cloned();
        let upstream_req = self.prepare_request(req, &upstream, false)?;

        debug!(
            route = %self.route,
            method = %upstream_req.method(),
            uri = %upstream_req.uri(),
            "Proxy request"
        );

        let permit = client.acquire().await?;
        let response = client.send(upstream_req, self.timeout, target).await?;

        Ok(self.prepare_response(response, &upstream, client_host.as_ref(), target, permit))
    }

    /// Rewrite the request for the upstream. Upgrade requests keep their
    /// hop-by-hop headers so the handshake survives.
    pub(crate) fn prepare_request(
        &self,
        req: Request<Body>,
        upstream: &UpstreamTarget,
        upgrade: bool,
    ) -> Result<Request<Body>> {
        let (mut parts, body) = req.into_parts();

        let path = self.rewriter.rewrite(parts.uri.path());
        let path_and_query = match parts.uri.query() {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };
        parts.uri = upstream.uri_for(&path_and_query)?;
        parts.version = Version::HTTP_11;

        if !upgrade {
            strip_hop_by_hop(&mut parts.headers);
        }
        if self.change_origin {
            parts.headers.insert(HOST, upstream.host_header()?);
        }
        self.request_headers.apply(&mut parts.headers);

        Ok(Request::from_parts(parts, body))
    }

    fn prepare_response(
        &self,
        response: Response<Body>,
        upstream: &UpstreamTarget,
        client_host: Option<&HeaderValue>,
        target: &str,
        permit: OwnedSemaphorePermit,
    ) -> Response<Body> {
        let (mut parts, body) = response.into_parts();

        normalize_framing(&mut parts.headers);
        if let Some(host) = client_host {
            rewrite_location(parts.status, &mut parts.headers, upstream, host);
        }
        self.response_headers.apply(&mut parts.headers);

        debug!(
            route = %self.route,
            status = parts.status.as_u16(),
            "Proxy response"
        );

        Response::from_parts(parts, relay_body(body, target.to_string(), permit))
    }

    pub(crate) fn fail(&self, target: &str, err: Error) -> Response<Body> {
        counter!("revx_upstream_errors_total", 1, "route" => self.route.clone());
        error!(route = %self.route, upstream = target, error = %err, "Proxy error");

        if self.mark_on_failure && err.is_connect_failure() {
            if let Some(lb) = self.balancer() {
                lb.mark_unhealthy(target);
            }
        }

        bad_gateway(&err.to_string())
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Stream the upstream body through, holding the pool permit until it ends.
/// Errors here happen after the head was sent, so they can only be logged.
fn relay_body(body: Body, target: String, permit: OwnedSemaphorePermit) -> Body {
    let stream = body.map(move |chunk| {
        let _held = &permit;
        if let Err(err) = &chunk {
            if is_length_mismatch(err) {
                debug!(upstream = %target, error = %err, "Upstream body ended before its declared length");
            } else {
                error!(upstream = %target, error = %err, "Upstream body failed mid-response");
            }
        }
        chunk
    });
    Body::wrap_stream(stream)
}

/// Drop `content-length` and force chunked framing; upstreams that transform
/// content on the fly may announce a stale length.
pub fn normalize_framing(headers: &mut HeaderMap) {
    headers.remove(CONTENT_LENGTH);
    if !headers.contains_key(TRANSFER_ENCODING) {
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    }
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }

    for name in [CONNECTION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

/// Point redirects at the upstream back at the host the client used.
fn rewrite_location(
    status: StatusCode,
    headers: &mut HeaderMap,
    upstream: &UpstreamTarget,
    client_host: &HeaderValue,
) {
    if !matches!(status.as_u16(), 201 | 301 | 302 | 307 | 308) {
        return;
    }

    let location = match headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
        Some(location) => location,
        None => return,
    };
    let uri: Uri = match location.parse() {
        Ok(uri) => uri,
        Err(_) => return,
    };
    if uri.authority().map(|a| a.as_str()) != Some(upstream.authority()) {
        return;
    }

    if let Ok(host) = client_host.to_str() {
        let rewritten = format!(
            "{}://{}{}",
            uri.scheme_str().unwrap_or("http"),
            host,
            uri.path_and_query().map_or("/", |pq| pq.as_str())
        );
        if let Ok(value) = HeaderValue::from_str(&rewritten) {
            headers.insert(LOCATION, value);
        }
    }
}

pub fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub fn bad_gateway(message: &str) -> Response<Body> {
    json_response(
        StatusCode::BAD_GATEWAY,
        serde_json::json!({ "error": "Bad Gateway", "message": message }),
    )
}
