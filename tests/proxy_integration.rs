use hyper::{
    header::{CONNECTION, CONTENT_LENGTH, HOST, LOCATION, TRANSFER_ENCODING, UPGRADE},
    service::{make_service_fn, service_fn},
    Body, Client, Request, Response, Server, StatusCode,
};
use revx::{RevxConfig, Router};
use serde_json::{json, Value};
use std::{convert::Infallible, io::Write, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::oneshot,
};

/// Upstream that reports what it received, echoes upgraded streams and
/// answers `/redirect` with a redirect to itself. `/ws/refuse` turns upgrades
/// down and `/slow/wait` stalls before answering.
async fn upstream_handler(
    name: &'static str,
    addr: SocketAddr,
    mut req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    if req.headers().contains_key(UPGRADE) && req.uri().path() == "/ws/refuse" {
        return Ok(Response::builder()
            .status(StatusCode::FORBIDDEN)
            .header("x-refused-by", name)
            .body(Body::from("upgrade refused"))
            .unwrap());
    }

    if req.headers().contains_key(UPGRADE) {
        let on_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            if let Ok(mut io) = on_upgrade.await {
                let mut buf = [0u8; 1024];
                while let Ok(n) = io.read(&mut buf).await {
                    if n == 0 || io.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        });
        return Ok(Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .body(Body::empty())
            .unwrap());
    }

    if req.uri().path().starts_with("/slow/wait") {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    if req.uri().path() == "/redirect" {
        return Ok(Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, format!("http://{}/login", addr))
            .body(Body::empty())
            .unwrap());
    }

    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let body = json!({
        "upstream": name,
        "path": req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/"),
        "host": header("host"),
        "x_proxy": header("x-proxy"),
        "request_id": header("x-request-id"),
    })
    .to_string();

    Ok(Response::builder()
        .header(CONTENT_LENGTH, body.len())
        .header("x-powered-by", "upstream")
        .body(Body::from(body))
        .unwrap())
}

async fn spawn_upstream(name: &'static str) -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let make_svc = make_service_fn(move |_| async move {
        Ok::<_, Infallible>(service_fn(move |req| upstream_handler(name, addr, req)))
    });
    tokio::spawn(Server::from_tcp(listener).unwrap().serve(make_svc));
    addr
}

/// Raw upstream that announces 100 bytes, sends five and hangs up.
async fn spawn_truncating_upstream() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nshort")
                    .await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

fn dead_address() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

struct TestProxy {
    addr: SocketAddr,
    _shutdown: oneshot::Sender<()>,
}

impl TestProxy {
    async fn start(yaml: &str) -> Self {
        let config = RevxConfig::from_yaml_str_with_env(yaml, |_| None).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        tokio::spawn(Router::new(config).serve(listener, async {
            let _ = rx.await;
        }));

        Self {
            addr,
            _shutdown: tx,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn get(&self, path: &str) -> (Response<()>, Value) {
        let response = Client::new()
            .get(self.url(path).parse().unwrap())
            .await
            .unwrap();
        let (parts, body) = response.into_parts();
        let bytes = hyper::body::to_bytes(body).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (Response::from_parts(parts, ()), json)
    }
}

async fn standard_proxy() -> (TestProxy, SocketAddr, SocketAddr) {
    let a = spawn_upstream("a").await;
    let b = spawn_upstream("b").await;
    let dead = dead_address();

    let yaml = format!(
        r#"
server:
  port: 3000
routes:
  - path: /api/*
    target: "http://{a}"
    pathRewrite:
      "^/api": ""
    options:
      headers:
        X-Proxy: revx
    transform:
      response:
        headers:
          add:
            X-Served-By: revx
          remove: [X-Powered-By]
  - path: /lb/*
    targets: ["http://{a}", "http://{b}"]
  - path: /ws/*
    target: "ws://{a}"
    ws: true
  - path: /down
    target: "http://{dead}"
  - path: /redirect
    target: "http://{a}"
  - path: /slow/*
    targets: ["http://{a}", "http://{b}"]
    options:
      timeout: 100
    healthCheck:
      interval: 60000
  - path: /dead-ws/*
    target: "ws://{dead}"
    ws: true
"#
    );
    (TestProxy::start(&yaml).await, a, b)
}

#[tokio::test]
async fn test_response_framing_is_chunked() {
    let (proxy, _, _) = standard_proxy().await;

    let (response, body) = proxy.get("/api/users").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(CONTENT_LENGTH).is_none());
    assert_eq!(response.headers()[TRANSFER_ENCODING], "chunked");
    assert_eq!(body["upstream"], "a");
}

#[tokio::test]
async fn test_path_rewrite_host_and_header_transforms() {
    let (proxy, a, _) = standard_proxy().await;

    let (response, body) = proxy.get("/api/users?page=2").await;
    assert_eq!(body["path"], "/users?page=2");
    assert_eq!(body["host"], a.to_string());
    assert_eq!(body["x_proxy"], "revx");
    assert_eq!(response.headers()["x-served-by"], "revx");
    assert!(response.headers().get("x-powered-by").is_none());
}

#[tokio::test]
async fn test_request_id_reaches_upstream_and_client() {
    let (proxy, _, _) = standard_proxy().await;

    let (response, body) = proxy.get("/api/ping").await;
    let id = response.headers()["x-request-id"].to_str().unwrap();
    assert_eq!(body["request_id"], id);
}

#[tokio::test]
async fn test_round_robin_across_targets() {
    let (proxy, _, _) = standard_proxy().await;

    let mut seen = Vec::new();
    for _ in 0..4 {
        let (_, body) = proxy.get("/lb/item").await;
        assert_eq!(body["path"], "/lb/item");
        seen.push(body["upstream"].as_str().unwrap().to_string());
    }
    assert_eq!(seen, vec!["a", "b", "a", "b"]);
}

#[tokio::test]
async fn test_unreachable_upstream_returns_bad_gateway() {
    let (proxy, _, _) = standard_proxy().await;

    let (response, body) = proxy.get("/down").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "Bad Gateway");
    assert!(body["message"].as_str().unwrap().contains("failed"));
}

#[tokio::test]
async fn test_health_and_not_found() {
    let (proxy, _, _) = standard_proxy().await;

    let (response, body) = proxy.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (response, body) = proxy.get("/missing").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        body,
        json!({ "error": "Not Found", "message": "No route matches GET /missing" })
    );
}

#[tokio::test]
async fn test_redirect_location_points_back_at_proxy() {
    let (proxy, _, _) = standard_proxy().await;

    let (response, _) = proxy.get("/redirect").await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers()[LOCATION],
        format!("http://{}/login", proxy.addr).as_str()
    );
}

async fn send_upgrade(proxy: &TestProxy, path: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\n{}: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        path, HOST, proxy.addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    stream
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut byte))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 1, "connection closed during handshake");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn test_websocket_upgrade_is_tunneled() {
    let (proxy, _, _) = standard_proxy().await;
    let mut stream = send_upgrade(&proxy, "/ws/socket").await;

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {}", head);

    stream.write_all(b"ping").await.unwrap();
    let mut echo = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echo))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echo, b"ping");
}

#[tokio::test]
async fn test_unmatched_upgrade_drops_connection() {
    let (proxy, _, _) = standard_proxy().await;
    // `/api/*` matches the path but is not a WebSocket route.
    for path in ["/other", "/api/socket"] {
        let mut stream = send_upgrade(&proxy, path).await;

        let mut buf = [0u8; 64];
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("connection left open");
        match read {
            Ok(n) => assert_eq!(n, 0, "unexpected response bytes"),
            Err(_) => {}
        }
    }
}

#[tokio::test]
async fn test_router_from_file() {
    let a = spawn_upstream("file").await;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "server:\n  port: 3000\nroutes:\n  - path: /*\n    target: \"http://${{UPSTREAM_ADDR_{port}}}\"\n",
        port = a.port()
    )
    .unwrap();
    std::env::set_var(format!("UPSTREAM_ADDR_{}", a.port()), a.to_string());

    let router = Router::from_file(file.path().to_str().unwrap()).unwrap();
    assert_eq!(
        router.config().routes[0].target.as_deref(),
        Some(format!("http://{}", a).as_str())
    );

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    let server = tokio::spawn(router.serve(listener, async {
        let _ = rx.await;
    }));

    let response = Client::new()
        .get(format!("http://{}/anything", addr).parse().unwrap())
        .await
        .unwrap();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["upstream"], "file");

    tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_upstream_timeout_is_bad_gateway_and_keeps_target() {
    let (proxy, _, _) = standard_proxy().await;

    let (response, body) = proxy.get("/slow/wait").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(
        body["message"].as_str().unwrap().contains("timed out after 100ms"),
        "{}",
        body
    );

    // `a` took the timed out request; it must stay in rotation.
    let mut seen = Vec::new();
    for _ in 0..2 {
        let (_, body) = proxy.get("/slow/fast").await;
        seen.push(body["upstream"].as_str().unwrap().to_string());
    }
    assert_eq!(seen, vec!["b", "a"]);
}

#[tokio::test]
async fn test_upgrade_to_unreachable_upstream_is_bad_gateway() {
    let (proxy, _, _) = standard_proxy().await;
    let mut stream = send_upgrade(&proxy, "/dead-ws/socket").await;

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 502"), "unexpected head: {}", head);
    assert!(head.to_ascii_lowercase().contains("content-type: application/json"));
}

#[tokio::test]
async fn test_refused_upgrade_is_relayed() {
    let (proxy, _, _) = standard_proxy().await;
    let mut stream = send_upgrade(&proxy, "/ws/refuse").await;

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 403"), "unexpected head: {}", head);
    assert!(head.to_ascii_lowercase().contains("x-refused-by: a"), "{}", head);

    let mut body = [0u8; 15];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut body))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&body, b"upgrade refused");
}

#[tokio::test]
async fn test_truncated_upstream_body_keeps_status() {
    let short = spawn_truncating_upstream().await;
    let proxy = TestProxy::start(&format!(
        "server:\n  port: 3000\nroutes:\n  - path: /short\n    target: \"http://{short}\"\n"
    ))
    .await;

    for _ in 0..2 {
        let response = Client::new()
            .get(proxy.url("/short").parse().unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(CONTENT_LENGTH).is_none());

        // The relay stops where the upstream did; the client may see the
        // partial chunk or an aborted body, never a 502.
        if let Ok(bytes) = hyper::body::to_bytes(response.into_body()).await {
            assert!(bytes.starts_with(b"short"));
        }
    }

    let (response, body) = proxy.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
