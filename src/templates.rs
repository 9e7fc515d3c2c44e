//! Sample configurations written by `revx init`.

use crate::{Error, Result};
use std::{fs, path::Path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    /// Frontend dev server plus backend API
    Default,
    Simple,
    /// Annotated reverse proxy setup with load balancing
    Proxy,
}

impl Template {
    pub fn from_flags(simple: bool, proxy: bool) -> Self {
        if proxy {
            Template::Proxy
        } else if simple {
            Template::Simple
        } else {
            Template::Default
        }
    }

    pub fn content(&self) -> &'static str {
        match self {
            Template::Default => DEFAULT_CONFIG,
            Template::Simple => SIMPLE_CONFIG,
            Template::Proxy => PROXY_CONFIG,
        }
    }
}

/// Write `template` to `path`. An existing file is never overwritten.
pub fn write_sample(path: &Path, template: Template) -> Result<()> {
    if path.exists() {
        return Err(Error::config(format!(
            "Configuration file already exists: {}",
            path.display()
        )));
    }

    fs::write(path, template.content()).map_err(|e| {
        Error::config(format!(
            "Failed to create configuration file {}: {}",
            path.display(),
            e
        ))
    })
}

const DEFAULT_CONFIG: &str = r#"# revx.yaml - Development Server Configuration

server:
  port: 3000
  host: 0.0.0.0
  name: "Dev Server"
  # Raise for dev servers that open many parallel module requests
  maxSockets: 512

global:
  cors:
    enabled: true
    origin: "*"
  logging:
    enabled: true

routes:
  # Backend API
  - path: "/api/*"
    target: "http://localhost:4000"
    changeOrigin: true
    pathRewrite:
      "^/api": ""

  # Frontend dev server, with WebSocket for hot reload
  - path: "/*"
    target: "http://localhost:5173"
    ws: true
    changeOrigin: true
"#;

const SIMPLE_CONFIG: &str = r#"# revx.yaml - Simple Reverse Proxy Configuration

server:
  port: 3000

routes:
  - path: "/api/*"
    target: "http://localhost:4000"
    pathRewrite:
      "^/api": ""

  - path: "/*"
    target: "http://localhost:5173"
    ws: true
    changeOrigin: true
"#;

const PROXY_CONFIG: &str = r#"# revx.yaml - Reverse Proxy Configuration

# Server settings
server:
  port: 3000
  host: 0.0.0.0
  name: "My Reverse Proxy"
  # Max concurrent upstream sockets. Default: 256
  # maxSockets: 512

# Global configuration
global:
  # Upstream timeout in milliseconds for routes without their own
  # timeout: 30000

  cors:
    enabled: true
    origin: "*"
    methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
    credentials: true

  logging:
    enabled: true
    # error | warn | info | debug | trace
    level: info

  # Prometheus exporter
  metrics:
    enabled: false
    listen: "127.0.0.1:9000"

middleware:
  - type: requestId
    headerName: X-Request-ID

# Route definitions, matched most specific first
routes:
  # Simple proxy to an API server
  - path: "/api/*"
    target: "http://localhost:4000"
    changeOrigin: true
    pathRewrite:
      "^/api": ""
    options:
      timeout: 10000

  # Load balanced service with active health checks
  - path: "/service/*"
    targets:
      - "http://localhost:4001"
      - "http://localhost:4002"
    strategy: round-robin  # round-robin | random | ip-hash
    healthCheck:
      enabled: true
      interval: 10000
      path: /health
      timeout: 5000

  # WebSocket proxy
  - path: "/ws"
    target: "ws://localhost:5000"
    ws: true
    changeOrigin: true

  # Everything else
  # - path: "/*"
  #   target: "http://localhost:5173"
  #   ws: true
"#;
