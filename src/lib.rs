// src/lib.rs
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod routes;
pub mod routing;
pub mod server;
pub mod templates;
pub mod upgrade;

pub use config::{RevxConfig, RouteConfig};
pub use error::{Error, Result};
pub use routing::{LoadBalancer, LoadBalancingStrategy};

use std::future::Future;
use tracing::info;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The main Router struct that owns the validated configuration and runs the
/// proxy.
pub struct Router {
    config: RevxConfig,
}

impl Router {
    /// Create a new Router from an already validated configuration
    pub fn new(config: RevxConfig) -> Self {
        Router { config }
    }

    /// Create a new Router by loading configuration from a file
    pub fn from_file(config_path: &str) -> Result<Self> {
        let config = RevxConfig::from_file(config_path)?;
        Ok(Router::new(config))
    }

    pub fn config(&self) -> &RevxConfig {
        &self.config
    }

    /// Bind the configured address and serve until SIGINT or SIGTERM.
    pub async fn start(self) -> Result<()> {
        if let Some(addr) = metrics::init_metrics(&self.config.global.metrics)? {
            info!(address = %addr, "Metrics exporter listening");
        }

        let listener = server::bind(&self.config)?;
        self.print_banner();
        server::serve(self.config, listener, server::shutdown_signal()).await
    }

    /// Serve on an existing listener until `shutdown` resolves.
    pub async fn serve<F>(self, listener: std::net::TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        server::serve(self.config, listener, shutdown).await
    }

    fn print_banner(&self) {
        let config = &self.config;
        info!(
            "{} v{} on http://{}:{}",
            config.display_name(),
            VERSION,
            config.server.host,
            config.server.port
        );
        for route in &config.routes {
            info!(
                "  {} -> {}{}",
                route.path,
                route.describe_target(),
                if route.ws { " [ws]" } else { "" }
            );
        }
    }
}
