//! Active health probing for load balanced routes.

use crate::{
    config::HealthCheckConfig, proxy::UpstreamTarget, routes::RouteTable, routing::LoadBalancer,
};
use futures_util::future::join_all;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Background health check tasks, one per route with `healthCheck.enabled`.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    tasks: Vec<JoinHandle<()>>,
}

impl HealthMonitor {
    /// Spawn health checks for every balanced route that asks for them.
    pub fn start(routes: &RouteTable) -> Self {
        let mut tasks = Vec::new();

        for registration in routes.iter() {
            let check = match registration.route.health_check.as_ref() {
                Some(check) if check.enabled => check.clone(),
                _ => continue,
            };
            if let Some(balancer) = registration.handler.balancer() {
                info!(
                    route = registration.path(),
                    interval_ms = check.interval,
                    path = %check.path,
                    "Starting health checks"
                );
                tasks.push(tokio::spawn(check_loop(balancer.clone(), check)));
            }
        }

        Self { tasks }
    }

    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

async fn check_loop(balancer: Arc<LoadBalancer>, check: HealthCheckConfig) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_millis(check.timeout))
        .redirect(reqwest::redirect::Policy::none())
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "Failed to build health check client");
            return;
        }
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(check.interval.max(1)));
    loop {
        ticker.tick().await;

        let results = join_all(
            balancer
                .targets()
                .iter()
                .map(|target| check_target(&client, target, &check.path)),
        )
        .await;

        for (target, healthy) in balancer.targets().iter().zip(results) {
            if healthy {
                balancer.mark_healthy(target);
            } else {
                balancer.mark_unhealthy(target);
            }
        }
    }
}

/// Check one target: any 2xx or 3xx answer on `path` counts as healthy.
pub async fn check_target(client: &reqwest::Client, target: &str, path: &str) -> bool {
    let url = match UpstreamTarget::parse(target).and_then(|t| t.uri_for(path)) {
        Ok(uri) => uri.to_string(),
        Err(err) => {
            debug!(upstream = target, error = %err, "Cannot build health check URL");
            return false;
        }
    };

    match client.get(&url).send().await {
        Ok(response) => {
            let status = response.status();
            status.is_success() || status.is_redirection()
        }
        Err(err) => {
            debug!(upstream = target, error = %err, "Health check failed");
            false
        }
    }
}
