//! Load balancing across the targets of a multi-target route.
//!
//! Each balanced route owns one [`LoadBalancer`] for the life of the process.
//! Requests run on a multi-threaded runtime, so the round-robin cursor is an
//! atomic updated with a single read-modify-write and the health flags live in
//! a concurrent map.

use dashmap::DashMap;
use rand::Rng;
use std::{
    fmt,
    net::IpAddr,
    str::FromStr,
    sync::atomic::{AtomicUsize, Ordering},
};
use tracing::{debug, warn};

/// Load balancing strategies supported by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancingStrategy {
    /// Cycle through healthy targets in order
    #[default]
    RoundRobin,
    /// Uniform pick among healthy targets
    Random,
    /// Stable target per client address
    IpHash,
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancingStrategy::RoundRobin => "round-robin",
            LoadBalancingStrategy::Random => "random",
            LoadBalancingStrategy::IpHash => "ip-hash",
        }
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a strategy name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown load balancing strategy '{0}'")]
pub struct UnknownStrategy(pub String);

impl FromStr for LoadBalancingStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(LoadBalancingStrategy::RoundRobin),
            "random" => Ok(LoadBalancingStrategy::Random),
            "ip-hash" => Ok(LoadBalancingStrategy::IpHash),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

/// Per-strategy selection state, fixed when the route is registered.
#[derive(Debug)]
enum Selector {
    RoundRobin { cursor: AtomicUsize },
    Random,
    IpHash,
}

impl Selector {
    fn new(strategy: LoadBalancingStrategy) -> Self {
        match strategy {
            LoadBalancingStrategy::RoundRobin => Selector::RoundRobin {
                cursor: AtomicUsize::new(0),
            },
            LoadBalancingStrategy::Random => Selector::Random,
            LoadBalancingStrategy::IpHash => Selector::IpHash,
        }
    }

    fn strategy(&self) -> LoadBalancingStrategy {
        match self {
            Selector::RoundRobin { .. } => LoadBalancingStrategy::RoundRobin,
            Selector::Random => LoadBalancingStrategy::Random,
            Selector::IpHash => LoadBalancingStrategy::IpHash,
        }
    }
}

/// Target pool of one route with its health state.
#[derive(Debug)]
pub struct LoadBalancer {
    /// Route path, used for log context
    route: String,
    /// Targets in configured order
    targets: Vec<String>,
    /// Health flag per target; every target has an entry, none is ever removed
    health: DashMap<String, bool>,
    selector: Selector,
}

impl LoadBalancer {
    pub fn new(route: impl Into<String>, targets: Vec<String>, strategy: LoadBalancingStrategy) -> Self {
        let health = DashMap::with_capacity(targets.len());
        for target in &targets {
            health.insert(target.clone(), true);
        }

        Self {
            route: route.into(),
            targets,
            health,
            selector: Selector::new(strategy),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.selector.strategy()
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn is_healthy(&self, target: &str) -> bool {
        self.health.get(target).map_or(false, |healthy| *healthy)
    }

    /// Healthy targets in configured order.
    pub fn healthy_targets(&self) -> Vec<&str> {
        self.targets
            .iter()
            .filter(|t| self.is_healthy(t))
            .map(String::as_str)
            .collect()
    }

    /// Pick the upstream for a request.
    ///
    /// Never fails: with no healthy target the first configured target is
    /// returned, since health state may be stale.
    pub fn get_target(&self, client_ip: Option<IpAddr>) -> &str {
        let healthy = self.healthy_targets();

        if healthy.is_empty() {
            warn!(route = %self.route, "All targets are unhealthy, using first target");
            return self.targets.first().map(String::as_str).unwrap_or_default();
        }

        let len = healthy.len();
        let index = match &self.selector {
            Selector::RoundRobin { cursor } => {
                let previous = cursor
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % len))
                    .unwrap_or_else(|c| c);
                previous % len
            }
            Selector::Random => rand::thread_rng().gen_range(0..len),
            Selector::IpHash => match client_ip {
                Some(ip) => hash_code(&ip.to_string()).unsigned_abs() as usize % len,
                None => 0,
            },
        };

        healthy[index]
    }

    pub fn mark_unhealthy(&self, target: &str) {
        if let Some(mut healthy) = self.health.get_mut(target) {
            if *healthy {
                warn!(route = %self.route, upstream = target, "Target marked as unhealthy");
            }
            *healthy = false;
        }
    }

    pub fn mark_healthy(&self, target: &str) {
        if let Some(mut healthy) = self.health.get_mut(target) {
            if !*healthy {
                debug!(route = %self.route, upstream = target, "Target marked as healthy");
            }
            *healthy = true;
        }
    }
}

/// 32-bit string hash (`h = h * 31 + unit` over UTF-16 code units), stable for
/// the life of the process.
pub fn hash_code(s: &str) -> i32 {
    s.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit))
    })
}
