//! Route ordering and matching.
//!
//! Dispatch always takes the first registration whose matcher accepts the
//! request path, so the table is kept in specificity order: longer paths
//! first, then fewer wildcards, then lexicographic order.

use crate::{config::RouteConfig, proxy::ProxyHandler};
use std::cmp::Ordering;
use tower_http::cors::CorsLayer;

/// Compare two route paths by specificity; `Less` sorts first.
pub fn compare_specificity(a: &str, b: &str) -> Ordering {
    path_len(b)
        .cmp(&path_len(a))
        .then_with(|| wildcard_count(a).cmp(&wildcard_count(b)))
        .then_with(|| a.cmp(b))
}

/// Return `routes` ordered most specific first.
pub fn sort_by_specificity(mut routes: Vec<RouteConfig>) -> Vec<RouteConfig> {
    routes.sort_by(|a, b| compare_specificity(&a.path, &b.path));
    routes
}

fn path_len(path: &str) -> usize {
    path.chars().count()
}

fn wildcard_count(path: &str) -> usize {
    path.matches('*').count()
}

/// Precompiled path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatcher {
    /// `*`, `/*` or `$default`
    CatchAll,
    /// `/api/*`: `base` is `/api`
    Wildcard { base: String },
    /// Plain prefix match
    Prefix { prefix: String },
}

impl PathMatcher {
    pub fn compile(pattern: &str) -> Self {
        if matches!(pattern, "*" | "/*" | "$default") {
            return PathMatcher::CatchAll;
        }

        let without_stars = pattern.trim_end_matches('*');
        if without_stars.len() == pattern.len() {
            PathMatcher::Prefix {
                prefix: pattern.to_string(),
            }
        } else if without_stars.ends_with('/') {
            PathMatcher::Wildcard {
                base: without_stars.trim_end_matches('/').to_string(),
            }
        } else {
            PathMatcher::Prefix {
                prefix: without_stars.to_string(),
            }
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::CatchAll => true,
            PathMatcher::Wildcard { base } => match path.strip_prefix(base.as_str()) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            },
            PathMatcher::Prefix { prefix } => path.starts_with(prefix.as_str()),
        }
    }

    /// Prefix used to route socket upgrades: the pattern with its trailing
    /// wildcard segment removed.
    pub fn upgrade_prefix(&self) -> &str {
        match self {
            PathMatcher::CatchAll => "",
            PathMatcher::Wildcard { base } => base,
            PathMatcher::Prefix { prefix } => prefix,
        }
    }
}

/// One configured route bound to its handler. Created at startup, never
/// mutated.
#[derive(Debug)]
pub struct ProxyRegistration {
    pub route: RouteConfig,
    pub matcher: PathMatcher,
    pub handler: ProxyHandler,
    /// Route-level CORS policy, used instead of the global one.
    pub cors: Option<CorsLayer>,
}

impl ProxyRegistration {
    pub fn path(&self) -> &str {
        &self.route.path
    }
}

/// Registrations in specificity order, shared by request dispatch and the
/// upgrade router.
#[derive(Debug, Default)]
pub struct RouteTable {
    registrations: Vec<ProxyRegistration>,
}

impl RouteTable {
    /// Build from routes; the input is re-sorted so callers need not.
    pub fn new(registrations: Vec<ProxyRegistration>) -> Self {
        let mut registrations = registrations;
        registrations.sort_by(|a, b| compare_specificity(a.path(), b.path()));
        Self { registrations }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProxyRegistration> {
        self.registrations.iter()
    }

    /// First registration whose matcher accepts `path`.
    pub fn find(&self, path: &str) -> Option<&ProxyRegistration> {
        self.registrations.iter().find(|r| r.matcher.matches(path))
    }

    /// First `ws` registration whose upgrade prefix starts `path`.
    pub fn find_upgrade(&self, path: &str) -> Option<&ProxyRegistration> {
        self.registrations
            .iter()
            .filter(|r| r.route.ws)
            .find(|r| path.starts_with(r.matcher.upgrade_prefix()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sorted(paths: &[&str]) -> Vec<String> {
        let mut paths: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        paths.sort_by(|a, b| compare_specificity(a, b));
        paths
    }

    #[test]
    fn test_longest_path_first() {
        assert_eq!(sorted(&["/a", "/ap", "/api/*"]), vec!["/api/*", "/ap", "/a"]);
    }

    #[test]
    fn test_fewer_wildcards_win_on_equal_length() {
        assert_eq!(sorted(&["/a/*", "/a/b"]), vec!["/a/b", "/a/*"]);
    }

    #[test]
    fn test_lexicographic_tiebreak() {
        assert_eq!(sorted(&["/b", "/a", "/c"]), vec!["/a", "/b", "/c"]);
    }

    #[test]
    fn test_wildcard_matcher() {
        let m = PathMatcher::compile("/api/*");
        assert_eq!(m, PathMatcher::Wildcard { base: "/api".to_string() });
        assert!(m.matches("/api"));
        assert!(m.matches("/api/"));
        assert!(m.matches("/api/users/1"));
        assert!(!m.matches("/apiv2"));
        assert!(!m.matches("/other"));
        assert_eq!(m.upgrade_prefix(), "/api");
    }

    #[test]
    fn test_root_wildcard_and_catch_all() {
        for pattern in ["/*", "*", "$default"] {
            let m = PathMatcher::compile(pattern);
            assert_eq!(m, PathMatcher::CatchAll);
            assert!(m.matches("/"));
            assert!(m.matches("/anything/at/all"));
            assert_eq!(m.upgrade_prefix(), "");
        }
    }

    #[test]
    fn test_prefix_matcher() {
        let m = PathMatcher::compile("/ws");
        assert!(m.matches("/ws"));
        assert!(m.matches("/ws/socket"));
        assert!(!m.matches("/w"));
        assert_eq!(m.upgrade_prefix(), "/ws");
    }

    proptest! {
        #[test]
        fn prop_sort_is_idempotent(paths in prop::collection::vec("/[a-c*/]{0,6}", 0..12)) {
            let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
            let once = sorted(&refs);
            let once_refs: Vec<&str> = once.iter().map(String::as_str).collect();
            let twice = sorted(&once_refs);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_order_is_total(a in "/[a-c*/]{0,6}", b in "/[a-c*/]{0,6}") {
            let ab = compare_specificity(&a, &b);
            let ba = compare_specificity(&b, &a);
            prop_assert_eq!(ab, ba.reverse());
            prop_assert_eq!(ab == Ordering::Equal, a == b);
        }
    }
}
