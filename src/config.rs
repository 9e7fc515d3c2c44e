//! Configuration model, loading and validation.
//!
//! The configuration is a YAML document with `server`, `global`, `middleware`
//! and `routes` sections. `${NAME}` placeholders in string values are replaced
//! with environment variables before the document is deserialized; routes are
//! ordered by specificity and then validated as a whole.

use crate::{routes, routing::LoadBalancingStrategy, Error, Result};
use hyper::{
    header::{HeaderName, HeaderValue},
    Method, Uri,
};
use regex::Regex;
use serde::{
    de::{self, MapAccess, Visitor},
    Deserialize, Deserializer,
};
use serde_yaml::Value;
use std::{collections::BTreeMap, fmt, fs, path::Path, sync::OnceLock};
use tracing::{debug, warn};

/// Default outbound connection cap when neither server nor global sets one.
pub const DEFAULT_MAX_SOCKETS: usize = 256;

/// Header used for request ids unless the middleware entry overrides it.
pub const DEFAULT_REQUEST_ID_HEADER: &str = "X-Request-ID";

const UPSTREAM_SCHEMES: &[&str] = &["http", "https", "ws", "wss"];
const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevxConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub middleware: Vec<MiddlewareConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    pub ssl: Option<SslConfig>,
}

/// TLS listener settings. Only parsed so that an enabled block is refused
/// instead of silently serving plain HTTP.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SslConfig {
    #[serde(default)]
    pub enabled: bool,
    pub key: Option<String>,
    pub cert: Option<String>,
    pub ca: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// `0` when absent or empty; rejected by validation.
    #[serde(default, deserialize_with = "deserialize_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    pub name: Option<String>,
    pub max_sockets: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Default upstream timeout in milliseconds.
    pub timeout: Option<u64>,
    pub max_sockets: Option<usize>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cors_origin")]
    pub origin: OneOrMany,
    #[serde(default = "default_cors_methods")]
    pub methods: Vec<String>,
    #[serde(default = "default_true")]
    pub credentials: bool,
}

/// A scalar or a list of scalars.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn values(&self) -> Vec<&str> {
        match self {
            OneOrMany::One(value) => vec![value.as_str()],
            OneOrMany::Many(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Access log format name. Accepted for compatibility; the access log is
    /// always emitted as structured tracing events.
    pub format: Option<String>,
    pub level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiddlewareConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub enabled: Option<bool>,
    pub header_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    #[serde(default)]
    pub path: String,
    pub target: Option<String>,
    pub targets: Option<Vec<String>>,
    pub strategy: Option<String>,
    #[serde(default = "default_true")]
    pub change_origin: bool,
    #[serde(default)]
    pub path_rewrite: PathRewrite,
    #[serde(default)]
    pub ws: bool,
    #[serde(default)]
    pub options: RouteOptions,
    #[serde(default)]
    pub transform: TransformConfig,
    pub health_check: Option<HealthCheckConfig>,
    /// Route-level CORS policy; replaces the global one for this route.
    pub cors: Option<CorsConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteOptions {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Upstream timeout in milliseconds.
    pub timeout: Option<u64>,
    pub follow_redirects: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransformConfig {
    #[serde(default)]
    pub request: HeaderTransformConfig,
    #[serde(default)]
    pub response: HeaderTransformConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeaderTransformConfig {
    #[serde(default)]
    pub headers: HeaderRules,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeaderRules {
    #[serde(default)]
    pub add: BTreeMap<String, String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Check interval in milliseconds.
    #[serde(default = "default_health_interval")]
    pub interval: u64,
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Check timeout in milliseconds.
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,
}

/// Ordered `pattern -> replacement` rules; mapping order from the document is
/// preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathRewrite(pub Vec<(String, String)>);

impl<'de> Deserialize<'de> for PathRewrite {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RulesVisitor;

        impl<'de> Visitor<'de> for RulesVisitor {
            type Value = PathRewrite;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of path patterns to replacements")
            }

            fn visit_unit<E>(self) -> std::result::Result<Self::Value, E> {
                Ok(PathRewrite::default())
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut rules = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((pattern, replacement)) = map.next_entry::<String, String>()? {
                    rules.push((pattern, replacement));
                }
                Ok(PathRewrite(rules))
            }
        }

        deserializer.deserialize_any(RulesVisitor)
    }
}

impl PathRewrite {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn rules(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(p, r)| (p.as_str(), r.as_str()))
    }
}

/// Accept a number, a numeric string, or an empty value (an unset `${PORT}`).
fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Option::<Port>::deserialize(deserializer)? {
        None => Ok(0),
        Some(Port::Number(port)) => Ok(port),
        Some(Port::Text(text)) if text.trim().is_empty() => Ok(0),
        Some(Port::Text(text)) => text
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid port '{}'", text))),
    }
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_cors_origin() -> OneOrMany {
    OneOrMany::One("*".to_string())
}

fn default_cors_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_health_interval() -> u64 {
    10_000
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_health_timeout() -> u64 {
    5_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            host: default_host(),
            name: None,
            max_sockets: None,
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            origin: default_cors_origin(),
            methods: default_cors_methods(),
            credentials: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            format: None,
            level: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

impl RevxConfig {
    /// Load, expand, sort and validate a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration file");

        let content = fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse a configuration document using the process environment for
    /// placeholder expansion.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Self::from_yaml_str_with_env(content, |name| std::env::var(name).ok())
    }

    /// Parse a configuration document, resolving `${NAME}` placeholders through
    /// `lookup`.
    pub fn from_yaml_str_with_env<F>(content: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut raw: Value = serde_yaml::from_str(content)?;
        expand_env_vars(&mut raw, &lookup);

        let mut config: RevxConfig = serde_yaml::from_value(raw)?;
        config.routes = routes::sort_by_specificity(config.routes);
        debug!(
            routes = ?config.routes.iter().map(|r| r.path.as_str()).collect::<Vec<_>>(),
            "Routes sorted by specificity"
        );

        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration; the first violation aborts.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::config("Server port is required"));
        }

        if self.ssl.as_ref().map_or(false, |ssl| ssl.enabled) {
            return Err(Error::config(
                "TLS is not supported (ssl.enabled: true); terminate TLS in front of revx",
            ));
        }

        if self.routes.is_empty() {
            return Err(Error::config("At least one route must be configured"));
        }

        if let Some(level) = &self.global.logging.level {
            if !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
                return Err(Error::config(format!("Invalid logging level '{}'", level)));
            }
        }

        if let Some(method) = invalid_cors_method(&self.global.cors) {
            return Err(Error::config(format!("Invalid CORS method '{}'", method)));
        }

        if let Some(header) = self.request_id_header() {
            HeaderName::from_bytes(header.as_bytes()).map_err(|_| {
                Error::config(format!("Invalid request id header name '{}'", header))
            })?;
        }

        for route in &self.routes {
            route.validate()?;
        }

        Ok(())
    }

    /// Outbound connection cap: server override, then global, then default.
    pub fn max_sockets(&self) -> usize {
        self.server
            .max_sockets
            .or(self.global.max_sockets)
            .unwrap_or(DEFAULT_MAX_SOCKETS)
            .max(1)
    }

    /// Request id header name, or `None` when the middleware is disabled.
    pub fn request_id_header(&self) -> Option<String> {
        match self.middleware.iter().find(|m| m.kind == "requestId") {
            Some(m) if m.enabled == Some(false) => None,
            Some(m) => Some(
                m.header_name
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REQUEST_ID_HEADER.to_string()),
            ),
            None => Some(DEFAULT_REQUEST_ID_HEADER.to_string()),
        }
    }

    pub fn display_name(&self) -> &str {
        self.server.name.as_deref().unwrap_or("Reverse Proxy")
    }
}

impl RouteConfig {
    pub fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(Error::config("Route path is required"));
        }

        match (&self.target, &self.targets) {
            (None, None) => {
                return Err(Error::route(
                    &self.path,
                    "must have either target or targets",
                ))
            }
            (Some(_), Some(_)) => {
                return Err(Error::route(
                    &self.path,
                    "cannot have both target and targets",
                ))
            }
            (Some(target), None) => validate_target(&self.path, target)?,
            (None, Some(targets)) => {
                if targets.is_empty() {
                    return Err(Error::route(&self.path, "has an empty targets list"));
                }
                for target in targets {
                    validate_target(&self.path, target)?;
                }
            }
        }

        if let Some(strategy) = &self.strategy {
            strategy.parse::<LoadBalancingStrategy>().map_err(|err| {
                Error::route(
                    &self.path,
                    format!("has {} (expected round-robin, random or ip-hash)", err),
                )
            })?;
        }

        if let Some(method) = self.cors.as_ref().and_then(invalid_cors_method) {
            return Err(Error::route(
                &self.path,
                format!("has invalid CORS method '{}'", method),
            ));
        }

        for (pattern, _) in self.path_rewrite.rules() {
            Regex::new(pattern).map_err(|e| {
                Error::route(
                    &self.path,
                    format!("has invalid pathRewrite pattern '{}': {}", pattern, e),
                )
            })?;
        }

        let header_maps = [
            &self.options.headers,
            &self.transform.request.headers.add,
            &self.transform.response.headers.add,
        ];
        for headers in header_maps {
            for (name, value) in headers {
                validate_header_name(&self.path, name)?;
                HeaderValue::from_str(value).map_err(|_| {
                    Error::route(
                        &self.path,
                        format!("has invalid value for header '{}'", name),
                    )
                })?;
            }
        }
        for name in self
            .transform
            .request
            .headers
            .remove
            .iter()
            .chain(&self.transform.response.headers.remove)
        {
            validate_header_name(&self.path, name)?;
        }

        Ok(())
    }

    /// Selection strategy; only meaningful for `targets` routes.
    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    /// Configured upstreams in declaration order.
    pub fn upstreams(&self) -> Vec<String> {
        match (&self.target, &self.targets) {
            (_, Some(targets)) => targets.clone(),
            (Some(target), None) => vec![target.clone()],
            (None, None) => Vec::new(),
        }
    }

    pub fn is_load_balanced(&self) -> bool {
        self.targets.is_some()
    }

    /// Active probing is on only when a health check block is present and
    /// enabled.
    pub fn health_check_enabled(&self) -> bool {
        self.health_check.as_ref().map_or(false, |h| h.enabled)
    }

    /// Human readable target summary.
    pub fn describe_target(&self) -> String {
        match (&self.target, &self.targets) {
            (Some(target), _) => target.clone(),
            (None, Some(targets)) => format!("{} targets ({})", targets.len(), self.strategy()),
            (None, None) => "<none>".to_string(),
        }
    }
}

fn validate_target(path: &str, target: &str) -> Result<()> {
    let uri: Uri = target
        .parse()
        .map_err(|e| Error::route(path, format!("has invalid target '{}': {}", target, e)))?;

    let scheme_ok = uri
        .scheme_str()
        .map_or(false, |s| UPSTREAM_SCHEMES.contains(&s));
    if !scheme_ok || uri.authority().is_none() {
        return Err(Error::route(
            path,
            format!(
                "has invalid target '{}': expected an absolute http(s) or ws(s) URL",
                target
            ),
        ));
    }
    Ok(())
}

/// First CORS method that is not a valid HTTP method, if any.
fn invalid_cors_method(cors: &CorsConfig) -> Option<&str> {
    cors.methods
        .iter()
        .find(|method| Method::from_bytes(method.as_bytes()).is_err())
        .map(String::as_str)
}

fn validate_header_name(path: &str, name: &str) -> Result<()> {
    HeaderName::from_bytes(name.as_bytes())
        .map(|_| ())
        .map_err(|_| Error::route(path, format!("has invalid header name '{}'", name)))
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("valid placeholder pattern"))
}

/// Replace `${NAME}` placeholders in every string scalar of the tree.
///
/// Undefined variables become empty strings. A scalar made of exactly one
/// placeholder is re-read as YAML so numbers and booleans keep their type.
pub fn expand_env_vars<F>(value: &mut Value, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) => {
            if let Some(expanded) = expand_scalar(s, lookup) {
                *value = expanded;
            }
        }
        Value::Sequence(items) => {
            for item in items {
                expand_env_vars(item, lookup);
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                expand_env_vars(item, lookup);
            }
        }
        Value::Tagged(tagged) => expand_env_vars(&mut tagged.value, lookup),
        _ => {}
    }
}

fn expand_scalar<F>(s: &str, lookup: &F) -> Option<Value>
where
    F: Fn(&str) -> Option<String>,
{
    let re = placeholder_regex();
    if !re.is_match(s) {
        return None;
    }

    let resolve = |name: &str| {
        lookup(name).unwrap_or_else(|| {
            warn!("Environment variable not found: {}, using empty string", name);
            String::new()
        })
    };

    if let Some(caps) = re.captures(s) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(s.len()) {
            let resolved = resolve(&caps[1]);
            return Some(match serde_yaml::from_str::<Value>(&resolved) {
                Ok(typed @ (Value::Number(_) | Value::Bool(_))) => typed,
                _ => Value::String(resolved),
            });
        }
    }

    let expanded = re.replace_all(s, |caps: &regex::Captures| resolve(&caps[1]));
    Some(Value::String(expanded.into_owned()))
}
