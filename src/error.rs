// src/error.rs - Error handling for the proxy engine
use hyper::StatusCode;
use thiserror::Error;

/// Main proxy error type
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Route {path} {message}")]
    InvalidRoute { path: String, message: String },

    #[error("Failed to read configuration file '{path}': {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // Server errors
    #[error("Failed to bind to address '{address}': {reason}")]
    Bind { address: String, reason: String },

    #[error("Server error: {message}")]
    Server { message: String },

    // Upstream errors
    #[error("Upstream '{target}' failed: {source}")]
    Upstream {
        target: String,
        #[source]
        source: hyper::Error,
    },

    #[error("Upstream '{target}' timed out after {timeout_ms}ms")]
    UpstreamTimeout { target: String, timeout_ms: u64 },

    #[error("Invalid upstream URI '{uri}': {reason}")]
    InvalidUpstream { uri: String, reason: String },

    // Routing errors
    #[error("No route matches {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("No WebSocket route matches {path}")]
    UpgradeRejected { path: String },

    #[error("Metrics error: {message}")]
    Metrics { message: String },
}

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    pub fn route<P: Into<String>, S: Into<String>>(path: P, message: S) -> Self {
        Error::InvalidRoute {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn server<S: Into<String>>(message: S) -> Self {
        Error::Server {
            message: message.into(),
        }
    }

    pub fn invalid_upstream<U: Into<String>, S: Into<String>>(uri: U, reason: S) -> Self {
        Error::InvalidUpstream {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// HTTP status code reported to the client for this error.
    pub fn http_status_code(&self) -> StatusCode {
        match self {
            Error::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Error::Upstream { .. }
            | Error::UpstreamTimeout { .. }
            | Error::InvalidUpstream { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True when the upstream could not be reached at all, as opposed to
    /// failing mid-exchange.
    pub fn is_connect_failure(&self) -> bool {
        match self {
            Error::Upstream { source, .. } => source.is_connect(),
            _ => false,
        }
    }
}

/// An upstream body that ended before its declared length.
pub fn is_length_mismatch(err: &hyper::Error) -> bool {
    err.is_incomplete_message()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_error_names_path() {
        let err = Error::route("/api/*", "cannot have both target and targets");
        assert_eq!(
            err.to_string(),
            "Route /api/* cannot have both target and targets"
        );
    }

    #[test]
    fn test_http_status_codes() {
        let not_found = Error::RouteNotFound {
            method: "GET".to_string(),
            path: "/missing".to_string(),
        };
        assert_eq!(not_found.http_status_code(), StatusCode::NOT_FOUND);

        let timeout = Error::UpstreamTimeout {
            target: "http://127.0.0.1:1".to_string(),
            timeout_ms: 50,
        };
        assert_eq!(timeout.http_status_code(), StatusCode::BAD_GATEWAY);
        assert!(!timeout.is_connect_failure());

        assert_eq!(
            Error::config("bad").http_status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
