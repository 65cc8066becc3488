use std::time::Duration;

/// Request-path errors for the proxy pipeline.
///
/// Every variant maps to exactly one client-visible status; upstream
/// responses with error statuses are not errors here — they are returned
/// verbatim once retries are exhausted.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("unknown upstream: {id}")]
    NotFound { id: String },

    #[error("method {method} not allowed for upstream '{upstream}'")]
    MethodNotAllowed { upstream: String, method: String },

    #[error("path forbidden by upstream '{upstream}' filter")]
    PathForbidden { upstream: String },

    #[error("missing or invalid proxy credential")]
    Unauthorized,

    #[error("rate limit exceeded for upstream '{upstream}'")]
    RateLimited {
        upstream: String,
        retry_after: Option<Duration>,
    },

    #[error("admission queue full for upstream '{upstream}'")]
    QueueFull { upstream: String },

    #[error("queued request expired for upstream '{upstream}'")]
    QueueExpired { upstream: String },

    #[error("upstream '{upstream}' timed out after {elapsed_ms}ms")]
    UpstreamTimeout { upstream: String, elapsed_ms: u64 },

    #[error("network error reaching upstream '{upstream}': {detail}")]
    Network { upstream: String, detail: String },

    #[error("configuration error: {detail}")]
    Configuration { detail: String },

    #[error("payload too large: {detail}")]
    PayloadTooLarge { detail: String },

    #[error("request canceled by client")]
    Canceled,
}

impl ProxyError {
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    #[must_use]
    pub fn network(upstream: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Network {
            upstream: upstream.into(),
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn configuration(detail: impl Into<String>) -> Self {
        Self::Configuration {
            detail: detail.into(),
        }
    }

    /// Stable machine-readable kind tag, used in error bodies and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::MethodNotAllowed { .. } => "method_not_allowed",
            Self::PathForbidden { .. } => "path_forbidden",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited { .. } => "rate_limited",
            Self::QueueFull { .. } => "queue_full",
            Self::QueueExpired { .. } => "queue_expired",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::Network { .. } => "network_error",
            Self::Configuration { .. } => "configuration",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Canceled => "canceled",
        }
    }
}

/// Errors raised while loading or validating a configuration snapshot.
///
/// These never surface on the request path: an invalid snapshot is rejected
/// as a whole and the previous generation keeps serving.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("invalid configuration for '{scope}': {detail}")]
    Invalid { scope: String, detail: String },
}

impl ConfigError {
    #[must_use]
    pub fn invalid(scope: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Invalid {
            scope: scope.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(ProxyError::not_found("x").kind(), "not_found");
        assert_eq!(ProxyError::Unauthorized.kind(), "unauthorized");
        assert_eq!(
            ProxyError::QueueFull {
                upstream: "u".into()
            }
            .kind(),
            "queue_full"
        );
        assert_eq!(ProxyError::Canceled.kind(), "canceled");
    }

    #[test]
    fn display_includes_upstream() {
        let err = ProxyError::network("gemini", "connection refused");
        assert!(err.to_string().contains("gemini"));
        assert!(err.to_string().contains("connection refused"));
    }
}
