//! Configuration loading and validation.

pub mod model;
pub mod validate;

pub use model::ConfigFile;
pub use validate::{Snapshot, build_snapshot};

use std::path::Path;
use std::time::Duration;

use crate::domain::error::ConfigError;
use crate::domain::model::CorsSettings;

/// Validated server-level settings shared across upstreams.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// First entry is the master credential. Empty disables inbound auth.
    pub proxy_auth: Vec<String>,
    pub outbound_proxy: Option<String>,
    pub cors: Option<CorsSettings>,
    pub history_size: usize,
    /// Zero disables the periodic metrics summary log.
    pub metrics_log_interval: Duration,
    pub max_body_buffer: usize,
    pub drain: Duration,
}

impl ServerSettings {
    #[must_use]
    pub fn auth_enabled(&self) -> bool {
        !self.proxy_auth.is_empty()
    }

    #[must_use]
    pub fn is_known_credential(&self, token: &str) -> bool {
        self.proxy_auth.iter().any(|t| t == token)
    }

    #[must_use]
    pub fn is_master_credential(&self, token: &str) -> bool {
        self.proxy_auth.first().is_some_and(|t| t == token)
    }
}

/// Read and parse a configuration file, without validating it.
///
/// # Errors
///
/// Returns `ConfigError` when the file is missing or not parseable.
pub fn load_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.display().to_string(),
    })?;
    serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Load, parse and validate in one step.
///
/// # Errors
///
/// Propagates load and validation failures.
pub fn load_snapshot(path: &Path) -> Result<Snapshot, ConfigError> {
    let file = load_file(path)?;
    build_snapshot(&file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_is_first_credential() {
        let settings = ServerSettings {
            host: "127.0.0.1".into(),
            port: 0,
            proxy_auth: vec!["master".into(), "secondary".into()],
            outbound_proxy: None,
            cors: None,
            history_size: 10,
            metrics_log_interval: Duration::ZERO,
            max_body_buffer: 1024,
            drain: Duration::from_secs(1),
        };
        assert!(settings.auth_enabled());
        assert!(settings.is_known_credential("secondary"));
        assert!(settings.is_master_credential("master"));
        assert!(!settings.is_master_credential("secondary"));
        assert!(!settings.is_known_credential("unknown"));
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = load_file(Path::new("/nonexistent/polygate.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
