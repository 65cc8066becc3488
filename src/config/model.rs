//! serde schema for the configuration document.
//!
//! Three sections: `server`, `default_settings`, and `apis`. Every
//! per-upstream field can override the corresponding default; resolution
//! and validation happen in [`super::validate`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub default_settings: DefaultSettings,
    #[serde(default)]
    pub apis: BTreeMap<String, ApiEntry>,
}

impl fmt::Debug for ConfigFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigFile")
            .field("server", &self.server)
            .field("apis", &self.apis.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// server
// ---------------------------------------------------------------------------

#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Inbound bearer credentials; the first entry is the master (also
    /// authorized for the control surface). Empty disables inbound auth.
    #[serde(default)]
    pub proxy_auth: Vec<String>,
    /// Optional outbound proxy URI (`http://…` or `socks5://…`).
    #[serde(default)]
    pub outbound_proxy: Option<String>,
    #[serde(default)]
    pub cors: CorsSection,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Interval for the periodic metrics summary log; 0 disables it.
    #[serde(default = "default_metrics_log_interval")]
    pub metrics_log_interval_seconds: u64,
    /// Request bodies up to this size are buffered (and thus replayable on
    /// retry); larger bodies stream to the upstream.
    #[serde(default = "default_max_body_buffer")]
    pub max_body_buffer_bytes: usize,
    /// Bound on the graceful-shutdown drain of in-flight requests.
    #[serde(default = "default_drain_seconds")]
    pub drain_seconds: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            proxy_auth: Vec::new(),
            outbound_proxy: None,
            cors: CorsSection::default(),
            history_size: default_history_size(),
            metrics_log_interval_seconds: default_metrics_log_interval(),
            max_body_buffer_bytes: default_max_body_buffer(),
            drain_seconds: default_drain_seconds(),
        }
    }
}

impl fmt::Debug for ServerSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("proxy_auth", &vec!["[REDACTED]"; self.proxy_auth.len()])
            .field("outbound_proxy", &self.outbound_proxy)
            .field("cors", &self.cors)
            .finish_non_exhaustive()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_history_size() -> usize {
    1000
}

fn default_metrics_log_interval() -> u64 {
    300
}

fn default_max_body_buffer() -> usize {
    2 * 1024 * 1024
}

fn default_drain_seconds() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cors_origin")]
    pub allow_origin: String,
    #[serde(default = "default_cors_methods")]
    pub allow_methods: String,
    #[serde(default = "default_cors_headers")]
    pub allow_headers: String,
}

impl Default for CorsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_origin: default_cors_origin(),
            allow_methods: default_cors_methods(),
            allow_headers: default_cors_headers(),
        }
    }
}

fn default_cors_origin() -> String {
    "*".to_string()
}

fn default_cors_methods() -> String {
    "GET, POST, PUT, DELETE, PATCH, OPTIONS, HEAD".to_string()
}

fn default_cors_headers() -> String {
    "*".to_string()
}

// ---------------------------------------------------------------------------
// default_settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultSettings {
    #[serde(default = "default_strategy")]
    pub load_balancing_strategy: String,
    #[serde(default = "default_key_variable")]
    pub key_variable: String,
    #[serde(default = "default_true")]
    pub key_concurrency: bool,
    #[serde(default)]
    pub randomness: f64,
    #[serde(default = "default_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub retry: RetrySection,
}

impl Default for DefaultSettings {
    fn default() -> Self {
        Self {
            load_balancing_strategy: default_strategy(),
            key_variable: default_key_variable(),
            key_concurrency: true,
            randomness: 0.0,
            request_timeout_seconds: default_timeout_seconds(),
            rate_limit: RateLimitSection::default(),
            queue: QueueSection::default(),
            retry: RetrySection::default(),
        }
    }
}

fn default_strategy() -> String {
    "round_robin".to_string()
}

fn default_key_variable() -> String {
    "keys".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSection {
    #[serde(default = "default_quota")]
    pub endpoint_rate_limit: String,
    #[serde(default = "default_quota")]
    pub key_rate_limit: String,
    #[serde(default = "default_quota")]
    pub ip_rate_limit: String,
    #[serde(default = "default_quota")]
    pub user_rate_limit: String,
    #[serde(default = "default_rate_limit_paths")]
    pub rate_limit_paths: Vec<String>,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            endpoint_rate_limit: default_quota(),
            key_rate_limit: default_quota(),
            ip_rate_limit: default_quota(),
            user_rate_limit: default_quota(),
            rate_limit_paths: default_rate_limit_paths(),
        }
    }
}

fn default_quota() -> String {
    "0".to_string()
}

fn default_rate_limit_paths() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueSection {
    #[serde(default = "default_queue_size")]
    pub max_size: usize,
    #[serde(default = "default_queue_expiry")]
    pub expiry_seconds: u64,
    #[serde(default = "default_queue_workers")]
    pub max_workers: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_size: default_queue_size(),
            expiry_seconds: default_queue_expiry(),
            max_workers: default_queue_workers(),
        }
    }
}

fn default_queue_size() -> usize {
    100
}

fn default_queue_expiry() -> u64 {
    300
}

fn default_queue_workers() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retry_mode")]
    pub mode: String,
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_after")]
    pub retry_after_seconds: f64,
    #[serde(default = "default_retry_methods")]
    pub retry_request_methods: Vec<String>,
    #[serde(default = "default_retry_status_codes")]
    pub retry_status_codes: Vec<u16>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: default_retry_mode(),
            attempts: default_retry_attempts(),
            retry_after_seconds: default_retry_after(),
            retry_request_methods: default_retry_methods(),
            retry_status_codes: default_retry_status_codes(),
        }
    }
}

fn default_retry_mode() -> String {
    "default".to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_after() -> f64 {
    1.0
}

fn default_retry_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_retry_status_codes() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

// ---------------------------------------------------------------------------
// apis
// ---------------------------------------------------------------------------

/// A variable pool entry: a list of scalars or a single scalar.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarValues {
    List(Vec<ScalarValue>),
    Scalar(ScalarValue),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    String(String),
    Number(serde_json::Number),
    Bool(bool),
}

impl ScalarValue {
    /// Decimal/string rendering used for header substitution and key
    /// identity.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Number(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }
}

impl VarValues {
    #[must_use]
    pub fn rendered(&self) -> Vec<String> {
        match self {
            Self::List(items) => items.iter().map(ScalarValue::render).collect(),
            Self::Scalar(item) => vec![item.render()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiEntry {
    /// Human-readable name; defaults to the map key.
    #[serde(default)]
    pub name: Option<String>,
    pub endpoint: String,
    /// Path aliases, with or without a leading slash (`/gemini` or `gemini`).
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Method allowlist; absent means all methods.
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub variables: BTreeMap<String, VarValues>,
    #[serde(default)]
    pub key_variable: Option<String>,
    /// Per-variable weights for the `weighted` strategy.
    #[serde(default)]
    pub variable_weights: BTreeMap<String, Vec<f64>>,
    #[serde(default)]
    pub load_balancing_strategy: Option<String>,
    #[serde(default)]
    pub key_concurrency: Option<bool>,
    #[serde(default)]
    pub randomness: Option<f64>,
    #[serde(default)]
    pub request_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub path_filter: Option<PathFilterSection>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitOverride>,
    #[serde(default)]
    pub queue: Option<QueueOverride>,
    #[serde(default)]
    pub retry: Option<RetryOverride>,
    #[serde(default)]
    pub request_body_substitution: Option<BodySubstitutionSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathFilterSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_filter_mode")]
    pub mode: String,
    #[serde(default)]
    pub patterns: Vec<String>,
}

fn default_filter_mode() -> String {
    "whitelist".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RateLimitOverride {
    #[serde(default)]
    pub endpoint_rate_limit: Option<String>,
    #[serde(default)]
    pub key_rate_limit: Option<String>,
    #[serde(default)]
    pub ip_rate_limit: Option<String>,
    #[serde(default)]
    pub user_rate_limit: Option<String>,
    #[serde(default)]
    pub rate_limit_paths: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct QueueOverride {
    #[serde(default)]
    pub max_size: Option<usize>,
    #[serde(default)]
    pub expiry_seconds: Option<u64>,
    #[serde(default)]
    pub max_workers: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RetryOverride {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub retry_after_seconds: Option<f64>,
    #[serde(default)]
    pub retry_request_methods: Option<Vec<String>>,
    #[serde(default)]
    pub retry_status_codes: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct BodySubstitutionSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<RuleSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSection {
    #[serde(default)]
    pub name: Option<String>,
    pub operation: String,
    pub path: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub conditions: Vec<ConditionSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionSection {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_parses_with_defaults() {
        let yaml = r#"
apis:
  gemini:
    endpoint: https://generativelanguage.googleapis.com
    headers:
      x-goog-api-key: "${{keys}}"
    variables:
      keys: [k1, k2]
"#;
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.server.port, 8080);
        assert_eq!(file.default_settings.queue.max_size, 100);
        assert_eq!(file.default_settings.retry.attempts, 3);
        let api = &file.apis["gemini"];
        assert_eq!(api.variables["keys"].rendered(), vec!["k1", "k2"]);
    }

    #[test]
    fn scalar_and_numeric_variables_render() {
        let yaml = r#"
apis:
  svc:
    endpoint: https://example.com
    headers:
      x-key: "${{keys}}"
    variables:
      keys: secret
      build: [42, 43]
"#;
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        let api = &file.apis["svc"];
        assert_eq!(api.variables["keys"].rendered(), vec!["secret"]);
        assert_eq!(api.variables["build"].rendered(), vec!["42", "43"]);
    }

    #[test]
    fn unknown_fields_rejected() {
        let yaml = r#"
server:
  port: 9000
  dashboard: true
"#;
        assert!(serde_yaml::from_str::<ConfigFile>(yaml).is_err());
    }

    #[test]
    fn debug_redacts_proxy_auth() {
        let yaml = r#"
server:
  proxy_auth: [master-secret, other-secret]
"#;
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        let debug = format!("{file:?}");
        assert!(!debug.contains("master-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn body_substitution_rules_parse() {
        let yaml = r#"
apis:
  openai:
    endpoint: https://api.openai.com
    headers:
      authorization: "Bearer ${{keys}}"
    variables:
      keys: [a]
    request_body_substitution:
      enabled: true
      rules:
        - name: default model
          operation: set
          path: model
          value: gpt-4
          conditions:
            - field: model
              operator: nexists
"#;
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        let sub = file.apis["openai"]
            .request_body_substitution
            .as_ref()
            .unwrap();
        assert!(sub.enabled);
        assert_eq!(sub.rules.len(), 1);
        assert_eq!(sub.rules[0].operation, "set");
        assert_eq!(sub.rules[0].conditions[0].operator, "nexists");
    }
}
