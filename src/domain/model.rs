use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use http::{HeaderName, Method};
use regex::Regex;

use super::error::ConfigError;
use super::quota::Quota;
use super::rewrite::RewritePlan;

static VAR_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{\s*([A-Za-z0-9_.\[\]-]+)\s*\}\}").expect("token regex"));

// ---------------------------------------------------------------------------
// Load balancing
// ---------------------------------------------------------------------------

/// Closed set of load-balancing strategies for variable pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LbStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastRequests,
    FastestResponse,
    Weighted,
}

impl LbStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::LeastRequests => "least_requests",
            Self::FastestResponse => "fastest_response",
            Self::Weighted => "weighted",
        }
    }
}

impl std::str::FromStr for LbStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "least_requests" => Ok(Self::LeastRequests),
            "fastest_response" => Ok(Self::FastestResponse),
            "weighted" => Ok(Self::Weighted),
            other => Err(format!("unsupported load balancing strategy: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryMode {
    #[default]
    Default,
    Backoff,
    KeyRotation,
}

impl std::str::FromStr for RetryMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "backoff" => Ok(Self::Backoff),
            "key_rotation" => Ok(Self::KeyRotation),
            other => Err(format!("unsupported retry mode: {other}")),
        }
    }
}

/// Per-upstream retry policy. `attempts` counts retries, so a request makes
/// at most `attempts + 1` upstream dispatches.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub mode: RetryMode,
    pub attempts: u32,
    pub retry_after: Duration,
    pub request_methods: Vec<Method>,
    pub status_codes: Vec<u16>,
}

impl RetryPolicy {
    pub const BACKOFF_CAP: Duration = Duration::from_secs(60);

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            mode: RetryMode::Default,
            attempts: 0,
            retry_after: Duration::ZERO,
            request_methods: Vec::new(),
            status_codes: Vec::new(),
        }
    }

    #[must_use]
    pub fn method_retryable(&self, method: &Method) -> bool {
        self.enabled && self.request_methods.contains(method)
    }

    #[must_use]
    pub fn status_retryable(&self, status: u16) -> bool {
        self.enabled && self.status_codes.contains(&status)
    }

    /// Delay before the given retry (1-based), per mode. Capped for backoff.
    #[must_use]
    pub fn delay_for(&self, retry_number: u32) -> Duration {
        match self.mode {
            RetryMode::Default | RetryMode::KeyRotation => self.retry_after,
            RetryMode::Backoff => {
                let factor = 2u32.saturating_pow(retry_number.saturating_sub(1));
                let delay = self.retry_after.saturating_mul(factor);
                delay.min(Self::BACKOFF_CAP)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Path patterns & filters
// ---------------------------------------------------------------------------

/// A compiled list of path regexes. The literal `"*"` entry means
/// match-everything regardless of position or mode.
#[derive(Debug, Clone)]
pub enum PathPatterns {
    All,
    Regexes(Vec<Regex>),
}

impl PathPatterns {
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when any pattern fails to compile.
    pub fn compile(scope: &str, patterns: &[String]) -> Result<Self, ConfigError> {
        if patterns.iter().any(|p| p.trim() == "*") {
            return Ok(Self::All);
        }
        let mut regexes = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let re = Regex::new(pattern).map_err(|e| {
                ConfigError::invalid(scope, format!("invalid path pattern '{pattern}': {e}"))
            })?;
            regexes.push(re);
        }
        Ok(Self::Regexes(regexes))
    }

    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::All => true,
            Self::Regexes(regexes) => regexes.iter().any(|re| re.is_match(path)),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Regexes(r) if r.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Whitelist,
    Blacklist,
}

impl std::str::FromStr for FilterMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "whitelist" => Ok(Self::Whitelist),
            "blacklist" => Ok(Self::Blacklist),
            other => Err(format!("unsupported path filter mode: {other}")),
        }
    }
}

/// Suffix filter applied after routing: whitelist requires at least one
/// match, blacklist requires none.
#[derive(Debug, Clone)]
pub struct PathFilter {
    pub mode: FilterMode,
    pub patterns: PathPatterns,
}

impl PathFilter {
    #[must_use]
    pub fn allows(&self, path: &str) -> bool {
        match self.mode {
            FilterMode::Whitelist => self.patterns.matches(path),
            FilterMode::Blacklist => !self.patterns.matches(path),
        }
    }
}

// ---------------------------------------------------------------------------
// Header templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateChunk {
    Literal(String),
    Variable(String),
}

/// A header value with `${{name}}` placeholders compiled out.
#[derive(Debug, Clone)]
pub struct TemplateString {
    pub chunks: Vec<TemplateChunk>,
}

impl TemplateString {
    #[must_use]
    pub fn compile(raw: &str) -> Self {
        let mut chunks = Vec::new();
        let mut last = 0;
        for caps in VAR_TOKEN_RE.captures_iter(raw) {
            let m = caps.get(0).expect("full match");
            if m.start() > last {
                chunks.push(TemplateChunk::Literal(raw[last..m.start()].to_string()));
            }
            chunks.push(TemplateChunk::Variable(caps[1].to_string()));
            last = m.end();
        }
        if last < raw.len() {
            chunks.push(TemplateChunk::Literal(raw[last..].to_string()));
        }
        Self { chunks }
    }

    /// Variable names referenced by this template, in order of appearance.
    #[must_use]
    pub fn referenced(&self) -> Vec<&str> {
        self.chunks
            .iter()
            .filter_map(|c| match c {
                TemplateChunk::Variable(name) => Some(name.as_str()),
                TemplateChunk::Literal(_) => None,
            })
            .collect()
    }

    #[must_use]
    pub fn is_static(&self) -> bool {
        self.chunks
            .iter()
            .all(|c| matches!(c, TemplateChunk::Literal(_)))
    }

    /// Render against the bound variables. A running proxy must never emit
    /// an unresolved token, so a missing binding is an error, not a blank.
    ///
    /// # Errors
    ///
    /// Returns the missing variable name.
    pub fn render(&self, bindings: &HashMap<String, String>) -> Result<String, String> {
        let mut out = String::new();
        for chunk in &self.chunks {
            match chunk {
                TemplateChunk::Literal(lit) => out.push_str(lit),
                TemplateChunk::Variable(name) => match bindings.get(name) {
                    Some(value) => out.push_str(value),
                    None => return Err(name.clone()),
                },
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct HeaderTemplate {
    pub name: HeaderName,
    pub value: TemplateString,
}

// ---------------------------------------------------------------------------
// Queue / quota / CORS settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub max_size: usize,
    pub expiry: Duration,
    pub max_workers: usize,
}

/// The four quota scopes of one upstream plus the paths that count toward
/// key-usage accounting. `None` means unlimited (no window allocated).
#[derive(Debug, Clone)]
pub struct QuotaSet {
    pub endpoint: Option<Quota>,
    pub key: Option<Quota>,
    pub ip: Option<Quota>,
    pub user: Option<Quota>,
    pub rate_limit_paths: PathPatterns,
}

#[derive(Debug, Clone)]
pub struct CorsSettings {
    pub allow_origin: String,
    pub allow_methods: String,
    pub allow_headers: String,
}

// ---------------------------------------------------------------------------
// Upstream (immutable per config generation)
// ---------------------------------------------------------------------------

/// One configured target API, fully resolved against the defaults and
/// compiled (templates, filters, rewrite rules) at validation time.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub id: String,
    pub name: String,
    /// Base URL without a trailing slash.
    pub endpoint: String,
    /// Alias path segments, normalized without slashes (e.g. `gemini`).
    pub aliases: Vec<String>,
    pub headers: Vec<HeaderTemplate>,
    pub variables: HashMap<String, Vec<String>>,
    pub variable_weights: HashMap<String, Vec<f64>>,
    pub strategy: LbStrategy,
    pub key_variable: String,
    pub key_concurrency: bool,
    /// Upper bound of uniform pre-send jitter, in seconds.
    pub randomness: f64,
    /// `None` means all methods are allowed.
    pub allowed_methods: Option<Vec<Method>>,
    pub path_filter: Option<PathFilter>,
    pub queue: QueueSettings,
    pub quotas: QuotaSet,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub rewrite: Option<RewritePlan>,
}

impl Upstream {
    #[must_use]
    pub fn key_values(&self) -> &[String] {
        self.variables
            .get(&self.key_variable)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn method_allowed(&self, method: &Method) -> bool {
        match &self.allowed_methods {
            Some(methods) => methods.contains(method),
            None => true,
        }
    }

    /// Variable names referenced by any header template.
    #[must_use]
    pub fn referenced_variables(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for header in &self.headers {
            for name in header.value.referenced() {
                if !seen.contains(&name) {
                    seen.push(name);
                }
            }
        }
        seen
    }
}
