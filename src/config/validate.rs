//! Snapshot validation: resolve per-upstream overrides against the
//! defaults, validate every field, and compile the immutable runtime model.
//!
//! An invalid document is rejected as a whole; the caller keeps serving the
//! previous generation.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use std::time::Duration;

use http::{HeaderName, Method};
use regex::Regex;

use crate::domain::error::ConfigError;
use crate::domain::model::{
    CorsSettings, FilterMode, HeaderTemplate, LbStrategy, PathFilter, PathPatterns, QueueSettings,
    QuotaSet, RetryMode, RetryPolicy, TemplateString, Upstream,
};
use crate::domain::quota::Quota;
use crate::domain::rewrite::{
    CondOp, Condition, JsonPath, RewriteOp, RewritePlan, RewriteRule, ValueTemplate,
};

use super::model::{ApiEntry, ConfigFile, DefaultSettings, RuleSection};
use super::ServerSettings;

/// Methods an upstream allowlist (and the retry method list) may name.
const ALLOWED_METHODS: &[Method] = &[
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::OPTIONS,
    Method::HEAD,
];

/// URL-space prefixes owned by the proxy itself; upstream ids and aliases
/// must not shadow them.
const RESERVED_SEGMENTS: &[&str] = &["api", "control"];

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("id regex"));

/// A validated configuration generation.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub server: ServerSettings,
    pub upstreams: Vec<Upstream>,
}

/// # Errors
///
/// Returns the first validation failure; nothing is partially applied.
pub fn build_snapshot(file: &ConfigFile) -> Result<Snapshot, ConfigError> {
    let server = build_server(file)?;

    if file.apis.is_empty() {
        return Err(ConfigError::invalid(
            "apis",
            "no upstreams configured; at least one is required",
        ));
    }

    let mut upstreams = Vec::with_capacity(file.apis.len());
    let mut taken_segments: HashSet<String> = HashSet::new();
    for (id, entry) in &file.apis {
        let upstream = build_upstream(id, entry, &file.default_settings)?;

        for segment in std::iter::once(&upstream.id).chain(upstream.aliases.iter()) {
            if RESERVED_SEGMENTS.contains(&segment.as_str()) {
                return Err(ConfigError::invalid(
                    id.as_str(),
                    format!("'{segment}' is a reserved path segment"),
                ));
            }
            if !taken_segments.insert(segment.clone()) {
                return Err(ConfigError::invalid(
                    id.as_str(),
                    format!("path segment '{segment}' is already taken by another upstream"),
                ));
            }
        }

        upstreams.push(upstream);
    }

    Ok(Snapshot { server, upstreams })
}

fn build_server(file: &ConfigFile) -> Result<ServerSettings, ConfigError> {
    let section = &file.server;

    if let Some(proxy) = &section.outbound_proxy {
        let ok = proxy.starts_with("http://")
            || proxy.starts_with("https://")
            || proxy.starts_with("socks5://")
            || proxy.starts_with("socks5h://");
        if !ok {
            return Err(ConfigError::invalid(
                "server.outbound_proxy",
                format!("unsupported proxy URI '{proxy}'"),
            ));
        }
    }

    if section.proxy_auth.iter().any(String::is_empty) {
        return Err(ConfigError::invalid(
            "server.proxy_auth",
            "empty credential in proxy_auth list",
        ));
    }

    let cors = section.cors.enabled.then(|| CorsSettings {
        allow_origin: section.cors.allow_origin.clone(),
        allow_methods: section.cors.allow_methods.clone(),
        allow_headers: section.cors.allow_headers.clone(),
    });

    Ok(ServerSettings {
        host: section.host.clone(),
        port: section.port,
        proxy_auth: section.proxy_auth.clone(),
        outbound_proxy: section.outbound_proxy.clone(),
        cors,
        history_size: section.history_size,
        metrics_log_interval: Duration::from_secs(section.metrics_log_interval_seconds),
        max_body_buffer: section.max_body_buffer_bytes,
        drain: Duration::from_secs(section.drain_seconds),
    })
}

fn build_upstream(
    id: &str,
    entry: &ApiEntry,
    defaults: &DefaultSettings,
) -> Result<Upstream, ConfigError> {
    if !ID_RE.is_match(id) {
        return Err(ConfigError::invalid(
            id,
            "upstream id must be alphanumeric with '-' or '_'",
        ));
    }

    let endpoint = entry.endpoint.trim().trim_end_matches('/').to_string();
    if endpoint.is_empty() {
        return Err(ConfigError::invalid(id, "endpoint URL must not be empty"));
    }
    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        return Err(ConfigError::invalid(
            id,
            format!("endpoint '{endpoint}' must be an http(s) URL"),
        ));
    }

    // Aliases are stored as bare segments.
    let mut aliases = Vec::with_capacity(entry.aliases.len());
    for alias in &entry.aliases {
        let segment = alias.trim().trim_matches('/').to_string();
        if !ID_RE.is_match(&segment) {
            return Err(ConfigError::invalid(
                id,
                format!("invalid alias '{alias}'"),
            ));
        }
        aliases.push(segment);
    }

    // Variables: at least one pool, every pool non-empty.
    if entry.variables.is_empty() {
        return Err(ConfigError::invalid(id, "at least one variable is required"));
    }
    let mut variables = HashMap::new();
    for (name, values) in &entry.variables {
        let rendered = values.rendered();
        if rendered.is_empty() {
            return Err(ConfigError::invalid(
                id,
                format!("variable '{name}' has no values"),
            ));
        }
        variables.insert(name.clone(), rendered);
    }

    let key_variable = entry
        .key_variable
        .clone()
        .unwrap_or_else(|| defaults.key_variable.clone());
    if !variables.contains_key(&key_variable) {
        return Err(ConfigError::invalid(
            id,
            format!("key_variable '{key_variable}' does not refer to a configured variable"),
        ));
    }

    // Weights must parallel their pool when present.
    let mut variable_weights = HashMap::new();
    for (name, weights) in &entry.variable_weights {
        let pool = variables.get(name).ok_or_else(|| {
            ConfigError::invalid(
                id,
                format!("weights given for unknown variable '{name}'"),
            )
        })?;
        if weights.len() != pool.len() {
            return Err(ConfigError::invalid(
                id,
                format!(
                    "weights for '{name}' have length {} but the pool has {} values",
                    weights.len(),
                    pool.len()
                ),
            ));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::invalid(
                id,
                format!("weights for '{name}' must be finite and non-negative"),
            ));
        }
        variable_weights.insert(name.clone(), weights.clone());
    }

    // Headers: non-empty map, valid names, templates compile, every
    // referenced variable exists (template totality, checked up front).
    if entry.headers.is_empty() {
        return Err(ConfigError::invalid(id, "header map must not be empty"));
    }
    let mut headers = Vec::with_capacity(entry.headers.len());
    for (raw_name, raw_value) in &entry.headers {
        let name = HeaderName::from_bytes(raw_name.to_lowercase().as_bytes()).map_err(|_| {
            ConfigError::invalid(id, format!("invalid header name '{raw_name}'"))
        })?;
        let value = TemplateString::compile(raw_value);
        for referenced in value.referenced() {
            if !variables.contains_key(referenced) {
                return Err(ConfigError::invalid(
                    id,
                    format!(
                        "header '{raw_name}' references undefined variable '{referenced}'"
                    ),
                ));
            }
        }
        headers.push(HeaderTemplate { name, value });
    }

    let strategy_raw = entry
        .load_balancing_strategy
        .as_deref()
        .unwrap_or(&defaults.load_balancing_strategy);
    let strategy: LbStrategy = strategy_raw
        .parse()
        .map_err(|e: String| ConfigError::invalid(id, e))?;

    let allowed_methods = match &entry.methods {
        None => None,
        Some(raw_methods) => {
            let mut methods = Vec::with_capacity(raw_methods.len());
            for raw in raw_methods {
                methods.push(parse_method(id, raw)?);
            }
            Some(methods)
        }
    };

    let path_filter = match &entry.path_filter {
        Some(section) if section.enabled => {
            let mode: FilterMode = section
                .mode
                .parse()
                .map_err(|e: String| ConfigError::invalid(id, e))?;
            let patterns = PathPatterns::compile(id, &section.patterns)?;
            Some(PathFilter { mode, patterns })
        }
        _ => None,
    };

    // Rate limits, queue, retry: entry overrides on top of defaults.
    let rl = &defaults.rate_limit;
    let over = entry.rate_limit.as_ref();
    let pick = |field: Option<&String>, default: &str| -> String {
        field.map_or_else(|| default.to_string(), Clone::clone)
    };
    let quotas = QuotaSet {
        endpoint: Quota::parse(id, &pick(over.and_then(|o| o.endpoint_rate_limit.as_ref()), &rl.endpoint_rate_limit))?,
        key: Quota::parse(id, &pick(over.and_then(|o| o.key_rate_limit.as_ref()), &rl.key_rate_limit))?,
        ip: Quota::parse(id, &pick(over.and_then(|o| o.ip_rate_limit.as_ref()), &rl.ip_rate_limit))?,
        user: Quota::parse(id, &pick(over.and_then(|o| o.user_rate_limit.as_ref()), &rl.user_rate_limit))?,
        rate_limit_paths: PathPatterns::compile(
            id,
            over.and_then(|o| o.rate_limit_paths.as_ref())
                .unwrap_or(&rl.rate_limit_paths),
        )?,
    };

    let queue_defaults = &defaults.queue;
    let queue_over = entry.queue.as_ref();
    let queue = QueueSettings {
        max_size: queue_over
            .and_then(|q| q.max_size)
            .unwrap_or(queue_defaults.max_size),
        expiry: Duration::from_secs(
            queue_over
                .and_then(|q| q.expiry_seconds)
                .unwrap_or(queue_defaults.expiry_seconds),
        ),
        max_workers: queue_over
            .and_then(|q| q.max_workers)
            .unwrap_or(queue_defaults.max_workers),
    };
    if queue.max_size == 0 || queue.max_workers == 0 || queue.expiry.is_zero() {
        return Err(ConfigError::invalid(
            id,
            "queue max_size, max_workers and expiry_seconds must all be non-zero",
        ));
    }

    let retry = build_retry(id, entry, defaults)?;

    let randomness = entry.randomness.unwrap_or(defaults.randomness);
    if !randomness.is_finite() || randomness < 0.0 {
        return Err(ConfigError::invalid(
            id,
            "randomness must be a non-negative number of seconds",
        ));
    }

    let request_timeout = Duration::from_secs(
        entry
            .request_timeout_seconds
            .unwrap_or(defaults.request_timeout_seconds),
    );
    if request_timeout.is_zero() {
        return Err(ConfigError::invalid(
            id,
            "request_timeout_seconds must be non-zero",
        ));
    }

    let rewrite = match &entry.request_body_substitution {
        Some(section) if section.enabled => Some(build_rewrite_plan(id, &section.rules)?),
        _ => None,
    };

    Ok(Upstream {
        id: id.to_string(),
        name: entry.name.clone().unwrap_or_else(|| id.to_string()),
        endpoint,
        aliases,
        headers,
        variables,
        variable_weights,
        strategy,
        key_variable,
        key_concurrency: entry.key_concurrency.unwrap_or(defaults.key_concurrency),
        randomness,
        allowed_methods,
        path_filter,
        queue,
        quotas,
        retry,
        request_timeout,
        rewrite,
    })
}

fn build_retry(
    id: &str,
    entry: &ApiEntry,
    defaults: &DefaultSettings,
) -> Result<RetryPolicy, ConfigError> {
    let base = &defaults.retry;
    let over = entry.retry.as_ref();

    let enabled = over.and_then(|r| r.enabled).unwrap_or(base.enabled);
    if !enabled {
        return Ok(RetryPolicy::disabled());
    }

    let mode_raw = over
        .and_then(|r| r.mode.as_deref())
        .unwrap_or(&base.mode);
    let mode: RetryMode = mode_raw
        .parse()
        .map_err(|e: String| ConfigError::invalid(id, e))?;

    let retry_after_secs = over
        .and_then(|r| r.retry_after_seconds)
        .unwrap_or(base.retry_after_seconds);
    if !retry_after_secs.is_finite() || retry_after_secs < 0.0 {
        return Err(ConfigError::invalid(
            id,
            "retry_after_seconds must be a non-negative number",
        ));
    }

    let raw_methods = over
        .and_then(|r| r.retry_request_methods.as_ref())
        .unwrap_or(&base.retry_request_methods);
    let mut request_methods = Vec::with_capacity(raw_methods.len());
    for raw in raw_methods {
        request_methods.push(parse_method(id, raw)?);
    }

    let status_codes = over
        .and_then(|r| r.retry_status_codes.clone())
        .unwrap_or_else(|| base.retry_status_codes.clone());
    if let Some(bad) = status_codes.iter().find(|c| !(100..=599).contains(*c)) {
        return Err(ConfigError::invalid(
            id,
            format!("retry status code {bad} is outside 100..=599"),
        ));
    }

    Ok(RetryPolicy {
        enabled,
        mode,
        attempts: over.and_then(|r| r.attempts).unwrap_or(base.attempts),
        retry_after: Duration::from_secs_f64(retry_after_secs),
        request_methods,
        status_codes,
    })
}

fn build_rewrite_plan(id: &str, sections: &[RuleSection]) -> Result<RewritePlan, ConfigError> {
    let mut rules = Vec::with_capacity(sections.len());
    for (index, section) in sections.iter().enumerate() {
        let name = section
            .name
            .clone()
            .unwrap_or_else(|| format!("rule #{index}"));
        let scope = format!("{id}/{name}");

        let op: RewriteOp = section
            .operation
            .parse()
            .map_err(|e: String| ConfigError::invalid(scope.as_str(), e))?;
        let path = JsonPath::parse(&section.path)
            .map_err(|e| ConfigError::invalid(scope.as_str(), e))?;

        let value = match (op, &section.value) {
            (RewriteOp::Set, Some(raw)) => Some(
                ValueTemplate::compile(raw)
                    .map_err(|e| ConfigError::invalid(scope.as_str(), e))?,
            ),
            (RewriteOp::Set, None) => {
                return Err(ConfigError::invalid(
                    scope.as_str(),
                    "set rules require a value",
                ));
            }
            (RewriteOp::Remove, _) => None,
        };

        let mut conditions = Vec::with_capacity(section.conditions.len());
        for cond in &section.conditions {
            let field = JsonPath::parse(&cond.field)
                .map_err(|e| ConfigError::invalid(scope.as_str(), e))?;
            let cond_op: CondOp = cond
                .operator
                .parse()
                .map_err(|e: String| ConfigError::invalid(scope.as_str(), e))?;
            conditions.push(
                Condition::new(field, cond_op, cond.value.clone())
                    .map_err(|e| ConfigError::invalid(scope.as_str(), e))?,
            );
        }

        rules.push(RewriteRule {
            name,
            op,
            path,
            value,
            conditions,
        });
    }
    Ok(RewritePlan { rules })
}

fn parse_method(id: &str, raw: &str) -> Result<Method, ConfigError> {
    let method = Method::from_bytes(raw.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| ConfigError::invalid(id, format!("invalid method '{raw}'")))?;
    if !ALLOWED_METHODS.contains(&method) {
        return Err(ConfigError::invalid(
            id,
            format!("method '{raw}' is not in the allowed set"),
        ));
    }
    Ok(method)
}
