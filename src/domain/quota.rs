use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use super::error::ConfigError;

static QUOTA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s*/\s*(\d*)([smhd])$").expect("quota regex"));

/// One parsed sliding-window quota: at most `limit` admissions per `window`.
///
/// `Quota::parse` returns `None` for the unlimited spellings (`0`, `0/s`,
/// `0/5m`, …) — an unlimited quota allocates no window at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u32,
    pub window: Duration,
}

impl Quota {
    /// Parse a quota string: `N/unit` where unit is an optional count plus
    /// one of `s`, `m`, `h`, `d`. `1/s` and `1/1s` are equivalent;
    /// `10/15s` is a composite window.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when the string does not match the
    /// grammar.
    pub fn parse(scope: &str, raw: &str) -> Result<Option<Self>, ConfigError> {
        let raw = raw.trim();
        if raw == "0" {
            return Ok(None);
        }
        let caps = QUOTA_RE.captures(raw).ok_or_else(|| {
            ConfigError::invalid(
                scope,
                format!("invalid quota '{raw}', expected e.g. '10/s', '100/m', '10/15s' or '0'"),
            )
        })?;

        let limit: u32 = caps[1].parse().map_err(|_| {
            ConfigError::invalid(scope, format!("quota count out of range in '{raw}'"))
        })?;
        if limit == 0 {
            return Ok(None);
        }

        let multiplier: u64 = if caps[2].is_empty() {
            1
        } else {
            caps[2].parse().map_err(|_| {
                ConfigError::invalid(scope, format!("quota window out of range in '{raw}'"))
            })?
        };
        if multiplier == 0 {
            return Err(ConfigError::invalid(
                scope,
                format!("quota window must be non-zero in '{raw}'"),
            ));
        }

        let unit_secs = match &caps[3] {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86_400,
            _ => unreachable!("anchored by regex"),
        };

        Ok(Some(Self {
            limit,
            window: Duration::from_secs(multiplier * unit_secs),
        }))
    }
}
