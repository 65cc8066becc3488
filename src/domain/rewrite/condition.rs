use regex::Regex;
use serde_json::Value;

use super::path::JsonPath;

/// Condition operators over the JSON node selected by `field`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    In,
    Nin,
    Like,
    Nlike,
    Contains,
    Ncontains,
    Between,
    Nbetween,
    StartsWith,
    EndsWith,
    Exists,
    Nexists,
    IsNull,
    NotNull,
}

impl CondOp {
    /// Whether this operator requires a comparison value.
    #[must_use]
    pub fn takes_value(&self) -> bool {
        !matches!(self, Self::Exists | Self::Nexists | Self::IsNull | Self::NotNull)
    }
}

impl std::str::FromStr for CondOp {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "eq" => Ok(Self::Eq),
            "ne" => Ok(Self::Ne),
            "gt" => Ok(Self::Gt),
            "lt" => Ok(Self::Lt),
            "ge" => Ok(Self::Ge),
            "le" => Ok(Self::Le),
            "in" => Ok(Self::In),
            "nin" => Ok(Self::Nin),
            "like" => Ok(Self::Like),
            "nlike" => Ok(Self::Nlike),
            "contains" => Ok(Self::Contains),
            "ncontains" => Ok(Self::Ncontains),
            "between" => Ok(Self::Between),
            "nbetween" => Ok(Self::Nbetween),
            "startswith" => Ok(Self::StartsWith),
            "endswith" => Ok(Self::EndsWith),
            "exists" => Ok(Self::Exists),
            "nexists" => Ok(Self::Nexists),
            "isnull" => Ok(Self::IsNull),
            "notnull" => Ok(Self::NotNull),
            other => Err(format!("unsupported condition operator: {other}")),
        }
    }
}

/// A single rule condition. `like`/`nlike` patterns are compiled to a
/// regex at registration time.
#[derive(Debug, Clone)]
pub struct Condition {
    pub field: JsonPath,
    pub op: CondOp,
    pub value: Option<Value>,
    like: Option<Regex>,
}

impl Condition {
    /// # Errors
    ///
    /// Returns a description when the operator/value combination is invalid
    /// (missing value, non-array `in`/`between` argument, bad pattern).
    pub fn new(field: JsonPath, op: CondOp, value: Option<Value>) -> Result<Self, String> {
        if op.takes_value() && value.is_none() {
            return Err(format!("operator {op:?} requires a value"));
        }

        match op {
            CondOp::In | CondOp::Nin => {
                if !value.as_ref().is_some_and(Value::is_array) {
                    return Err(format!("operator {op:?} requires an array value"));
                }
            }
            CondOp::Between | CondOp::Nbetween => {
                let ok = value
                    .as_ref()
                    .and_then(Value::as_array)
                    .is_some_and(|a| a.len() == 2);
                if !ok {
                    return Err(format!("operator {op:?} requires a two-element array"));
                }
            }
            _ => {}
        }

        let like = if matches!(op, CondOp::Like | CondOp::Nlike) {
            let pattern = value
                .as_ref()
                .and_then(Value::as_str)
                .ok_or_else(|| format!("operator {op:?} requires a string pattern"))?;
            Some(compile_like(pattern).map_err(|e| format!("invalid like pattern: {e}"))?)
        } else {
            None
        };

        Ok(Self {
            field,
            op,
            value,
            like,
        })
    }

    /// Evaluate against the (current) request body. For every operator but
    /// `nexists`, an unresolvable field makes the condition false.
    #[must_use]
    pub fn evaluate(&self, body: &Value) -> bool {
        let selected = self.field.resolve(body);

        match self.op {
            CondOp::Exists => selected.is_some(),
            CondOp::Nexists => selected.is_none(),
            CondOp::IsNull => selected.is_some_and(Value::is_null),
            CondOp::NotNull => selected.is_some_and(|v| !v.is_null()),
            _ => {
                let Some(selected) = selected else {
                    return false;
                };
                let value = self.value.as_ref().expect("validated at construction");
                match self.op {
                    CondOp::Eq => json_eq(selected, value),
                    CondOp::Ne => !json_eq(selected, value),
                    CondOp::Gt => compare(selected, value).is_some_and(|o| o.is_gt()),
                    CondOp::Lt => compare(selected, value).is_some_and(|o| o.is_lt()),
                    CondOp::Ge => compare(selected, value).is_some_and(|o| o.is_ge()),
                    CondOp::Le => compare(selected, value).is_some_and(|o| o.is_le()),
                    CondOp::In => value
                        .as_array()
                        .expect("validated")
                        .iter()
                        .any(|v| json_eq(selected, v)),
                    CondOp::Nin => !value
                        .as_array()
                        .expect("validated")
                        .iter()
                        .any(|v| json_eq(selected, v)),
                    CondOp::Like => selected
                        .as_str()
                        .is_some_and(|s| self.like.as_ref().expect("compiled").is_match(s)),
                    CondOp::Nlike => selected
                        .as_str()
                        .is_some_and(|s| !self.like.as_ref().expect("compiled").is_match(s)),
                    CondOp::Contains => contains(selected, value),
                    CondOp::Ncontains => !contains(selected, value),
                    CondOp::Between => between(selected, value),
                    CondOp::Nbetween => !between(selected, value),
                    CondOp::StartsWith => match (selected.as_str(), value.as_str()) {
                        (Some(s), Some(prefix)) => s.starts_with(prefix),
                        _ => false,
                    },
                    CondOp::EndsWith => match (selected.as_str(), value.as_str()) {
                        (Some(s), Some(suffix)) => s.ends_with(suffix),
                        _ => false,
                    },
                    CondOp::Exists | CondOp::Nexists | CondOp::IsNull | CondOp::NotNull => {
                        unreachable!("handled above")
                    }
                }
            }
        }
    }
}

/// Equality with numeric normalization: `1` and `1.0` compare equal.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.cmp(y));
    }
    None
}

/// "Selected contains value": array membership, substring, or object key.
fn contains(selected: &Value, value: &Value) -> bool {
    match selected {
        Value::Array(items) => items.iter().any(|v| json_eq(v, value)),
        Value::String(s) => value.as_str().is_some_and(|needle| s.contains(needle)),
        Value::Object(map) => value.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

/// Inclusive range test against a validated two-element array.
fn between(selected: &Value, value: &Value) -> bool {
    let bounds = value.as_array().expect("validated");
    let lo = &bounds[0];
    let hi = &bounds[1];
    compare(selected, lo).is_some_and(|o| o.is_ge()) && compare(selected, hi).is_some_and(|o| o.is_le())
}

/// Translate a SQL-style wildcard pattern (`%` any run, `_` any one) into
/// an anchored regex.
fn compile_like(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(field: &str, op: &str, value: Option<Value>) -> Condition {
        Condition::new(JsonPath::parse(field).unwrap(), op.parse().unwrap(), value).unwrap()
    }

    #[test]
    fn eq_normalizes_numbers() {
        let body = json!({"n": 1});
        assert!(cond("n", "eq", Some(json!(1.0))).evaluate(&body));
        assert!(!cond("n", "eq", Some(json!(2))).evaluate(&body));
        assert!(cond("n", "ne", Some(json!(2))).evaluate(&body));
    }

    #[test]
    fn ordering_numbers_and_strings() {
        let body = json!({"t": 0.7, "name": "beta"});
        assert!(cond("t", "gt", Some(json!(0.5))).evaluate(&body));
        assert!(cond("t", "le", Some(json!(0.7))).evaluate(&body));
        assert!(cond("name", "ge", Some(json!("alpha"))).evaluate(&body));
        assert!(!cond("name", "lt", Some(json!("alpha"))).evaluate(&body));
        // Mixed types never order.
        assert!(!cond("t", "gt", Some(json!("0.5"))).evaluate(&body));
    }

    #[test]
    fn in_is_membership_of_given_array() {
        let body = json!({"model": "gpt-4"});
        assert!(cond("model", "in", Some(json!(["gpt-4", "gpt-4o"]))).evaluate(&body));
        assert!(cond("model", "nin", Some(json!(["o1"]))).evaluate(&body));
    }

    #[test]
    fn contains_is_membership_in_selected() {
        let body = json!({
            "stop": ["a", "b"],
            "prompt": "hello world",
            "opts": {"stream": true}
        });
        assert!(cond("stop", "contains", Some(json!("a"))).evaluate(&body));
        assert!(cond("prompt", "contains", Some(json!("world"))).evaluate(&body));
        assert!(cond("opts", "contains", Some(json!("stream"))).evaluate(&body));
        assert!(cond("stop", "ncontains", Some(json!("c"))).evaluate(&body));
    }

    #[test]
    fn like_sql_wildcards() {
        let body = json!({"model": "gpt-4-turbo"});
        assert!(cond("model", "like", Some(json!("gpt-%"))).evaluate(&body));
        assert!(cond("model", "like", Some(json!("gpt-_-turbo"))).evaluate(&body));
        assert!(!cond("model", "like", Some(json!("claude-%"))).evaluate(&body));
        assert!(cond("model", "nlike", Some(json!("claude-%"))).evaluate(&body));
        // Regex metacharacters in the pattern are literal.
        let body = json!({"v": "a.b"});
        assert!(cond("v", "like", Some(json!("a.b"))).evaluate(&body));
        assert!(!cond("v", "like", Some(json!("axb"))).evaluate(&body));
    }

    #[test]
    fn between_inclusive() {
        let body = json!({"temperature": 1.0});
        assert!(cond("temperature", "between", Some(json!([0.0, 1.0]))).evaluate(&body));
        assert!(cond("temperature", "between", Some(json!([1.0, 2.0]))).evaluate(&body));
        assert!(!cond("temperature", "between", Some(json!([1.5, 2.0]))).evaluate(&body));
        assert!(cond("temperature", "nbetween", Some(json!([1.5, 2.0]))).evaluate(&body));
    }

    #[test]
    fn string_affix_operators() {
        let body = json!({"model": "gpt-4-turbo"});
        assert!(cond("model", "startswith", Some(json!("gpt-"))).evaluate(&body));
        assert!(cond("model", "endswith", Some(json!("-turbo"))).evaluate(&body));
        assert!(!cond("model", "startswith", Some(json!("o1"))).evaluate(&body));
    }

    #[test]
    fn existence_operators_depend_only_on_resolution() {
        let body = json!({"present": null});
        assert!(cond("present", "exists", None).evaluate(&body));
        assert!(cond("missing", "nexists", None).evaluate(&body));
        assert!(cond("present", "isnull", None).evaluate(&body));
        assert!(!cond("present", "notnull", None).evaluate(&body));
        assert!(!cond("missing", "isnull", None).evaluate(&body));
        assert!(!cond("missing", "notnull", None).evaluate(&body));
    }

    #[test]
    fn missing_field_fails_value_operators() {
        let body = json!({});
        assert!(!cond("x", "eq", Some(json!(1))).evaluate(&body));
        assert!(!cond("x", "ne", Some(json!(1))).evaluate(&body));
        assert!(!cond("x", "nin", Some(json!([1]))).evaluate(&body));
    }

    #[test]
    fn construction_validates_arguments() {
        let field = JsonPath::parse("x").unwrap();
        assert!(Condition::new(field.clone(), CondOp::Eq, None).is_err());
        assert!(Condition::new(field.clone(), CondOp::In, Some(json!("not-array"))).is_err());
        assert!(Condition::new(field.clone(), CondOp::Between, Some(json!([1]))).is_err());
        assert!(Condition::new(field, CondOp::Like, Some(json!(5))).is_err());
    }
}
