//! Declarative JSON body rewriting: ordered `set`/`remove` rules over a
//! path-expression tree walk, gated by conditions.
//!
//! Rules are compiled at config-validation time; application is a pure
//! transformation over `serde_json::Value`. Conditions see the body as
//! rewritten by all prior rules; value templates resolve against the
//! original body.

pub mod condition;
pub mod path;
pub mod template;

pub use condition::{CondOp, Condition};
pub use path::JsonPath;
pub use template::ValueTemplate;

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteOp {
    Set,
    Remove,
}

impl std::str::FromStr for RewriteOp {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "set" => Ok(Self::Set),
            "remove" => Ok(Self::Remove),
            other => Err(format!("unsupported rewrite operation: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RewriteRule {
    pub name: String,
    pub op: RewriteOp,
    pub path: JsonPath,
    pub value: Option<ValueTemplate>,
    pub conditions: Vec<Condition>,
}

impl RewriteRule {
    fn applies(&self, body: &Value) -> bool {
        self.conditions.iter().all(|c| c.evaluate(body))
    }
}

/// An ordered, compiled rule list for one upstream.
#[derive(Debug, Clone, Default)]
pub struct RewritePlan {
    pub rules: Vec<RewriteRule>,
}

impl RewritePlan {
    /// Apply all rules in declared order. Returns `true` when any rule
    /// fired (callers re-serialize only in that case, keeping untouched
    /// bodies byte-identical).
    pub fn apply(&self, body: &mut Value) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        let original = body.clone();
        let mut changed = false;
        for rule in &self.rules {
            if !rule.applies(body) {
                continue;
            }
            match rule.op {
                RewriteOp::Set => {
                    let value = rule
                        .value
                        .as_ref()
                        .expect("set rules carry a value, enforced at validation")
                        .render(&original);
                    rule.path.set(body, value);
                    changed = true;
                }
                RewriteOp::Remove => {
                    changed |= rule.path.remove(body);
                }
            }
        }
        changed
    }
}
