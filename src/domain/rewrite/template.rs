use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::path::JsonPath;

static PATH_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("token regex"));

#[derive(Debug, Clone)]
pub enum TextChunk {
    Literal(String),
    Path(JsonPath),
}

/// A rule value with `${{path}}` tokens compiled out. Tokens resolve
/// against the *original* request body, not the partially rewritten one.
#[derive(Debug, Clone)]
pub enum ValueTemplate {
    /// No tokens anywhere: the literal value.
    Literal(Value),
    /// The whole value is a single token: resolves to the referenced node
    /// with its type preserved; missing paths resolve to null.
    Node(JsonPath),
    /// A string with embedded tokens: tokens render textually.
    Text(Vec<TextChunk>),
    Array(Vec<ValueTemplate>),
    Object(Vec<(String, ValueTemplate)>),
}

impl ValueTemplate {
    /// # Errors
    ///
    /// Returns a description when an embedded path expression fails to
    /// compile.
    pub fn compile(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) => compile_string(s),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(Self::compile(item)?);
                }
                if out.iter().all(ValueTemplate::is_literal) {
                    Ok(Self::Literal(value.clone()))
                } else {
                    Ok(Self::Array(out))
                }
            }
            Value::Object(map) => {
                let mut out = Vec::with_capacity(map.len());
                for (key, item) in map {
                    out.push((key.clone(), Self::compile(item)?));
                }
                if out.iter().all(|(_, t)| t.is_literal()) {
                    Ok(Self::Literal(value.clone()))
                } else {
                    Ok(Self::Object(out))
                }
            }
            other => Ok(Self::Literal(other.clone())),
        }
    }

    fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    /// Render against the original request body.
    #[must_use]
    pub fn render(&self, original: &Value) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Node(path) => path.resolve(original).cloned().unwrap_or(Value::Null),
            Self::Text(chunks) => {
                let mut out = String::new();
                for chunk in chunks {
                    match chunk {
                        TextChunk::Literal(lit) => out.push_str(lit),
                        TextChunk::Path(path) => match path.resolve(original) {
                            None => {}
                            Some(node) => out.push_str(&render_text(node)),
                        },
                    }
                }
                Value::String(out)
            }
            Self::Array(items) => {
                Value::Array(items.iter().map(|t| t.render(original)).collect())
            }
            Self::Object(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, t)| (k.clone(), t.render(original)))
                    .collect(),
            ),
        }
    }
}

fn compile_string(raw: &str) -> Result<ValueTemplate, String> {
    // Whole-string single token: node reference, type preserved.
    if let Some(caps) = PATH_TOKEN_RE.captures(raw)
        && caps.get(0).expect("full match").as_str() == raw
    {
        return Ok(ValueTemplate::Node(JsonPath::parse(&caps[1])?));
    }

    let mut chunks = Vec::new();
    let mut last = 0;
    for caps in PATH_TOKEN_RE.captures_iter(raw) {
        let m = caps.get(0).expect("full match");
        if m.start() > last {
            chunks.push(TextChunk::Literal(raw[last..m.start()].to_string()));
        }
        chunks.push(TextChunk::Path(JsonPath::parse(&caps[1])?));
        last = m.end();
    }
    if chunks.is_empty() {
        return Ok(ValueTemplate::Literal(Value::String(raw.to_string())));
    }
    if last < raw.len() {
        chunks.push(TextChunk::Literal(raw[last..].to_string()));
    }
    Ok(ValueTemplate::Text(chunks))
}

/// Textual rendering for embedded tokens: scalars in their string form,
/// structures JSON-serialized.
fn render_text(node: &Value) -> String {
    match node {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        structured => serde_json::to_string(structured).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(v: Value) -> ValueTemplate {
        ValueTemplate::compile(&v).unwrap()
    }

    #[test]
    fn literal_passthrough() {
        let original = json!({});
        assert_eq!(compile(json!("gpt-4")).render(&original), json!("gpt-4"));
        assert_eq!(compile(json!(0.7)).render(&original), json!(0.7));
        assert_eq!(compile(json!({"a": [1, 2]})).render(&original), json!({"a": [1, 2]}));
    }

    #[test]
    fn standalone_token_preserves_type() {
        let original = json!({"max_tokens": 512, "meta": {"tags": ["a"]}});
        assert_eq!(
            compile(json!("${{max_tokens}}")).render(&original),
            json!(512)
        );
        assert_eq!(
            compile(json!("${{meta.tags}}")).render(&original),
            json!(["a"])
        );
    }

    #[test]
    fn standalone_token_missing_is_null() {
        assert_eq!(compile(json!("${{absent}}")).render(&json!({})), json!(null));
    }

    #[test]
    fn embedded_tokens_render_textually() {
        let original = json!({"model": "gpt-4", "n": 2, "opts": {"a": 1}});
        assert_eq!(
            compile(json!("model=${{model}} n=${{n}}")).render(&original),
            json!("model=gpt-4 n=2")
        );
        assert_eq!(
            compile(json!("opts: ${{opts}}")).render(&original),
            json!("opts: {\"a\":1}")
        );
    }

    #[test]
    fn embedded_missing_renders_empty() {
        assert_eq!(
            compile(json!("x=${{absent}}!")).render(&json!({})),
            json!("x=!")
        );
    }

    #[test]
    fn structured_value_with_nested_tokens() {
        let original = json!({"user": "alice"});
        let template = compile(json!({
            "metadata": {"user_id": "${{user}}"},
            "fixed": true
        }));
        assert_eq!(
            template.render(&original),
            json!({"metadata": {"user_id": "alice"}, "fixed": true})
        );
    }

    #[test]
    fn invalid_embedded_path_is_compile_error() {
        assert!(ValueTemplate::compile(&json!("${{a..b}}")).is_err());
    }
}
