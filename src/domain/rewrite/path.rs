use serde_json::Value;

/// One step of a compiled path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A compiled path expression over a JSON tree: dot-separated keys with
/// optional `[n]` index suffixes, e.g. `messages[0].content` or
/// `choices[1].delta.tool_calls[0]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Compile a path expression. Compilation happens at rule-registration
    /// time; invalid syntax is a configuration error.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description of the syntax error.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("empty path expression".to_string());
        }

        let mut segments = Vec::new();
        for part in trimmed.split('.') {
            if part.is_empty() {
                return Err(format!("empty segment in path '{trimmed}'"));
            }
            let mut rest = part;
            let key_end = rest.find('[').unwrap_or(rest.len());
            let key = &rest[..key_end];
            if key.is_empty() && segments.is_empty() && key_end == 0 {
                // Leading index like `[0].x` addresses a root array.
            } else if key.is_empty() {
                return Err(format!("missing key before '[' in path '{trimmed}'"));
            } else {
                segments.push(Segment::Key(key.to_string()));
            }
            rest = &rest[key_end..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped
                    .find(']')
                    .ok_or_else(|| format!("unclosed '[' in path '{trimmed}'"))?;
                let index: usize = stripped[..close]
                    .parse()
                    .map_err(|_| format!("invalid index '{}' in path '{trimmed}'", &stripped[..close]))?;
                segments.push(Segment::Index(index));
                rest = &stripped[close + 1..];
            }
            if !rest.is_empty() {
                return Err(format!("unexpected '{rest}' in path '{trimmed}'"));
            }
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Resolve the path against a JSON tree. `None` when any step is
    /// missing or of the wrong shape.
    #[must_use]
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut node = root;
        for segment in &self.segments {
            node = match segment {
                Segment::Key(key) => node.as_object()?.get(key)?,
                Segment::Index(idx) => node.as_array()?.get(*idx)?,
            };
        }
        Some(node)
    }

    /// Write `value` at the path, creating intermediate objects and arrays
    /// as needed. Arrays are padded with nulls up to a written index;
    /// intermediate nodes of the wrong shape are replaced.
    pub fn set(&self, root: &mut Value, value: Value) {
        let mut node = root;
        for (i, segment) in self.segments.iter().enumerate() {
            let last = i == self.segments.len() - 1;
            match segment {
                Segment::Key(key) => {
                    if !node.is_object() {
                        *node = Value::Object(serde_json::Map::new());
                    }
                    let map = node.as_object_mut().expect("object ensured above");
                    if last {
                        map.insert(key.clone(), value);
                        return;
                    }
                    node = map.entry(key.clone()).or_insert(Value::Null);
                }
                Segment::Index(idx) => {
                    if !node.is_array() {
                        *node = Value::Array(Vec::new());
                    }
                    let arr = node.as_array_mut().expect("array ensured above");
                    while arr.len() <= *idx {
                        arr.push(Value::Null);
                    }
                    if last {
                        arr[*idx] = value;
                        return;
                    }
                    node = &mut arr[*idx];
                }
            }
        }
        // Empty segment list cannot be parsed, so the loop always returns.
        unreachable!("JsonPath has at least one segment");
    }

    /// Delete the node at the path. Returns `false` (no-op) when the path
    /// does not resolve.
    pub fn remove(&self, root: &mut Value) -> bool {
        let (last, parents) = match self.segments.split_last() {
            Some(split) => split,
            None => return false,
        };

        let mut node = root;
        for segment in parents {
            node = match segment {
                Segment::Key(key) => match node.as_object_mut().and_then(|m| m.get_mut(key)) {
                    Some(child) => child,
                    None => return false,
                },
                Segment::Index(idx) => match node.as_array_mut().and_then(|a| a.get_mut(*idx)) {
                    Some(child) => child,
                    None => return false,
                },
            };
        }

        match last {
            Segment::Key(key) => node
                .as_object_mut()
                .is_some_and(|m| m.remove(key).is_some()),
            Segment::Index(idx) => match node.as_array_mut() {
                Some(arr) if *idx < arr.len() => {
                    arr.remove(*idx);
                    true
                }
                _ => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_simple_key() {
        let p = JsonPath::parse("model").unwrap();
        assert_eq!(p.segments, vec![Segment::Key("model".into())]);
    }

    #[test]
    fn parse_nested_with_indices() {
        let p = JsonPath::parse("messages[0].content").unwrap();
        assert_eq!(
            p.segments,
            vec![
                Segment::Key("messages".into()),
                Segment::Index(0),
                Segment::Key("content".into()),
            ]
        );
    }

    #[test]
    fn parse_chained_indices() {
        let p = JsonPath::parse("grid[1][2]").unwrap();
        assert_eq!(
            p.segments,
            vec![
                Segment::Key("grid".into()),
                Segment::Index(1),
                Segment::Index(2),
            ]
        );
    }

    #[test]
    fn parse_rejects_bad_syntax() {
        for raw in ["", ".", "a..b", "a[", "a[x]", "a[1", "a[1]b"] {
            assert!(JsonPath::parse(raw).is_err(), "should reject '{raw}'");
        }
    }

    #[test]
    fn resolve_hits_and_misses() {
        let body = json!({"messages": [{"role": "user"}], "n": 1});
        assert_eq!(
            JsonPath::parse("messages[0].role")
                .unwrap()
                .resolve(&body),
            Some(&json!("user"))
        );
        assert!(JsonPath::parse("messages[1]").unwrap().resolve(&body).is_none());
        assert!(JsonPath::parse("missing").unwrap().resolve(&body).is_none());
        assert!(JsonPath::parse("n[0]").unwrap().resolve(&body).is_none());
    }

    #[test]
    fn set_overwrites_existing() {
        let mut body = json!({"model": "gpt-3.5"});
        JsonPath::parse("model").unwrap().set(&mut body, json!("gpt-4"));
        assert_eq!(body, json!({"model": "gpt-4"}));
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut body = json!({});
        JsonPath::parse("options.sampling.top_p")
            .unwrap()
            .set(&mut body, json!(0.9));
        assert_eq!(body, json!({"options": {"sampling": {"top_p": 0.9}}}));
    }

    #[test]
    fn set_pads_arrays_with_null() {
        let mut body = json!({});
        JsonPath::parse("stop[2]").unwrap().set(&mut body, json!("END"));
        assert_eq!(body, json!({"stop": [null, null, "END"]}));
    }

    #[test]
    fn set_replaces_wrong_shape() {
        let mut body = json!({"options": 3});
        JsonPath::parse("options.seed").unwrap().set(&mut body, json!(7));
        assert_eq!(body, json!({"options": {"seed": 7}}));
    }

    #[test]
    fn remove_existing_and_missing() {
        let mut body = json!({"frequency_penalty": 0.5, "model": "x"});
        assert!(JsonPath::parse("frequency_penalty").unwrap().remove(&mut body));
        assert_eq!(body, json!({"model": "x"}));
        assert!(!JsonPath::parse("frequency_penalty").unwrap().remove(&mut body));
    }

    #[test]
    fn remove_array_element_shifts() {
        let mut body = json!({"stop": ["a", "b", "c"]});
        assert!(JsonPath::parse("stop[1]").unwrap().remove(&mut body));
        assert_eq!(body, json!({"stop": ["a", "c"]}));
    }
}
