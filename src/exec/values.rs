use std::collections::HashMap;

use serde_json::Value;

/// Key to string lookup consulted by the `request("key")` template function.
/// Unknown keys resolve to an empty string.
pub trait TemplateValues: Send + Sync {
    fn get(&self, key: &str) -> String;
}

/// Submitted form fields.
#[derive(Debug, Clone, Default)]
pub struct FormValues(HashMap<String, String>);

impl From<HashMap<String, String>> for FormValues {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

impl TemplateValues for FormValues {
    fn get(&self, key: &str) -> String {
        self.0.get(key).cloned().unwrap_or_default()
    }
}

impl TemplateValues for HashMap<String, String> {
    fn get(&self, key: &str) -> String {
        HashMap::get(self, key).cloned().unwrap_or_default()
    }
}

/// A JSON document addressed by paths such as `$.repository.name`,
/// `$.commits[0].id` or `$.commits[:].id`.
#[derive(Debug, Clone)]
pub struct JsonValues(Value);

#[derive(Debug, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
    All,
}

impl JsonValues {
    pub fn new(document: Value) -> Self {
        Self(document)
    }

    /// Every value the path selects. A malformed path selects nothing.
    pub fn lookup(&self, path: &str) -> Vec<&Value> {
        let Some(segments) = parse_path(path) else {
            return Vec::new();
        };
        let mut current = vec![&self.0];
        for segment in &segments {
            current = current
                .into_iter()
                .flat_map(|value| select(value, segment))
                .collect();
        }
        current
    }

    /// Selected values that are strings, e.g. commit ids.
    pub fn strings(&self, path: &str) -> Vec<String> {
        self.lookup(path)
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect()
    }
}

impl TemplateValues for JsonValues {
    fn get(&self, key: &str) -> String {
        match self.lookup(key).as_slice() {
            [] => String::new(),
            [one] => render(one),
            many => Value::Array(many.iter().map(|v| (*v).clone()).collect()).to_string(),
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn select<'a>(value: &'a Value, segment: &Segment) -> Vec<&'a Value> {
    match segment {
        Segment::Key(key) => value.get(key.as_str()).into_iter().collect(),
        Segment::Index(ix) => value.get(*ix).into_iter().collect(),
        Segment::All => match value {
            Value::Array(items) => items.iter().collect(),
            Value::Object(map) => map.values().collect(),
            _ => Vec::new(),
        },
    }
}

fn parse_path(path: &str) -> Option<Vec<Segment>> {
    let path = path.trim();
    let rest = path.strip_prefix('$').unwrap_or(path);
    let normalized = if rest.is_empty() || rest.starts_with(['.', '[']) {
        rest.to_owned()
    } else {
        format!(".{rest}")
    };

    let mut segments = Vec::new();
    let mut chars = normalized.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let mut key = String::new();
                while let Some(&next) = chars.peek() {
                    if next == '.' || next == '[' {
                        break;
                    }
                    key.push(next);
                    chars.next();
                }
                match key.as_str() {
                    "" => return None,
                    "*" => segments.push(Segment::All),
                    _ => segments.push(Segment::Key(key)),
                }
            }
            '[' => {
                let mut inner = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(ch) => inner.push(ch),
                        None => return None,
                    }
                }
                let inner = inner.trim();
                let segment = match inner {
                    ":" | "*" => Segment::All,
                    _ => match inner.parse() {
                        Ok(ix) => Segment::Index(ix),
                        Err(_) => Segment::Key(inner.trim_matches(['\'', '"']).to_owned()),
                    },
                };
                segments.push(segment);
            }
            _ => return None,
        }
    }
    Some(segments)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn push_payload() -> JsonValues {
        JsonValues::new(json!({
            "ref": "refs/heads/production",
            "repository": { "name": "control-repo", "private": true },
            "commits": [
                { "id": "abc123", "message": "first" },
                { "id": "def456", "message": "second" }
            ]
        }))
    }

    #[test]
    fn nested_key_renders_raw_string() {
        assert_eq!(push_payload().get("$.repository.name"), "control-repo");
    }

    #[test]
    fn wildcard_collects_all_commit_ids() {
        assert_eq!(push_payload().strings("$.commits[:].id"), vec!["abc123", "def456"]);
    }

    #[test]
    fn index_selects_single_element() {
        assert_eq!(push_payload().get("$.commits[1].message"), "second");
    }

    #[test]
    fn non_string_values_render_as_json() {
        assert_eq!(push_payload().get("$.repository.private"), "true");
        assert_eq!(push_payload().get("$.commits[*].id"), r#"["abc123","def456"]"#);
    }

    #[test]
    fn missing_or_malformed_paths_are_empty() {
        let values = push_payload();
        assert_eq!(values.get("$.nope"), "");
        assert_eq!(values.get("$.commits[0"), "");
        assert!(values.strings("$..id").is_empty());
    }

    #[test]
    fn bare_key_without_dollar() {
        assert_eq!(push_payload().get("ref"), "refs/heads/production");
    }

    #[test]
    fn form_values_default_to_empty() {
        let mut map = HashMap::new();
        map.insert("hostname".to_owned(), "web01".to_owned());
        let values = FormValues::from(map);
        assert_eq!(values.get("hostname"), "web01");
        assert_eq!(values.get("environment"), "");
    }
}
