//! Format-neutral document tree

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One node of a configuration document
///
/// Sequences keep their order. Maps are unordered in meaning and always
/// serialize sorted, so the same tree renders to the same bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Null,
    Bool(bool),
    Integer(i64),
    /// Integers above `i64::MAX`
    UInteger(u64),
    Float(f64),
    String(String),
    Seq(Vec<Node>),
    Map(BTreeMap<String, Node>),
}

impl Node {
    /// Build a map node from key/value pairs
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Node)>,
    {
        Node::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, Node::Seq(_) | Node::Map(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Node::Null => "null",
            Node::Bool(_) => "bool",
            Node::Integer(_) | Node::UInteger(_) => "integer",
            Node::Float(_) => "float",
            Node::String(_) => "string",
            Node::Seq(_) => "sequence",
            Node::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Node>> {
        match self {
            Node::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for Node {
    fn from(s: &str) -> Self {
        Node::String(s.to_string())
    }
}

impl From<String> for Node {
    fn from(s: String) -> Self {
        Node::String(s)
    }
}

impl From<bool> for Node {
    fn from(b: bool) -> Self {
        Node::Bool(b)
    }
}

impl From<i64> for Node {
    fn from(i: i64) -> Self {
        Node::Integer(i)
    }
}

impl From<u64> for Node {
    fn from(u: u64) -> Self {
        i64::try_from(u).map_or(Node::UInteger(u), Node::Integer)
    }
}

impl From<f64> for Node {
    fn from(f: f64) -> Self {
        Node::Float(f)
    }
}

impl From<serde_json::Value> for Node {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Node::Null,
            Value::Bool(b) => Node::Bool(b),
            Value::Number(n) => number_node(n.as_i64(), n.as_u64(), n.as_f64()),
            Value::String(s) => Node::String(s),
            Value::Array(items) => Node::Seq(items.into_iter().map(Node::from).collect()),
            Value::Object(map) => Node::Map(map.into_iter().map(|(k, v)| (k, Node::from(v))).collect()),
        }
    }
}

impl From<serde_yaml::Value> for Node {
    fn from(value: serde_yaml::Value) -> Self {
        use serde_yaml::Value;
        match value {
            Value::Null => Node::Null,
            Value::Bool(b) => Node::Bool(b),
            Value::Number(n) => number_node(n.as_i64(), n.as_u64(), n.as_f64()),
            Value::String(s) => Node::String(s),
            Value::Sequence(items) => Node::Seq(items.into_iter().map(Node::from).collect()),
            Value::Mapping(map) => Node::Map(
                map.into_iter()
                    .map(|(k, v)| (yaml_key(k), Node::from(v)))
                    .collect(),
            ),
            // Tags carry no meaning for the consumers of these files
            Value::Tagged(tagged) => Node::from(tagged.value),
        }
    }
}

fn number_node(int: Option<i64>, uint: Option<u64>, float: Option<f64>) -> Node {
    match (int, uint, float) {
        (Some(i), _, _) => Node::Integer(i),
        (None, Some(u), _) => Node::UInteger(u),
        (None, None, Some(f)) => Node::Float(f),
        (None, None, None) => Node::Null,
    }
}

/// Map keys become strings; YAML allows any scalar (or worse) as a key
fn yaml_key(key: serde_yaml::Value) -> String {
    use serde_yaml::Value;
    match key {
        Value::String(s) => s,
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_string(),
        Value::Tagged(tagged) => yaml_key(tagged.value),
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_numbers_keep_integer_kind() {
        let v: serde_json::Value = serde_json::from_str(r#"{"a": 1, "b": 1.5, "c": [true, null]}"#).unwrap();
        let node = Node::from(v);
        let map = node.as_map().unwrap();
        assert_eq!(map["a"], Node::Integer(1));
        assert_eq!(map["b"], Node::Float(1.5));
        assert_eq!(map["c"], Node::Seq(vec![Node::Bool(true), Node::Null]));
    }

    #[test]
    fn test_large_unsigned_integers_survive_a_round_trip() {
        let json: serde_json::Value = serde_json::from_str(r#"{"max": 18446744073709551615}"#).unwrap();
        let node = Node::from(json);
        assert_eq!(node.as_map().unwrap()["max"], Node::UInteger(u64::MAX));
        assert_eq!(serde_json::to_string(&node).unwrap(), r#"{"max":18446744073709551615}"#);

        let yaml: serde_yaml::Value = serde_yaml::from_str("max: 18446744073709551615\n").unwrap();
        let node = Node::from(yaml);
        assert_eq!(serde_yaml::to_string(&node).unwrap(), "max: 18446744073709551615\n");

        assert_eq!(Node::from(7u64), Node::Integer(7));
    }

    #[test]
    fn test_yaml_scalar_keys_are_stringified() {
        let v: serde_yaml::Value = serde_yaml::from_str("1: one\ntrue: yes\nname: !custom value\n").unwrap();
        let node = Node::from(v);
        let map = node.as_map().unwrap();
        assert_eq!(map["1"], Node::from("one"));
        assert_eq!(map["true"], Node::from("yes"));
        assert_eq!(map["name"], Node::from("value"));
    }

    #[test]
    fn test_untagged_deserialize_from_toml() {
        #[derive(Deserialize)]
        struct Holder {
            value: Node,
        }
        let h: Holder = toml::from_str("value = { driver = \"sqlite\", port = 5 }").unwrap();
        assert_eq!(
            h.value,
            Node::map([("driver", Node::from("sqlite")), ("port", Node::Integer(5))])
        );
    }
}
