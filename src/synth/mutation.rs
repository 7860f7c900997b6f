//! Declarative document mutations

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};

use super::Node;

/// Path of map keys from the document root, written `a.b.c`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeyPath(segments.into_iter().map(Into::into).collect())
    }

    /// Split a dotted path; empty segments are dropped
    pub fn parse(dotted: &str) -> Self {
        KeyPath(
            dotted
                .split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// This path extended by one key
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        KeyPath(segments)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("(root)")
        } else {
            f.write_str(&self.0.join("."))
        }
    }
}

impl From<&str> for KeyPath {
    fn from(dotted: &str) -> Self {
        KeyPath::parse(dotted)
    }
}

impl From<String> for KeyPath {
    fn from(dotted: String) -> Self {
        KeyPath::parse(&dotted)
    }
}

impl From<KeyPath> for String {
    fn from(path: KeyPath) -> Self {
        path.0.join(".")
    }
}

/// One edit to a document
///
/// Each mutation only ever assigns, never appends, so applying it again to
/// its own output changes nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Set a scalar leaf, creating parent maps as needed
    SetScalar { path: KeyPath, value: Node },
    /// Insert or overwrite entries of the map at `path`
    MergeMap {
        path: KeyPath,
        entries: BTreeMap<String, Node>,
    },
    /// Make sure a map exists at `path`
    EnsurePath { path: KeyPath },
}

impl Mutation {
    pub fn set_scalar(path: impl Into<KeyPath>, value: impl Into<Node>) -> Self {
        Mutation::SetScalar {
            path: path.into(),
            value: value.into(),
        }
    }

    pub fn merge_map<K, I>(path: impl Into<KeyPath>, entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Node)>,
    {
        Mutation::MergeMap {
            path: path.into(),
            entries: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn ensure_path(path: impl Into<KeyPath>) -> Self {
        Mutation::EnsurePath { path: path.into() }
    }

    pub fn path(&self) -> &KeyPath {
        match self {
            Mutation::SetScalar { path, .. }
            | Mutation::MergeMap { path, .. }
            | Mutation::EnsurePath { path } => path,
        }
    }

    /// Apply to `root` in place
    pub fn apply_to(&self, root: &mut Node) -> Result<()> {
        match self {
            Mutation::SetScalar { path, value } => {
                let Some((leaf, parents)) = path.segments().split_last() else {
                    return Err(Error::config_mutation(path, "cannot replace the document root"));
                };
                if !value.is_scalar() {
                    return Err(Error::config_mutation(
                        path,
                        format!("set_scalar needs a scalar, got a {}", value.kind()),
                    ));
                }
                map_at(root, parents)?.insert(leaf.clone(), value.clone());
            }
            Mutation::MergeMap { path, entries } => {
                let map = map_at(root, path.segments())?;
                for (key, value) in entries {
                    map.insert(key.clone(), value.clone());
                }
            }
            Mutation::EnsurePath { path } => {
                map_at(root, path.segments())?;
            }
        }
        Ok(())
    }
}

/// Walk to the map at `path`, turning absent or null nodes into empty maps
fn map_at<'a>(root: &'a mut Node, path: &[String]) -> Result<&'a mut BTreeMap<String, Node>> {
    let mut current = root;
    for (depth, segment) in path.iter().enumerate() {
        let map = as_map_mut(current, &path[..depth])?;
        current = map.entry(segment.clone()).or_insert(Node::Null);
    }
    as_map_mut(current, path)
}

fn as_map_mut<'a>(node: &'a mut Node, at: &[String]) -> Result<&'a mut BTreeMap<String, Node>> {
    if matches!(node, Node::Null) {
        *node = Node::Map(BTreeMap::new());
    }
    match node {
        Node::Map(map) => Ok(map),
        other => Err(Error::config_mutation(
            KeyPath::new(at.iter().cloned()),
            format!("expected a map, found a {}", other.kind()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_path_parses_dots() {
        let p = KeyPath::parse("services.mountpoint.mountpoints");
        assert_eq!(p.segments(), ["services", "mountpoint", "mountpoints"]);
        assert_eq!(p.to_string(), "services.mountpoint.mountpoints");
        assert!(KeyPath::parse("").is_empty());
        assert_eq!(p.child("x").segments().len(), 4);
    }

    #[test]
    fn test_set_scalar_rejects_containers_and_root() {
        let mut root = Node::map::<&str, _>([]);
        let err = Mutation::set_scalar("a", Node::Seq(vec![]))
            .apply_to(&mut root)
            .unwrap_err();
        assert_eq!(err.code(), "CONFIG_IO_FAILURE");
        assert!(Mutation::set_scalar("", "x").apply_to(&mut root).is_err());
    }

    #[test]
    fn test_non_map_intermediate_is_an_error() {
        let mut root = Node::map([("services", Node::from("oops"))]);
        let err = Mutation::ensure_path("services.mountpoint")
            .apply_to(&mut root)
            .unwrap_err();
        assert!(err.to_string().contains("services"), "{err}");
        assert!(err.to_string().contains("string"), "{err}");
    }

    #[test]
    fn test_null_intermediate_becomes_map() {
        let mut root = Node::map([("services", Node::Null)]);
        Mutation::set_scalar("services.db.enabled", true)
            .apply_to(&mut root)
            .unwrap();
        let services = root.as_map().unwrap()["services"].as_map().unwrap();
        assert_eq!(services["db"], Node::map([("enabled", Node::Bool(true))]));
    }

    #[test]
    fn test_merge_overwrites_same_keys_only() {
        let mut root = Node::map([(
            "m",
            Node::map([("keep", Node::from(1i64)), ("swap", Node::from("old"))]),
        )]);
        Mutation::merge_map("m", [("swap", Node::from("new")), ("add", Node::Bool(false))])
            .apply_to(&mut root)
            .unwrap();
        let m = root.as_map().unwrap()["m"].as_map().unwrap();
        assert_eq!(m["keep"], Node::Integer(1));
        assert_eq!(m["swap"], Node::from("new"));
        assert_eq!(m["add"], Node::Bool(false));
    }

    #[test]
    fn test_mutations_deserialize_from_toml() {
        #[derive(Deserialize)]
        struct Holder {
            mutations: Vec<Mutation>,
        }
        let h: Holder = toml::from_str(
            r#"
            [[mutations]]
            op = "set_scalar"
            path = "services.web.port"
            value = 8080

            [[mutations]]
            op = "merge_map"
            path = "services.mountpoint.mountpoints"
            entries = { "/data" = { mounter = "memoryfs" } }

            [[mutations]]
            op = "ensure_path"
            path = "services.cache"
            "#,
        )
        .unwrap();
        assert_eq!(h.mutations[0], Mutation::set_scalar("services.web.port", 8080i64));
        assert_eq!(
            h.mutations[1],
            Mutation::merge_map(
                "services.mountpoint.mountpoints",
                [("/data", Node::map([("mounter", Node::from("memoryfs"))]))]
            )
        );
        assert_eq!(h.mutations[2], Mutation::ensure_path("services.cache"));
    }
}
