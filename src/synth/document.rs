//! Loading, rendering and atomically writing configuration documents

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tempfile::NamedTempFile;

use crate::common::{Error, Result};

use super::{KeyPath, Mutation, Node};

/// On-disk format of a document, chosen by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl DocumentFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(DocumentFormat::Json),
            Some("yml") | Some("yaml") => Ok(DocumentFormat::Yaml),
            other => Err(Error::config_format(
                path,
                format!("unsupported extension {other:?}; expected .json, .yml or .yaml"),
            )),
        }
    }
}

/// A configuration document held in memory
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    root: Node,
    format: DocumentFormat,
}

impl ConfigDocument {
    pub fn new(root: Node, format: DocumentFormat) -> Self {
        Self { root, format }
    }

    /// Read and parse a template in its native format
    pub fn load(path: &Path) -> Result<Self> {
        let format = DocumentFormat::from_path(path)?;
        let text = std::fs::read_to_string(path).map_err(|e| Error::config_io(path, e))?;
        let doc = Self::parse_at(&text, format, path)?;
        tracing::debug!(path = %path.display(), ?format, "loaded config document");
        Ok(doc)
    }

    /// Parse in-memory text
    pub fn parse(text: &str, format: DocumentFormat) -> Result<Self> {
        Self::parse_at(text, format, Path::new("<inline>"))
    }

    fn parse_at(text: &str, format: DocumentFormat, origin: &Path) -> Result<Self> {
        let root = match format {
            DocumentFormat::Json => serde_json::from_str::<serde_json::Value>(text)
                .map(Node::from)
                .map_err(|e| Error::config_format(origin, e))?,
            DocumentFormat::Yaml => serde_yaml::from_str::<serde_yaml::Value>(text)
                .map(Node::from)
                .map_err(|e| Error::config_format(origin, e))?,
        };
        Ok(Self { root, format })
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn format(&self) -> DocumentFormat {
        self.format
    }

    /// Render in a different format from the one it was loaded in
    pub fn set_format(&mut self, format: DocumentFormat) {
        self.format = format;
    }

    /// Look up a node by key path
    pub fn get(&self, path: &KeyPath) -> Option<&Node> {
        path.segments()
            .iter()
            .try_fold(&self.root, |node, key| node.as_map()?.get(key))
    }

    /// Apply mutations in order; stops at the first that fails
    pub fn apply(&mut self, mutations: &[Mutation]) -> Result<()> {
        for mutation in mutations {
            mutation.apply_to(&mut self.root)?;
        }
        Ok(())
    }

    pub fn render(&self) -> Result<String> {
        match self.format {
            DocumentFormat::Json => {
                let mut text = serde_json::to_string_pretty(&self.root)?;
                text.push('\n');
                Ok(text)
            }
            DocumentFormat::Yaml => Ok(serde_yaml::to_string(&self.root)?),
        }
    }

    /// Write via a temp file in the target directory, then rename over it
    ///
    /// Readers see either the old file or the complete new one.
    pub fn write(&self, path: &Path) -> Result<()> {
        let rendered = self.render()?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| Error::config_io(path, e))?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::config_io(path, e))?;
        tmp.write_all(rendered.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| Error::config_io(path, e))?;
        // Temp files are created 0600; keep the mode of the file being replaced
        if let Ok(meta) = std::fs::metadata(path) {
            let _ = tmp.as_file().set_permissions(meta.permissions());
        }
        tmp.persist(path).map_err(|e| Error::config_io(path, e.error))?;

        tracing::info!(path = %path.display(), bytes = rendered.len(), "wrote config document");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mountpoint_mutations() -> Vec<Mutation> {
        vec![
            Mutation::ensure_path("services.mountpoint.mountpoints"),
            Mutation::merge_map(
                "services.mountpoint.mountpoints",
                [
                    ("/", Node::map([("mounter", Node::from("puterfs"))])),
                    ("/admin/tmp", Node::map([("mounter", Node::from("memoryfs"))])),
                ],
            ),
        ]
    }

    #[test]
    fn test_mountpoint_merge_into_empty_services() {
        let mut doc = ConfigDocument::parse(r#"{"services": {}}"#, DocumentFormat::Json).unwrap();
        doc.apply(&[Mutation::merge_map(
            "services.mountpoint.mountpoints",
            [("/", Node::map([("mounter", Node::from("puterfs"))]))],
        )])
        .unwrap();

        let expected: serde_json::Value = serde_json::from_str(
            r#"{"services": {"mountpoint": {"mountpoints": {"/": {"mounter": "puterfs"}}}}}"#,
        )
        .unwrap();
        let actual: serde_json::Value = serde_json::from_str(&doc.render().unwrap()).unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_reapplying_json_mutations_is_byte_identical() {
        let base = r#"{"services": {"web": {"port": 4100}}, "debug": false}"#;
        let mut once = ConfigDocument::parse(base, DocumentFormat::Json).unwrap();
        once.apply(&mountpoint_mutations()).unwrap();
        let first = once.render().unwrap();

        once.apply(&mountpoint_mutations()).unwrap();
        assert_eq!(once.render().unwrap(), first);

        // Same base, fresh parse: same bytes
        let mut again = ConfigDocument::parse(base, DocumentFormat::Json).unwrap();
        again.apply(&mountpoint_mutations()).unwrap();
        assert_eq!(again.render().unwrap(), first);
        assert!(first.ends_with("}\n"));
        assert!(first.contains("\n  \"debug\": false"));
    }

    #[test]
    fn test_reapplying_yaml_mutations_is_byte_identical() {
        let template = "url: http://localhost:4100\nsuites:\n  - fs\n  - auth\n  - share\n";
        let mutations = vec![
            Mutation::set_scalar("auth_token", "tok-xyz"),
            Mutation::set_scalar("url", "http://api.puter.localhost:4100"),
        ];
        let mut doc = ConfigDocument::parse(template, DocumentFormat::Yaml).unwrap();
        doc.apply(&mutations).unwrap();
        let first = doc.render().unwrap();
        doc.apply(&mutations).unwrap();
        assert_eq!(doc.render().unwrap(), first);

        // Sequence order survives the round trip
        let reparsed = ConfigDocument::parse(&first, DocumentFormat::Yaml).unwrap();
        assert_eq!(
            reparsed.get(&KeyPath::parse("suites")),
            Some(&Node::Seq(vec!["fs".into(), "auth".into(), "share".into()]))
        );
        assert_eq!(
            reparsed.get(&KeyPath::parse("auth_token")).and_then(Node::as_str),
            Some("tok-xyz")
        );
    }

    #[test]
    fn test_malformed_and_missing_documents() {
        let err = ConfigDocument::parse("{not json", DocumentFormat::Json).unwrap_err();
        assert!(matches!(err, Error::ConfigFormat { .. }));

        let dir = tempfile::tempdir().unwrap();
        let err = ConfigDocument::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, Error::ConfigIo { .. }));
        let err = ConfigDocument::load(&dir.path().join("config.ini")).unwrap_err();
        assert!(matches!(err, Error::ConfigFormat { .. }));
    }

    #[test]
    fn test_write_replaces_file_and_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("volatile/config/config.json");
        let mut doc = ConfigDocument::parse("{}", DocumentFormat::Json).unwrap();
        doc.apply(&[Mutation::set_scalar("a", 1i64)]).unwrap();
        doc.write(&target).unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "{\n  \"a\": 1\n}\n");

        doc.apply(&[Mutation::set_scalar("a", 2i64)]).unwrap();
        doc.write(&target).unwrap();
        let loaded = ConfigDocument::load(&target).unwrap();
        assert_eq!(loaded.get(&KeyPath::parse("a")), Some(&Node::Integer(2)));

        // No temp files left behind
        let entries = std::fs::read_dir(target.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
