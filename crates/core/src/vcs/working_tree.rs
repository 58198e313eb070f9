//! Read and write locale resource files inside a repository checkout.
//!
//! A checkout holds one directory per locale code. Every resource is a JSON
//! object mapping keys to a string, or to an array of plural forms, found
//! at the same relative path under each locale directory:
//!
//! ```text
//! <checkout>/en-US/app/main.json   source strings
//! <checkout>/fr/app/main.json      French translations
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::VcsError;

/// A value stored under one key of a resource file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VcsValue {
    Single(String),
    Plural(Vec<String>),
}

impl VcsValue {
    /// Each string paired with its plural form index, `None` for a single
    /// string.
    pub fn forms(&self) -> Vec<(Option<i64>, &str)> {
        match self {
            Self::Single(s) => vec![(None, s.as_str())],
            Self::Plural(forms) => forms
                .iter()
                .enumerate()
                .map(|(i, s)| (Some(i as i64), s.as_str()))
                .collect(),
        }
    }
}

/// A pending change to one key of a locale file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcsEdit {
    Set(VcsValue),
    Remove,
}

/// One parsed resource file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsResource {
    /// Path relative to the locale directory, `/`-separated.
    pub path: String,
    pub entries: BTreeMap<String, VcsValue>,
    /// Modification time of the file.
    pub last_modified: DateTime<Utc>,
}

/// Access to the locale directories of one checkout.
#[derive(Debug, Clone)]
pub struct VcsProject {
    root: PathBuf,
    source_dir: String,
}

impl VcsProject {
    pub fn new(root: impl Into<PathBuf>, source_dir: &str) -> Self {
        Self {
            root: root.into(),
            source_dir: source_dir.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resources of the source locale, keyed by path.
    pub fn source_resources(&self) -> Result<BTreeMap<String, VcsResource>, VcsError> {
        self.read_dir(&self.source_dir)
    }

    /// Resources of locale `code`, keyed by path. A missing locale directory
    /// yields an empty map.
    pub fn load_locale(&self, code: &str) -> Result<BTreeMap<String, VcsResource>, VcsError> {
        self.read_dir(code)
    }

    /// Apply `edits` to `path` in locale `code`, creating the file if needed.
    /// Returns whether the file content changed.
    pub fn write_resource(
        &self,
        code: &str,
        path: &str,
        edits: &BTreeMap<String, VcsEdit>,
    ) -> Result<bool, VcsError> {
        let file = self.root.join(code).join(path);
        let previous = if file.exists() {
            Some(std::fs::read_to_string(&file)?)
        } else {
            None
        };

        let mut entries: BTreeMap<String, VcsValue> = match &previous {
            Some(raw) => parse_entries(&file, raw)?,
            None => BTreeMap::new(),
        };
        for (key, edit) in edits {
            match edit {
                VcsEdit::Set(value) => {
                    entries.insert(key.clone(), value.clone());
                }
                VcsEdit::Remove => {
                    entries.remove(key);
                }
            }
        }

        let mut rendered = serde_json::to_string_pretty(&entries).map_err(|e| {
            VcsError::ParseError {
                path: file.display().to_string(),
                detail: e.to_string(),
            }
        })?;
        rendered.push('\n');

        if previous.as_deref() == Some(rendered.as_str()) {
            return Ok(false);
        }
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&file, rendered)?;
        debug!(locale = code, path, keys = edits.len(), "wrote resource file");
        Ok(true)
    }

    fn read_dir(&self, code: &str) -> Result<BTreeMap<String, VcsResource>, VcsError> {
        let base = self.root.join(code);
        let mut resources = BTreeMap::new();
        if !base.is_dir() {
            return Ok(resources);
        }

        let mut pending = vec![base.clone()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let resource = read_resource(&base, &path)?;
                resources.insert(resource.path.clone(), resource);
            }
        }
        debug!(locale = code, count = resources.len(), "loaded resources");
        Ok(resources)
    }
}

fn read_resource(base: &Path, file: &Path) -> Result<VcsResource, VcsError> {
    let raw = std::fs::read_to_string(file)?;
    let entries = parse_entries(file, &raw)?;
    let modified: DateTime<Utc> = std::fs::metadata(file)?.modified()?.into();
    let relative = file.strip_prefix(base).unwrap_or(file);
    let path = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    Ok(VcsResource {
        path,
        entries,
        last_modified: modified,
    })
}

fn parse_entries(file: &Path, raw: &str) -> Result<BTreeMap<String, VcsValue>, VcsError> {
    serde_json::from_str(raw).map_err(|e| VcsError::ParseError {
        path: file.display().to_string(),
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn test_load_nested_resources() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "en-US/app/main.json", r#"{"title": "Title", "items": ["item", "items"]}"#);
        write(dir.path(), "en-US/README.md", "ignored");
        write(dir.path(), "fr/app/main.json", r#"{"title": "Titre"}"#);

        let tree = VcsProject::new(dir.path(), "en-US");
        let source = tree.source_resources().unwrap();
        assert_eq!(source.keys().collect::<Vec<_>>(), vec!["app/main.json"]);
        let main = &source["app/main.json"];
        assert_eq!(main.entries["title"], VcsValue::Single("Title".into()));
        assert_eq!(
            main.entries["items"].forms(),
            vec![(Some(0), "item"), (Some(1), "items")]
        );

        let fr = tree.load_locale("fr").unwrap();
        assert_eq!(fr["app/main.json"].entries.len(), 1);
        assert!(tree.load_locale("de").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_json_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "en-US/broken.json", "{not json");
        let tree = VcsProject::new(dir.path(), "en-US");
        assert!(matches!(
            tree.source_resources(),
            Err(VcsError::ParseError { .. })
        ));
    }

    #[test]
    fn test_write_resource_merges_edits() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "fr/main.json", r#"{"b": "B", "old": "x"}"#);
        let tree = VcsProject::new(dir.path(), "en-US");

        let edits = BTreeMap::from([
            ("a".to_string(), VcsEdit::Set(VcsValue::Single("A".into()))),
            ("old".to_string(), VcsEdit::Remove),
        ]);
        assert!(tree.write_resource("fr", "main.json", &edits).unwrap());

        let written = std::fs::read_to_string(dir.path().join("fr/main.json")).unwrap();
        assert_eq!(written, "{\n  \"a\": \"A\",\n  \"b\": \"B\"\n}\n");

        // Same edits again leave the file alone.
        assert!(!tree.write_resource("fr", "main.json", &edits).unwrap());
    }

    #[test]
    fn test_write_resource_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let tree = VcsProject::new(dir.path(), "en-US");
        let edits = BTreeMap::from([(
            "items".to_string(),
            VcsEdit::Set(VcsValue::Plural(vec!["un".into(), "des".into()])),
        )]);
        assert!(tree.write_resource("fr", "app/list.json", &edits).unwrap());

        let fr = tree.load_locale("fr").unwrap();
        assert_eq!(
            fr["app/list.json"].entries["items"],
            VcsValue::Plural(vec!["un".into(), "des".into()])
        );
    }
}
