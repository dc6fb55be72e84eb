//! Metadata describing a file or directory.
//!
//! Directories appear in a parent's `children` under their name with a
//! trailing `/`; files appear under their bare name.  `children` is only
//! populated for directory listings and only down to the requested depth,
//! so an empty map means either "file" or "not expanded".

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One node of the namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Byte length for files, 0 for directories.
    #[serde(default)]
    pub size: u64,

    /// Child name -> child item.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, Item>,
}

impl Item {
    pub fn file(size: u64) -> Self {
        Item {
            size,
            children: BTreeMap::new(),
        }
    }

    pub fn dir() -> Self {
        Item::default()
    }

    pub fn with_children(children: BTreeMap<String, Item>) -> Self {
        Item { size: 0, children }
    }
}

/// Whether a request path addresses a directory.
pub fn is_dir_path(path: &str) -> bool {
    path.ends_with('/')
}

/// Child key for a directory entry.
pub fn dir_key(name: &str) -> String {
    format!("{name}/")
}

/// Split a path into its parent directory (with trailing `/`) and the final
/// component (without any trailing `/`).
///
/// `"/a/b.txt"` -> `("/a/", "b.txt")`, `"/a/b/"` -> `("/a/", "b")`,
/// `"/"` -> `("/", "")`.
pub fn split_parent(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => (
            trimmed[..=idx].to_string(),
            trimmed[idx + 1..].to_string(),
        ),
        None if trimmed.is_empty() => ("/".to_string(), String::new()),
        None => ("/".to_string(), trimmed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_serializes_without_children() {
        let json = serde_json::to_string(&Item::file(12)).unwrap();
        assert_eq!(json, r#"{"size":12}"#);
    }

    #[test]
    fn test_dir_serializes_children() {
        let mut children = BTreeMap::new();
        children.insert("a.txt".to_string(), Item::file(3));
        children.insert("sub/".to_string(), Item::dir());
        let json = serde_json::to_string(&Item::with_children(children)).unwrap();
        assert_eq!(
            json,
            r#"{"size":0,"children":{"a.txt":{"size":3},"sub/":{"size":0}}}"#
        );
    }

    #[test]
    fn test_deserialize_missing_children() {
        let item: Item = serde_json::from_str(r#"{"size":5}"#).unwrap();
        assert_eq!(item, Item::file(5));
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(
            split_parent("/a/b.txt"),
            ("/a/".to_string(), "b.txt".to_string())
        );
        assert_eq!(split_parent("/a/b/"), ("/a/".to_string(), "b".to_string()));
        assert_eq!(split_parent("/top"), ("/".to_string(), "top".to_string()));
        assert_eq!(split_parent("/"), ("/".to_string(), String::new()));
    }

    #[test]
    fn test_is_dir_path() {
        assert!(is_dir_path("/a/"));
        assert!(!is_dir_path("/a"));
    }
}
