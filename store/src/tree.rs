//! Change records and the tree fold.
//!
//! An archive's state is the left fold of its change records. Records are
//! validated *before* they are appended, so the fold itself is total: a
//! recorded operation always applies cleanly during replay.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::StoreError;

/// One recorded archive mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Archive version this record produced.
    pub version: u64,
    /// What happened.
    pub op: ChangeOp,
    /// Affected path; absent for `created`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Content blob digest for `write`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
    /// Content size in bytes for `write`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Archive mutation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    /// Archive creation (version 1).
    Created,
    /// File write (create or overwrite).
    Write,
    /// Explicit directory creation.
    Mkdir,
    /// File removal.
    Unlink,
    /// Directory removal, descendants included.
    Rmdir,
}

/// A node in the materialized tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Regular file: blob digest and size.
    File {
        /// Content digest, addressing the blob store.
        blob: String,
        /// Size in bytes.
        size: u64,
    },
    /// Directory.
    Dir,
}

/// Materialized archive tree: normalized absolute path → node.
///
/// The root `/` is implicit and always a directory.
#[derive(Debug, Clone, Default)]
pub struct ArchiveTree {
    nodes: BTreeMap<String, Node>,
}

impl ArchiveTree {
    /// Fold a record sequence into a tree.
    ///
    /// # Errors
    ///
    /// `StoreError::Corrupt` if a record does not apply — recorded history
    /// is validated before append, so this indicates damage.
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a ChangeRecord>,
    ) -> Result<Self, StoreError> {
        let mut tree = Self::default();
        for record in records {
            tree.apply(record)?;
        }
        Ok(tree)
    }

    /// Apply one record.
    ///
    /// # Errors
    ///
    /// `StoreError::Corrupt` when the record shape is inconsistent with
    /// the current tree.
    pub fn apply(&mut self, record: &ChangeRecord) -> Result<(), StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            line: record.version,
            reason,
        };
        match record.op {
            ChangeOp::Created => {}
            ChangeOp::Write => {
                let path = record
                    .path
                    .as_deref()
                    .ok_or_else(|| corrupt("write without path".to_string()))?;
                let blob = record
                    .blob
                    .clone()
                    .ok_or_else(|| corrupt("write without blob".to_string()))?;
                if matches!(self.nodes.get(path), Some(Node::Dir)) {
                    return Err(corrupt(format!("write over directory {path}")));
                }
                self.ensure_parents(path);
                self.nodes.insert(
                    path.to_string(),
                    Node::File {
                        blob,
                        size: record.size.unwrap_or(0),
                    },
                );
            }
            ChangeOp::Mkdir => {
                let path = record
                    .path
                    .as_deref()
                    .ok_or_else(|| corrupt("mkdir without path".to_string()))?;
                if matches!(self.nodes.get(path), Some(Node::File { .. })) {
                    return Err(corrupt(format!("mkdir over file {path}")));
                }
                self.ensure_parents(path);
                self.nodes.insert(path.to_string(), Node::Dir);
            }
            ChangeOp::Unlink => {
                let path = record
                    .path
                    .as_deref()
                    .ok_or_else(|| corrupt("unlink without path".to_string()))?;
                if !matches!(self.nodes.get(path), Some(Node::File { .. })) {
                    return Err(corrupt(format!("unlink of non-file {path}")));
                }
                self.nodes.remove(path);
            }
            ChangeOp::Rmdir => {
                let path = record
                    .path
                    .as_deref()
                    .ok_or_else(|| corrupt("rmdir without path".to_string()))?;
                if !matches!(self.nodes.get(path), Some(Node::Dir)) {
                    return Err(corrupt(format!("rmdir of non-directory {path}")));
                }
                let prefix = format!("{path}/");
                self.nodes
                    .retain(|p, _| p != path && !p.starts_with(&prefix));
            }
        }
        Ok(())
    }

    fn ensure_parents(&mut self, path: &str) {
        let mut prefix = String::new();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            prefix.push('/');
            prefix.push_str(segment);
            self.nodes.entry(prefix.clone()).or_insert(Node::Dir);
        }
    }

    /// Look up a node; `/` answers as the root directory.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&Node> {
        if path == "/" {
            return Some(&Node::Dir);
        }
        self.nodes.get(path)
    }

    /// Immediate children of a directory: `(name, node)` pairs in name
    /// order. `None` when `path` is not a directory.
    #[must_use]
    pub fn list_dir(&self, path: &str) -> Option<Vec<(String, &Node)>> {
        if !matches!(self.lookup(path), Some(Node::Dir)) {
            return None;
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let mut out = Vec::new();
        for (p, node) in self.nodes.range(prefix.clone()..) {
            if !p.starts_with(&prefix) {
                break;
            }
            let rest = &p[prefix.len()..];
            if !rest.is_empty() && !rest.contains('/') {
                out.push((rest.to_string(), node));
            }
        }
        Some(out)
    }

    /// Every file path, in order.
    #[must_use]
    pub fn file_paths(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, n)| matches!(n, Node::File { .. }))
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Every directory path, in order (root excluded).
    #[must_use]
    pub fn dir_paths(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, n)| matches!(n, Node::Dir))
            .map(|(p, _)| p.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(version: u64, path: &str, blob: &str) -> ChangeRecord {
        ChangeRecord {
            version,
            op: ChangeOp::Write,
            path: Some(path.to_string()),
            blob: Some(blob.to_string()),
            size: Some(3),
        }
    }

    #[test]
    fn write_creates_parent_directories() {
        let mut tree = ArchiveTree::default();
        tree.apply(&write(2, "/a/b/c.txt", "b1")).unwrap();
        assert!(matches!(tree.lookup("/a"), Some(Node::Dir)));
        assert!(matches!(tree.lookup("/a/b"), Some(Node::Dir)));
        assert!(matches!(tree.lookup("/a/b/c.txt"), Some(Node::File { .. })));
    }

    #[test]
    fn rmdir_removes_subtree() {
        let mut tree = ArchiveTree::default();
        tree.apply(&write(2, "/a/x", "b1")).unwrap();
        tree.apply(&write(3, "/a/b/y", "b2")).unwrap();
        tree.apply(&ChangeRecord {
            version: 4,
            op: ChangeOp::Rmdir,
            path: Some("/a".to_string()),
            blob: None,
            size: None,
        })
        .unwrap();
        assert!(tree.lookup("/a").is_none());
        assert!(tree.lookup("/a/b/y").is_none());
        assert!(tree.file_paths().is_empty());
    }

    #[test]
    fn list_dir_is_immediate_children_only() {
        let mut tree = ArchiveTree::default();
        tree.apply(&write(2, "/a/x", "b1")).unwrap();
        tree.apply(&write(3, "/a/b/y", "b2")).unwrap();
        let names: Vec<String> = tree
            .list_dir("/a")
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["b".to_string(), "x".to_string()]);
    }

    #[test]
    fn unlink_of_directory_is_rejected() {
        let mut tree = ArchiveTree::default();
        tree.apply(&write(2, "/a/x", "b1")).unwrap();
        let err = tree.apply(&ChangeRecord {
            version: 3,
            op: ChangeOp::Unlink,
            path: Some("/a".to_string()),
            blob: None,
            size: None,
        });
        assert!(err.is_err());
    }
}
