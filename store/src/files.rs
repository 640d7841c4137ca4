//! The guest-facing files adaptor.
//!
//! Guests never hold an archive handle. The adaptor exposes exactly nine
//! operations, normalizes every path (rejecting traversal above the
//! root), and translates between guest [`Value`]s and archive bytes under
//! the three supported encodings. Errors from the archive surface
//! unchanged.

use std::sync::Arc;

use hindsight_types::Value;

use crate::{HistoryRange, StoreError, VersionedArchive};

/// Content encodings understood by `read_file` / `write_file`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// UTF-8 text (the default).
    #[default]
    Utf8,
    /// Raw bytes.
    Binary,
    /// Canonical JSON of any value.
    Json,
}

impl Encoding {
    /// Parse a guest-supplied encoding name.
    ///
    /// # Errors
    ///
    /// `StoreError::Encoding` for unknown names.
    pub fn parse(name: &str) -> Result<Self, StoreError> {
        match name {
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            "binary" => Ok(Encoding::Binary),
            "json" => Ok(Encoding::Json),
            other => Err(StoreError::Encoding(format!("unknown encoding `{other}`"))),
        }
    }
}

/// Path-sandboxed, encoding-aware wrapper over a [`VersionedArchive`].
#[derive(Clone)]
pub struct FilesAdaptor {
    archive: Arc<dyn VersionedArchive>,
}

impl std::fmt::Debug for FilesAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesAdaptor")
            .field("url", &self.archive.url())
            .finish()
    }
}

/// Normalize an absolute guest path.
///
/// Segments are resolved lexically: `.` and empty segments collapse,
/// `..` pops. Popping above `/` is an escape attempt and is rejected.
///
/// # Errors
///
/// `StoreError::InvalidPath` for relative paths, `PathEscape` for
/// traversal above the root.
pub(crate) fn normalize_path(path: &str) -> Result<String, StoreError> {
    if !path.starts_with('/') {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(StoreError::PathEscape(path.to_string()));
                }
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", segments.join("/")))
    }
}

impl FilesAdaptor {
    /// Wrap an archive.
    #[must_use]
    pub fn new(archive: Arc<dyn VersionedArchive>) -> Self {
        Self { archive }
    }

    /// The wrapped archive's durable URL.
    #[must_use]
    pub fn url(&self) -> &str {
        self.archive.url()
    }

    /// The wrapped archive's current version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.archive.version()
    }

    /// `{url, title, version}` of the archive.
    #[must_use]
    pub fn get_info(&self) -> Value {
        Value::object([
            ("url", Value::Str(self.archive.url().to_string())),
            ("title", Value::Str(self.archive.title().to_string())),
            ("version", Value::Int(self.archive.version() as i64)),
        ])
    }

    /// Stat a node as `{path, kind, size}`.
    ///
    /// # Errors
    ///
    /// Archive errors, surfaced unchanged.
    pub async fn stat(&self, path: &str) -> Result<Value, StoreError> {
        let path = normalize_path(path)?;
        let stat = self.archive.stat(&path).await?;
        Ok(Value::object([
            ("path", Value::Str(stat.path)),
            ("kind", Value::Str(kind_name(stat.kind).to_string())),
            ("size", Value::Int(stat.size as i64)),
        ]))
    }

    /// Read a file under the given encoding.
    ///
    /// # Errors
    ///
    /// Archive errors; `StoreError::Encoding` when the bytes do not decode.
    pub async fn read_file(&self, path: &str, encoding: Encoding) -> Result<Value, StoreError> {
        let path = normalize_path(path)?;
        let bytes = self.archive.read_file(&path).await?;
        match encoding {
            Encoding::Utf8 => String::from_utf8(bytes)
                .map(Value::Str)
                .map_err(|e| StoreError::Encoding(e.to_string())),
            Encoding::Binary => Ok(Value::Bytes(bytes)),
            Encoding::Json => {
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Encoding(e.to_string()))
            }
        }
    }

    /// List a directory as `[{name, kind}]`.
    ///
    /// # Errors
    ///
    /// Archive errors, surfaced unchanged.
    pub async fn read_dir(&self, path: &str) -> Result<Value, StoreError> {
        let path = normalize_path(path)?;
        let rows = self.archive.read_dir(&path).await?;
        Ok(Value::Array(
            rows.into_iter()
                .map(|row| {
                    Value::object([
                        ("name", Value::Str(row.name)),
                        ("kind", Value::Str(kind_name(row.kind).to_string())),
                    ])
                })
                .collect(),
        ))
    }

    /// Change history over a half-open version range as
    /// `[{version, op, path?}]`.
    ///
    /// # Errors
    ///
    /// Archive errors, surfaced unchanged.
    pub async fn history(
        &self,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<Value, StoreError> {
        let records = self.archive.history(HistoryRange { start, end }).await?;
        Ok(Value::Array(
            records
                .into_iter()
                .map(|record| {
                    let mut fields = vec![
                        ("version", Value::Int(record.version as i64)),
                        (
                            "op",
                            Value::Str(
                                serde_json::to_value(record.op)
                                    .ok()
                                    .and_then(|v| v.as_str().map(str::to_string))
                                    .unwrap_or_default(),
                            ),
                        ),
                    ];
                    if let Some(path) = record.path {
                        fields.push(("path", Value::Str(path)));
                    }
                    Value::object(fields)
                })
                .collect(),
        ))
    }

    /// Write a value under the given encoding; returns the new version.
    ///
    /// # Errors
    ///
    /// `StoreError::Encoding` when the value does not fit the encoding;
    /// archive errors otherwise.
    pub async fn write_file(
        &self,
        path: &str,
        value: &Value,
        encoding: Encoding,
    ) -> Result<u64, StoreError> {
        let path = normalize_path(path)?;
        let bytes = match (encoding, value) {
            (Encoding::Utf8, Value::Str(text)) => text.as_bytes().to_vec(),
            (Encoding::Utf8, other) => other.to_string().into_bytes(),
            (Encoding::Binary, Value::Bytes(bytes)) => bytes.clone(),
            (Encoding::Binary, _) => {
                return Err(StoreError::Encoding(
                    "binary writes require a byte string".to_string(),
                ))
            }
            (Encoding::Json, any) => any.canonical_bytes(),
        };
        self.archive.write_file(&path, &bytes).await
    }

    /// Create a directory; returns the new version.
    ///
    /// # Errors
    ///
    /// Archive errors, surfaced unchanged.
    pub async fn mkdir(&self, path: &str) -> Result<u64, StoreError> {
        let path = normalize_path(path)?;
        self.archive.mkdir(&path).await
    }

    /// Remove a file; returns the new version.
    ///
    /// # Errors
    ///
    /// Archive errors, surfaced unchanged.
    pub async fn unlink(&self, path: &str) -> Result<u64, StoreError> {
        let path = normalize_path(path)?;
        self.archive.unlink(&path).await
    }

    /// Remove a directory; returns the new version.
    ///
    /// # Errors
    ///
    /// Archive errors, surfaced unchanged.
    pub async fn rmdir(&self, path: &str, recursive: bool) -> Result<u64, StoreError> {
        let path = normalize_path(path)?;
        self.archive.rmdir(&path, recursive).await
    }
}

fn kind_name(kind: crate::EntryKind) -> &'static str {
    match kind {
        crate::EntryKind::File => "file",
        crate::EntryKind::Dir => "dir",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Archive;
    use proptest::prelude::*;

    fn adaptor() -> FilesAdaptor {
        FilesAdaptor::new(Arc::new(Archive::memory("t")))
    }

    #[test]
    fn normalization_resolves_dots() {
        assert_eq!(normalize_path("/a/./b//c").unwrap(), "/a/b/c");
        assert_eq!(normalize_path("/a/b/../c").unwrap(), "/a/c");
        assert_eq!(normalize_path("/").unwrap(), "/");
    }

    #[test]
    fn escapes_are_rejected() {
        assert!(matches!(
            normalize_path("/../etc/passwd"),
            Err(StoreError::PathEscape(_))
        ));
        assert!(matches!(
            normalize_path("/a/../../b"),
            Err(StoreError::PathEscape(_))
        ));
        assert!(matches!(
            normalize_path("relative"),
            Err(StoreError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn utf8_and_json_round_trips() {
        let files = adaptor();
        files
            .write_file("/t.txt", &Value::Str("hi".to_string()), Encoding::Utf8)
            .await
            .unwrap();
        assert_eq!(
            files.read_file("/t.txt", Encoding::Utf8).await.unwrap(),
            Value::Str("hi".to_string())
        );

        let value = Value::object([("n", Value::Int(4))]);
        files
            .write_file("/o.json", &value, Encoding::Json)
            .await
            .unwrap();
        assert_eq!(
            files.read_file("/o.json", Encoding::Json).await.unwrap(),
            value
        );
    }

    #[tokio::test]
    async fn binary_requires_bytes() {
        let files = adaptor();
        assert!(matches!(
            files
                .write_file("/b", &Value::Int(1), Encoding::Binary)
                .await,
            Err(StoreError::Encoding(_))
        ));
        files
            .write_file("/b", &Value::Bytes(vec![1, 2]), Encoding::Binary)
            .await
            .unwrap();
        assert_eq!(
            files.read_file("/b", Encoding::Binary).await.unwrap(),
            Value::Bytes(vec![1, 2])
        );
    }

    #[tokio::test]
    async fn get_info_reports_version() {
        let files = adaptor();
        files
            .write_file("/a", &Value::Str("x".to_string()), Encoding::Utf8)
            .await
            .unwrap();
        let info = files.get_info();
        let map = info.as_object().unwrap();
        assert_eq!(map["version"], Value::Int(2));
        assert!(map["url"].as_str().unwrap().starts_with("varc://"));
    }

    proptest! {
        #[test]
        fn normalized_paths_never_escape(path in "(/([a-z.]{1,4}|\\.\\.)){1,6}") {
            match normalize_path(&path) {
                Ok(normalized) => {
                    prop_assert!(normalized.starts_with('/'));
                    prop_assert!(!normalized.split('/').any(|s| s == ".."));
                }
                Err(StoreError::PathEscape(_)) => {}
                Err(other) => prop_assert!(false, "unexpected error {other:?}"),
            }
        }
    }
}
