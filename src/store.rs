//! Result store: where comparison artifacts live
//!
//! Artifacts are addressed by `(comparison id, viewport, kind)` and exposed to
//! consumers as relative paths of the form
//! `{prefix}/{comparison id}/{viewport}-{kind}.png`. Each comparison id gets
//! its own namespace, so concurrent runs can never overwrite each other.

use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Default public prefix for artifact paths.
pub const DEFAULT_PUBLIC_PREFIX: &str = "/screenshots";

/// Which of the three images a file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Reference,
    Test,
    Diff,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [ArtifactKind::Reference, ArtifactKind::Test, ArtifactKind::Diff];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Reference => "reference",
            ArtifactKind::Test => "test",
            ArtifactKind::Diff => "diff",
        }
    }
}

/// Address of one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactKey {
    pub comparison_id: String,
    pub viewport: String,
    pub kind: ArtifactKind,
}

impl ArtifactKey {
    pub fn new(comparison_id: &str, viewport: &str, kind: ArtifactKind) -> Self {
        Self {
            comparison_id: comparison_id.to_string(),
            viewport: viewport.to_string(),
            kind,
        }
    }

    /// File name inside the comparison namespace.
    pub fn file_name(&self) -> String {
        format!("{}-{}.png", self.viewport, self.kind.as_str())
    }

    fn validate(&self) -> Result<()> {
        validate_segment(&self.comparison_id)?;
        validate_segment(&self.viewport)
    }
}

/// Blob storage for comparison artifacts
pub trait ResultStore: Send + Sync {
    /// Create the namespace for a comparison id. Idempotent.
    fn create_namespace(&self, comparison_id: &str) -> Result<()>;

    /// Store `bytes` and return the public relative path of the artifact.
    fn write(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<String>;

    /// Fetch an artifact by the relative path returned from `write`.
    fn read(&self, relative_path: &str) -> Result<Vec<u8>>;

    /// Delete a namespace and everything in it. Missing namespaces are fine.
    fn remove_namespace(&self, comparison_id: &str) -> Result<()>;
}

/// Ids and viewport names end up in paths; keep them to a safe alphabet.
fn validate_segment(segment: &str) -> Result<()> {
    let ok = !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::StorageError(format!("invalid path segment '{}'", segment)))
    }
}

/// `"/screenshots/"` -> `"/screenshots"`; a bare `"/"` becomes the empty prefix.
pub(crate) fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

/// Split `{prefix}/{id}/{file}` into `(id, file)`, rejecting anything else.
fn parse_relative_path<'a>(prefix: &str, relative_path: &'a str) -> Result<(&'a str, &'a str)> {
    let not_found = || Error::NotFound(relative_path.to_string());
    let rest = relative_path.strip_prefix(prefix).ok_or_else(not_found)?;
    let rest = rest.strip_prefix('/').ok_or_else(not_found)?;
    let (id, file) = rest.split_once('/').ok_or_else(not_found)?;
    let stem = file.strip_suffix(".png").ok_or_else(not_found)?;
    validate_segment(id).map_err(|_| not_found())?;
    validate_segment(stem).map_err(|_| not_found())?;
    Ok((id, file))
}

/// Filesystem-backed store: `root/{id}/{viewport}-{kind}.png`
#[derive(Debug, Clone)]
pub struct FsResultStore {
    root: PathBuf,
    public_prefix: String,
}

impl FsResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_prefix(root, DEFAULT_PUBLIC_PREFIX)
    }

    pub fn with_prefix(root: impl Into<PathBuf>, public_prefix: &str) -> Self {
        Self {
            root: root.into(),
            public_prefix: normalize_prefix(public_prefix),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, comparison_id: &str) -> PathBuf {
        self.root.join(comparison_id)
    }
}

impl ResultStore for FsResultStore {
    fn create_namespace(&self, comparison_id: &str) -> Result<()> {
        validate_segment(comparison_id)?;
        let dir = self.namespace_dir(comparison_id);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::StorageError(format!("Failed to create {}: {}", dir.display(), e)))
    }

    fn write(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<String> {
        key.validate()?;
        let file_name = key.file_name();
        let dir = self.namespace_dir(&key.comparison_id);
        let path = dir.join(&file_name);
        // Write then rename so readers never observe a half-written PNG.
        let tmp = dir.join(format!(".{}.tmp", file_name));

        fs::write(&tmp, bytes)
            .map_err(|e| Error::StorageError(format!("Failed to write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::StorageError(format!("Failed to move {} into place: {}", path.display(), e))
        })?;

        Ok(format!("{}/{}/{}", self.public_prefix, key.comparison_id, file_name))
    }

    fn read(&self, relative_path: &str) -> Result<Vec<u8>> {
        let (id, file) = parse_relative_path(&self.public_prefix, relative_path)?;
        let path = self.namespace_dir(id).join(file);
        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::NotFound(relative_path.to_string()),
            _ => Error::StorageError(format!("Failed to read {}: {}", path.display(), e)),
        })
    }

    fn remove_namespace(&self, comparison_id: &str) -> Result<()> {
        validate_segment(comparison_id)?;
        let dir = self.namespace_dir(comparison_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::StorageError(format!("Failed to remove {}: {}", dir.display(), e))),
        }
    }
}

/// In-memory store, for tests and embedding without a filesystem
#[derive(Debug)]
pub struct MemoryResultStore {
    public_prefix: String,
    namespaces: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl Default for MemoryResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self {
            public_prefix: normalize_prefix(DEFAULT_PUBLIC_PREFIX),
            namespaces: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, BTreeMap<String, Vec<u8>>>>> {
        self.namespaces
            .lock()
            .map_err(|_| Error::StorageError("memory store lock poisoned".into()))
    }

    /// Ids of every namespace currently held.
    pub fn namespaces(&self) -> Vec<String> {
        self.lock()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// File names held in one namespace, sorted.
    pub fn files(&self, comparison_id: &str) -> Vec<String> {
        self.lock()
            .ok()
            .and_then(|map| map.get(comparison_id).map(|ns| ns.keys().cloned().collect()))
            .unwrap_or_default()
    }
}

impl ResultStore for MemoryResultStore {
    fn create_namespace(&self, comparison_id: &str) -> Result<()> {
        validate_segment(comparison_id)?;
        self.lock()?.entry(comparison_id.to_string()).or_default();
        Ok(())
    }

    fn write(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<String> {
        key.validate()?;
        let file_name = key.file_name();
        let mut map = self.lock()?;
        let ns = map.get_mut(&key.comparison_id).ok_or_else(|| {
            Error::StorageError(format!("namespace '{}' does not exist", key.comparison_id))
        })?;
        ns.insert(file_name.clone(), bytes.to_vec());
        Ok(format!("{}/{}/{}", self.public_prefix, key.comparison_id, file_name))
    }

    fn read(&self, relative_path: &str) -> Result<Vec<u8>> {
        let (id, file) = parse_relative_path(&self.public_prefix, relative_path)?;
        self.lock()?
            .get(id)
            .and_then(|ns| ns.get(file))
            .cloned()
            .ok_or_else(|| Error::NotFound(relative_path.to_string()))
    }

    fn remove_namespace(&self, comparison_id: &str) -> Result<()> {
        validate_segment(comparison_id)?;
        self.lock()?.remove(comparison_id);
        Ok(())
    }
}
