//! Attachment lookup.

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::debug;

const OCTET_STREAM: &str = "application/octet-stream";

fn safe_segment() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9._-]+$").expect("static regex"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub name: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// `Ok(None)` when no file has that name.
    async fn find(&self, name: &str) -> anyhow::Result<Option<StoredFile>>;
}

/// Accepts `a/b/c.pdf` style names made of safe segments, never `..`.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .split('/')
            .all(|seg| safe_segment().is_match(seg) && seg != "." && seg != "..")
}

pub fn content_type_for(name: &str) -> String {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or(OCTET_STREAM)
        .to_string()
}

/// Files under a root directory on local disk.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn find(&self, name: &str) -> anyhow::Result<Option<StoredFile>> {
        if !is_safe_name(name) {
            anyhow::bail!("unsafe attachment name: {name:?}");
        }
        let path = self.root.join(name);

        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() {
            return Ok(None);
        }

        let bytes = tokio::fs::read(&path).await?;
        debug!(file = name, size = bytes.len(), "attachment loaded");
        Ok(Some(StoredFile {
            name: file_name(name),
            content_type: content_type_for(name),
            bytes,
        }))
    }
}

fn file_name(name: &str) -> String {
    name.rsplit('/').next().unwrap_or(name).to_string()
}

#[derive(Default)]
pub struct MemoryFileStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, bytes: impl Into<Vec<u8>>) {
        self.files.lock().insert(name.to_string(), bytes.into());
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn find(&self, name: &str) -> anyhow::Result<Option<StoredFile>> {
        Ok(self.files.lock().get(name).map(|bytes| StoredFile {
            name: file_name(name),
            bytes: bytes.clone(),
            content_type: content_type_for(name),
        }))
    }
}
