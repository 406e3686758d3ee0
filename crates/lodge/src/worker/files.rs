//! File reads confined to a workspace or the home directory.

use std::path::{Component, Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncReadExt;

use super::workspace::WorkspaceStore;
use super::{WorkerError, WorkerResult};

pub const DEFAULT_MAX_BYTES: u64 = 1024 * 1024;

/// Upper bound regardless of what the caller asks for.
pub const HARD_MAX_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct ReadFileParams {
    #[serde(default)]
    pub workspace: Option<String>,
    pub path: String,
    #[serde(default)]
    pub max_bytes: Option<u64>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Utf8,
    Base64,
}

#[derive(Debug, Serialize)]
pub struct FileContent {
    pub path: String,
    pub size: u64,
    pub encoding: Encoding,
    pub content: String,
    pub truncated: bool,
}

/// Resolve `relative` below `root`, following symlinks, and refuse anything
/// that lands outside it.
pub async fn confine(root: &Path, relative: &str) -> WorkerResult<PathBuf> {
    let relative = relative.trim_start_matches('/');
    if Path::new(relative)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(WorkerError::PathEscape(relative.to_string()));
    }

    let canonical_root = fs::canonicalize(root).await?;
    let canonical = match fs::canonicalize(root.join(relative)).await {
        Ok(path) => path,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(WorkerError::NotFound(format!("file not found: {relative}")));
        }
        Err(e) => return Err(e.into()),
    };

    if !canonical.starts_with(&canonical_root) {
        warn!(
            "Symlink escape attempt: {} resolved to {}",
            relative,
            canonical.display()
        );
        return Err(WorkerError::PathEscape(relative.to_string()));
    }
    Ok(canonical)
}

pub async fn read_file(home: &Path, params: ReadFileParams) -> WorkerResult<FileContent> {
    let root = match params.workspace.as_deref() {
        Some(name) => WorkspaceStore::new(home).path_of(name).await?,
        None => home.to_path_buf(),
    };
    let path = confine(&root, &params.path).await?;

    let meta = fs::metadata(&path).await?;
    if !meta.is_file() {
        return Err(WorkerError::InvalidParams(format!(
            "not a regular file: {}",
            params.path
        )));
    }

    let limit = params
        .max_bytes
        .unwrap_or(DEFAULT_MAX_BYTES)
        .min(HARD_MAX_BYTES);
    let mut bytes = Vec::new();
    fs::File::open(&path)
        .await?
        .take(limit)
        .read_to_end(&mut bytes)
        .await?;
    let truncated = meta.len() > bytes.len() as u64;

    let (encoding, content) = match String::from_utf8(bytes) {
        Ok(text) => (Encoding::Utf8, text),
        Err(e) => (Encoding::Base64, STANDARD.encode(e.into_bytes())),
    };

    Ok(FileContent {
        path: params.path,
        size: meta.len(),
        encoding,
        content,
        truncated,
    })
}
