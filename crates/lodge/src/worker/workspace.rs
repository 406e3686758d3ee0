//! Named workspace directories under `<home>/workspaces`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;

use super::{WorkerError, WorkerResult};

pub const WORKSPACES_DIR: &str = "workspaces";

const MAX_NAME_LEN: usize = 128;

#[derive(Debug, Deserialize)]
pub struct NameParams {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateParams {
    pub name: String,
    #[serde(default)]
    pub git_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WorkspaceInfo {
    pub name: String,
    pub path: PathBuf,
    pub is_git: bool,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Check a workspace name: `[A-Za-z0-9._-]`, not starting with `.`.
pub fn validate_name(name: &str) -> WorkerResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(WorkerError::InvalidName(name.to_string()))
    }
}

pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    pub fn new(home: &Path) -> Self {
        Self {
            root: home.join(WORKSPACES_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of an existing workspace.
    pub async fn path_of(&self, name: &str) -> WorkerResult<PathBuf> {
        validate_name(name)?;
        let path = self.root.join(name);
        if fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
            Ok(path)
        } else {
            Err(not_found(name))
        }
    }

    pub async fn list(&self) -> WorkerResult<Vec<WorkspaceInfo>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut workspaces = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if validate_name(&name).is_err() || !entry.file_type().await?.is_dir() {
                continue;
            }
            workspaces.push(describe(name, entry.path()).await);
        }
        workspaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workspaces)
    }

    pub async fn get(&self, name: &str) -> WorkerResult<WorkspaceInfo> {
        let path = self.path_of(name).await?;
        Ok(describe(name.to_string(), path).await)
    }

    /// Create a workspace by cloning `git_url`, or as an empty repository.
    pub async fn create(&self, params: CreateParams) -> WorkerResult<WorkspaceInfo> {
        validate_name(&params.name)?;
        fs::create_dir_all(&self.root).await?;

        let path = self.root.join(&params.name);
        if fs::symlink_metadata(&path).await.is_ok() {
            return Err(WorkerError::Conflict(format!(
                "workspace already exists: {}",
                params.name
            )));
        }

        match params.git_url.as_deref().filter(|url| !url.is_empty()) {
            Some(url) => {
                let mut cmd = Command::new("git");
                cmd.arg("clone").arg("--").arg(url).arg(&path);
                if let Err(e) = run_git(cmd).await {
                    // A failed clone may leave a partial checkout behind.
                    let _ = fs::remove_dir_all(&path).await;
                    return Err(e);
                }
                info!("Cloned {} into workspace {}", url, params.name);
            }
            None => {
                fs::create_dir(&path).await?;
                let mut cmd = Command::new("git");
                cmd.arg("init").arg("--quiet").arg(&path);
                match run_git(cmd).await {
                    Ok(()) => {}
                    Err(WorkerError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                        warn!("git not available; workspace {} is a plain directory", params.name);
                    }
                    Err(e) => return Err(e),
                }
                info!("Created workspace {}", params.name);
            }
        }

        Ok(describe(params.name, path).await)
    }

    pub async fn delete(&self, name: &str) -> WorkerResult<()> {
        let path = self.path_of(name).await?;
        fs::remove_dir_all(&path).await?;
        info!("Deleted workspace {}", name);
        Ok(())
    }
}

async fn describe(name: String, path: PathBuf) -> WorkspaceInfo {
    let is_git = fs::metadata(path.join(".git")).await.is_ok();
    let modified_at = fs::metadata(&path)
        .await
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from);
    WorkspaceInfo {
        name,
        path,
        is_git,
        modified_at,
    }
}

async fn run_git(mut cmd: Command) -> WorkerResult<()> {
    let output = cmd
        .stdin(Stdio::null())
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(WorkerError::Command(format!("git failed: {}", stderr.trim())))
    }
}

fn not_found(name: &str) -> WorkerError {
    WorkerError::NotFound(format!("workspace not found: {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("project-1").is_ok());
        assert!(validate_name("my_app.v2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("with space").is_err());
        assert!(validate_name(&"x".repeat(129)).is_err());
    }

    #[tokio::test]
    async fn test_create_list_get_delete() {
        let home = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(home.path());
        assert!(store.list().await.unwrap().is_empty());

        let created = store
            .create(CreateParams {
                name: "alpha".into(),
                git_url: None,
            })
            .await
            .unwrap();
        assert_eq!(created.path, home.path().join("workspaces/alpha"));
        assert!(created.path.is_dir());

        store
            .create(CreateParams {
                name: "beta".into(),
                git_url: None,
            })
            .await
            .unwrap();

        let names: Vec<String> = store.list().await.unwrap().into_iter().map(|w| w.name).collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        assert_eq!(store.get("beta").await.unwrap().name, "beta");

        store.delete("alpha").await.unwrap();
        assert!(matches!(
            store.get("alpha").await.unwrap_err(),
            WorkerError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let home = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(home.path());
        let params = || CreateParams {
            name: "dup".into(),
            git_url: None,
        };
        store.create(params()).await.unwrap();
        assert!(matches!(
            store.create(params()).await.unwrap_err(),
            WorkerError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_list_skips_files_and_hidden_entries() {
        let home = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(home.path());
        std::fs::create_dir_all(store.root().join(".cache")).unwrap();
        std::fs::create_dir_all(store.root().join("real")).unwrap();
        std::fs::write(store.root().join("notes.txt"), "x").unwrap();

        let names: Vec<String> = store.list().await.unwrap().into_iter().map(|w| w.name).collect();
        assert_eq!(names, vec!["real"]);
    }

    #[tokio::test]
    async fn test_delete_rejects_traversal() {
        let home = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(home.path());
        assert!(matches!(
            store.delete("..").await.unwrap_err(),
            WorkerError::InvalidName(_)
        ));
    }
}
