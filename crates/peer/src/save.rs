use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

/// Where downloaded content ends up.
#[async_trait]
pub trait SaveTarget: Send + Sync {
    async fn save(&self, cid: &str, entry_path: &str, data: Bytes) -> Result<PathBuf>;
}

/// Writes each downloaded file to `<root>/<cid>/<file name>`.
pub struct DirectorySaver {
    root: PathBuf,
}

impl DirectorySaver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SaveTarget for DirectorySaver {
    async fn save(&self, cid: &str, entry_path: &str, data: Bytes) -> Result<PathBuf> {
        let dir = self.root.join(sanitize(cid));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let file_name = Path::new(entry_path)
            .file_name()
            .map(|name| sanitize(&name.to_string_lossy()))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| sanitize(cid));
        let target = dir.join(file_name);
        tokio::fs::write(&target, &data)
            .await
            .with_context(|| format!("failed to write {}", target.display()))?;
        Ok(target)
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0'))
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}
