//! Local filesystem host backed by `tokio::fs`.

use async_trait::async_trait;

use super::HostFs;

/// Read-only view of the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

#[async_trait(?Send)]
impl HostFs for LocalFs {
    async fn list_dir(&self, path: &str) -> anyhow::Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to read directory {path}: {e}"))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn read_text_file(&self, path: &str) -> anyhow::Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to read {path}: {e}"))
    }

    async fn exists(&self, path: &str) -> anyhow::Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }
}
