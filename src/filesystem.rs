use std::path::PathBuf;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

/// A deletable location in the filesystem the application was staged to.
/// The staging filesystem itself (HDFS or similar) lives behind this seam;
/// the local implementation covers `file://` and plain paths.
#[async_trait]
pub trait Location: Send + Sync {
    fn uri(&self) -> &str;

    /// Recursively deletes the location. Ok(false) when it did not exist.
    async fn delete(&self) -> Result<bool>;
}

pub struct LocalLocation {
    uri: String,
    path: PathBuf,
}

impl LocalLocation {
    pub fn from_uri(uri: &str) -> Result<Self> {
        let path = match uri.strip_prefix("file://") {
            Some(path) => PathBuf::from(path),
            None if !uri.contains("://") => PathBuf::from(uri),
            None => return Err(anyhow!("unsupported location uri: {uri}")),
        };
        Ok(LocalLocation {
            uri: uri.to_string(),
            path,
        })
    }
}

#[async_trait]
impl Location for LocalLocation {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn delete(&self) -> Result<bool> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_removes_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let staged = dir.path().join("app");
        tokio::fs::create_dir_all(staged.join("nested")).await?;

        let location = LocalLocation::from_uri(&format!("file://{}", staged.display()))?;
        assert!(location.delete().await?);
        assert!(!staged.exists());
        // Second delete reports absence without failing.
        assert!(!location.delete().await?);
        Ok(())
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        assert!(LocalLocation::from_uri("hdfs://nn/weave/app").is_err());
    }
}
