//! Append-only trap log file
//!
//! Holds the print sink's output file open in append mode. Rotation is left
//! to external tools; `reopen` is called on reconfiguration so records start
//! landing in the fresh file once the old one has been moved aside.
//!
//! Developed by GoCortex.io

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub struct LogFile {
    path: PathBuf,
    file: Option<File>,
}

impl LogFile {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = open_append(&path).await?;
        info!("Writing trap records to {}", path.display());
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_str(&mut self, text: &str) -> Result<()> {
        if self.file.is_none() {
            self.file = Some(open_append(&self.path).await?);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(text.as_bytes())
                .await
                .with_context(|| format!("Failed to write to {}", self.path.display()))?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()
                .await
                .with_context(|| format!("Failed to flush {}", self.path.display()))?;
        }
        Ok(())
    }

    /// Close the current handle and open the path again.
    pub async fn reopen(&mut self) -> Result<()> {
        if let Some(mut old) = self.file.take() {
            // Flush failures on the old handle must not prevent the reopen
            let _ = old.flush().await;
        }
        self.file = Some(open_append(&self.path).await?);
        debug!("Reopened trap log {}", self.path.display());
        Ok(())
    }
}

async fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open trap log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_creates_parent_and_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("traps.log");

        let mut log = LogFile::open(&path).await.unwrap();
        log.write_str("first\n").await.unwrap();
        log.flush().await.unwrap();
        drop(log);

        let mut log = LogFile::open(&path).await.unwrap();
        log.write_str("second\n").await.unwrap();
        log.flush().await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_reopen_after_external_rotation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("traps.log");
        let rotated = dir.path().join("traps.log.1");

        let mut log = LogFile::open(&path).await.unwrap();
        log.write_str("before\n").await.unwrap();
        log.flush().await.unwrap();

        tokio::fs::rename(&path, &rotated).await.unwrap();
        log.reopen().await.unwrap();
        log.write_str("after\n").await.unwrap();
        log.flush().await.unwrap();

        assert_eq!(tokio::fs::read_to_string(&rotated).await.unwrap(), "before\n");
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "after\n");
    }
}
