use std::fmt::Display;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::BatchSink;
use crate::error::SinkError;

/// Appends each item's `Display` form as one line.
#[derive(Debug, Clone)]
pub struct FileLineSink {
    path: PathBuf,
}

impl FileLineSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<T> BatchSink<T> for FileLineSink
where
    T: Display + Send + Sync + 'static,
{
    async fn flush(&mut self, batch: &[T]) -> Result<(), SinkError> {
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }

        let mut lines = String::new();
        for item in batch {
            lines.push_str(&item.to_string());
            lines.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
