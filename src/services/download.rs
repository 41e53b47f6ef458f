use std::path::{Path, PathBuf};

/// Writes finished videos under the configured directory.
pub struct Downloader {
    dir: PathBuf,
}

impl Downloader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Item name with its extension replaced by `.mp4`.
    pub fn video_filename(name: &str) -> String {
        let stem = match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => name,
        };
        format!("{stem}.mp4")
    }

    /// Write the video bytes to disk, uniquifying the filename on conflict
    /// (`name.mp4`, `name (1).mp4`, ...). Returns the path written.
    pub async fn save(&self, item_name: &str, bytes: &[u8]) -> Result<PathBuf, DownloadError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.unique_path(&Self::video_filename(item_name)).await;
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    async fn unique_path(&self, filename: &str) -> PathBuf {
        let candidate = self.dir.join(filename);
        if !exists(&candidate).await {
            return candidate;
        }

        let stem = filename.strip_suffix(".mp4").unwrap_or(filename);
        for n in 1.. {
            let candidate = self.dir.join(format!("{stem} ({n}).mp4"));
            if !exists(&candidate).await {
                return candidate;
            }
        }
        unreachable!()
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("failed to write video file: {0}")]
    Io(#[from] std::io::Error),
}
