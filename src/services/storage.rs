use async_trait::async_trait;
use image::ImageFormat;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::models::job::{Identifier, ImageRef};

/// Persists labeled images for later training.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Store `image` under `label` in the workspace and return the file path.
    async fn save_image(
        &self,
        image: &ImageRef,
        label: &str,
        workspace_id: &Identifier,
    ) -> Result<PathBuf, StoreError>;
}

/// One line of a `<label>.txt` record file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRecord {
    pub id: Identifier,
    pub name: String,
    pub url: String,
}

/// Local filesystem store.
///
/// Layout: `<base>/workspace/<workspace>/<label>/<file>.<ext>` plus a JSON-lines
/// `<label>.txt` next to the images. Saving the same image id twice overwrites
/// the file and keeps a single record line.
pub struct FsImageStore {
    http: Client,
    base_dir: PathBuf,
}

impl FsImageStore {
    pub fn new(base_dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self, StoreError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Download(e.to_string()))?;
        Ok(Self {
            http,
            base_dir: base_dir.into(),
        })
    }

    pub fn workspace_dir(&self, workspace_id: &Identifier) -> Result<PathBuf, StoreError> {
        let workspace = workspace_id.to_string();
        Ok(self
            .base_dir
            .join("workspace")
            .join(safe_component(&workspace)?))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, StoreError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| StoreError::Download(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Download(format!("{url} returned HTTP {status}")));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::Download(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Write the image bytes and record the id, without any network access.
    pub async fn write_image(
        &self,
        image: &ImageRef,
        label: &str,
        workspace_id: &Identifier,
        bytes: &[u8],
    ) -> Result<PathBuf, StoreError> {
        let extension = match image::guess_format(bytes) {
            Ok(ImageFormat::Png) => "png",
            Ok(ImageFormat::Jpeg) => "jpg",
            _ => return Err(StoreError::UnsupportedFormat(image.url.clone())),
        };

        let label = safe_component(label)?;
        let label_dir = self.workspace_dir(workspace_id)?.join(label);
        tokio::fs::create_dir_all(&label_dir).await?;

        let file_name = format!("{}.{extension}", safe_component(&image.file_stem())?);
        let path = label_dir.join(file_name);
        tokio::fs::write(&path, bytes).await?;

        let record = LabelRecord {
            id: image.id.clone(),
            name: image.file_stem(),
            url: image.url.clone(),
        };
        append_record(&label_dir.join(format!("{label}.txt")), &record).await?;

        Ok(path)
    }
}

#[async_trait]
impl ImageStore for FsImageStore {
    async fn save_image(
        &self,
        image: &ImageRef,
        label: &str,
        workspace_id: &Identifier,
    ) -> Result<PathBuf, StoreError> {
        let bytes = self.download(&image.url).await?;
        let path = self.write_image(image, label, workspace_id, &bytes).await?;
        tracing::debug!(path = %path.display(), label = %label, "Saved labeled image");
        Ok(path)
    }
}

/// Append `record` unless a line with the same id is already present.
async fn append_record(path: &Path, record: &LabelRecord) -> Result<(), StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(existing) => {
            let already = existing
                .lines()
                .filter_map(|line| serde_json::from_str::<LabelRecord>(line).ok())
                .any(|r| r.id == record.id);
            if already {
                return Ok(());
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Reject anything that could escape its parent directory.
pub(crate) fn safe_component(value: &str) -> Result<&str, StoreError> {
    let trimmed = value.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains(['/', '\\', '\0'])
    {
        return Err(StoreError::InvalidPathComponent(value.to_string()));
    }
    Ok(trimmed)
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image download failed: {0}")]
    Download(String),

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid path component: {0:?}")]
    InvalidPathComponent(String),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
