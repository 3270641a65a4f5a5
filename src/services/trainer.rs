//! Training and export, delegated to an external trainer executable.
//!
//! The trainer is invoked as
//! `<cmd> train --data <dir> --epochs N --imgsz M --output <model.pt>` and
//! `<cmd> export --model <model.pt> --format <fmt> --output <file>`.
//! Every JSON object it prints on stdout during training is a progress report.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::storage::safe_component;
use crate::models::envelope::TrainResult;
use crate::models::job::{Identifier, TrainJob};

/// Kept from the end of the trainer's stderr for error messages.
const STDERR_TAIL: usize = 2000;

/// Export targets the trainer understands. The format also becomes the file extension.
pub const EXPORT_FORMATS: &[&str] = &[
    "onnx",
    "torchscript",
    "tflite",
    "coreml",
    "openvino",
    "engine",
    "saved_model",
    "pb",
    "ncnn",
];

/// Lowercased export format, if it is one the trainer supports.
pub fn export_format(format: &str) -> Result<String, TrainerError> {
    let normalized = format.trim().to_ascii_lowercase();
    if EXPORT_FORMATS.contains(&normalized.as_str()) {
        Ok(normalized)
    } else {
        Err(TrainerError::UnsupportedFormat(format.to_string()))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Trainer: Send + Sync {
    /// Train a model for the job's workspace, sending progress objects on `progress`.
    async fn train(
        &self,
        job: &TrainJob,
        progress: mpsc::UnboundedSender<Value>,
    ) -> Result<TrainResult, TrainerError>;

    /// Export a trained model (the latest when `version` is `None`). Returns the exported path.
    async fn export_model(
        &self,
        workspace_id: &Identifier,
        version: Option<String>,
        format: &str,
    ) -> Result<String, TrainerError>;
}

pub struct ProcessTrainer {
    command: String,
    base_dir: PathBuf,
}

impl ProcessTrainer {
    pub fn new(command: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            base_dir: base_dir.into(),
        }
    }

    fn models_dir(&self) -> PathBuf {
        self.base_dir.join("models")
    }

    fn workspace_dir(&self, workspace_id: &Identifier) -> Result<PathBuf, TrainerError> {
        let workspace = workspace_id.to_string();
        match safe_component(&workspace) {
            Ok(name) => Ok(self.base_dir.join("workspace").join(name)),
            Err(_) => Err(TrainerError::WorkspaceNotFound(workspace)),
        }
    }

    fn model_path(&self, workspace_id: &Identifier, version: &str) -> PathBuf {
        self.models_dir()
            .join(format!("model_{workspace_id}_{version}.pt"))
    }

    /// Trained versions for a workspace, newest first.
    pub async fn model_versions(&self, workspace_id: &Identifier) -> Result<Vec<String>, TrainerError> {
        let prefix = format!("model_{workspace_id}_");
        let mut versions = Vec::new();

        let mut entries = match tokio::fs::read_dir(self.models_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(version) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".pt"))
            {
                versions.push(version.to_string());
            }
        }

        versions.sort_unstable_by(|a, b| b.cmp(a));
        Ok(versions)
    }

    async fn resolve_model(
        &self,
        workspace_id: &Identifier,
        version: Option<String>,
    ) -> Result<(PathBuf, String), TrainerError> {
        let version = match version {
            Some(version) => version,
            None => self
                .model_versions(workspace_id)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| TrainerError::ModelNotFound {
                    workspace: workspace_id.to_string(),
                    version: None,
                })?,
        };

        let path = self.model_path(workspace_id, &version);
        if safe_component(&version).is_err() || !tokio::fs::try_exists(&path).await? {
            return Err(TrainerError::ModelNotFound {
                workspace: workspace_id.to_string(),
                version: Some(version),
            });
        }
        Ok((path, version))
    }
}

#[async_trait]
impl Trainer for ProcessTrainer {
    async fn train(
        &self,
        job: &TrainJob,
        progress: mpsc::UnboundedSender<Value>,
    ) -> Result<TrainResult, TrainerError> {
        let data_dir = self.workspace_dir(&job.workspace_id)?;
        if !tokio::fs::try_exists(&data_dir).await? {
            return Err(TrainerError::WorkspaceNotFound(job.workspace_id.to_string()));
        }

        tokio::fs::create_dir_all(self.models_dir()).await?;
        let version = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let model_path = self.model_path(&job.workspace_id, &version);

        tracing::info!(
            workspace_id = %job.workspace_id,
            epochs = job.epochs,
            imgsz = job.imgsz,
            version = %version,
            "Starting training"
        );

        let mut child = Command::new(&self.command)
            .arg("train")
            .arg("--data")
            .arg(&data_dir)
            .arg("--epochs")
            .arg(job.epochs.to_string())
            .arg("--imgsz")
            .arg(job.imgsz.to_string())
            .arg("--output")
            .arg(&model_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = collect_stderr(&mut child);
        let mut metrics = Value::Null;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                let Ok(report @ Value::Object(_)) = serde_json::from_str::<Value>(&line) else {
                    tracing::debug!(line = %line, "Trainer output");
                    continue;
                };
                if report.get("status").and_then(Value::as_str) == Some("completed") {
                    metrics = report.get("metrics").cloned().unwrap_or_else(|| report.clone());
                }
                // Receiver may be gone; training continues regardless.
                let _ = progress.send(report);
            }
        }

        let status = child.wait().await?;
        let stderr = stderr.await.unwrap_or_default();
        if !status.success() {
            return Err(TrainerError::TrainingFailed(format!("trainer exited with {status}: {stderr}")));
        }
        if !tokio::fs::try_exists(&model_path).await? {
            return Err(TrainerError::TrainingFailed(
                "trainer finished without writing a model".to_string(),
            ));
        }

        Ok(TrainResult {
            model_path: model_path.display().to_string(),
            version,
            metrics,
        })
    }

    async fn export_model(
        &self,
        workspace_id: &Identifier,
        version: Option<String>,
        format: &str,
    ) -> Result<String, TrainerError> {
        let format = export_format(format)?;
        self.workspace_dir(workspace_id)?;
        let (model_path, version) = self.resolve_model(workspace_id, version).await?;
        let export_path = self
            .models_dir()
            .join(format!("exported_{workspace_id}_{version}.{format}"));

        let mut child = Command::new(&self.command)
            .arg("export")
            .arg("--model")
            .arg(&model_path)
            .arg("--format")
            .arg(&format)
            .arg("--output")
            .arg(&export_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = collect_stderr(&mut child);
        let status = child.wait().await?;
        let stderr = stderr.await.unwrap_or_default();
        if !status.success() {
            return Err(TrainerError::ExportFailed(format!("trainer exited with {status}: {stderr}")));
        }

        tracing::info!(path = %export_path.display(), format = %format, "Model exported");
        Ok(export_path.display().to_string())
    }
}

fn collect_stderr(child: &mut tokio::process::Child) -> tokio::task::JoinHandle<String> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut buf).await;
        }
        tail(&buf, STDERR_TAIL).to_string()
    })
}

fn tail(text: &str, max: usize) -> &str {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed;
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}

#[derive(Debug, thiserror::Error)]
pub enum TrainerError {
    #[error("Workspace {0} has no labeled images")]
    WorkspaceNotFound(String),

    #[error("No trained model for workspace {workspace} (version: {version:?})")]
    ModelNotFound {
        workspace: String,
        version: Option<String>,
    },

    #[error("Training failed: {0}")]
    TrainingFailed(String),

    #[error("Export failed: {0}")]
    ExportFailed(String),

    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
