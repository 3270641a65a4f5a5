//! Job execution shared by the broker consumer and the HTTP handlers.

use garde::Validate;
use metrics::counter;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::broker::publisher::ResponsePublisher;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::models::envelope::{ResponseEnvelope, TrainResult};
use crate::models::job::{
    ClassifyJob, ExportJob, ExportPayload, Job, MissingIds, Operation, TrainJob, TrainPayload,
};
use crate::models::label::LabelToIds;
use crate::services::batch::BatchProcessor;
use crate::services::events::EventHub;
use crate::services::trainer::{export_format, Trainer};

pub const TRAIN_PROGRESS_EVENT: &str = "train_progress";
pub const EXPORT_COMPLETE_EVENT: &str = "export_complete";

/// Values filled into train/export requests that leave them out.
#[derive(Debug, Clone)]
pub struct JobDefaults {
    pub epochs: u32,
    pub imgsz: u32,
    pub export_format: String,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            epochs: 10,
            imgsz: 416,
            export_format: "onnx".to_string(),
        }
    }
}

impl JobDefaults {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            epochs: config.default_epochs,
            imgsz: config.default_imgsz,
            export_format: config.default_export_format.clone(),
        }
    }

    pub fn train_job(&self, payload: TrainPayload) -> Result<TrainJob, MissingIds> {
        TrainJob::from_payload(payload, self.epochs, self.imgsz)
    }

    pub fn export_job(&self, payload: ExportPayload) -> Result<ExportJob, MissingIds> {
        ExportJob::from_payload(payload, &self.export_format)
    }
}

/// Runs jobs and fans progress out to the event hub and the progress stream.
pub struct JobRunner {
    batch: BatchProcessor,
    trainer: Arc<dyn Trainer>,
    events: Arc<EventHub>,
    publisher: Arc<ResponsePublisher>,
    defaults: JobDefaults,
}

impl JobRunner {
    pub fn new(
        batch: BatchProcessor,
        trainer: Arc<dyn Trainer>,
        events: Arc<EventHub>,
        publisher: Arc<ResponsePublisher>,
        defaults: JobDefaults,
    ) -> Self {
        Self {
            batch,
            trainer,
            events,
            publisher,
            defaults,
        }
    }

    pub fn batch(&self) -> &BatchProcessor {
        &self.batch
    }

    pub fn defaults(&self) -> &JobDefaults {
        &self.defaults
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub async fn classify(
        &self,
        job: &ClassifyJob,
        operation: Operation,
    ) -> Result<LabelToIds, AppError> {
        job.validate()?;
        counter!("classify_jobs_total", "operation" => operation.to_string()).increment(1);
        Ok(self
            .batch
            .process_job(&job.images, &job.categories, operation, &job.workspace_id)
            .await)
    }

    /// Train while forwarding every progress report as a `train_progress` event.
    pub async fn train(&self, job: &TrainJob) -> Result<TrainResult, AppError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let client_id = job.requester_id.to_string();
        let workspace_id = job.workspace_id.clone();
        let requester_id = job.requester_id.clone();
        let events = self.events.clone();
        let publisher = self.publisher.clone();

        let forwarder = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                let data = json!({
                    "workspaceId": workspace_id,
                    "requesterId": requester_id,
                    "progress": progress,
                });
                events.send_event(&client_id, TRAIN_PROGRESS_EVENT, data.clone());
                publisher
                    .publish_progress(&client_id, TRAIN_PROGRESS_EVENT, &data)
                    .await;
            }
        });

        let result = self.trainer.train(job, tx).await;
        if let Err(e) = forwarder.await {
            warn!(error = %e, "Progress forwarder ended abnormally");
        }

        let result = result?;
        info!(
            workspace_id = %job.workspace_id,
            version = %result.version,
            "Training finished"
        );
        Ok(result)
    }

    pub async fn export(&self, job: &ExportJob) -> Result<String, AppError> {
        export_format(&job.format)?;
        Ok(self
            .trainer
            .export_model(&job.workspace_id, job.version.clone(), &job.format)
            .await?)
    }

    /// Tell the requester an export is available.
    pub async fn notify_export_complete(&self, job: &ExportJob, exported_path: &str) {
        let client_id = job.requester_id.to_string();
        let data = json!({
            "workspaceId": job.workspace_id,
            "requesterId": job.requester_id,
            "exportedPath": exported_path,
            "format": job.format,
        });
        self.events
            .send_event(&client_id, EXPORT_COMPLETE_EVENT, data.clone());
        self.publisher
            .publish_progress(&client_id, EXPORT_COMPLETE_EVENT, &data)
            .await;
    }

    /// Run `job` to its success envelope.
    pub async fn run(&self, job: &Job) -> Result<ResponseEnvelope, AppError> {
        match job {
            Job::Classify(job) => {
                let labels_and_ids = self.classify(job, Operation::Classify).await?;
                Ok(ResponseEnvelope::Classified {
                    requester_id: job.requester_id.clone(),
                    workspace_id: job.workspace_id.clone(),
                    labels_and_ids,
                })
            }
            Job::Train(job) => {
                let train_result = self.train(job).await?;
                Ok(ResponseEnvelope::Trained {
                    requester_id: job.requester_id.clone(),
                    workspace_id: job.workspace_id.clone(),
                    train_result,
                })
            }
            Job::Export(job) => {
                let exported_path = self.export(job).await?;
                Ok(ResponseEnvelope::Exported {
                    requester_id: job.requester_id.clone(),
                    workspace_id: job.workspace_id.clone(),
                    exported_path,
                    format: job.format.clone(),
                })
            }
        }
    }
}
