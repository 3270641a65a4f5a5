use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;

use super::json_body;
use crate::app_state::AppState;
use crate::error::AppError;
use crate::models::envelope::ResponseEnvelope;
use crate::models::job::{ExportPayload, Job, TrainPayload};

/// POST /api/train: train a model on the workspace's labeled images.
///
/// Progress is pushed to the requester's event stream while this runs.
pub async fn train(
    State(state): State<AppState>,
    body: Result<Json<TrainPayload>, JsonRejection>,
) -> Result<Json<ResponseEnvelope>, AppError> {
    let job = state.runner.defaults().train_job(json_body(body)?)?;
    let envelope = state.runner.run(&Job::Train(job)).await?;
    Ok(Json(envelope))
}

/// POST /api/export: export a trained model.
pub async fn export(
    State(state): State<AppState>,
    body: Result<Json<ExportPayload>, JsonRejection>,
) -> Result<Json<ResponseEnvelope>, AppError> {
    let job = state.runner.defaults().export_job(json_body(body)?)?;
    let exported_path = state.runner.export(&job).await?;
    state
        .runner
        .notify_export_complete(&job, &exported_path)
        .await;

    Ok(Json(ResponseEnvelope::Exported {
        requester_id: job.requester_id,
        workspace_id: job.workspace_id,
        exported_path,
        format: job.format,
    }))
}
