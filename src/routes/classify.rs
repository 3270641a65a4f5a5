use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;

use super::json_body;
use crate::app_state::AppState;
use crate::error::AppError;
use crate::models::job::{ClassifyJob, Operation};
use crate::models::label::LabelToIds;

/// POST /api/classify: classify images and keep them for training.
pub async fn classify(
    State(state): State<AppState>,
    body: Result<Json<ClassifyJob>, JsonRejection>,
) -> Result<Json<LabelToIds>, AppError> {
    run(&state, json_body(body)?, Operation::Classify).await
}

/// POST /api/testclassify: classify without persisting anything.
pub async fn test_classify(
    State(state): State<AppState>,
    body: Result<Json<ClassifyJob>, JsonRejection>,
) -> Result<Json<LabelToIds>, AppError> {
    run(&state, json_body(body)?, Operation::Test).await
}

async fn run(
    state: &AppState,
    job: ClassifyJob,
    operation: Operation,
) -> Result<Json<LabelToIds>, AppError> {
    tracing::info!(
        workspace_id = %job.workspace_id,
        images = job.images.len(),
        categories = job.categories.len(),
        operation = %operation,
        "Classification requested"
    );
    let labels = state.runner.classify(&job, operation).await?;
    Ok(Json(labels))
}
