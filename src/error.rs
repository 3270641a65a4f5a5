use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::broker::BrokerError;
use crate::models::envelope::ErrorBody;
use crate::models::job::MissingIds;
use crate::services::classifier::ClassifyError;
use crate::services::storage::StoreError;
use crate::services::trainer::TrainerError;

/// Error kinds surfaced to callers, over HTTP and as error envelopes.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Invalid JSON: {0}")]
    JsonDecode(String),

    #[error("{0}")]
    MessageProcessing(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Classification(#[from] ClassifyError),

    #[error("{0}")]
    Configuration(String),

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("{0}")]
    Training(String),

    #[error("{0}")]
    Export(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("Invalid or missing API key")]
    Unauthorized,

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Broker(BrokerError::CircuitOpen) => "SERVICE_UNAVAILABLE",
            AppError::Broker(BrokerError::Serialize(_)) => "UNEXPECTED_ERROR",
            AppError::Broker(_) => "BROKER_CONNECTION_ERROR",
            AppError::JsonDecode(_) => "JSON_DECODE_ERROR",
            AppError::MessageProcessing(_) => "MESSAGE_PROCESSING_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Classification(ClassifyError::NoProviders) => "CONFIGURATION_ERROR",
            AppError::Classification(_) => "CLASSIFICATION_ERROR",
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
            AppError::NotFound { .. } => "RESOURCE_NOT_FOUND",
            AppError::Training(_) => "TRAINING_ERROR",
            AppError::Export(_) => "EXPORT_ERROR",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::Unauthorized => "INVALID_API_KEY",
            AppError::Internal(_) => "UNEXPECTED_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Broker(BrokerError::Serialize(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Broker(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::JsonDecode(_) | AppError::MessageProcessing(_) | AppError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Classification(ClassifyError::NoProviders) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Classification(_) => StatusCode::BAD_GATEWAY,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Configuration(_)
            | AppError::Training(_)
            | AppError::Export(_)
            | AppError::Storage(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Structured extras for the error body.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::NotFound { resource, id } => Some(json!({"resource": resource, "id": id})),
            AppError::Classification(ClassifyError::AllProvidersFailed { attempted, .. }) => {
                Some(json!({"attemptedProviders": attempted}))
            }
            AppError::Broker(BrokerError::Unavailable { attempts, .. })
            | AppError::Broker(BrokerError::ConnectFailed { attempts, .. }) => {
                Some(json!({"attempts": attempts}))
            }
            _ => None,
        }
    }

    pub fn to_error_body(&self, correlation_id: Option<String>) -> ErrorBody {
        ErrorBody::new(self.code(), self.to_string())
            .with_correlation_id(correlation_id)
            .with_details(self.details())
    }
}

impl From<TrainerError> for AppError {
    fn from(e: TrainerError) -> Self {
        match e {
            TrainerError::WorkspaceNotFound(id) => AppError::NotFound {
                resource: "workspace",
                id,
            },
            TrainerError::ModelNotFound { workspace, version } => AppError::NotFound {
                resource: "model",
                id: match version {
                    Some(version) => format!("model_{workspace}_{version}"),
                    None => format!("model_{workspace}"),
                },
            },
            TrainerError::TrainingFailed(msg) => AppError::Training(msg),
            TrainerError::ExportFailed(msg) => AppError::Export(msg),
            TrainerError::UnsupportedFormat(format) => {
                AppError::Validation(format!("unsupported export format: {format}"))
            }
            TrainerError::Io(e) => AppError::Internal(format!("trainer I/O error: {e}")),
        }
    }
}

impl From<MissingIds> for AppError {
    fn from(e: MissingIds) -> Self {
        AppError::MessageProcessing(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::JsonDecode(e.to_string())
    }
}

impl From<garde::Report> for AppError {
    fn from(report: garde::Report) -> Self {
        AppError::Validation(report.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        } else {
            tracing::warn!(code = self.code(), error = %self, "Request rejected");
        }
        let body = ErrorResponse {
            error: self.to_error_body(None),
        };
        (status, Json(body)).into_response()
    }
}
