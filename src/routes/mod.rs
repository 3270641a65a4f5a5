pub mod classify;
pub mod events;
pub mod health;
pub mod metrics;
pub mod train;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::app_state::AppState;
use crate::error::AppError;

pub const API_KEY_HEADER: &str = "x-api-key";

/// `/health` plus the key-protected `/api` routes.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/classify", post(classify::classify))
        .route("/testclassify", post(classify::test_classify))
        .route("/train", post(train::train))
        .route("/export", post(train::export))
        .route("/events/{client_id}", get(events::subscribe))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api", api)
        .with_state(state)
}

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !api_key_matches(request.headers(), &state.api_key) {
        return Err(AppError::Unauthorized);
    }
    Ok(next.run(request).await)
}

pub fn api_key_matches(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|provided| !expected.is_empty() && provided == expected)
}

/// Unwrap a JSON body, reporting malformed input in the API's error format.
pub(crate) fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| AppError::JsonDecode(rejection.body_text()))
}
