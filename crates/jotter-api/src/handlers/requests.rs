//! Request submission, status and cancellation endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use jotter_core::{Identity, Request, RequestType};

use crate::auth::AuthUser;
use crate::error::{rate_limit_headers, ApiError};
use crate::services::{Admission, Submission};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitRequestBody {
    #[serde(rename = "type")]
    pub request_type: RequestType,
    pub input: String,
}

/// Body of the unauthenticated quick-submission route.
///
/// Rate limits key on `submitter_id` rather than a session.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickSubmitBody {
    pub submitter_id: String,
    pub space_id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    pub input: String,
}

fn admitted(admission: Admission) -> Response {
    (
        StatusCode::CREATED,
        rate_limit_headers(&admission.rate),
        Json(serde_json::json!({ "request": admission.request })),
    )
        .into_response()
}

/// Load a request the caller owns.
async fn owned_request(state: &AppState, auth: &AuthUser, id: Uuid) -> Result<Request, ApiError> {
    let request = state.lifecycle.get(id).await?;
    if request.user_id != auth.user_id {
        return Err(ApiError::Forbidden("request belongs to another user".to_string()));
    }
    Ok(request)
}

/// POST /api/v1/spaces/:space_id/requests
pub async fn submit_request(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(space_id): Path<Uuid>,
    Json(body): Json<SubmitRequestBody>,
) -> Result<Response, ApiError> {
    let admission = state
        .lifecycle
        .submit(
            &Identity::User(auth.user_id),
            Submission {
                space_id,
                user_id: auth.user_id,
                owner_login: Some(auth.login),
                request_type: body.request_type,
                input: body.input,
            },
        )
        .await?;

    Ok(admitted(admission))
}

/// POST /api/v1/quick/requests
pub async fn quick_submit(
    State(state): State<AppState>,
    Json(body): Json<QuickSubmitBody>,
) -> Result<Response, ApiError> {
    let admission = state
        .lifecycle
        .submit(
            &Identity::Submitter(body.submitter_id),
            Submission {
                space_id: body.space_id,
                user_id: body.user_id,
                owner_login: None,
                request_type: body.request_type,
                input: body.input,
            },
        )
        .await?;

    Ok(admitted(admission))
}

/// GET /api/v1/requests/:id
pub async fn get_request(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let request = owned_request(&state, &auth, id).await?;
    Ok(Json(serde_json::json!({ "request": request })))
}

/// POST /api/v1/requests/:id/cancel
pub async fn cancel_request(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let cancelled = state.lifecycle.cancel(id, auth.user_id).await?;
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}

/// GET /api/v1/requests/:id/position
pub async fn get_position(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let (request, position) = state.lifecycle.position(id).await?;
    if request.user_id != auth.user_id {
        return Err(ApiError::Forbidden("request belongs to another user".to_string()));
    }
    Ok(Json(serde_json::json!({ "position": position })))
}

/// GET /api/v1/spaces/:space_id/queue
pub async fn space_queue_status(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(space_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.lifecycle.space_status(space_id).await?))
}

/// GET /api/v1/queue/stats
pub async fn queue_stats(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.lifecycle.stats().await?))
}
