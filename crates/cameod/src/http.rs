//! HTTP boundary: avatarization endpoint plus the kiosk session routes.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cameo_avatar::{AvatarError, AvatarOutcome, Avatarizer, DataUri};
use cameo_core::raster::{decode_image, encode_png};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::engine::Pipeline;
use crate::session::{InMemorySessionStore, Session, SessionStatus, SessionStore};

pub struct AppState {
    pipeline: Arc<Pipeline>,
    /// Present whenever an API key is configured, independent of the pipeline switch.
    avatar: Option<Arc<Avatarizer>>,
    store: Arc<InMemorySessionStore>,
    session: Mutex<Option<Arc<Session>>>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, avatar: Option<Arc<Avatarizer>>) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            avatar,
            store: Arc::new(InMemorySessionStore::new()),
            session: Mutex::new(None),
        })
    }

    /// Tear down the running session, if any.
    pub async fn shutdown(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.teardown().await;
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/avatarize", post(avatarize).get(avatarize_status))
        .route("/session", post(capture).delete(end_session))
        .route("/session/composite", get(composite))
        .route("/session/print", post(print))
        .with_state(state)
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

fn bad_request(message: &str) -> Response {
    reply(StatusCode::BAD_REQUEST, json!({ "error": message }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "avatar": state.avatar.is_some(),
        "characters": state.pipeline.catalog().ids().count(),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvatarizeRequest {
    image_data: Option<String>,
    prompt: Option<String>,
    filename: Option<String>,
}

fn missing_key() -> Response {
    reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "error": "Avatar API key is not configured" }),
    )
}

fn outcome_response(outcome: AvatarOutcome) -> Response {
    match outcome {
        AvatarOutcome::Completed {
            task_id,
            avatar_data_url,
            reused,
        } => {
            let mut body = json!({
                "status": "completed",
                "taskId": task_id,
                "avatarDataUrl": avatar_data_url,
            });
            if reused {
                body["reused"] = Value::Bool(true);
            }
            reply(StatusCode::OK, body)
        }
        AvatarOutcome::Pending { task_id, reused } => {
            let mut body = json!({ "status": "pending", "taskId": task_id });
            if reused {
                body["reused"] = Value::Bool(true);
            }
            reply(StatusCode::ACCEPTED, body)
        }
        AvatarOutcome::Failed { task_id, error } => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "status": "failed", "taskId": task_id, "error": error }),
        ),
    }
}

fn error_response(err: &AvatarError) -> Response {
    match err {
        AvatarError::InvalidDataUri => bad_request("imageData must be a base64 data URL"),
        AvatarError::InvalidTaskId => bad_request("taskId is not a valid task id"),
        AvatarError::NoOutputFile { task_id } => reply(
            StatusCode::BAD_GATEWAY,
            json!({ "status": "completed", "taskId": task_id, "error": "No output file found" }),
        ),
        err if err.is_upstream() => {
            reply(StatusCode::BAD_GATEWAY, json!({ "error": err.sanitized() }))
        }
        err => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": err.sanitized() }),
        ),
    }
}

async fn avatarize(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AvatarizeRequest>,
) -> Response {
    let Some(avatar) = state.avatar.as_ref() else {
        return missing_key();
    };
    let Some(image_data) = req.image_data.filter(|d| !d.is_empty()) else {
        return bad_request("imageData is required");
    };
    match avatar
        .submit(&image_data, req.prompt.as_deref(), req.filename.as_deref())
        .await
    {
        Ok(outcome) => outcome_response(outcome),
        Err(err) => {
            tracing::warn!(error = %err, "avatarize request failed");
            error_response(&err)
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    task_id: Option<String>,
}

async fn avatarize_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let Some(avatar) = state.avatar.as_ref() else {
        return missing_key();
    };
    let Some(task_id) = query.task_id.filter(|t| !t.is_empty()) else {
        return bad_request("taskId is required");
    };
    match avatar.status(&task_id).await {
        Ok(outcome) => outcome_response(outcome),
        Err(err) => {
            tracing::warn!(task_id = %task_id, error = %err, "avatar status lookup failed");
            error_response(&err)
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptureRequest {
    image_data: Option<String>,
    character_id: Option<String>,
}

/// Start a new session for one captured photo; any previous session is torn down.
async fn capture(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CaptureRequest>,
) -> Response {
    let Some(uri) = req.image_data.as_deref().and_then(DataUri::parse) else {
        return bad_request("imageData must be a base64 data URL");
    };
    let photo = match decode_image(&uri.bytes) {
        Ok(photo) => photo,
        Err(err) => {
            tracing::warn!(error = %err, "captured photo could not be decoded");
            return bad_request("imageData is not a decodable image");
        }
    };

    let mut slot = state.session.lock().await;
    if let Some(previous) = slot.take() {
        previous.teardown().await;
    }
    state.store.clear();
    state.store.add_shot(photo);
    if let Some(character) = req.character_id {
        state.store.select_character(character);
    }

    let store: Arc<dyn SessionStore> = state.store.clone();
    let session = Session::start(Arc::clone(&state.pipeline), store);
    let version = session.process();
    let id = session.id();
    *slot = Some(session);

    reply(
        StatusCode::ACCEPTED,
        json!({ "sessionId": id.to_string(), "version": version }),
    )
}

async fn composite(State(state): State<Arc<AppState>>) -> Response {
    let slot = state.session.lock().await;
    let Some(session) = slot.as_ref() else {
        return reply(StatusCode::NOT_FOUND, json!({ "error": "no active session" }));
    };
    let status = state.store.status();
    let Some(latest) = session.slot().latest() else {
        return reply(
            StatusCode::ACCEPTED,
            json!({ "sessionId": session.id().to_string(), "status": status }),
        );
    };
    let png = match encode_png(&latest.result.image) {
        Ok(png) => png,
        Err(err) => {
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": err.to_string() }),
            )
        }
    };
    let code = if status == SessionStatus::Processing {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    reply(
        code,
        json!({
            "sessionId": session.id().to_string(),
            "version": latest.version,
            "status": status,
            "characterId": latest.result.key.character_id,
            "compositeDataUrl": DataUri::encode("image/png", &png),
        }),
    )
}

async fn print(State(state): State<Arc<AppState>>) -> Response {
    let Some(composite) = state.store.composite() else {
        return reply(StatusCode::CONFLICT, json!({ "error": "no composite to print" }));
    };
    let pipeline = Arc::clone(&state.pipeline);
    let character = composite.key.character_id.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        pipeline.compose_print(&composite.image, &character)
    })
    .await;
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": err.to_string() }),
            )
        }
    };
    match encode_png(&outcome.image) {
        Ok(png) => reply(
            StatusCode::OK,
            json!({
                "printDataUrl": DataUri::encode("image/png", &png),
                "warning": outcome.warning,
            }),
        ),
        Err(err) => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": err.to_string() }),
        ),
    }
}

async fn end_session(State(state): State<Arc<AppState>>) -> StatusCode {
    state.shutdown().await;
    state.store.clear();
    StatusCode::NO_CONTENT
}
