use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::extract::collect_page_context;
use crate::fetch::{fetch_html, FetchError};
use crate::messaging::{now_millis, SharedContextCache};
use crate::models::{ContextMessage, ExtractRequest, TabId};

/// State shared by the relay handlers.
#[derive(Clone)]
pub struct AppState {
    pub cache: SharedContextCache,
    pub insecure: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/messages", post(post_message))
        .route("/contexts/last", get(last_context))
        .route("/contexts/:tab_id", get(tab_context).delete(close_tab))
        .route("/extract", post(extract_endpoint))
        .with_state(state)
}

fn detail(status: StatusCode, detail: &str) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn post_message(State(state): State<AppState>, Json(message): Json<ContextMessage>) -> Response {
    let is_request = matches!(message, ContextMessage::RequestContext);
    let answered = state.cache.write().await.handle(message);
    match (answered, is_request) {
        (Some(entry), _) => (StatusCode::OK, Json(entry)).into_response(),
        (None, true) => detail(StatusCode::NOT_FOUND, "No page context recorded yet"),
        (None, false) => detail(StatusCode::BAD_REQUEST, "PAGE_CONTEXT requires a tab_id"),
    }
}

async fn last_context(State(state): State<AppState>) -> Response {
    match state.cache.read().await.last() {
        Some(entry) => (StatusCode::OK, Json(entry.clone())).into_response(),
        None => detail(StatusCode::NOT_FOUND, "No page context recorded yet"),
    }
}

async fn tab_context(State(state): State<AppState>, Path(tab_id): Path<TabId>) -> Response {
    match state.cache.read().await.get(tab_id) {
        Some(entry) => (StatusCode::OK, Json(entry.clone())).into_response(),
        None => detail(StatusCode::NOT_FOUND, "Unknown tab"),
    }
}

async fn close_tab(State(state): State<AppState>, Path(tab_id): Path<TabId>) -> Response {
    match state.cache.write().await.remove_tab(tab_id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => detail(StatusCode::NOT_FOUND, "Unknown tab"),
    }
}

async fn extract_endpoint(State(state): State<AppState>, Json(req): Json<ExtractRequest>) -> Response {
    match fetch_html(&req.url, state.insecure).await {
        Ok(html) => {
            let context = collect_page_context(&html, &req.url);
            if let Some(tab_id) = req.tab_id {
                state
                    .cache
                    .write()
                    .await
                    .record(tab_id, context.clone(), now_millis());
            }
            (StatusCode::OK, Json(context)).into_response()
        }
        Err(e) => {
            let (status, message) = match &e {
                FetchError::InvalidUrl(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
                FetchError::NotHtml => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "URL did not return HTML".to_string(),
                ),
                FetchError::Upstream(status) => (
                    StatusCode::BAD_GATEWAY,
                    format!("Upstream returned status {}", status),
                ),
                FetchError::Request(msg) => (
                    StatusCode::BAD_GATEWAY,
                    format!("Upstream request failed: {}", msg),
                ),
            };
            detail(status, &message)
        }
    }
}
