//! HTTP API 与 SSE 事件流
//!
//! 路由：
//! - `POST   /api/sessions`              开始会话
//! - `GET    /api/sessions`              列出会话
//! - `GET    /api/sessions/:id`          会话快照
//! - `DELETE /api/sessions/:id`          结束会话
//! - `POST   /api/sessions/:id/actions`  提交动作
//! - `GET    /api/events`                SSE 事件流（`session_id`、`after` 可选）
//! - `GET    /api/health`

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::{OrchestratorError, TransportError};
use crate::flow::{FlowManager, SessionOptions};
use crate::session::{ActionKind, EventFilter, Session};

#[derive(Clone)]
struct AppState {
    flow: FlowManager,
}

/// 编排错误到 HTTP 状态码的映射
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::InvalidState { .. } => StatusCode::CONFLICT,
            OrchestratorError::Capacity(_) => StatusCode::TOO_MANY_REQUESTS,
            OrchestratorError::Transport(TransportError::ReplayUnsupported(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StartSessionRequest {
    timeout_ms: Option<u64>,
    caller: Option<String>,
    context: Value,
}

#[derive(Debug, Deserialize)]
struct SubmitActionRequest {
    kind: ActionKind,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct SubmitActionResponse {
    session_id: String,
    action_id: String,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    session_id: Option<String>,
    /// 事件日志游标（仅持久化事件日志支持）
    after: Option<u64>,
}

pub fn router(flow: FlowManager) -> Router {
    Router::new()
        .route("/api/sessions", get(api_sessions_list).post(api_sessions_start))
        .route("/api/sessions/:id", get(api_session_get).delete(api_session_end))
        .route("/api/sessions/:id/actions", axum::routing::post(api_actions_submit))
        .route("/api/events", get(api_events_sse))
        .route("/api/health", get(api_health))
        .with_state(AppState { flow })
}

/// POST /api/sessions
async fn api_sessions_start(
    State(state): State<AppState>,
    body: Option<Json<StartSessionRequest>>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let session = state
        .flow
        .start_session_with(SessionOptions {
            timeout: req.timeout_ms.map(Duration::from_millis),
            caller: req.caller,
            context: req.context,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /api/sessions
async fn api_sessions_list(State(state): State<AppState>) -> ApiResult<Json<Vec<Session>>> {
    Ok(Json(state.flow.list_sessions().await?))
}

/// GET /api/sessions/:id
async fn api_session_get(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Session>> {
    Ok(Json(state.flow.get_status(&id).await?))
}

/// DELETE /api/sessions/:id
async fn api_session_end(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Session>> {
    Ok(Json(state.flow.end_session(&id).await?))
}

/// POST /api/sessions/:id/actions
async fn api_actions_submit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SubmitActionRequest>,
) -> ApiResult<(StatusCode, Json<SubmitActionResponse>)> {
    let action_id = state.flow.submit_action(&id, req.kind, req.params).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitActionResponse {
            session_id: id,
            action_id,
        }),
    ))
}

/// GET /api/events：事件名为事件类型，id 为日志游标（有时）
async fn api_events_sse(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let filter = EventFilter::from(query.session_id);
    let subscription = match query.after {
        Some(cursor) => state.flow.subscribe_events_from(filter, cursor).await?,
        None => state.flow.subscribe_events(filter).await?,
    };

    let events = stream::unfold(subscription, |mut sub| async move {
        let event = sub.recv().await?;
        let mut sse = SseEvent::default().event(event.kind.as_str());
        if let Some(cursor) = sub.cursor() {
            sse = sse.id(cursor.to_string());
        }
        let sse = match sse.json_data(&event) {
            Ok(sse) => sse,
            Err(e) => {
                tracing::warn!(event_id = %event.id, "Failed to encode SSE event: {}", e);
                SseEvent::default().comment("encode error")
            }
        };
        Some((Ok(sse), sub))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keepalive")))
}

/// GET /api/health
async fn api_health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "live_sessions": state.flow.live_sessions().await,
        "event_log_durable": state.flow.is_event_log_durable(),
        "events": state.flow.event_stats(),
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    use super::*;
    use crate::collaborator::ScriptedCollaborator;
    use crate::config::AppConfig;

    async fn app(cfg: AppConfig) -> Router {
        let flow = FlowManager::builder(Arc::new(ScriptedCollaborator::succeeding()))
            .config(cfg)
            .build()
            .await
            .unwrap();
        router(flow)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_session_lifecycle_over_http() {
        let app = app(AppConfig::default()).await;

        let (status, session) = send(&app, Method::POST, "/api/sessions", Some(json!({"timeout_ms": 30000}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(session["status"], "active");
        let id = session["id"].as_str().unwrap().to_string();

        let (status, submitted) = send(
            &app,
            Method::POST,
            &format!("/api/sessions/{}/actions", id),
            Some(json!({"kind": "navigate", "params": {"url": "https://example.com"}})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(submitted["action_id"], "action_1");

        let (status, snapshot) = send(&app, Method::GET, &format!("/api/sessions/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["actions"][0]["kind"], "navigate");

        let (status, ended) = send(&app, Method::DELETE, &format!("/api/sessions/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ended["status"], "ended");

        let (status, _) = send(
            &app,
            Method::POST,
            &format!("/api/sessions/{}/actions", id),
            Some(json!({"kind": "wait", "params": {"ms": 1}})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, list) = send(&app, Method::GET, "/api/sessions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().map(|a| a.len()), Some(1));
    }

    #[tokio::test]
    async fn test_error_status_codes() {
        let mut cfg = AppConfig::default();
        cfg.session.max_sessions = Some(1);
        let app = app(cfg).await;

        let (status, body) = send(&app, Method::GET, "/api/sessions/session_missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("session_missing"));

        let (status, _) = send(&app, Method::POST, "/api/sessions", None).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = send(&app, Method::POST, "/api/sessions", None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

        let (status, _) = send(&app, Method::GET, "/api/events?after=3", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, health) = send(&app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["live_sessions"], 1);
        assert_eq!(health["event_log_durable"], false);
    }
}
