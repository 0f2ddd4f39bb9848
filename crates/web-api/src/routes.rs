//! 路由：WebSocket 升级入口与运维端点（/health、/metrics）。

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use application::rate_limiter::ActionClass;
use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use crate::protocol::MAX_FRAME_BYTES;
use crate::state::AppState;
use crate::ws_connection::serve_socket;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Response {
    if state.hub.is_draining() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    // 连接类限流在升级前检查
    let decision = state
        .rate_limiter
        .check(&remote.ip().to_string(), ActionClass::Connection)
        .await;
    if !decision.allowed {
        state.metrics.errors.fetch_add(1, Ordering::Relaxed);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            format!("retry after {} seconds", decision.retry_after_secs),
        )
            .into_response();
    }

    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| serve_socket(socket, remote, state))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "degraded": state.degraded(),
    }))
}

async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut snapshot = state.metrics.snapshot();
    if let serde_json::Value::Object(ref mut map) = snapshot {
        map.insert(
            "cache".to_owned(),
            serde_json::to_value(state.cache.stats()).unwrap_or_default(),
        );
        map.insert(
            "store_breaker".to_owned(),
            serde_json::to_value(state.store_breaker.snapshot()).unwrap_or_default(),
        );
        if let Some(bus_breaker) = &state.bus_breaker {
            map.insert(
                "bus_breaker".to_owned(),
                serde_json::to_value(bus_breaker.snapshot()).unwrap_or_default(),
            );
        }
    }
    Json(snapshot)
}
