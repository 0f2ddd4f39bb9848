//! 网关层
//!
//! WebSocket 协议面：信封类型、连接枢纽、帧路由，以及
//! /health、/metrics 运维端点。

pub mod dispatch;
pub mod hub;
pub mod metrics;
pub mod protocol;
pub mod routes;
pub mod state;
mod ws_connection;

pub use hub::ConnectionHub;
pub use metrics::Metrics;
pub use routes::router;
pub use state::{build_state, AppState};
