//! 主应用程序入口
//!
//! 装配基础设施与网关，启动 WebSocket 服务，处理优雅停机。
//! 退出码：优雅停机 0，启动失败或未处理错误 1。

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use application::clock::SystemClock;
use application::housekeeping::Housekeeping;
use config::AppConfig;
use infrastructure::Infrastructure;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load()?;

    tracing::info!("正在连接基础设施...");
    let infrastructure = Infrastructure::connect(&config).await?;
    let state = web_api::build_state(&infrastructure, &config);

    // 启动预热：活跃房间、在线用户、最近消息
    match state
        .cache
        .warm(
            infrastructure.storage.rooms.as_ref(),
            infrastructure.storage.users.as_ref(),
            infrastructure.storage.messages.as_ref(),
        )
        .await
    {
        Ok(rooms) => tracing::info!(rooms, "缓存预热完成"),
        Err(err) => tracing::warn!(error = %err, "缓存预热失败，继续启动"),
    }

    // 后台任务：心跳、全局频道、维护清理
    let heartbeat = state.hub.spawn_heartbeat();
    let global_watch = state.hub.spawn_global_watch();
    let housekeeping = Arc::new(Housekeeping {
        users: infrastructure.storage.users.clone(),
        rooms: infrastructure.storage.rooms.clone(),
        members: infrastructure.storage.members.clone(),
        messages: infrastructure.storage.messages.clone(),
        rate_limiter: state.rate_limiter.clone(),
        clock: Arc::new(SystemClock),
    });
    let housekeeping_task = housekeeping.clone().spawn();

    let app = web_api::router(state.clone());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("聊天服务器启动在 ws://{addr}/ws");

    // 服务器放到后台任务里：长连接会阻塞 axum 的优雅关闭，
    // 必须先排空 socket 群才能让 serve 结束
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future(),
    );

    shutdown_signal().await;

    // 优雅停机：停止接受新连接后排空、清理、断开依赖
    tracing::info!("收到停机信号，开始排空");
    let _ = shutdown_tx.send(());
    state.hub.drain().await;
    server.await??;
    housekeeping.run_once().await;
    heartbeat.abort();
    global_watch.abort();
    housekeeping_task.abort();
    infrastructure.disconnect().await;

    tracing::info!("服务器已优雅退出");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
