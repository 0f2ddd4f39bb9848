//! 集成测试支撑：内存存储 + 进程内总线的完整服务器实例。

use std::net::SocketAddr;

use config::AppConfig;
use infrastructure::Infrastructure;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

pub async fn spawn_server() -> TestServer {
    let config = AppConfig::test_config();
    let infrastructure = Infrastructure::connect(&config)
        .await
        .expect("infrastructure");
    let state = web_api::build_state(&infrastructure, &config);
    let _ = state.hub.spawn_heartbeat();
    let _ = state.hub.spawn_global_watch();

    let app = web_api::router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
        .ok();
    });

    TestServer {
        addr,
        shutdown: Some(shutdown_tx),
    }
}

impl TestServer {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}
