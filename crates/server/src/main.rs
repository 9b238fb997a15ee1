/// Bot Commander - Server
///
/// Bot 与控制面板之间的 WebSocket 中继服务，附带只读 REST 接口

mod api;
mod app_state;
mod auth;
mod config;
mod metrics;
mod telemetry;
mod ws;

use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

use crate::{
    app_state::AppState,
    auth::FileCredentialVerifier,
    telemetry::FileTelemetryStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载环境变量
    dotenvy::dotenv().ok();

    // 加载配置
    let cfg = config::Config::from_env()?;

    // 初始化日志（RUST_LOG 优先，其次 LOG_LEVEL）
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level)),
        )
        .init();

    info!("🚀 启动 Bot Commander Server...");
    info!("✅ 配置加载成功");

    let verifier = Arc::new(FileCredentialVerifier::new(&cfg.bot_keys_file));
    let store = Arc::new(FileTelemetryStore::new(&cfg.bot_data_dir));
    info!("🔑 凭据文件: {}", cfg.bot_keys_file.display());
    info!("📁 遥测数据目录: {}", cfg.bot_data_dir.display());

    let app_state = AppState::new(cfg.clone(), verifier, store)?;
    if app_state.config.jwt_secret().is_none() {
        info!("⚠️ 未配置 JWT_SECRET，/api 接口不可用");
    }

    // 启动定时落盘任务
    let flusher = app_state.flusher();
    let flush_task = flusher.clone().spawn(cfg.flush_interval(), app_state.shutdown.clone());
    info!(
        "⏰ 遥测数据落盘间隔: 每 {} 分钟",
        cfg.bot_data_save_interval
    );

    // 启动心跳监控（可选）
    let monitor_task = cfg.heartbeat_timeout().map(|timeout| {
        info!(
            "✅ 心跳监控任务已启动（{}秒超时，每{}秒检查一次）",
            timeout.as_secs(),
            cfg.heartbeat_check_interval_secs
        );
        app_state.registry.clone().start_idle_monitor(
            timeout,
            cfg.heartbeat_check_interval(),
            app_state.shutdown.clone(),
        )
    });

    let app = build_app(app_state.clone());

    // 启动服务器
    let addr = format!("{}:{}", cfg.api_host, cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🎯 服务器监听在 http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(app_state.shutdown.clone()))
    .await?;

    // 后台任务退出后再做最后一次落盘
    if let Err(e) = flush_task.await {
        error!("定时落盘任务异常退出: {}", e);
    }
    if let Some(task) = monitor_task {
        let _ = task.await;
    }
    let report = flusher.flush().await;
    info!(
        "💾 最终落盘完成: {} 组 {} 条记录，{} 组失败，{} 组丢弃",
        report.groups_written, report.records_written, report.groups_failed, report.groups_dropped
    );
    info!("👋 服务器已停止");

    Ok(())
}

/// 构建应用路由
pub fn build_app(state: AppState) -> Router {
    // 设置CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/ws", get(ws::handle_websocket))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .nest("/api", api::api_routes(state.clone()))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 等待 Ctrl+C 或 SIGTERM，然后通知所有任务退出
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("监听 Ctrl+C 失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("监听 SIGTERM 失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => {},
    }

    info!("🛑 收到退出信号，正在关闭...");
    shutdown.cancel();
}

/// 根路径同时接受 WebSocket 升级
async fn root_handler(
    ws: Option<WebSocketUpgrade>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    match ws {
        Some(ws) => ws::upgrade(ws, connect_info, &headers, state),
        None => "Bot Commander Server".into_response(),
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => ([(CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => {
            error!("导出指标失败: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
