//! 主应用程序入口
//!
//! 加载配置、按配置选择存储后端并启动 Axum Web API 服务。

use std::time::Duration;

use anyhow::Context;
use config::AppConfig;
use infrastructure::Infrastructure;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState};

/// 内存限流窗口的清理周期
const LIMITER_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("加载配置失败")?;
    if config.jwt.secret.is_none() {
        tracing::warn!("未配置 JWT 密钥，WebSocket 将信任查询参数中的身份（仅限开发环境）");
    }

    let infra = Infrastructure::connect(&config)
        .await
        .context("初始化存储后端失败")?;
    let maintenance = infra.spawn_maintenance(LIMITER_PURGE_INTERVAL);

    let state = AppState::assemble(&infra, &config);
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("无法监听 {addr}"))?;

    tracing::info!(addr = %addr, "中继服务启动");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = maintenance {
        handle.abort();
    }
    tracing::info!("中继服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "监听退出信号失败");
    }
}
