use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use flagrelay::config::AgentConfig;
use flagrelay::{admin_router, api_service, build_state, webhook_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cfg.log.pretty {
        builder.pretty().init();
    } else {
        builder.init();
    }

    let sdk_keys = cfg.sdk_keys.clone();
    let host = cfg.server.host.clone();
    let api_addr = format!("{}:{}", host, cfg.api.port);
    let admin_addr = format!("{}:{}", host, cfg.admin.port);
    let webhook_addr = format!("{}:{}", host, cfg.webhook.port);

    let state = build_state(cfg)?;
    state.registry.warm(&sdk_keys).await;

    let api_listener = TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind api listener on {api_addr}"))?;
    let admin_listener = TcpListener::bind(&admin_addr)
        .await
        .with_context(|| format!("failed to bind admin listener on {admin_addr}"))?;
    let webhook_listener = TcpListener::bind(&webhook_addr)
        .await
        .with_context(|| format!("failed to bind webhook listener on {webhook_addr}"))?;

    tracing::info!(api = %api_addr, admin = %admin_addr, webhook = %webhook_addr, "flagrelay listening");

    let api = axum::ServiceExt::into_make_service(api_service(state.clone()));
    let admin = admin_router(state.clone()).into_make_service();
    let webhook = webhook_router(state.clone()).into_make_service();

    let (api_res, admin_res, webhook_res) = tokio::join!(
        axum::serve(api_listener, api).with_graceful_shutdown(shutdown_signal()),
        axum::serve(admin_listener, admin).with_graceful_shutdown(shutdown_signal()),
        axum::serve(webhook_listener, webhook).with_graceful_shutdown(shutdown_signal()),
    );
    api_res.context("api server failed")?;
    admin_res.context("admin server failed")?;
    webhook_res.context("webhook server failed")?;

    state.registry.close_all();
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install shutdown handler");
    }
}
