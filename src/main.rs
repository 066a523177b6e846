use knowledge_core::api;
use knowledge_core::app_state::AppState;
use knowledge_core::config::AppConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cfg = AppConfig::from_env().expect("failed to load configuration");
    let server_addr = cfg.server_addr.clone();

    let app_state = AppState::connect(cfg).await.expect("failed to initialize application state");
    let app = api::create_router(app_state);

    let listener = tokio::net::TcpListener::bind(&server_addr).await?;
    info!("listening on {server_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
        })
        .await?;

    info!("server shut down cleanly");
    Ok(())
}
