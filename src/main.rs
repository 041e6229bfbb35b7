use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use idle_session_store::config::Config;
use idle_session_store::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    tracing::info!("✅ Configuration loaded successfully");

    let state = AppState::new(&config).await?;
    tracing::info!("✅ AppState initialized");

    let listener = match state.sessions.init_sub(config.session.db_index).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("❌ Failed to start expiration listener: {}", e);
            return Err(e.into());
        }
    };
    tracing::info!(
        "✅ Sessions: max age {}s, idle {}s, grace {}s",
        config.session.max_age.as_secs(),
        config.session.max_idle.as_secs(),
        config.session.idle_grace.as_secs()
    );
    tracing::info!("✅ All systems operational");

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutdown requested");
    listener.shutdown().await;

    Ok(())
}
