// Stake pool ledger - HTTP entry point

use stakepool_ledger::{app_state::AppState, config::Config, routes};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("═══════════════════════════════════════════════");
    tracing::info!("     🎲 Stake Pool Ledger (parimutuel)");
    tracing::info!("═══════════════════════════════════════════════");

    let config = Config::from_env();
    config.log_summary();

    let state = match AppState::open(config.clone()) {
        Ok(state) => state.shared(),
        Err(e) => {
            tracing::error!("❌ Failed to open ledger at {}: {}", config.data_dir, e);
            std::process::exit(1);
        }
    };
    let shutdown_state = state.clone();
    let app = routes::router(state);

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("❌ Cannot bind {}: {}", config.bind_addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("🚀 Server running on http://{}", config.bind_addr);

    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("❌ Failed to install CTRL+C handler: {}", e);
            return;
        }
        tracing::info!("🛑 Shutdown signal received, flushing ledger...");
        match shutdown_state.flush() {
            Ok(()) => tracing::info!("✅ Ledger flushed"),
            Err(e) => tracing::error!("❌ Failed to flush ledger: {}", e),
        }
    };

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        tracing::error!("❌ Server error: {}", e);
    }
    tracing::info!("👋 Goodbye!");
}
