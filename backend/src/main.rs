use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use land_registry_dashboard::chain::{ConnectionManager, NetworkDescriptor};
use land_registry_dashboard::config::AppConfig;
use land_registry_dashboard::gateway::IpfsGateway;
use land_registry_dashboard::handlers::{self, AppState};
use land_registry_dashboard::session::Session;
use land_registry_dashboard::wallet::{RpcWallet, WalletProvider};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let config = AppConfig::load()?;
    log::info!("Loaded config: {:?}", config);

    let wallet = Arc::new(RpcWallet::new(&config.rpc_url));
    let watcher = wallet.spawn_watcher(Duration::from_millis(config.wallet_poll_ms));

    let manager = ConnectionManager::new(
        Some(wallet as Arc<dyn WalletProvider>),
        NetworkDescriptor::from_config(&config),
        &config.contract_address,
    )
    .with_receipt_poll(
        Duration::from_millis(config.receipt_poll_ms),
        config.receipt_max_polls,
    );
    let session = Arc::new(Session::new(manager));
    session.start();
    match session.init().await {
        Ok(snapshot) if snapshot.is_connected() => {
            log::info!("Resumed session for {:?}", snapshot.account)
        }
        Ok(_) => log::info!("No authorized account yet, waiting for a connect request"),
        Err(e) => log::warn!("Initial connection failed: {}", e.user_message()),
    }

    let gateway = Arc::new(IpfsGateway::new(&config.gateway_api_url, &config.gateway_url));
    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let state = AppState::new(config, Arc::clone(&session), gateway);

    log::info!("Starting server on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        handlers::router(state).into_make_service(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    session.shutdown().await;
    watcher.abort();
    Ok(())
}
