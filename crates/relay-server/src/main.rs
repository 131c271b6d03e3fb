use anyhow::Result;
use relay_server::config::Config;
use relay_server::engine::local::LocalEngine;
use relay_server::{api, init_media, state::AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::load()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("relay_server={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting sfu-relay signaling server...");

    let grace = config.signaling.worker_death_grace();
    let bind_address = config.bind_address.clone();
    let state = AppState::new(config);

    // Without a router every request answers NotReady, but the socket stays up
    match init_media(&state, &LocalEngine::new()).await {
        Ok(pool) => {
            tokio::spawn(async move {
                let worker_id = pool.wait_for_death().await;
                tracing::error!(
                    "Media worker {} died, exiting in {} ms",
                    worker_id,
                    grace.as_millis()
                );
                tokio::time::sleep(grace).await;
                std::process::exit(1);
            });
        }
        Err(e) => tracing::error!("Media initialization failed: {:#}", e),
    }

    // Build the router
    let app = api::create_router(state);

    // Start the server
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Listening on {}", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
