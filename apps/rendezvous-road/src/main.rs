use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rendezvous_road::{serve, websocket::SignalingState, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG wins; otherwise info.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("invalid rendezvous configuration")?;
    info!(
        rules = config.pairing_rules.len(),
        policy = ?config.role_conflict,
        "starting rendezvous server"
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("rendezvous server listening on {}", listener.local_addr()?);

    let state = SignalingState::new(&config);
    serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await
    .context("server error")?;

    Ok(())
}
