use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use rendezvous_peer::cli::{init_tracing, shutdown_signal, PeerArgs};
use rendezvous_peer::config::{ClientConfig, DEFAULT_RESPONDER_ROLE};
use rendezvous_peer::engine::WebRtcEngine;
use rendezvous_peer::{run_session, Responder, SessionConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = PeerArgs::parse();
    init_tracing(args.verbose)?;

    let config =
        ClientConfig::from_env(DEFAULT_RESPONDER_ROLE).context("invalid configuration")?;
    let engine = WebRtcEngine::new(&config.stun_urls)
        .await
        .context("failed to create peer connection")?;
    let mut responder = Responder::new(config.role.clone(), engine);

    // Received tracks are reported through the session's engine event log.
    let session = SessionConfig::from(&config);
    let report = run_session(&session, &mut responder, shutdown_signal()).await?;
    info!(end = ?report.end, connected = report.connected, "responder finished");
    Ok(())
}
