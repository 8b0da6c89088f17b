use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use rendezvous_peer::cli::{init_tracing, shutdown_signal, PeerArgs};
use rendezvous_peer::config::{ClientConfig, DEFAULT_INITIATOR_ROLE};
use rendezvous_peer::engine::{MediaKind, WebRtcEngine};
use rendezvous_peer::{run_session, Initiator, SessionConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = PeerArgs::parse();
    init_tracing(args.verbose)?;

    let config =
        ClientConfig::from_env(DEFAULT_INITIATOR_ROLE).context("invalid configuration")?;
    let engine = WebRtcEngine::new(&config.stun_urls)
        .await
        .context("failed to create peer connection")?;
    let mut initiator =
        Initiator::new(config.role.clone(), engine).with_tracks([MediaKind::Video]);

    let session = SessionConfig::from(&config);
    let report = run_session(&session, &mut initiator, shutdown_signal()).await?;
    info!(end = ?report.end, connected = report.connected, "initiator finished");
    Ok(())
}
