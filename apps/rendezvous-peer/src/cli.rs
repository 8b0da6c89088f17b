use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Chatty dependencies kept at `info` unless `RUST_LOG` asks otherwise.
const NOISY_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "tungstenite",
    "tokio_tungstenite",
];

/// Flags shared by the peer binaries. Everything else comes from the
/// environment.
#[derive(Debug, Parser)]
#[command(version)]
pub struct PeerArgs {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

pub fn default_filter(verbose: u8) -> String {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    if verbose == 0 {
        return level.to_string();
    }
    let mut filter = level.to_string();
    for target in NOISY_TARGETS {
        filter.push_str(&format!(",{target}=info"));
    }
    filter
}

pub fn init_tracing(verbose: u8) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));
    fmt()
        .with_env_filter(filter)
        .with_target(verbose > 0)
        .try_init()
        .map_err(|err| anyhow!(err))
}

/// Resolves on ctrl-c. If the handler cannot be installed it never
/// resolves, leaving the session to end on its own.
pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received"),
        Err(err) => {
            tracing::warn!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await
        }
    }
}
