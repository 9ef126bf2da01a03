//! burrowd — user-space VPN daemon.

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use burrow_core::BurrowConfig;
use burrowd::{tap, transport};

#[tokio::main]
async fn main() -> Result<()> {
    // Verbosity is taken from RUST_LOG; without it, log lifecycle events
    // and above.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = BurrowConfig::bootstrap().context("config bootstrap")?;
    let config = BurrowConfig::load().context("config load")?;
    if config.peers.is_empty() {
        bail!(
            "no [[peers]] configured in {} — add an endpoint and a 64-hex-char key",
            config_path.display()
        );
    }

    tracing::info!(
        interface = %config.network.interface,
        mtu = config.network.mtu,
        bind = %config.network.bind,
        peers = config.peers.len(),
        "burrowd starting"
    );

    let registry = tap::new_registry();
    let (shutdown_tx, _) = broadcast::channel(1);

    let mut supervisors = JoinSet::new();
    for peer_cfg in config.peers.clone() {
        supervisors.spawn(transport::supervise_peer(
            registry.clone(),
            config.network.clone(),
            peer_cfg,
            shutdown_tx.subscribe(),
        ));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            let _ = shutdown_tx.send(());
            while supervisors.join_next().await.is_some() {}
        }
        result = supervisors.join_next() => {
            // Supervisors run forever; an exit here is a failure.
            tracing::error!(?result, "peer supervisor exited");
        }
    }

    Ok(())
}
