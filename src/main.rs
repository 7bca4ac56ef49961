//! warden - admission-controlled PostgreSQL gateway

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use warden::balancer::RoundRobin;
use warden::config::Config;
use warden::policy::StaticPolicy;
use warden::secret::FileSecretStore;
use warden::server::{Server, ServerOptions};
use warden::service::ServiceCache;

#[derive(Parser, Debug)]
#[command(name = "warden", version, about, long_about = None)]
struct Cli {
    /// Path to the gateway YAML configuration file
    #[arg(short = 'c', long = "config", env = "WARDEN_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install the aws-lc-rs crypto provider"))?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let options = ServerOptions::new(
        Arc::new(ServiceCache::new(config.service.clone())),
        Arc::new(StaticPolicy::new(config.policy.clone())),
        Arc::new(FileSecretStore::new(&config.secrets_dir)),
        Arc::new(RoundRobin::default()),
    )
    .with_cluster_certificate_secret(config.cluster_certificate_secret.clone())
    .with_drain_timeout(config.drain_timeout());

    let server = Server::new(options);
    server.run().await?;

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading cluster certificate");
                if let Err(e) = server.reload_cluster_certificate().await {
                    warn!(error = %e, "Failed to reload cluster certificate");
                }
            }
            _ = terminate.recv() => break,
            res = tokio::signal::ctrl_c() => {
                res?;
                break;
            }
        }
    }

    info!("Shutting down");
    server.close().await?;
    server.closed().await;
    Ok(())
}
