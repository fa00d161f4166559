mod activity_pub;
mod config;
mod error;
mod http;
mod supervisor;

use anyhow::{Context, Result};
use ractor::Actor;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

use crate::config::{Config, RuntimeConfig};
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let init = Config::from_env()?;
    let keyspace = fjall::Config::new(&init.data_dir)
        .open()
        .with_context(|| format!("unable to open keyspace at {}", init.data_dir.display()))?;
    let config = RuntimeConfig { init, keyspace };

    let (supervisor, actor_handle) =
        Actor::spawn(Some("supervisor".into()), Supervisor, config.clone()).await?;

    let server = tokio::spawn({
        let config = config.clone();
        async move { http::serve(&config).await }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received the terminate signal; stopping");
        }
        _ = sigint.recv() => {
            info!("Received the interrupt signal; stopping");
        }
        result = server => {
            result.context("http server task failed")??;
        }
    }

    supervisor.stop(None);
    actor_handle.await?;

    Ok(())
}
