use anyhow::{Context, Result};
use rollcall_core::IdentityRegistry;
use tracing_subscriber::EnvFilter;

mod collection;
mod config;
mod dbus_interface;
mod jobs;
mod recognition;
#[cfg(test)]
mod testutil;
mod training;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::load().context("failed to load configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        data_dir = %config.data_dir.display(),
        registry = %config.registry_path.display(),
        names = %config.names_path().display(),
        "configuration loaded"
    );

    let registry = IdentityRegistry::load(&config.registry_path);
    tracing::info!(persons = registry.len(), "identity registry loaded");

    let jobs = jobs::JobManager::new(config, registry);
    let service = dbus_interface::RollcallService::new(jobs.clone());

    let _conn = zbus::connection::Builder::session()?
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = dbus_interface::BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    tokio::task::spawn_blocking(move || jobs.shutdown()).await?;
    Ok(())
}
