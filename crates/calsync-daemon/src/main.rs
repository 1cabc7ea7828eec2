mod config;

use anyhow::Context;
use calsync_caldav::{CalDav, CalDavClient};
use calsync_imap::{ImapMailSource, MailSource};
use calsync_jobs::{Scheduler, SyncRunner};
use calsync_security::SettingsCipher;
use calsync_store::Store;
use config::ConfigManager;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_manager = ConfigManager::new().context("initialize config manager")?;
    let config = config_manager.load().context("load app config")?;
    tracing::info!(config = %config_manager.config_path().display(), "configuration loaded");

    let cipher = Arc::new(
        SettingsCipher::from_env().context("load settings encryption key (CALSYNC_SECRET_KEY)")?,
    );

    let db_path = config_manager.data_dir().join(&config.database.file_name);
    let store = Store::connect(&db_path).await.context("open sqlite store")?;
    store
        .initialize()
        .await
        .context("apply schema upgrades")?;

    let caldav: Arc<dyn CalDav> = Arc::new(CalDavClient::new());
    let mail: Arc<dyn MailSource> = Arc::new(ImapMailSource::new());
    let runner = Arc::new(SyncRunner::new(store, caldav, mail, cipher));
    let scheduler = Scheduler::new();

    let status = runner
        .clone()
        .configure_auto_sync(&scheduler, config.auto_sync.clone());
    tracing::info!(
        enabled = status.enabled,
        interval_minutes = status.interval_minutes,
        "auto-sync configured"
    );

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    tracing::info!("shutting down");
    scheduler.shutdown();
    Ok(())
}
