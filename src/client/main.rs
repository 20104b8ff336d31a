//! sync-probe
//!
//! Connects to a server, waits for the initial sync to finish and prints
//! how many documents each collection holds.
//!
//! ```text
//! sync-probe [config.toml]
//! ```

use std::path::PathBuf;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use virtool_sync::client::session;
use virtool_sync::shared::AppConfig;

const SYNC_TIMEOUT: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref())?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(server = %config.server_url, database = %config.database_path().display(), "Starting sync probe");
    let (handle, task) = session::start(config).await?;

    tokio::time::timeout(SYNC_TIMEOUT, handle.wait_synced())
        .await
        .map_err(|_| format!("not synced after {:?}", SYNC_TIMEOUT))??;

    let counts = handle
        .call(|dispatcher| {
            dispatcher
                .stores()
                .map(|store| (store.name().to_string(), store.len()))
                .collect::<Vec<_>>()
        })
        .await?;

    for (collection, count) in counts {
        println!("{:<12} {}", collection, count);
    }

    handle.shutdown();
    task.await?;
    Ok(())
}
