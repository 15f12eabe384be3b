//! geostore server binary

use geostore_engine::{Backend, Storage};
use geostore_server::{GeoStoreServer, LogFormat, ServerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_args()?;
    init_tracing(config.log_format);

    info!("Starting geostore server");
    info!("Backend: {:?}", config.backend);
    info!("Bind address: {}", config.bind);

    if config.backend == Backend::Fjall {
        info!("Data directory: {}", config.data_dir.display());
        if !config.data_dir.exists() {
            std::fs::create_dir_all(&config.data_dir)?;
            info!("Created data directory: {}", config.data_dir.display());
        }
    }

    let storage = Storage::open(config.backend, config.storage_config())?;
    info!("Storage initialized");

    GeoStoreServer::new(storage).serve(config.bind).await?;
    info!("Server shutdown gracefully");
    Ok(())
}
