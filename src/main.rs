use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use tributary::feeder::{
    FetchingImageUploader, FsMediaStorage, HtmlCleaner, HttpFetcher, ImageReplacer, Poller,
    SqlFeedStore,
};
use tributary::{db, Config, Database, Result};

#[tokio::main]
async fn main() {
    // Load configuration
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = match Config::load_with_env(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {path}: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // Initialize logging
    if let Err(e) = tributary::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        tributary::logging::init_console_only(&config.logging.level);
    }

    if let Err(e) = run(config).await {
        error!("tributary stopped: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    config.validate()?;
    info!("tributary {} ({} backend)", env!("CARGO_PKG_VERSION"), db::BACKEND_NAME);

    let database = Database::connect(&config.database).await?;

    if !config.poller.enabled {
        warn!("Poller disabled in configuration; nothing to do");
        database.close().await;
        return Ok(());
    }

    let fetcher = Arc::new(HttpFetcher::new(&config.fetcher)?);
    let storage = Arc::new(FsMediaStorage::new(
        &config.media.storage_path,
        &config.media.public_base_url,
    )?);
    let uploader = Arc::new(FetchingImageUploader::new(
        fetcher.clone(),
        storage,
        config.images.max_image_bytes,
    ));

    let poller = Arc::new(
        Poller::new(
            Arc::new(SqlFeedStore::new(database.pool().clone())),
            fetcher,
            Arc::new(HtmlCleaner::new()),
            uploader,
            ImageReplacer::from_config(&config.images)?,
        )
        .with_settings(&config.poller),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let poller = poller.clone();
        async move { poller.run(shutdown_rx).await }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
    let _ = shutdown_tx.send(true);

    if let Err(e) = handle.await {
        error!("Poller task ended abnormally: {}", e);
    }
    database.close().await;
    Ok(())
}
