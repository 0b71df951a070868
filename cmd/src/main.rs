use clap::Parser;
use color_eyre::eyre::{eyre, Result, WrapErr};
use filesd::{Registry, SdFile, SledStore};
use filesd_gend::{api::AppState, http, Config};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let config = Config::parse();
    filesd_gend::setup_tracing(config.debug);
    tracing::debug!(?config, "starting");

    let store = SledStore::open(&config.db)
        .wrap_err_with(|| format!("failed to open database {}", config.db))?;
    let registry = Registry::load(store, SdFile::new(&config.sd_file))
        .wrap_err("failed to load persisted targets")?;
    let (registry, worker) = registry.spawn(config.queue_depth)?;

    let state = AppState {
        registry,
        request_timeout: config.request_timeout(),
    };
    http::server(config.listen, state).await?;

    // The worker stops once the router, holding the last handle, is dropped.
    let joined = tokio::task::spawn_blocking(move || worker.join());
    match tokio::time::timeout(http::SHUTDOWN_GRACE, joined).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(_))) => Err(eyre!("registry worker panicked")),
        Ok(Err(error)) => Err(error).wrap_err("failed to join registry worker"),
        Err(_) => {
            tracing::warn!("registry worker did not stop in time");
            Ok(())
        }
    }
}
