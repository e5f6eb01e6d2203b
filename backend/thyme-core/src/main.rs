// src/main.rs
use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use thyme_core::bc_client::BcClient;
use thyme_core::config::{load_bc_config, token_source, AppConfig};
use thyme_core::entry_store::EntryStore;
use thyme_core::pricing::{
    run_price_refresh, CoinGeckoSource, CoinbaseSource, PriceBoard, PriceFeed, PriceSource,
};
use thyme_core::server::{router, AppState};
use thyme_core::sync::{run_pending_sync, TimesheetSynchronizer};
use thyme_core::timer::TimerStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Setting tracing subscriber failed")?;
    info!("Tracing subscriber initialized.");

    let app_config = AppConfig::from_env().context("Loading THYME_* configuration failed")?;
    info!("App configuration loaded.");
    let bc_config = load_bc_config().context("Loading BC_* configuration failed")?;
    info!("Business Central configuration loaded.");

    let tokens = token_source(&bc_config).context("Setting up Business Central token failed")?;
    let bc_client = Arc::new(BcClient::new(bc_config, tokens)?);
    info!("Business Central client initialized.");
    let synchronizer = Arc::new(TimesheetSynchronizer::new(bc_client.clone()));

    let entries = Arc::new(Mutex::new(
        EntryStore::load(&app_config.entries_path()).context("Loading time entries failed")?,
    ));
    let mut timer = TimerStore::load(&app_config.timer_path()).context("Loading timer failed")?;
    if let Some(offset) = app_config.utc_offset() {
        timer = timer.with_offset(offset);
    }
    let timer = Arc::new(Mutex::new(timer));

    // --- Pricing ---
    let sources: Vec<Arc<dyn PriceSource>> = vec![
        Arc::new(CoinGeckoSource::new(&app_config.coingecko_api_base)?),
        Arc::new(CoinbaseSource::new(&app_config.coinbase_api_base)?),
    ];
    let price_feed = Arc::new(PriceFeed::new(sources));
    let price_board = Arc::new(PriceBoard::new(app_config.price_sats));
    tokio::spawn(run_price_refresh(
        price_board.clone(),
        price_feed,
        app_config.currencies.clone(),
        Duration::from_secs(app_config.price_refresh_secs),
    ));

    // --- Periodic sync of pending entries ---
    match &app_config.default_resource {
        Some(resource_no) => {
            tokio::spawn(run_pending_sync(
                synchronizer.clone(),
                entries.clone(),
                resource_no.clone(),
                Duration::from_secs(app_config.sync_interval_secs),
            ));
        }
        None => warn!("THYME_DEFAULT_RESOURCE not set; pending entries sync only on request."),
    }

    // Warm the reference data cache without blocking startup.
    let warmup_client = bc_client.clone();
    tokio::spawn(async move {
        if let Err(e) = warmup_client.get_resource_units_of_measure().await {
            error!("Initial unit-of-measure fetch failed: {}", e);
        }
        if let Err(e) = warmup_client.get_jobs().await {
            error!("Initial job fetch failed: {}", e);
        }
    });

    let addr = app_config.bind_addr;
    let tls_paths = app_config
        .tls_paths()
        .map(|(cert, key)| (cert.to_path_buf(), key.to_path_buf()));

    let app_state = AppState {
        config: Arc::new(app_config),
        synchronizer,
        entries,
        timer,
        prices: price_board,
    };
    info!("Application state initialized.");
    let app = router(app_state);

    match tls_paths {
        Some((cert_path, key_path)) => {
            let tls_config = RustlsConfig::from_pem_file(&cert_path, &key_path)
                .await
                .with_context(|| format!("Failed to load TLS cert/key from {:?}", cert_path))?;
            info!("Starting server on https://{}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await
                .context("HTTPS server failed")?;
        }
        None => {
            info!("Starting server on http://{}", addr);
            axum_server::bind(addr)
                .serve(app.into_make_service())
                .await
                .context("HTTP server failed")?;
        }
    }

    Ok(())
}
