use crate::transport::TelegramConnector;
use anyhow::{anyhow, Context};
use botfleet_core::cipher::CredentialCipher;
use botfleet_core::config::Settings;
use botfleet_core::rate_limit::RateLimiter;
use botfleet_core::store::r2::R2Storage;
use botfleet_core::store::redis::{self, RedisMediaCache, RedisProgressStore};
use botfleet_core::store::Stores;
use botfleet_runtime::{Deliverer, DispatchConfig, DispatchLoop, HealthChecker, TransportPool};
use std::sync::Arc;
use tracing::{info, warn};

/// Run one broadcast worker until Ctrl+C.
///
/// Starts the dispatch loop and the health checker, then on shutdown waits
/// for in-flight dispatch tasks to stop at their next status check.
///
/// # Errors
///
/// Returns an error if a store cannot be reached or the encryption key is invalid.
pub async fn run_worker(settings: Arc<Settings>) -> anyhow::Result<()> {
    let cipher = init_cipher(&settings)?;
    let storage = init_storage(&settings).await?;

    let redis = redis::connect(&settings.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    let progress = Arc::new(RedisProgressStore::new(
        Arc::clone(&redis),
        settings.progress_ttl_secs,
    ));
    let media_cache = Arc::new(RedisMediaCache::new(redis, settings.media_cache_ttl_secs));

    let stores = Stores::new(storage.clone(), progress, storage.clone());
    let transports = Arc::new(TransportPool::new(
        Arc::new(TelegramConnector::new(cipher)),
        settings.transport_cache_capacity,
    ));
    let limiter = Arc::new(RateLimiter::per_second(settings.messages_per_second));

    let dispatcher = Arc::new(DispatchLoop::new(
        DispatchConfig::from_settings(&settings),
        stores,
        Arc::clone(&transports),
        Deliverer::new(media_cache),
        limiter,
    ));
    let health = HealthChecker::new(
        settings.worker_name.clone(),
        settings.health_check_interval(),
        storage,
        transports,
    );

    let shutdown = dispatcher.shutdown_token();
    let dispatch_task = tokio::spawn(Arc::clone(&dispatcher).run());
    let health_token = shutdown.clone();
    let health_task = tokio::spawn(async move { health.run(health_token).await });

    info!(
        worker = %settings.worker_name,
        rate = settings.messages_per_second,
        "Worker is running..."
    );

    let signal = tokio::signal::ctrl_c().await;
    info!(worker = %settings.worker_name, "Shutting down, waiting for dispatch tasks");
    shutdown.cancel();

    let (dispatched, checked) = tokio::join!(dispatch_task, health_task);
    dispatched.context("Dispatch loop panicked")?;
    checked.context("Health checker panicked")?;
    signal.context("Failed to listen for Ctrl+C")?;

    info!(worker = %settings.worker_name, "Worker stopped");
    Ok(())
}

fn init_cipher(settings: &Settings) -> anyhow::Result<Option<CredentialCipher>> {
    match settings.encryption_key.as_deref() {
        Some(secret) => {
            let cipher = CredentialCipher::from_secret(secret).context("Invalid ENCRYPTION_KEY")?;
            Ok(Some(cipher))
        }
        None => {
            warn!("ENCRYPTION_KEY is not set, bot credentials are read as plaintext tokens");
            Ok(None)
        }
    }
}

async fn init_storage(settings: &Settings) -> anyhow::Result<Arc<R2Storage>> {
    let storage = R2Storage::new(settings)
        .await
        .context("Failed to initialize R2 Storage")?;
    info!("R2 Storage initialized.");
    storage
        .check_connection()
        .await
        .map_err(|e| anyhow!("R2 Storage connection check failed: {e}"))?;
    Ok(Arc::new(storage))
}
