//! Periodic bot health checks
//!
//! Probes every bot assigned to this worker and records it as alive or dead.
//! Bots paused by an operator are left alone.

use crate::pool::TransportPool;
use botfleet_core::error::StoreError;
use botfleet_core::model::{BotId, BotRecord, BotStatus};
use botfleet_core::store::BotRegistry;
use botfleet_core::transport::TransportError;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const PROBE_INITIAL_BACKOFF_MS: u64 = 200;
const PROBE_MAX_BACKOFF_MS: u64 = 5_000;
const PROBE_MAX_RETRIES: usize = 3;
/// Pause between two probes, to stay clear of API flood limits.
const PROBE_SPACING: Duration = Duration::from_millis(100);

/// Result of one health check pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Bots whose probe succeeded
    pub alive: Vec<BotId>,
    /// Bots whose probe failed
    pub dead: Vec<BotId>,
    /// Paused bots that were not probed
    pub skipped: usize,
}

/// Probes this worker's bots
pub struct HealthChecker {
    worker: String,
    interval: Duration,
    registry: Arc<dyn BotRegistry>,
    transports: Arc<TransportPool>,
}

impl HealthChecker {
    /// Create a checker for the bots of `worker`, run every `interval`
    #[must_use]
    pub fn new(
        worker: impl Into<String>,
        interval: Duration,
        registry: Arc<dyn BotRegistry>,
        transports: Arc<TransportPool>,
    ) -> Self {
        Self {
            worker: worker.into(),
            interval,
            registry,
            transports,
        }
    }

    /// Check every `interval` until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker = %self.worker, interval = ?self.interval, "Health checker started");
        loop {
            match self.check_all().await {
                Ok(report) => info!(
                    worker = %self.worker,
                    alive = report.alive.len(),
                    dead = report.dead.len(),
                    skipped = report.skipped,
                    "Health check finished"
                ),
                Err(e) => error!(worker = %self.worker, error = %e, "Health check failed"),
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }
        }
        info!(worker = %self.worker, "Health checker stopped");
    }

    /// Probe every non-paused bot of this worker once
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the worker's bots cannot be listed.
    pub async fn check_all(&self) -> Result<HealthReport, StoreError> {
        let bots = self.registry.list_by_worker(&self.worker).await?;
        let mut report = HealthReport::default();

        for bot in bots {
            if bot.status == BotStatus::Paused {
                report.skipped += 1;
                continue;
            }

            let status = match self.probe(&bot).await {
                Ok(()) => BotStatus::Alive,
                Err(e) => {
                    warn!(bot_id = %bot.id, error = %e, "Bot failed health check");
                    self.transports.invalidate(&bot.id).await;
                    BotStatus::Dead
                }
            };

            if let Err(e) = self.registry.set_status(&bot.id, status).await {
                warn!(bot_id = %bot.id, error = %e, "Failed to record bot health");
            }

            match status {
                BotStatus::Alive => report.alive.push(bot.id),
                _ => report.dead.push(bot.id),
            }
            tokio::time::sleep(PROBE_SPACING).await;
        }

        Ok(report)
    }

    async fn probe(&self, bot: &BotRecord) -> Result<(), TransportError> {
        let transport = self.transports.get(bot).await?;

        let retry_strategy = ExponentialBackoff::from_millis(PROBE_INITIAL_BACKOFF_MS)
            .max_delay(Duration::from_millis(PROBE_MAX_BACKOFF_MS))
            .map(jitter)
            .take(PROBE_MAX_RETRIES);

        RetryIf::spawn(retry_strategy, || transport.probe(), TransportError::is_transient)
            .await
            .inspect(|_| debug!(bot_id = %bot.id, "Bot probe succeeded"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botfleet_core::cipher::CredentialError;
    use botfleet_core::store::memory::MemoryBotRegistry;
    use botfleet_core::testing::{mock_connector, mock_transport_dead, mock_transport_ok};
    use botfleet_core::transport::{BotTransport, MockBotTransport, MockTransportConnector};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn registry_with(bots: Vec<BotRecord>) -> Arc<MemoryBotRegistry> {
        let registry = Arc::new(MemoryBotRegistry::new());
        for bot in bots {
            registry.insert_bot(bot).await;
        }
        registry
    }

    fn checker(registry: Arc<MemoryBotRegistry>, transport: Arc<dyn BotTransport>) -> HealthChecker {
        let pool = Arc::new(TransportPool::new(Arc::new(mock_connector(transport)), 10));
        HealthChecker::new("w1", Duration::from_secs(3600), registry, pool)
    }

    #[tokio::test(start_paused = true)]
    async fn test_alive_bots_are_marked_alive() -> Result<(), StoreError> {
        let registry = registry_with(vec![
            BotRecord::new("a", "c", Some("w1")),
            BotRecord::new("other", "c", Some("w2")),
        ])
        .await;
        let checker = checker(registry.clone(), Arc::new(mock_transport_ok("a")));

        let report = checker.check_all().await?;
        assert_eq!(report.alive, vec![BotId::from("a")]);
        assert!(report.dead.is_empty());

        let bot = registry.get(&BotId::from("a")).await?;
        assert!(bot.is_some_and(|b| b.last_health_check.is_some()));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_credential_marks_dead_without_retry() -> Result<(), StoreError> {
        let registry = registry_with(vec![BotRecord::new("a", "c", Some("w1"))]).await;
        let dead = mock_transport_dead(TransportError::Api("Unauthorized".into()));
        let checker = checker(registry.clone(), Arc::new(dead));

        let report = checker.check_all().await?;
        assert_eq!(report.dead, vec![BotId::from("a")]);
        let bot = registry.get(&BotId::from("a")).await?;
        assert!(bot.is_some_and(|b| b.status == BotStatus::Dead));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() -> Result<(), StoreError> {
        let registry = registry_with(vec![BotRecord::new("a", "c", Some("w1"))]).await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let mut transport = MockBotTransport::new();
        transport.expect_probe().returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TransportError::Network("timeout".into()))
            } else {
                Ok(())
            }
        });

        let report = checker(registry, Arc::new(transport)).check_all().await?;
        assert_eq!(report.alive.len(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_bots_are_skipped() -> Result<(), StoreError> {
        let mut paused = BotRecord::new("a", "c", Some("w1"));
        paused.status = BotStatus::Paused;
        let registry = registry_with(vec![paused]).await;

        let mut transport = MockBotTransport::new();
        transport.expect_probe().never();

        let report = checker(registry, Arc::new(transport)).check_all().await?;
        assert_eq!(report.skipped, 1);
        assert!(report.alive.is_empty() && report.dead.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecryptable_credential_marks_dead() -> Result<(), StoreError> {
        let registry = registry_with(vec![BotRecord::new("a", "c", Some("w1"))]).await;
        let mut connector = MockTransportConnector::new();
        connector
            .expect_connect()
            .returning(|_| Err(TransportError::Credential(CredentialError::Decrypt)));
        let pool = Arc::new(TransportPool::new(Arc::new(connector), 10));
        let checker = HealthChecker::new("w1", Duration::from_secs(60), registry, pool);

        let report = checker.check_all().await?;
        assert_eq!(report.dead, vec![BotId::from("a")]);
        Ok(())
    }
}
