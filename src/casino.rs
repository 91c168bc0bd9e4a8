//! Service container
//!
//! Builds every component from a `CasinoConfig` over one store, one lock
//! table and one clock, so binaries and tests wire the engine the same way.

use std::sync::Arc;

use crate::{
    cashier::{Cashier, PaymentGateway},
    common::clock::{Clock, SystemClock},
    config::CasinoConfig,
    errors::{CasinoResult, ConfigurationError},
    fairness::{CommitmentRegistry, FairnessWorker},
    ledger::Ledger,
    levels::LevelRewards,
    locks::KeyedLocks,
    metrics::CasinoMetrics,
    recovery::{RecoverySweep, RecoveryWorker},
    sessions::SessionManager,
    settlement::SettlementEngine,
    storage::{KvStore, OptimizedStorage},
    wager_store::WagerStore,
};

pub struct Casino {
    pub config: CasinoConfig,
    pub store: Arc<dyn KvStore>,
    pub clock: Arc<dyn Clock>,
    pub locks: Arc<KeyedLocks>,
    pub metrics: Arc<CasinoMetrics>,
    pub ledger: Arc<Ledger>,
    pub registry: Arc<CommitmentRegistry>,
    pub settlement: Arc<SettlementEngine>,
    pub sessions: Arc<SessionManager>,
    pub recovery: Arc<RecoverySweep>,
    pub levels: Arc<LevelRewards>,
    pub wagers: WagerStore,
}

/// Handles to the background loops; dropping them does not stop the loops
pub struct Workers {
    pub fairness: Arc<FairnessWorker>,
    pub recovery: Arc<RecoveryWorker>,
}

impl Workers {
    pub fn stop(&self) {
        self.fairness.stop();
        self.recovery.stop();
    }
}

impl Casino {
    pub fn new(
        config: CasinoConfig,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
    ) -> CasinoResult<Self> {
        config.validate()?;

        let metrics = Arc::new(CasinoMetrics::new().map_err(|e| {
            ConfigurationError::LoadFailed(format!("Failed to register metrics: {}", e))
        })?);
        let locks = Arc::new(KeyedLocks::new());
        let ledger = Arc::new(Ledger::new(store.clone(), locks.clone(), clock.clone()));
        let registry = Arc::new(CommitmentRegistry::new(
            store.clone(),
            clock.clone(),
            metrics.clone(),
            config.period_duration(),
        ));
        let settlement = Arc::new(SettlementEngine::new(
            store.clone(),
            ledger.clone(),
            registry.clone(),
            config.games.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            ledger.clone(),
            registry.clone(),
            locks.clone(),
            config.games.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let recovery = Arc::new(RecoverySweep::new(
            store.clone(),
            ledger.clone(),
            sessions.clone(),
            locks.clone(),
            clock.clone(),
            metrics.clone(),
            config.recovery.clone(),
        ));
        let levels = Arc::new(LevelRewards::new(store.clone(), ledger.clone(), clock.clone()));

        Ok(Self {
            wagers: WagerStore::new(store.clone()),
            config,
            store,
            clock,
            locks,
            metrics,
            ledger,
            registry,
            settlement,
            sessions,
            recovery,
            levels,
        })
    }

    /// Open the RocksDB store named in the config, on the system clock
    pub fn open(config: CasinoConfig) -> CasinoResult<Self> {
        let store = Arc::new(OptimizedStorage::new(&config.storage.data_directory)?);
        tracing::info!(path = %config.storage.data_directory, "Opened casino database");
        Self::new(config, store, Arc::new(SystemClock))
    }

    pub fn cashier(&self, gateway: Arc<dyn PaymentGateway>) -> Cashier {
        Cashier::new(
            self.store.clone(),
            self.ledger.clone(),
            self.locks.clone(),
            gateway,
            self.config.cashier.clone(),
            self.clock.clone(),
        )
    }

    /// Start the fair-play sweep and the recovery sweep
    pub fn start_workers(&self) -> Workers {
        Workers {
            fairness: FairnessWorker::spawn(self.registry.clone(), self.config.sweep_interval()),
            recovery: RecoveryWorker::spawn(self.recovery.clone(), self.config.recovery_interval()),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::common::clock::ManualClock;
    use crate::storage::MemoryStorage;
    use chrono::Utc;

    pub fn casino_with(config: CasinoConfig, store: Arc<dyn KvStore>) -> (Casino, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let casino = Casino::new(config, store, clock.clone()).unwrap();
        (casino, clock)
    }

    /// Casino on the testing preset with a hand-driven clock
    pub fn casino_on(store: Arc<dyn KvStore>) -> (Casino, Arc<ManualClock>) {
        casino_with(CasinoConfig::testing(), store)
    }

    pub fn casino() -> (Casino, Arc<ManualClock>) {
        casino_on(Arc::new(MemoryStorage::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::casino;
    use crate::common::clock::Clock;

    #[tokio::test]
    async fn test_wiring_shares_one_store() {
        let (casino, clock) = casino();
        let period = casino.registry.ensure_active_period(clock.now()).await.unwrap();
        assert_eq!(casino.registry.latest_number().unwrap(), Some(period.number));
        assert!(casino.metrics.render().contains("fairstake_periods_opened_total 1"));
    }
}
