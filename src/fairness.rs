//! Commitment registry for fair-play periods
//!
//! Each period commits to `SHA-256(server_secret)` up front and only publishes
//! the secret once the period has ended. Period creation goes through a
//! single-flight lock and refuses to overwrite an existing period number, so a
//! sweep racing with a self-healing settlement cannot mint two periods.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{broadcast, Mutex, Notify};

use crate::{
    common::clock::Clock,
    errors::{CasinoError, CasinoResult},
    games::outcome::{generate_server_secret, hash_secret},
    metrics::CasinoMetrics,
    storage::{load_json, BatchOp, KvStore},
};

const PERIOD_PREFIX: &str = "period:";
const LATEST_PERIOD_KEY: &[u8] = b"period:latest";

fn period_key(number: u64) -> Vec<u8> {
    format!("{}{:020}", PERIOD_PREFIX, number).into_bytes()
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PeriodStatus {
    Active,
    Revealed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FairPlayPeriod {
    pub number: u64,
    pub server_hash: String,
    server_secret: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: PeriodStatus,
    #[serde(default)]
    pub revealed_at: Option<DateTime<Utc>>,
}

/// What callers outside the engine may see of a period
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PublicPeriod {
    pub number: u64,
    pub server_hash: String,
    pub server_secret: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: PeriodStatus,
}

impl FairPlayPeriod {
    pub fn covers(&self, now: DateTime<Utc>) -> bool {
        self.start_time <= now && now < self.end_time
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == PeriodStatus::Active && self.covers(now)
    }

    /// The secret, once it has been made public
    pub fn revealed_secret(&self) -> Option<&str> {
        match self.status {
            PeriodStatus::Revealed => Some(&self.server_secret),
            PeriodStatus::Active => None,
        }
    }

    /// Seed material for settling wagers inside this period
    pub(crate) fn server_secret(&self) -> &str {
        &self.server_secret
    }

    pub fn public(&self) -> PublicPeriod {
        PublicPeriod {
            number: self.number,
            server_hash: self.server_hash.clone(),
            server_secret: self.revealed_secret().map(str::to_string),
            start_time: self.start_time,
            end_time: self.end_time,
            status: self.status,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeriodEvent {
    Opened { number: u64, server_hash: String },
    Revealed { number: u64 },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub revealed: Vec<u64>,
    pub opened: Option<u64>,
}

pub struct CommitmentRegistry {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<CasinoMetrics>,
    period_duration: ChronoDuration,
    single_flight: Mutex<()>,
    events: broadcast::Sender<PeriodEvent>,
}

impl CommitmentRegistry {
    pub fn new(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<CasinoMetrics>,
        period_duration: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            clock,
            metrics,
            period_duration: ChronoDuration::from_std(period_duration)
                .unwrap_or_else(|_| ChronoDuration::hours(6)),
            single_flight: Mutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeriodEvent> {
        self.events.subscribe()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn load_period(&self, number: u64) -> CasinoResult<Option<FairPlayPeriod>> {
        Self::load_period_from(self.store.as_ref(), number)
    }

    /// Read a period straight from a store, for offline tools
    pub fn load_period_from(store: &dyn KvStore, number: u64) -> CasinoResult<Option<FairPlayPeriod>> {
        load_json(store, &period_key(number))
    }

    pub fn latest_number(&self) -> CasinoResult<Option<u64>> {
        load_json(self.store.as_ref(), LATEST_PERIOD_KEY)
    }

    /// Period whose `[start, end)` contains `now` and is still active
    pub fn get_active_period(&self, now: DateTime<Utc>) -> CasinoResult<Option<FairPlayPeriod>> {
        let Some(latest) = self.latest_number()? else {
            return Ok(None);
        };
        Ok(self
            .load_period(latest)?
            .filter(|period| period.is_active_at(now)))
    }

    /// Mint and persist a new period starting at `now`
    ///
    /// Refuses with `DuplicatePeriod` while another period is active at `now`.
    pub async fn open_new_period(&self, now: DateTime<Utc>) -> CasinoResult<FairPlayPeriod> {
        let _flight = self.single_flight.lock().await;
        if let Some(active) = self.get_active_period(now)? {
            return Err(CasinoError::DuplicatePeriod(active.number));
        }
        self.open_locked(now)
    }

    /// Active period for `now`, opening one if none exists
    pub async fn ensure_active_period(&self, now: DateTime<Utc>) -> CasinoResult<FairPlayPeriod> {
        if let Some(active) = self.get_active_period(now)? {
            return Ok(active);
        }

        let _flight = self.single_flight.lock().await;
        if let Some(active) = self.get_active_period(now)? {
            return Ok(active);
        }
        tracing::info!("No active fair-play period, opening one on demand");
        self.open_locked(now)
    }

    fn open_locked(&self, now: DateTime<Utc>) -> CasinoResult<FairPlayPeriod> {
        let number = self.latest_number()?.map(|n| n + 1).unwrap_or(1);
        if self.load_period(number)?.is_some() {
            return Err(CasinoError::DuplicatePeriod(number));
        }

        let secret = generate_server_secret();
        let period = FairPlayPeriod {
            number,
            server_hash: hash_secret(&secret),
            server_secret: secret,
            start_time: now,
            end_time: now + self.period_duration,
            status: PeriodStatus::Active,
            revealed_at: None,
        };

        // The period must be durable before anything can settle against it.
        let ops = vec![
            BatchOp::put_json(period_key(number), &period)?,
            BatchOp::put_json(LATEST_PERIOD_KEY, &number)?,
        ];
        if let Err(e) = self.store.write_batch(ops) {
            tracing::error!(period = number, "Failed to persist fair-play period: {}", e);
            return Err(e.into());
        }

        tracing::info!(
            period = number,
            server_hash = %period.server_hash,
            ends_at = %period.end_time,
            "Opened fair-play period"
        );
        self.metrics.record_period_opened();
        let _ = self.events.send(PeriodEvent::Opened {
            number,
            server_hash: period.server_hash.clone(),
        });
        Ok(period)
    }

    /// Publish a period's secret; only allowed once the period has ended
    pub async fn reveal(&self, number: u64, now: DateTime<Utc>) -> CasinoResult<FairPlayPeriod> {
        let _flight = self.single_flight.lock().await;
        self.reveal_locked(number, now)
    }

    fn reveal_locked(&self, number: u64, now: DateTime<Utc>) -> CasinoResult<FairPlayPeriod> {
        let mut period = self
            .load_period(number)?
            .ok_or(CasinoError::PeriodNotFound(number))?;

        if period.status == PeriodStatus::Revealed {
            return Ok(period);
        }
        if now < period.end_time {
            return Err(CasinoError::EarlyReveal {
                period: number,
                ends_at: period.end_time.to_rfc3339(),
            });
        }

        period.status = PeriodStatus::Revealed;
        period.revealed_at = Some(now);
        self.store
            .write_batch(vec![BatchOp::put_json(period_key(number), &period)?])?;

        tracing::info!(period = number, "Revealed fair-play period secret");
        self.metrics.record_period_revealed();
        let _ = self.events.send(PeriodEvent::Revealed { number });
        Ok(period)
    }

    /// Reveal every expired period, then open a new one if none is active
    pub async fn sweep(&self, now: DateTime<Utc>) -> CasinoResult<SweepReport> {
        let _flight = self.single_flight.lock().await;
        let mut report = SweepReport::default();

        let Some(latest) = self.latest_number()? else {
            report.opened = Some(self.open_locked(now)?.number);
            return Ok(report);
        };

        // Periods are revealed in order, so walk back until a revealed one.
        let mut expired = Vec::new();
        let mut number = latest;
        while number > 0 {
            let Some(period) = self.load_period(number)? else {
                break;
            };
            if period.status == PeriodStatus::Revealed {
                break;
            }
            if now >= period.end_time {
                expired.push(number);
            }
            number -= 1;
        }

        for number in expired.into_iter().rev() {
            self.reveal_locked(number, now)?;
            report.revealed.push(number);
        }

        if self.get_active_period(now)?.is_none() {
            report.opened = Some(self.open_locked(now)?.number);
        }
        Ok(report)
    }

    /// Revealed periods, newest first
    pub fn reveal_history(&self, limit: usize) -> CasinoResult<Vec<FairPlayPeriod>> {
        let mut history = Vec::new();
        let Some(mut number) = self.latest_number()? else {
            return Ok(history);
        };

        while number > 0 && history.len() < limit {
            if let Some(period) = self.load_period(number)? {
                if period.status == PeriodStatus::Revealed {
                    history.push(period);
                }
            }
            number -= 1;
        }
        Ok(history)
    }
}

/// Background loop that keeps exactly one period active
pub struct FairnessWorker {
    registry: Arc<CommitmentRegistry>,
    interval: Duration,
    running: AtomicBool,
    shutdown: Notify,
}

impl FairnessWorker {
    pub fn spawn(registry: Arc<CommitmentRegistry>, interval: Duration) -> Arc<Self> {
        let worker = Arc::new(Self {
            registry,
            interval,
            running: AtomicBool::new(true),
            shutdown: Notify::new(),
        });

        worker.clone().spawn_task();
        worker
    }

    fn spawn_task(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);

            while self.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = tick.tick() => {
                        let now = self.registry.clock().now();
                        match self.registry.sweep(now).await {
                            Ok(report) if !report.revealed.is_empty() || report.opened.is_some() => {
                                tracing::debug!(?report, "Fair-play sweep finished");
                            }
                            Ok(_) => {}
                            Err(e) => tracing::warn!("Fair-play sweep failed: {}", e),
                        }
                    }
                    _ = self.shutdown.notified() => break,
                }
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::ManualClock;
    use crate::storage::{FaultInjectingStore, MemoryStorage};

    fn registry_with(store: Arc<dyn KvStore>) -> (CommitmentRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = CommitmentRegistry::new(
            store,
            clock.clone(),
            Arc::new(CasinoMetrics::new().unwrap()),
            Duration::from_secs(6 * 3600),
        );
        (registry, clock)
    }

    fn registry() -> (CommitmentRegistry, Arc<ManualClock>) {
        registry_with(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_open_commits_hash() {
        let (registry, clock) = registry();
        let now = clock.now();
        assert!(registry.get_active_period(now).unwrap().is_none());

        let period = registry.open_new_period(now).await.unwrap();
        assert_eq!(period.number, 1);
        assert_eq!(hash_secret(period.server_secret()), period.server_hash);
        assert!(period.revealed_secret().is_none());
        assert!(period.public().server_secret.is_none());

        let active = registry.get_active_period(now).unwrap().unwrap();
        assert_eq!(active.server_hash, period.server_hash);
        assert!(matches!(
            registry.open_new_period(now).await,
            Err(CasinoError::DuplicatePeriod(1))
        ));
    }

    #[tokio::test]
    async fn test_no_early_reveal() {
        let (registry, clock) = registry();
        let period = registry.open_new_period(clock.now()).await.unwrap();

        clock.advance(ChronoDuration::hours(5));
        let err = registry.reveal(period.number, clock.now()).await.unwrap_err();
        assert!(matches!(err, CasinoError::EarlyReveal { period: 1, .. }));

        clock.advance(ChronoDuration::hours(1));
        let revealed = registry.reveal(period.number, clock.now()).await.unwrap();
        assert_eq!(revealed.status, PeriodStatus::Revealed);
        assert_eq!(hash_secret(revealed.revealed_secret().unwrap()), period.server_hash);
        assert!(matches!(
            registry.reveal(99, clock.now()).await,
            Err(CasinoError::PeriodNotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_sweep_rotates_periods() {
        let (registry, clock) = registry();
        let mut events = registry.subscribe();

        let report = registry.sweep(clock.now()).await.unwrap();
        assert_eq!(report.opened, Some(1));
        assert!(report.revealed.is_empty());

        let report = registry.sweep(clock.now()).await.unwrap();
        assert_eq!(report, SweepReport::default());

        clock.advance(ChronoDuration::hours(7));
        let report = registry.sweep(clock.now()).await.unwrap();
        assert_eq!(report.revealed, vec![1]);
        assert_eq!(report.opened, Some(2));

        let history = registry.reveal_history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].number, 1);

        assert!(matches!(events.recv().await.unwrap(), PeriodEvent::Opened { number: 1, .. }));
        assert_eq!(events.recv().await.unwrap(), PeriodEvent::Revealed { number: 1 });
    }

    #[tokio::test]
    async fn test_concurrent_ensure_opens_once() {
        let (registry, clock) = registry();
        let registry = Arc::new(registry);
        let now = clock.now();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.ensure_active_period(now).await.unwrap().number
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 1);
        }
        assert_eq!(registry.latest_number().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_no_period() {
        let store = Arc::new(FaultInjectingStore::new(Arc::new(MemoryStorage::new())));
        store.fail_writes(0, 1);
        let (registry, clock) = registry_with(store);

        assert!(registry.open_new_period(clock.now()).await.is_err());
        assert!(registry.get_active_period(clock.now()).unwrap().is_none());
        assert_eq!(registry.open_new_period(clock.now()).await.unwrap().number, 1);
    }
}
