//! Recovery sweep for wagers and sessions left behind by a crash or a failed
//! rollback.
//!
//! A pending marker and the refund for it are removed and written in the same
//! batch, and the marker is re-read under the user lock. A second sweep, or a
//! sweep racing a late settlement, therefore finds nothing to refund.
//!
//! Each pass also resolves sessions whose fair-play period has ended, flags
//! withdrawals stuck between debit and transfer, and drops idle entries from
//! the lock table.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Notify;

use crate::{
    cashier::stale_withdrawals,
    common::clock::Clock,
    config::RecoveryConfig,
    errors::CasinoResult,
    ledger::{EntryKind, Ledger},
    locks::KeyedLocks,
    metrics::CasinoMetrics,
    sessions::{Session, SessionManager},
    storage::KvStore,
    wager_store::{PendingWager, WagerStore},
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub pending_refunded: usize,
    pub sessions_refunded: usize,
    /// Finished sessions whose settlement write had failed
    pub sessions_settled: usize,
    pub skipped_busy: usize,
    /// Pending withdrawals logged for manual review
    pub withdrawals_flagged: usize,
    pub failures: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        *self == RecoveryReport::default()
    }
}

pub struct RecoverySweep {
    store: Arc<dyn KvStore>,
    ledger: Arc<Ledger>,
    wagers: WagerStore,
    sessions: Arc<SessionManager>,
    locks: Arc<KeyedLocks>,
    clock: Arc<dyn Clock>,
    metrics: Arc<CasinoMetrics>,
    config: RecoveryConfig,
}

impl RecoverySweep {
    pub fn new(
        store: Arc<dyn KvStore>,
        ledger: Arc<Ledger>,
        sessions: Arc<SessionManager>,
        locks: Arc<KeyedLocks>,
        clock: Arc<dyn Clock>,
        metrics: Arc<CasinoMetrics>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            wagers: WagerStore::new(store.clone()),
            store,
            ledger,
            sessions,
            locks,
            clock,
            metrics,
            config,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// One pass over stale pending markers, sessions and withdrawals
    pub async fn run_once(&self, now: DateTime<Utc>) -> CasinoResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let pending_timeout = ChronoDuration::seconds(self.config.pending_timeout_secs as i64);
        let session_timeout = ChronoDuration::seconds(self.config.session_timeout_secs as i64);
        let batch = self.config.batch_limit;

        // Refunds delete the markers behind the cursor, never ahead of it.
        let mut cursor: Option<Vec<u8>> = None;
        loop {
            let page = self.wagers.pending_wagers_page(cursor.as_deref(), batch)?;
            for pending in page.items {
                if now - pending.created_at < pending_timeout {
                    continue;
                }
                match self.refund_pending(&pending).await {
                    Ok(true) => report.pending_refunded += 1,
                    Ok(false) => {}
                    Err(e) => {
                        report.failures += 1;
                        self.metrics.record_refund_failure();
                        tracing::error!(
                            wager = %pending.wager_id,
                            user = %pending.user_id,
                            stake = %pending.stake,
                            "Pending wager refund failed, needs manual attention: {}",
                            e
                        );
                    }
                }
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let mut cursor: Option<Vec<u8>> = None;
        loop {
            let page = self.wagers.active_sessions_page(cursor.as_deref(), batch)?;
            for session in page.items {
                self.recover_session(&session, now, session_timeout, &mut report)
                    .await;
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        for withdrawal in stale_withdrawals(self.store.as_ref(), now - pending_timeout, batch)? {
            report.withdrawals_flagged += 1;
            tracing::warn!(
                withdrawal = %withdrawal.id,
                user = %withdrawal.user_id,
                total = %withdrawal.total(),
                since = %withdrawal.updated_at,
                "Withdrawal stuck in pending, needs manual review"
            );
        }

        let pruned = self.locks.prune();
        if pruned > 0 {
            tracing::debug!(pruned, remaining = self.locks.len(), "Pruned idle locks");
        }

        if !report.is_empty() {
            tracing::info!(?report, "Recovery sweep finished");
        }
        Ok(report)
    }

    async fn recover_session(
        &self,
        session: &Session,
        now: DateTime<Utc>,
        session_timeout: ChronoDuration,
        report: &mut RecoveryReport,
    ) {
        let result = if now >= session.period_ends_at {
            self.sessions.close_for_period_end(&session.id).await
        } else if now - session.last_action_at >= session_timeout {
            self.sessions.expire(&session.id, session_timeout).await
        } else {
            return;
        };

        match result {
            Ok(Some(record)) if record.is_refund() => {
                report.sessions_refunded += 1;
                self.metrics.record_refund("session");
            }
            Ok(Some(_)) => report.sessions_settled += 1,
            Ok(None) => report.skipped_busy += 1,
            Err(e) => {
                report.failures += 1;
                self.metrics.record_refund_failure();
                tracing::error!(
                    session = %session.id,
                    user = %session.user_id,
                    stake = %session.stake,
                    "Session recovery failed, needs manual attention: {}",
                    e
                );
            }
        }
    }

    /// Returns false when the marker was already gone
    async fn refund_pending(&self, pending: &PendingWager) -> CasinoResult<bool> {
        let _guard = self.ledger.lock_user(&pending.user_id).await;
        let Some(pending) = self.wagers.load_pending(&pending.wager_id)? else {
            return Ok(false);
        };

        let mut account = self.ledger.load_or_new(&pending.user_id)?;
        let refund = pending.refund_record("stale pending wager", self.clock.now());
        let mut ops = self.ledger.stage_credit(
            &mut account,
            pending.stake,
            EntryKind::Refund,
            &pending.wager_id.to_string(),
        )?;
        ops.extend(self.wagers.record_ops(&refund)?);
        ops.push(self.wagers.clear_pending_op(&pending.wager_id));
        self.store.write_batch(ops)?;

        self.metrics.record_refund("pending");
        tracing::warn!(
            wager = %pending.wager_id,
            user = %pending.user_id,
            stake = %pending.stake,
            "Refunded stale pending wager"
        );
        Ok(true)
    }
}

/// Runs the sweep once at startup and then on every interval
pub struct RecoveryWorker {
    sweep: Arc<RecoverySweep>,
    interval: std::time::Duration,
    running: AtomicBool,
    shutdown: Notify,
}

impl RecoveryWorker {
    pub fn spawn(sweep: Arc<RecoverySweep>, interval: std::time::Duration) -> Arc<Self> {
        let worker = Arc::new(Self {
            sweep,
            interval,
            running: AtomicBool::new(true),
            shutdown: Notify::new(),
        });

        worker.clone().spawn_task();
        worker
    }

    fn spawn_task(self: Arc<Self>) {
        tokio::spawn(async move {
            // The first tick completes immediately, which is the startup pass.
            let mut tick = tokio::time::interval(self.interval);

            while self.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = tick.tick() => {
                        let now = self.sweep.clock().now();
                        if let Err(e) = self.sweep.run_once(now).await {
                            tracing::warn!("Recovery sweep failed: {}", e);
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
    use crate::{
        casino::{
            testing::{casino, casino_on, casino_with},
            Casino,
        },
        cashier::{FeeSchedule, PaymentGateway, WithdrawalStatus},
        common::types::{Points, UserId},
        config::CasinoConfig,
        errors::CasinoError,
        games::{outcome::outcome_digest, MinesState, SessionParams},
        sessions::{SessionStatus, StepAction},
        storage::{FaultInjectingStore, MemoryStorage},
    };
    use async_trait::async_trait;

    async fn open_mines(casino: &Casino, user: &UserId) -> uuid::Uuid {
        casino
            .ledger
            .credit(user, Points::whole(100), EntryKind::Deposit, "tx-1")
            .await
            .unwrap();
        casino
            .sessions
            .open(user, Points::whole(10), SessionParams::Mines { mines: 3 })
            .await
            .unwrap()
            .session
            .id
    }

    /// Accepts the transfer request and never answers
    struct StalledGateway;

    #[async_trait]
    impl PaymentGateway for StalledGateway {
        async fn deposit_address(&self, user: &UserId) -> CasinoResult<String> {
            Ok(format!("addr-{}", user))
        }

        async fn submit_transfer(&self, _address: &str, _amount: Points) -> CasinoResult<String> {
            std::future::pending().await
        }

        async fn fee_schedule(&self) -> CasinoResult<FeeSchedule> {
            Ok(FeeSchedule::default())
        }
    }

    #[tokio::test]
    async fn test_finished_session_is_settled_not_refunded() {
        let faults = Arc::new(FaultInjectingStore::new(Arc::new(MemoryStorage::new())));
        let (casino, clock) = casino_on(faults.clone());
        let user = UserId::from("700");
        casino
            .ledger
            .credit(&user, Points::whole(100), EntryKind::Deposit, "tx-1")
            .await
            .unwrap();
        let period = casino.registry.ensure_active_period(clock.now()).await.unwrap();
        let account = casino.ledger.load(&user).unwrap().unwrap();
        let digest = outcome_digest(period.server_secret(), &account.client_seed, 0);
        let mine = MinesState::new(3, &digest).unwrap().mine_positions()[0];

        let opened = casino
            .sessions
            .open(&user, Points::whole(10), SessionParams::Mines { mines: 3 })
            .await
            .unwrap();
        let id = opened.session.id;

        // The losing reveal lands, its settlement write does not.
        faults.fail_writes(1, 1);
        let err = casino
            .sessions
            .step(&id, StepAction::Reveal { tile: mine })
            .await
            .unwrap_err();
        assert!(matches!(err, CasinoError::SettlementInfraFailure { refunded: false, .. }));
        assert_eq!(casino.sessions.get(&id).unwrap().status, SessionStatus::Active);

        clock.advance(ChronoDuration::seconds(11));
        let report = casino.recovery.run_once(clock.now()).await.unwrap();
        assert_eq!(report.sessions_settled, 1);
        assert_eq!(report.sessions_refunded, 0);

        let session = casino.sessions.get(&id).unwrap();
        assert_eq!(session.status, SessionStatus::Lost);
        assert_eq!(session.payout, Some(Points::ZERO));
        assert_eq!(casino.ledger.balance(&user).unwrap(), Points::whole(90));
        assert_eq!(casino.metrics.refunds("session"), 0);
    }

    #[tokio::test]
    async fn test_stale_session_behind_a_full_page_is_refunded() {
        let mut config = CasinoConfig::testing();
        config.recovery.batch_limit = 2;
        let (casino, clock) = casino_with(config, Arc::new(MemoryStorage::new()));

        let stale = open_mines(&casino, &UserId::from("zzz")).await;
        clock.advance(ChronoDuration::seconds(11));
        for i in 0..5 {
            open_mines(&casino, &UserId::from(format!("a{}", i).as_str())).await;
        }

        let report = casino.recovery.run_once(clock.now()).await.unwrap();
        assert_eq!(report.sessions_refunded, 1);
        assert_eq!(report.skipped_busy, 0);
        assert_eq!(casino.sessions.get(&stale).unwrap().status, SessionStatus::Refunded);
        assert_eq!(casino.wagers.active_sessions(10).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_sweep_prunes_idle_locks() {
        let (casino, clock) = casino();
        for i in 0..50 {
            open_mines(&casino, &UserId::from(format!("{}", 800 + i).as_str())).await;
        }

        clock.advance(ChronoDuration::seconds(11));
        let report = casino.recovery.run_once(clock.now()).await.unwrap();
        assert_eq!(report.sessions_refunded, 50);
        assert!(casino.locks.is_empty());
    }

    #[tokio::test]
    async fn test_session_past_its_period_is_cashed_out() {
        let (casino, clock) = casino();
        let user = UserId::from("701");
        casino
            .ledger
            .credit(&user, Points::whole(100), EntryKind::Deposit, "tx-1")
            .await
            .unwrap();
        let period = casino.registry.ensure_active_period(clock.now()).await.unwrap();
        let account = casino.ledger.load(&user).unwrap().unwrap();
        let digest = outcome_digest(period.server_secret(), &account.client_seed, 0);
        let board = MinesState::new(3, &digest).unwrap();
        let safe = (0..25u8)
            .find(|t| !board.mine_positions().contains(t))
            .unwrap();

        let opened = casino
            .sessions
            .open(&user, Points::whole(10), SessionParams::Mines { mines: 3 })
            .await
            .unwrap();
        let id = opened.session.id;
        let revealed = casino
            .sessions
            .step(&id, StepAction::Reveal { tile: safe })
            .await
            .unwrap();

        clock.advance(ChronoDuration::seconds(61));
        let report = casino.recovery.run_once(clock.now()).await.unwrap();
        assert_eq!(report.sessions_settled, 1);
        assert_eq!(report.sessions_refunded, 0);

        let session = casino.sessions.get(&id).unwrap();
        assert_eq!(session.status, SessionStatus::CashedOut);
        let payout = Points::whole(10).scale(revealed.session.multiplier);
        assert_eq!(session.payout, Some(payout));
        assert_eq!(
            casino.ledger.balance(&user).unwrap(),
            Points::whole(90).saturating_add(payout)
        );
    }

    #[tokio::test]
    async fn test_withdrawal_stuck_before_transfer_is_flagged() {
        let (casino, clock) = casino();
        let user = UserId::from("702");
        casino
            .ledger
            .credit(&user, Points::whole(100), EntryKind::Deposit, "tx-1")
            .await
            .unwrap();

        let cashier = Arc::new(casino.cashier(Arc::new(StalledGateway)));
        let in_flight = {
            let cashier = cashier.clone();
            let user = user.clone();
            tokio::spawn(async move { cashier.withdraw(&user, Points::whole(50), "addr").await })
        };
        while casino.ledger.balance(&user).unwrap() == Points::whole(100) {
            tokio::task::yield_now().await;
        }
        // The process stops while the gateway call is outstanding.
        in_flight.abort();
        let _ = in_flight.await;

        let report = casino.recovery.run_once(clock.now()).await.unwrap();
        assert_eq!(report.withdrawals_flagged, 0);

        clock.advance(ChronoDuration::seconds(6));
        let report = casino.recovery.run_once(clock.now()).await.unwrap();
        assert_eq!(report.withdrawals_flagged, 1);

        // Flagged, not reversed: the transfer may have left.
        let stuck = stale_withdrawals(casino.store.as_ref(), clock.now(), 10).unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].status, WithdrawalStatus::Pending);
        assert_eq!(casino.ledger.balance(&user).unwrap(), Points::whole(50));
    }
}
