//! Wager settlement engine for single-shot games
//!
//! A wager is settled in two atomic batches under the user's lock:
//!
//! 1. stake debit, nonce bump, pending marker
//! 2. payout credit, account stats, wager record, marker removal
//!
//! When the second batch fails the stake is rolled back in a third batch. If
//! even that fails, the pending marker is left for the recovery sweep, which
//! refunds it exactly once.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    common::{
        clock::Clock,
        types::{GameType, Points, UserId},
    },
    config::GamesConfig,
    errors::{CasinoError, CasinoResult},
    fairness::{CommitmentRegistry, FairPlayPeriod},
    games::{
        outcome::{self, LIMBO_MAX_RESULT, LIMBO_MIN_TARGET},
        paytable, WagerParams,
    },
    ledger::{Account, EntryKind, Ledger},
    levels,
    metrics::CasinoMetrics,
    storage::{BatchOp, KvStore},
    wager_store::{PendingWager, WagerOutcome, WagerRecord, WagerStore},
};

#[derive(Clone, Debug, Serialize)]
pub struct SettledWager {
    pub record: WagerRecord,
    pub balance: Points,
}

/// Check a stake against the configured limits for a game
pub fn validate_stake(limits: &GamesConfig, game: GameType, stake: Points) -> CasinoResult<()> {
    let limits = limits.limits(game);
    if stake.is_zero() {
        return Err(CasinoError::InvalidStake("stake must be greater than zero".to_string()));
    }
    if stake < limits.min_stake() || stake > limits.max_stake() {
        return Err(CasinoError::InvalidStake(format!(
            "{} stakes must be between {} and {}",
            game,
            limits.min_stake(),
            limits.max_stake()
        )));
    }
    Ok(())
}

/// Fold a finished game into the account's lifetime stats and levels
pub(crate) fn record_play(account: &mut Account, stake: Points, payout: Points) {
    account.total_wagered = account.total_wagered.saturating_add(stake);
    account.total_won = account.total_won.saturating_add(payout);
    account.games_played += 1;
    if let Some(level) = levels::apply_progress(account) {
        tracing::info!(user = %account.user_id, level, "Reached new wager level");
    }
}

pub struct SettlementEngine {
    store: Arc<dyn KvStore>,
    ledger: Arc<Ledger>,
    registry: Arc<CommitmentRegistry>,
    wagers: WagerStore,
    limits: GamesConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<CasinoMetrics>,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn KvStore>,
        ledger: Arc<Ledger>,
        registry: Arc<CommitmentRegistry>,
        limits: GamesConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<CasinoMetrics>,
    ) -> Self {
        Self {
            wagers: WagerStore::new(store.clone()),
            store,
            ledger,
            registry,
            limits,
            clock,
            metrics,
        }
    }

    fn validate_params(params: &WagerParams) -> CasinoResult<()> {
        if let WagerParams::Limbo { target } = params {
            if *target < LIMBO_MIN_TARGET || *target > LIMBO_MAX_RESULT {
                return Err(CasinoError::InvalidParams(format!(
                    "limbo target must be between {} and {}",
                    LIMBO_MIN_TARGET, LIMBO_MAX_RESULT
                )));
            }
        }
        Ok(())
    }

    /// Settle a one-shot wager
    pub async fn settle(
        &self,
        user: &UserId,
        stake: Points,
        params: WagerParams,
    ) -> CasinoResult<SettledWager> {
        let game = params.game_type();
        user.validate()?;
        validate_stake(&self.limits, game, stake)?;
        Self::validate_params(&params)?;

        let _guard = self.ledger.lock_user(user).await;
        // Resolved under the lock: a period that ended while we waited may
        // already be revealed.
        let now = self.clock.now();
        let period = self.registry.ensure_active_period(now).await?;
        let mut account = self.ledger.load_or_new(user)?;
        let wager_id = Uuid::new_v4();
        let (pending, digest) = Self::pending_for(&mut account, wager_id, game, stake, &period, now);

        // Phase A: take the stake. InsufficientFunds surfaces here with nothing written.
        let mut ops = self
            .ledger
            .stage_debit(&mut account, stake, EntryKind::Stake, &wager_id.to_string())?;
        ops.push(self.wagers.pending_op(&pending)?);
        if let Err(e) = self.store.write_batch(ops) {
            tracing::error!(user = %user, wager = %wager_id, "Stake debit failed: {}", e);
            self.metrics.record_settlement_failure(true);
            return Err(CasinoError::SettlementInfraFailure {
                reason: e.to_string(),
                refunded: true,
            });
        }
        let debited = account.clone();

        let (outcome, multiplier) = match params {
            WagerParams::Coinflip { side } => {
                let result = outcome::coinflip(&digest);
                (
                    WagerOutcome::Coinflip { choice: side, result },
                    paytable::coinflip_multiplier(side, result),
                )
            }
            WagerParams::Limbo { target } => {
                let result = outcome::limbo_result(&digest);
                (
                    WagerOutcome::Limbo { target, result },
                    paytable::limbo_multiplier(target, result),
                )
            }
        };
        let payout = stake.scale(multiplier);

        let record = WagerRecord {
            id: wager_id,
            user_id: user.clone(),
            game_type: game,
            stake,
            client_seed: pending.client_seed.clone(),
            server_hash: pending.server_hash.clone(),
            period_number: pending.period_number,
            nonce: pending.nonce,
            result_digest: pending.result_digest.clone(),
            outcome,
            multiplier,
            payout,
            session_id: None,
            created_at: now,
            settled_at: self.clock.now(),
        };

        // Phase B: pay out and record
        match self.write_settlement(&mut account, &record) {
            Ok(()) => {
                self.metrics.record_settlement(game, stake, payout);
                tracing::info!(
                    user = %user,
                    wager = %wager_id,
                    game = %game,
                    stake = %stake,
                    payout = %payout,
                    nonce = record.nonce,
                    "Wager settled"
                );
                Ok(SettledWager {
                    record,
                    balance: account.balance(),
                })
            }
            Err(e) => {
                tracing::error!(user = %user, wager = %wager_id, "Settlement write failed: {}", e);
                Err(self.roll_back(debited, &pending, e))
            }
        }
    }

    /// Reserve the next nonce and build the marker for a wager
    fn pending_for(
        account: &mut Account,
        wager_id: Uuid,
        game: GameType,
        stake: Points,
        period: &FairPlayPeriod,
        now: DateTime<Utc>,
    ) -> (PendingWager, [u8; 32]) {
        let nonce = account.nonce;
        account.nonce += 1;
        let digest = outcome::outcome_digest(period.server_secret(), &account.client_seed, nonce);
        let pending = PendingWager {
            wager_id,
            user_id: account.user_id.clone(),
            game_type: game,
            stake,
            client_seed: account.client_seed.clone(),
            server_hash: period.server_hash.clone(),
            period_number: period.number,
            nonce,
            result_digest: hex::encode(digest),
            created_at: now,
        };
        (pending, digest)
    }

    fn write_settlement(&self, account: &mut Account, record: &WagerRecord) -> CasinoResult<()> {
        record_play(account, record.stake, record.payout);
        let mut ops: Vec<BatchOp> = if record.payout.is_zero() {
            vec![self.ledger.stage(account)?]
        } else {
            self.ledger
                .stage_credit(account, record.payout, EntryKind::Payout, &record.id.to_string())?
        };
        ops.extend(self.wagers.record_ops(record)?);
        ops.push(self.wagers.clear_pending_op(&record.id));
        self.store.write_batch(ops)?;
        Ok(())
    }

    fn try_refund(&self, account: &mut Account, pending: &PendingWager) -> CasinoResult<()> {
        let refund = pending.refund_record("settlement rolled back", self.clock.now());
        let mut ops = self.ledger.stage_credit(
            account,
            pending.stake,
            EntryKind::Refund,
            &pending.wager_id.to_string(),
        )?;
        ops.extend(self.wagers.record_ops(&refund)?);
        ops.push(self.wagers.clear_pending_op(&pending.wager_id));
        self.store.write_batch(ops)?;
        Ok(())
    }

    fn roll_back(&self, mut account: Account, pending: &PendingWager, cause: CasinoError) -> CasinoError {
        let reason = cause.to_string();
        match self.try_refund(&mut account, pending) {
            Ok(()) => {
                tracing::warn!(wager = %pending.wager_id, "Settlement rolled back, stake refunded");
                self.metrics.record_settlement_failure(true);
                CasinoError::SettlementInfraFailure {
                    reason,
                    refunded: true,
                }
            }
            Err(e) => {
                tracing::error!(
                    wager = %pending.wager_id,
                    user = %pending.user_id,
                    stake = %pending.stake,
                    "Rollback failed, leaving pending marker for recovery: {}",
                    e
                );
                self.metrics.record_settlement_failure(false);
                CasinoError::SettlementInfraFailure {
                    reason,
                    refunded: false,
                }
            }
        }
    }

    pub fn wagers(&self) -> &WagerStore {
        &self.wagers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::casino::testing::{casino, casino_on};
    use crate::common::types::Multiplier;
    use crate::config::GameLimits;
    use crate::games::outcome::CoinSide;
    use crate::storage::{FaultInjectingStore, MemoryStorage};
    use chrono::Duration;

    /// First client seed whose nonce-0 flip lands on `side`
    fn seed_for(secret: &str, side: CoinSide) -> String {
        (0..)
            .map(|i| format!("seed-{}", i))
            .find(|seed| outcome::coinflip(&outcome::outcome_digest(secret, seed, 0)) == side)
            .unwrap()
    }

    fn heads() -> WagerParams {
        WagerParams::Coinflip {
            side: CoinSide::Heads,
        }
    }

    #[test]
    fn test_stake_limits() {
        let mut limits = GamesConfig::default();
        limits.coinflip = GameLimits {
            min_stake_cents: 100,
            max_stake_cents: 10_000,
        };

        assert!(validate_stake(&limits, GameType::Coinflip, Points::whole(1)).is_ok());
        assert!(validate_stake(&limits, GameType::Coinflip, Points::whole(100)).is_ok());
        assert!(matches!(
            validate_stake(&limits, GameType::Coinflip, Points::ZERO),
            Err(CasinoError::InvalidStake(_))
        ));
        assert!(validate_stake(&limits, GameType::Coinflip, Points::from_cents(99)).is_err());
        assert!(validate_stake(&limits, GameType::Coinflip, Points::from_cents(10_001)).is_err());
    }

    #[test]
    fn test_limbo_target_bounds() {
        let ok = WagerParams::Limbo {
            target: Multiplier::from_hundredths(200),
        };
        let low = WagerParams::Limbo {
            target: Multiplier::from_hundredths(100),
        };
        let high = WagerParams::Limbo {
            target: Multiplier::from_hundredths(100_001),
        };
        assert!(SettlementEngine::validate_params(&ok).is_ok());
        assert!(SettlementEngine::validate_params(&low).is_err());
        assert!(SettlementEngine::validate_params(&high).is_err());
    }

    #[tokio::test]
    async fn test_losing_flip_keeps_the_stake() {
        let (casino, clock) = casino();
        let user = UserId::from("100");
        casino
            .ledger
            .credit(&user, Points::whole(100), EntryKind::Deposit, "tx-1")
            .await
            .unwrap();
        let period = casino.registry.ensure_active_period(clock.now()).await.unwrap();
        let seed = seed_for(period.server_secret(), CoinSide::Tails);
        casino.ledger.set_client_seed(&user, &seed).await.unwrap();

        let settled = casino
            .settlement
            .settle(&user, Points::whole(10), heads())
            .await
            .unwrap();

        assert_eq!(settled.balance, Points::whole(90));
        assert_eq!(settled.record.payout, Points::ZERO);
        assert_eq!(settled.record.nonce, 0);
        assert_eq!(
            settled.record.outcome,
            WagerOutcome::Coinflip {
                choice: CoinSide::Heads,
                result: CoinSide::Tails
            }
        );

        let account = casino.ledger.load(&user).unwrap().unwrap();
        assert_eq!(account.nonce, 1);
        assert_eq!(account.games_played, 1);
        assert_eq!(account.total_wagered, Points::whole(10));
        assert!(casino.wagers.pending_wagers(10).unwrap().is_empty());
        assert_eq!(casino.metrics.wagers_settled(GameType::Coinflip, "loss"), 1);
    }

    #[tokio::test]
    async fn test_winning_flip_pays_the_table() {
        let (casino, clock) = casino();
        let user = UserId::from("101");
        casino
            .ledger
            .credit(&user, Points::whole(100), EntryKind::Deposit, "tx-1")
            .await
            .unwrap();
        let period = casino.registry.ensure_active_period(clock.now()).await.unwrap();
        let seed = seed_for(period.server_secret(), CoinSide::Heads);
        casino.ledger.set_client_seed(&user, &seed).await.unwrap();

        let settled = casino
            .settlement
            .settle(&user, Points::whole(10), heads())
            .await
            .unwrap();

        assert_eq!(settled.record.multiplier, Multiplier::from_hundredths(196));
        assert_eq!(settled.record.payout, Points::from_cents(1960));
        assert_eq!(settled.balance, Points::from_cents(10_960));

        let history = casino.wagers.user_history(&user, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, settled.record.id);
    }

    #[tokio::test]
    async fn test_insufficient_funds_writes_nothing() {
        let (casino, _clock) = casino();
        let user = UserId::from("102");
        casino
            .ledger
            .credit(&user, Points::whole(5), EntryKind::Deposit, "tx-1")
            .await
            .unwrap();

        let err = casino
            .settlement
            .settle(&user, Points::whole(10), heads())
            .await
            .unwrap_err();

        assert!(matches!(err, CasinoError::InsufficientFunds { .. }));
        let account = casino.ledger.load(&user).unwrap().unwrap();
        assert_eq!(account.balance(), Points::whole(5));
        assert_eq!(account.nonce, 0);
        assert!(casino.wagers.user_history(&user, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_debit_leaves_account_untouched() {
        let faults = Arc::new(FaultInjectingStore::new(Arc::new(MemoryStorage::new())));
        let (casino, clock) = casino_on(faults.clone());
        let user = UserId::from("103");
        casino
            .ledger
            .credit(&user, Points::whole(100), EntryKind::Deposit, "tx-1")
            .await
            .unwrap();
        casino.registry.ensure_active_period(clock.now()).await.unwrap();

        faults.fail_writes(0, 1);
        let err = casino
            .settlement
            .settle(&user, Points::whole(10), heads())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CasinoError::SettlementInfraFailure { refunded: true, .. }
        ));
        let account = casino.ledger.load(&user).unwrap().unwrap();
        assert_eq!(account.balance(), Points::whole(100));
        assert_eq!(account.nonce, 0);
        assert!(casino.wagers.pending_wagers(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_payout_is_rolled_back() {
        let faults = Arc::new(FaultInjectingStore::new(Arc::new(MemoryStorage::new())));
        let (casino, clock) = casino_on(faults.clone());
        let user = UserId::from("104");
        casino
            .ledger
            .credit(&user, Points::whole(100), EntryKind::Deposit, "tx-1")
            .await
            .unwrap();
        casino.registry.ensure_active_period(clock.now()).await.unwrap();

        faults.fail_writes(1, 1);
        let err = casino
            .settlement
            .settle(&user, Points::whole(10), heads())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CasinoError::SettlementInfraFailure { refunded: true, .. }
        ));
        let account = casino.ledger.load(&user).unwrap().unwrap();
        assert_eq!(account.balance(), Points::whole(100));
        // The nonce stays consumed so the digest is never reused.
        assert_eq!(account.nonce, 1);
        assert!(casino.wagers.pending_wagers(10).unwrap().is_empty());

        let history = casino.wagers.user_history(&user, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_refund());
    }

    #[tokio::test]
    async fn test_failed_rollback_is_refunded_once_by_recovery() {
        let faults = Arc::new(FaultInjectingStore::new(Arc::new(MemoryStorage::new())));
        let (casino, clock) = casino_on(faults.clone());
        let user = UserId::from("105");
        casino
            .ledger
            .credit(&user, Points::whole(100), EntryKind::Deposit, "tx-1")
            .await
            .unwrap();
        casino.registry.ensure_active_period(clock.now()).await.unwrap();

        faults.fail_writes(1, 2);
        let err = casino
            .settlement
            .settle(&user, Points::whole(10), heads())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CasinoError::SettlementInfraFailure { refunded: false, .. }
        ));
        assert_eq!(casino.ledger.balance(&user).unwrap(), Points::whole(90));
        assert_eq!(casino.wagers.pending_wagers(10).unwrap().len(), 1);

        faults.heal();
        // Too fresh for the sweep
        let report = casino.recovery.run_once(clock.now()).await.unwrap();
        assert_eq!(report.pending_refunded, 0);

        clock.advance(Duration::seconds(6));
        let report = casino.recovery.run_once(clock.now()).await.unwrap();
        assert_eq!(report.pending_refunded, 1);
        let report = casino.recovery.run_once(clock.now()).await.unwrap();
        assert_eq!(report.pending_refunded, 0);

        assert_eq!(casino.ledger.balance(&user).unwrap(), Points::whole(100));
        assert!(casino.wagers.pending_wagers(10).unwrap().is_empty());
        assert_eq!(casino.metrics.refunds("pending"), 1);
    }

    #[tokio::test]
    async fn test_wager_queued_across_period_end_uses_the_new_period() {
        let (casino, clock) = casino();
        let casino = Arc::new(casino);
        let user = UserId::from("106");
        casino
            .ledger
            .credit(&user, Points::whole(100), EntryKind::Deposit, "tx-1")
            .await
            .unwrap();
        let first = casino.registry.ensure_active_period(clock.now()).await.unwrap();

        // Another operation holds the user while period 1 ends and is revealed.
        let held = casino.ledger.lock_user(&user).await;
        let queued = {
            let casino = casino.clone();
            let user = user.clone();
            tokio::spawn(async move {
                casino
                    .settlement
                    .settle(&user, Points::whole(10), heads())
                    .await
            })
        };
        tokio::task::yield_now().await;

        clock.advance(Duration::seconds(61));
        let swept = casino.registry.sweep(clock.now()).await.unwrap();
        assert_eq!(swept.revealed, vec![first.number]);
        drop(held);

        let settled = queued.await.unwrap().unwrap();
        assert_eq!(settled.record.period_number, first.number + 1);
        let period = casino
            .registry
            .load_period(settled.record.period_number)
            .unwrap()
            .unwrap();
        assert!(period.revealed_secret().is_none());
    }
}
