//! Stateful game sessions (mines, tower, blackjack)
//!
//! The stake is debited when a session opens, in the same batch that persists
//! the session and its active-index entry. Each step rewrites the session;
//! the terminal step credits the payout, writes the wager record and clears
//! the active index in one batch.
//!
//! Actions on a session take a non-blocking lease keyed by session id, so a
//! second concurrent action is rejected with `ActionInProgress` rather than
//! queued. Lock order is always session lease, then user lock.
//!
//! A session only accepts actions while the fair-play period it was dealt
//! from is running. Once the period ends its secret may be published, so the
//! engine resolves the session itself: boards with progress are cashed out,
//! blackjack hands stand, and untouched boards are refunded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::{
    common::{
        clock::Clock,
        types::{GameType, Multiplier, Points, UserId},
    },
    config::GamesConfig,
    errors::{CasinoError, CasinoResult},
    fairness::CommitmentRegistry,
    games::{
        mines::RevealOutcome, outcome, paytable, tower::PickOutcome, BlackjackMove,
        BlackjackResult, GameState, SessionParams,
    },
    ledger::{EntryKind, Ledger},
    locks::KeyedLocks,
    metrics::CasinoMetrics,
    settlement::{record_play, validate_stake},
    storage::{BatchOp, KvStore},
    wager_store::{WagerOutcome, WagerRecord, WagerStore},
};

pub fn session_lock_key(id: &Uuid) -> String {
    format!("session:{}", id)
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Won,
    Lost,
    CashedOut,
    Push,
    Refunded,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        self != SessionStatus::Active
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Session {
    /// Also the id of the wager record written at settlement
    pub id: Uuid,
    pub user_id: UserId,
    pub game_type: GameType,
    pub stake: Points,
    pub nonce: u64,
    pub client_seed: String,
    pub period_number: u64,
    pub server_hash: String,
    /// End of the dealing period; no player action is applied after it
    pub period_ends_at: DateTime<Utc>,
    pub result_digest: String,
    pub state: GameState,
    pub status: SessionStatus,
    pub multiplier: Multiplier,
    #[serde(default)]
    pub payout: Option<Points>,
    pub created_at: DateTime<Utc>,
    pub last_action_at: DateTime<Utc>,
}

impl Session {
    pub fn wager_record(
        &self,
        outcome: WagerOutcome,
        multiplier: Multiplier,
        payout: Points,
        now: DateTime<Utc>,
    ) -> WagerRecord {
        WagerRecord {
            id: self.id,
            user_id: self.user_id.clone(),
            game_type: self.game_type,
            stake: self.stake,
            client_seed: self.client_seed.clone(),
            server_hash: self.server_hash.clone(),
            period_number: self.period_number,
            nonce: self.nonce,
            result_digest: self.result_digest.clone(),
            outcome,
            multiplier,
            payout,
            session_id: Some(self.id),
            created_at: self.created_at,
            settled_at: now,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    Reveal { tile: u8 },
    Pick { column: u8 },
    Hit,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseAction {
    CashOut,
    Stand,
}

/// Session after an operation, plus the settlement if it ended
#[derive(Clone, Debug, Serialize)]
pub struct SessionUpdate {
    pub session: Session,
    pub settled: Option<WagerRecord>,
    pub balance: Option<Points>,
}

pub struct SessionManager {
    store: Arc<dyn KvStore>,
    ledger: Arc<Ledger>,
    registry: Arc<CommitmentRegistry>,
    wagers: WagerStore,
    locks: Arc<KeyedLocks>,
    limits: GamesConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<CasinoMetrics>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn KvStore>,
        ledger: Arc<Ledger>,
        registry: Arc<CommitmentRegistry>,
        locks: Arc<KeyedLocks>,
        limits: GamesConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<CasinoMetrics>,
    ) -> Self {
        Self {
            wagers: WagerStore::new(store.clone()),
            store,
            ledger,
            registry,
            locks,
            limits,
            clock,
            metrics,
        }
    }

    pub fn get(&self, id: &Uuid) -> CasinoResult<Session> {
        self.wagers
            .load_session(id)?
            .ok_or_else(|| CasinoError::SessionNotFound(id.to_string()))
    }

    pub fn active_session(&self, user: &UserId, game: GameType) -> CasinoResult<Option<Session>> {
        match self.wagers.active_session_id(user, game)? {
            Some(id) => self.wagers.load_session(&id),
            None => Ok(None),
        }
    }

    /// Debit the stake and start a session
    pub async fn open(
        &self,
        user: &UserId,
        stake: Points,
        params: SessionParams,
    ) -> CasinoResult<SessionUpdate> {
        let game = params.game_type();
        user.validate()?;
        validate_stake(&self.limits, game, stake)?;
        params.validate()?;

        let _guard = self.ledger.lock_user(user).await;
        if self.wagers.active_session_id(user, game)?.is_some() {
            return Err(CasinoError::SessionAlreadyActive { game_type: game });
        }
        let period = self.registry.ensure_active_period(self.clock.now()).await?;

        let mut account = self.ledger.load_or_new(user)?;
        let nonce = account.nonce;
        account.nonce += 1;
        let digest = outcome::outcome_digest(period.server_secret(), &account.client_seed, nonce);
        let state = params.initial_state(&digest)?;
        let now = self.clock.now();

        let id = Uuid::new_v4();
        let _lease = self.lease(&id)?;
        let mut session = Session {
            id,
            user_id: user.clone(),
            game_type: game,
            stake,
            nonce,
            client_seed: account.client_seed.clone(),
            period_number: period.number,
            server_hash: period.server_hash.clone(),
            period_ends_at: period.end_time,
            result_digest: hex::encode(digest),
            multiplier: state.current_multiplier()?,
            state,
            status: SessionStatus::Active,
            payout: None,
            created_at: now,
            last_action_at: now,
        };

        let mut ops = self
            .ledger
            .stage_debit(&mut account, stake, EntryKind::Stake, &session.id.to_string())?;
        ops.extend(self.wagers.session_ops(&session)?);
        self.store.write_batch(ops).map_err(|e| {
            tracing::error!(user = %user, game = %game, "Failed to open session: {}", e);
            CasinoError::SettlementInfraFailure {
                reason: e.to_string(),
                refunded: true,
            }
        })?;

        self.metrics.session_opened();
        tracing::info!(user = %user, session = %session.id, game = %game, stake = %stake, "Session opened");

        // Blackjack naturals finish on the deal.
        if session.state.is_finished() {
            let record = self.settle_locked(&mut session)?;
            return Ok(SessionUpdate {
                balance: Some(self.ledger.balance(user)?),
                session,
                settled: Some(record),
            });
        }

        Ok(SessionUpdate {
            session,
            settled: None,
            balance: Some(account.balance()),
        })
    }

    fn lease(&self, id: &Uuid) -> CasinoResult<OwnedMutexGuard<()>> {
        self.locks
            .try_lock(&session_lock_key(id))
            .ok_or(CasinoError::ActionInProgress)
    }

    fn load_active(&self, id: &Uuid) -> CasinoResult<Session> {
        let session = self.get(id)?;
        if session.status.is_terminal() {
            return Err(CasinoError::SessionNotActive(id.to_string()));
        }
        Ok(session)
    }

    /// Apply a non-terminal action; settles if the action ends the game
    pub async fn step(&self, id: &Uuid, action: StepAction) -> CasinoResult<SessionUpdate> {
        let _lease = self.lease(id)?;
        let session = self.load_active(id)?;
        if session.state.is_finished() {
            // A previous settlement write failed after the final step landed.
            return self.settle(session).await;
        }
        let mut session = self.reject_after_period_end(session).await?;

        match (&mut session.state, action) {
            (GameState::Mines(board), StepAction::Reveal { tile }) => match board.reveal(tile)? {
                RevealOutcome::Safe { multiplier, .. } => session.multiplier = multiplier,
                RevealOutcome::Mine => session.multiplier = Multiplier::ZERO,
            },
            (GameState::Tower(tower), StepAction::Pick { column }) => match tower.pick(column)? {
                PickOutcome::Safe { multiplier, .. } => session.multiplier = multiplier,
                PickOutcome::Mine => session.multiplier = Multiplier::ZERO,
            },
            (GameState::Blackjack(hand), StepAction::Hit) => {
                hand.apply(BlackjackMove::Hit)?;
            }
            (state, action) => {
                return Err(CasinoError::InvalidAction(format!(
                    "{:?} is not valid for {}",
                    action,
                    state.game_type()
                )));
            }
        }
        session.last_action_at = self.clock.now();

        // The step is durable before any settlement is attempted.
        self.store.write_batch(self.wagers.session_ops(&session)?)?;
        if session.state.is_finished() {
            return self.settle(session).await;
        }

        Ok(SessionUpdate {
            session,
            settled: None,
            balance: None,
        })
    }

    /// Cash out a reveal game or stand in blackjack
    pub async fn close(&self, id: &Uuid, action: CloseAction) -> CasinoResult<SessionUpdate> {
        let _lease = self.lease(id)?;
        let session = self.load_active(id)?;
        if session.state.is_finished() {
            return self.settle(session).await;
        }
        let mut session = self.reject_after_period_end(session).await?;

        match (&mut session.state, action) {
            (GameState::Mines(board), CloseAction::CashOut) => {
                if board.revealed.is_empty() {
                    return Err(CasinoError::InvalidAction(
                        "reveal at least one tile before cashing out".to_string(),
                    ));
                }
            }
            (GameState::Tower(tower), CloseAction::CashOut) => {
                if tower.cleared_rows() == 0 {
                    return Err(CasinoError::InvalidAction(
                        "clear at least one row before cashing out".to_string(),
                    ));
                }
            }
            (GameState::Blackjack(hand), CloseAction::Stand) => {
                hand.apply(BlackjackMove::Stand)?;
                self.store.write_batch(self.wagers.session_ops(&session)?)?;
            }
            (state, action) => {
                return Err(CasinoError::InvalidAction(format!(
                    "{:?} is not valid for {}",
                    action,
                    state.game_type()
                )));
            }
        }
        session.last_action_at = self.clock.now();

        self.settle(session).await
    }

    /// Settle or refund a session that has been idle past `timeout`.
    ///
    /// Finished boards are settled at their result; unfinished ones get the
    /// stake back. Returns `Ok(None)` when the session is busy, already
    /// terminal, or not yet idle long enough.
    pub async fn expire(
        &self,
        id: &Uuid,
        timeout: chrono::Duration,
    ) -> CasinoResult<Option<WagerRecord>> {
        let Some(_lease) = self.locks.try_lock(&session_lock_key(id)) else {
            return Ok(None);
        };
        let Some(mut session) = self.wagers.load_session(id)? else {
            return Ok(None);
        };
        if session.status.is_terminal() || self.clock.now() - session.last_action_at < timeout {
            return Ok(None);
        }

        let _guard = self.ledger.lock_user(&session.user_id).await;
        if session.state.is_finished() {
            return self.settle_locked(&mut session).map(Some);
        }
        self.refund_locked(&mut session, "session expired").map(Some)
    }

    /// Resolve a session whose dealing period has ended. Returns `Ok(None)`
    /// when the session is busy, already terminal, or its period is still
    /// running.
    pub async fn close_for_period_end(&self, id: &Uuid) -> CasinoResult<Option<WagerRecord>> {
        let Some(_lease) = self.locks.try_lock(&session_lock_key(id)) else {
            return Ok(None);
        };
        let Some(mut session) = self.wagers.load_session(id)? else {
            return Ok(None);
        };
        if session.status.is_terminal() || self.clock.now() < session.period_ends_at {
            return Ok(None);
        }

        let _guard = self.ledger.lock_user(&session.user_id).await;
        self.conclude_locked(&mut session).map(Some)
    }

    /// Passes the session through while its period runs. Afterwards the
    /// session is resolved and the action fails with `PeriodClosed`.
    /// Caller holds the session lease.
    async fn reject_after_period_end(&self, mut session: Session) -> CasinoResult<Session> {
        if self.clock.now() < session.period_ends_at {
            return Ok(session);
        }

        let _guard = self.ledger.lock_user(&session.user_id).await;
        self.load_active(&session.id)?;
        self.conclude_locked(&mut session)?;
        Err(CasinoError::PeriodClosed(session.id.to_string()))
    }

    /// Resolve without further input from the player; caller holds both locks
    fn conclude_locked(&self, session: &mut Session) -> CasinoResult<WagerRecord> {
        if session.state.is_finished() {
            return self.settle_locked(session);
        }
        let progressed = match &mut session.state {
            GameState::Mines(board) => !board.revealed.is_empty(),
            GameState::Tower(tower) => tower.cleared_rows() > 0,
            GameState::Blackjack(hand) => {
                if !hand.is_finished() {
                    hand.apply(BlackjackMove::Stand)?;
                }
                true
            }
        };
        if progressed {
            return self.settle_locked(session);
        }
        self.refund_locked(session, "fair-play period ended")
    }

    /// Settle under the user lock; caller holds the session lease
    async fn settle(&self, mut session: Session) -> CasinoResult<SessionUpdate> {
        let _guard = self.ledger.lock_user(&session.user_id).await;
        self.load_active(&session.id)?;
        let record = self.settle_locked(&mut session)?;
        Ok(SessionUpdate {
            balance: Some(self.ledger.balance(&session.user_id)?),
            session,
            settled: Some(record),
        })
    }

    /// Return the stake of an unfinished session; caller holds both locks
    fn refund_locked(&self, session: &mut Session, reason: &str) -> CasinoResult<WagerRecord> {
        let now = self.clock.now();
        session.status = SessionStatus::Refunded;
        session.multiplier = Multiplier::ONE;
        session.payout = Some(session.stake);
        session.last_action_at = now;

        let record = session.wager_record(
            WagerOutcome::Refunded {
                reason: reason.to_string(),
            },
            Multiplier::ONE,
            session.stake,
            now,
        );

        let mut account = self.ledger.load_or_new(&session.user_id)?;
        let mut ops = self.ledger.stage_credit(
            &mut account,
            session.stake,
            EntryKind::Refund,
            &session.id.to_string(),
        )?;
        ops.extend(self.wagers.record_ops(&record)?);
        ops.extend(self.wagers.session_ops(session)?);
        self.store.write_batch(ops)?;

        self.metrics.session_closed();
        tracing::warn!(
            user = %session.user_id,
            session = %session.id,
            stake = %session.stake,
            reason,
            "Session refunded"
        );
        Ok(record)
    }

    /// Final settlement; caller holds the user lock
    fn settle_locked(&self, session: &mut Session) -> CasinoResult<WagerRecord> {
        let multiplier = match &session.state {
            GameState::Mines(board) => board.payout_multiplier()?,
            GameState::Tower(tower) => tower.payout_multiplier(),
            GameState::Blackjack(hand) => hand
                .result()
                .map(paytable::blackjack_multiplier)
                .ok_or_else(|| CasinoError::InvalidAction("hand is not finished".to_string()))?,
        };
        let payout = session.stake.scale(multiplier);
        let now = self.clock.now();

        session.status = terminal_status(&session.state, multiplier);
        session.multiplier = multiplier;
        session.payout = Some(payout);
        session.last_action_at = now;

        let record = session.wager_record(
            WagerOutcome::from_state(session.state.clone()),
            multiplier,
            payout,
            now,
        );

        let mut account = self.ledger.load_or_new(&session.user_id)?;
        record_play(&mut account, session.stake, payout);
        let mut ops: Vec<BatchOp> = if payout.is_zero() {
            vec![self.ledger.stage(&account)?]
        } else {
            self.ledger
                .stage_credit(&mut account, payout, EntryKind::Payout, &session.id.to_string())?
        };
        ops.extend(self.wagers.record_ops(&record)?);
        ops.extend(self.wagers.session_ops(session)?);

        if let Err(e) = self.store.write_batch(ops) {
            // Nothing landed. The stored session keeps its final state and
            // the next action or the recovery sweep settles it.
            tracing::error!(session = %session.id, "Session settlement write failed: {}", e);
            self.metrics.record_settlement_failure(false);
            return Err(CasinoError::SettlementInfraFailure {
                reason: e.to_string(),
                refunded: false,
            });
        }

        self.metrics.session_closed();
        self.metrics
            .record_settlement(session.game_type, session.stake, payout);
        tracing::info!(
            user = %session.user_id,
            session = %session.id,
            game = %session.game_type,
            status = ?session.status,
            payout = %payout,
            "Session settled"
        );
        Ok(record)
    }
}

fn terminal_status(state: &GameState, multiplier: Multiplier) -> SessionStatus {
    match state {
        GameState::Blackjack(hand) => match hand.result() {
            Some(BlackjackResult::Push) => SessionStatus::Push,
            Some(BlackjackResult::Lose) | Some(BlackjackResult::Bust) | None => SessionStatus::Lost,
            Some(_) => SessionStatus::Won,
        },
        GameState::Mines(_) | GameState::Tower(_) => {
            if multiplier == Multiplier::ZERO {
                SessionStatus::Lost
            } else {
                SessionStatus::CashedOut
            }
        }
    }
}
