//! Persistent wager records, pending-debit markers and session rows.
//!
//! Records are append-only. A pending marker exists exactly between the stake
//! debit and the final settlement batch; whatever is left behind after a crash
//! is what the recovery sweep refunds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    common::types::{GameType, Multiplier, Points, UserId},
    errors::{CasinoResult, StorageError},
    games::{BlackjackState, CoinSide, GameState, MinesState, TowerState},
    sessions::{Session, SessionStatus},
    storage::{decode_json, load_json, BatchOp, KvStore},
};

const RECORD_PREFIX: &str = "wager:record:";
const USER_INDEX_PREFIX: &str = "wager:user:";
const PENDING_PREFIX: &str = "wager:pending:";
const SESSION_PREFIX: &str = "session:";
const ACTIVE_SESSION_PREFIX: &str = "session:active:";

fn record_key(id: &Uuid) -> Vec<u8> {
    format!("{}{}", RECORD_PREFIX, id).into_bytes()
}

fn user_index_key(user: &UserId, created_at: DateTime<Utc>, id: &Uuid) -> Vec<u8> {
    // Newest first: invert the timestamp so ascending scans return recent wagers.
    let inv_ts = u64::MAX - created_at.timestamp_millis().max(0) as u64;
    format!("{}{}:{:020}:{}", USER_INDEX_PREFIX, user, inv_ts, id).into_bytes()
}

fn pending_key(id: &Uuid) -> Vec<u8> {
    format!("{}{}", PENDING_PREFIX, id).into_bytes()
}

fn session_key(id: &Uuid) -> Vec<u8> {
    format!("{}{}", SESSION_PREFIX, id).into_bytes()
}

fn active_session_key(game: GameType, user: &UserId) -> Vec<u8> {
    format!("{}{}:{}", ACTIVE_SESSION_PREFIX, game, user).into_bytes()
}

/// Game-specific result stored with a wager
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "game", rename_all = "snake_case")]
pub enum WagerOutcome {
    Coinflip { choice: CoinSide, result: CoinSide },
    Limbo { target: Multiplier, result: Multiplier },
    Mines(MinesState),
    Tower(TowerState),
    Blackjack(BlackjackState),
    /// Stake returned without a game result
    Refunded { reason: String },
}

impl WagerOutcome {
    pub fn game_type(&self) -> Option<GameType> {
        match self {
            WagerOutcome::Coinflip { .. } => Some(GameType::Coinflip),
            WagerOutcome::Limbo { .. } => Some(GameType::Limbo),
            WagerOutcome::Mines(_) => Some(GameType::Mines),
            WagerOutcome::Tower(_) => Some(GameType::Tower),
            WagerOutcome::Blackjack(_) => Some(GameType::Blackjack),
            WagerOutcome::Refunded { .. } => None,
        }
    }

    pub fn from_state(state: GameState) -> Self {
        match state {
            GameState::Mines(s) => WagerOutcome::Mines(s),
            GameState::Tower(s) => WagerOutcome::Tower(s),
            GameState::Blackjack(s) => WagerOutcome::Blackjack(s),
        }
    }
}

/// Immutable audit record of a settled (or refunded) wager
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WagerRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub game_type: GameType,
    pub stake: Points,
    pub client_seed: String,
    pub server_hash: String,
    pub period_number: u64,
    pub nonce: u64,
    pub result_digest: String,
    pub outcome: WagerOutcome,
    pub multiplier: Multiplier,
    pub payout: Points,
    #[serde(default)]
    pub session_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub settled_at: DateTime<Utc>,
}

impl WagerRecord {
    pub fn is_refund(&self) -> bool {
        matches!(self.outcome, WagerOutcome::Refunded { .. })
    }
}

/// Marker for a stake that has been debited but not yet settled
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PendingWager {
    pub wager_id: Uuid,
    pub user_id: UserId,
    pub game_type: GameType,
    pub stake: Points,
    pub client_seed: String,
    pub server_hash: String,
    pub period_number: u64,
    pub nonce: u64,
    pub result_digest: String,
    pub created_at: DateTime<Utc>,
}

impl PendingWager {
    /// Record written when the stake goes back to the user unsettled
    pub fn refund_record(&self, reason: &str, now: DateTime<Utc>) -> WagerRecord {
        WagerRecord {
            id: self.wager_id,
            user_id: self.user_id.clone(),
            game_type: self.game_type,
            stake: self.stake,
            client_seed: self.client_seed.clone(),
            server_hash: self.server_hash.clone(),
            period_number: self.period_number,
            nonce: self.nonce,
            result_digest: self.result_digest.clone(),
            outcome: WagerOutcome::Refunded {
                reason: reason.to_string(),
            },
            multiplier: Multiplier::ONE,
            payout: self.stake,
            session_id: None,
            created_at: self.created_at,
            settled_at: now,
        }
    }
}

/// One page of a prefix scan and the key to resume after, if any rows remain
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<Vec<u8>>,
}

impl<T> Page<T> {
    fn cursor(rows: &[(Vec<u8>, Vec<u8>)], limit: usize) -> Option<Vec<u8>> {
        if rows.len() < limit {
            return None;
        }
        rows.last().map(|(key, _)| key.clone())
    }
}

#[derive(Clone)]
pub struct WagerStore {
    store: Arc<dyn KvStore>,
}

impl WagerStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn record_ops(&self, record: &WagerRecord) -> CasinoResult<Vec<BatchOp>> {
        Ok(vec![
            BatchOp::put_json(record_key(&record.id), record)?,
            BatchOp::put(
                user_index_key(&record.user_id, record.created_at, &record.id),
                record.id.to_string(),
            ),
        ])
    }

    pub fn pending_op(&self, pending: &PendingWager) -> CasinoResult<BatchOp> {
        BatchOp::put_json(pending_key(&pending.wager_id), pending)
    }

    pub fn clear_pending_op(&self, wager_id: &Uuid) -> BatchOp {
        BatchOp::delete(pending_key(wager_id))
    }

    pub fn load_record(&self, id: &Uuid) -> CasinoResult<Option<WagerRecord>> {
        load_json(self.store.as_ref(), &record_key(id))
    }

    pub fn load_pending(&self, id: &Uuid) -> CasinoResult<Option<PendingWager>> {
        load_json(self.store.as_ref(), &pending_key(id))
    }

    pub fn pending_wagers(&self, limit: usize) -> CasinoResult<Vec<PendingWager>> {
        Ok(self.pending_wagers_page(None, limit)?.items)
    }

    /// Pending markers in key order, resuming after `after`
    pub fn pending_wagers_page(
        &self,
        after: Option<&[u8]>,
        limit: usize,
    ) -> CasinoResult<Page<PendingWager>> {
        let rows = self
            .store
            .scan_prefix(PENDING_PREFIX.as_bytes(), after, limit)?;
        let next = Page::<PendingWager>::cursor(&rows, limit);
        let items = rows
            .iter()
            .map(|(key, bytes)| decode_json(key, bytes))
            .collect::<CasinoResult<Vec<_>>>()?;
        Ok(Page { items, next })
    }

    /// Settled wagers for a user, newest first
    pub fn user_history(&self, user: &UserId, limit: usize) -> CasinoResult<Vec<WagerRecord>> {
        let prefix = format!("{}{}:", USER_INDEX_PREFIX, user);
        let rows = self.store.scan_prefix(prefix.as_bytes(), None, limit)?;

        let mut records = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let id = std::str::from_utf8(&value)
                .ok()
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| {
                    StorageError::CorruptedData(format!(
                        "Bad wager index entry {}",
                        String::from_utf8_lossy(&key)
                    ))
                })?;
            if let Some(record) = self.load_record(&id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Session row plus the active-index entry that matches its status
    pub fn session_ops(&self, session: &Session) -> CasinoResult<Vec<BatchOp>> {
        let index_key = active_session_key(session.game_type, &session.user_id);
        let index_op = if session.status == SessionStatus::Active {
            BatchOp::put(index_key, session.id.to_string())
        } else {
            BatchOp::delete(index_key)
        };
        Ok(vec![BatchOp::put_json(session_key(&session.id), session)?, index_op])
    }

    pub fn load_session(&self, id: &Uuid) -> CasinoResult<Option<Session>> {
        load_json(self.store.as_ref(), &session_key(id))
    }

    pub fn active_session_id(&self, user: &UserId, game: GameType) -> CasinoResult<Option<Uuid>> {
        let Some(bytes) = self.store.get(&active_session_key(game, user))? else {
            return Ok(None);
        };
        let id = std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                StorageError::CorruptedData(format!("Bad active session index for {}", user))
            })?;
        Ok(Some(id))
    }

    pub fn active_sessions(&self, limit: usize) -> CasinoResult<Vec<Session>> {
        Ok(self.active_sessions_page(None, limit)?.items)
    }

    /// Sessions still marked active, in index order, resuming after `after`
    pub fn active_sessions_page(
        &self,
        after: Option<&[u8]>,
        limit: usize,
    ) -> CasinoResult<Page<Session>> {
        let rows = self
            .store
            .scan_prefix(ACTIVE_SESSION_PREFIX.as_bytes(), after, limit)?;
        let next = Page::<Session>::cursor(&rows, limit);

        let mut sessions = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            let Some(id) = std::str::from_utf8(&value)
                .ok()
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                tracing::warn!("Skipping malformed active session index entry");
                continue;
            };
            if let Some(session) = self.load_session(&id)? {
                sessions.push(session);
            }
        }
        Ok(Page {
            items: sessions,
            next,
        })
    }
}
