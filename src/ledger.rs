//! Balance ledger
//!
//! The ledger is the only component that changes an account balance. Callers
//! that need a balance change to land together with other writes (wager
//! records, session state) ask the ledger to *stage* the change: it mutates
//! the in-memory `Account`, checks the non-negativity rule on that same value,
//! and hands back the batch ops for the caller's atomic write.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::{
    common::{
        clock::Clock,
        types::{Points, UserId},
    },
    errors::{CasinoError, CasinoResult},
    locks::KeyedLocks,
    storage::{load_json, scan_json, BatchOp, KvStore},
};

const USER_PREFIX: &str = "user:";
const LEDGER_PREFIX: &str = "ledger:";
const MAX_CLIENT_SEED_LEN: usize = 64;

pub fn account_key(user: &UserId) -> Vec<u8> {
    format!("{}{}", USER_PREFIX, user).into_bytes()
}

fn ledger_entry_key(entry: &LedgerEntry) -> Vec<u8> {
    format!(
        "{}{}:{:020}:{}",
        LEDGER_PREFIX,
        entry.user_id,
        entry.created_at.timestamp_millis().max(0),
        entry.id
    )
    .into_bytes()
}

pub fn user_lock_key(user: &UserId) -> String {
    format!("user:{}", user)
}

/// Persisted user account
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub user_id: UserId,
    balance: Points,
    /// Next nonce to hand out; bumped with every stake debit
    pub nonce: u64,
    pub client_seed: String,
    #[serde(default)]
    pub total_wagered: Points,
    #[serde(default)]
    pub total_won: Points,
    #[serde(default)]
    pub games_played: u64,
    /// Highest wager level reached so far
    #[serde(default)]
    pub level_reached: u8,
    /// Highest wager level whose reward has been credited
    #[serde(default)]
    pub level_claimed: u8,
    #[serde(default)]
    pub last_daily_claim: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            balance: Points::ZERO,
            nonce: 0,
            client_seed: random_client_seed(),
            total_wagered: Points::ZERO,
            total_won: Points::ZERO,
            games_played: 0,
            level_reached: 0,
            level_claimed: 0,
            last_daily_claim: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn balance(&self) -> Points {
        self.balance
    }

    fn apply_debit(&mut self, amount: Points) -> CasinoResult<()> {
        self.balance = self
            .balance
            .checked_sub(amount)
            .ok_or(CasinoError::InsufficientFunds {
                needed: amount,
                available: self.balance,
            })?;
        Ok(())
    }

    fn apply_credit(&mut self, amount: Points) -> CasinoResult<()> {
        self.balance = self.balance.checked_add(amount).ok_or_else(|| {
            CasinoError::InvalidParams(format!("credit of {} overflows balance", amount))
        })?;
        Ok(())
    }
}

pub fn random_client_seed() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Deposit,
    Withdrawal,
    WithdrawalReversal,
    Stake,
    Payout,
    Refund,
    LevelReward,
    DailyReward,
    Adjustment,
}

/// Audit row attributing a balance change to its cause (wager id, tx id, ...)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: UserId,
    pub kind: EntryKind,
    pub amount: Points,
    pub balance_after: Points,
    pub cause: String,
    pub created_at: DateTime<Utc>,
}

pub struct Ledger {
    store: Arc<dyn KvStore>,
    locks: Arc<KeyedLocks>,
    clock: Arc<dyn Clock>,
}

impl Ledger {
    pub fn new(store: Arc<dyn KvStore>, locks: Arc<KeyedLocks>, clock: Arc<dyn Clock>) -> Self {
        Self { store, locks, clock }
    }

    /// Serialize all balance work for one user
    pub async fn lock_user(&self, user: &UserId) -> OwnedMutexGuard<()> {
        self.locks.lock(&user_lock_key(user)).await
    }

    pub fn load(&self, user: &UserId) -> CasinoResult<Option<Account>> {
        load_json(self.store.as_ref(), &account_key(user))
    }

    /// Load the account, or a fresh unsaved one
    pub fn load_or_new(&self, user: &UserId) -> CasinoResult<Account> {
        Ok(match self.load(user)? {
            Some(account) => account,
            None => Account::new(user.clone(), self.clock.now()),
        })
    }

    pub async fn ensure_exists(&self, user: &UserId) -> CasinoResult<Account> {
        user.validate()?;
        if let Some(account) = self.load(user)? {
            return Ok(account);
        }

        let _guard = self.lock_user(user).await;
        if let Some(account) = self.load(user)? {
            return Ok(account);
        }
        let account = Account::new(user.clone(), self.clock.now());
        self.store.write_batch(vec![self.stage(&account)?])?;
        tracing::debug!(user = %user, "Created account");
        Ok(account)
    }

    /// Balance of a user; unknown users read as zero
    pub fn balance(&self, user: &UserId) -> CasinoResult<Points> {
        Ok(self.load(user)?.map(|a| a.balance()).unwrap_or(Points::ZERO))
    }

    pub async fn credit(
        &self,
        user: &UserId,
        amount: Points,
        kind: EntryKind,
        cause: &str,
    ) -> CasinoResult<Points> {
        user.validate()?;
        let _guard = self.lock_user(user).await;
        let mut account = self.load_or_new(user)?;
        let ops = self.stage_credit(&mut account, amount, kind, cause)?;
        self.store.write_batch(ops)?;
        tracing::debug!(user = %user, amount = %amount, cause, "Credited");
        Ok(account.balance())
    }

    pub async fn debit(
        &self,
        user: &UserId,
        amount: Points,
        kind: EntryKind,
        cause: &str,
    ) -> CasinoResult<Points> {
        user.validate()?;
        let _guard = self.lock_user(user).await;
        let mut account = self.load_or_new(user)?;
        let ops = self.stage_debit(&mut account, amount, kind, cause)?;
        self.store.write_batch(ops)?;
        tracing::debug!(user = %user, amount = %amount, cause, "Debited");
        Ok(account.balance())
    }

    pub async fn set_client_seed(&self, user: &UserId, seed: &str) -> CasinoResult<Account> {
        user.validate()?;
        validate_client_seed(seed)?;

        let _guard = self.lock_user(user).await;
        let mut account = self.load_or_new(user)?;
        account.client_seed = seed.to_string();
        account.updated_at = self.clock.now();
        self.store.write_batch(vec![self.stage(&account)?])?;
        Ok(account)
    }

    /// Debit `amount` on `account` and return the ops that persist it.
    /// The caller must hold the user lock and write the ops atomically.
    pub fn stage_debit(
        &self,
        account: &mut Account,
        amount: Points,
        kind: EntryKind,
        cause: &str,
    ) -> CasinoResult<Vec<BatchOp>> {
        require_positive(amount)?;
        account.apply_debit(amount)?;
        self.staged(account, amount, kind, cause)
    }

    pub fn stage_credit(
        &self,
        account: &mut Account,
        amount: Points,
        kind: EntryKind,
        cause: &str,
    ) -> CasinoResult<Vec<BatchOp>> {
        require_positive(amount)?;
        account.apply_credit(amount)?;
        self.staged(account, amount, kind, cause)
    }

    fn staged(
        &self,
        account: &mut Account,
        amount: Points,
        kind: EntryKind,
        cause: &str,
    ) -> CasinoResult<Vec<BatchOp>> {
        let now = self.clock.now();
        account.updated_at = now;
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            user_id: account.user_id.clone(),
            kind,
            amount,
            balance_after: account.balance(),
            cause: cause.to_string(),
            created_at: now,
        };
        Ok(vec![
            self.stage(account)?,
            BatchOp::put_json(ledger_entry_key(&entry), &entry)?,
        ])
    }

    /// Op that persists the account as-is (no balance change)
    pub fn stage(&self, account: &Account) -> CasinoResult<BatchOp> {
        BatchOp::put_json(account_key(&account.user_id), account)
    }

    /// Audit entries for a user, oldest first
    pub fn entries(&self, user: &UserId, limit: usize) -> CasinoResult<Vec<LedgerEntry>> {
        let prefix = format!("{}{}:", LEDGER_PREFIX, user);
        scan_json(self.store.as_ref(), prefix.as_bytes(), limit)
    }
}

fn require_positive(amount: Points) -> CasinoResult<()> {
    if amount.is_zero() {
        return Err(CasinoError::InvalidParams("amount must be positive".to_string()));
    }
    Ok(())
}

pub fn validate_client_seed(seed: &str) -> CasinoResult<()> {
    if seed.is_empty() || seed.len() > MAX_CLIENT_SEED_LEN {
        return Err(CasinoError::InvalidParams(format!(
            "client seed must be 1-{} characters",
            MAX_CLIENT_SEED_LEN
        )));
    }
    if seed.contains(':') || seed.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CasinoError::InvalidParams(
            "client seed may not contain ':' or whitespace".to_string(),
        ));
    }
    Ok(())
}
