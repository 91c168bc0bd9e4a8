//! Wager levels and the daily reward
//!
//! Lifetime wagered volume unlocks ten tiers. Reaching a tier only records
//! it on the account; the point reward is paid out by an explicit claim so
//! the settlement path never has to credit anything but the payout.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::{
    common::{
        clock::Clock,
        types::{Points, UserId},
    },
    errors::{CasinoError, CasinoResult},
    ledger::{Account, EntryKind, Ledger},
    storage::KvStore,
};

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct LevelTier {
    pub level: u8,
    pub name: &'static str,
    pub threshold: Points,
    pub reward: Points,
}

const fn tier(level: u8, name: &'static str, threshold: u64, reward: u64) -> LevelTier {
    LevelTier {
        level,
        name,
        threshold: Points::whole(threshold),
        reward: Points::whole(reward),
    }
}

pub const LEVELS: [LevelTier; 10] = [
    tier(1, "Emberling", 200, 2),
    tier(2, "Ironclad", 1_000, 5),
    tier(3, "Steelbound", 2_000, 10),
    tier(4, "Frostborne", 5_000, 20),
    tier(5, "Solarflare", 12_500, 40),
    tier(6, "Bloodfang", 25_000, 80),
    tier(7, "Verdant King", 50_000, 160),
    tier(8, "Stormbringer", 100_000, 350),
    tier(9, "Shadowbeast", 250_000, 700),
    tier(10, "Eternal Flame", 500_000, 1_500),
];

/// Highest level unlocked by `total_wagered` (0 = none)
pub fn level_for(total_wagered: Points) -> u8 {
    LEVELS
        .iter()
        .rev()
        .find(|t| total_wagered >= t.threshold)
        .map(|t| t.level)
        .unwrap_or(0)
}

pub fn tier_info(level: u8) -> Option<&'static LevelTier> {
    LEVELS.iter().find(|t| t.level == level)
}

/// Update `level_reached` after the wagered total changed; returns the new
/// level when one was crossed.
pub fn apply_progress(account: &mut Account) -> Option<u8> {
    let level = level_for(account.total_wagered);
    if level > account.level_reached {
        account.level_reached = level;
        Some(level)
    } else {
        None
    }
}

/// Rewards unlocked but not yet claimed
pub fn pending_reward(account: &Account) -> Points {
    LEVELS
        .iter()
        .filter(|t| t.level > account.level_claimed && t.level <= account.level_reached)
        .fold(Points::ZERO, |acc, t| acc.saturating_add(t.reward))
}

pub const DAILY_REWARD: Points = Points::whole(100);

pub fn daily_cooldown() -> Duration {
    Duration::hours(24)
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct DailyClaim {
    pub reward: Points,
    pub balance: Points,
    pub next_claim_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct LevelClaim {
    pub levels: Vec<u8>,
    pub reward: Points,
    pub balance: Points,
}

pub struct LevelRewards {
    store: Arc<dyn KvStore>,
    ledger: Arc<Ledger>,
    clock: Arc<dyn Clock>,
}

impl LevelRewards {
    pub fn new(store: Arc<dyn KvStore>, ledger: Arc<Ledger>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            ledger,
            clock,
        }
    }

    /// Credit the daily reward, at most once per 24 hours
    pub async fn claim_daily(&self, user: &UserId) -> CasinoResult<DailyClaim> {
        user.validate()?;
        let _guard = self.ledger.lock_user(user).await;
        let mut account = self.ledger.load_or_new(user)?;
        let now = self.clock.now();

        if let Some(last) = account.last_daily_claim {
            let next_claim = last + daily_cooldown();
            if now < next_claim {
                return Err(CasinoError::DailyCooldown { next_claim });
            }
        }

        account.last_daily_claim = Some(now);
        let ops = self.ledger.stage_credit(
            &mut account,
            DAILY_REWARD,
            EntryKind::DailyReward,
            &format!("daily:{}", now.date_naive()),
        )?;
        self.store.write_batch(ops)?;

        tracing::info!(user = %user, reward = %DAILY_REWARD, "Claimed daily reward");
        Ok(DailyClaim {
            reward: DAILY_REWARD,
            balance: account.balance(),
            next_claim_at: now + daily_cooldown(),
        })
    }

    /// Credit every unlocked tier that has not been paid yet
    pub async fn claim_level_rewards(&self, user: &UserId) -> CasinoResult<LevelClaim> {
        user.validate()?;
        let _guard = self.ledger.lock_user(user).await;
        let mut account = self
            .ledger
            .load(user)?
            .ok_or_else(|| CasinoError::InvalidAction("no level rewards to claim".to_string()))?;

        let reward = pending_reward(&account);
        if reward.is_zero() {
            return Err(CasinoError::InvalidAction("no level rewards to claim".to_string()));
        }

        let levels: Vec<u8> = (account.level_claimed + 1..=account.level_reached).collect();
        let cause = format!("levels:{}-{}", account.level_claimed + 1, account.level_reached);
        account.level_claimed = account.level_reached;
        let ops = self
            .ledger
            .stage_credit(&mut account, reward, EntryKind::LevelReward, &cause)?;
        self.store.write_batch(ops)?;

        tracing::info!(user = %user, reward = %reward, ?levels, "Claimed level rewards");
        Ok(LevelClaim {
            levels,
            reward,
            balance: account.balance(),
        })
    }
}
