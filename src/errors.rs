//! Error types for the fairstake wager engine
//!
//! `CasinoError` is the taxonomy surfaced to callers. Storage and configuration
//! failures carry their own enums and convert into it.

use chrono::{DateTime, Utc};

use crate::common::types::{GameType, Points};

/// Root error type for all wager, session and ledger operations
#[derive(Debug, thiserror::Error)]
pub enum CasinoError {
    /// Stake outside the game's limits, non-positive, or malformed
    #[error("Invalid stake: {0}")]
    InvalidStake(String),

    #[error("Invalid game parameters: {0}")]
    InvalidParams(String),

    #[error("Insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds { needed: Points, available: Points },

    #[error("An active {game_type} session already exists")]
    SessionAlreadyActive { game_type: GameType },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} is no longer active")]
    SessionNotActive(String),

    /// Another action on the same session (or withdrawal for the same user) is in flight
    #[error("Another action is already in progress")]
    ActionInProgress,

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Tile {0} was already revealed")]
    TileAlreadyRevealed(u8),

    /// The session's fair-play period ended, so the engine resolved it
    /// instead of applying the action
    #[error("Session {0} was closed because its fair-play period ended")]
    PeriodClosed(String),

    #[error("Daily reward already claimed, next claim at {next_claim}")]
    DailyCooldown { next_claim: DateTime<Utc> },

    #[error("Period {period} cannot be revealed before {ends_at}")]
    EarlyReveal { period: u64, ends_at: String },

    #[error("Fair-play period not found: {0}")]
    PeriodNotFound(u64),

    #[error("Fair-play period {0} already exists")]
    DuplicatePeriod(u64),

    /// Storage or dependent-service failure in the middle of a settlement.
    /// `refunded` is true when the balance is already back where it started;
    /// false means the stake is parked for the recovery sweep.
    #[error("Settlement infrastructure failure (refunded: {refunded}): {reason}")]
    SettlementInfraFailure { reason: String, refunded: bool },

    #[error("No pay table entry for {0}")]
    PayTableGap(String),

    #[error("Deposit {0} already credited")]
    DuplicateDeposit(String),

    #[error("Deposit has {have} confirmations, {need} required")]
    AwaitingConfirmations { have: u32, need: u32 },

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

impl CasinoError {
    /// Validation and concurrency-guard errors leave no state behind and are
    /// never retried by the engine.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            CasinoError::InvalidStake(_)
                | CasinoError::InvalidParams(_)
                | CasinoError::InsufficientFunds { .. }
                | CasinoError::SessionAlreadyActive { .. }
                | CasinoError::SessionNotFound(_)
                | CasinoError::SessionNotActive(_)
                | CasinoError::ActionInProgress
                | CasinoError::InvalidAction(_)
                | CasinoError::TileAlreadyRevealed(_)
                | CasinoError::PeriodClosed(_)
                | CasinoError::DailyCooldown { .. }
                | CasinoError::EarlyReveal { .. }
                | CasinoError::DuplicateDeposit(_)
                | CasinoError::AwaitingConfirmations { .. }
        )
    }
}

/// Storage system errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database open failed: {0}")]
    DatabaseOpenFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),
}

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::WriteFailed(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::CorruptedData(e.to_string())
    }
}

// Convenience type alias for Results
pub type CasinoResult<T> = Result<T, CasinoError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_insufficient_funds_display() {
        let err = CasinoError::InsufficientFunds {
            needed: Points::from_cents(1000),
            available: Points::from_cents(250),
        };

        assert!(err.to_string().contains("needed 10.00"));
        assert!(err.to_string().contains("available 2.50"));
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: CasinoError = StorageError::WriteFailed("disk full".to_string()).into();

        match &err {
            CasinoError::Storage(StorageError::WriteFailed(msg)) => assert_eq!(msg, "disk full"),
            _ => panic!("Expected storage error"),
        }
        assert!(err.source().is_some());
        assert!(!err.is_user_error());
    }

    #[test]
    fn test_user_errors_are_classified() {
        assert!(CasinoError::ActionInProgress.is_user_error());
        assert!(CasinoError::InvalidStake("0".to_string()).is_user_error());
        assert!(!CasinoError::SettlementInfraFailure {
            reason: "db down".to_string(),
            refunded: true,
        }
        .is_user_error());
    }
}
