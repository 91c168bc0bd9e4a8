//! Fairstake - ledger-consistent wager settlement with provably fair outcomes
//!
//! Every game result is derived from `SHA-256(server_secret:client_seed:nonce)`
//! where the hash of the server secret is published before the period opens
//! and the secret itself only after it closes. Balances move exclusively
//! through the ledger, in atomic batches, under a per-user lock.

pub mod api;
pub mod cashier;
pub mod casino;
pub mod common;
pub mod config;
pub mod errors;
pub mod fairness;
pub mod games;
pub mod ledger;
pub mod levels;
pub mod locks;
pub mod metrics;
pub mod recovery;
pub mod sessions;
pub mod settlement;
pub mod storage;
pub mod wager_store;

pub use casino::Casino;
pub use common::types::{GameType, Multiplier, Points, UserId};
pub use config::{CasinoConfig, ConfigLoader};
pub use errors::{CasinoError, CasinoResult};
