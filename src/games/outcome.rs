//! Outcome generator
//!
//! Every game result is derived from
//! `SHA-256("{server_secret}:{client_seed}:{nonce}")`. The digest is extended
//! by re-hashing when a game needs more than 32 bytes, so the same inputs
//! always reproduce the same board, deck or roll.

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::{
    common::types::Multiplier,
    games::{
        blackjack::BlackjackState, mines::MinesState, paytable, tower::TowerState,
    },
    wager_store::{WagerOutcome, WagerRecord},
};

pub const SERVER_SECRET_BYTES: usize = 32;
pub const LIMBO_MIN_TARGET: Multiplier = Multiplier::from_hundredths(101);
pub const LIMBO_MAX_RESULT: Multiplier = Multiplier::from_hundredths(100_000);

/// Fresh server secret from the OS CSPRNG, hex encoded
pub fn generate_server_secret() -> String {
    let mut bytes = [0u8; SERVER_SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Commitment published before the secret is used
pub fn hash_secret(server_secret: &str) -> String {
    hex::encode(Sha256::digest(server_secret.as_bytes()))
}

pub fn outcome_digest(server_secret: &str, client_seed: &str, nonce: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}:{}", server_secret, client_seed, nonce).as_bytes());
    hasher.finalize().into()
}

/// Deterministic byte stream seeded by an outcome digest
#[derive(Clone)]
pub struct DigestStream {
    state: [u8; 32],
    index: usize,
}

impl DigestStream {
    pub fn new(digest: [u8; 32]) -> Self {
        Self {
            state: digest,
            index: 0,
        }
    }

    pub fn next_u8(&mut self) -> u8 {
        if self.index >= self.state.len() {
            self.state = Sha256::digest(self.state).into();
            self.index = 0;
        }
        let byte = self.state[self.index];
        self.index += 1;
        byte
    }

    pub fn next_u32(&mut self) -> u32 {
        u32::from_be_bytes([self.next_u8(), self.next_u8(), self.next_u8(), self.next_u8()])
    }

    /// Uniform value in `[0, bound)`
    pub fn next_bounded(&mut self, bound: u32) -> u32 {
        if bound <= 1 {
            return 0;
        }
        let span = 1u64 << 32;
        let zone = span - (span % bound as u64);
        loop {
            let value = self.next_u32() as u64;
            if value < zone {
                return (value % bound as u64) as u32;
            }
        }
    }

    /// Fisher-Yates
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.next_bounded((i + 1) as u32) as usize;
            items.swap(i, j);
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CoinSide {
    Heads,
    Tails,
}

impl fmt::Display for CoinSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoinSide::Heads => f.write_str("heads"),
            CoinSide::Tails => f.write_str("tails"),
        }
    }
}

pub fn coinflip(digest: &[u8; 32]) -> CoinSide {
    if digest[0] % 2 == 0 {
        CoinSide::Heads
    } else {
        CoinSide::Tails
    }
}

/// Crash point in `[1.00x, 1000.00x]` with the house edge baked in
pub fn limbo_result(digest: &[u8; 32]) -> Multiplier {
    let x = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as u128;
    let span = 1u128 << 32;
    let edge_scaled = (10_000 - paytable::HOUSE_EDGE_BPS as u128) / 100;
    let hundredths = edge_scaled * span / (span - x);
    let clamped = hundredths.clamp(100, LIMBO_MAX_RESULT.hundredths() as u128);
    Multiplier::from_hundredths(clamped as u32)
}

/// First `count` entries of a stream-shuffled `0..size`
pub fn pick_positions(stream: &mut DigestStream, size: u8, count: u8) -> Vec<u8> {
    let mut cells: Vec<u8> = (0..size).collect();
    stream.shuffle(&mut cells);
    let mut picked: Vec<u8> = cells.into_iter().take(count as usize).collect();
    picked.sort_unstable();
    picked
}

pub fn shuffled_deck(stream: &mut DigestStream) -> Vec<u8> {
    let mut deck: Vec<u8> = (0..52).collect();
    stream.shuffle(&mut deck);
    deck
}

/// Result of checking a settled wager against a revealed secret
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationReport {
    pub hash_matches: bool,
    pub digest_matches: bool,
    pub outcome_matches: bool,
    pub payout_matches: bool,
    pub mismatches: Vec<String>,
}

impl VerificationReport {
    pub fn is_valid(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Recompute a wager from its revealed server secret
///
/// Stateful games are replayed from the recorded player moves, so the board
/// or deck, the terminal state and the payout are all checked.
pub fn verify_wager(record: &WagerRecord, revealed_secret: &str) -> VerificationReport {
    let mut report = VerificationReport::default();

    report.hash_matches = hash_secret(revealed_secret) == record.server_hash;
    if !report.hash_matches {
        report
            .mismatches
            .push("server secret does not hash to the committed server hash".to_string());
    }

    let digest = outcome_digest(revealed_secret, &record.client_seed, record.nonce);
    report.digest_matches = hex::encode(digest) == record.result_digest;
    if !report.digest_matches {
        report.mismatches.push("result digest differs from recomputed digest".to_string());
    }

    let replayed = match replay_outcome(record, &digest) {
        Ok(replayed) => replayed,
        Err(reason) => {
            report.mismatches.push(reason);
            return report;
        }
    };

    match replayed {
        None => {
            // Refunds carry no game result; only the commitment is checked.
            report.outcome_matches = true;
            report.payout_matches = record.payout == record.stake;
            if !report.payout_matches {
                report.mismatches.push("refund does not equal stake".to_string());
            }
        }
        Some((outcome, multiplier)) => {
            report.outcome_matches = outcome == record.outcome;
            if !report.outcome_matches {
                report.mismatches.push("recorded outcome differs from replay".to_string());
            }
            let expected = record.stake.scale(multiplier);
            report.payout_matches = expected == record.payout && multiplier == record.multiplier;
            if !report.payout_matches {
                report.mismatches.push(format!(
                    "payout {} at {} does not match expected {} at {}",
                    record.payout, record.multiplier, expected, multiplier
                ));
            }
        }
    }

    report
}

fn replay_outcome(
    record: &WagerRecord,
    digest: &[u8; 32],
) -> Result<Option<(WagerOutcome, Multiplier)>, String> {
    let outcome = match &record.outcome {
        WagerOutcome::Refunded { .. } => return Ok(None),
        WagerOutcome::Coinflip { choice, .. } => {
            let result = coinflip(digest);
            let multiplier = paytable::coinflip_multiplier(*choice, result);
            (WagerOutcome::Coinflip { choice: *choice, result }, multiplier)
        }
        WagerOutcome::Limbo { target, .. } => {
            let result = limbo_result(digest);
            let multiplier = paytable::limbo_multiplier(*target, result);
            (WagerOutcome::Limbo { target: *target, result }, multiplier)
        }
        WagerOutcome::Mines(recorded) => {
            let mut state = MinesState::new(recorded.mines, digest).map_err(|e| e.to_string())?;
            for &tile in &recorded.revealed {
                state.reveal(tile).map_err(|e| format!("replay of tile {} failed: {}", tile, e))?;
            }
            if let Some(tile) = recorded.hit_mine {
                state.reveal(tile).map_err(|e| format!("replay of tile {} failed: {}", tile, e))?;
            }
            let multiplier = state.payout_multiplier().map_err(|e| e.to_string())?;
            (WagerOutcome::Mines(state), multiplier)
        }
        WagerOutcome::Tower(recorded) => {
            let mut state = TowerState::new(recorded.difficulty, digest);
            for &column in &recorded.picks {
                state
                    .pick(column)
                    .map_err(|e| format!("replay of column {} failed: {}", column, e))?;
            }
            let multiplier = state.payout_multiplier();
            (WagerOutcome::Tower(state), multiplier)
        }
        WagerOutcome::Blackjack(recorded) => {
            let mut state = BlackjackState::deal(digest);
            for &action in &recorded.moves {
                if state.is_finished() {
                    break;
                }
                state.apply(action).map_err(|e| format!("replay of {:?} failed: {}", action, e))?;
            }
            let multiplier = state
                .result()
                .map(paytable::blackjack_multiplier)
                .ok_or_else(|| "blackjack hand did not finish on replay".to_string())?;
            (WagerOutcome::Blackjack(state), multiplier)
        }
    };

    if outcome.0.game_type() != Some(record.game_type) {
        return Err(format!("outcome does not belong to a {} wager", record.game_type));
    }
    Ok(Some(outcome))
}
