//! Pay tables for every game
//!
//! The house edge is a constant. All multipliers are truncated to hundredths
//! so that the edge is never rounded in the player's favour.

use once_cell::sync::Lazy;
use std::collections::BTreeMap;

use crate::{
    common::types::Multiplier,
    errors::{CasinoError, CasinoResult},
    games::{blackjack::BlackjackResult, outcome::CoinSide, tower::TowerDifficulty},
};

pub const HOUSE_EDGE_BPS: u32 = 200;
pub const MINES_TILES: u8 = 25;

/// Payout factor in hundredths before any odds are applied (98 for a 2% edge)
const RETURN_HUNDREDTHS: u128 = (10_000 - HOUSE_EDGE_BPS as u128) / 100;

pub const COINFLIP_WIN: Multiplier = Multiplier::from_hundredths(196);
pub const BLACKJACK_NATURAL: Multiplier = Multiplier::from_hundredths(250);
pub const BLACKJACK_WIN: Multiplier = Multiplier::from_hundredths(200);

pub fn coinflip_multiplier(choice: CoinSide, result: CoinSide) -> Multiplier {
    if choice == result {
        COINFLIP_WIN
    } else {
        Multiplier::ZERO
    }
}

/// A limbo bet pays its target when the drawn result reaches it
pub fn limbo_multiplier(target: Multiplier, result: Multiplier) -> Multiplier {
    if result >= target {
        target
    } else {
        Multiplier::ZERO
    }
}

pub fn blackjack_multiplier(result: BlackjackResult) -> Multiplier {
    match result {
        BlackjackResult::Blackjack => BLACKJACK_NATURAL,
        BlackjackResult::Win | BlackjackResult::DealerBust => BLACKJACK_WIN,
        BlackjackResult::Push => Multiplier::ONE,
        BlackjackResult::Lose | BlackjackResult::Bust => Multiplier::ZERO,
    }
}

fn binomial(n: u128, k: u128) -> u128 {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    (0..k).fold(1u128, |acc, i| acc * (n - i) / (i + 1))
}

/// Precomputed `(mines, safe reveals) -> multiplier` table
static MINES_TABLE: Lazy<BTreeMap<(u8, u8), Multiplier>> = Lazy::new(|| {
    let mut table = BTreeMap::new();
    let tiles = MINES_TILES as u128;
    for mines in 1..MINES_TILES {
        let safe = MINES_TILES - mines;
        for revealed in 1..=safe {
            let all = binomial(tiles, revealed as u128);
            let safe_ways = binomial(safe as u128, revealed as u128);
            let hundredths = RETURN_HUNDREDTHS * all / safe_ways;
            table.insert(
                (mines, revealed),
                Multiplier::from_hundredths(hundredths.min(u32::MAX as u128) as u32),
            );
        }
    }
    table
});

pub fn mines_multiplier(mines: u8, revealed: u8) -> CasinoResult<Multiplier> {
    MINES_TABLE.get(&(mines, revealed)).copied().ok_or_else(|| {
        CasinoError::PayTableGap(format!("mines={} revealed={}", mines, revealed))
    })
}

/// Multiplier after clearing `rows` tower rows
pub fn tower_multiplier(difficulty: TowerDifficulty, rows: u32) -> Multiplier {
    if rows == 0 {
        return Multiplier::ONE;
    }
    let columns = difficulty.columns() as u128;
    let safe = (difficulty.columns() - difficulty.mines_per_row()) as u128;
    let hundredths = RETURN_HUNDREDTHS * columns.pow(rows) / safe.pow(rows);
    Multiplier::from_hundredths(hundredths.min(u32::MAX as u128) as u32)
}
