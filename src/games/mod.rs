//! Game definitions
//!
//! `outcome` turns seeds into results, `paytable` turns results into
//! multipliers, and the per-game modules hold the stateful boards. Nothing in
//! here touches storage or balances.

pub mod blackjack;
pub mod mines;
pub mod outcome;
pub mod paytable;
pub mod tower;

use serde::{Deserialize, Serialize};

use crate::common::types::{GameType, Multiplier};
use crate::errors::CasinoResult;

pub use blackjack::{BlackjackMove, BlackjackResult, BlackjackState};
pub use mines::MinesState;
pub use outcome::CoinSide;
pub use tower::{TowerDifficulty, TowerState};

/// Parameters for a one-shot wager
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "game", rename_all = "lowercase")]
pub enum WagerParams {
    Coinflip { side: CoinSide },
    Limbo { target: Multiplier },
}

impl WagerParams {
    pub fn game_type(&self) -> GameType {
        match self {
            WagerParams::Coinflip { .. } => GameType::Coinflip,
            WagerParams::Limbo { .. } => GameType::Limbo,
        }
    }
}

/// Parameters for opening a multi-step session
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "game", rename_all = "lowercase")]
pub enum SessionParams {
    Mines { mines: u8 },
    Tower { difficulty: TowerDifficulty },
    Blackjack,
}

impl SessionParams {
    pub fn game_type(&self) -> GameType {
        match self {
            SessionParams::Mines { .. } => GameType::Mines,
            SessionParams::Tower { .. } => GameType::Tower,
            SessionParams::Blackjack => GameType::Blackjack,
        }
    }

    /// Reject parameters before any money moves
    pub fn validate(&self) -> CasinoResult<()> {
        match self {
            SessionParams::Mines { mines } => MinesState::validate_mines(*mines),
            SessionParams::Tower { .. } | SessionParams::Blackjack => Ok(()),
        }
    }

    pub fn initial_state(&self, digest: &[u8; 32]) -> CasinoResult<GameState> {
        Ok(match self {
            SessionParams::Mines { mines } => GameState::Mines(MinesState::new(*mines, digest)?),
            SessionParams::Tower { difficulty } => {
                GameState::Tower(TowerState::new(*difficulty, digest))
            }
            SessionParams::Blackjack => GameState::Blackjack(BlackjackState::deal(digest)),
        })
    }
}

/// Board or hand of an open session
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "game", rename_all = "lowercase")]
pub enum GameState {
    Mines(MinesState),
    Tower(TowerState),
    Blackjack(BlackjackState),
}

impl GameState {
    pub fn game_type(&self) -> GameType {
        match self {
            GameState::Mines(_) => GameType::Mines,
            GameState::Tower(_) => GameType::Tower,
            GameState::Blackjack(_) => GameType::Blackjack,
        }
    }

    pub fn is_finished(&self) -> bool {
        match self {
            GameState::Mines(state) => state.is_finished(),
            GameState::Tower(state) => state.is_finished(),
            GameState::Blackjack(state) => state.is_finished(),
        }
    }

    /// Multiplier the stake would be paid at if the session ended now
    pub fn current_multiplier(&self) -> CasinoResult<Multiplier> {
        Ok(match self {
            GameState::Mines(state) => state.current_multiplier()?,
            GameState::Tower(state) => state.current_multiplier(),
            GameState::Blackjack(state) => state
                .result()
                .map(paytable::blackjack_multiplier)
                .unwrap_or(Multiplier::ONE),
        })
    }
}
