//! Mines: a 5x5 board with `mines` hidden bombs

use serde::{Deserialize, Serialize};

use crate::{
    common::types::Multiplier,
    errors::{CasinoError, CasinoResult},
    games::{
        outcome::{pick_positions, DigestStream},
        paytable::{self, MINES_TILES},
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RevealOutcome {
    Safe {
        multiplier: Multiplier,
        board_cleared: bool,
    },
    Mine,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MinesState {
    pub mines: u8,
    mine_positions: Vec<u8>,
    /// Safe tiles in the order they were revealed
    pub revealed: Vec<u8>,
    pub hit_mine: Option<u8>,
}

impl MinesState {
    pub fn validate_mines(mines: u8) -> CasinoResult<()> {
        if mines == 0 || mines >= MINES_TILES {
            return Err(CasinoError::InvalidParams(format!(
                "mines must be between 1 and {}",
                MINES_TILES - 1
            )));
        }
        Ok(())
    }

    pub fn new(mines: u8, digest: &[u8; 32]) -> CasinoResult<Self> {
        Self::validate_mines(mines)?;
        let mut stream = DigestStream::new(*digest);
        Ok(Self {
            mines,
            mine_positions: pick_positions(&mut stream, MINES_TILES, mines),
            revealed: Vec::new(),
            hit_mine: None,
        })
    }

    pub fn safe_tiles(&self) -> u8 {
        MINES_TILES - self.mines
    }

    pub fn is_finished(&self) -> bool {
        self.hit_mine.is_some() || self.revealed.len() as u8 == self.safe_tiles()
    }

    /// Mine layout, only meant to be shown once the board is finished
    pub fn mine_positions(&self) -> &[u8] {
        &self.mine_positions
    }

    pub fn reveal(&mut self, tile: u8) -> CasinoResult<RevealOutcome> {
        if tile >= MINES_TILES {
            return Err(CasinoError::InvalidAction(format!(
                "tile {} is outside the board",
                tile
            )));
        }
        if self.is_finished() {
            return Err(CasinoError::InvalidAction("board is already finished".to_string()));
        }
        if self.revealed.contains(&tile) {
            return Err(CasinoError::TileAlreadyRevealed(tile));
        }

        if self.mine_positions.binary_search(&tile).is_ok() {
            self.hit_mine = Some(tile);
            return Ok(RevealOutcome::Mine);
        }

        self.revealed.push(tile);
        Ok(RevealOutcome::Safe {
            multiplier: self.current_multiplier()?,
            board_cleared: self.is_finished(),
        })
    }

    /// Multiplier the player would cash out at right now
    pub fn current_multiplier(&self) -> CasinoResult<Multiplier> {
        if self.revealed.is_empty() {
            return Ok(Multiplier::ONE);
        }
        paytable::mines_multiplier(self.mines, self.revealed.len() as u8)
    }

    /// Final multiplier: zero after a mine, table value otherwise
    pub fn payout_multiplier(&self) -> CasinoResult<Multiplier> {
        if self.hit_mine.is_some() {
            return Ok(Multiplier::ZERO);
        }
        self.current_multiplier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::outcome::outcome_digest;

    fn board(mines: u8) -> MinesState {
        MinesState::new(mines, &outcome_digest("secret", "seed", 1)).unwrap()
    }

    fn first_safe(state: &MinesState) -> u8 {
        (0..MINES_TILES)
            .find(|t| !state.mine_positions().contains(t) && !state.revealed.contains(t))
            .unwrap()
    }

    #[test]
    fn test_layout_is_deterministic() {
        assert_eq!(board(5), board(5));
        assert_eq!(board(5).mine_positions().len(), 5);
    }

    #[test]
    fn test_rejects_bad_mine_counts() {
        let digest = outcome_digest("secret", "seed", 1);
        assert!(MinesState::new(0, &digest).is_err());
        assert!(MinesState::new(25, &digest).is_err());
        assert!(MinesState::new(24, &digest).is_ok());
    }

    #[test]
    fn test_safe_reveals_follow_table() {
        let mut state = board(5);
        for _ in 0..3 {
            let tile = first_safe(&state);
            assert!(matches!(state.reveal(tile).unwrap(), RevealOutcome::Safe { .. }));
        }
        assert_eq!(state.current_multiplier().unwrap(), Multiplier::from_hundredths(197));
    }

    #[test]
    fn test_double_reveal_rejected() {
        let mut state = board(3);
        let tile = first_safe(&state);
        state.reveal(tile).unwrap();
        assert!(matches!(state.reveal(tile), Err(CasinoError::TileAlreadyRevealed(t)) if t == tile));
        assert!(state.reveal(MINES_TILES).is_err());
    }

    #[test]
    fn test_mine_ends_board() {
        let mut state = board(3);
        let mine = state.mine_positions()[0];
        assert_eq!(state.reveal(mine).unwrap(), RevealOutcome::Mine);
        assert!(state.is_finished());
        assert_eq!(state.payout_multiplier().unwrap(), Multiplier::ZERO);
        assert!(state.reveal(first_safe(&state)).is_err());
    }

    #[test]
    fn test_clearing_board_finishes() {
        let mut state = board(24);
        let tile = first_safe(&state);
        match state.reveal(tile).unwrap() {
            RevealOutcome::Safe { board_cleared, multiplier } => {
                assert!(board_cleared);
                assert_eq!(multiplier, Multiplier::from_hundredths(2450));
            }
            RevealOutcome::Mine => panic!("expected a safe tile"),
        }
    }
}
