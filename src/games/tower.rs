//! Tower: climb eight rows, picking one column per row

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    common::types::Multiplier,
    errors::{CasinoError, CasinoResult},
    games::{
        outcome::{pick_positions, DigestStream},
        paytable,
    },
};

pub const TOWER_ROWS: usize = 8;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TowerDifficulty {
    Easy,
    Medium,
    Hard,
}

impl TowerDifficulty {
    pub fn columns(self) -> u8 {
        match self {
            TowerDifficulty::Easy => 4,
            TowerDifficulty::Medium | TowerDifficulty::Hard => 3,
        }
    }

    pub fn mines_per_row(self) -> u8 {
        match self {
            TowerDifficulty::Easy | TowerDifficulty::Medium => 1,
            TowerDifficulty::Hard => 2,
        }
    }
}

impl fmt::Display for TowerDifficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TowerDifficulty::Easy => "easy",
            TowerDifficulty::Medium => "medium",
            TowerDifficulty::Hard => "hard",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PickOutcome {
    Safe {
        multiplier: Multiplier,
        reached_top: bool,
    },
    Mine,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TowerState {
    pub difficulty: TowerDifficulty,
    /// Mine columns for each row, bottom row first
    layout: Vec<Vec<u8>>,
    /// Column chosen on each row climbed so far
    pub picks: Vec<u8>,
    pub hit_mine: bool,
}

impl TowerState {
    pub fn new(difficulty: TowerDifficulty, digest: &[u8; 32]) -> Self {
        let mut stream = DigestStream::new(*digest);
        let layout = (0..TOWER_ROWS)
            .map(|_| pick_positions(&mut stream, difficulty.columns(), difficulty.mines_per_row()))
            .collect();
        Self {
            difficulty,
            layout,
            picks: Vec::new(),
            hit_mine: false,
        }
    }

    /// Rows cleared without hitting a mine
    pub fn cleared_rows(&self) -> usize {
        if self.hit_mine {
            self.picks.len().saturating_sub(1)
        } else {
            self.picks.len()
        }
    }

    pub fn current_row(&self) -> usize {
        self.picks.len()
    }

    pub fn is_finished(&self) -> bool {
        self.hit_mine || self.picks.len() == TOWER_ROWS
    }

    pub fn layout(&self) -> &[Vec<u8>] {
        &self.layout
    }

    pub fn pick(&mut self, column: u8) -> CasinoResult<PickOutcome> {
        if column >= self.difficulty.columns() {
            return Err(CasinoError::InvalidAction(format!(
                "column {} does not exist on {} difficulty",
                column, self.difficulty
            )));
        }
        if self.is_finished() {
            return Err(CasinoError::InvalidAction("tower is already finished".to_string()));
        }

        let row = self.current_row();
        self.picks.push(column);
        if self.layout[row].contains(&column) {
            self.hit_mine = true;
            return Ok(PickOutcome::Mine);
        }

        Ok(PickOutcome::Safe {
            multiplier: self.current_multiplier(),
            reached_top: self.is_finished(),
        })
    }

    pub fn current_multiplier(&self) -> Multiplier {
        paytable::tower_multiplier(self.difficulty, self.cleared_rows() as u32)
    }

    pub fn payout_multiplier(&self) -> Multiplier {
        if self.hit_mine {
            Multiplier::ZERO
        } else {
            self.current_multiplier()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::outcome::outcome_digest;

    fn tower(difficulty: TowerDifficulty) -> TowerState {
        TowerState::new(difficulty, &outcome_digest("secret", "tower", 9))
    }

    fn safe_column(state: &TowerState) -> u8 {
        let row = &state.layout()[state.current_row()];
        (0..state.difficulty.columns()).find(|c| !row.contains(c)).unwrap()
    }

    #[test]
    fn test_layout_shape() {
        for difficulty in [TowerDifficulty::Easy, TowerDifficulty::Medium, TowerDifficulty::Hard] {
            let state = tower(difficulty);
            assert_eq!(state.layout().len(), TOWER_ROWS);
            for row in state.layout() {
                assert_eq!(row.len(), difficulty.mines_per_row() as usize);
                assert!(row.iter().all(|&c| c < difficulty.columns()));
            }
        }
    }

    #[test]
    fn test_climb_to_top() {
        let mut state = tower(TowerDifficulty::Medium);
        for row in 0..TOWER_ROWS {
            let column = safe_column(&state);
            match state.pick(column).unwrap() {
                PickOutcome::Safe { reached_top, .. } => assert_eq!(reached_top, row == TOWER_ROWS - 1),
                PickOutcome::Mine => panic!("picked a mine"),
            }
        }
        assert!(state.is_finished());
        assert_eq!(
            state.payout_multiplier(),
            paytable::tower_multiplier(TowerDifficulty::Medium, TOWER_ROWS as u32)
        );
        assert!(state.pick(0).is_err());
    }

    #[test]
    fn test_mine_loses_everything() {
        let mut state = tower(TowerDifficulty::Hard);
        let column = safe_column(&state);
        state.pick(column).unwrap();
        let mine = state.layout()[1][0];
        assert_eq!(state.pick(mine).unwrap(), PickOutcome::Mine);
        assert_eq!(state.cleared_rows(), 1);
        assert_eq!(state.payout_multiplier(), Multiplier::ZERO);
    }

    #[test]
    fn test_invalid_column() {
        let mut state = tower(TowerDifficulty::Easy);
        assert!(state.pick(4).is_err());
        assert!(state.picks.is_empty());
    }
}
