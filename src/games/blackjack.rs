//! Single-deck blackjack against a dealer who stands on all 17s
//!
//! Cards are `0..52`; `card % 13` is the rank with 0 = ace and 9..=12 the
//! ten-value cards.

use serde::{Deserialize, Serialize};

use crate::{
    errors::{CasinoError, CasinoResult},
    games::outcome::{shuffled_deck, DigestStream},
};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlackjackMove {
    Hit,
    Stand,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlackjackResult {
    /// Player natural against a dealer without one
    Blackjack,
    Win,
    DealerBust,
    Push,
    Lose,
    Bust,
}

/// Hand total with aces counted as 11 where that doesn't bust, and whether
/// an ace is still counted as 11
pub fn hand_value(cards: &[u8]) -> (u8, bool) {
    let mut value: u16 = 0;
    let mut aces: u8 = 0;

    for &card in cards {
        let rank = card % 13;
        if rank == 0 {
            aces += 1;
            value += 11;
        } else if rank >= 9 {
            value += 10;
        } else {
            value += rank as u16 + 1;
        }
    }

    while value > 21 && aces > 0 {
        value -= 10;
        aces -= 1;
    }

    (value.min(255) as u8, aces > 0)
}

pub fn is_natural(cards: &[u8]) -> bool {
    cards.len() == 2 && hand_value(cards).0 == 21
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlackjackState {
    deck: Vec<u8>,
    next_card: usize,
    pub player: Vec<u8>,
    pub dealer: Vec<u8>,
    /// Player moves in order, for replay
    pub moves: Vec<BlackjackMove>,
    result: Option<BlackjackResult>,
}

impl BlackjackState {
    /// Shuffle and deal; naturals are resolved immediately
    pub fn deal(digest: &[u8; 32]) -> Self {
        let mut stream = DigestStream::new(*digest);
        let deck = shuffled_deck(&mut stream);
        let mut state = Self {
            player: vec![deck[0], deck[2]],
            dealer: vec![deck[1], deck[3]],
            deck,
            next_card: 4,
            moves: Vec::new(),
            result: None,
        };

        state.result = match (is_natural(&state.player), is_natural(&state.dealer)) {
            (true, true) => Some(BlackjackResult::Push),
            (true, false) => Some(BlackjackResult::Blackjack),
            (false, true) => Some(BlackjackResult::Lose),
            (false, false) => None,
        };
        state
    }

    pub fn result(&self) -> Option<BlackjackResult> {
        self.result
    }

    pub fn is_finished(&self) -> bool {
        self.result.is_some()
    }

    pub fn player_value(&self) -> u8 {
        hand_value(&self.player).0
    }

    pub fn dealer_value(&self) -> u8 {
        hand_value(&self.dealer).0
    }

    /// The dealer's face-up card
    pub fn dealer_upcard(&self) -> u8 {
        self.dealer[0]
    }

    fn draw(&mut self) -> CasinoResult<u8> {
        let card = self
            .deck
            .get(self.next_card)
            .copied()
            .ok_or_else(|| CasinoError::InvalidAction("deck exhausted".to_string()))?;
        self.next_card += 1;
        Ok(card)
    }

    pub fn apply(&mut self, action: BlackjackMove) -> CasinoResult<Option<BlackjackResult>> {
        if self.is_finished() {
            return Err(CasinoError::InvalidAction("hand is already finished".to_string()));
        }
        self.moves.push(action);

        match action {
            BlackjackMove::Hit => {
                let card = self.draw()?;
                self.player.push(card);
                let value = self.player_value();
                if value > 21 {
                    self.result = Some(BlackjackResult::Bust);
                } else if value == 21 {
                    self.play_dealer()?;
                }
            }
            BlackjackMove::Stand => self.play_dealer()?,
        }
        Ok(self.result)
    }

    fn play_dealer(&mut self) -> CasinoResult<()> {
        while self.dealer_value() < 17 {
            let card = self.draw()?;
            self.dealer.push(card);
        }

        let player = self.player_value();
        let dealer = self.dealer_value();
        self.result = Some(if dealer > 21 {
            BlackjackResult::DealerBust
        } else if player > dealer {
            BlackjackResult::Win
        } else if player == dealer {
            BlackjackResult::Push
        } else {
            BlackjackResult::Lose
        });
        Ok(())
    }
}
