//! API Request and Response Models
//!
//! Amounts cross the wire as JSON numbers with at most two decimals and are
//! converted to `Points`/`Multiplier` here. Session views never expose the
//! mine layout, tower layout or dealer hole card while the game is running.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    common::types::{GameType, Multiplier, Points, UserId},
    errors::CasinoResult,
    fairness::PublicPeriod,
    games::{
        blackjack::hand_value, BlackjackResult, CoinSide, GameState, SessionParams,
        TowerDifficulty, WagerParams,
    },
    ledger::Account,
    levels::{self, DailyClaim, LevelClaim},
    sessions::{Session, SessionStatus, SessionUpdate},
    settlement::SettledWager,
    wager_store::{WagerOutcome, WagerRecord},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub user_id: String,
    pub balance: f64,
    pub client_seed: String,
    pub nonce: u64,
    pub total_wagered: f64,
    pub total_won: f64,
    pub games_played: u64,
    pub level: u8,
    pub level_name: Option<String>,
    pub unclaimed_reward: f64,
}

impl From<&Account> for BalanceResponse {
    fn from(account: &Account) -> Self {
        Self {
            user_id: account.user_id.to_string(),
            balance: account.balance().as_f64(),
            client_seed: account.client_seed.clone(),
            nonce: account.nonce,
            total_wagered: account.total_wagered.as_f64(),
            total_won: account.total_won.as_f64(),
            games_played: account.games_played,
            level: account.level_reached,
            level_name: levels::tier_info(account.level_reached).map(|t| t.name.to_string()),
            unclaimed_reward: levels::pending_reward(account).as_f64(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSeedRequest {
    pub client_seed: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LevelClaimResponse {
    pub levels: Vec<u8>,
    pub reward: f64,
    pub balance: f64,
}

impl From<LevelClaim> for LevelClaimResponse {
    fn from(claim: LevelClaim) -> Self {
        Self {
            levels: claim.levels,
            reward: claim.reward.as_f64(),
            balance: claim.balance.as_f64(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyClaimResponse {
    pub reward: f64,
    pub balance: f64,
    pub next_claim_at: DateTime<Utc>,
}

impl From<DailyClaim> for DailyClaimResponse {
    fn from(claim: DailyClaim) -> Self {
        Self {
            reward: claim.reward.as_f64(),
            balance: claim.balance.as_f64(),
            next_claim_at: claim.next_claim_at,
        }
    }
}

/// Game choice for `POST /wagers`
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(tag = "game", rename_all = "lowercase")]
pub enum WagerGame {
    Coinflip { side: CoinSide },
    Limbo { target: f64 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct WagerRequest {
    pub user_id: UserId,
    pub stake: f64,
    #[serde(flatten)]
    pub game: WagerGame,
}

impl WagerRequest {
    pub fn into_parts(self) -> CasinoResult<(UserId, Points, WagerParams)> {
        let stake = Points::from_f64(self.stake)?;
        let params = match self.game {
            WagerGame::Coinflip { side } => WagerParams::Coinflip { side },
            WagerGame::Limbo { target } => WagerParams::Limbo {
                target: Multiplier::from_f64(target)?,
            },
        };
        Ok((self.user_id, stake, params))
    }
}

/// Audit view of a settled wager
#[derive(Debug, Clone, Serialize)]
pub struct WagerView {
    pub id: Uuid,
    pub user_id: String,
    pub game: GameType,
    pub stake: f64,
    pub multiplier: f64,
    pub payout: f64,
    pub outcome: WagerOutcome,
    pub client_seed: String,
    pub server_hash: String,
    pub period_number: u64,
    pub nonce: u64,
    pub result_digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub settled_at: DateTime<Utc>,
}

impl From<&WagerRecord> for WagerView {
    fn from(record: &WagerRecord) -> Self {
        Self {
            id: record.id,
            user_id: record.user_id.to_string(),
            game: record.game_type,
            stake: record.stake.as_f64(),
            multiplier: record.multiplier.as_f64(),
            payout: record.payout.as_f64(),
            outcome: record.outcome.clone(),
            client_seed: record.client_seed.clone(),
            server_hash: record.server_hash.clone(),
            period_number: record.period_number,
            nonce: record.nonce,
            result_digest: record.result_digest.clone(),
            session_id: record.session_id,
            settled_at: record.settled_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WagerResponse {
    pub wager: WagerView,
    pub balance: f64,
}

impl From<SettledWager> for WagerResponse {
    fn from(settled: SettledWager) -> Self {
        Self {
            wager: WagerView::from(&settled.record),
            balance: settled.balance.as_f64(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryResponse {
    pub wagers: Vec<WagerView>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenSessionRequest {
    pub user_id: UserId,
    pub stake: f64,
    #[serde(flatten)]
    pub params: SessionParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloseSessionRequest {
    pub action: crate::sessions::CloseAction,
}

/// Board or hand as the player may see it
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "game", rename_all = "lowercase")]
pub enum GameView {
    Mines {
        mines: u8,
        revealed: Vec<u8>,
        hit_mine: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mine_positions: Option<Vec<u8>>,
    },
    Tower {
        difficulty: TowerDifficulty,
        picks: Vec<u8>,
        cleared_rows: usize,
        hit_mine: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        layout: Option<Vec<Vec<u8>>>,
    },
    Blackjack {
        player: Vec<u8>,
        player_value: u8,
        /// Only the upcard while the hand is in play
        dealer: Vec<u8>,
        dealer_value: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<BlackjackResult>,
    },
}

impl GameView {
    fn of(state: &GameState, reveal: bool) -> Self {
        match state {
            GameState::Mines(board) => GameView::Mines {
                mines: board.mines,
                revealed: board.revealed.clone(),
                hit_mine: board.hit_mine,
                mine_positions: reveal.then(|| board.mine_positions().to_vec()),
            },
            GameState::Tower(tower) => GameView::Tower {
                difficulty: tower.difficulty,
                picks: tower.picks.clone(),
                cleared_rows: tower.cleared_rows(),
                hit_mine: tower.hit_mine,
                layout: reveal.then(|| tower.layout().to_vec()),
            },
            GameState::Blackjack(hand) => {
                let dealer = if reveal {
                    hand.dealer.clone()
                } else {
                    vec![hand.dealer_upcard()]
                };
                GameView::Blackjack {
                    player: hand.player.clone(),
                    player_value: hand.player_value(),
                    dealer_value: hand_value(&dealer).0,
                    dealer,
                    result: hand.result(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: Uuid,
    pub user_id: String,
    pub game: GameType,
    pub status: SessionStatus,
    pub stake: f64,
    pub multiplier: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout: Option<f64>,
    pub state: GameView,
    pub server_hash: String,
    pub nonce: u64,
    /// Actions after this instant are refused and the session is resolved
    pub playable_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_action_at: DateTime<Utc>,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        let reveal = session.status.is_terminal() || session.state.is_finished();
        Self {
            id: session.id,
            user_id: session.user_id.to_string(),
            game: session.game_type,
            status: session.status,
            stake: session.stake.as_f64(),
            multiplier: session.multiplier.as_f64(),
            payout: session.payout.map(Points::as_f64),
            state: GameView::of(&session.state, reveal),
            server_hash: session.server_hash.clone(),
            nonce: session.nonce,
            playable_until: session.period_ends_at,
            created_at: session.created_at,
            last_action_at: session.last_action_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionResponse {
    pub session: SessionView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wager: Option<WagerView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
}

impl From<SessionUpdate> for SessionResponse {
    fn from(update: SessionUpdate) -> Self {
        Self {
            session: SessionView::from(&update.session),
            wager: update.settled.as_ref().map(WagerView::from),
            balance: update.balance.map(Points::as_f64),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PeriodsResponse {
    pub periods: Vec<PublicPeriod>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::{outcome::outcome_digest, MinesState};

    #[test]
    fn test_wager_request_parsing() {
        let req: WagerRequest = serde_json::from_str(
            r#"{"user_id":"42","stake":12.5,"game":"limbo","target":2.25}"#,
        )
        .unwrap();
        let (user, stake, params) = req.into_parts().unwrap();
        assert_eq!(user.as_str(), "42");
        assert_eq!(stake, Points::from_cents(1_250));
        assert_eq!(
            params,
            WagerParams::Limbo {
                target: Multiplier::from_hundredths(225)
            }
        );

        let req: WagerRequest =
            serde_json::from_str(r#"{"user_id":"42","stake":1.005,"game":"coinflip","side":"heads"}"#)
                .unwrap();
        assert!(req.into_parts().is_err());
    }

    #[test]
    fn test_active_board_hides_mines() {
        let digest = outcome_digest("secret", "seed", 0);
        let board = MinesState::new(3, &digest).unwrap();
        let state = GameState::Mines(board);

        let hidden = serde_json::to_value(GameView::of(&state, false)).unwrap();
        assert!(hidden.get("mine_positions").is_none());

        let shown = serde_json::to_value(GameView::of(&state, true)).unwrap();
        assert_eq!(shown["mine_positions"].as_array().unwrap().len(), 3);
    }
}
