//! Shared value types for the wager engine
//!
//! Amounts are fixed-point so that ledger arithmetic is exact: `Points` counts
//! hundredths of a point and `Multiplier` counts hundredths of "x".

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{CasinoError, CasinoResult};

/// A non-negative point amount with two-decimal precision
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Points(u64);

impl Points {
    pub const ZERO: Points = Points(0);

    pub const fn from_cents(cents: u64) -> Self {
        Points(cents)
    }

    pub const fn whole(points: u64) -> Self {
        Points(points * 100)
    }

    pub const fn cents(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Points) -> Option<Points> {
        self.0.checked_add(other.0).map(Points)
    }

    pub fn checked_sub(self, other: Points) -> Option<Points> {
        self.0.checked_sub(other.0).map(Points)
    }

    pub fn saturating_add(self, other: Points) -> Points {
        Points(self.0.saturating_add(other.0))
    }

    /// Multiply by a multiplier, rounding half-up to the nearest cent.
    pub fn scale(self, multiplier: Multiplier) -> Points {
        let product = self.0 as u128 * multiplier.hundredths() as u128;
        let rounded = (product + 50) / 100;
        Points(rounded.min(u64::MAX as u128) as u64)
    }

    /// Convert a JSON-style float into points, rejecting more than two decimals.
    pub fn from_f64(value: f64) -> CasinoResult<Points> {
        if !value.is_finite() || value < 0.0 {
            return Err(CasinoError::InvalidStake(format!("{} is not a valid amount", value)));
        }
        let scaled = value * 100.0;
        let rounded = scaled.round();
        if (scaled - rounded).abs() > 1e-6 {
            return Err(CasinoError::InvalidStake(format!(
                "{} has more than two decimal places",
                value
            )));
        }
        if rounded > u64::MAX as f64 {
            return Err(CasinoError::InvalidStake(format!("{} is too large", value)));
        }
        Ok(Points(rounded as u64))
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for Points {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl FromStr for Points {
    type Err = CasinoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CasinoError::InvalidStake(format!("'{}' is not a valid amount", s));
        let s = s.trim();
        if s.is_empty() || s.starts_with('-') || s.starts_with('+') {
            return Err(invalid());
        }

        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if frac.len() > 2 || (whole.is_empty() && frac.is_empty()) {
            return Err(invalid());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }

        let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| invalid())? };
        let frac_cents: u64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<u64>().map_err(|_| invalid())? * 10,
            _ => frac.parse().map_err(|_| invalid())?,
        };

        whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac_cents))
            .map(Points)
            .ok_or_else(invalid)
    }
}

/// A payout multiplier in hundredths (`198` is 1.98x)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Multiplier(u32);

impl Multiplier {
    pub const ZERO: Multiplier = Multiplier(0);
    pub const ONE: Multiplier = Multiplier(100);

    pub const fn from_hundredths(hundredths: u32) -> Self {
        Multiplier(hundredths)
    }

    pub const fn hundredths(self) -> u32 {
        self.0
    }

    /// Truncate a float multiplier down to hundredths.
    pub fn floor_f64(value: f64) -> Self {
        if !value.is_finite() || value <= 0.0 {
            return Multiplier::ZERO;
        }
        Multiplier((value * 100.0 + 1e-9).floor().min(u32::MAX as f64) as u32)
    }

    pub fn from_f64(value: f64) -> CasinoResult<Self> {
        if !value.is_finite() || value < 0.0 {
            return Err(CasinoError::InvalidParams(format!("{} is not a valid multiplier", value)));
        }
        let scaled = value * 100.0;
        if (scaled - scaled.round()).abs() > 1e-6 {
            return Err(CasinoError::InvalidParams(format!(
                "multiplier {} has more than two decimal places",
                value
            )));
        }
        Ok(Multiplier(scaled.round() as u32))
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}x", self.0 / 100, self.0 % 100)
    }
}

/// Opaque user identifier supplied by the command layer
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids are embedded in storage keys, so separators are rejected.
    pub fn validate(&self) -> CasinoResult<()> {
        if self.0.is_empty() || self.0.len() > 64 || self.0.contains(':') {
            return Err(CasinoError::InvalidParams(format!("invalid user id '{}'", self.0)));
        }
        Ok(())
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Supported game types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum GameType {
    Coinflip,
    Limbo,
    Mines,
    Tower,
    Blackjack,
}

impl GameType {
    pub const ALL: [GameType; 5] = [
        GameType::Coinflip,
        GameType::Limbo,
        GameType::Mines,
        GameType::Tower,
        GameType::Blackjack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GameType::Coinflip => "coinflip",
            GameType::Limbo => "limbo",
            GameType::Mines => "mines",
            GameType::Tower => "tower",
            GameType::Blackjack => "blackjack",
        }
    }

    /// Multi-step games hold a persisted session between actions.
    pub fn is_stateful(&self) -> bool {
        matches!(self, GameType::Mines | GameType::Tower | GameType::Blackjack)
    }
}

impl fmt::Display for GameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameType {
    type Err = CasinoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GameType::ALL
            .iter()
            .copied()
            .find(|g| g.as_str() == s.to_ascii_lowercase())
            .ok_or_else(|| CasinoError::InvalidParams(format!("unknown game type '{}'", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_points_parse() {
        assert_eq!("10".parse::<Points>().unwrap(), Points::from_cents(1000));
        assert_eq!("10.5".parse::<Points>().unwrap(), Points::from_cents(1050));
        assert_eq!("0.07".parse::<Points>().unwrap(), Points::from_cents(7));
        assert_eq!(".25".parse::<Points>().unwrap(), Points::from_cents(25));

        assert!("-1".parse::<Points>().is_err());
        assert!("1.234".parse::<Points>().is_err());
        assert!("abc".parse::<Points>().is_err());
        assert!("".parse::<Points>().is_err());
        assert!(".".parse::<Points>().is_err());
    }

    #[test]
    fn test_points_from_f64() {
        assert_eq!(Points::from_f64(12.34).unwrap(), Points::from_cents(1234));
        assert!(Points::from_f64(-1.0).is_err());
        assert!(Points::from_f64(f64::NAN).is_err());
        assert!(Points::from_f64(1.005).is_err());
    }

    #[test]
    fn test_scale_rounds_half_up() {
        let stake = Points::whole(50);
        assert_eq!(stake.scale(Multiplier::from_hundredths(198)), Points::from_cents(9900));
        assert_eq!(Points::from_cents(1).scale(Multiplier::from_hundredths(150)), Points::from_cents(2));
        assert_eq!(Points::whole(20).scale(Multiplier::from_hundredths(250)), Points::whole(50));
    }

    #[test]
    fn test_display() {
        assert_eq!(Points::from_cents(905).to_string(), "9.05");
        assert_eq!(Multiplier::from_hundredths(1000).to_string(), "10.00x");
    }

    #[test]
    fn test_user_id_validation() {
        assert!(UserId::from("123456789").validate().is_ok());
        assert!(UserId::from("").validate().is_err());
        assert!(UserId::from("a:b").validate().is_err());
    }

    #[test]
    fn test_game_type_round_trip_names() {
        for game in GameType::ALL {
            assert_eq!(game.as_str().parse::<GameType>().unwrap(), game);
        }
        assert!(GameType::Mines.is_stateful());
        assert!(!GameType::Limbo.is_stateful());
    }
}
