//! Configuration management with validation and defaults
//!
//! Values come from `CasinoConfig::default()` or a TOML file, then environment
//! overrides, then validation. Stake limits are expressed in hundredths of a
//! point so the file format stays exact.

use serde::{Deserialize, Serialize};
use std::{env, path::Path, time::Duration};

use crate::{
    common::types::{GameType, Points},
    errors::{CasinoResult, ConfigurationError},
};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CasinoConfig {
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub fairness: FairnessConfig,
    pub recovery: RecoveryConfig,
    pub games: GamesConfig,
    pub cashier: CashierConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_directory: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: "./DB/fairstake".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            cors_origins: vec!["*".to_string()],
        }
    }
}

/// Fair-play period rotation
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FairnessConfig {
    pub period_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for FairnessConfig {
    fn default() -> Self {
        Self {
            period_secs: 6 * 60 * 60,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub interval_secs: u64,
    /// Age after which a debited-but-unsettled wager is refunded
    pub pending_timeout_secs: u64,
    /// Idle time after which an open session is refunded
    pub session_timeout_secs: u64,
    pub batch_limit: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            pending_timeout_secs: 120,
            session_timeout_secs: 30 * 60,
            batch_limit: 500,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameLimits {
    pub min_stake_cents: u64,
    pub max_stake_cents: u64,
}

impl GameLimits {
    pub fn min_stake(&self) -> Points {
        Points::from_cents(self.min_stake_cents)
    }

    pub fn max_stake(&self) -> Points {
        Points::from_cents(self.max_stake_cents)
    }
}

impl Default for GameLimits {
    fn default() -> Self {
        Self {
            min_stake_cents: 10,
            max_stake_cents: 10_000_000,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GamesConfig {
    pub coinflip: GameLimits,
    pub limbo: GameLimits,
    pub mines: GameLimits,
    pub tower: GameLimits,
    pub blackjack: GameLimits,
}

impl GamesConfig {
    pub fn limits(&self, game: GameType) -> &GameLimits {
        match game {
            GameType::Coinflip => &self.coinflip,
            GameType::Limbo => &self.limbo,
            GameType::Mines => &self.mines,
            GameType::Tower => &self.tower,
            GameType::Blackjack => &self.blackjack,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CashierConfig {
    pub min_confirmations: u32,
    pub min_withdrawal_cents: u64,
}

impl Default for CashierConfig {
    fn default() -> Self {
        Self {
            min_confirmations: 1,
            min_withdrawal_cents: 100,
        }
    }
}

impl CasinoConfig {
    /// Production deployment: public bind, stricter recovery timings
    pub fn production() -> Self {
        Self {
            storage: StorageConfig {
                data_directory: "/var/lib/fairstake".to_string(),
            },
            api: ApiConfig {
                host: "0.0.0.0".to_string(),
                ..Default::default()
            },
            cashier: CashierConfig {
                min_confirmations: 3,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Short periods and timeouts for tests
    pub fn testing() -> Self {
        Self {
            storage: StorageConfig {
                data_directory: "./DB/fairstake_test".to_string(),
            },
            fairness: FairnessConfig {
                period_secs: 60,
                sweep_interval_secs: 1,
            },
            recovery: RecoveryConfig {
                interval_secs: 1,
                pending_timeout_secs: 5,
                session_timeout_secs: 10,
                batch_limit: 100,
            },
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.storage.data_directory.trim().is_empty() {
            return Err(ConfigurationError::MissingRequired("storage.data_directory".to_string()));
        }
        if self.api.port == 0 {
            return Err(invalid("api.port", "0", "Port cannot be zero"));
        }
        if self.api.request_timeout_secs == 0 {
            return Err(invalid("api.request_timeout_secs", "0", "Timeout must be > 0"));
        }
        if self.fairness.period_secs == 0 {
            return Err(invalid("fairness.period_secs", "0", "Periods must have a duration"));
        }
        if self.fairness.sweep_interval_secs == 0 {
            return Err(invalid("fairness.sweep_interval_secs", "0", "Interval must be > 0"));
        }
        if self.fairness.sweep_interval_secs > self.fairness.period_secs {
            return Err(invalid(
                "fairness.sweep_interval_secs",
                &self.fairness.sweep_interval_secs.to_string(),
                "Sweep must run at least once per period",
            ));
        }
        if self.recovery.interval_secs == 0 || self.recovery.batch_limit == 0 {
            return Err(invalid(
                "recovery.interval_secs",
                &self.recovery.interval_secs.to_string(),
                "Interval and batch limit must be > 0",
            ));
        }
        if self.recovery.pending_timeout_secs == 0 || self.recovery.session_timeout_secs == 0 {
            return Err(invalid("recovery", "0", "Timeouts must be > 0"));
        }

        for game in GameType::ALL {
            let limits = self.games.limits(game);
            if limits.min_stake_cents == 0 || limits.min_stake_cents > limits.max_stake_cents {
                return Err(invalid(
                    &format!("games.{}", game),
                    &format!("{}..{}", limits.min_stake_cents, limits.max_stake_cents),
                    "Stake limits must be positive and ordered",
                ));
            }
        }
        Ok(())
    }

    pub fn period_duration(&self) -> Duration {
        Duration::from_secs(self.fairness.period_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.fairness.sweep_interval_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Configuration loader with environment variable support
#[derive(Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> CasinoResult<CasinoConfig> {
        let mut config = match self.config_path {
            Some(ref path) => Self::load_from_file(path)?,
            None => CasinoConfig::default(),
        };

        apply_overrides(&mut config, |key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &str) -> CasinoResult<CasinoConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }
}

/// Apply `FAIRSTAKE_*` overrides using `lookup` as the environment
pub fn apply_overrides<F>(config: &mut CasinoConfig, lookup: F) -> Result<(), ConfigurationError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = lookup("FAIRSTAKE_DATA_DIR") {
        config.storage.data_directory = dir;
    }
    if let Some(host) = lookup("FAIRSTAKE_API_HOST") {
        config.api.host = host;
    }
    if let Some(port) = lookup("FAIRSTAKE_API_PORT") {
        config.api.port = port
            .parse()
            .map_err(|_| invalid("FAIRSTAKE_API_PORT", &port, "Invalid port number"))?;
    }
    if let Some(secs) = lookup("FAIRSTAKE_PERIOD_SECS") {
        config.fairness.period_secs = secs
            .parse()
            .map_err(|_| invalid("FAIRSTAKE_PERIOD_SECS", &secs, "Invalid number of seconds"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_presets_are_valid() {
        assert!(CasinoConfig::default().validate().is_ok());
        assert!(CasinoConfig::production().validate().is_ok());
        assert!(CasinoConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = CasinoConfig::default();
        config.api.port = 0;
        assert!(config.validate().is_err());

        let mut config = CasinoConfig::default();
        config.games.mines.min_stake_cents = 500;
        config.games.mines.max_stake_cents = 100;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { ref field, .. }) if field == "games.mines"
        ));

        let mut config = CasinoConfig::default();
        config.fairness.sweep_interval_secs = config.fairness.period_secs + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FAIRSTAKE_DATA_DIR", "/tmp/fs"),
            ("FAIRSTAKE_API_PORT", "9090"),
            ("FAIRSTAKE_PERIOD_SECS", "3600"),
        ]
        .into_iter()
        .collect();

        let mut config = CasinoConfig::default();
        apply_overrides(&mut config, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.storage.data_directory, "/tmp/fs");
        assert_eq!(config.api.port, 9090);
        assert_eq!(config.period_duration(), Duration::from_secs(3600));

        let mut config = CasinoConfig::default();
        let err = apply_overrides(&mut config, |k| {
            (k == "FAIRSTAKE_API_PORT").then(|| "not-a-port".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { .. }));
    }

    #[test]
    fn test_toml_partial_file() {
        let config: CasinoConfig = toml::from_str(
            r#"
            [api]
            port = 7000

            [games.limbo]
            min_stake_cents = 100
            max_stake_cents = 50000
            "#,
        )
        .unwrap();

        assert_eq!(config.api.port, 7000);
        assert_eq!(config.api.host, "127.0.0.1");
        assert_eq!(config.games.limits(GameType::Limbo).max_stake(), Points::whole(500));
        assert_eq!(config.recovery.session_timeout_secs, 1800);
    }
}
