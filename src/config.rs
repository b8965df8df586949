//! Market configuration and harness settings
//!
//! The config file is a JSON object carrying the market parameters plus an
//! optional `harness` section. Every market field is optional: an unset
//! field leaves the ledger's current value untouched.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use crate::checker::Strictness;
use crate::error::ConfigError;
use crate::types::{AccountName, Asset, FRAC_SCALE};

/// Assumed stake weight used by the built-in defaults
pub const DEFAULT_STAKE_WEIGHT: i64 = 1_000_000_000_000;

/// Largest accepted `target_timestamp` day offset
pub const MAX_TARGET_OFFSET_DAYS: i64 = 36_525;

/// Partial configuration for one resource, as submitted to the ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub current_weight_ratio: Option<i64>,
    pub target_weight_ratio: Option<i64>,
    pub assumed_stake_weight: Option<i64>,
    pub target_timestamp: Option<DateTime<Utc>>,
    pub exponent: Option<f64>,
    pub decay_secs: Option<u32>,
    pub min_price: Option<Asset>,
    pub max_price: Option<Asset>,
}

impl ResourceConfig {
    fn defaults_at(session_start: DateTime<Utc>) -> Self {
        Self {
            current_weight_ratio: Some(FRAC_SCALE),
            target_weight_ratio: Some(FRAC_SCALE / 100),
            assumed_stake_weight: Some(DEFAULT_STAKE_WEIGHT),
            target_timestamp: Some(session_start + Duration::days(100)),
            exponent: Some(2.0),
            decay_secs: Some(86_400),
            min_price: Some(Asset::new(0, 4, "TST")),
            max_price: Some(Asset::new(10_000_000_000, 4, "TST")),
        }
    }
}

/// Partial market configuration, immutable once submitted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketConfig {
    pub net: ResourceConfig,
    pub cpu: ResourceConfig,
    pub rent_days: Option<u32>,
    pub min_rent_fee: Option<Asset>,
}

impl MarketConfig {
    /// Fully populated configuration with the built-in defaults
    pub fn defaults_at(session_start: DateTime<Utc>) -> Self {
        Self {
            net: ResourceConfig::defaults_at(session_start),
            cpu: ResourceConfig::defaults_at(session_start),
            rent_days: Some(30),
            min_rent_fee: Some(Asset::new(10_000, 4, "TST")),
        }
    }

    /// Defaults adjusted by `f`
    pub fn customized<F>(session_start: DateTime<Utc>, f: F) -> Self
    where
        F: FnOnce(&mut MarketConfig),
    {
        let mut config = Self::defaults_at(session_start);
        f(&mut config);
        config
    }
}

/// File form of [`ResourceConfig`]: `target_timestamp` is a day offset from session start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceConfigFile {
    pub current_weight_ratio: Option<i64>,
    pub target_weight_ratio: Option<i64>,
    pub assumed_stake_weight: Option<i64>,
    pub target_timestamp: Option<i64>,
    pub exponent: Option<f64>,
    pub decay_secs: Option<u32>,
    pub min_price: Option<Asset>,
    pub max_price: Option<Asset>,
}

impl ResourceConfigFile {
    fn resolve(
        &self,
        name: &str,
        session_start: DateTime<Utc>,
    ) -> Result<ResourceConfig, ConfigError> {
        let target_timestamp = match self.target_timestamp {
            Some(days) => Some(offset_by_days(session_start, days).ok_or_else(|| {
                ConfigError::InvalidValue {
                    field: format!("{}.target_timestamp", name),
                    reason: format!("{} days from {} is out of range", days, session_start),
                }
            })?),
            None => None,
        };
        Ok(ResourceConfig {
            current_weight_ratio: self.current_weight_ratio,
            target_weight_ratio: self.target_weight_ratio,
            assumed_stake_weight: self.assumed_stake_weight,
            target_timestamp,
            exponent: self.exponent,
            decay_secs: self.decay_secs,
            min_price: self.min_price.clone(),
            max_price: self.max_price.clone(),
        })
    }

    fn defaults() -> Self {
        Self {
            current_weight_ratio: Some(FRAC_SCALE),
            target_weight_ratio: Some(FRAC_SCALE / 100),
            assumed_stake_weight: Some(DEFAULT_STAKE_WEIGHT),
            target_timestamp: Some(100),
            exponent: Some(2.0),
            decay_secs: Some(86_400),
            min_price: Some(Asset::new(0, 4, "TST")),
            max_price: Some(Asset::new(10_000_000_000, 4, "TST")),
        }
    }
}

/// Top-level config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarketConfigFile {
    pub net: ResourceConfigFile,
    pub cpu: ResourceConfigFile,
    pub rent_days: Option<u32>,
    pub min_rent_fee: Option<Asset>,
    pub harness: HarnessSettings,
}

impl MarketConfigFile {
    /// Built-in configuration used when no file is available
    pub fn defaults() -> Self {
        Self {
            net: ResourceConfigFile::defaults(),
            cpu: ResourceConfigFile::defaults(),
            rent_days: Some(30),
            min_rent_fee: Some(Asset::new(10_000, 4, "TST")),
            harness: HarnessSettings::default(),
        }
    }

    /// Turn day offsets into absolute instants relative to `session_start`
    pub fn resolve(&self, session_start: DateTime<Utc>) -> Result<MarketConfig, ConfigError> {
        Ok(MarketConfig {
            net: self.net.resolve("net", session_start)?,
            cpu: self.cpu.resolve("cpu", session_start)?,
            rent_days: self.rent_days,
            min_rent_fee: self.min_rent_fee.clone(),
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, resource) in [("net", &self.net), ("cpu", &self.cpu)] {
            for (field, ratio) in [
                ("current_weight_ratio", resource.current_weight_ratio),
                ("target_weight_ratio", resource.target_weight_ratio),
            ] {
                if let Some(ratio) = ratio {
                    if ratio <= 0 || ratio > FRAC_SCALE {
                        return Err(ConfigError::InvalidValue {
                            field: format!("{}.{}", name, field),
                            reason: format!("{} is outside (0, {}]", ratio, FRAC_SCALE),
                        });
                    }
                }
            }
            if let Some(days) = resource.target_timestamp {
                if !(0..=MAX_TARGET_OFFSET_DAYS).contains(&days) {
                    return Err(ConfigError::InvalidValue {
                        field: format!("{}.target_timestamp", name),
                        reason: format!(
                            "day offset {} is outside [0, {}]",
                            days, MAX_TARGET_OFFSET_DAYS
                        ),
                    });
                }
            }
        }
        if self.harness.guard_band_ms < 0 {
            return Err(ConfigError::InvalidValue {
                field: "harness.guard_band_ms".to_string(),
                reason: "guard band cannot be negative".to_string(),
            });
        }
        Ok(())
    }
}

fn offset_by_days(start: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    Duration::try_days(days).and_then(|offset| start.checked_add_signed(offset))
}

/// Harness behaviour that is not part of the market itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessSettings {
    pub strictness: Strictness,
    /// Account funding every lease
    pub reserve_account: AccountName,
    /// Account that invokes `execute-queue`
    pub queue_invoker: AccountName,
    /// Display names used in the log mapped to canonical accounts
    pub aliases: BTreeMap<String, AccountName>,
    pub guard_band_ms: i64,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            strictness: Strictness::default(),
            reserve_account: AccountName::from_canonical("eosio.reserv"),
            queue_invoker: AccountName::from_canonical("eosio"),
            aliases: BTreeMap::new(),
            guard_band_ms: 500,
        }
    }
}

/// What to do with a config file that exists but cannot be parsed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MalformedPolicy {
    #[default]
    Fail,
    UseDefaults,
}

/// Where a loaded configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Defaults { reason: String },
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub file: MarketConfigFile,
    pub source: ConfigSource,
}

impl LoadedConfig {
    pub fn is_default(&self) -> bool {
        matches!(self.source, ConfigSource::Defaults { .. })
    }
}

/// Loads the config file, falling back to defaults when it is missing
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    policy: MalformedPolicy,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: MalformedPolicy) -> Self {
        Self { policy }
    }

    /// Load `path`; a missing file yields the defaults with a warning
    pub fn load(&self, path: impl AsRef<Path>) -> Result<LoadedConfig, ConfigError> {
        let path = path.as_ref();
        let shown = path.display().to_string();

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %shown, "config file not found, using defaults");
                return Ok(Self::defaults(format!("{} not found", shown)));
            }
            Err(e) => {
                let err = ConfigError::Read {
                    path: shown,
                    reason: e.to_string(),
                };
                return self.recover(err);
            }
        };

        match Self::parse_str(&raw, &shown) {
            Ok(file) => {
                info!(path = %shown, "loaded market config");
                Ok(LoadedConfig {
                    file,
                    source: ConfigSource::File(path.to_path_buf()),
                })
            }
            Err(err) => self.recover(err),
        }
    }

    /// Parse and validate config JSON; `origin` names the source in errors
    pub fn parse_str(raw: &str, origin: &str) -> Result<MarketConfigFile, ConfigError> {
        let file: MarketConfigFile =
            serde_json::from_str(raw).map_err(|e| ConfigError::Malformed {
                path: origin.to_string(),
                reason: e.to_string(),
            })?;
        file.validate()?;
        Ok(file)
    }

    fn recover(&self, err: ConfigError) -> Result<LoadedConfig, ConfigError> {
        match self.policy {
            MalformedPolicy::Fail => Err(err),
            MalformedPolicy::UseDefaults => {
                warn!(error = %err, "unusable config file, using defaults");
                Ok(Self::defaults(err.to_string()))
            }
        }
    }

    fn defaults(reason: String) -> LoadedConfig {
        LoadedConfig {
            file: MarketConfigFile::defaults(),
            source: ConfigSource::Defaults { reason },
        }
    }
}
