//! Autoswap configuration.
//!
//! A flat TOML file with typed fields. External callers that set values by
//! key go through [`AutoSwapConfig::set_value`], which validates both the
//! key and the value's type; unknown keys are rejected instead of stored.

use std::io::{self, Write};
use std::path::Path;

use crate::error::Error;
use crate::swap::Currency;
use crate::utill::{get_data_dir, parse_field, parse_toml};

/// Restrict the autoswapper to one swap direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapTypeFilter {
    /// Submarine swaps only (drain on-chain into channels).
    Normal,
    /// Reverse swaps only (drain channels to on-chain).
    Reverse,
}

impl SwapTypeFilter {
    fn parse(value: &str) -> Result<Option<Self>, String> {
        match value {
            "" => Ok(None),
            "normal" => Ok(Some(SwapTypeFilter::Normal)),
            "reverse" => Ok(Some(SwapTypeFilter::Reverse)),
            other => Err(format!("unknown swap type: {other}")),
        }
    }

    fn as_str(filter: Option<Self>) -> &'static str {
        match filter {
            None => "",
            Some(SwapTypeFilter::Normal) => "normal",
            Some(SwapTypeFilter::Reverse) => "reverse",
        }
    }
}

/// All recognized autoswap options.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoSwapConfig {
    /// Master switch; recommendations are evaluated either way, execution
    /// only happens when enabled.
    pub enabled: bool,
    /// Chain to swap against. Liquid is preferred for cost.
    pub currency: Currency,
    /// Direction restriction; `None` allows both.
    pub swap_type: Option<SwapTypeFilter>,
    /// On-chain wallet funding or receiving the swaps.
    pub wallet: String,
    /// Lower balance threshold as percent of channel capacity.
    pub min_balance_percent: f64,
    /// Upper balance threshold as percent of channel capacity.
    pub max_balance_percent: f64,
    /// Lower balance threshold in sat; mutually exclusive with the percent
    /// form.
    pub min_balance: u64,
    /// Upper balance threshold in sat; mutually exclusive with the percent
    /// form.
    pub max_balance: u64,
    /// Evaluate each channel on its own (default) or the aggregate.
    pub per_channel: bool,
    /// Fee budget in sat per interval.
    pub budget: u64,
    /// Budget window length in seconds.
    pub budget_interval_secs: u64,
    /// Reject recommendations whose fee exceeds this percentage of the swap
    /// amount.
    pub max_fee_percent: f64,
    /// Propagated to reverse swaps.
    pub accept_zero_conf: bool,
    /// Evaluation cadence in seconds.
    pub channel_poll_interval_secs: u64,
}

impl Default for AutoSwapConfig {
    fn default() -> Self {
        AutoSwapConfig {
            enabled: false,
            currency: Currency::Lbtc,
            swap_type: None,
            wallet: String::new(),
            min_balance_percent: 0.0,
            max_balance_percent: 0.0,
            min_balance: 0,
            max_balance: 0,
            per_channel: true,
            budget: 100_000,
            budget_interval_secs: 7 * 24 * 60 * 60,
            max_fee_percent: 1.0,
            accept_zero_conf: false,
            channel_poll_interval_secs: 30,
        }
    }
}

impl AutoSwapConfig {
    /// Load the config from `config_path`, or create a default file there
    /// first. Without a path the default location
    /// `~/.lnswap/autoswap.toml` is used.
    pub fn new(config_path: Option<&Path>) -> io::Result<Self> {
        let default_path = get_data_dir().join("autoswap.toml");
        let config_path = config_path.unwrap_or(&default_path);
        let default_config = Self::default();

        if !config_path.exists() || std::fs::metadata(config_path)?.len() == 0 {
            log::warn!(
                "autoswap config not found, creating default config at {}",
                config_path.display()
            );
            default_config.write_to_file(config_path)?;
        }

        let config_map = parse_toml(config_path)?;
        log::info!("loaded autoswap config from {}", config_path.display());

        let config = AutoSwapConfig {
            enabled: parse_field(config_map.get("enabled"), default_config.enabled),
            currency: config_map
                .get("currency")
                .and_then(|v| Currency::from_str_opt(v))
                .unwrap_or(default_config.currency),
            swap_type: config_map
                .get("swap_type")
                .and_then(|v| SwapTypeFilter::parse(v).ok())
                .unwrap_or(default_config.swap_type),
            wallet: parse_field(config_map.get("wallet"), default_config.wallet),
            min_balance_percent: parse_field(
                config_map.get("min_balance_percent"),
                default_config.min_balance_percent,
            ),
            max_balance_percent: parse_field(
                config_map.get("max_balance_percent"),
                default_config.max_balance_percent,
            ),
            min_balance: parse_field(config_map.get("min_balance"), default_config.min_balance),
            max_balance: parse_field(config_map.get("max_balance"), default_config.max_balance),
            per_channel: parse_field(config_map.get("per_channel"), default_config.per_channel),
            budget: parse_field(config_map.get("budget"), default_config.budget),
            budget_interval_secs: parse_field(
                config_map.get("budget_interval_secs"),
                default_config.budget_interval_secs,
            ),
            max_fee_percent: parse_field(
                config_map.get("max_fee_percent"),
                default_config.max_fee_percent,
            ),
            accept_zero_conf: parse_field(
                config_map.get("accept_zero_conf"),
                default_config.accept_zero_conf,
            ),
            channel_poll_interval_secs: parse_field(
                config_map.get("channel_poll_interval_secs"),
                default_config.channel_poll_interval_secs,
            ),
        };
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(config)
    }

    /// Serialize to TOML and write to disk, creating parent directories.
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let toml_data = format!(
            "# Autoswap Configuration File
# Master switch for swap execution
enabled = {}
# Chain to swap against: BTC or L-BTC
currency = \"{}\"
# Restrict direction: normal, reverse, or empty for both
swap_type = \"{}\"
# On-chain wallet funding or receiving swaps
wallet = \"{}\"
# Balance thresholds as percent of channel capacity
min_balance_percent = {}
max_balance_percent = {}
# Absolute balance thresholds in sats (leave 0 when using percents)
min_balance = {}
max_balance = {}
# Evaluate per channel instead of the aggregate
per_channel = {}
# Fee budget in sats per interval
budget = {}
# Budget window length in seconds
budget_interval_secs = {}
# Reject recommendations whose fee exceeds this percent of the amount
max_fee_percent = {}
# Claim reverse swap lockups at zero conf
accept_zero_conf = {}
# Evaluation cadence in seconds
channel_poll_interval_secs = {}
",
            self.enabled,
            self.currency,
            SwapTypeFilter::as_str(self.swap_type),
            self.wallet,
            self.min_balance_percent,
            self.max_balance_percent,
            self.min_balance,
            self.max_balance,
            self.per_channel,
            self.budget,
            self.budget_interval_secs,
            self.max_fee_percent,
            self.accept_zero_conf,
            self.channel_poll_interval_secs,
        );

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = std::fs::File::create(path)?;
        file.write_all(toml_data.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Bound checks and mutual exclusions.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("min_balance_percent", self.min_balance_percent),
            ("max_balance_percent", self.max_balance_percent),
            ("max_fee_percent", self.max_fee_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(format!("{name} must be between 0 and 100, got {value}"));
            }
        }
        if self.min_balance_percent > 0.0 && self.min_balance > 0 {
            return Err(
                "min_balance and min_balance_percent are mutually exclusive".to_string(),
            );
        }
        if self.max_balance_percent > 0.0 && self.max_balance > 0 {
            return Err(
                "max_balance and max_balance_percent are mutually exclusive".to_string(),
            );
        }
        if self.min_balance > 0 && self.max_balance > 0 && self.min_balance >= self.max_balance {
            return Err("min_balance must be below max_balance".to_string());
        }
        if self.min_balance_percent > 0.0
            && self.max_balance_percent > 0.0
            && self.min_balance_percent >= self.max_balance_percent
        {
            return Err("min_balance_percent must be below max_balance_percent".to_string());
        }
        if self.channel_poll_interval_secs == 0 {
            return Err("channel_poll_interval_secs must be positive".to_string());
        }
        Ok(())
    }

    /// Set one option by key, validating key and value.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<(), Error> {
        let invalid =
            |key: &str, value: &str| Error::InvalidInput(format!("bad value for {key}: {value}"));
        let mut updated = self.clone();
        match key {
            "enabled" => updated.enabled = value.parse().map_err(|_| invalid(key, value))?,
            "currency" => {
                updated.currency =
                    Currency::from_str_opt(value).ok_or_else(|| invalid(key, value))?
            }
            "swap_type" => {
                updated.swap_type =
                    SwapTypeFilter::parse(value).map_err(Error::InvalidInput)?
            }
            "wallet" => updated.wallet = value.to_string(),
            "min_balance_percent" => {
                updated.min_balance_percent = value.parse().map_err(|_| invalid(key, value))?
            }
            "max_balance_percent" => {
                updated.max_balance_percent = value.parse().map_err(|_| invalid(key, value))?
            }
            "min_balance" => {
                updated.min_balance = value.parse().map_err(|_| invalid(key, value))?
            }
            "max_balance" => {
                updated.max_balance = value.parse().map_err(|_| invalid(key, value))?
            }
            "per_channel" => {
                updated.per_channel = value.parse().map_err(|_| invalid(key, value))?
            }
            "budget" => updated.budget = value.parse().map_err(|_| invalid(key, value))?,
            "budget_interval_secs" => {
                updated.budget_interval_secs = value.parse().map_err(|_| invalid(key, value))?
            }
            "max_fee_percent" => {
                updated.max_fee_percent = value.parse().map_err(|_| invalid(key, value))?
            }
            "accept_zero_conf" => {
                updated.accept_zero_conf = value.parse().map_err(|_| invalid(key, value))?
            }
            "channel_poll_interval_secs" => {
                updated.channel_poll_interval_secs =
                    value.parse().map_err(|_| invalid(key, value))?
            }
            unknown => {
                return Err(Error::InvalidInput(format!(
                    "unknown config key: {unknown}"
                )))
            }
        }
        updated.validate().map_err(Error::InvalidInput)?;
        *self = updated;
        Ok(())
    }

    /// Read one option by key.
    pub fn get_value(&self, key: &str) -> Result<String, Error> {
        Ok(match key {
            "enabled" => self.enabled.to_string(),
            "currency" => self.currency.to_string(),
            "swap_type" => SwapTypeFilter::as_str(self.swap_type).to_string(),
            "wallet" => self.wallet.clone(),
            "min_balance_percent" => self.min_balance_percent.to_string(),
            "max_balance_percent" => self.max_balance_percent.to_string(),
            "min_balance" => self.min_balance.to_string(),
            "max_balance" => self.max_balance.to_string(),
            "per_channel" => self.per_channel.to_string(),
            "budget" => self.budget.to_string(),
            "budget_interval_secs" => self.budget_interval_secs.to_string(),
            "max_fee_percent" => self.max_fee_percent.to_string(),
            "accept_zero_conf" => self.accept_zero_conf.to_string(),
            "channel_poll_interval_secs" => self.channel_poll_interval_secs.to_string(),
            unknown => {
                return Err(Error::InvalidInput(format!(
                    "unknown config key: {unknown}"
                )))
            }
        })
    }

    /// Resolve the (min, max) thresholds in sat for a capacity.
    pub fn thresholds(&self, capacity_sat: u64) -> (u64, u64) {
        let min = if self.min_balance_percent > 0.0 {
            (capacity_sat as f64 * self.min_balance_percent / 100.0) as u64
        } else {
            self.min_balance
        };
        let max = if self.max_balance_percent > 0.0 {
            (capacity_sat as f64 * self.max_balance_percent / 100.0) as u64
        } else {
            self.max_balance
        };
        (min, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autoswap.toml");
        let config = AutoSwapConfig::new(Some(&path)).unwrap();
        assert_eq!(config, AutoSwapConfig::default());
        // The default file was written back and loads identically.
        assert!(path.exists());
        assert_eq!(AutoSwapConfig::new(Some(&path)).unwrap(), config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autoswap.toml");
        std::fs::write(&path, "enabled = true\nbudget = 50000\ncurrency = \"BTC\"\n").unwrap();

        let config = AutoSwapConfig::new(Some(&path)).unwrap();
        assert!(config.enabled);
        assert_eq!(config.budget, 50_000);
        assert_eq!(config.currency, Currency::Btc);
        assert_eq!(
            config.channel_poll_interval_secs,
            AutoSwapConfig::default().channel_poll_interval_secs
        );
    }

    #[test]
    fn test_set_value_rejects_unknown_keys_and_bad_values() {
        let mut config = AutoSwapConfig::default();
        assert!(config.set_value("budget", "123456").is_ok());
        assert_eq!(config.budget, 123_456);

        assert!(config.set_value("no_such_key", "1").is_err());
        assert!(config.set_value("budget", "not-a-number").is_err());
        assert!(config.set_value("swap_type", "sideways").is_err());
        // Failed sets leave the config untouched.
        assert_eq!(config.budget, 123_456);
    }

    #[test]
    fn test_mutual_exclusion_of_threshold_forms() {
        let mut config = AutoSwapConfig::default();
        config.set_value("min_balance_percent", "25").unwrap();
        assert!(config.set_value("min_balance", "100000").is_err());

        let mut absolute = AutoSwapConfig::default();
        absolute.set_value("min_balance", "100000").unwrap();
        absolute.set_value("max_balance", "400000").unwrap();
        assert!(absolute.set_value("max_balance", "50000").is_err());
    }

    #[test]
    fn test_threshold_resolution() {
        let mut config = AutoSwapConfig::default();
        config.set_value("min_balance_percent", "25").unwrap();
        config.set_value("max_balance_percent", "75").unwrap();
        assert_eq!(config.thresholds(1_000_000), (250_000, 750_000));

        let mut absolute = AutoSwapConfig::default();
        absolute.set_value("min_balance", "100000").unwrap();
        absolute.set_value("max_balance", "900000").unwrap();
        assert_eq!(absolute.thresholds(1_000_000), (100_000, 900_000));
    }

    #[test]
    fn test_get_value_roundtrip() {
        let config = AutoSwapConfig::default();
        assert_eq!(config.get_value("currency").unwrap(), "L-BTC");
        assert_eq!(config.get_value("per_channel").unwrap(), "true");
        assert!(config.get_value("nonsense").is_err());
    }
}
