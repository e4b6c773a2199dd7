//! Configuration for the stLINK ledger
//!
//! Credentials come from flags or environment variables (see `main.rs`),
//! protocol defaults from `constants.rs`, and an optional config.toml can
//! override the defaults. Everything is validated once into [`Config`].

use alloy::primitives::Address;
use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::constants;

// =============================================================================
// File-based Configuration (config.toml)
// =============================================================================

/// Optional overrides loaded from config.toml
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub contracts: ContractsSection,
    pub schedule: ScheduleSection,
    pub endpoints: EndpointsSection,
    pub spreadsheet: SpreadsheetSection,
}

/// Contract address overrides
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContractsSection {
    pub stake_contract: Option<String>,
    pub link_token: Option<String>,
    pub stlink_token: Option<String>,
    pub rebase_controller: Option<String>,
    pub update_rewards_selector: Option<String>,
}

/// Schedule overrides
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleSection {
    /// Ledger start when no --datefrom is given (YYYY-MM-DD)
    pub start_date: Option<String>,
    /// Lower bound for block searches
    pub start_block: Option<u64>,
    /// Weekly snapshot time of day, UTC (HH:MM:SS)
    pub snapshot_time: Option<String>,
    /// No snapshots on or after this date (YYYY-MM-DD)
    pub snapshot_cutoff: Option<String>,
}

/// Service endpoint overrides
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointsSection {
    pub explorer_api: Option<String>,
    pub ipfs_gateway: Option<String>,
    pub coingecko_api: Option<String>,
}

/// Spreadsheet collaborator settings
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpreadsheetSection {
    /// Program and arguments of the sync command
    pub command: Option<Vec<String>>,
}

impl FileConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content).with_context(|| {
            format!(
                "Failed to parse {}. Check for:\n\
                 - Unknown sections or keys (contracts, schedule, endpoints, spreadsheet)\n\
                 - Invalid TOML syntax (missing quotes, brackets, etc.)\n\
                 - Incorrect data types (strings vs numbers)\n\n\
                 See config.toml.example for the expected format.",
                path.display()
            )
        })
    }

    /// Load the file if it exists, otherwise fall back to the built-in defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

// =============================================================================
// Credentials (flags / environment)
// =============================================================================

/// Values supplied on the command line or through the environment
#[derive(Debug, Default, Clone)]
pub struct Credentials {
    pub rpc_url: Option<String>,
    pub etherscan_api_key: Option<String>,
    pub wallet: Option<String>,
    pub coingecko_api_key: Option<String>,
    pub sheet_url: Option<String>,
    pub sheet_tab: Option<String>,
    pub service_account_file: Option<PathBuf>,
}

// =============================================================================
// Runtime Configuration
// =============================================================================

/// Contracts the ledger reads from
#[derive(Debug, Clone, Copy)]
pub struct Contracts {
    pub stake_contract: Address,
    pub link_token: Address,
    pub stlink_token: Address,
    pub rebase_controller: Address,
}

/// Spreadsheet forwarding settings (present only when a sheet URL is set)
#[derive(Debug, Clone)]
pub struct SpreadsheetConfig {
    pub url: String,
    pub tab_name: String,
    pub service_account_file: Option<PathBuf>,
    pub command: Vec<String>,
}

/// Main configuration struct with parsed values
#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_url: String,
    pub etherscan_api_key: String,
    pub coingecko_api_key: Option<String>,
    /// Wallet whose ledger is produced
    pub wallet: Address,
    pub contracts: Contracts,
    /// Hex selector (with 0x) of the reward update call
    pub update_rewards_selector: String,
    pub default_start_date: NaiveDate,
    pub start_block: u64,
    pub snapshot_time: NaiveTime,
    pub snapshot_cutoff: NaiveDate,
    pub explorer_api_base: String,
    pub ipfs_gateway: String,
    pub coingecko_api_base: String,
    pub spreadsheet: Option<SpreadsheetConfig>,
}

impl Config {
    /// Merge credentials with file overrides and defaults, validating everything
    pub fn from_sources(file: &FileConfig, creds: Credentials) -> Result<Self> {
        let rpc_url = required(creds.rpc_url, "RPC_URL (--rpc-url)")?;
        let etherscan_api_key =
            required(creds.etherscan_api_key, "ETHERSCAN_API_KEY (--etherscan-api-key)")?;
        let wallet = required(creds.wallet, "USER_WALLET_ADDRESS (--wallet)")?;
        let wallet = parse_address(&wallet, "wallet")?;

        let contracts = Contracts {
            stake_contract: address_or_default(
                file.contracts.stake_contract.as_deref(),
                constants::STAKE_CONTRACT_ADDRESS,
                "stake_contract",
            )?,
            link_token: address_or_default(
                file.contracts.link_token.as_deref(),
                constants::LINK_TOKEN_ADDRESS,
                "link_token",
            )?,
            stlink_token: address_or_default(
                file.contracts.stlink_token.as_deref(),
                constants::STLINK_TOKEN_ADDRESS,
                "stlink_token",
            )?,
            rebase_controller: address_or_default(
                file.contracts.rebase_controller.as_deref(),
                constants::REBASE_CONTROLLER_ADDRESS,
                "rebase_controller",
            )?,
        };

        let update_rewards_selector = file
            .contracts
            .update_rewards_selector
            .clone()
            .unwrap_or_else(|| constants::UPDATE_REWARDS_SELECTOR.to_string())
            .to_lowercase();
        validate_selector(&update_rewards_selector)?;

        let schedule = &file.schedule;
        let default_start_date = parse_date(
            schedule.start_date.as_deref().unwrap_or(constants::DEFAULT_START_DATE),
            "schedule.start_date",
        )?;
        let snapshot_cutoff = parse_date(
            schedule
                .snapshot_cutoff
                .as_deref()
                .unwrap_or(constants::SNAPSHOT_CUTOFF_DATE),
            "schedule.snapshot_cutoff",
        )?;
        let snapshot_time = NaiveTime::parse_from_str(
            schedule
                .snapshot_time
                .as_deref()
                .unwrap_or(constants::SNAPSHOT_TIME_OF_DAY),
            "%H:%M:%S",
        )
        .context("Invalid schedule.snapshot_time (expected HH:MM:SS)")?;

        let endpoints = &file.endpoints;
        let spreadsheet = creds.sheet_url.filter(|u| !u.trim().is_empty()).map(|url| {
            SpreadsheetConfig {
                url,
                tab_name: creds
                    .sheet_tab
                    .unwrap_or_else(|| constants::SHEET_DEFAULT_TAB.to_string()),
                service_account_file: creds.service_account_file,
                command: file
                    .spreadsheet
                    .command
                    .clone()
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| vec![constants::SHEET_SYNC_COMMAND.to_string()]),
            }
        });

        Ok(Self {
            rpc_url,
            etherscan_api_key,
            coingecko_api_key: creds.coingecko_api_key.filter(|k| !k.is_empty()),
            wallet,
            contracts,
            update_rewards_selector,
            default_start_date,
            start_block: schedule.start_block.unwrap_or(constants::DEFAULT_START_BLOCK),
            snapshot_time,
            snapshot_cutoff,
            explorer_api_base: endpoints
                .explorer_api
                .clone()
                .unwrap_or_else(|| constants::ETHERSCAN_API_BASE.to_string()),
            ipfs_gateway: endpoints
                .ipfs_gateway
                .clone()
                .unwrap_or_else(|| constants::IPFS_GATEWAY_BASE.to_string()),
            coingecko_api_base: endpoints
                .coingecko_api
                .clone()
                .unwrap_or_else(|| constants::COINGECKO_API_BASE.to_string()),
            spreadsheet,
        })
    }

    /// RPC URL safe for logging (provider keys usually sit in the last path segment)
    pub fn masked_rpc_url(&self) -> String {
        mask_api_key(&self.rpc_url)
    }

    /// Defaults with placeholder credentials for `wallet`
    #[cfg(test)]
    pub fn for_tests(wallet: &str) -> Self {
        let creds = Credentials {
            rpc_url: Some("http://127.0.0.1:8545".to_string()),
            etherscan_api_key: Some("test-key".to_string()),
            wallet: Some(wallet.to_string()),
            ..Default::default()
        };
        match Self::from_sources(&FileConfig::default(), creds) {
            Ok(config) => config,
            Err(e) => panic!("test config: {}", e),
        }
    }
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => anyhow::bail!("Missing required configuration: {}", name),
    }
}

fn parse_address(value: &str, field: &str) -> Result<Address> {
    value
        .trim()
        .parse::<Address>()
        .with_context(|| format!("Invalid {} address: '{}'", field, value))
}

fn address_or_default(value: Option<&str>, default: &str, field: &str) -> Result<Address> {
    parse_address(value.unwrap_or(default), field)
}

/// Parse a YYYY-MM-DD date
pub fn parse_date(value: &str, field: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .with_context(|| format!("Invalid {} '{}' (expected YYYY-MM-DD)", field, value))
}

fn validate_selector(selector: &str) -> Result<()> {
    let hex = selector
        .strip_prefix("0x")
        .context("update_rewards_selector must start with 0x")?;
    if hex.len() != 8 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        anyhow::bail!("update_rewards_selector must be 4 bytes of hex, got '{}'", selector);
    }
    Ok(())
}

/// Mask API keys in URLs for safe logging
/// Converts "https://eth-mainnet.g.alchemy.com/v2/SECRET" to ".../v2/****"
/// and "https://example.com/?apikey=SECRET" to "https://example.com/?apikey=****"
pub fn mask_api_key(url: &str) -> String {
    if let Some(idx) = url.find("apikey=") {
        format!("{}****", &url[..idx + 7])
    } else if let Some(idx) = url.find("api-key=") {
        format!("{}****", &url[..idx + 8])
    } else if let Some(idx) = url.rfind("/v2/") {
        format!("{}****", &url[..idx + 4])
    } else if let Some(idx) = url.rfind("/v3/") {
        format!("{}****", &url[..idx + 4])
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            rpc_url: Some("https://eth-mainnet.g.alchemy.com/v2/secret".to_string()),
            etherscan_api_key: Some("KEY".to_string()),
            wallet: Some("0x15d11b0000000000000000000000000000000001".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_sources(&FileConfig::default(), creds()).unwrap();
        assert_eq!(
            config.contracts.stake_contract,
            constants::STAKE_CONTRACT_ADDRESS.parse::<Address>().unwrap()
        );
        assert_eq!(config.default_start_date, NaiveDate::from_ymd_opt(2023, 10, 19).unwrap());
        assert_eq!(config.snapshot_cutoff, NaiveDate::from_ymd_opt(2025, 2, 24).unwrap());
        assert_eq!(config.snapshot_time, NaiveTime::from_hms_opt(13, 0, 0).unwrap());
        assert_eq!(config.start_block, constants::DEFAULT_START_BLOCK);
        assert_eq!(config.update_rewards_selector, "0x128606a6");
        assert!(config.spreadsheet.is_none());
    }

    #[test]
    fn test_missing_wallet_is_fatal() {
        let mut c = creds();
        c.wallet = None;
        let err = Config::from_sources(&FileConfig::default(), c).unwrap_err();
        assert!(err.to_string().contains("USER_WALLET_ADDRESS"));
    }

    #[test]
    fn test_missing_rpc_url_is_fatal() {
        let mut c = creds();
        c.rpc_url = Some("   ".to_string());
        let err = Config::from_sources(&FileConfig::default(), c).unwrap_err();
        assert!(err.to_string().contains("RPC_URL"));
    }

    #[test]
    fn test_invalid_wallet_rejected() {
        let mut c = creds();
        c.wallet = Some("0x1234".to_string());
        assert!(Config::from_sources(&FileConfig::default(), c).is_err());
    }

    #[test]
    fn test_file_overrides() {
        let file: FileConfig = toml::from_str(
            r#"
            [schedule]
            snapshot_cutoff = "2026-01-05"
            snapshot_time = "09:30:00"

            [contracts]
            update_rewards_selector = "0xDEADBEEF"

            [spreadsheet]
            command = ["python3", "update_gsheet.py"]
            "#,
        )
        .unwrap();

        let mut c = creds();
        c.sheet_url = Some("https://docs.google.com/spreadsheets/d/abc".to_string());
        let config = Config::from_sources(&file, c).unwrap();

        assert_eq!(config.snapshot_cutoff, NaiveDate::from_ymd_opt(2026, 1, 5).unwrap());
        assert_eq!(config.snapshot_time, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(config.update_rewards_selector, "0xdeadbeef");

        let sheet = config.spreadsheet.unwrap();
        assert_eq!(sheet.tab_name, constants::SHEET_DEFAULT_TAB);
        assert_eq!(sheet.command, vec!["python3", "update_gsheet.py"]);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let parsed: Result<FileConfig, _> = toml::from_str("[schedule]\ncutoff = \"2025-01-01\"\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_bad_selector_rejected() {
        let file: FileConfig =
            toml::from_str("[contracts]\nupdate_rewards_selector = \"128606a6\"\n").unwrap();
        assert!(Config::from_sources(&file, creds()).is_err());
    }

    #[test]
    fn test_mask_api_key() {
        assert_eq!(
            mask_api_key("https://eth-mainnet.g.alchemy.com/v2/secret"),
            "https://eth-mainnet.g.alchemy.com/v2/****"
        );
        assert_eq!(
            mask_api_key("https://api.etherscan.io/v2/api?apikey=abc"),
            "https://api.etherscan.io/v2/api?apikey=****"
        );
        assert_eq!(mask_api_key("http://localhost:8545"), "http://localhost:8545");
    }
}
