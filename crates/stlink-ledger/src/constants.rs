//! Centralized constants for the stLINK ledger
//!
//! Protocol defaults for the stake.link LINK staking deployment on Ethereum
//! mainnet. Any of them can be overridden from config.toml.

// =============================================================================
// API Endpoints
// =============================================================================

/// Etherscan v2 multichain API
pub const ETHERSCAN_API_BASE: &str = "https://api.etherscan.io/v2/api";

/// Ethereum mainnet chain id (Etherscan v2 requires it on every call)
pub const MAINNET_CHAIN_ID: u64 = 1;

/// Public IPFS gateway (CID is appended)
pub const IPFS_GATEWAY_BASE: &str = "https://ipfs.io/ipfs/";

/// CoinGecko API base URL
pub const COINGECKO_API_BASE: &str = "https://api.coingecko.com/api/v3";

/// CoinGecko coin id for LINK
pub const COINGECKO_LINK_ID: &str = "chainlink";

// =============================================================================
// Contract Addresses (Ethereum mainnet)
// =============================================================================

/// stake.link priority pool data provider (staking contract)
pub const STAKE_CONTRACT_ADDRESS: &str = "0xDdC796a66E8b83d0BcCD97dF33A6CcFBA8fd60eA";

/// LINK ERC-20 token
pub const LINK_TOKEN_ADDRESS: &str = "0x514910771AF9Ca656af840dff83E8264EcF986CA";

/// stLINK ERC-20 token
pub const STLINK_TOKEN_ADDRESS: &str = "0xb8b295df2cd735b15BE5Eb419517Aa626fc43cD5";

/// Rebase controller that triggers reward updates
pub const REBASE_CONTROLLER_ADDRESS: &str = "0x1711e93eec78ba83D38C26f0fF284eB478bdbec4";

/// Function selector of the rebase controller's reward update call
pub const UPDATE_REWARDS_SELECTOR: &str = "0x128606a6";

// =============================================================================
// Schedule
// =============================================================================

/// Protocol launch date, the default start of the ledger
pub const DEFAULT_START_DATE: &str = "2023-10-19";

/// First block worth searching (around the protocol launch)
pub const DEFAULT_START_BLOCK: u64 = 18_385_225;

/// Weekly snapshot time of day (UTC)
pub const SNAPSHOT_TIME_OF_DAY: &str = "13:00:00";

/// No weekly snapshots are generated on or after this date
pub const SNAPSHOT_CUTOFF_DATE: &str = "2025-02-24";

/// Overlap re-fetched in incremental mode to tolerate reorgs and late indexing
pub const INCREMENTAL_OVERLAP_DAYS: i64 = 7;

/// ERC-20 decimals for LINK and stLINK
pub const TOKEN_DECIMALS: u8 = 18;

// =============================================================================
// Network Behaviour
// =============================================================================

/// Per-request timeout for HTTP services (seconds)
pub const HTTP_TIMEOUT_SECS: u64 = 10;

/// Attempts for a single RPC read before the block is given up
pub const RPC_MAX_ATTEMPTS: u32 = 4;

/// Explorer page size
pub const EXPLORER_PAGE_SIZE: usize = 1000;

/// Rows a single explorer query can page through (page x offset)
pub const EXPLORER_RESULT_WINDOW: usize = 10_000;

/// Pause between explorer pages (free tier allows 5 calls/second)
pub const EXPLORER_PAGE_DELAY_MS: u64 = 250;

/// Attempts for an explorer page that keeps hitting the rate limit
pub const EXPLORER_RATE_LIMIT_ATTEMPTS: u32 = 5;

/// Attempts for an explorer page failing with any other status
pub const EXPLORER_MAX_ATTEMPTS: u32 = 3;

/// Attempts for an IPFS manifest fetch
pub const IPFS_MAX_ATTEMPTS: u32 = 3;

/// Pause before every CoinGecko request (milliseconds)
pub const PRICE_REQUEST_DELAY_MS: u64 = 1000;

/// Wait after a CoinGecko 429 (seconds)
pub const PRICE_RATE_LIMIT_WAIT_SECS: u64 = 10;

/// Attempts for a rate limited CoinGecko request
pub const PRICE_MAX_ATTEMPTS: u32 = 10;

// =============================================================================
// Spreadsheet Collaborator
// =============================================================================

/// Default spreadsheet sync command (reads CSV on stdin)
pub const SHEET_SYNC_COMMAND: &str = "update-gsheet";

/// Flag asking the sync command for the last recorded date
pub const SHEET_LAST_DATE_FLAG: &str = "--get-last-date";

/// Default worksheet tab
pub const SHEET_DEFAULT_TAB: &str = "stLink Data";

// =============================================================================
// File Names
// =============================================================================

/// Cache database filename
pub const CACHE_FILENAME: &str = "cache.sqlite";

/// Default config file
pub const CONFIG_FILENAME: &str = "config.toml";

/// Cache metadata key: last block written to the ledger
pub const META_LAST_BLOCK: &str = "last_ledger_block";

/// Cache metadata key: completion time of the last run (RFC 3339)
pub const META_LAST_RUN: &str = "last_run";
