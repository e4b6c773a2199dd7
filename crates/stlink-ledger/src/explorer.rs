//! Transaction history from the Etherscan v2 API
//!
//! Two listings feed the event selector: ERC-20 transfers of the wallet
//! (`tokentx`) and transactions sent to the rebase controller (`txlist`).
//! Both are paginated in ascending block order.

use alloy::primitives::{Address, U256};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::constants;

/// Etherscan's answer when a listing is empty
const NO_TRANSACTIONS: &str = "No transactions found";

#[derive(Debug, Error)]
pub enum ExplorerError {
    #[error("explorer rate limit reached")]
    RateLimited,

    #[error("explorer returned HTTP status {0}")]
    Status(u16),

    #[error("explorer request failed: {0}")]
    Request(String),

    #[error("explorer rejected the request: {message} ({result})")]
    Api { message: String, result: String },

    #[error("failed to decode explorer response: {0}")]
    Decode(String),
}

/// Envelope shared by every Etherscan account endpoint
#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    message: String,
    result: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTokenTransfer {
    block_number: String,
    hash: String,
    from: String,
    to: String,
    contract_address: String,
    #[serde(default)]
    token_symbol: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    block_number: String,
    hash: String,
    to: String,
    input: String,
    #[serde(default)]
    is_error: String,
}

/// Rows of a block-ordered listing
trait ListedRow {
    fn block_number(&self) -> &str;
}

impl ListedRow for RawTokenTransfer {
    fn block_number(&self) -> &str {
        &self.block_number
    }
}

impl ListedRow for RawTransaction {
    fn block_number(&self) -> &str {
        &self.block_number
    }
}

/// An ERC-20 transfer involving the wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    pub block_number: u64,
    pub hash: String,
    pub from: Address,
    pub to: Address,
    pub contract: Address,
    pub symbol: String,
    pub value: U256,
}

/// A successful reward update sent to the rebase controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardUpdate {
    pub block_number: u64,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Wallet -> staking contract
    Stake,
    /// Staking contract -> wallet
    Withdraw,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferDirection::Stake => write!(f, "Stake"),
            TransferDirection::Withdraw => write!(f, "Withdraw"),
        }
    }
}

impl TokenTransfer {
    /// Direction relative to the staking contract; None for unrelated transfers
    pub fn direction(&self, wallet: Address, stake_contract: Address) -> Option<TransferDirection> {
        if self.from == wallet && self.to == stake_contract {
            Some(TransferDirection::Stake)
        } else if self.from == stake_contract && self.to == wallet {
            Some(TransferDirection::Withdraw)
        } else {
            None
        }
    }
}

/// Etherscan v2 client
pub struct ExplorerClient {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    page_size: usize,
    result_window: usize,
    page_delay: Duration,
    retry_base: Duration,
}

impl ExplorerClient {
    pub fn new(api_base: &str, api_key: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(constants::HTTP_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.to_string(),
            api_key: api_key.to_string(),
            page_size: constants::EXPLORER_PAGE_SIZE,
            result_window: constants::EXPLORER_RESULT_WINDOW,
            page_delay: Duration::from_millis(constants::EXPLORER_PAGE_DELAY_MS),
            retry_base: Duration::from_secs(1),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(api_base: &str, page_size: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.to_string(),
            api_key: "test-key".to_string(),
            page_size,
            result_window: constants::EXPLORER_RESULT_WINDOW,
            page_delay: Duration::from_millis(1),
            retry_base: Duration::from_millis(1),
        }
    }

    #[cfg(test)]
    fn with_result_window(mut self, result_window: usize) -> Self {
        self.result_window = result_window;
        self
    }

    /// ERC-20 transfers of `wallet` from `since_block`, optionally restricted to one token
    pub async fn list_token_transfers(
        &self,
        wallet: Address,
        token_contract: Option<Address>,
        since_block: u64,
    ) -> anyhow::Result<Vec<TokenTransfer>> {
        let mut extra = Vec::new();
        if let Some(token) = token_contract {
            extra.push(("contractaddress", token.to_string()));
        }

        let raw: Vec<RawTokenTransfer> = self
            .fetch_all("tokentx", wallet, since_block, &extra)
            .await?;

        let mut transfers = Vec::with_capacity(raw.len());
        for tx in raw {
            // Contract creations and burns can carry an empty counterparty
            let (Ok(from), Ok(to)) = (tx.from.parse::<Address>(), tx.to.parse::<Address>()) else {
                debug!(hash = %tx.hash, "Skipping transfer without counterparties");
                continue;
            };

            let (Ok(contract), Ok(value)) = (
                tx.contract_address.parse::<Address>(),
                tx.value.parse::<U256>(),
            ) else {
                debug!(
                    hash = %tx.hash,
                    contract = %tx.contract_address,
                    value = %tx.value,
                    "Skipping transfer with malformed contract or value"
                );
                continue;
            };

            transfers.push(TokenTransfer {
                block_number: parse_block_number(&tx.block_number)?,
                hash: tx.hash,
                from,
                to,
                contract,
                symbol: tx.token_symbol,
                value,
            });
        }

        info!(wallet = %wallet, count = transfers.len(), "Listed token transfers");
        Ok(transfers)
    }

    /// Successful calls to the rebase controller whose input starts with `selector`
    pub async fn list_reward_updates(
        &self,
        rebase_controller: Address,
        selector: &str,
        since_block: u64,
    ) -> anyhow::Result<Vec<RewardUpdate>> {
        let raw: Vec<RawTransaction> = self
            .fetch_all("txlist", rebase_controller, since_block, &[])
            .await?;

        let selector = selector.to_ascii_lowercase();
        let mut updates = Vec::new();
        for tx in raw {
            let sent_to_controller = tx
                .to
                .parse::<Address>()
                .is_ok_and(|to| to == rebase_controller);
            if !sent_to_controller
                || tx.is_error == "1"
                || !tx.input.to_ascii_lowercase().starts_with(&selector)
            {
                continue;
            }

            updates.push(RewardUpdate {
                block_number: parse_block_number(&tx.block_number)?,
                hash: tx.hash,
            });
        }

        info!(count = updates.len(), "Listed reward updates");
        Ok(updates)
    }

    /// Walk every page of an account listing
    ///
    /// The explorer only pages through `result_window` rows per query. When
    /// the window is used up the query restarts at the last block seen, and
    /// the rows of that block are dropped so the new window returns them once.
    async fn fetch_all<T: DeserializeOwned + ListedRow>(
        &self,
        action: &str,
        address: Address,
        since_block: u64,
        extra: &[(&str, String)],
    ) -> anyhow::Result<Vec<T>> {
        let mut items: Vec<T> = Vec::new();
        let mut start = since_block;
        let mut page = 1usize;

        loop {
            let batch: Vec<T> = self
                .fetch_page(action, address, start, page, extra)
                .await
                .map_err(|e| anyhow::anyhow!("{} page {}: {}", action, page, e))?;
            let count = batch.len();
            items.extend(batch);

            debug!(action, start, page, count, "Fetched explorer page");
            if count < self.page_size {
                break;
            }

            sleep(self.page_delay).await;

            if (page + 1) * self.page_size <= self.result_window {
                page += 1;
                continue;
            }

            let last = match items.last() {
                Some(row) => parse_block_number(row.block_number())?,
                None => break,
            };
            anyhow::ensure!(
                last > start,
                "{} listing has more than {} rows at block {}",
                action,
                self.result_window,
                start
            );
            while let Some(row) = items.last() {
                if parse_block_number(row.block_number())? != last {
                    break;
                }
                items.pop();
            }

            debug!(action, from_block = last, "Explorer result window used up, continuing");
            start = last;
            page = 1;
        }

        Ok(items)
    }

    /// One page, retrying rate limits and transient failures
    async fn fetch_page<T: DeserializeOwned>(
        &self,
        action: &str,
        address: Address,
        since_block: u64,
        page: usize,
        extra: &[(&str, String)],
    ) -> Result<Vec<T>, ExplorerError> {
        let mut params = vec![
            ("chainid", constants::MAINNET_CHAIN_ID.to_string()),
            ("module", "account".to_string()),
            ("action", action.to_string()),
            ("address", address.to_string()),
            ("startblock", since_block.to_string()),
            ("endblock", "99999999".to_string()),
            ("page", page.to_string()),
            ("offset", self.page_size.to_string()),
            ("sort", "asc".to_string()),
            ("apikey", self.api_key.clone()),
        ];
        params.extend(extra.iter().cloned());

        let url = reqwest::Url::parse_with_params(&self.api_base, &params)
            .map_err(|e| ExplorerError::Request(e.to_string()))?;

        let mut rate_limited = 0u32;
        let mut failed = 0u32;

        loop {
            let error = match self.request(url.clone()).await {
                Ok(items) => return Ok(items),
                Err(e) => e,
            };

            let attempts = match &error {
                ExplorerError::RateLimited => {
                    rate_limited += 1;
                    if rate_limited >= constants::EXPLORER_RATE_LIMIT_ATTEMPTS {
                        return Err(error);
                    }
                    rate_limited
                }
                ExplorerError::Status(_) | ExplorerError::Request(_) => {
                    failed += 1;
                    if failed >= constants::EXPLORER_MAX_ATTEMPTS {
                        return Err(error);
                    }
                    failed
                }
                ExplorerError::Api { .. } | ExplorerError::Decode(_) => return Err(error),
            };

            let delay = self.retry_base * 2u32.pow(attempts);
            warn!(action, page, error = %error, ?delay, "Explorer request failed, retrying");
            sleep(delay).await;
        }
    }

    async fn request<T: DeserializeOwned>(&self, url: reqwest::Url) -> Result<Vec<T>, ExplorerError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ExplorerError::Request(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ExplorerError::RateLimited);
        }
        if !status.is_success() {
            return Err(ExplorerError::Status(status.as_u16()));
        }

        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| ExplorerError::Decode(e.to_string()))?;

        if body.status != "1" {
            let result = match &body.result {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };

            if body.message.starts_with(NO_TRANSACTIONS) || result.starts_with(NO_TRANSACTIONS) {
                return Ok(Vec::new());
            }
            if result.to_ascii_lowercase().contains("rate limit") {
                return Err(ExplorerError::RateLimited);
            }
            return Err(ExplorerError::Api {
                message: body.message,
                result,
            });
        }

        serde_json::from_value(body.result).map_err(|e| ExplorerError::Decode(e.to_string()))
    }
}

fn parse_block_number(value: &str) -> anyhow::Result<u64> {
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid block number '{}': {}", value, e))
}
