//! Historical contract reads against the Ethereum JSON-RPC endpoint
//!
//! Every read is pinned to a block number. Transient failures are retried
//! with exponential backoff; once the attempts are exhausted the error is
//! returned and the run stops rather than emitting a zeroed row.

use alloy::primitives::{Address, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::sol;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::constants;
use crate::ipfs::Allocation;

sol! {
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256);
    }

    #[sol(rpc)]
    interface IStakingDataProvider {
        function ipfsHash() external view returns (bytes32);
        function getLSDTokens(address account, uint256 distributionShareAmount) external view returns (uint256);
        function getQueuedTokens(address account, uint256 distributionAmount) external view returns (uint256);
    }
}

/// Block number and its timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSummary {
    pub number: u64,
    pub timestamp: u64,
}

/// A wallet's position in the staking pool at a block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolState {
    /// stLINK held for the wallet by the pool (LSD tokens)
    pub staked: U256,
    /// LINK still queued for deposit
    pub queued: U256,
}

/// State-at-block reads the ledger needs
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Current chain head
    async fn latest_block(&self) -> Result<BlockSummary>;

    /// Timestamp (unix seconds) of a block
    async fn block_timestamp(&self, block: u64) -> Result<u64>;

    /// ERC-20 balance of `owner` at `block`
    async fn token_balance(&self, token: Address, owner: Address, block: u64) -> Result<U256>;

    /// Digest of the distribution manifest published by the staking contract
    async fn ipfs_hash(&self, block: u64) -> Result<B256>;

    /// Staked and queued amounts, given the wallet's manifest allocation
    async fn pool_state(
        &self,
        account: Address,
        allocation: &Allocation,
        block: u64,
    ) -> Result<PoolState>;
}

/// Alloy-backed [`ChainReader`]
pub struct RpcChainReader {
    provider: DynProvider,
    stake_contract: Address,
    retry_base: Duration,
}

impl RpcChainReader {
    /// Connect to the RPC endpoint
    pub async fn connect(rpc_url: &str, stake_contract: Address) -> Result<Self> {
        let provider = ProviderBuilder::new()
            .connect(rpc_url)
            .await
            .context("Failed to connect to the RPC endpoint")?
            .erased();

        Ok(Self {
            provider,
            stake_contract,
            retry_base: Duration::from_secs(1),
        })
    }
}

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn latest_block(&self) -> Result<BlockSummary> {
        let number = with_retry("eth_blockNumber", self.retry_base, || async {
            self.provider.get_block_number().await
        })
        .await?;
        let timestamp = self.block_timestamp(number).await?;
        Ok(BlockSummary { number, timestamp })
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64> {
        let header = with_retry("eth_getBlockByNumber", self.retry_base, || async {
            self.provider.get_block_by_number(block.into()).await
        })
        .await
        .with_context(|| format!("Failed to fetch block {}", block))?;

        let block_data = header.with_context(|| format!("Block {} not found", block))?;
        Ok(block_data.header.timestamp)
    }

    async fn token_balance(&self, token: Address, owner: Address, block: u64) -> Result<U256> {
        let contract = IERC20::new(token, self.provider.clone());
        with_retry("balanceOf", self.retry_base, || async {
            contract.balanceOf(owner).block(block.into()).call().await
        })
        .await
        .with_context(|| format!("balanceOf({}) on {} at block {}", owner, token, block))
    }

    async fn ipfs_hash(&self, block: u64) -> Result<B256> {
        let contract = IStakingDataProvider::new(self.stake_contract, self.provider.clone());
        with_retry("ipfsHash", self.retry_base, || async {
            contract.ipfsHash().block(block.into()).call().await
        })
        .await
        .with_context(|| format!("ipfsHash() at block {}", block))
    }

    async fn pool_state(
        &self,
        account: Address,
        allocation: &Allocation,
        block: u64,
    ) -> Result<PoolState> {
        let contract = IStakingDataProvider::new(self.stake_contract, self.provider.clone());

        let staked = with_retry("getLSDTokens", self.retry_base, || async {
            contract
                .getLSDTokens(account, allocation.shares_amount)
                .block(block.into())
                .call()
                .await
        })
        .await
        .with_context(|| format!("getLSDTokens at block {}", block))?;

        let queued = with_retry("getQueuedTokens", self.retry_base, || async {
            contract
                .getQueuedTokens(account, allocation.amount)
                .block(block.into())
                .call()
                .await
        })
        .await
        .with_context(|| format!("getQueuedTokens at block {}", block))?;

        Ok(PoolState { staked, queued })
    }
}

/// Run `op` up to [`constants::RPC_MAX_ATTEMPTS`] times with exponential backoff
pub async fn with_retry<T, E, F, Fut>(what: &str, base_delay: Duration, mut op: F) -> Result<T>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let mut last_error = None;

    for attempt in 0..constants::RPC_MAX_ATTEMPTS {
        if attempt > 0 {
            let delay = base_delay * 2u32.pow(attempt - 1);
            debug!(call = what, attempt, ?delay, "Retrying RPC call");
            sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(call = what, attempt = attempt + 1, error = %e, "RPC call failed");
                last_error = Some(e.to_string());
            }
        }
    }

    Err(anyhow::anyhow!(
        "{} failed after {} attempts: {}",
        what,
        constants::RPC_MAX_ATTEMPTS,
        last_error.unwrap_or_default()
    ))
}

/// Block timestamp from the cache, falling back to the chain (and filling the cache)
pub async fn resolve_timestamp<C: ChainReader + ?Sized>(
    chain: &C,
    cache: &Cache,
    block: u64,
) -> Result<u64> {
    match cache.get_block_timestamp(block).await {
        Ok(Some(ts)) => return Ok(ts),
        Ok(None) => {}
        Err(e) => warn!(block, error = %e, "Cache read failed, fetching from chain"),
    }

    let ts = chain.block_timestamp(block).await?;
    if let Err(e) = cache.put_block_timestamp(block, ts).await {
        warn!(block, error = %e, "Cache write failed");
    }
    Ok(ts)
}

/// Finds blocks by timestamp within `[lower_bound, head]`
pub struct BlockLocator<'a, C: ?Sized> {
    chain: &'a C,
    cache: &'a Cache,
    lower_bound: u64,
    head: BlockSummary,
}

impl<'a, C: ChainReader + ?Sized> BlockLocator<'a, C> {
    /// Snapshot the chain head once; all searches share it
    pub async fn new(chain: &'a C, cache: &'a Cache, lower_bound: u64) -> Result<Self> {
        let head = chain.latest_block().await?;
        Ok(Self {
            chain,
            cache,
            lower_bound: lower_bound.min(head.number),
            head,
        })
    }

    pub fn head(&self) -> BlockSummary {
        self.head
    }

    /// Timestamp of `block`, cached
    pub async fn timestamp(&self, block: u64) -> Result<u64> {
        resolve_timestamp(self.chain, self.cache, block).await
    }

    /// First block with timestamp >= `target`, or None when `target` is past the head
    pub async fn first_block_at_or_after(&self, target: u64) -> Result<Option<u64>> {
        if target > self.head.timestamp {
            return Ok(None);
        }

        let mut lo = self.lower_bound;
        let mut hi = self.head.number;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let ts = resolve_timestamp(self.chain, self.cache, mid).await?;
            if ts < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        debug!(target, block = lo, "Located block");
        Ok(Some(lo))
    }
}
