//! Per-block balance records and reward attribution
//!
//! Blocks are processed in ascending order. Each record is computed once
//! against the state at its block and compared with the record emitted
//! just before it; nothing already emitted is revised.

use alloy::primitives::{Address, I256, U256};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::chain::{ChainReader, resolve_timestamp};
use crate::config::Config;
use crate::explorer::TransferDirection;
use crate::ipfs::ManifestSource;
use crate::selector::{RecordType, SelectedBlock};
use crate::units::signed;

/// One ledger row
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRecord {
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    pub record_type: RecordType,
    pub direction: Option<TransferDirection>,
    /// stLINK held by the wallet
    pub stlink_balance: U256,
    /// LINK held by the wallet
    pub link_balance: U256,
    /// stLINK held for the wallet by the priority pool
    pub lsd_tokens: U256,
    /// LINK queued in the priority pool
    pub queued_tokens: U256,
    /// Only on reward rows, and only when this row and the one before it read their manifests
    pub reward_share: Option<I256>,
    pub link_price_usd: Option<f64>,
    pub warnings: Vec<String>,
}

/// The balances a reward delta is taken over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Baseline {
    block: u64,
    stlink: U256,
    lsd: U256,
    queued: U256,
    /// Pool balances were read with a zero allocation after a manifest failure
    degraded: bool,
}

/// `(stlink - prev_stlink) + (lsd - prev_lsd) - (prev_queued - queued)`
fn reward_delta(current: &Baseline, previous: &Baseline) -> I256 {
    (signed(current.stlink) - signed(previous.stlink)) + (signed(current.lsd) - signed(previous.lsd))
        - (signed(previous.queued) - signed(current.queued))
}

pub struct LedgerBuilder<'a, C: ?Sized, M> {
    config: &'a Config,
    chain: &'a C,
    cache: &'a Cache,
    manifests: M,
    previous: Option<Baseline>,
    last_block: Option<u64>,
}

impl<'a, C: ChainReader + ?Sized, M: ManifestSource> LedgerBuilder<'a, C, M> {
    pub fn new(config: &'a Config, chain: &'a C, cache: &'a Cache, manifests: M) -> Self {
        Self {
            config,
            chain,
            cache,
            manifests,
            previous: None,
            last_block: None,
        }
    }

    /// Resolve one block. Returns None for a reward block that has nothing to compare against.
    ///
    /// Any chain read failing after its retries is fatal: later rows depend on this one.
    pub async fn process(&mut self, selected: &SelectedBlock) -> Result<Option<BlockRecord>> {
        let block = selected.block_number;
        if let Some(last) = self.last_block {
            anyhow::ensure!(
                block > last,
                "Blocks must be processed in ascending order ({} after {})",
                block,
                last
            );
        }

        let (mut record, manifest_ok) = self
            .resolve(selected)
            .await
            .with_context(|| format!("Failed to resolve block {}", block))?;

        let current = Baseline {
            block,
            stlink: record.stlink_balance,
            lsd: record.lsd_tokens,
            queued: record.queued_tokens,
            degraded: !manifest_ok,
        };

        if selected.record_type == RecordType::Reward {
            let Some(previous) = self.previous else {
                info!(block, "Skipping reward block without a preceding record");
                return Ok(None);
            };
            if previous.degraded {
                warn!(block, previous = previous.block, "Preceding record has incomplete pool balances");
                record.warnings.push(format!(
                    "reward unavailable: pool balances at block {} were read without a manifest",
                    previous.block
                ));
            } else if manifest_ok {
                record.reward_share = Some(reward_delta(&current, &previous));
            }
        }

        self.previous = Some(current);
        self.last_block = Some(block);
        Ok(Some(record))
    }

    /// The record without its reward, and whether the manifest could be read
    async fn resolve(&mut self, selected: &SelectedBlock) -> Result<(BlockRecord, bool)> {
        let block = selected.block_number;
        let wallet: Address = self.config.wallet;
        let contracts = &self.config.contracts;

        let ts = resolve_timestamp(self.chain, self.cache, block).await?;
        let timestamp = DateTime::from_timestamp(ts as i64, 0)
            .with_context(|| format!("Block timestamp {} out of range", ts))?;

        let mut warnings = Vec::new();
        let digest = self.chain.ipfs_hash(block).await?;
        let (allocation, manifest_ok) = match self.manifests.allocation(digest, wallet).await {
            Ok(allocation) => (allocation, true),
            Err(e) => {
                warn!(block, error = %e, "Distribution manifest unavailable, using a zero allocation");
                warnings.push(e.to_string());
                (Default::default(), false)
            }
        };

        let pool = self.chain.pool_state(wallet, &allocation, block).await?;
        let stlink_balance = self
            .chain
            .token_balance(contracts.stlink_token, wallet, block)
            .await?;
        let link_balance = self
            .chain
            .token_balance(contracts.link_token, wallet, block)
            .await?;

        debug!(block, %stlink_balance, %link_balance, staked = %pool.staked, queued = %pool.queued, "Resolved block");

        let record = BlockRecord {
            block_number: block,
            timestamp,
            record_type: selected.record_type,
            direction: selected.direction,
            stlink_balance,
            link_balance,
            lsd_tokens: pool.staked,
            queued_tokens: pool.queued,
            reward_share: None,
            link_price_usd: None,
            warnings,
        };
        Ok((record, manifest_ok))
    }
}
