//! Selection of the blocks that make up the ledger
//!
//! Three sources contribute blocks: staking transfers of the wallet, weekly
//! Monday snapshots, and reward updates on the rebase controller. They are
//! merged into one ascending list with at most one entry per block.

use anyhow::Result;
use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc, Weekday};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::chain::{BlockLocator, ChainReader};
use crate::config::Config;
use crate::constants;
use crate::explorer::{ExplorerClient, TransferDirection};

/// Why a block is in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecordType {
    // Declaration order is merge precedence (lowest first)
    Snapshot,
    Reward,
    Transfer,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Transfer => "transfer",
            RecordType::Snapshot => "snapshot",
            RecordType::Reward => "reward",
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedBlock {
    pub block_number: u64,
    pub record_type: RecordType,
    /// Set for transfer blocks
    pub direction: Option<TransferDirection>,
}

/// Where the ledger starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPoint {
    /// Protocol launch; snapshots begin at the wallet's first staking transfer
    Launch,
    /// Explicit date (00:00 UTC)
    Date(NaiveDate),
}

/// Every Monday at `time_of_day` UTC with `start <= target < cutoff 00:00 UTC`
pub fn monday_targets(
    start: DateTime<Utc>,
    cutoff: NaiveDate,
    time_of_day: NaiveTime,
) -> Vec<DateTime<Utc>> {
    let end = midnight(cutoff);
    let mut targets = Vec::new();

    let mut day = start.date_naive();
    while midnight(day) < end {
        if day.weekday() == Weekday::Mon {
            let target = day.and_time(time_of_day).and_utc();
            if start <= target && target < end {
                targets.push(target);
            }
        }
        match day.checked_add_days(Days::new(1)) {
            Some(next) => day = next,
            None => break,
        }
    }

    targets
}

/// Effective start of an incremental run: the last recorded date minus the overlap
pub fn incremental_start(last_recorded: NaiveDate) -> NaiveDate {
    last_recorded
        .checked_sub_days(Days::new(constants::INCREMENTAL_OVERLAP_DAYS as u64))
        .unwrap_or(last_recorded)
}

/// Union of the three sources, ascending, tagged transfer > reward > snapshot
pub fn merge(
    transfers: &[(u64, TransferDirection)],
    rewards: &[u64],
    snapshots: &[u64],
) -> Vec<SelectedBlock> {
    let mut blocks: BTreeMap<u64, SelectedBlock> = BTreeMap::new();

    let candidates = transfers
        .iter()
        .map(|(block, direction)| (*block, RecordType::Transfer, Some(*direction)))
        .chain(rewards.iter().map(|block| (*block, RecordType::Reward, None)))
        .chain(snapshots.iter().map(|block| (*block, RecordType::Snapshot, None)));

    for (block_number, record_type, direction) in candidates {
        let candidate = SelectedBlock {
            block_number,
            record_type,
            direction,
        };
        blocks
            .entry(block_number)
            .and_modify(|existing| {
                if candidate.record_type > existing.record_type {
                    *existing = candidate;
                }
            })
            .or_insert(candidate);
    }

    blocks.into_values().collect()
}

/// Resolve the ledger's blocks against the chain and the explorer
pub async fn select_blocks<C: ChainReader + ?Sized>(
    config: &Config,
    locator: &BlockLocator<'_, C>,
    explorer: &ExplorerClient,
    start: StartPoint,
) -> Result<Vec<SelectedBlock>> {
    let start_date = match start {
        StartPoint::Launch => config.default_start_date,
        StartPoint::Date(date) => date,
    };

    let Some(start_block) = locator
        .first_block_at_or_after(timestamp_of(midnight(start_date)))
        .await?
    else {
        warn!(%start_date, "Start date is past the chain head, nothing to do");
        return Ok(Vec::new());
    };
    info!(%start_date, start_block, "Resolved start block");

    let transfers: Vec<(u64, TransferDirection)> = explorer
        .list_token_transfers(config.wallet, None, start_block)
        .await?
        .into_iter()
        .filter_map(|t| {
            let direction = t.direction(config.wallet, config.contracts.stake_contract)?;
            debug!(
                block = t.block_number,
                %direction,
                symbol = %t.symbol,
                token = %t.contract,
                value = %t.value,
                hash = %t.hash,
                "Staking transfer"
            );
            Some((t.block_number, direction))
        })
        .collect();

    let (reward_from, snapshot_start) = match start {
        StartPoint::Date(_) => (start_block, midnight(start_date)),
        StartPoint::Launch => {
            let Some(earliest) = transfers.iter().map(|(block, _)| *block).min() else {
                warn!(wallet = %config.wallet, "No staking transfers found since launch");
                return Ok(Vec::new());
            };
            let ts = locator.timestamp(earliest).await?;
            let first = DateTime::from_timestamp(ts as i64, 0).unwrap_or(midnight(start_date));
            info!(block = earliest, date = %first, "First staking transfer");
            (earliest, first)
        }
    };

    let rewards: Vec<u64> = explorer
        .list_reward_updates(
            config.contracts.rebase_controller,
            &config.update_rewards_selector,
            reward_from,
        )
        .await?
        .into_iter()
        .map(|u| {
            debug!(block = u.block_number, hash = %u.hash, "Reward update");
            u.block_number
        })
        .collect();

    let mut snapshots = Vec::new();
    for target in monday_targets(snapshot_start, config.snapshot_cutoff, config.snapshot_time) {
        match locator.first_block_at_or_after(timestamp_of(target)).await? {
            Some(block) => snapshots.push(block),
            None => break,
        }
    }

    info!(
        transfers = transfers.len(),
        rewards = rewards.len(),
        snapshots = snapshots.len(),
        "Collected ledger blocks"
    );

    Ok(merge(&transfers, &rewards, &snapshots))
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::default()).and_utc()
}

fn timestamp_of(at: DateTime<Utc>) -> u64 {
    at.timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::chain::testing::FakeChain;
    use alloy::primitives::Address;
    use serde_json::json;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const WALLET: &str = "0x00000000000000000000000000000000000000a1";

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn one_pm() -> NaiveTime {
        NaiveTime::from_hms_opt(13, 0, 0).unwrap()
    }

    #[test]
    fn test_monday_count_launch_to_cutoff() {
        let targets = monday_targets(
            midnight(date("2023-10-19")),
            date("2025-02-24"),
            one_pm(),
        );

        assert_eq!(targets.len(), 70);
        assert_eq!(targets[0].to_string(), "2023-10-23 13:00:00 UTC");
        assert_eq!(targets[69].to_string(), "2025-02-17 13:00:00 UTC");
        assert!(targets.iter().all(|t| t.weekday() == Weekday::Mon));
    }

    #[test]
    fn test_monday_start_after_snapshot_time_skips_that_monday() {
        let start = date("2024-01-01").and_hms_opt(14, 0, 0).unwrap().and_utc();
        let targets = monday_targets(start, date("2024-01-16"), one_pm());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].date_naive(), date("2024-01-08"));
    }

    #[test]
    fn test_monday_cutoff_is_exclusive() {
        let targets = monday_targets(midnight(date("2025-02-10")), date("2025-02-24"), one_pm());
        let days: Vec<NaiveDate> = targets.iter().map(|t| t.date_naive()).collect();
        assert_eq!(days, vec![date("2025-02-10"), date("2025-02-17")]);
    }

    #[test]
    fn test_incremental_start_overlaps_a_week() {
        assert_eq!(incremental_start(date("2025-01-06")), date("2024-12-30"));
    }

    #[test]
    fn test_merge_precedence_and_order() {
        let merged = merge(
            &[(30, TransferDirection::Stake), (10, TransferDirection::Withdraw)],
            &[20, 30, 40],
            &[20, 40, 50, 10],
        );

        let summary: Vec<(u64, RecordType)> = merged
            .iter()
            .map(|b| (b.block_number, b.record_type))
            .collect();
        assert_eq!(
            summary,
            vec![
                (10, RecordType::Transfer),
                (20, RecordType::Reward),
                (30, RecordType::Transfer),
                (40, RecordType::Reward),
                (50, RecordType::Snapshot),
            ]
        );
        assert_eq!(merged[0].direction, Some(TransferDirection::Withdraw));
        assert_eq!(merged[1].direction, None);
    }

    // One block per hour from Monday 2024-01-01 00:00 UTC
    fn hourly_chain() -> FakeChain {
        FakeChain::new(midnight(date("2024-01-01")).timestamp() as u64, 3_600, 24 * 40)
    }

    fn test_config(server: &MockServer) -> Config {
        let mut config = Config::for_tests(WALLET);
        config.start_block = 0;
        config.default_start_date = date("2024-01-01");
        config.snapshot_cutoff = date("2024-01-31");
        config.explorer_api_base = server.uri();
        config
    }

    fn transfer(block: u64, from: Address, to: Address) -> serde_json::Value {
        json!({
            "blockNumber": block.to_string(),
            "hash": format!("0x{:064x}", block),
            "from": from.to_string(),
            "to": to.to_string(),
            "contractAddress": "0x514910771af9ca656af840dff83e8264ecf986ca",
            "tokenSymbol": "LINK",
            "value": "1"
        })
    }

    async fn mount_listings(server: &MockServer, config: &Config, txlist_from: &str) {
        let wallet = config.wallet;
        let stake = config.contracts.stake_contract;
        let other: Address = "0x00000000000000000000000000000000000000ff".parse().unwrap();

        Mock::given(method("GET"))
            .and(query_param("action", "tokentx"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "1",
                "message": "OK",
                "result": [
                    transfer(50, stake, wallet),
                    transfer(60, wallet, other),
                    transfer(181, wallet, stake),
                ]
            })))
            .mount(server)
            .await;

        let controller = config.contracts.rebase_controller.to_string();
        Mock::given(method("GET"))
            .and(query_param("action", "txlist"))
            .and(query_param("startblock", txlist_from))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "1",
                "message": "OK",
                "result": [
                    { "blockNumber": "349", "hash": "0x01", "to": controller, "input": "0x128606a6", "isError": "0" },
                    { "blockNumber": "400", "hash": "0x02", "to": controller, "input": "0x128606a6", "isError": "0" }
                ]
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_select_from_explicit_date() {
        let server = MockServer::start().await;
        let config = test_config(&server);
        mount_listings(&server, &config, "24").await;

        let chain = hourly_chain();
        let cache = Cache::open_in_memory().await.unwrap();
        let locator = BlockLocator::new(&chain, &cache, config.start_block).await.unwrap();
        let explorer = ExplorerClient::for_tests(&server.uri(), 1000);

        let blocks = select_blocks(&config, &locator, &explorer, StartPoint::Date(date("2024-01-02")))
            .await
            .unwrap();

        let summary: Vec<(u64, RecordType)> = blocks
            .iter()
            .map(|b| (b.block_number, b.record_type))
            .collect();
        // Mondays 13:00 of Jan 8/15/22/29 are blocks 181/349/517/685
        assert_eq!(
            summary,
            vec![
                (50, RecordType::Transfer),
                (181, RecordType::Transfer),
                (349, RecordType::Reward),
                (400, RecordType::Reward),
                (517, RecordType::Snapshot),
                (685, RecordType::Snapshot),
            ]
        );
        assert_eq!(blocks[0].direction, Some(TransferDirection::Withdraw));
        assert_eq!(blocks[1].direction, Some(TransferDirection::Stake));
    }

    #[tokio::test]
    async fn test_select_from_launch_starts_at_first_transfer() {
        let server = MockServer::start().await;
        let config = test_config(&server);
        mount_listings(&server, &config, "50").await;

        let chain = hourly_chain();
        let cache = Cache::open_in_memory().await.unwrap();
        let locator = BlockLocator::new(&chain, &cache, config.start_block).await.unwrap();
        let explorer = ExplorerClient::for_tests(&server.uri(), 1000);

        let blocks = select_blocks(&config, &locator, &explorer, StartPoint::Launch)
            .await
            .unwrap();

        // First transfer is 2024-01-03 02:00, so the Jan 1 Monday is not a snapshot
        assert_eq!(blocks.first().map(|b| b.block_number), Some(50));
        assert!(blocks.iter().all(|b| b.block_number != 13));
        assert_eq!(blocks.len(), 6);
    }

    #[tokio::test]
    async fn test_select_without_transfers_is_empty() {
        let server = MockServer::start().await;
        let config = test_config(&server);

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "0",
                "message": "No transactions found",
                "result": []
            })))
            .mount(&server)
            .await;

        let chain = hourly_chain();
        let cache = Cache::open_in_memory().await.unwrap();
        let locator = BlockLocator::new(&chain, &cache, config.start_block).await.unwrap();
        let explorer = ExplorerClient::for_tests(&server.uri(), 1000);

        let blocks = select_blocks(&config, &locator, &explorer, StartPoint::Launch)
            .await
            .unwrap();
        assert!(blocks.is_empty());
    }
}
