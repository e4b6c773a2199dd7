//! stLINK staking ledger
//!
//! Reconstructs the balance history of one wallet in the stake.link LINK
//! staking pool: staking transfers, weekly snapshots and reward updates,
//! each resolved against historical chain state. The ledger is printed,
//! streamed as CSV, or forwarded to a spreadsheet.

mod cache;
mod chain;
mod config;
mod constants;
mod explorer;
mod ipfs;
mod ledger;
mod prices;
mod reports;
mod selector;
mod sheets;
mod units;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use cache::Cache;
use chain::{BlockLocator, ChainReader, RpcChainReader};
use config::{Config, Credentials, FileConfig};
use explorer::ExplorerClient;
use ipfs::{IpfsClient, ManifestSource};
use ledger::LedgerBuilder;
use prices::PriceClient;
use reports::Reporter;
use selector::{SelectedBlock, StartPoint};
use sheets::SheetSync;

#[derive(Parser, Debug)]
#[command(name = "stlink-ledger")]
#[command(about = "Balance and reward ledger for a stake.link stLINK wallet")]
struct Args {
    /// Data directory for the cache database
    #[arg(long, default_value = "./data", global = true)]
    data_dir: PathBuf,

    /// Optional config file with protocol overrides
    #[arg(long, default_value = constants::CONFIG_FILENAME, global = true)]
    config: PathBuf,

    /// Verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,

    /// Start date (YYYY-MM-DD, default: protocol launch or the spreadsheet's last date)
    #[arg(long)]
    datefrom: Option<NaiveDate>,

    /// Emit CSV on stdout and nothing else
    #[arg(long)]
    csv: bool,

    /// Add the LINK/USD price to reward rows
    #[arg(long)]
    with_price: bool,

    /// No weekly snapshots on or after this date (YYYY-MM-DD)
    #[arg(long)]
    cutoff: Option<NaiveDate>,

    /// Ethereum JSON-RPC endpoint
    #[arg(long, env = "RPC_URL", hide_env_values = true)]
    rpc_url: Option<String>,

    /// Etherscan API key
    #[arg(long, env = "ETHERSCAN_API_KEY", hide_env_values = true)]
    etherscan_api_key: Option<String>,

    /// Wallet to track
    #[arg(long, env = "USER_WALLET_ADDRESS")]
    wallet: Option<String>,

    /// CoinGecko demo API key (used with --with-price)
    #[arg(long, env = "COINGECKO_API_KEY", hide_env_values = true)]
    coingecko_api_key: Option<String>,

    /// Spreadsheet to append to (switches to spreadsheet mode)
    #[arg(long, env = "GOOGLE_SHEET_URL")]
    sheet_url: Option<String>,

    /// Spreadsheet tab
    #[arg(long, env = "GOOGLE_SHEET_TAB_NAME")]
    sheet_tab: Option<String>,

    /// Service account key file for the spreadsheet
    #[arg(long, env = "GCP_SERVICE_ACCOUNT_FILE")]
    service_account_file: Option<PathBuf>,
}

impl Args {
    fn credentials(&self) -> Credentials {
        Credentials {
            rpc_url: self.rpc_url.clone(),
            etherscan_api_key: self.etherscan_api_key.clone(),
            wallet: self.wallet.clone(),
            coingecko_api_key: self.coingecko_api_key.clone(),
            sheet_url: self.sheet_url.clone(),
            sheet_tab: self.sheet_tab.clone(),
            service_account_file: self.service_account_file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect or maintain the cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Show entry counts and the last run
    Stats,

    /// Rewrite the cache file compactly
    Compact,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // CSV mode keeps stdout and stderr free of diagnostics
    let quiet = args.csv;
    if !quiet {
        init_tracing(args.verbose);
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !quiet {
                eprintln!("Error: {:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> Result<()> {
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("Failed to create {}", args.data_dir.display()))?;

    let cache_path = args.data_dir.join(constants::CACHE_FILENAME);
    let cache = Cache::open(&cache_path).await?;

    if let Some(Command::Cache { action }) = &args.command {
        return handle_cache_command(action, cache).await;
    }

    let result = run_ledger(&args, &cache).await;
    cache.close().await;
    result
}

/// Handle cache maintenance subcommands
async fn handle_cache_command(action: &CacheCommand, cache: Cache) -> Result<()> {
    match action {
        CacheCommand::Stats => {
            let stats = cache.stats().await?;
            println!("Cache: {}", stats);
            if let Some(block) = cache.get_metadata(constants::META_LAST_BLOCK).await? {
                println!("Last ledger block: {}", block);
            }
            if let Some(at) = cache.get_metadata(constants::META_LAST_RUN).await? {
                println!("Last run: {}", at);
            }
            cache.close().await;
        }
        CacheCommand::Compact => {
            let cache = cache.compact().await?;
            println!("Compacted cache: {}", cache.stats().await?);
            cache.close().await;
        }
    }
    Ok(())
}

/// Select blocks, build the ledger and hand it to the chosen output
async fn run_ledger(args: &Args, cache: &Cache) -> Result<()> {
    let file_config = FileConfig::load_or_default(&args.config)?;
    let mut config = Config::from_sources(&file_config, args.credentials())?;
    if let Some(cutoff) = args.cutoff {
        config.snapshot_cutoff = cutoff;
    }

    info!(wallet = %config.wallet, rpc = %config.masked_rpc_url(), "Starting stLINK ledger");
    if let Ok(stats) = cache.stats().await {
        debug!(%stats, "Cache");
    }

    let sync = config.spreadsheet.as_ref().map(SheetSync::new);
    let start = resolve_start(args.datefrom, sync.as_ref()).await?;

    let chain = RpcChainReader::connect(&config.rpc_url, config.contracts.stake_contract).await?;
    let locator = BlockLocator::new(&chain, cache, config.start_block).await?;
    info!(head = locator.head().number, "Chain head");

    let explorer = ExplorerClient::new(&config.explorer_api_base, &config.etherscan_api_key)?;
    let blocks = selector::select_blocks(&config, &locator, &explorer, start).await?;

    let ipfs = IpfsClient::new(&config.ipfs_gateway)?;
    let mut builder = LedgerBuilder::new(&config, &chain, cache, ipfs);
    let prices = if args.with_price {
        Some(PriceClient::new(
            &config.coingecko_api_base,
            config.coingecko_api_key.as_deref(),
            cache,
        )?)
    } else {
        None
    };

    let last_block = match &sync {
        Some(sync) => {
            let mut reporter = Reporter::csv(Vec::new(), args.with_price)?;
            let last = emit(&mut builder, prices.as_ref(), &blocks, &mut reporter).await?;
            let csv = reporter.finish()?;
            if last.is_some() {
                sync.append(&csv).await?;
            } else {
                info!("No new rows for the spreadsheet");
            }
            last
        }
        None if args.csv => {
            let mut reporter = Reporter::csv(std::io::stdout(), args.with_price)?;
            let last = emit(&mut builder, prices.as_ref(), &blocks, &mut reporter).await?;
            reporter.finish()?;
            last
        }
        None => {
            let mut reporter = Reporter::text(std::io::stdout(), args.with_price);
            reporter.begin(config.wallet, blocks.len())?;
            let last = emit(&mut builder, prices.as_ref(), &blocks, &mut reporter).await?;
            reporter.finish()?;
            last
        }
    };

    if let Some(block) = last_block {
        cache
            .set_metadata(constants::META_LAST_BLOCK, &block.to_string())
            .await?;
    }
    cache
        .set_metadata(constants::META_LAST_RUN, &Utc::now().to_rfc3339())
        .await?;

    Ok(())
}

/// Explicit `--datefrom` wins; otherwise continue from the spreadsheet with a week of overlap
async fn resolve_start(datefrom: Option<NaiveDate>, sync: Option<&SheetSync<'_>>) -> Result<StartPoint> {
    if let Some(date) = datefrom {
        return Ok(StartPoint::Date(date));
    }

    let Some(sync) = sync else {
        return Ok(StartPoint::Launch);
    };

    match sync.last_recorded_date().await? {
        Some(last) => {
            let start = selector::incremental_start(last);
            info!(%last, %start, "Continuing from the spreadsheet's last date");
            Ok(StartPoint::Date(start))
        }
        None => Ok(StartPoint::Launch),
    }
}

/// Build and write every record; returns the last block written
async fn emit<C, M, W>(
    builder: &mut LedgerBuilder<'_, C, M>,
    prices: Option<&PriceClient<'_>>,
    blocks: &[SelectedBlock],
    reporter: &mut Reporter<W>,
) -> Result<Option<u64>>
where
    C: ChainReader + ?Sized,
    M: ManifestSource,
    W: Write,
{
    let mut last = None;

    for block in blocks {
        let Some(mut record) = builder.process(block).await? else {
            continue;
        };
        if let Some(prices) = prices {
            prices.annotate(&mut record).await;
        }
        reporter.write(&record)?;
        last = Some(record.block_number);
    }

    info!(blocks = blocks.len(), "Ledger complete");
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::FakeChain;
    use crate::config::SpreadsheetConfig;
    use crate::explorer::TransferDirection;
    use crate::selector::RecordType;
    use alloy::primitives::U256;

    fn sheet(script: &str) -> SpreadsheetConfig {
        SpreadsheetConfig {
            url: "https://docs.google.com/spreadsheets/d/abc".to_string(),
            tab_name: "stLink Data".to_string(),
            service_account_file: None,
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        }
    }

    fn tokens(n: u64) -> U256 {
        U256::from(n) * U256::from(10u64).pow(U256::from(18))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_datefrom_wins_over_spreadsheet() {
        // Fails if queried
        let config = sheet("exit 1");
        let sync = SheetSync::new(&config);
        let datefrom = NaiveDate::from_ymd_opt(2024, 6, 3);

        let start = resolve_start(datefrom, Some(&sync)).await.unwrap();
        assert_eq!(start, StartPoint::Date(datefrom.unwrap()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spreadsheet_last_date_backs_off_a_week() {
        let config = sheet("echo 2025-01-06");
        let sync = SheetSync::new(&config);

        let start = resolve_start(None, Some(&sync)).await.unwrap();
        assert_eq!(
            start,
            StartPoint::Date(NaiveDate::from_ymd_opt(2024, 12, 30).unwrap())
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_spreadsheet_starts_at_launch() {
        let config = sheet("true");
        let sync = SheetSync::new(&config);

        assert_eq!(resolve_start(None, Some(&sync)).await.unwrap(), StartPoint::Launch);
        assert_eq!(resolve_start(None, None).await.unwrap(), StartPoint::Launch);
    }

    #[tokio::test]
    async fn test_emit_writes_csv_rows() {
        let config = Config::for_tests("0x00000000000000000000000000000000000000a1");
        let mut chain = FakeChain::new(1_700_000_000, 12, 1_000);
        chain.balances = vec![
            (config.contracts.stlink_token, 0, tokens(100)),
            (config.contracts.stlink_token, 300, tokens(103)),
        ];
        chain.positions = vec![(0, tokens(50), tokens(10)), (300, tokens(52), tokens(8))];

        let cache = Cache::open_in_memory().await.unwrap();
        // No manifest published, so the gateway is never contacted
        let ipfs = IpfsClient::new("http://127.0.0.1:9/ipfs/").unwrap();
        let mut builder = LedgerBuilder::new(&config, &chain, &cache, ipfs);

        let blocks = [
            SelectedBlock {
                block_number: 50,
                record_type: RecordType::Reward,
                direction: None,
            },
            SelectedBlock {
                block_number: 100,
                record_type: RecordType::Transfer,
                direction: Some(TransferDirection::Stake),
            },
            SelectedBlock {
                block_number: 300,
                record_type: RecordType::Reward,
                direction: None,
            },
        ];

        let mut reporter = Reporter::csv(Vec::new(), false).unwrap();
        let last = emit(&mut builder, None, &blocks, &mut reporter).await.unwrap();
        let output = String::from_utf8(reporter.finish().unwrap()).unwrap();

        assert_eq!(last, Some(300));
        assert_eq!(
            output,
            "block_date,block,type,stlink_balance,link_balance,lsd_tokens,queued_tokens,reward_share\n\
             2023-11-14 22:33:20,100,transfer,100.0,0.0,50.0,10.0,\n\
             2023-11-14 23:13:20,300,reward,103.0,0.0,52.0,8.0,3.00000000\n"
        );
    }
}
