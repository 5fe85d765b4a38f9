use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy::primitives::Address;
use alloy::providers::Provider;
use apr_analysis::apr::Boost;
use apr_analysis::history::{run_history, HistoryRow, HistorySummary, OnChainAprSource, RowSink};
use apr_analysis::pricing::{required_price_ids, PoolPricing, TrackedPool};
use apr_analysis::report::CsvReport;
use apr_data::chain::{ChainReader, CurveContracts, HttpProvider};
use apr_data::memo::{CallKey, Memo};
use apr_data::prices::{self, PriceClient};
use apr_data::registry::{self, PoolRegistry};
use apr_data::retry::Backoff;
use apr_data::sampler::{ChainState, MidnightSampler, SamplerConfig};
use apr_data::store::{KvStore, SqliteStore};
use apr_data::types::SECONDS_PER_DAY;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{eyre, Context, Result};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct AppContext {
    cache_path: PathBuf,
    rpc_url: Option<String>,
    coingecko_url: String,
    coingecko_api_key: Option<String>,
    curve_api_url: String,
}

#[derive(Parser, Debug)]
#[command(name = "crv-apr")]
#[command(about = "Historical CRV reward APR of Curve pools, sampled once per UTC day")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[arg(long, global = true, default_value = "data/cache.sqlite")]
    cache_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the daily APR history of one or more pools to CSV.
    History(HistoryArgs),
    /// List the first block after each UTC midnight.
    Blocks(BlocksArgs),
    /// Search the Curve pool registry.
    Pools(PoolsArgs),
    /// Show cache and configuration status.
    Status,
}

#[derive(Args, Debug, Clone, Copy)]
struct SamplingArgs {
    /// Assumed seconds between blocks when estimating jumps.
    #[arg(long, default_value_t = 15.0)]
    block_time: f64,

    /// Fraction of the estimated jump actually taken.
    #[arg(long, default_value_t = 0.95)]
    safety_factor: f64,
}

impl SamplingArgs {
    fn config(self) -> Result<SamplerConfig> {
        let config = SamplerConfig {
            block_time_secs: self.block_time,
            safety_factor: self.safety_factor,
        };
        config
            .validate()
            .wrap_err("invalid --block-time or --safety-factor")?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone, Copy)]
struct RetryArgs {
    /// Delay before the first retry, in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    retry_initial_ms: u64,

    /// Attempts per remote call before giving up.
    #[arg(long, default_value_t = 6)]
    max_attempts: u32,
}

impl RetryArgs {
    fn backoff(self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.retry_initial_ms),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, Default)]
enum BoostArg {
    #[default]
    Min,
    Max,
}

impl From<BoostArg> for Boost {
    fn from(value: BoostArg) -> Self {
        match value {
            BoostArg::Min => Boost::Min,
            BoostArg::Max => Boost::Max,
        }
    }
}

#[derive(Args, Debug)]
struct HistoryArgs {
    /// Pool address, factory name (`<name>` for `<name>-f`), symbol or name.
    #[arg(long = "pool", required = true)]
    pools: Vec<String>,

    /// First block to sample from. Defaults to the earliest gauge deployment.
    #[arg(long)]
    start_block: Option<u64>,

    /// Stop before this block. Defaults to the chain tip.
    #[arg(long)]
    end_block: Option<u64>,

    /// Output CSV path. Defaults to `<pool>-crv-apy-history.csv`.
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = BoostArg::Min)]
    boost: BoostArg,

    #[command(flatten)]
    sampling: SamplingArgs,

    #[command(flatten)]
    retry: RetryArgs,
}

#[derive(Args, Debug)]
struct BlocksArgs {
    #[arg(long)]
    start_block: u64,

    #[arg(long)]
    end_block: Option<u64>,

    /// Output format: table (default) or json.
    #[arg(long, default_value = "table")]
    output: String,

    #[command(flatten)]
    sampling: SamplingArgs,

    #[command(flatten)]
    retry: RetryArgs,
}

#[derive(Args, Debug)]
struct PoolsArgs {
    /// Case-insensitive substring of the symbol, name or address.
    #[arg(long)]
    filter: Option<String>,

    /// Only list pools with a gauge.
    #[arg(long)]
    with_gauge: bool,

    #[arg(long, default_value_t = 25)]
    limit: usize,

    #[command(flatten)]
    retry: RetryArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    let ctx = AppContext {
        cache_path: cli.cache_path,
        rpc_url: std::env::var("CRV_RPC_URL").ok(),
        coingecko_url: std::env::var("COINGECKO_API_URL")
            .unwrap_or_else(|_| prices::DEFAULT_BASE_URL.to_string()),
        coingecko_api_key: std::env::var("COINGECKO_API_KEY").ok(),
        curve_api_url: std::env::var("CURVE_API_URL")
            .unwrap_or_else(|_| registry::DEFAULT_BASE_URL.to_string()),
    };

    match cli.command {
        Commands::History(args) => handle_history(&ctx, args).await,
        Commands::Blocks(args) => handle_blocks(&ctx, args).await,
        Commands::Pools(args) => handle_pools(&ctx, args).await,
        Commands::Status => handle_status(&ctx),
    }
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::WARN
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .wrap_err("failed to initialize tracing filter")?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

async fn connect(ctx: &AppContext, backoff: Backoff) -> Result<ChainReader<HttpProvider>> {
    let rpc_url = ctx
        .rpc_url
        .as_deref()
        .ok_or_else(|| eyre!("CRV_RPC_URL must point at an archive node"))?;
    ChainReader::connect(rpc_url, backoff).await
}

fn open_cache(ctx: &AppContext) -> Result<Memo<SqliteStore>> {
    if let Some(parent) = ctx.cache_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }
    let store = SqliteStore::open(&ctx.cache_path).wrap_err("failed to open cache store")?;
    Ok(Memo::new(store))
}

async fn handle_history(ctx: &AppContext, args: HistoryArgs) -> Result<()> {
    let config = args.sampling.config()?;
    let backoff = args.retry.backoff();
    let memo = open_cache(ctx)?;

    let registry = PoolRegistry::fetch(&ctx.curve_api_url, &backoff).await?;
    let price_client = PriceClient::new(&ctx.coingecko_url, ctx.coingecko_api_key.clone(), backoff)?;

    let mut pools = Vec::with_capacity(args.pools.len());
    for query in &args.pools {
        let info = registry.resolve(query)?.clone();
        let pricing = PoolPricing::resolve(&info, &price_client, &memo).await?;
        let pool = TrackedPool::new(info, pricing)?;
        info!(
            pool = %pool.label(),
            address = %format!("{:#x}", pool.info.address),
            gauge = %format!("{:#x}", pool.gauge),
            "tracking pool"
        );
        pools.push(pool);
    }

    let chain = connect(ctx, backoff).await?;
    let start_block = match args.start_block {
        Some(block) => block,
        None => earliest_deployment(&chain, &memo, &pools).await?,
    };

    let mut sampler = MidnightSampler::new(&chain, start_block, args.end_block, config).await?;
    let end_block = sampler.end();
    if start_block >= end_block {
        return Err(eyre!(
            "invalid range: start block {start_block} is not below end block {end_block}"
        ));
    }

    let from = chain.timestamp_of(start_block).await? as i64;
    let to = chain.timestamp_of(end_block.saturating_sub(1)).await? as i64;
    let price_table = price_client
        .fetch_history(&required_price_ids(&pools), from, to + SECONDS_PER_DAY)
        .await?;

    let labels: Vec<String> = pools.iter().map(TrackedPool::label).collect();
    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(format!("{}-crv-apy-history.csv", labels.join("_"))));
    let report = CsvReport::create(&output, &labels)?;

    let pb = ProgressBar::new(((to - from) / SECONDS_PER_DAY).max(1) as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} days {msg}")
            .wrap_err("failed to create progress style")?,
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    let contracts = CurveContracts::default();
    let source = OnChainAprSource::new(&chain, &memo, contracts, &price_table, args.boost.into());
    let mut sink = ProgressSink {
        inner: report,
        bar: &pb,
    };

    let summary = run_history(&mut sampler, &pools, &source, &mut sink).await;
    pb.finish_and_clear();
    let summary = summary?;

    print_summary(&labels, &summary, &output);
    info!(
        start_block,
        end_block,
        days = summary.days,
        output = %output.display(),
        "history command finished"
    );
    Ok(())
}

async fn earliest_deployment<P: Provider, S: KvStore>(
    chain: &ChainReader<P>,
    memo: &Memo<S>,
    pools: &[TrackedPool],
) -> Result<u64> {
    let mut earliest: Option<u64> = None;
    for pool in pools {
        let block = deployment_block(chain, memo, pool.gauge).await?;
        earliest = Some(earliest.map_or(block, |e| e.min(block)));
    }
    earliest.ok_or_else(|| eyre!("no pools to find a start block for"))
}

async fn deployment_block<P: Provider, S: KvStore>(
    chain: &ChainReader<P>,
    memo: &Memo<S>,
    address: Address,
) -> Result<u64> {
    let key = CallKey::new("apr_data::chain", "deployment_block")
        .receiver("ChainReader")
        .arg(format!("{address:#x}"));
    memo.get_or_compute(&key, || chain.deployment_block(address))
        .await
        .wrap_err_with(|| format!("failed to find deployment block of {address:#x}"))
}

/// Forwards rows and advances the progress bar.
struct ProgressSink<'a, K> {
    inner: K,
    bar: &'a ProgressBar,
}

impl<K: RowSink> RowSink for ProgressSink<'_, K> {
    fn write_row(&mut self, row: &HistoryRow) -> Result<()> {
        self.inner.write_row(row)?;
        self.bar.set_message(row.date.to_string());
        self.bar.inc(1);
        Ok(())
    }
}

fn print_summary(labels: &[String], summary: &HistorySummary, output: &Path) {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Pool", "Days", "No data", "Latest APR"]);

    for (idx, label) in labels.iter().enumerate() {
        let latest = summary.latest[idx]
            .map(|apr| format!("{apr:.2}%"))
            .unwrap_or_else(|| "N/A".to_string());
        table.add_row(vec![
            label.clone(),
            summary.days.to_string(),
            summary.no_data[idx].to_string(),
            latest,
        ]);
    }

    let range = summary
        .range
        .map(|(first, last)| format!("{first} to {last}"))
        .unwrap_or_else(|| "no days sampled".to_string());
    println!("\n{table}\n{range}, written to {}\n", output.display());
}

async fn handle_blocks(ctx: &AppContext, args: BlocksArgs) -> Result<()> {
    let config = args.sampling.config()?;
    let chain = connect(ctx, args.retry.backoff()).await?;
    let mut sampler = MidnightSampler::new(&chain, args.start_block, args.end_block, config).await?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .wrap_err("failed to create progress style")?,
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    let mut points = Vec::new();
    while let Some(point) = sampler.next_block().await? {
        pb.set_message(format!("{} at block {}", point.date(), point.block));
        points.push(point);
    }
    pb.finish_and_clear();

    match args.output.to_lowercase().as_str() {
        "table" => {
            let mut table = Table::new();
            table.load_preset(UTF8_BORDERS_ONLY);
            table.set_header(vec!["Date", "Block", "Timestamp", "Past midnight"]);
            for point in &points {
                table.add_row(vec![
                    point.date().to_string(),
                    point.block.to_string(),
                    point.timestamp.to_string(),
                    format!("{}s", point.timestamp as i64 - point.boundary),
                ]);
            }
            println!("\n{table}\n");
        }
        "json" => {
            let json_str =
                serde_json::to_string_pretty(&points).wrap_err("failed to serialize JSON")?;
            println!("{json_str}");
        }
        _ => {
            return Err(eyre!(
                "unknown output format '{}'; use 'table' or 'json'",
                args.output
            ))
        }
    }

    info!(
        start_block = args.start_block,
        end_block = sampler.end(),
        days = points.len(),
        "blocks command finished"
    );
    Ok(())
}

async fn handle_pools(ctx: &AppContext, args: PoolsArgs) -> Result<()> {
    let registry = PoolRegistry::fetch(&ctx.curve_api_url, &args.retry.backoff()).await?;
    let filter = args.filter.as_deref().map(str::to_lowercase);

    let matches: Vec<_> = registry
        .iter()
        .filter(|pool| !args.with_gauge || pool.gauge.is_some())
        .filter(|pool| match &filter {
            Some(needle) => {
                pool.symbol.to_lowercase().contains(needle)
                    || pool.name.to_lowercase().contains(needle)
                    || format!("{:#x}", pool.address).contains(needle)
            }
            None => true,
        })
        .collect();

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Symbol", "Name", "Registry", "Asset", "Address", "Gauge"]);
    for pool in matches.iter().take(args.limit) {
        table.add_row(vec![
            pool.symbol.clone(),
            pool.name.clone(),
            pool.registry.clone(),
            pool.asset_type.as_str().to_string(),
            format!("{:#x}", pool.address),
            pool.gauge
                .map(|g| format!("{g:#x}"))
                .unwrap_or_else(|| "none".to_string()),
        ]);
    }
    println!("\n{table}\n");

    info!(
        total = registry.len(),
        matched = matches.len(),
        shown = matches.len().min(args.limit),
        "pools command finished"
    );
    Ok(())
}

fn handle_status(ctx: &AppContext) -> Result<()> {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "Value"]);

    table.add_row(vec!["Cache Path".to_string(), ctx.cache_path.display().to_string()]);
    if ctx.cache_path.exists() {
        let store = SqliteStore::open(&ctx.cache_path).wrap_err("failed to open cache store")?;
        let size = std::fs::metadata(&ctx.cache_path)
            .map(|m| format!("{} KB", m.len() / 1_000))
            .unwrap_or_else(|_| "N/A".to_string());
        table.add_row(vec!["Cache Size".to_string(), size]);
        table.add_row(vec!["Cached Results".to_string(), store.len()?.to_string()]);
    } else {
        table.add_row(vec!["Cache Size".to_string(), "N/A (file not found)".to_string()]);
    }

    let configured = |set: bool| (if set { "set" } else { "not set" }).to_string();
    table.add_row(vec!["CRV_RPC_URL".to_string(), configured(ctx.rpc_url.is_some())]);
    table.add_row(vec!["CoinGecko API".to_string(), ctx.coingecko_url.clone()]);
    table.add_row(vec![
        "COINGECKO_API_KEY".to_string(),
        configured(ctx.coingecko_api_key.is_some()),
    ]);
    table.add_row(vec!["Curve API".to_string(), ctx.curve_api_url.clone()]);

    println!("\n{table}\n");
    Ok(())
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .wrap_err_with(|| format!("failed to create data directory {}", path.display()))?;
    Ok(())
}
