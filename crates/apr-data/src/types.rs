//! Type definitions shared across the APR workspace.

use alloy::primitives::Address;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Seconds in one UTC day.
pub const SECONDS_PER_DAY: i64 = 86_400;

/// A block selected by the midnight sampler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplePoint {
    /// Block number.
    pub block: u64,
    /// Block timestamp in unix seconds.
    pub timestamp: u64,
    /// The UTC midnight (unix seconds) this block is the first to pass.
    pub boundary: i64,
}

impl SamplePoint {
    /// UTC date the block was mined on.
    pub fn date(&self) -> NaiveDate {
        utc_date(self.timestamp)
    }
}

/// UTC calendar date of a unix timestamp.
pub fn utc_date(timestamp: u64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp(timestamp as i64, 0)
        .unwrap_or_default()
        .date_naive()
}

/// The first UTC midnight strictly after `timestamp`.
pub fn next_midnight(timestamp: u64) -> i64 {
    let ts = timestamp as i64;
    ts.div_euclid(SECONDS_PER_DAY) * SECONDS_PER_DAY + SECONDS_PER_DAY
}

/// Asset class tag reported by the Curve API (`assetTypeName`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetType {
    /// USD stablecoin pool, priced at 1.
    Usd,
    /// ETH-denominated pool.
    Eth,
    /// BTC-denominated pool.
    Btc,
    /// Anything else; priced from its coins.
    Other,
}

impl AssetType {
    /// Parses the registry tag. Unknown tags fall back to [`AssetType::Other`].
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "usd" => Self::Usd,
            "eth" => Self::Eth,
            "btc" => Self::Btc,
            _ => Self::Other,
        }
    }

    /// Registry tag for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usd => "usd",
            Self::Eth => "eth",
            Self::Btc => "btc",
            Self::Other => "other",
        }
    }
}

/// One coin held by a pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoinInfo {
    /// Token contract address.
    pub address: Address,
    /// Token symbol.
    pub symbol: String,
    /// ERC-20 decimals.
    pub decimals: u8,
}

/// Pool metadata from the Curve registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolInfo {
    /// Pool contract address.
    pub address: Address,
    /// Pool name.
    pub name: String,
    /// LP token symbol.
    pub symbol: String,
    /// Registry the pool was listed in (`main`, `crypto`, `factory`, ...).
    pub registry: String,
    /// Liquidity gauge receiving CRV emissions, if any.
    pub gauge: Option<Address>,
    /// Coins in pool order.
    pub coins: Vec<CoinInfo>,
    /// Asset class tag.
    pub asset_type: AssetType,
}

impl PoolInfo {
    /// Short label used for report columns.
    pub fn label(&self) -> String {
        if self.symbol.is_empty() {
            format!("{:#x}", self.address)
        } else {
            self.symbol.clone()
        }
    }
}

/// Raw on-chain state needed for one pool-day APR.
///
/// Scaled fields are divided by 1e18. Balances are raw token units in pool
/// coin order and only present for pools priced from their coins.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GaugeReading {
    /// CRV emitted per second.
    pub inflation_rate: f64,
    /// Share of emissions directed to the gauge.
    pub relative_weight: f64,
    /// Boost-adjusted LP supply staked in the gauge.
    pub working_supply: f64,
    /// Pool virtual price.
    pub virtual_price: f64,
    /// Raw coin balances.
    pub balances: Vec<f64>,
}
