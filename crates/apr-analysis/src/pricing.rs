//! USD price of one unit of a pool's underlying asset.
//!
//! The pricing rule is picked once per pool from its registry asset tag:
//! stablecoin pools are worth one dollar, ETH and BTC pools follow the
//! ether or bitcoin price, and everything else is a liquidity-weighted
//! average of its coins' prices.

use alloy::primitives::Address;
use apr_data::memo::Memo;
use apr_data::prices::{PriceClient, PriceTable, BITCOIN_ID, CRV_ID, ETHEREUM_ID};
use apr_data::store::KvStore;
use apr_data::{AssetType, PoolInfo};
use chrono::NaiveDate;
use eyre::{eyre, Result};
use tracing::debug;

use crate::apr::AprError;

/// One coin of a basket-priced pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasketCoin {
    /// Token contract address.
    pub address: Address,
    /// ERC-20 decimals used to normalize raw balances.
    pub decimals: u8,
    /// CoinGecko id, when the token is listed.
    pub price_id: Option<String>,
}

/// How a pool's asset price is derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolPricing {
    Usd,
    Eth,
    Btc,
    /// Coins in pool order.
    Basket(Vec<BasketCoin>),
}

impl PoolPricing {
    /// Picks the pricing rule for `pool`, looking up CoinGecko ids for the
    /// coins of basket-priced pools through `memo`.
    ///
    /// # Errors
    /// Propagates id lookup and cache failures.
    pub async fn resolve<S: KvStore>(
        pool: &PoolInfo,
        client: &PriceClient,
        memo: &Memo<S>,
    ) -> Result<Self> {
        let pricing = match pool.asset_type {
            AssetType::Usd => Self::Usd,
            AssetType::Eth => Self::Eth,
            AssetType::Btc => Self::Btc,
            AssetType::Other => {
                let mut coins = Vec::with_capacity(pool.coins.len());
                for coin in &pool.coins {
                    let price_id = client.cached_token_id(memo, coin.address).await?;
                    coins.push(BasketCoin {
                        address: coin.address,
                        decimals: coin.decimals,
                        price_id,
                    });
                }
                Self::Basket(coins)
            }
        };
        debug!(pool = %pool.label(), pricing = ?pricing, "resolved pool pricing");
        Ok(pricing)
    }

    /// Number of coin balances [`PoolPricing::asset_price`] needs.
    pub fn balances_needed(&self) -> usize {
        match self {
            Self::Basket(coins) => coins.len(),
            _ => 0,
        }
    }

    /// CoinGecko ids whose history must be downloaded for this pool.
    pub fn price_ids(&self) -> Vec<&str> {
        match self {
            Self::Usd => Vec::new(),
            Self::Eth => vec![ETHEREUM_ID],
            Self::Btc => vec![BITCOIN_ID],
            Self::Basket(coins) => coins.iter().filter_map(|c| c.price_id.as_deref()).collect(),
        }
    }

    /// Asset price on `date`. `balances` are raw coin balances in pool
    /// order and only used by basket pools.
    ///
    /// # Errors
    /// Returns [`AprError::MissingPrice`] when the ETH or BTC price is
    /// unknown for the day and [`AprError::EmptyLiquidity`] when a basket
    /// holds nothing.
    pub fn asset_price(
        &self,
        prices: &PriceTable,
        date: NaiveDate,
        balances: &[f64],
    ) -> Result<f64, AprError> {
        match self {
            Self::Usd => Ok(1.0),
            Self::Eth => price_of(prices, ETHEREUM_ID, date),
            Self::Btc => price_of(prices, BITCOIN_ID, date),
            Self::Basket(coins) => {
                let mut total = 0.0;
                let mut weighted = 0.0;
                for (coin, raw) in coins.iter().zip(balances) {
                    let balance = raw / 10f64.powi(i32::from(coin.decimals));
                    // unlisted or unpriced coins count as worthless
                    let price = coin
                        .price_id
                        .as_deref()
                        .and_then(|id| prices.price_on(id, date))
                        .unwrap_or(0.0);
                    total += balance;
                    weighted += balance * price;
                }
                if total == 0.0 {
                    return Err(AprError::EmptyLiquidity);
                }
                Ok(weighted / total)
            }
        }
    }
}

/// Price of `id` on `date`.
///
/// # Errors
/// Returns [`AprError::MissingPrice`] when the table has no quote.
pub fn price_of(prices: &PriceTable, id: &str, date: NaiveDate) -> Result<f64, AprError> {
    prices.price_on(id, date).ok_or_else(|| AprError::MissingPrice {
        id: id.to_string(),
        date,
    })
}

/// CRV price on `date`.
///
/// # Errors
/// See [`price_of`].
pub fn crv_price(prices: &PriceTable, date: NaiveDate) -> Result<f64, AprError> {
    price_of(prices, CRV_ID, date)
}

/// A pool selected for the history run.
#[derive(Debug, Clone)]
pub struct TrackedPool {
    /// Registry metadata.
    pub info: PoolInfo,
    /// Gauge whose emissions are measured.
    pub gauge: Address,
    /// Asset pricing rule.
    pub pricing: PoolPricing,
}

impl TrackedPool {
    /// Pairs `info` with its gauge and pricing.
    ///
    /// # Errors
    /// Returns error if the registry lists no gauge for the pool.
    pub fn new(info: PoolInfo, pricing: PoolPricing) -> Result<Self> {
        let gauge = info
            .gauge
            .ok_or_else(|| eyre!("pool {} has no gauge", info.label()))?;
        Ok(Self {
            info,
            gauge,
            pricing,
        })
    }

    /// Column label.
    pub fn label(&self) -> String {
        self.info.label()
    }
}

/// Distinct CoinGecko ids needed to price `pools`, CRV included.
pub fn required_price_ids(pools: &[TrackedPool]) -> Vec<String> {
    let mut ids = vec![CRV_ID.to_string()];
    for pool in pools {
        for id in pool.pricing.price_ids() {
            if !ids.iter().any(|known| known == id) {
                ids.push(id.to_string());
            }
        }
    }
    ids
}
