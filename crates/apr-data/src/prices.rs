//! # CoinGecko Price Index Client
//!
//! Resolves ERC-20 contract addresses to CoinGecko token ids and downloads
//! USD price history for those ids. History is bucketed into one price per
//! UTC day: the first quote CoinGecko returns for that day.
//!
//! Requests go through [`retry_transient`], so rate limiting (HTTP 429) and
//! server errors back off exponentially until the attempts run out.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use alloy::primitives::{address, Address};
use chrono::NaiveDate;
use eyre::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::is_fatal;
use crate::memo::{CallKey, Memo};
use crate::retry::{retry_transient, Backoff};
use crate::store::KvStore;
use crate::types::utc_date;

/// Public CoinGecko API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";

/// CoinGecko id of ether.
pub const ETHEREUM_ID: &str = "ethereum";
/// CoinGecko id of bitcoin.
pub const BITCOIN_ID: &str = "bitcoin";
/// CoinGecko id of the CRV token.
pub const CRV_ID: &str = "curve-dao-token";

/// Placeholder address Curve pools use for native ether.
pub const NATIVE_ETH: Address = address!("EeeeeEeeeEeEeeEeEeEeeEEEeeeeEeeeeeeeEEeE");

const API_KEY_HEADER: &str = "x-cg-demo-api-key";

/// Raw `market_chart/range` payload. Only prices are used.
#[derive(Debug, Deserialize)]
struct MarketChart {
    prices: Vec<(f64, f64)>,
}

#[derive(Debug, Deserialize)]
struct CoinInfoResponse {
    id: String,
}

/// USD quotes for one token, as `(unix millis, price)` pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceSeries {
    quotes: Vec<(i64, f64)>,
}

impl PriceSeries {
    /// Builds a series from raw quotes in any order.
    pub fn new(mut quotes: Vec<(i64, f64)>) -> Self {
        quotes.sort_by_key(|(ts, _)| *ts);
        Self { quotes }
    }

    /// Parses a `market_chart/range` response body.
    ///
    /// # Errors
    /// Returns error if the body is not a market chart payload.
    pub fn from_json(body: &str) -> Result<Self> {
        let chart: MarketChart =
            serde_json::from_str(body).wrap_err("failed to parse CoinGecko market chart JSON")?;
        Ok(Self::new(
            chart
                .prices
                .into_iter()
                .map(|(ts, price)| (ts as i64, price))
                .collect(),
        ))
    }

    /// Number of quotes.
    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    /// True when the series holds no quotes.
    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    /// First quote of every UTC day.
    pub fn daily(&self) -> BTreeMap<NaiveDate, f64> {
        let mut days = BTreeMap::new();
        for &(ts_ms, price) in &self.quotes {
            let date = utc_date(ts_ms.max(0) as u64 / 1000);
            days.entry(date).or_insert(price);
        }
        days
    }
}

/// Daily USD prices keyed by CoinGecko id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceTable {
    prices: HashMap<String, BTreeMap<NaiveDate, f64>>,
}

impl PriceTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the daily buckets of `series` under `id`.
    pub fn insert(&mut self, id: impl Into<String>, series: &PriceSeries) {
        self.prices.entry(id.into()).or_default().extend(series.daily());
    }

    /// Sets a single daily price.
    pub fn set(&mut self, id: impl Into<String>, date: NaiveDate, price: f64) {
        self.prices.entry(id.into()).or_default().insert(date, price);
    }

    /// USD price of `id` on `date`, if known.
    pub fn price_on(&self, id: &str, date: NaiveDate) -> Option<f64> {
        self.prices.get(id)?.get(&date).copied()
    }

    /// True when any price is known for `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.prices.contains_key(id)
    }

    /// Number of ids with prices.
    pub fn len(&self) -> usize {
        self.prices.len()
    }

    /// True when the table has no ids.
    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

/// HTTP client for the CoinGecko REST API.
#[derive(Debug, Clone)]
pub struct PriceClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    backoff: Backoff,
}

impl PriceClient {
    /// Creates a client against `base_url`, sending `api_key` as the demo key
    /// header when present.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(base_url: &str, api_key: Option<String>, backoff: Backoff) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .wrap_err("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            backoff,
        })
    }

    /// GETs `path` and returns the body, or `None` on HTTP 404.
    async fn get_body(&self, path: &str, query: &[(&str, String)]) -> Result<Option<String>> {
        let url = format!("{}{}", self.base_url, path);
        retry_transient(&self.backoff, path, || async {
            let mut request = self.http.get(&url).query(query);
            if let Some(key) = &self.api_key {
                request = request.header(API_KEY_HEADER, key);
            }

            let response = request
                .send()
                .await
                .wrap_err("CoinGecko HTTP request failed")?;

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }

            let body = response
                .error_for_status()
                .wrap_err_with(|| format!("CoinGecko returned an error for {path}"))?
                .text()
                .await
                .wrap_err("failed to read CoinGecko response body")?;
            Ok::<_, eyre::Report>(Some(body))
        })
        .await
    }

    /// CoinGecko id of the ERC-20 at `address`.
    ///
    /// Native ether maps to [`ETHEREUM_ID`] and the zero address to `None`
    /// without a request. Unknown contracts (HTTP 404) are `None`.
    ///
    /// # Errors
    /// Returns error on non-404 HTTP failures or malformed responses.
    #[tracing::instrument(skip(self), fields(address = %format!("{address:#x}")))]
    pub async fn token_id(&self, address: Address) -> Result<Option<String>> {
        if address == NATIVE_ETH {
            return Ok(Some(ETHEREUM_ID.to_string()));
        }
        if address == Address::ZERO {
            return Ok(None);
        }

        let path = format!("/coins/ethereum/contract/{address:#x}");
        let Some(body) = self.get_body(&path, &[]).await? else {
            warn!("no CoinGecko id for contract");
            return Ok(None);
        };

        let info: CoinInfoResponse =
            serde_json::from_str(&body).wrap_err("failed to parse CoinGecko coin info JSON")?;
        info!(token_id = %info.id, "fetched CoinGecko id");
        Ok(Some(info.id))
    }

    /// [`PriceClient::token_id`] memoized in `memo`.
    ///
    /// Lookup errors other than fatal ones (a 4xx answer besides 404, an
    /// unparseable body) are logged and read as `None`. They are not cached,
    /// so a later run asks again.
    ///
    /// # Errors
    /// Returns fatal errors: cache failures and exhausted retries.
    pub async fn cached_token_id<S: KvStore>(
        &self,
        memo: &Memo<S>,
        address: Address,
    ) -> Result<Option<String>> {
        let key = CallKey::new(module_path!(), "token_id")
            .receiver("PriceClient")
            .arg(format!("{address:#x}"));
        match memo.get_or_compute(&key, || self.token_id(address)).await {
            Ok(id) => Ok(id),
            Err(e) if is_fatal(&e) => Err(e),
            Err(e) => {
                warn!(address = %format!("{address:#x}"), error = %e, "CoinGecko id lookup failed");
                Ok(None)
            }
        }
    }

    /// USD quotes for `id` between two unix timestamps (seconds).
    ///
    /// # Errors
    /// Returns error if the request fails or the id is unknown.
    #[tracing::instrument(skip(self))]
    pub async fn market_chart(&self, id: &str, from: i64, to: i64) -> Result<PriceSeries> {
        let path = format!("/coins/{id}/market_chart/range");
        let query = [
            ("vs_currency", "usd".to_string()),
            ("from", from.to_string()),
            ("to", to.to_string()),
        ];

        let body = self
            .get_body(&path, &query)
            .await?
            .ok_or_else(|| eyre::eyre!("CoinGecko has no market chart for {id}"))?;
        let series = PriceSeries::from_json(&body)?;
        debug!(quotes = series.len(), "fetched market chart");
        Ok(series)
    }

    /// Daily prices for every id in `ids` between `from` and `to` (unix
    /// seconds).
    ///
    /// Ids that fail with a non-fatal error, or have no quotes, are logged
    /// and left out of the table.
    ///
    /// # Errors
    /// Returns the first fatal error (retries exhausted).
    pub async fn fetch_history(&self, ids: &[String], from: i64, to: i64) -> Result<PriceTable> {
        info!(
            ids = ids.len(),
            from = %utc_date(from.max(0) as u64),
            to = %utc_date(to.max(0) as u64),
            "fetching price history from CoinGecko"
        );

        let mut table = PriceTable::new();
        for id in ids {
            match self.market_chart(id, from, to).await {
                Ok(series) if series.is_empty() => {
                    warn!(token_id = %id, "no price quotes returned");
                }
                Ok(series) => {
                    table.insert(id.clone(), &series);
                    debug!(token_id = %id, "fetched price history");
                }
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    warn!(token_id = %id, error = %e, "error fetching price data");
                }
            }
        }

        info!(priced = table.len(), "finished fetching prices");
        Ok(table)
    }
}
