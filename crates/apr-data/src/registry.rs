//! Curve pool metadata from the Curve REST API (`getPools`).
//!
//! The registry is downloaded once per run and passed to whoever needs pool
//! metadata. Pools listed in more than one registry keep the entry from the
//! registry fetched last.

use std::collections::HashMap;
use std::time::Duration;

use alloy::primitives::Address;
use eyre::{eyre, Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::is_fatal;
use crate::retry::{retry_transient, Backoff};
use crate::types::{AssetType, CoinInfo, PoolInfo};

/// Public Curve API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.curve.fi/api";

/// Ethereum registries listed by the Curve API, in fetch order.
pub const REGISTRIES: [&str; 4] = ["main", "crypto", "factory", "crypto-factory"];

#[derive(Debug, Deserialize)]
struct GetPoolsResponse {
    success: bool,
    #[serde(default)]
    data: Option<GetPoolsData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetPoolsData {
    #[serde(default)]
    pool_data: Vec<RawPool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPool {
    address: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    asset_type_name: Option<String>,
    #[serde(default)]
    gauge_address: Option<String>,
    #[serde(default)]
    coins: Vec<RawCoin>,
}

#[derive(Debug, Deserialize)]
struct RawCoin {
    address: String,
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    decimals: serde_json::Value,
}

/// Decimals arrive as `"18"` or `18` depending on the registry.
fn parse_decimals(value: &serde_json::Value) -> Option<u8> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|d| u8::try_from(d).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_address(raw: &str) -> Result<Address> {
    raw.parse()
        .wrap_err_with(|| format!("invalid address {raw:?} in Curve API response"))
}

impl RawPool {
    fn into_pool(self, registry: &str) -> Result<PoolInfo> {
        let address = parse_address(&self.address)?;
        let gauge = match self.gauge_address.as_deref() {
            Some(raw) if !raw.is_empty() => Some(parse_address(raw)?).filter(|g| !g.is_zero()),
            _ => None,
        };
        let coins = self
            .coins
            .into_iter()
            .map(|coin| {
                Ok(CoinInfo {
                    address: parse_address(&coin.address)?,
                    decimals: parse_decimals(&coin.decimals).unwrap_or(18),
                    symbol: coin.symbol,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(PoolInfo {
            address,
            name: self.name,
            symbol: self.symbol,
            registry: registry.to_string(),
            gauge,
            coins,
            asset_type: AssetType::from_tag(self.asset_type_name.as_deref().unwrap_or("unknown")),
        })
    }
}

/// Parses one `getPools/ethereum/{registry}` response body.
///
/// An unsuccessful response yields no pools. Malformed pool entries are
/// skipped with a warning.
///
/// # Errors
/// Returns error if the body is not JSON of the expected shape.
pub fn parse_pools(body: &str, registry: &str) -> Result<Vec<PoolInfo>> {
    let response: GetPoolsResponse =
        serde_json::from_str(body).wrap_err("failed to parse Curve getPools JSON")?;

    if !response.success {
        warn!(registry, "Curve API reported failure");
        return Ok(Vec::new());
    }

    let raw = response.data.map(|d| d.pool_data).unwrap_or_default();
    let mut pools = Vec::with_capacity(raw.len());
    for entry in raw {
        let raw_address = entry.address.clone();
        match entry.into_pool(registry) {
            Ok(pool) => pools.push(pool),
            Err(e) => warn!(registry, pool = %raw_address, error = %e, "skipping malformed pool"),
        }
    }
    Ok(pools)
}

/// In-memory index of Curve pools.
#[derive(Debug, Clone, Default)]
pub struct PoolRegistry {
    pools: Vec<PoolInfo>,
    by_address: HashMap<Address, usize>,
}

impl PoolRegistry {
    /// Downloads every registry in [`REGISTRIES`].
    ///
    /// A registry whose request fails with a non-fatal error, or that
    /// returns a non-success response, contributes no pools.
    ///
    /// # Errors
    /// Returns a fatal error if retries are exhausted.
    #[tracing::instrument(skip(backoff))]
    pub async fn fetch(base_url: &str, backoff: &Backoff) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .wrap_err("failed to build HTTP client")?;
        let base_url = base_url.trim_end_matches('/');

        let mut registry = Self::default();
        for name in REGISTRIES {
            let url = format!("{base_url}/getPools/ethereum/{name}");
            let fetched = retry_transient(backoff, "curve getPools", || async {
                let body = http
                    .get(&url)
                    .send()
                    .await
                    .wrap_err("Curve API HTTP request failed")?
                    .error_for_status()
                    .wrap_err_with(|| format!("Curve API returned an error for {name}"))?
                    .text()
                    .await
                    .wrap_err("failed to read Curve API response body")?;
                Ok::<_, eyre::Report>(body)
            })
            .await
            .and_then(|body| parse_pools(&body, name));

            match fetched {
                Ok(pools) => {
                    debug!(registry = name, pools = pools.len(), "fetched registry");
                    registry.extend(pools);
                }
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => warn!(registry = name, error = %e, "failed to fetch registry"),
            }
        }

        info!(pools = registry.len(), "loaded Curve pool registry");
        Ok(registry)
    }

    /// Builds a registry from already-parsed pools.
    pub fn from_pools(pools: impl IntoIterator<Item = PoolInfo>) -> Self {
        let mut registry = Self::default();
        registry.extend(pools);
        registry
    }

    fn extend(&mut self, pools: impl IntoIterator<Item = PoolInfo>) {
        for pool in pools {
            match self.by_address.get(&pool.address) {
                Some(&idx) => self.pools[idx] = pool,
                None => {
                    self.by_address.insert(pool.address, self.pools.len());
                    self.pools.push(pool);
                }
            }
        }
    }

    /// Pool at `address`.
    pub fn get(&self, address: Address) -> Option<&PoolInfo> {
        self.by_address.get(&address).map(|&idx| &self.pools[idx])
    }

    /// Looks a pool up by address, by factory symbol (`<name>-f`), or by
    /// exact symbol or name. Text matches ignore case.
    pub fn find(&self, query: &str) -> Option<&PoolInfo> {
        let query = query.trim();
        if let Ok(address) = query.parse::<Address>() {
            return self.get(address);
        }

        let factory_symbol = format!("{query}-f");
        self.pools
            .iter()
            .find(|p| p.symbol.eq_ignore_ascii_case(&factory_symbol))
            .or_else(|| self.pools.iter().find(|p| p.symbol.eq_ignore_ascii_case(query)))
            .or_else(|| self.pools.iter().find(|p| p.name.eq_ignore_ascii_case(query)))
    }

    /// Like [`PoolRegistry::find`] but failing for unknown pools.
    ///
    /// # Errors
    /// Returns error if no pool matches `query`.
    pub fn resolve(&self, query: &str) -> Result<&PoolInfo> {
        self.find(query)
            .ok_or_else(|| eyre!("pool {query:?} not found in the Curve registry"))
    }

    /// All pools in registry order.
    pub fn iter(&self) -> impl Iterator<Item = &PoolInfo> {
        self.pools.iter()
    }

    /// Number of pools.
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// True when no pools are loaded.
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FACTORY_BODY: &str = r#"{
        "success": true,
        "data": {
            "poolData": [
                {
                    "id": "factory-v2-0",
                    "address": "0xEd279fDD11cA84bEef15AF5D39BB4d4bEE23F0cA",
                    "name": "Curve.fi Factory USD Metapool: Liquity",
                    "symbol": "LUSD3CRV-f",
                    "assetTypeName": "usd",
                    "gaugeAddress": "0x9B8519A9a00100720CCdC8a120fBeD319cA47a14",
                    "coins": [
                        {"address": "0x5f98805A4E8be255a32880FDeC7F6728C6568bA0", "symbol": "LUSD", "decimals": "18"},
                        {"address": "0x6c3F90f043a72FA612cbac8115EE7e52BDe6E490", "symbol": "3Crv", "decimals": 18}
                    ]
                },
                {
                    "address": "0x1005F7406f32a61BD760CfA14aCCd2737913d546",
                    "name": "Curve.fi Factory Plain Pool: tbtc",
                    "symbol": "tbtc-f",
                    "assetTypeName": "btc",
                    "coins": [
                        {"address": "0x18084fbA666a33d37592fA2633fD49a74DD93a88", "symbol": "tBTC", "decimals": "18"}
                    ]
                },
                {
                    "address": "not-an-address",
                    "coins": []
                }
            ]
        }
    }"#;

    const CRYPTO_BODY: &str = r#"{
        "success": true,
        "data": {
            "poolData": [
                {
                    "address": "0xD51a44d3FaE010294C616388b506AcdA1bfAAE46",
                    "name": "Curve.fi USD-BTC-ETH",
                    "symbol": "crv3crypto",
                    "assetTypeName": "unknown",
                    "gaugeAddress": "0xDeFd8FdD20e0f34115C7018CCfb655796F6B2168",
                    "coins": [
                        {"address": "0xdAC17F958D2ee523a2206206994597C13D831ec7", "symbol": "USDT", "decimals": "6"},
                        {"address": "0x2260FAC5E5542a773Aa44fBCfeDf7C193bc2C599", "symbol": "WBTC", "decimals": "8"},
                        {"address": "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2", "symbol": "WETH", "decimals": "18"}
                    ]
                }
            ]
        }
    }"#;

    fn registry() -> PoolRegistry {
        let mut pools = parse_pools(CRYPTO_BODY, "crypto").expect("crypto should parse");
        pools.extend(parse_pools(FACTORY_BODY, "factory").expect("factory should parse"));
        PoolRegistry::from_pools(pools)
    }

    #[test]
    fn parses_pools_and_skips_malformed() {
        let pools = parse_pools(FACTORY_BODY, "factory").expect("factory should parse");
        assert_eq!(pools.len(), 2);

        let lusd = &pools[0];
        assert_eq!(lusd.registry, "factory");
        assert_eq!(lusd.asset_type, AssetType::Usd);
        assert_eq!(lusd.coins.len(), 2);
        assert!(lusd.coins.iter().all(|c| c.decimals == 18));
        assert!(lusd.gauge.is_some());

        let tbtc = &pools[1];
        assert_eq!(tbtc.asset_type, AssetType::Btc);
        assert_eq!(tbtc.gauge, None);
    }

    #[test]
    fn string_decimals_and_unknown_asset_type() {
        let pools = parse_pools(CRYPTO_BODY, "crypto").expect("crypto should parse");
        let tricrypto = &pools[0];
        assert_eq!(tricrypto.asset_type, AssetType::Other);
        let decimals: Vec<u8> = tricrypto.coins.iter().map(|c| c.decimals).collect();
        assert_eq!(decimals, vec![6, 8, 18]);
    }

    #[test]
    fn unsuccessful_response_has_no_pools() {
        let pools = parse_pools(r#"{"success": false}"#, "main").expect("body should parse");
        assert!(pools.is_empty());
        assert!(parse_pools("<html>", "main").is_err());
    }

    #[test]
    fn decimals_accept_strings_and_numbers() {
        assert_eq!(parse_decimals(&serde_json::json!("6")), Some(6));
        assert_eq!(parse_decimals(&serde_json::json!(8)), Some(8));
        assert_eq!(parse_decimals(&serde_json::json!(null)), None);
        assert_eq!(parse_decimals(&serde_json::json!(300)), None);
    }

    #[test]
    fn finds_by_address_case_insensitive() {
        let registry = registry();
        assert_eq!(registry.len(), 3);

        let pool = registry
            .find("0xed279fdd11ca84beef15af5d39bb4d4bee23f0ca")
            .expect("lowercase address should match");
        assert_eq!(pool.symbol, "LUSD3CRV-f");
    }

    #[test]
    fn finds_by_factory_symbol_and_name() {
        let registry = registry();
        assert_eq!(registry.find("lusd3crv").map(|p| p.symbol.as_str()), Some("LUSD3CRV-f"));
        assert_eq!(registry.find("TBTC").map(|p| p.symbol.as_str()), Some("tbtc-f"));
        assert_eq!(registry.find("CRV3CRYPTO").map(|p| p.registry.as_str()), Some("crypto"));
        assert_eq!(
            registry.find("curve.fi usd-btc-eth").map(|p| p.symbol.as_str()),
            Some("crv3crypto")
        );
        assert!(registry.resolve("does-not-exist").is_err());
    }

    #[test]
    fn later_registry_replaces_duplicate_address() {
        let mut pools = parse_pools(FACTORY_BODY, "factory").expect("factory should parse");
        let mut dup = pools[0].clone();
        dup.registry = "main".to_string();
        pools.push(dup);

        let registry = PoolRegistry::from_pools(pools);
        assert_eq!(registry.len(), 2);
        let pool = registry.find("lusd3crv").expect("pool should be found");
        assert_eq!(pool.registry, "main");
    }
}
