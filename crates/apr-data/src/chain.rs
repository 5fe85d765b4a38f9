//! Alloy RPC reads for block timestamps and Curve gauge state.
//!
//! Every contract read is pinned to a block, so the node must serve
//! historical state (archive node).

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;

use alloy::primitives::{address, Address, U256};
use alloy::network::Ethereum;
use alloy::providers::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller,
};
use alloy::providers::{Identity, Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::eth::{BlockId, BlockNumberOrTag};
use alloy::sol;
use eyre::{eyre, Context, Result};

use crate::error::is_fatal;
use crate::retry::{is_transient_rpc, retry_if, Backoff};
use crate::sampler::ChainState;
use crate::types::GaugeReading;

sol! {
    #[sol(rpc)]
    interface ICrvToken {
        function rate() external view returns (uint256 rate);
    }

    #[sol(rpc)]
    interface IGaugeController {
        function gauge_relative_weight(address gauge) external view returns (uint256 weight);
    }

    #[sol(rpc)]
    interface ILiquidityGauge {
        function working_supply() external view returns (uint256 supply);
    }

    #[sol(rpc)]
    interface ICurvePool {
        function get_virtual_price() external view returns (uint256 price);
        function balances(uint256 i) external view returns (uint256 balance);
    }

    #[sol(rpc)]
    interface ICurvePoolLegacy {
        function balances(int128 i) external view returns (uint256 balance);
    }
}

/// Addresses of the Curve DAO contracts read for every pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurveContracts {
    /// CRV ERC-20 token (exposes the inflation `rate()`).
    pub crv_token: Address,
    /// Gauge controller (exposes `gauge_relative_weight`).
    pub gauge_controller: Address,
}

impl Default for CurveContracts {
    fn default() -> Self {
        Self {
            crv_token: address!("D533a949740bb3306d119CC777fa900bA034cd52"),
            gauge_controller: address!("2F50D538606Fa9EDD2B11E2446BEb18C9D5846bB"),
        }
    }
}

/// Converts a raw uint256 to f64.
pub fn u256_to_f64(value: U256) -> f64 {
    value.to_string().parse().unwrap_or(f64::NAN)
}

/// Converts an 18-decimal fixed point uint256 to f64.
pub fn scaled_1e18(value: U256) -> f64 {
    u256_to_f64(value) / 1e18
}

fn at(block: u64) -> BlockId {
    BlockId::Number(BlockNumberOrTag::Number(block))
}

/// Smallest height in `[lo, hi]` for which `pred` holds, assuming `pred` is
/// monotone (false then true). Returns `hi` when only `hi` satisfies it.
pub async fn first_block_where<F, Fut>(lo: u64, hi: u64, mut pred: F) -> Result<u64>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let (mut lo, mut hi) = (lo, hi);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid).await? {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(lo)
}

/// Provider returned by `ProviderBuilder::new().on_http(..)`.
pub type HttpProvider = FillProvider<
    JoinFill<
        Identity,
        JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
    >,
    RootProvider<Ethereum>,
>;

/// Chain reads at historical blocks.
///
/// Every JSON-RPC call is retried per the configured [`Backoff`] when it
/// fails with a transient transport error (see [`is_transient_rpc`]).
pub struct ChainReader<P> {
    provider: P,
    backoff: Backoff,
    timestamps: RefCell<HashMap<u64, u64>>,
}

impl ChainReader<HttpProvider> {
    /// Connects over HTTP and checks the endpoint with `eth_blockNumber`.
    ///
    /// # Errors
    /// Returns error if the URL is malformed or the connectivity test fails.
    #[tracing::instrument(skip_all, fields(rpc_url = %rpc_url))]
    pub async fn connect(rpc_url: &str, backoff: Backoff) -> Result<Self> {
        let provider =
            ProviderBuilder::new().on_http(rpc_url.parse().wrap_err("invalid RPC URL format")?);
        let reader = Self::new(provider).with_backoff(backoff);

        let latest_block = reader
            .current_height()
            .await
            .wrap_err("failed to test RPC connectivity with eth_blockNumber")?;

        tracing::info!(latest_block, "RPC connection successful");
        Ok(reader)
    }
}

impl<P: Provider> ChainReader<P> {
    /// Wraps an existing provider with the default backoff.
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            backoff: Backoff::default(),
            timestamps: RefCell::new(HashMap::new()),
        }
    }

    /// Replaces the retry schedule used for every RPC call.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    async fn rpc<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_if(&self.backoff, operation, is_transient_rpc, op).await
    }

    /// True when `address` holds contract code at `block`.
    pub async fn has_code(&self, address: Address, block: u64) -> Result<bool> {
        let provider = &self.provider;
        let code = self
            .rpc("eth_getCode", move || async move {
                Ok::<_, eyre::Report>(provider.get_code_at(address).block_id(at(block)).await?)
            })
            .await
            .wrap_err_with(|| format!("failed to fetch code of {address:#x} at block {block}"))?;
        Ok(!code.is_empty())
    }

    /// First block at which `address` has contract code.
    ///
    /// # Errors
    /// Returns error if the address has no code at the tip or an RPC call fails.
    #[tracing::instrument(skip(self), fields(address = %format!("{address:#x}")))]
    pub async fn deployment_block(&self, address: Address) -> Result<u64> {
        let tip = self.current_height().await?;
        if !self.has_code(address, tip).await? {
            return Err(eyre!("no contract code at {address:#x}"));
        }

        let block = first_block_where(0, tip, |block| self.has_code(address, block)).await?;
        tracing::info!(block, "found deployment block");
        Ok(block)
    }

    /// Reads the gauge and pool state needed for one APR sample.
    ///
    /// `n_coins` balances are read when greater than zero.
    ///
    /// # Errors
    /// Returns error if any contract read fails, e.g. because the gauge did
    /// not exist yet at `block`. Transient failures that outlast the backoff
    /// are fatal.
    #[tracing::instrument(
        skip(self, contracts),
        fields(pool = %format!("{pool:#x}"), gauge = %format!("{gauge:#x}"))
    )]
    pub async fn gauge_reading(
        &self,
        contracts: &CurveContracts,
        pool: Address,
        gauge: Address,
        n_coins: usize,
        block: u64,
    ) -> Result<GaugeReading> {
        let block_id = at(block);
        let provider = &self.provider;
        let CurveContracts {
            crv_token,
            gauge_controller,
        } = *contracts;

        let rate = self
            .rpc("rate", move || async move {
                let ret = ICrvToken::new(crv_token, provider)
                    .rate()
                    .block(block_id)
                    .call()
                    .await?;
                Ok::<_, eyre::Report>(ret.rate)
            })
            .await
            .wrap_err("CRV rate() failed")?;

        let weight = self
            .rpc("gauge_relative_weight", move || async move {
                let ret = IGaugeController::new(gauge_controller, provider)
                    .gauge_relative_weight(gauge)
                    .block(block_id)
                    .call()
                    .await?;
                Ok::<_, eyre::Report>(ret.weight)
            })
            .await
            .wrap_err("gauge_relative_weight() failed")?;

        let supply = self
            .rpc("working_supply", move || async move {
                let ret = ILiquidityGauge::new(gauge, provider)
                    .working_supply()
                    .block(block_id)
                    .call()
                    .await?;
                Ok::<_, eyre::Report>(ret.supply)
            })
            .await
            .wrap_err("working_supply() failed")?;

        let virtual_price = self
            .rpc("get_virtual_price", move || async move {
                let ret = ICurvePool::new(pool, provider)
                    .get_virtual_price()
                    .block(block_id)
                    .call()
                    .await?;
                Ok::<_, eyre::Report>(ret.price)
            })
            .await
            .wrap_err("get_virtual_price() failed")?;

        let mut balances = Vec::with_capacity(n_coins);
        for i in 0..n_coins {
            balances.push(u256_to_f64(self.pool_balance(pool, i, block_id).await?));
        }

        Ok(GaugeReading {
            inflation_rate: scaled_1e18(rate),
            relative_weight: scaled_1e18(weight),
            working_supply: scaled_1e18(supply),
            virtual_price: scaled_1e18(virtual_price),
            balances,
        })
    }

    /// Balance of coin `i`, trying `balances(uint256)` then the older
    /// `balances(int128)` signature.
    async fn pool_balance(&self, pool: Address, i: usize, block_id: BlockId) -> Result<U256> {
        let provider = &self.provider;
        let modern = self
            .rpc("balances(uint256)", move || async move {
                let ret = ICurvePool::new(pool, provider)
                    .balances(U256::from(i))
                    .block(block_id)
                    .call()
                    .await?;
                Ok::<_, eyre::Report>(ret.balance)
            })
            .await;

        match modern {
            Ok(balance) => Ok(balance),
            Err(e) if is_fatal(&e) => Err(e),
            Err(e) => {
                tracing::debug!(coin = i, error = %e, "balances(uint256) failed, trying int128");
                self.rpc("balances(int128)", move || async move {
                    let ret = ICurvePoolLegacy::new(pool, provider)
                        .balances(i as i128)
                        .block(block_id)
                        .call()
                        .await?;
                    Ok::<_, eyre::Report>(ret.balance)
                })
                .await
                .wrap_err_with(|| format!("balances({i}) failed"))
            }
        }
    }
}

impl<P: Provider> ChainState for ChainReader<P> {
    async fn timestamp_of(&self, block: u64) -> Result<u64> {
        let cached = self.timestamps.borrow().get(&block).copied();
        if let Some(ts) = cached {
            return Ok(ts);
        }

        let provider = &self.provider;
        let header = self
            .rpc("eth_getBlockByNumber", move || async move {
                Ok::<_, eyre::Report>(provider.get_block(at(block)).await?)
            })
            .await
            .wrap_err_with(|| format!("failed to fetch block {block}"))?
            .ok_or_else(|| eyre!("block {block} not found"))?;

        let ts = header.header.timestamp;
        self.timestamps.borrow_mut().insert(block, ts);
        Ok(ts)
    }

    async fn current_height(&self) -> Result<u64> {
        let provider = &self.provider;
        self.rpc("eth_blockNumber", move || async move {
            Ok::<_, eyre::Report>(provider.get_block_number().await?)
        })
        .await
        .wrap_err("failed to fetch chain tip")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;

    use alloy::primitives::U64;
    use alloy::rpc::json_rpc::ErrorPayload;
    use alloy::transports::mock::Asserter;

    fn mocked(asserter: &Asserter) -> ChainReader<impl Provider> {
        let provider = ProviderBuilder::new().on_mocked_client(asserter.clone());
        ChainReader::new(provider).with_backoff(Backoff {
            initial: Duration::from_millis(1),
            max_attempts: 3,
        })
    }

    fn rate_limited() -> ErrorPayload {
        ErrorPayload {
            code: 429,
            message: "rate limited".into(),
            data: None,
        }
    }

    #[test]
    fn converts_fixed_point() {
        let one = U256::from(10u64).pow(U256::from(18u64));
        assert_eq!(scaled_1e18(one), 1.0);
        assert_eq!(scaled_1e18(one * U256::from(3u64) / U256::from(2u64)), 1.5);
        assert_eq!(u256_to_f64(U256::ZERO), 0.0);
    }

    #[tokio::test]
    async fn binary_search_finds_first_true() {
        let deployed_at = 12_345_678u64;
        let lookups = Cell::new(0u32);
        let found = first_block_where(0, 20_000_000, |block| {
            lookups.set(lookups.get() + 1);
            async move { Ok::<_, eyre::Report>(block >= deployed_at) }
        })
        .await
        .expect("search should succeed");

        assert_eq!(found, deployed_at);
        assert!(lookups.get() <= 26);
    }

    #[tokio::test]
    async fn binary_search_edges() {
        let at_zero = first_block_where(0, 100, |_| async { Ok::<_, eyre::Report>(true) })
            .await
            .expect("search should succeed");
        assert_eq!(at_zero, 0);

        let at_tip = first_block_where(0, 100, |block| async move {
            Ok::<_, eyre::Report>(block == 100)
        })
        .await
        .expect("search should succeed");
        assert_eq!(at_tip, 100);
    }

    #[tokio::test]
    async fn rate_limited_reads_are_retried() {
        let asserter = Asserter::new();
        asserter.push_failure(rate_limited());
        asserter.push_failure(rate_limited());
        asserter.push_success(&U64::from(17_000_000u64));
        let reader = mocked(&asserter);

        let tip = reader.current_height().await.expect("third attempt succeeds");
        assert_eq!(tip, 17_000_000);
        assert!(asserter.read_q().is_empty());
    }

    #[tokio::test]
    async fn persistent_rate_limit_is_fatal() {
        let asserter = Asserter::new();
        for _ in 0..3 {
            asserter.push_failure(rate_limited());
        }
        let reader = mocked(&asserter);

        let err = reader.current_height().await.expect_err("attempts run out");
        assert!(is_fatal(&err), "unexpected error: {err:?}");
    }

    #[tokio::test]
    async fn node_errors_are_not_retried() {
        let asserter = Asserter::new();
        asserter.push_failure_msg("execution reverted");
        asserter.push_success(&U64::from(1u64));
        let reader = mocked(&asserter);

        let err = reader.current_height().await.expect_err("error is returned");
        assert!(!is_fatal(&err));
        assert_eq!(asserter.read_q().len(), 1);
    }

    #[test]
    fn mainnet_contracts_default() {
        let contracts = CurveContracts::default();
        assert_eq!(
            format!("{:#x}", contracts.crv_token),
            "0xd533a949740bb3306d119cc777fa900ba034cd52"
        );
    }
}
