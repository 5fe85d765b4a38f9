//! Day-by-day APR history.
//!
//! [`run_history`] drives a [`MidnightSampler`] and asks a [`PoolAprSource`]
//! for every tracked pool on every sampled day. A pool that cannot be
//! priced or read on a given day gets `0.0` in that cell and the run moves
//! on; only fatal errors (cache unusable, retries exhausted) stop it.

use alloy::providers::Provider;
use apr_data::chain::{ChainReader, CurveContracts};
use apr_data::memo::{CallKey, Memo};
use apr_data::prices::PriceTable;
use apr_data::sampler::{ChainState, MidnightSampler};
use apr_data::store::KvStore;
use apr_data::{is_fatal, GaugeReading, SamplePoint};
use chrono::NaiveDate;
use eyre::Result;
use tracing::{info, warn};

use crate::apr::{crv_apr, AprInputs, Boost};
use crate::pricing::{crv_price, TrackedPool};

/// Computes one pool's APR at one sampled block.
#[allow(async_fn_in_trait)]
pub trait PoolAprSource {
    /// APR in percent.
    async fn apr(&self, pool: &TrackedPool, point: &SamplePoint) -> Result<f64>;
}

/// Receives history rows as they are completed.
pub trait RowSink {
    /// Handles one completed row.
    fn write_row(&mut self, row: &HistoryRow) -> Result<()>;
}

impl<K: RowSink + ?Sized> RowSink for &mut K {
    fn write_row(&mut self, row: &HistoryRow) -> Result<()> {
        (**self).write_row(row)
    }
}

impl RowSink for Vec<HistoryRow> {
    fn write_row(&mut self, row: &HistoryRow) -> Result<()> {
        self.push(row.clone());
        Ok(())
    }
}

/// APRs of every tracked pool on one day.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    /// UTC date of the sampled block.
    pub date: NaiveDate,
    /// Sampled block.
    pub block: u64,
    /// APR per pool, in tracked-pool order. `0.0` marks missing data.
    pub values: Vec<f64>,
}

/// Outcome of a history run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistorySummary {
    /// Rows written.
    pub days: usize,
    /// First and last sampled dates.
    pub range: Option<(NaiveDate, NaiveDate)>,
    /// Per pool, number of days without data.
    pub no_data: Vec<usize>,
    /// Per pool, most recent computed APR.
    pub latest: Vec<Option<f64>>,
}

/// Samples every day from `sampler` and writes one row per day to `sink`.
///
/// # Errors
/// Returns sampler failures, sink failures and any fatal error raised by
/// `source`. Other `source` errors become `0.0` cells.
pub async fn run_history<C, A, K>(
    sampler: &mut MidnightSampler<C>,
    pools: &[TrackedPool],
    source: &A,
    sink: &mut K,
) -> Result<HistorySummary>
where
    C: ChainState,
    A: PoolAprSource,
    K: RowSink,
{
    let mut summary = HistorySummary {
        no_data: vec![0; pools.len()],
        latest: vec![None; pools.len()],
        ..HistorySummary::default()
    };

    while let Some(point) = sampler.next_block().await? {
        let date = point.date();
        let mut values = Vec::with_capacity(pools.len());

        for (idx, pool) in pools.iter().enumerate() {
            let value = match source.apr(pool, &point).await {
                Ok(apr) if apr.is_finite() => {
                    summary.latest[idx] = Some(apr);
                    apr
                }
                Ok(apr) => {
                    warn!(%date, pool = %pool.label(), apr, "no data: APR is not finite");
                    summary.no_data[idx] += 1;
                    0.0
                }
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    warn!(%date, pool = %pool.label(), error = %e, "no data");
                    summary.no_data[idx] += 1;
                    0.0
                }
            };
            values.push(value);
        }

        let row = HistoryRow {
            date,
            block: point.block,
            values,
        };
        info!(%date, block = point.block, values = ?row.values, "sampled day");
        sink.write_row(&row)?;

        summary.days += 1;
        summary.range = Some(match summary.range {
            Some((first, _)) => (first, date),
            None => (date, date),
        });
    }

    Ok(summary)
}

/// [`PoolAprSource`] reading gauge state from the chain, memoized per
/// (pool, gauge, block), and prices from a downloaded [`PriceTable`].
pub struct OnChainAprSource<'a, P, S> {
    chain: &'a ChainReader<P>,
    memo: &'a Memo<S>,
    contracts: CurveContracts,
    prices: &'a PriceTable,
    boost: Boost,
}

impl<'a, P: Provider, S: KvStore> OnChainAprSource<'a, P, S> {
    /// Creates a source over the given chain, cache and prices.
    pub fn new(
        chain: &'a ChainReader<P>,
        memo: &'a Memo<S>,
        contracts: CurveContracts,
        prices: &'a PriceTable,
        boost: Boost,
    ) -> Self {
        Self {
            chain,
            memo,
            contracts,
            prices,
            boost,
        }
    }

    /// Gauge and pool state of `pool` at `block`, memoized.
    ///
    /// # Errors
    /// Propagates contract read and cache failures.
    pub async fn reading(&self, pool: &TrackedPool, block: u64) -> Result<GaugeReading> {
        let n_coins = pool.pricing.balances_needed();
        let key = CallKey::new("apr_data::chain", "gauge_reading")
            .receiver("ChainReader")
            .arg(format!("{:#x}", pool.info.address))
            .arg(format!("{:#x}", pool.gauge))
            .arg(n_coins)
            .arg(block);

        self.memo
            .get_or_compute(&key, || {
                self.chain.gauge_reading(
                    &self.contracts,
                    pool.info.address,
                    pool.gauge,
                    n_coins,
                    block,
                )
            })
            .await
    }
}

impl<P: Provider, S: KvStore> PoolAprSource for OnChainAprSource<'_, P, S> {
    async fn apr(&self, pool: &TrackedPool, point: &SamplePoint) -> Result<f64> {
        let reading = self.reading(pool, point.block).await?;
        let date = point.date();

        let crv = crv_price(self.prices, date)?;
        let asset = pool.pricing.asset_price(self.prices, date, &reading.balances)?;
        let inputs = AprInputs::from_reading(&reading, crv, asset);

        Ok(crv_apr(&inputs, self.boost)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apr::AprError;
    use crate::pricing::PoolPricing;
    use alloy::primitives::{address, Address};
    use apr_data::{AssetType, FatalError, PoolInfo};
    use std::collections::HashMap;

    /// 2022-03-01T00:00:00Z
    const DAY0: u64 = 1_646_092_800;

    /// 15 s blocks starting one hour before `DAY0`.
    struct Chain;

    impl ChainState for Chain {
        async fn timestamp_of(&self, block: u64) -> Result<u64> {
            Ok(DAY0 - 3_600 + block * 15)
        }

        async fn current_height(&self) -> Result<u64> {
            Ok(3 * 5_760 + 300)
        }
    }

    /// Fixed APR per pool address, failing for one (pool, date).
    struct ScriptedSource {
        aprs: HashMap<Address, f64>,
        failing: Option<(Address, NaiveDate)>,
        fatal: bool,
    }

    impl PoolAprSource for ScriptedSource {
        async fn apr(&self, pool: &TrackedPool, point: &SamplePoint) -> Result<f64> {
            if self.failing == Some((pool.info.address, point.date())) {
                if self.fatal {
                    return Err(FatalError::RetriesExhausted {
                        operation: "gauge_reading".to_string(),
                        attempts: 6,
                    }
                    .into());
                }
                return Err(AprError::ZeroWorkingSupply.into());
            }
            Ok(self.aprs[&pool.info.address])
        }
    }

    fn tracked(addr: Address, symbol: &str) -> TrackedPool {
        let info = PoolInfo {
            address: addr,
            name: symbol.to_string(),
            symbol: symbol.to_string(),
            registry: "main".to_string(),
            gauge: Some(addr),
            coins: vec![],
            asset_type: AssetType::Usd,
        };
        TrackedPool::new(info, PoolPricing::Usd).expect("gauge is set")
    }

    const A: Address = address!("00000000000000000000000000000000000000aa");
    const B: Address = address!("00000000000000000000000000000000000000bb");

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 3, d).expect("valid date")
    }

    async fn sampler() -> MidnightSampler<Chain> {
        MidnightSampler::new(Chain, 0, None, Default::default())
            .await
            .expect("sampler should build")
    }

    #[tokio::test]
    async fn failing_cell_is_zero_and_others_computed() {
        let pools = [tracked(A, "a"), tracked(B, "b")];
        let source = ScriptedSource {
            aprs: HashMap::from([(A, 3.5), (B, 7.25)]),
            failing: Some((B, date(2))),
            fatal: false,
        };
        let mut rows: Vec<HistoryRow> = Vec::new();

        let summary = run_history(&mut sampler().await, &pools, &source, &mut rows)
            .await
            .expect("run should complete");

        let dates: Vec<NaiveDate> = rows.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![date(1), date(2), date(3), date(4)]);
        assert_eq!(rows[0].values, vec![3.5, 7.25]);
        assert_eq!(rows[1].values, vec![3.5, 0.0]);
        assert_eq!(rows[2].values, vec![3.5, 7.25]);

        assert_eq!(summary.days, 4);
        assert_eq!(summary.no_data, vec![0, 1]);
        assert_eq!(summary.latest, vec![Some(3.5), Some(7.25)]);
        assert_eq!(summary.range, Some((date(1), date(4))));
    }

    #[tokio::test]
    async fn fatal_error_aborts_run() {
        let pools = [tracked(A, "a"), tracked(B, "b")];
        let source = ScriptedSource {
            aprs: HashMap::from([(A, 3.5), (B, 7.25)]),
            failing: Some((A, date(2))),
            fatal: true,
        };
        let mut rows: Vec<HistoryRow> = Vec::new();

        let err = run_history(&mut sampler().await, &pools, &source, &mut rows)
            .await
            .expect_err("fatal error should abort");

        assert!(is_fatal(&err));
        assert_eq!(rows.len(), 1, "rows before the failure are kept");
    }

    #[tokio::test]
    async fn non_finite_values_are_recorded_as_zero() {
        let pools = [tracked(A, "a")];
        let source = ScriptedSource {
            aprs: HashMap::from([(A, f64::INFINITY)]),
            failing: None,
            fatal: false,
        };
        let mut rows: Vec<HistoryRow> = Vec::new();

        let summary = run_history(&mut sampler().await, &pools, &source, &mut rows)
            .await
            .expect("run should complete");

        assert!(rows.iter().all(|r| r.values == vec![0.0]));
        assert_eq!(summary.no_data, vec![rows.len()]);
        assert_eq!(summary.latest, vec![None]);
    }
}
