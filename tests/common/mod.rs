//! Shared test helpers and utilities.
//!
//! Synthetic chains with a fixed block time, pool factories and on-disk
//! cache stores.

#![allow(dead_code)]

use std::cell::Cell;

use alloy::primitives::Address;
use apr_analysis::pricing::{PoolPricing, TrackedPool};
use apr_data::memo::Memo;
use apr_data::sampler::ChainState;
use apr_data::store::SqliteStore;
use apr_data::{AssetType, PoolInfo};
use chrono::NaiveDate;
use tempfile::TempDir;

/// 2021-01-01T23:00:00Z
pub const NEW_YEAR_EVE_23H: u64 = 1_609_542_000;

/// Chain whose block `n` is mined at `genesis + n * block_time`, plus an
/// optional halt adding `halt_secs` to every block from `halt_at` on.
pub struct SyntheticChain {
    pub genesis: u64,
    pub block_time: u64,
    pub tip: u64,
    pub halt_at: Option<u64>,
    pub halt_secs: u64,
    reads: Cell<usize>,
}

impl SyntheticChain {
    pub fn new(genesis: u64, block_time: u64, tip: u64) -> Self {
        Self {
            genesis,
            block_time,
            tip,
            halt_at: None,
            halt_secs: 0,
            reads: Cell::new(0),
        }
    }

    pub fn with_halt(mut self, at: u64, secs: u64) -> Self {
        self.halt_at = Some(at);
        self.halt_secs = secs;
        self
    }

    /// Timestamp reads served so far.
    pub fn reads(&self) -> usize {
        self.reads.get()
    }

    pub fn timestamp(&self, block: u64) -> u64 {
        let halt = match self.halt_at {
            Some(at) if block >= at => self.halt_secs,
            _ => 0,
        };
        self.genesis + block * self.block_time + halt
    }
}

impl ChainState for SyntheticChain {
    async fn timestamp_of(&self, block: u64) -> eyre::Result<u64> {
        self.reads.set(self.reads.get() + 1);
        Ok(self.timestamp(block))
    }

    async fn current_height(&self) -> eyre::Result<u64> {
        Ok(self.tip)
    }
}

/// A USD-priced pool whose gauge differs from the pool in byte 18.
pub fn usd_pool(last_byte: u8, symbol: &str) -> TrackedPool {
    let mut bytes = [0u8; 20];
    bytes[19] = last_byte;
    let address = Address::from(bytes);
    bytes[18] = 0x01;
    let gauge = Address::from(bytes);

    let info = PoolInfo {
        address,
        name: format!("Curve.fi {symbol}"),
        symbol: symbol.to_string(),
        registry: "factory".to_string(),
        gauge: Some(gauge),
        coins: vec![],
        asset_type: AssetType::Usd,
    };
    TrackedPool::new(info, PoolPricing::Usd).expect("pool has a gauge")
}

/// A SQLite-backed memo in a fresh temporary directory.
///
/// The directory is removed when the returned [`TempDir`] is dropped.
pub fn temp_memo() -> (TempDir, Memo<SqliteStore>) {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let store = SqliteStore::open(dir.path().join("cache.sqlite")).expect("store should open");
    (dir, Memo::new(store))
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}
