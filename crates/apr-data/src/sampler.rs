//! Midnight-aligned block sampling.
//!
//! Walks the chain forward from a start block and yields, for every UTC
//! midnight, the first block whose timestamp is strictly after it. The walk
//! jumps ahead by an estimate derived from an assumed block time, scaled
//! down by a safety factor so that it approaches each boundary from below,
//! and falls back to single-block steps once the estimate rounds to zero.
//!
//! When a yielded block already lies more than one day past its boundary
//! (a chain halt, or an estimate that overshot) the days in between are
//! dropped with a warning. Yielded heights are strictly increasing and no
//! two share a UTC date.

use futures::Stream;
use tracing::{debug, warn};

use eyre::{eyre, Result};

use crate::types::{next_midnight, SamplePoint, SECONDS_PER_DAY};

/// Read access to block timestamps.
#[allow(async_fn_in_trait)]
pub trait ChainState {
    /// Unix timestamp (seconds) of `block`.
    async fn timestamp_of(&self, block: u64) -> Result<u64>;

    /// Height of the current chain tip.
    async fn current_height(&self) -> Result<u64>;
}

impl<C: ChainState + ?Sized> ChainState for &C {
    async fn timestamp_of(&self, block: u64) -> Result<u64> {
        (**self).timestamp_of(block).await
    }

    async fn current_height(&self) -> Result<u64> {
        (**self).current_height().await
    }
}

/// Step estimation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerConfig {
    /// Assumed average seconds between blocks.
    pub block_time_secs: f64,
    /// Multiplier (< 1) applied to the estimate to avoid overshooting.
    pub safety_factor: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            block_time_secs: 15.0,
            safety_factor: 0.95,
        }
    }
}

impl SamplerConfig {
    /// Checks that the block time is positive and the safety factor lies in
    /// `(0, 1]`. A zero factor would degrade the walk to one read per block.
    ///
    /// # Errors
    /// Returns error naming the offending parameter.
    pub fn validate(&self) -> Result<()> {
        if !(self.block_time_secs.is_finite() && self.block_time_secs > 0.0) {
            return Err(eyre!(
                "block time must be positive, got {}",
                self.block_time_secs
            ));
        }
        if !(self.safety_factor > 0.0 && self.safety_factor <= 1.0) {
            return Err(eyre!(
                "safety factor must lie in (0, 1], got {}",
                self.safety_factor
            ));
        }
        Ok(())
    }

    /// Blocks to advance when `seconds_remaining` separate the cursor from
    /// the boundary. Never less than one.
    pub fn estimate_step(&self, seconds_remaining: i64) -> u64 {
        let estimate =
            seconds_remaining.max(0) as f64 / self.block_time_secs * self.safety_factor;
        (estimate as u64).max(1)
    }
}

/// Lazy iterator over the first block after each UTC midnight.
#[derive(Debug)]
pub struct MidnightSampler<C> {
    chain: C,
    config: SamplerConfig,
    cursor: u64,
    end: u64,
    boundary: i64,
    cursor_timestamp: Option<u64>,
}

impl<C: ChainState> MidnightSampler<C> {
    /// Prepares a walk from `start` up to (excluding) `end`, or the current
    /// tip when `end` is `None`.
    ///
    /// # Errors
    /// Propagates chain read failures.
    #[tracing::instrument(skip(chain, config))]
    pub async fn new(chain: C, start: u64, end: Option<u64>, config: SamplerConfig) -> Result<Self> {
        config.validate()?;
        let start_timestamp = chain.timestamp_of(start).await?;
        let end = match end {
            Some(end) => end,
            None => chain.current_height().await?,
        };
        let boundary = next_midnight(start_timestamp);
        debug!(start, end, start_timestamp, boundary, "midnight sampler ready");

        Ok(Self {
            chain,
            config,
            cursor: start,
            end,
            boundary,
            cursor_timestamp: Some(start_timestamp),
        })
    }

    /// Exclusive upper bound of the walk.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// The next sampled block, or `None` once the end height is reached.
    ///
    /// # Errors
    /// Propagates chain read failures.
    pub async fn next_block(&mut self) -> Result<Option<SamplePoint>> {
        while self.cursor < self.end {
            let timestamp = match self.cursor_timestamp {
                Some(ts) => ts,
                None => {
                    let ts = self.chain.timestamp_of(self.cursor).await?;
                    self.cursor_timestamp = Some(ts);
                    ts
                }
            };

            if timestamp as i64 > self.boundary {
                let point = SamplePoint {
                    block: self.cursor,
                    timestamp,
                    boundary: self.boundary,
                };
                let next = next_midnight(timestamp);
                let skipped = (next - self.boundary) / SECONDS_PER_DAY - 1;
                if skipped > 0 {
                    warn!(
                        block = self.cursor,
                        skipped_days = skipped,
                        "block is past more than one midnight, dropping the days in between"
                    );
                }
                self.boundary = next;
                debug!(block = point.block, timestamp, date = %point.date(), "sampled block");
                return Ok(Some(point));
            }

            let step = self
                .config
                .estimate_step(self.boundary - timestamp as i64);
            self.cursor = self.cursor.saturating_add(step);
            self.cursor_timestamp = None;
        }

        Ok(None)
    }

    /// Converts the sampler into a stream of sample points.
    pub fn into_stream(self) -> impl Stream<Item = Result<SamplePoint>> {
        futures::stream::try_unfold(self, |mut sampler| async move {
            let next = sampler.next_block().await?;
            Ok::<_, eyre::Report>(next.map(|point| (point, sampler)))
        })
    }
}
