//! End-to-end behavior of the midnight block sampler over synthetic chains.

mod common;

use apr_data::sampler::{MidnightSampler, SamplerConfig};
use apr_data::SamplePoint;
use common::{date, SyntheticChain, NEW_YEAR_EVE_23H};

async fn sample_all(chain: &SyntheticChain, start: u64, end: Option<u64>) -> Vec<SamplePoint> {
    let mut sampler = MidnightSampler::new(chain, start, end, SamplerConfig::default())
        .await
        .expect("sampler should build");
    let mut points = Vec::new();
    while let Some(point) = sampler.next_block().await.expect("sampling should succeed") {
        points.push(point);
    }
    points
}

/// A month of 15 s blocks starting 2021-01-01T23:00Z yields the first block
/// after every midnight from 2021-01-02 on.
#[tokio::test]
async fn month_of_regular_blocks() {
    let chain = SyntheticChain::new(NEW_YEAR_EVE_23H, 15, 175_000);
    let points = sample_all(&chain, 0, None).await;

    assert_eq!(points.len(), 31);
    assert_eq!(points[0].date(), date(2021, 1, 2));
    assert_eq!(points[30].date(), date(2021, 2, 1));

    for (k, point) in points.iter().enumerate() {
        assert_eq!(point.block, 241 + k as u64 * 5_760);
        assert!(point.timestamp as i64 > point.boundary);
        assert!((chain.timestamp(point.block - 1) as i64) <= point.boundary);
    }
}

/// The walk reads a handful of timestamps per day, not every block.
#[tokio::test]
async fn reads_are_sublinear_in_blocks() {
    let chain = SyntheticChain::new(NEW_YEAR_EVE_23H, 15, 175_000);
    let points = sample_all(&chain, 0, None).await;

    assert!(
        chain.reads() < points.len() * 40,
        "{} reads for {} days",
        chain.reads(),
        points.len()
    );
}

/// A two-day halt drops the midnight it swallows and resumes one block per
/// day afterwards.
#[tokio::test]
async fn halted_chain_skips_missing_day() {
    let chain = SyntheticChain::new(NEW_YEAR_EVE_23H, 15, 60_000).with_halt(10_000, 2 * 86_400);
    let points = sample_all(&chain, 0, None).await;

    let dates: Vec<_> = points.iter().map(SamplePoint::date).collect();
    assert_eq!(&dates[..2], &[date(2021, 1, 2), date(2021, 1, 3)]);
    assert!(!dates.contains(&date(2021, 1, 4)));
    assert_eq!(dates[2], date(2021, 1, 5));

    for pair in points.windows(2) {
        assert!(pair[0].block < pair[1].block);
        assert!(pair[0].date() < pair[1].date());
    }
    for pair in dates[2..].windows(2) {
        assert_eq!(pair[1], pair[0].succ_opt().expect("next day"));
    }
}

/// Heights never reach the exclusive end bound.
#[tokio::test]
async fn explicit_end_bound() {
    let chain = SyntheticChain::new(NEW_YEAR_EVE_23H, 15, 175_000);
    let points = sample_all(&chain, 0, Some(11_761)).await;

    assert_eq!(
        points.iter().map(|p| p.block).collect::<Vec<_>>(),
        vec![241, 6_001]
    );
}

/// Starting mid-range picks up at the next midnight after the start block.
#[tokio::test]
async fn starts_from_arbitrary_block() {
    let chain = SyntheticChain::new(NEW_YEAR_EVE_23H, 15, 175_000);
    let points = sample_all(&chain, 7_000, Some(20_000)).await;

    assert_eq!(
        points.iter().map(|p| p.block).collect::<Vec<_>>(),
        vec![11_761, 17_521]
    );
}
