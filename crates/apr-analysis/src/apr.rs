//! CRV reward APR for a Curve gauge.
//!
//! ```text
//! apr = crv_price * inflation_rate * relative_weight * SECONDS_PER_YEAR * 0.4
//!       / (working_supply * asset_price * virtual_price) * 100
//! ```
//!
//! The 0.4 factor is the minimum boost. A fully boosted position earns
//! 2.5 times that.

use apr_data::GaugeReading;
use chrono::NaiveDate;

/// Seconds in a 365-day year.
pub const SECONDS_PER_YEAR: f64 = 31_536_000.0;

/// Share of emissions an unboosted deposit receives.
pub const MIN_BOOST_FACTOR: f64 = 0.4;

/// Ratio between the maximum and minimum boost.
pub const MAX_BOOST_MULTIPLIER: f64 = 2.5;

/// Why an APR could not be computed for one pool on one day.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AprError {
    #[error("gauge working supply is zero")]
    ZeroWorkingSupply,
    #[error("pool asset price is zero")]
    ZeroAssetPrice,
    #[error("pool virtual price is zero")]
    ZeroVirtualPrice,
    #[error("pool holds no liquidity")]
    EmptyLiquidity,
    #[error("no {id} price on {date}")]
    MissingPrice { id: String, date: NaiveDate },
    #[error("APR is not a finite number")]
    NonFinite,
}

/// Reward boost applied to the position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Boost {
    #[default]
    Min,
    Max,
}

impl Boost {
    fn multiplier(self) -> f64 {
        match self {
            Self::Min => 1.0,
            Self::Max => MAX_BOOST_MULTIPLIER,
        }
    }
}

/// Everything the formula needs, already scaled to human units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AprInputs {
    /// CRV price in USD.
    pub crv_price: f64,
    /// CRV emitted per second.
    pub inflation_rate: f64,
    /// Gauge share of emissions.
    pub relative_weight: f64,
    /// Gauge working supply.
    pub working_supply: f64,
    /// USD price of one unit of the pool's underlying asset.
    pub asset_price: f64,
    /// Pool virtual price.
    pub virtual_price: f64,
}

impl AprInputs {
    /// Combines an on-chain reading with the day's prices.
    pub fn from_reading(reading: &GaugeReading, crv_price: f64, asset_price: f64) -> Self {
        Self {
            crv_price,
            inflation_rate: reading.inflation_rate,
            relative_weight: reading.relative_weight,
            working_supply: reading.working_supply,
            asset_price,
            virtual_price: reading.virtual_price,
        }
    }
}

/// CRV APR in percent for the given boost.
///
/// # Errors
/// Returns [`AprError`] for zero denominators or a non-finite result.
pub fn crv_apr(inputs: &AprInputs, boost: Boost) -> Result<f64, AprError> {
    if inputs.working_supply == 0.0 {
        return Err(AprError::ZeroWorkingSupply);
    }
    if inputs.asset_price == 0.0 {
        return Err(AprError::ZeroAssetPrice);
    }
    if inputs.virtual_price == 0.0 {
        return Err(AprError::ZeroVirtualPrice);
    }

    let yearly_rewards = inputs.crv_price
        * inputs.inflation_rate
        * inputs.relative_weight
        * SECONDS_PER_YEAR
        * MIN_BOOST_FACTOR;
    let staked_value = inputs.working_supply * inputs.asset_price * inputs.virtual_price;
    let apr = yearly_rewards / staked_value * 100.0 * boost.multiplier();

    if apr.is_finite() {
        Ok(apr)
    } else {
        Err(AprError::NonFinite)
    }
}

/// CRV APR in percent at minimum boost.
///
/// # Errors
/// See [`crv_apr`].
pub fn min_crv_apr(inputs: &AprInputs) -> Result<f64, AprError> {
    crv_apr(inputs, Boost::Min)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> AprInputs {
        AprInputs {
            crv_price: 2.0,
            inflation_rate: 5.0,
            relative_weight: 0.01,
            working_supply: 1_000_000.0,
            asset_price: 1.0,
            virtual_price: 1.02,
        }
    }

    #[test]
    fn matches_reference_formula() {
        let i = inputs();
        let expected = (i.crv_price * i.inflation_rate * i.relative_weight * 12_614_400.0)
            / (i.working_supply * i.asset_price * i.virtual_price)
            * 100.0;
        let apr = min_crv_apr(&i).expect("inputs are valid");
        assert!((apr - expected).abs() < 1e-9, "{apr} != {expected}");
        assert!((apr - 123.670_588).abs() < 1e-3);
    }

    #[test]
    fn max_boost_is_two_and_a_half_times_min() {
        let min = crv_apr(&inputs(), Boost::Min).expect("valid");
        let max = crv_apr(&inputs(), Boost::Max).expect("valid");
        assert!((max / min - 2.5).abs() < 1e-12);
    }

    #[test]
    fn zero_denominators_are_errors() {
        let mut i = inputs();
        i.working_supply = 0.0;
        assert_eq!(min_crv_apr(&i), Err(AprError::ZeroWorkingSupply));

        let mut i = inputs();
        i.asset_price = 0.0;
        assert_eq!(min_crv_apr(&i), Err(AprError::ZeroAssetPrice));

        let mut i = inputs();
        i.virtual_price = 0.0;
        assert_eq!(min_crv_apr(&i), Err(AprError::ZeroVirtualPrice));
    }

    #[test]
    fn non_finite_is_an_error() {
        let mut i = inputs();
        i.crv_price = f64::NAN;
        assert_eq!(min_crv_apr(&i), Err(AprError::NonFinite));
    }

    #[test]
    fn from_reading_copies_chain_values() {
        let reading = GaugeReading {
            inflation_rate: 5.0,
            relative_weight: 0.01,
            working_supply: 1_000_000.0,
            virtual_price: 1.02,
            balances: vec![],
        };
        assert_eq!(AprInputs::from_reading(&reading, 2.0, 1.0), inputs());
    }
}
