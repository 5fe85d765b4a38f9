//! apr-data crate

pub mod chain;
pub mod error;
pub mod memo;
pub mod prices;
pub mod registry;
pub mod retry;
pub mod sampler;
pub mod store;
pub mod types;

pub use error::{is_fatal, FatalError};
pub use types::{AssetType, CoinInfo, GaugeReading, PoolInfo, SamplePoint};
