//! apr-analysis crate
//!
//! CRV APR formula, pool asset pricing, the day-by-day history loop and
//! its CSV report.

pub mod apr;
pub mod history;
pub mod pricing;
pub mod report;
