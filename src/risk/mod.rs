//! Risk aggregation across venues.
//!
//! - [`RiskAggregator`]: builds a fresh [`RiskSnapshot`] every cycle
//! - [`leverage_signal`]: venue leverage against its margin band

mod aggregator;
mod signal;
mod snapshot;

pub use aggregator::RiskAggregator;
pub use signal::leverage_signal;
pub use snapshot::{ExchangePosition, ExchangeRiskInfo, RiskSnapshot, TokenPositionRow};
