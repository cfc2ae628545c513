//! Decision components of the reconciliation cycle.

pub mod executor;
pub mod funding;
pub mod leverage;
pub mod pair;
pub mod price_delta;
pub mod rebalancer;
pub mod reducer;
pub mod settlement;

pub use executor::{OrderExecutor, OrderIntent, PairFill};
pub use funding::{FundingAggregator, FundingFeeRow};
pub use leverage::LeverageSync;
pub use price_delta::price_delta;
pub use rebalancer::{HedgeRebalancer, RebalancePlan};
pub use reducer::{PositionReducer, ReducePass, ReduceSelection};
pub use settlement::{SettledPair, SettlementEngine};
