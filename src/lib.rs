//! # Funding Hedge Keeper
//!
//! Reconciliation loop for a cross-venue funding-rate arbitrage book.
//!
//! ## Architecture
//!
//! - `config`: Process configuration and runtime tunables
//! - `exchange`: Venue-agnostic adapter trait and the paper venue
//! - `store`: Key-value cache for order books, tunables and open times
//! - `risk`: Per-cycle snapshot of accounts and positions, leverage signals
//! - `strategy`: Rebalancing, decreasing, settlement and order execution
//! - `keeper`: The cycle orchestrator and exposure report
//! - `notify`: Throttled alerts to a webhook channel
//! - `persistence`: SQLite tunables, order journal and equity history
//! - `utils`: Shared decimal arithmetic

pub mod config;
pub mod error;
pub mod exchange;
pub mod keeper;
pub mod notify;
pub mod persistence;
pub mod risk;
pub mod store;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use keeper::{CycleOutcome, Keeper};
