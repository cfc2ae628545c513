//! Exchange integration surface.
//!
//! Real venue clients live outside this crate and implement
//! [`ExchangeAdapter`]. The bundled [`MockExchange`] is an in-memory venue used
//! for paper runs and tests.

pub mod mock;
mod traits;
mod types;

pub use mock::MockExchange;
pub use traits::{ExchangeAdapter, VenueId, VenueSet};
pub use types::*;
