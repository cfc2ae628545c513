//! Typed failures of corrective order execution.
//!
//! Data-side problems (missing books, missing prices) never surface as errors;
//! they are logged and the affected token is skipped. Execution problems do,
//! because a one-sided hedge is worse than no trade at all.

use rust_decimal::Decimal;
use thiserror::Error;

/// Execution-related errors with structured variants.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("order rejected on {venue} {symbol}: {reason}")]
    Rejected {
        venue: String,
        symbol: String,
        reason: String,
    },

    #[error("order {order_id} on {venue} {symbol} not completed after {attempts} polls")]
    Timeout {
        venue: String,
        symbol: String,
        order_id: String,
        attempts: u32,
    },

    #[error("status query for order {order_id} on {venue} failed: {reason}")]
    QueryFailed {
        venue: String,
        order_id: String,
        reason: String,
    },

    #[error("one-sided fill on {token}: {filled_venue} filled {quantity}, {failed_venue} did not")]
    OneSided {
        token: String,
        filled_venue: String,
        failed_venue: String,
        quantity: Decimal,
    },

    #[error("{failed} of {total} {phase} orders failed")]
    BatchFailed {
        phase: &'static str,
        failed: usize,
        total: usize,
    },
}
