//! Direction-aware spread between two venues' top of book.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::exchange::{Direction, OrderBook};

/// Spread in basis points for trading `direction` on the base venue and the
/// inverse on the quote venue.
///
/// `Long` buys the base ask and sells the quote bid; `Short` sells the base
/// bid and buys the quote ask. Returns `None` when a book is missing, a side
/// is empty, or the prices do not sum to a positive value.
pub fn price_delta(
    direction: Direction,
    base: Option<&OrderBook>,
    quote: Option<&OrderBook>,
) -> Option<Decimal> {
    let (base, quote) = (base?, quote?);
    let (sell_price, buy_price) = match direction {
        Direction::Long => (quote.best_bid()?, base.best_ask()?),
        Direction::Short => (base.best_bid()?, quote.best_ask()?),
    };

    let sum = sell_price + buy_price;
    if sum <= Decimal::ZERO {
        return None;
    }
    Some((sell_price - buy_price) / sum * dec!(2) * dec!(10000))
}
