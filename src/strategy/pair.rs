//! Market data for one hedged venue pair.

use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::executor::OrderIntent;
use super::price_delta::price_delta;
use crate::exchange::{Direction, ExchangeAdapter, OrderBook, QtyFilter, VenueId, VenueSet};
use crate::risk::ExchangePosition;
use crate::store::OrderBookCache;

/// Books and the shared quantity filter of a `(base, quote)` pair.
#[derive(Debug, Clone)]
pub struct PairMarket {
    pub token: String,
    pub base: VenueId,
    pub quote: VenueId,
    pub base_symbol: String,
    pub quote_symbol: String,
    pub base_book: Option<OrderBook>,
    pub quote_book: Option<OrderBook>,
    /// Strictest of both venues' filters
    pub filter: Option<QtyFilter>,
}

impl PairMarket {
    /// Fetch both books and both filters concurrently.
    pub async fn load(
        venues: &VenueSet,
        books: &OrderBookCache,
        token: &str,
        (base, base_leg): (VenueId, &ExchangePosition),
        (quote, quote_leg): (VenueId, &ExchangePosition),
    ) -> Option<Self> {
        let base_adapter = venues.get(base)?;
        let quote_adapter = venues.get(quote)?;

        let (base_book, quote_book, base_filter, quote_filter) = tokio::join!(
            fetch_book(books, base_adapter.as_ref(), token),
            fetch_book(books, quote_adapter.as_ref(), token),
            base_adapter.qty_filter(&base_leg.symbol),
            quote_adapter.qty_filter(&quote_leg.symbol),
        );

        let filter = match (base_filter, quote_filter) {
            (Ok(b), Ok(q)) => Some(b.merge(&q)),
            (Err(e), _) | (_, Err(e)) => {
                warn!(%token, error = %e, "Quantity filter unavailable");
                None
            }
        };

        Some(Self {
            token: token.to_string(),
            base,
            quote,
            base_symbol: base_leg.symbol.clone(),
            quote_symbol: quote_leg.symbol.clone(),
            base_book,
            quote_book,
            filter,
        })
    }

    /// Live spread for trading `direction` on the base venue.
    pub fn delta(&self, direction: Direction) -> Option<Decimal> {
        price_delta(direction, self.base_book.as_ref(), self.quote_book.as_ref())
    }

    /// Top base-venue price an order in `direction` would take. Missing,
    /// empty or non-positive tops are `None`.
    pub fn base_price(&self, direction: Direction) -> Option<Decimal> {
        self.base_book
            .as_ref()?
            .top_for(direction.side())
            .filter(|p| *p > Decimal::ZERO)
    }

    /// Snap `quantity` to the pair filter and build the intent; zero after
    /// snapping is `None`.
    pub fn intent(&self, direction: Direction, quantity: Decimal) -> Option<OrderIntent> {
        let filter = self.filter?;
        let snapped = filter.snap(quantity);
        if snapped == Decimal::ZERO {
            debug!(token = %self.token, qty = %quantity, min_qty = %filter.min_qty, "Quantity below pair minimum");
            return None;
        }
        Some(OrderIntent {
            token: self.token.clone(),
            base: self.base,
            quote: self.quote,
            base_symbol: self.base_symbol.clone(),
            quote_symbol: self.quote_symbol.clone(),
            direction,
            quantity: snapped,
        })
    }
}

async fn fetch_book(books: &OrderBookCache, adapter: &dyn ExchangeAdapter, token: &str) -> Option<OrderBook> {
    let symbol = adapter.orderbook_symbol(token)?;
    books.get(adapter.name(), &symbol).await
}
