//! Keeps every open position at the target leverage.

use tracing::{debug, info, warn};

use crate::exchange::VenueSet;
use crate::risk::RiskSnapshot;

/// Drifts per-symbol leverage back to a fixed target, best effort.
pub struct LeverageSync {
    venues: VenueSet,
    target: u32,
}

impl LeverageSync {
    pub fn new(venues: VenueSet, target: u32) -> Self {
        Self { venues, target }
    }

    /// Issue a leverage update for every position off target. Returns the
    /// number of successful updates; failures are logged and skipped.
    pub async fn sync(&self, snapshot: &RiskSnapshot) -> usize {
        let mut updated = 0;
        for row in snapshot.rows.values() {
            for (venue, position) in &row.positions {
                if position.leverage == self.target {
                    continue;
                }
                let Some(adapter) = self.venues.get(*venue) else {
                    continue;
                };
                let Some(symbol) = adapter.exchange_symbol(&row.token) else {
                    warn!(token = %row.token, venue = %adapter.name(), "No symbol for leverage sync");
                    continue;
                };

                match adapter.ensure_leverage(&symbol, self.target).await {
                    Ok(()) => {
                        debug!(
                            venue = %adapter.name(),
                            %symbol,
                            from = position.leverage,
                            to = self.target,
                            "Leverage synced"
                        );
                        updated += 1;
                    }
                    Err(e) => {
                        warn!(venue = %adapter.name(), %symbol, error = %e, "Leverage sync failed");
                    }
                }
            }
        }
        if updated > 0 {
            info!(updated, target = self.target, "Leverage synchronized");
        }
        updated
    }
}
