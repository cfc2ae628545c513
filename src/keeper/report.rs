//! Exposure summary for the report cycle.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fmt;

use crate::config::TunableParams;
use crate::exchange::VenueSet;
use crate::risk::RiskSnapshot;
use crate::utils::decimal::safe_div;

/// One venue's line in the report.
#[derive(Debug, Clone, PartialEq)]
pub struct VenueExposure {
    pub name: String,
    pub equity: Decimal,
    pub leverage: Decimal,
    pub long_notional: Decimal,
    pub short_notional: Decimal,
    pub tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExposureReport {
    pub total_equity: Decimal,
    pub gross_notional: Decimal,
    /// Gross notional over investor capital
    pub utilization: Decimal,
    pub venues: Vec<VenueExposure>,
    /// Tokens whose notional exceeds `max_usd_per_token`
    pub oversized: Vec<(String, Decimal)>,
}

impl ExposureReport {
    pub fn build(snapshot: &RiskSnapshot, venues: &VenueSet, tunables: &TunableParams) -> Self {
        let venue_lines = venues
            .iter()
            .map(|(id, adapter)| {
                let info = snapshot.exposure.get(&id).copied().unwrap_or_default();
                VenueExposure {
                    name: adapter.name().to_string(),
                    equity: snapshot.accounts.get(&id).map_or(Decimal::ZERO, |a| a.equity),
                    leverage: snapshot.leverage(id).unwrap_or(Decimal::ZERO),
                    long_notional: info.positive_notional,
                    short_notional: info.negative_notional,
                    tokens: info.token_count,
                }
            })
            .collect();

        let oversized = snapshot
            .rows
            .values()
            .filter(|row| row.notional > tunables.max_usd_per_token)
            .map(|row| (row.token.clone(), row.notional))
            .collect();

        let gross_notional = snapshot.gross_notional();
        Self {
            total_equity: snapshot.total_equity,
            gross_notional,
            utilization: safe_div(gross_notional, tunables.investor_capital),
            venues: venue_lines,
            oversized,
        }
    }
}

impl fmt::Display for ExposureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "[REPORT] equity ${} | gross ${} | utilization {}%",
            self.total_equity.round_dp(2),
            self.gross_notional.round_dp(2),
            (self.utilization * dec!(100)).round_dp(1)
        )?;
        for venue in &self.venues {
            writeln!(
                f,
                "  {}: equity ${} lev {}x long ${} short ${} tokens {}",
                venue.name,
                venue.equity.round_dp(2),
                venue.leverage.round_dp(2),
                venue.long_notional.round_dp(2),
                venue.short_notional.round_dp(2),
                venue.tokens
            )?;
        }
        for (token, notional) in &self.oversized {
            writeln!(f, "  over cap: {} ${}", token, notional.round_dp(2))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchange;
    use crate::risk::RiskAggregator;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_report_flags_oversized_tokens() {
        let a = Arc::new(MockExchange::new("BINANCE"));
        let b = Arc::new(MockExchange::new("OKX"));
        a.set_position("BTC", dec!(1), 5).await;
        b.set_position("BTC", dec!(-1), 5).await;
        a.set_index_price("BTC", dec!(30000)).await;
        let venues = VenueSet::new(vec![a, b]);
        let snapshot = RiskAggregator::new(venues.clone()).snapshot().await.unwrap();

        let report = ExposureReport::build(&snapshot, &venues, &TunableParams::default());

        assert_eq!(report.total_equity, dec!(20000));
        assert_eq!(report.gross_notional, dec!(60000));
        assert_eq!(report.utilization, dec!(0.6));
        assert_eq!(report.venues[1].leverage, dec!(3));
        assert_eq!(report.oversized, vec![("BTC".to_string(), dec!(60000))]);
        let text = report.to_string();
        assert!(text.contains("OKX: equity $10000"));
        assert!(text.contains("over cap: BTC"));
    }
}
