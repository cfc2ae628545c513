//! Venue leverage versus its margin band.

use tracing::debug;

use super::snapshot::RiskSnapshot;
use crate::config::TunableParams;
use crate::exchange::{DecreaseSignal, VenueId};

/// Default decrease signal for a venue.
///
/// Leverage at or above the band's `decrease_percent` asks for a fixed
/// fraction cut; at or above `decrease` it asks for a spread-gated cut. A
/// venue without equity never signals.
pub fn leverage_signal(
    name: &str,
    venue: VenueId,
    snapshot: &RiskSnapshot,
    tunables: &TunableParams,
) -> DecreaseSignal {
    let Some(leverage) = snapshot.leverage(venue) else {
        return DecreaseSignal::None;
    };
    let band = tunables.margin_band(name);

    let signal = if leverage >= band.decrease_percent {
        DecreaseSignal::DecreasePercent(tunables.decrease_percent)
    } else if leverage >= band.decrease {
        DecreaseSignal::Decrease
    } else {
        DecreaseSignal::None
    };

    if signal != DecreaseSignal::None {
        debug!(
            venue = %name,
            leverage = %leverage.round_dp(4),
            decrease_at = %band.decrease,
            percent_at = %band.decrease_percent,
            ?signal,
            "Venue above margin band"
        );
    }
    signal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarginBand;
    use crate::exchange::AccountInfo;
    use crate::risk::ExchangeRiskInfo;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn snapshot(equity: Decimal, notional: Decimal) -> RiskSnapshot {
        let mut accounts = BTreeMap::new();
        accounts.insert(
            VenueId(0),
            AccountInfo {
                equity,
                available: equity,
            },
        );
        let mut exposure = BTreeMap::new();
        let mut info = ExchangeRiskInfo::default();
        info.record(crate::exchange::Direction::Long, notional);
        exposure.insert(VenueId(0), info);
        RiskSnapshot {
            accounts,
            total_equity: equity,
            rows: BTreeMap::new(),
            exposure,
            taken_at: Utc::now(),
        }
    }

    #[test]
    fn test_signal_follows_band() {
        let tunables = TunableParams::default();
        let low = snapshot(dec!(10000), dec!(20000));
        let mid = snapshot(dec!(10000), dec!(30000));
        let high = snapshot(dec!(10000), dec!(45000));

        assert_eq!(leverage_signal("BINANCE", VenueId(0), &low, &tunables), DecreaseSignal::None);
        assert_eq!(leverage_signal("BINANCE", VenueId(0), &mid, &tunables), DecreaseSignal::Decrease);
        assert_eq!(
            leverage_signal("BINANCE", VenueId(0), &high, &tunables),
            DecreaseSignal::DecreasePercent(dec!(0.2))
        );
    }

    #[test]
    fn test_per_venue_band_overrides_default() {
        let mut tunables = TunableParams::default();
        tunables.margin_ratios.insert(
            "OKX".to_string(),
            MarginBand {
                decrease: dec!(1.5),
                decrease_percent: dec!(2),
            },
        );
        let snap = snapshot(dec!(10000), dec!(20000));

        assert_eq!(leverage_signal("OKX", VenueId(0), &snap, &tunables), DecreaseSignal::DecreasePercent(dec!(0.2)));
        assert_eq!(leverage_signal("BINANCE", VenueId(0), &snap, &tunables), DecreaseSignal::None);
    }

    #[test]
    fn test_zero_equity_never_signals() {
        let snap = snapshot(Decimal::ZERO, dec!(20000));
        assert_eq!(
            leverage_signal("BINANCE", VenueId(0), &snap, &TunableParams::default()),
            DecreaseSignal::None
        );
    }
}
