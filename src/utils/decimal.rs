//! Decimal arithmetic utilities for price and quantity math.

use rust_decimal::Decimal;

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size <= Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Snap a quantity onto a venue grid: floor to `step_size`, and drop it to
/// zero when the result is below `min_qty`.
pub fn snap_quantity(quantity: Decimal, min_qty: Decimal, step_size: Decimal) -> Decimal {
    if quantity <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let snapped = round_down_to_lot(quantity, step_size);
    if snapped < min_qty || snapped <= Decimal::ZERO {
        Decimal::ZERO
    } else {
        snapped.normalize()
    }
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Clamp `value` into `[low, high]`.
pub fn clamp(value: Decimal, low: Decimal, high: Decimal) -> Decimal {
    value.max(low).min(high)
}
