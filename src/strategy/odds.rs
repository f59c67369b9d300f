//! Odds arithmetic.
//!
//! American → decimal conversion, implied probability and money rounding.
//! Every conversion validates its input so that a zero price never turns
//! into NaN or infinity further down the pipeline.

use rust_decimal::prelude::*;

use crate::types::SharplineError;

/// Convert American odds to decimal odds.
///
/// `+150` → 2.5, `-120` → 1.8333. Zero is not a valid American price.
pub fn american_to_decimal(price: i32) -> Result<f64, SharplineError> {
    let decimal = match price {
        0 => {
            return Err(SharplineError::ArithmeticDegenerate(
                "American price of 0".to_string(),
            ))
        }
        p if p > 0 => 1.0 + p as f64 / 100.0,
        p => 1.0 + 100.0 / (p as f64).abs(),
    };

    if !decimal.is_finite() || decimal <= 1.0 {
        return Err(SharplineError::ArithmeticDegenerate(format!(
            "price {price} converts to decimal {decimal}"
        )));
    }
    Ok(decimal)
}

/// Implied probability (0.0–1.0) of a decimal price.
pub fn implied_probability(decimal_odds: f64) -> f64 {
    1.0 / decimal_odds
}

/// Round a money amount to cents.
pub fn round_cents(amount: f64) -> f64 {
    Decimal::from_f64(amount)
        .map(|d| d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|d| d.to_f64())
        .unwrap_or(amount)
}

/// Truncate a money amount to whole cents, never rounding up.
pub fn floor_cents(amount: f64) -> f64 {
    Decimal::from_f64(amount)
        .map(|d| d.round_dp_with_strategy(2, RoundingStrategy::ToZero))
        .and_then(|d| d.to_f64())
        .unwrap_or(0.0)
}

/// Split `budget` into two cent-aligned stakes, the first as close as
/// possible to `share` of it. The pair never adds up to more than `budget`.
pub fn split_stake(budget: f64, share: f64) -> (f64, f64) {
    let (Some(budget), Some(first)) = (Decimal::from_f64(budget), Decimal::from_f64(budget * share))
    else {
        return (0.0, 0.0);
    };
    let cap = budget
        .round_dp_with_strategy(2, RoundingStrategy::ToZero)
        .max(Decimal::ZERO);
    let first = first
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        .clamp(Decimal::ZERO, cap);
    let second = cap - first;
    (
        first.to_f64().unwrap_or(0.0),
        second.to_f64().unwrap_or(0.0),
    )
}

/// Render a line value with an explicit sign, e.g. `+3.5`, `-7`.
pub fn format_point(point: f64) -> String {
    if point > 0.0 {
        format!("+{point}")
    } else {
        format!("{point}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
