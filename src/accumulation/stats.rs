//! Robust statistics over per-whale deltas and balances.
//!
//! Everything here is pure and exact: Decimal for percentage populations,
//! integer Gwei for the Gini accumulations (inequality is scale-invariant,
//! and Gwei keeps the weighted sums inside Decimal's 28 significant digits).

use alloy_primitives::U256;
use rust_decimal::Decimal;

/// Median of a population. `None` on empty input.
pub fn median(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / Decimal::TWO)
    }
}

/// Median absolute deviation around `center`.
pub fn mad(values: &[Decimal], center: Decimal) -> Option<Decimal> {
    let deviations: Vec<Decimal> = values.iter().map(|v| (*v - center).abs()).collect();
    median(&deviations)
}

/// Gini coefficient over a population of Wei balances, zeros allowed.
///
/// With balances sorted ascending and i zero-based:
/// `gini = | 2·Σ (i+1)·b_i / (n·Σ b_i) − (n+1)/n |`
///
/// `None` when the population is empty or sums to zero.
pub fn gini(balances: &[U256]) -> Option<Decimal> {
    if balances.is_empty() {
        return None;
    }

    const WEI_PER_GWEI: u64 = 1_000_000_000;
    let mut scaled: Vec<Decimal> = balances
        .iter()
        .map(|b| {
            let gwei = b / U256::from(WEI_PER_GWEI);
            Decimal::from_str_exact(&gwei.to_string()).unwrap_or(Decimal::MAX)
        })
        .collect();
    scaled.sort();

    let n = Decimal::from(scaled.len());
    let total: Decimal = scaled.iter().sum();
    if total.is_zero() {
        return None;
    }

    let weighted: Decimal = scaled
        .iter()
        .enumerate()
        .map(|(i, b)| Decimal::from(i as u64 + 1) * b)
        .sum();

    let lorenz = Decimal::TWO * weighted / (n * total);
    let correction = (n + Decimal::ONE) / n;
    Some((lorenz - correction).abs())
}
