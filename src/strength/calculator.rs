//! Relative strength calculator
//!
//! Scores how a subject series moved against the reference series over the
//! lookback window. Each period's return ratio is saturated to `[0, 2]`
//! (1.0 = moved with the reference) and the ratios are folded into an EMA.
//!
//! All arithmetic stays in `Decimal` until the final narrowing to `f64`.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Number of 10-minute points in one strength window (2 hours)
pub const LOOKBACK_PERIODS: usize = 12;

/// Reference returns smaller than this (in absolute value) count as flat
pub fn flat_threshold() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}

/// EMA smoothing factor: 2 / (LOOKBACK_PERIODS + 1)
pub fn ema_alpha() -> Decimal {
    Decimal::TWO / Decimal::from(LOOKBACK_PERIODS + 1)
}

/// Compute the relative strength of `subject` against `reference`
///
/// Both slices are ordered oldest to newest. Only the last `LOOKBACK_PERIODS`
/// points of each are used.
///
/// Returns `None` when:
/// - either series has fewer than `LOOKBACK_PERIODS` points
/// - any adjacent pair in either series contains a zero price
///
/// Otherwise the result is in `[0.0, 2.0]`.
pub fn compute_strength(subject: &[Decimal], reference: &[Decimal]) -> Option<f64> {
    if subject.len() < LOOKBACK_PERIODS || reference.len() < LOOKBACK_PERIODS {
        return None;
    }

    let subject = &subject[subject.len() - LOOKBACK_PERIODS..];
    let reference = &reference[reference.len() - LOOKBACK_PERIODS..];

    let subject_returns = period_returns(subject)?;
    let reference_returns = period_returns(reference)?;

    let ratios: Vec<Decimal> = subject_returns
        .iter()
        .zip(reference_returns.iter())
        .map(|(s, r)| period_ratio(*s, *r))
        .collect::<Option<Vec<_>>>()?;

    seeded_ema(&ratios)?.to_f64()
}

/// Fractional returns between consecutive prices
///
/// `None` if either side of any pair is zero.
fn period_returns(prices: &[Decimal]) -> Option<Vec<Decimal>> {
    prices
        .windows(2)
        .map(|pair| {
            let (prev, curr) = (pair[0], pair[1]);
            if prev.is_zero() || curr.is_zero() {
                return None;
            }
            (curr - prev).checked_div(prev)
        })
        .collect()
}

/// Ratio of one period's subject return to the reference return, clamped to [0, 2]
fn period_ratio(subject_return: Decimal, reference_return: Decimal) -> Option<Decimal> {
    let ratio = if reference_return.abs() < flat_threshold() {
        Decimal::ONE
    } else if reference_return > Decimal::ZERO {
        subject_return.checked_div(reference_return)?
    } else {
        Decimal::TWO - subject_return.checked_div(reference_return)?.abs()
    };

    Some(ratio.clamp(Decimal::ZERO, Decimal::TWO))
}

/// EMA over `values`, seeded with their simple mean
fn seeded_ema(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }

    let alpha = ema_alpha();
    let keep = Decimal::ONE - alpha;

    let sum: Decimal = values.iter().copied().sum();
    let mut ema = sum.checked_div(Decimal::from(values.len()))?;

    for value in values {
        ema = *value * alpha + ema * keep;
    }

    Some(ema)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prices(values: &[i64]) -> Vec<Decimal> {
        values.iter().map(|v| Decimal::from(*v)).collect()
    }

    fn rising_reference() -> Vec<Decimal> {
        prices(&[100, 101, 102, 103, 104, 105, 106, 107, 108, 109, 110, 111])
    }

    #[test]
    fn test_identical_series_is_neutral() {
        let reference = rising_reference();
        let strength = compute_strength(&reference, &reference).unwrap();
        assert_eq!(strength, 1.0);
    }

    #[test]
    fn test_flat_subject_against_rising_reference() {
        // Every subject return is 0 → every ratio 0 → seed 0 → EMA 0
        let subject = prices(&[50; 12]);
        let strength = compute_strength(&subject, &rising_reference()).unwrap();
        assert_eq!(strength, 0.0);
    }

    #[test]
    fn test_flat_reference_yields_exactly_one() {
        let reference = prices(&[200; 12]);
        let subject = prices(&[10, 20, 5, 40, 1, 3, 9, 27, 81, 2, 4, 8]);
        assert_eq!(compute_strength(&subject, &reference), Some(1.0));
    }

    #[test]
    fn test_sub_threshold_reference_moves_count_as_flat() {
        // 100000 → 100009 is a 0.00009 return, below the 0.0001 threshold
        let reference = prices(&[
            100000, 100009, 100018, 100027, 100036, 100045, 100054, 100063, 100072, 100081,
            100090, 100099,
        ]);
        let subject = prices(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(compute_strength(&subject, &reference), Some(1.0));
    }

    #[test]
    fn test_outperforming_subject_hand_computed() {
        // subject = 100 + 2i, reference = 100 + i
        // ratio_i = 2(100+i-1)/(100+2(i-1)), first ratio clamps at 2.0
        let subject = prices(&[100, 102, 104, 106, 108, 110, 112, 114, 116, 118, 120, 122]);
        let strength = compute_strength(&subject, &rising_reference()).unwrap();
        assert!((strength - 1.890_241_623_266_099).abs() < 1e-12, "got {}", strength);
    }

    #[test]
    fn test_mixed_subject_hand_computed() {
        let subject = prices(&[10, 11, 10, 12, 12, 11, 13, 14, 13, 15, 16, 15]);
        let strength = compute_strength(&subject, &rising_reference()).unwrap();
        assert!((strength - 1.084_268_307_156_821).abs() < 1e-12, "got {}", strength);
    }

    #[test]
    fn test_single_jump_hand_computed() {
        // Only period 6 moves (100 → 110), ratio saturates at 2.0, all others 0
        let subject = prices(&[100, 100, 100, 100, 100, 100, 110, 110, 110, 110, 110, 110]);
        let strength = compute_strength(&subject, &rising_reference()).unwrap();
        assert!((strength - 0.162_409_171_602_299_6).abs() < 1e-12, "got {}", strength);
    }

    #[test]
    fn test_falling_reference_mirrors_ratio() {
        // Subject falls by the same fraction as the reference each period → 2 - 1 = 1
        let reference = prices(&[200, 198, 196, 194, 192, 190, 188, 186, 184, 182, 180, 178]);
        let subject = prices(&[100, 99, 98, 97, 96, 95, 94, 93, 92, 91, 90, 89]);
        let strength = compute_strength(&subject, &reference).unwrap();
        assert!((strength - 1.0).abs() < 1e-12, "got {}", strength);
    }

    #[test]
    fn test_flat_subject_against_falling_reference_saturates_high() {
        let reference = prices(&[200, 198, 196, 194, 192, 190, 188, 186, 184, 182, 180, 178]);
        let subject = prices(&[7; 12]);
        assert_eq!(compute_strength(&subject, &reference), Some(2.0));
    }

    #[test]
    fn test_short_series_is_undefined() {
        let reference = rising_reference();
        let short = prices(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(compute_strength(&short, &reference), None);
        assert_eq!(compute_strength(&reference, &short), None);
        assert_eq!(compute_strength(&[], &[]), None);
    }

    #[test]
    fn test_zero_price_is_undefined() {
        let reference = rising_reference();
        let mut subject = rising_reference();
        subject[5] = Decimal::ZERO;
        assert_eq!(compute_strength(&subject, &reference), None);

        // Zero in the newest reference point
        let mut reference_with_zero = rising_reference();
        reference_with_zero[11] = Decimal::ZERO;
        assert_eq!(compute_strength(&rising_reference(), &reference_with_zero), None);
    }

    #[test]
    fn test_uses_latest_window_when_longer() {
        let mut subject = prices(&[0, 0, 0]);
        subject.extend(rising_reference());
        assert_eq!(compute_strength(&subject, &rising_reference()), Some(1.0));
    }

    #[test]
    fn test_result_always_bounded() {
        let reference = rising_reference();
        let wild = prices(&[1, 1000, 2, 5000, 3, 1, 99999, 4, 8, 2, 1, 700]);
        let strength = compute_strength(&wild, &reference).unwrap();
        assert!((0.0..=2.0).contains(&strength));

        let strength = compute_strength(&reference, &wild).unwrap();
        assert!((0.0..=2.0).contains(&strength));
    }
}
