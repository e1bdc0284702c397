//! Kelly Criterion sizing on decimal prices.
//!
//! The Kelly formula sizes a bet to maximise the expected logarithm of wealth.
//!
//! Standard formula:
//!   f* = (b·p − q) / b
//! where
//!   b  = net odds received on the bet (profit per unit staked, i.e. price − 1)
//!   p  = estimated probability of winning
//!   q  = 1 − p
//!
//! The multiplier applied on top (fractional Kelly) shrinks as the losing
//! streak and the drawdown grow; see [`adaptive_fraction`].

/// Full-Kelly stake fraction for a decimal price.
///
/// Returns `0.0` when the price is not above 1 or the bet has no edge.
pub fn kelly_fraction(win_prob: f64, price: f64) -> f64 {
    debug_assert!((0.0..=1.0).contains(&win_prob), "win_prob out of range");

    if price <= 1.0 {
        return 0.0;
    }

    // Net odds per unit staked (e.g. price=2.5 → b=1.5)
    let b = price - 1.0;
    let p = win_prob;
    let q = 1.0 - p;

    let f = (b * p - q) / b;

    if f <= 0.0 {
        return 0.0; // no edge
    }
    f.min(1.0)
}

/// Expected profit per unit staked.
///
/// Edge = win_prob × price − 1
pub fn edge(win_prob: f64, price: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    win_prob * price - 1.0
}

/// Fractional Kelly multiplier after risk reduction.
///
/// * streak ≥ 5 halves it, 3–4 takes it to three quarters.
/// * drawdown > 15% halves it again, > 10% takes it to three quarters.
pub fn adaptive_fraction(base: f64, losing_streak: u32, drawdown: f64) -> f64 {
    let mut fraction = base;

    if losing_streak >= 5 {
        fraction *= 0.5;
    } else if losing_streak >= 3 {
        fraction *= 0.75;
    }

    if drawdown > 0.15 {
        fraction *= 0.5;
    } else if drawdown > 0.10 {
        fraction *= 0.75;
    }

    fraction
}

/// Round a stake down to whole cents. The epsilon keeps values such as
/// `40.0` (stored as `39.999…`) from dropping a cent.
pub fn floor_to_cents(amount: f64) -> f64 {
    ((amount * 100.0) + 1e-9).floor() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_kelly_no_edge() {
        // Price equals fair odds, edge = 0, stake = 0
        assert_relative_eq!(kelly_fraction(0.5, 2.0), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_kelly_positive_edge() {
        // b = 1.0, p = 0.6, q = 0.4 → f = (1*0.6 - 0.4)/1 = 0.2
        assert_relative_eq!(kelly_fraction(0.6, 2.0), 0.2, epsilon = 1e-9);
    }

    #[test]
    fn test_kelly_negative_edge() {
        assert_relative_eq!(kelly_fraction(0.3, 2.0), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_kelly_price_at_or_below_one() {
        assert_relative_eq!(kelly_fraction(0.9, 1.0), 0.0, epsilon = 1e-9);
        assert_relative_eq!(kelly_fraction(0.9, 0.5), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_edge_calculation() {
        // 55% at 2.10 → 15.5% edge
        assert_relative_eq!(edge(0.55, 2.10), 0.155, epsilon = 1e-9);
        assert!(edge(0.3, 2.0) < 0.0);
    }

    #[test]
    fn test_adaptive_fraction_streak_and_drawdown() {
        assert_relative_eq!(adaptive_fraction(0.2, 0, 0.0), 0.2, epsilon = 1e-12);
        assert_relative_eq!(adaptive_fraction(0.2, 3, 0.0), 0.15, epsilon = 1e-12);
        assert_relative_eq!(adaptive_fraction(0.2, 5, 0.0), 0.1, epsilon = 1e-12);
        assert_relative_eq!(adaptive_fraction(0.2, 0, 0.12), 0.15, epsilon = 1e-12);
        assert_relative_eq!(adaptive_fraction(0.2, 6, 0.20), 0.05, epsilon = 1e-12);
    }

    #[test]
    fn test_adaptive_fraction_is_monotone() {
        let mut last = f64::MAX;
        for streak in 0..8 {
            let f = adaptive_fraction(0.2, streak, 0.0);
            assert!(f <= last);
            last = f;
        }
    }

    #[test]
    fn test_floor_to_cents() {
        assert_relative_eq!(floor_to_cents(40.0), 40.0, epsilon = 1e-12);
        assert_relative_eq!(floor_to_cents(12.349), 12.34, epsilon = 1e-12);
        assert_relative_eq!(floor_to_cents(0.2 * 0.2 * 1000.0), 40.0, epsilon = 1e-12);
    }
}
