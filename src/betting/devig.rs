//! Margin removal: turn a bookmaker's decimal prices into fair probabilities.
//!
//! All four methods start from implied probabilities `1/price` whose sum (the
//! overround) exceeds 1 by the bookmaker's margin:
//! - **Basic** / **Multiplicative**: scale proportionally to sum to 1.
//! - **Power**: find `k ≥ 1` with `Σ implied^k = 1`; shifts more margin onto
//!   longshots.
//! - **Shin**: models a share `z` of insider money; fair probabilities are
//!   `(√(z² + 4(1−z)·p²/O) − z) / (2(1−z))`, renormalised.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::OutcomeMap;

const POWER_MAX_ITERATIONS: usize = 100;
const POWER_TOLERANCE: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DevigMethod {
    Basic,
    Multiplicative,
    Power,
    Shin,
}

/// Implied probability per outcome; non-positive prices are dropped.
pub fn implied(prices: &OutcomeMap) -> OutcomeMap {
    prices
        .iter()
        .filter(|(_, &price)| price > 0.0)
        .map(|(&o, &price)| (o, 1.0 / price))
        .collect()
}

/// `Σ 1/price` over positive prices.
pub fn overround(prices: &OutcomeMap) -> f64 {
    implied(prices).values().sum()
}

fn normalize(probs: OutcomeMap) -> OutcomeMap {
    let total: f64 = probs.values().sum();
    if total <= 0.0 {
        return probs;
    }
    probs.into_iter().map(|(o, p)| (o, p / total)).collect()
}

fn basic(implied: OutcomeMap) -> OutcomeMap {
    normalize(implied)
}

fn power(implied: OutcomeMap) -> OutcomeMap {
    let sum_pow = |k: f64| implied.values().map(|p| p.powf(k)).sum::<f64>();

    let mut lo = 1.0;
    let mut hi = 5.0;
    while sum_pow(hi) > 1.0 && hi < 1e6 {
        hi *= 2.0;
    }
    if sum_pow(hi) > 1.0 {
        return basic(implied);
    }

    let mut k = lo;
    for _ in 0..POWER_MAX_ITERATIONS {
        k = (lo + hi) / 2.0;
        let s = sum_pow(k);
        if (s - 1.0).abs() < POWER_TOLERANCE {
            break;
        }
        // Σ p^k decreases in k for p < 1
        if s > 1.0 {
            lo = k;
        } else {
            hi = k;
        }
    }

    normalize(implied.iter().map(|(&o, &p)| (o, p.powf(k))).collect())
}

fn shin(implied: OutcomeMap, total: f64) -> OutcomeMap {
    let n = implied.len() as f64;
    let z = (total - 1.0) / (n - 1.0);
    if z >= 1.0 {
        return basic(implied);
    }

    let fair: Option<OutcomeMap> = implied
        .iter()
        .map(|(&o, &p)| {
            let discriminant = z * z + 4.0 * (1.0 - z) * p * p / total;
            (discriminant >= 0.0).then(|| (o, (discriminant.sqrt() - z) / (2.0 * (1.0 - z))))
        })
        .collect();
    match fair {
        Some(fair) => normalize(fair),
        None => basic(implied),
    }
}

/// Fair probabilities for one market's prices.
///
/// Fewer than two usable prices fall back to Basic. With no margin
/// (overround ≤ 1) Shin returns the raw implied probabilities and Power
/// falls back to Basic.
pub fn devig(prices: &OutcomeMap, method: DevigMethod) -> OutcomeMap {
    let implied = implied(prices);
    if implied.len() < 2 {
        return basic(implied);
    }
    let total: f64 = implied.values().sum();

    let fair = match method {
        DevigMethod::Basic | DevigMethod::Multiplicative => basic(implied),
        DevigMethod::Power if total <= 1.0 => basic(implied),
        DevigMethod::Power => power(implied),
        DevigMethod::Shin if total <= 1.0 => implied,
        DevigMethod::Shin => shin(implied, total),
    };
    debug!("devig {:?}: overround={:.4} -> {:?}", method, total, fair);
    fair
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Outcome;
    use approx::assert_relative_eq;

    fn prices(home: f64, draw: f64, away: f64) -> OutcomeMap {
        OutcomeMap::from([(Outcome::Home, home), (Outcome::Draw, draw), (Outcome::Away, away)])
    }

    #[test]
    fn every_method_sums_to_one() {
        let p = prices(2.10, 3.40, 3.60);
        for method in [DevigMethod::Basic, DevigMethod::Multiplicative, DevigMethod::Power, DevigMethod::Shin] {
            let fair = devig(&p, method);
            assert_eq!(fair.len(), 3);
            assert_relative_eq!(fair.values().sum::<f64>(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn basic_is_proportional() {
        let fair = devig(&prices(2.0, 4.0, 4.0), DevigMethod::Basic);
        // implied 0.5 / 0.25 / 0.25 already sums to 1
        assert_relative_eq!(fair[&Outcome::Home], 0.5, epsilon = 1e-12);
        let fair = devig(&prices(1.90, 3.80, 3.80), DevigMethod::Multiplicative);
        assert_relative_eq!(fair[&Outcome::Home], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn power_and_shin_shift_margin_onto_longshots() {
        let p = prices(1.25, 6.0, 11.0);
        let basic = devig(&p, DevigMethod::Basic);
        let power = devig(&p, DevigMethod::Power);
        let shin = devig(&p, DevigMethod::Shin);

        // Favourite keeps more probability than under Basic, longshot less.
        assert!(power[&Outcome::Home] > basic[&Outcome::Home]);
        assert!(shin[&Outcome::Home] > basic[&Outcome::Home]);
        assert!(power[&Outcome::Away] < basic[&Outcome::Away]);
        assert!(shin[&Outcome::Away] < basic[&Outcome::Away]);
        // Still below the raw implied favourite probability.
        assert!(power[&Outcome::Home] < 0.8);
        assert!(shin[&Outcome::Home] < 0.8);
    }

    #[test]
    fn non_positive_prices_are_skipped() {
        let fair = devig(&prices(2.0, 0.0, 2.0), DevigMethod::Shin);
        assert_eq!(fair.len(), 2);
        assert_relative_eq!(fair[&Outcome::Home], 0.5, epsilon = 1e-9);
    }

    #[test]
    fn single_price_falls_back_to_basic() {
        let p = OutcomeMap::from([(Outcome::Over, 1.8)]);
        let fair = devig(&p, DevigMethod::Power);
        assert_relative_eq!(fair[&Outcome::Over], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn no_margin_market() {
        // implied 0.45 + 0.45 = 0.9 < 1
        let p = OutcomeMap::from([(Outcome::Over, 1.0 / 0.45), (Outcome::Under, 1.0 / 0.45)]);
        let shin = devig(&p, DevigMethod::Shin);
        assert_relative_eq!(shin[&Outcome::Over], 0.45, epsilon = 1e-12);
        let power = devig(&p, DevigMethod::Power);
        assert_relative_eq!(power[&Outcome::Over], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn overround_of_fair_book_is_one() {
        assert_relative_eq!(overround(&prices(2.0, 4.0, 4.0)), 1.0, epsilon = 1e-12);
        assert!(overround(&prices(2.10, 3.40, 3.60)) > 1.04);
    }
}
