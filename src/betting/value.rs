//! Value detection: blended probability against the best available price.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::betting::kelly;
use crate::config::BettingConfig;
use crate::models::{Confidence, Fixture, Outcome, SignalStatus, ValueSignal};
use crate::predict::ensemble::Blend;

pub struct ValueDetector {
    config: BettingConfig,
}

impl ValueDetector {
    pub fn new(config: BettingConfig) -> Self {
        ValueDetector { config }
    }

    /// Whether the reference bookmaker's implied probability stays within
    /// tolerance of ours. `false` when no reference price exists.
    pub fn sharp_agrees(&self, fixture: &Fixture, outcome: Outcome, probability: f64) -> bool {
        let Some(sharp) = self.config.sharp_bookmaker.as_deref() else {
            return false;
        };
        match fixture.price_from(sharp, outcome) {
            Some(price) if price > 1.0 => 1.0 / price < probability * (1.0 + self.config.sharp_tolerance),
            _ => false,
        }
    }

    pub fn confidence(&self, model_count: usize, edge: f64, sharp_agrees: bool) -> Confidence {
        if model_count >= 3 && (edge >= self.config.min_confirmed_edge || sharp_agrees) {
            Confidence::High
        } else if model_count >= 2 && edge >= self.config.min_value_edge {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    /// Signals for one market of a fixture, highest edge first.
    pub fn evaluate(&self, fixture: &Fixture, blend: &Blend, now: DateTime<Utc>) -> Vec<ValueSignal> {
        let market = blend.market;
        let bookmakers = fixture.bookmaker_count(market);
        if bookmakers < self.config.min_bookmakers {
            debug!(
                "{}: {} has {} bookmakers (< {}), skipping",
                fixture.id,
                market.as_str(),
                bookmakers,
                self.config.min_bookmakers
            );
            return Vec::new();
        }
        let overround = fixture.overround(market);

        let mut signals = Vec::new();
        for (&outcome, &probability) in &blend.probabilities {
            let Some((price, bookmaker)) = fixture.best_price(outcome) else {
                continue;
            };
            if price < self.config.min_odds || price > self.config.max_odds {
                continue;
            }
            let edge = kelly::edge(probability, price);
            if edge < self.config.min_value_edge || edge > self.config.max_value_edge {
                continue;
            }

            let sharp_agrees = self.sharp_agrees(fixture, outcome, probability);
            let confidence = self.confidence(blend.model_count(), edge, sharp_agrees);
            debug!(
                "Value on {} {}: p={:.3} @ {:.2} ({}) edge={:.3} {:?}",
                fixture.id, outcome, probability, price, bookmaker, edge, confidence
            );

            signals.push(ValueSignal {
                id: ValueSignal::signal_id(&fixture.id, outcome),
                fixture: fixture.reference(),
                market,
                outcome,
                probability,
                price,
                bookmaker: bookmaker.to_string(),
                edge,
                overround,
                confidence,
                model_count: blend.model_count(),
                sharp_agrees,
                stake: 0.0,
                stake_fraction: 0.0,
                status: SignalStatus::Pending,
                created_at: now,
            });
        }
        sort_by_edge(&mut signals);
        signals
    }

    /// Signals across every market blend of a fixture, highest edge first.
    pub fn detect(&self, fixture: &Fixture, blends: &[Blend], now: DateTime<Utc>) -> Vec<ValueSignal> {
        let mut signals: Vec<ValueSignal> = blends.iter().flat_map(|b| self.evaluate(fixture, b, now)).collect();
        sort_by_edge(&mut signals);
        signals
    }
}

pub fn sort_by_edge(signals: &mut [ValueSignal]) {
    signals.sort_by(|a, b| b.edge.total_cmp(&a.edge));
}
