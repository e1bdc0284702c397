//! Weighted blend of every probability source that produced a result.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::betting::devig::{self, DevigMethod};
use crate::models::{Fixture, Market, Outcome, OutcomeMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    DixonColes,
    Elo,
    MarketConsensus,
    Classifier,
}

/// Optional external outcome classifier.
pub trait OutcomeClassifier: Send + Sync {
    fn name(&self) -> &str;
    fn predict(&self, fixture: &Fixture, market: Market) -> Option<OutcomeMap>;
}

/// Stand-in used when no classifier is deployed; never produces a result.
pub struct Unavailable;

impl OutcomeClassifier for Unavailable {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn predict(&self, _fixture: &Fixture, _market: Market) -> Option<OutcomeMap> {
        None
    }
}

/// Blended distribution for one market of one fixture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Blend {
    pub market: Market,
    pub probabilities: OutcomeMap,
    /// Sources that produced a result, market consensus included.
    pub sources: Vec<Source>,
}

impl Blend {
    pub fn model_count(&self) -> usize {
        self.sources.len()
    }

    pub fn probability(&self, outcome: Outcome) -> Option<f64> {
        self.probabilities.get(&outcome).copied()
    }
}

/// Market consensus: de-vigged average prices across bookmakers.
pub fn market_consensus(fixture: &Fixture, market: Market, method: DevigMethod) -> Option<OutcomeMap> {
    let average = fixture.average_prices(market);
    if average.len() != market.outcomes().len() {
        return None;
    }
    Some(devig::devig(&average, method))
}

pub struct EnsembleBlender {
    weights: BTreeMap<Source, f64>,
}

impl EnsembleBlender {
    pub fn new(weights: BTreeMap<Source, f64>) -> Self {
        EnsembleBlender { weights }
    }

    fn weight(&self, source: Source) -> f64 {
        self.weights.get(&source).copied().unwrap_or(0.0)
    }

    /// Blend the given per-source distributions for `market`.
    ///
    /// Weights are renormalised over the sources present. If no positively
    /// weighted source is present but market consensus is, consensus is
    /// returned alone with a count of 1. Returns `None` when nothing at all
    /// is available.
    pub fn blend(&self, market: Market, inputs: &[(Source, OutcomeMap)]) -> Option<Blend> {
        let weighted: Vec<(Source, f64, &OutcomeMap)> = inputs
            .iter()
            .map(|(s, probs)| (*s, self.weight(*s), probs))
            .filter(|(_, w, _)| *w > 0.0)
            .collect();

        let total_weight: f64 = weighted.iter().map(|(_, w, _)| w).sum();
        if weighted.is_empty() || total_weight <= 0.0 {
            let (_, consensus) = inputs.iter().find(|(s, _)| *s == Source::MarketConsensus)?;
            return Some(Blend {
                market,
                probabilities: consensus.clone(),
                sources: vec![Source::MarketConsensus],
            });
        }

        let mut blended = OutcomeMap::new();
        for &outcome in market.outcomes() {
            let p: f64 = weighted
                .iter()
                .map(|(_, w, probs)| w / total_weight * probs.get(&outcome).copied().unwrap_or(0.0))
                .sum();
            blended.insert(outcome, p);
        }

        let total: f64 = blended.values().sum();
        if total <= 0.0 {
            return None;
        }
        for p in blended.values_mut() {
            *p /= total;
        }

        let sources: Vec<Source> = weighted.iter().map(|(s, _, _)| *s).collect();
        debug!("blend {:?} from {:?}: {:?}", market, sources, blended);
        Some(Blend {
            market,
            probabilities: blended,
            sources,
        })
    }
}
