//! Line-movement detection between successive best-price snapshots.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::models::{Fixture, Outcome};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineMove {
    pub fixture_id: String,
    pub outcome: Outcome,
    pub previous_price: f64,
    pub current_price: f64,
    /// Relative change, negative when the price shortened.
    pub change: f64,
    /// Price dropped by at least the threshold.
    pub sharp: bool,
}

struct Snapshot {
    prices: HashMap<Outcome, f64>,
    commence_time: DateTime<Utc>,
}

/// Remembers the last best price per fixture and outcome.
pub struct LineMonitor {
    threshold: f64,
    last: HashMap<String, Snapshot>,
}

impl LineMonitor {
    pub fn new(threshold: f64) -> Self {
        LineMonitor {
            threshold,
            last: HashMap::new(),
        }
    }

    pub fn tracked(&self) -> usize {
        self.last.len()
    }

    /// Compare current best prices with the previous observation, then store
    /// them as the new baseline.
    pub fn observe(&mut self, fixture: &Fixture) -> Vec<LineMove> {
        let current: HashMap<Outcome, f64> = fixture
            .quotes
            .iter()
            .flat_map(|q| q.prices.keys().copied())
            .filter_map(|o| fixture.best_price(o).map(|(p, _)| (o, p)))
            .collect();

        let mut moves = Vec::new();
        if let Some(previous) = self.last.get(&fixture.id) {
            for (&outcome, &now) in &current {
                let Some(&before) = previous.prices.get(&outcome) else {
                    continue;
                };
                let change = (now - before) / before;
                if change.abs() >= self.threshold {
                    let sharp = change <= -self.threshold;
                    if sharp {
                        warn!(
                            "📉 Sharp move on {} {}: {:.2} → {:.2} ({:+.1}%)",
                            fixture.id,
                            outcome,
                            before,
                            now,
                            change * 100.0
                        );
                    } else {
                        debug!("Line drift on {} {}: {:.2} → {:.2}", fixture.id, outcome, before, now);
                    }
                    moves.push(LineMove {
                        fixture_id: fixture.id.clone(),
                        outcome,
                        previous_price: before,
                        current_price: now,
                        change,
                        sharp,
                    });
                }
            }
        }

        self.last.insert(
            fixture.id.clone(),
            Snapshot {
                prices: current,
                commence_time: fixture.commence_time,
            },
        );
        moves.sort_by(|a, b| a.change.total_cmp(&b.change));
        moves
    }

    /// Forget fixtures that already kicked off.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        self.last.retain(|_, s| s.commence_time > now);
    }
}
