//! Express (parlay) and system bet construction.
//!
//! Expresses are enumerated over every k-subset of a capped leg pool. Joint
//! probability is the product of leg probabilities times a correlation
//! discount: `0.95^(n−1)` for the leg count, a further factor for every pair
//! of legs from the same league, and one for legs sharing a match day.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, info};

use crate::config::BettingConfig;
use crate::models::{binomial, Leg, MultiLegBet, MultiLegKind, ValueSignal};

/// Lexicographic k-subsets of `0..n`.
pub struct Combinations {
    n: usize,
    indices: Vec<usize>,
    done: bool,
}

impl Combinations {
    pub fn new(n: usize, k: usize) -> Self {
        Combinations {
            n,
            indices: (0..k).collect(),
            done: k == 0 || k > n,
        }
    }
}

impl Iterator for Combinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.done {
            return None;
        }
        let current = self.indices.clone();

        // Advance: find the rightmost index that can still move right.
        let k = self.indices.len();
        let mut i = k;
        loop {
            if i == 0 {
                self.done = true;
                break;
            }
            i -= 1;
            if self.indices[i] < self.n - k + i {
                self.indices[i] += 1;
                for j in i + 1..k {
                    self.indices[j] = self.indices[j - 1] + 1;
                }
                break;
            }
        }
        Some(current)
    }
}

pub struct MultiLegBuilder {
    config: BettingConfig,
}

impl MultiLegBuilder {
    pub fn new(config: BettingConfig) -> Self {
        MultiLegBuilder { config }
    }

    /// Joint-probability discount for a set of legs, in (0, 1].
    pub fn correlation_discount(&self, legs: &[Leg]) -> f64 {
        if legs.len() < 2 {
            return 1.0;
        }
        let mut discount = self.config.express_correlation_discount.powi(legs.len() as i32 - 1);

        let mut per_league: BTreeMap<&str, i32> = BTreeMap::new();
        for leg in legs {
            *per_league.entry(leg.fixture.league.as_str()).or_insert(0) += 1;
        }
        let same_league_pairs: i32 = per_league.values().map(|&k| k * (k - 1) / 2).sum();
        discount *= self.config.express_same_league_penalty.powi(same_league_pairs);

        let mut days = HashSet::new();
        if legs.iter().any(|l| !days.insert(l.fixture.match_day())) {
            discount *= self.config.express_same_day_penalty;
        }
        discount
    }

    /// Legs that qualify for an express, most probable first, capped.
    fn express_pool(&self, signals: &[ValueSignal]) -> Vec<Leg> {
        let mut pool: Vec<Leg> = signals
            .iter()
            .filter(|s| {
                s.edge >= self.config.express_min_leg_edge
                    && s.probability >= self.config.express_min_leg_prob
                    && s.price <= self.config.express_max_leg_odds
            })
            .map(Leg::from)
            .collect();
        pool.sort_by(|a, b| b.probability.total_cmp(&a.probability));
        pool.truncate(self.config.express_pool_cap);
        pool
    }

    /// Best expresses of each configured size by correlation-adjusted EV,
    /// merged and ranked across sizes.
    pub fn build_expresses(&self, signals: &[ValueSignal]) -> Vec<MultiLegBet> {
        let pool = self.express_pool(signals);
        let mut bets = Vec::new();

        for &size in &self.config.express_sizes {
            let mut candidates: Vec<(f64, Vec<usize>, f64)> = Vec::new();
            for combo in Combinations::new(pool.len(), size) {
                let mut fixtures = HashSet::with_capacity(size);
                if !combo.iter().all(|&i| fixtures.insert(pool[i].fixture.id.as_str())) {
                    continue;
                }

                let total_price: f64 = combo.iter().map(|&i| pool[i].price).product();
                if total_price > self.config.express_max_total_odds {
                    continue;
                }
                let legs: Vec<Leg> = combo.iter().map(|&i| pool[i].clone()).collect();
                let discount = self.correlation_discount(&legs);
                let probability: f64 = legs.iter().map(|l| l.probability).product();
                let adjusted_ev = probability * discount * total_price - 1.0;
                if adjusted_ev > 0.0 {
                    candidates.push((adjusted_ev, combo, discount));
                }
            }

            debug!("{} positive {}-leg combinations from a pool of {}", candidates.len(), size, pool.len());
            candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
            candidates.truncate(self.config.express_max_results);
            bets.extend(candidates.into_iter().map(|(_, combo, discount)| {
                let legs = combo.iter().map(|&i| pool[i].clone()).collect();
                MultiLegBet::new(MultiLegKind::Express, legs, discount)
            }));
        }

        bets.sort_by(|a, b| b.adjusted_expected_value().total_cmp(&a.adjusted_expected_value()));
        if let Some(best) = bets.first() {
            info!("🧩 Built {} express(es), best adjusted EV {:+.3}", bets.len(), best.adjusted_expected_value());
        }
        bets
    }

    /// One system bet per configured (total, size) that has enough legs.
    pub fn build_systems(&self, signals: &[ValueSignal]) -> Vec<MultiLegBet> {
        let mut eligible: Vec<&ValueSignal> = signals
            .iter()
            .filter(|s| s.edge >= self.config.express_min_leg_edge && s.probability >= self.config.system_min_leg_prob)
            .collect();
        eligible.sort_by(|a, b| b.probability.total_cmp(&a.probability));

        let mut seen = HashSet::new();
        let legs: Vec<Leg> = eligible
            .into_iter()
            .filter(|s| seen.insert(s.fixture.id.as_str()))
            .map(Leg::from)
            .collect();

        let systems: Vec<MultiLegBet> = self
            .config
            .system_configs
            .iter()
            .filter(|(total, _)| legs.len() >= *total)
            .map(|&(total, size)| MultiLegBet::new(MultiLegKind::System { size }, legs[..total].to_vec(), 1.0))
            .collect();

        for s in &systems {
            if let MultiLegKind::System { size } = s.kind {
                debug!("System {}/{}: {} combinations", size, s.legs.len(), binomial(s.legs.len(), size));
            }
        }
        systems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Confidence, FixtureRef, Market, Outcome, SignalStatus};
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone, Utc};

    fn signal(fixture: &str, league: &str, day: i64, probability: f64, price: f64) -> ValueSignal {
        ValueSignal {
            id: ValueSignal::signal_id(fixture, Outcome::Home),
            fixture: FixtureRef {
                id: fixture.into(),
                league: league.into(),
                home_team: format!("{} home", fixture),
                away_team: format!("{} away", fixture),
                commence_time: Utc.with_ymd_and_hms(2026, 5, 1, 15, 0, 0).unwrap() + Duration::days(day),
            },
            market: Market::MatchResult,
            outcome: Outcome::Home,
            probability,
            price,
            bookmaker: "Bet365".into(),
            edge: probability * price - 1.0,
            overround: 0.05,
            confidence: Confidence::Medium,
            model_count: 2,
            sharp_agrees: false,
            stake: 0.0,
            stake_fraction: 0.0,
            status: SignalStatus::Pending,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn combinations_enumerate_every_subset_once() {
        let all: Vec<Vec<usize>> = Combinations::new(5, 3).collect();
        assert_eq!(all.len() as u64, binomial(5, 3));
        assert_eq!(all[0], vec![0, 1, 2]);
        assert_eq!(all[all.len() - 1], vec![2, 3, 4]);
        assert_eq!(Combinations::new(3, 4).count(), 0);
        assert_eq!(Combinations::new(3, 0).count(), 0);
        assert_eq!(Combinations::new(50, 2).count(), 1225);
    }

    #[test]
    fn discount_counts_league_pairs_and_shared_day() {
        let builder = MultiLegBuilder::new(BettingConfig::default());
        let legs: Vec<Leg> = [
            signal("a", "EPL", 0, 0.6, 2.0),
            signal("b", "EPL", 0, 0.6, 2.0),
            signal("c", "EPL", 1, 0.6, 2.0),
        ]
        .iter()
        .map(Leg::from)
        .collect();
        assert_relative_eq!(
            builder.correlation_discount(&legs[..2]),
            0.95 * 0.90 * 0.97,
            epsilon = 1e-12
        );
        // three same-league pairs, one shared day
        assert_relative_eq!(
            builder.correlation_discount(&legs),
            0.95f64.powi(2) * 0.90f64.powi(3) * 0.97,
            epsilon = 1e-12
        );
    }

    #[test]
    fn independent_legs_only_pay_the_size_discount() {
        let builder = MultiLegBuilder::new(BettingConfig::default());
        let legs: Vec<Leg> = [signal("a", "EPL", 0, 0.6, 2.0), signal("b", "La Liga", 1, 0.6, 2.0)]
            .iter()
            .map(Leg::from)
            .collect();
        assert_relative_eq!(builder.correlation_discount(&legs), 0.95, epsilon = 1e-12);
    }

    #[test]
    fn best_expresses_by_adjusted_ev() {
        let builder = MultiLegBuilder::new(BettingConfig::default());
        let leagues = ["EPL", "La Liga", "Serie A", "Bundesliga"];
        let signals: Vec<ValueSignal> = leagues
            .iter()
            .enumerate()
            .map(|(i, league)| signal(&format!("f{}", i), league, i as i64, 0.6, 2.0))
            .collect();

        let expresses = builder.build_expresses(&signals);
        // Three per size; quads price at 16 > 15 and are dropped.
        assert_eq!(expresses.len(), 6);
        for e in &expresses[..3] {
            assert_eq!(e.legs.len(), 3);
            assert_eq!(e.kind, MultiLegKind::Express);
            assert_relative_eq!(e.adjusted_expected_value(), 0.216 * 0.9025 * 8.0 - 1.0, epsilon = 1e-9);
        }
        for e in &expresses[3..] {
            assert_eq!(e.legs.len(), 2);
            assert_relative_eq!(e.adjusted_expected_value(), 0.36 * 0.95 * 4.0 - 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn weak_legs_and_repeated_fixtures_are_excluded() {
        let builder = MultiLegBuilder::new(BettingConfig::default());
        let signals = vec![
            signal("a", "EPL", 0, 0.6, 2.0),
            // same fixture, different outcome
            ValueSignal {
                outcome: Outcome::Away,
                ..signal("a", "EPL", 0, 0.6, 2.0)
            },
            // probability below 0.52
            signal("b", "La Liga", 1, 0.45, 2.5),
            // price above 2.20
            signal("c", "Serie A", 2, 0.55, 2.4),
        ];
        assert!(builder.build_expresses(&signals).is_empty());
    }

    #[test]
    fn systems_need_enough_distinct_legs() {
        let builder = MultiLegBuilder::new(BettingConfig::default());
        let mut signals: Vec<ValueSignal> = (0..4)
            .map(|i| signal(&format!("f{}", i), "EPL", i, 0.56 + i as f64 * 0.01, 2.0))
            .collect();
        // below system probability floor
        signals.push(signal("f9", "EPL", 9, 0.53, 2.0));

        let systems = builder.build_systems(&signals);
        assert_eq!(systems.len(), 2);
        assert_eq!(systems[0].kind, MultiLegKind::System { size: 2 });
        assert_eq!(systems[0].combinations(), 3);
        assert_eq!(systems[1].kind, MultiLegKind::System { size: 3 });
        assert_eq!(systems[1].combinations(), 4);
        // most probable legs first
        assert_eq!(systems[0].legs[0].fixture.id, "f3");
        assert_relative_eq!(systems[0].correlation_discount, 1.0);
    }
}
