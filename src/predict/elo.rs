//! Elo rating system with a home bonus, an empirical draw share and a
//! goal-margin multiplier.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ModelConfig;
use crate::models::{Market, MatchRecord, Outcome, OutcomeMap};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TeamRating {
    pub rating: f64,
    pub games: u32,
    pub k_factor: f64,
}

/// 1X2 probabilities from two ratings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RatingPrediction {
    pub home_win: f64,
    pub draw: f64,
    pub away_win: f64,
    pub home_rating: f64,
    pub away_rating: f64,
}

impl RatingPrediction {
    pub fn probabilities(&self) -> OutcomeMap {
        OutcomeMap::from([
            (Outcome::Home, self.home_win),
            (Outcome::Draw, self.draw),
            (Outcome::Away, self.away_win),
        ])
    }

    /// Expected score for the home side, counting a draw as half a win.
    fn expected_home_score(&self) -> f64 {
        self.home_win + 0.5 * self.draw
    }
}

pub struct RatingSystem {
    config: ModelConfig,
    ratings: HashMap<String, TeamRating>,
}

impl RatingSystem {
    pub fn new(config: ModelConfig) -> Self {
        RatingSystem {
            config,
            ratings: HashMap::new(),
        }
    }

    pub fn rating(&self, team: &str) -> Option<&TeamRating> {
        self.ratings.get(team)
    }

    pub fn games_played(&self, team: &str) -> u32 {
        self.ratings.get(team).map_or(0, |r| r.games)
    }

    pub fn team_count(&self) -> usize {
        self.ratings.len()
    }

    fn entry(&mut self, team: &str) -> &mut TeamRating {
        let initial = TeamRating {
            rating: self.config.elo_initial,
            games: 0,
            k_factor: self.config.elo_k_factor,
        };
        self.ratings.entry(team.to_string()).or_insert(initial)
    }

    fn probabilities_from(&self, home_rating: f64, away_rating: f64) -> RatingPrediction {
        let diff = home_rating + self.config.elo_home_advantage - away_rating;
        let expected = 1.0 / (1.0 + 10f64.powf(-diff / 400.0));
        let draw = (self.config.elo_draw_base * (-diff.abs() / self.config.elo_draw_scale).exp())
            .max(self.config.elo_draw_floor);
        RatingPrediction {
            home_win: expected * (1.0 - draw),
            draw,
            away_win: (1.0 - expected) * (1.0 - draw),
            home_rating,
            away_rating,
        }
    }

    /// `None` when either team has never been rated.
    pub fn predict(&self, home: &str, away: &str) -> Option<RatingPrediction> {
        let home = self.ratings.get(home)?;
        let away = self.ratings.get(away)?;
        Some(self.probabilities_from(home.rating, away.rating))
    }

    pub fn predict_market(&self, home: &str, away: &str, market: Market) -> Option<OutcomeMap> {
        match market {
            Market::MatchResult => self.predict(home, away).map(|p| p.probabilities()),
            // Ratings carry no goal-count information.
            Market::Totals => None,
        }
    }

    /// `ln(gd + 1) · 2.2 / (gap · 0.001 + 2.2)`; draws count as a one-goal
    /// margin with no rating gap.
    fn margin_multiplier(&self, home_goals: u32, away_goals: u32, home_rating: f64, away_rating: f64) -> f64 {
        if !self.config.elo_margin_multiplier {
            return 1.0;
        }
        let goal_diff = home_goals.abs_diff(away_goals).max(1) as f64;
        let winner_gap = match home_goals.cmp(&away_goals) {
            std::cmp::Ordering::Greater => home_rating - away_rating,
            std::cmp::Ordering::Less => away_rating - home_rating,
            std::cmp::Ordering::Equal => 0.0,
        };
        (goal_diff + 1.0).ln() * 2.2 / (winner_gap * 0.001 + 2.2)
    }

    /// Apply one result. Unseen teams enter at the initial rating.
    pub fn update(&mut self, record: &MatchRecord) {
        let home = *self.entry(&record.home_team);
        let away = *self.entry(&record.away_team);

        let prediction = self.probabilities_from(home.rating, away.rating);
        let expected_home = prediction.expected_home_score();
        let expected_away = 1.0 - expected_home;

        let actual_home = match record.home_goals.cmp(&record.away_goals) {
            std::cmp::Ordering::Greater => 1.0,
            std::cmp::Ordering::Equal => 0.5,
            std::cmp::Ordering::Less => 0.0,
        };
        let actual_away = 1.0 - actual_home;

        let mov = self.margin_multiplier(record.home_goals, record.away_goals, home.rating, away.rating);
        let k_home = home.k_factor / (1.0 + home.games as f64 / 100.0);
        let k_away = away.k_factor / (1.0 + away.games as f64 / 100.0);

        let home_delta = k_home * mov * (actual_home - expected_home);
        let away_delta = k_away * mov * (actual_away - expected_away);

        debug!(
            "Elo update {} {}-{} {}: {:+.2} / {:+.2}",
            record.home_team, record.home_goals, record.away_goals, record.away_team, home_delta, away_delta
        );

        let h = self.entry(&record.home_team);
        h.rating += home_delta;
        h.games += 1;
        let a = self.entry(&record.away_team);
        a.rating += away_delta;
        a.games += 1;
    }

    /// Reset and replay a history in chronological order.
    pub fn fit(&mut self, matches: &[MatchRecord]) {
        self.ratings.clear();
        let mut ordered: Vec<&MatchRecord> = matches.iter().collect();
        ordered.sort_by_key(|m| m.played_at);
        for record in ordered {
            self.update(record);
        }
        info!("Elo ratings fitted: {} teams from {} matches", self.ratings.len(), matches.len());
    }

    pub fn snapshot(&self) -> HashMap<String, TeamRating> {
        self.ratings.clone()
    }

    pub fn restore(&mut self, ratings: HashMap<String, TeamRating>) {
        self.ratings = ratings;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone, Utc};

    fn record(home: &str, away: &str, hg: u32, ag: u32, day: i64) -> MatchRecord {
        MatchRecord {
            home_team: home.into(),
            away_team: away.into(),
            home_goals: hg,
            away_goals: ag,
            played_at: Utc.with_ymd_and_hms(2025, 9, 1, 15, 0, 0).unwrap() + Duration::days(day),
        }
    }

    #[test]
    fn unknown_team_has_no_prediction() {
        let mut elo = RatingSystem::new(ModelConfig::default());
        elo.update(&record("Ajax", "PSV", 1, 0, 0));
        assert!(elo.predict("Ajax", "Feyenoord").is_none());
        assert!(elo.predict("Ajax", "PSV").is_some());
    }

    #[test]
    fn equal_ratings_favour_home_side() {
        let elo = RatingSystem::new(ModelConfig::default());
        let p = elo.probabilities_from(1500.0, 1500.0);
        assert_relative_eq!(p.home_win + p.draw + p.away_win, 1.0, epsilon = 1e-12);
        assert!(p.home_win > p.away_win);
        // 65 points of home advantage: draw = 0.28 · exp(−65/300)
        assert_relative_eq!(p.draw, 0.28 * (-65.0f64 / 300.0).exp(), epsilon = 1e-12);
    }

    #[test]
    fn draw_share_has_a_floor() {
        let elo = RatingSystem::new(ModelConfig::default());
        let p = elo.probabilities_from(2400.0, 1200.0);
        assert_relative_eq!(p.draw, 0.05, epsilon = 1e-12);
        assert!(p.home_win > 0.9);
    }

    #[test]
    fn win_moves_ratings_in_opposite_directions() {
        let mut elo = RatingSystem::new(ModelConfig::default());
        elo.update(&record("Ajax", "PSV", 3, 0, 0));
        let ajax = elo.rating("Ajax").unwrap();
        let psv = elo.rating("PSV").unwrap();
        assert!(ajax.rating > 1500.0);
        assert!(psv.rating < 1500.0);
        assert_eq!(ajax.games, 1);
        // Same K and games: the exchange is symmetric.
        assert_relative_eq!(ajax.rating - 1500.0, 1500.0 - psv.rating, epsilon = 1e-9);
    }

    #[test]
    fn larger_margin_moves_ratings_further() {
        let mut narrow = RatingSystem::new(ModelConfig::default());
        narrow.update(&record("Ajax", "PSV", 1, 0, 0));
        let mut wide = RatingSystem::new(ModelConfig::default());
        wide.update(&record("Ajax", "PSV", 4, 0, 0));
        assert!(wide.rating("Ajax").unwrap().rating > narrow.rating("Ajax").unwrap().rating);
    }

    #[test]
    fn margin_multiplier_can_be_disabled() {
        let config = ModelConfig {
            elo_margin_multiplier: false,
            ..ModelConfig::default()
        };
        let mut one = RatingSystem::new(config.clone());
        one.update(&record("Ajax", "PSV", 1, 0, 0));
        let mut four = RatingSystem::new(config);
        four.update(&record("Ajax", "PSV", 4, 0, 0));
        assert_relative_eq!(
            one.rating("Ajax").unwrap().rating,
            four.rating("Ajax").unwrap().rating,
            epsilon = 1e-12
        );
    }

    #[test]
    fn draw_costs_the_home_favourite() {
        let mut elo = RatingSystem::new(ModelConfig::default());
        elo.update(&record("Ajax", "PSV", 2, 0, 0));
        elo.update(&record("Ajax", "PSV", 1, 1, 7));
        // Ajax was favoured at home, so a draw costs them points.
        let ajax_before_draw = {
            let mut e = RatingSystem::new(ModelConfig::default());
            e.update(&record("Ajax", "PSV", 2, 0, 0));
            e.rating("Ajax").unwrap().rating
        };
        assert!(elo.rating("Ajax").unwrap().rating < ajax_before_draw);
    }

    #[test]
    fn fit_replays_history_in_date_order() {
        let history = vec![
            record("Ajax", "PSV", 2, 1, 0),
            record("PSV", "Twente", 0, 0, 3),
            record("Twente", "Ajax", 3, 1, 6),
        ];
        let mut shuffled = history.clone();
        shuffled.reverse();

        let mut a = RatingSystem::new(ModelConfig::default());
        a.fit(&history);
        let mut b = RatingSystem::new(ModelConfig::default());
        b.fit(&shuffled);
        for team in ["Ajax", "PSV", "Twente"] {
            assert_relative_eq!(a.rating(team).unwrap().rating, b.rating(team).unwrap().rating, epsilon = 1e-12);
        }

        // Refit starts from scratch.
        a.fit(&history[..1]);
        assert_eq!(a.team_count(), 2);
    }

    #[test]
    fn totals_market_is_not_rated() {
        let mut elo = RatingSystem::new(ModelConfig::default());
        elo.update(&record("Ajax", "PSV", 2, 1, 0));
        assert!(elo.predict_market("Ajax", "PSV", Market::Totals).is_none());
        assert!(elo.predict_market("Ajax", "PSV", Market::MatchResult).is_some());
    }
}
