//! Dixon-Coles scoring model.
//!
//! Each side's goals are Poisson with means
//!   λ = attack_home · defence_away · γ   (home)
//!   μ = attack_away · defence_home       (away)
//! and the joint probability of a score is corrected by `tau` on the four
//! low-score cells (0-0, 1-0, 0-1, 1-1), parameterised by a single ρ.
//!
//! Fitting maximises a time-weighted log-likelihood (`exp(-ξ · days_ago)`)
//! with projected gradient ascent: attack/defence and γ/ρ are clamped to
//! their bounds after every step and the attack vector is rescaled to mean 1
//! (the defence vector absorbs the inverse scale, which leaves the likelihood
//! unchanged).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ModelConfig;
use crate::models::{Market, MatchRecord, Outcome, OutcomeMap, TOTALS_LINE};

/// Floor on expected goals inside the likelihood.
const MIN_RATE: f64 = 1e-3;
/// Floor on `tau` when ρ pushes a low-score cell non-positive.
const MIN_TAU: f64 = 1e-4;
const INITIAL_HOME_ADVANTAGE: f64 = 1.25;
const INITIAL_RHO: f64 = -0.03;
const INITIAL_STEP: f64 = 0.1;
const MIN_STEP: f64 = 1e-14;

#[derive(Debug, Error, PartialEq)]
pub enum FitError {
    #[error("not enough data: {got} matches, {need} required")]
    InsufficientData { got: usize, need: usize },
    #[error("optimizer did not converge after {0} iterations")]
    NotConverged(usize),
    #[error("optimizer produced non-finite values")]
    NonFinite,
}

/// Fitted parameter set; immutable between fits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringParams {
    pub attack: BTreeMap<String, f64>,
    pub defence: BTreeMap<String, f64>,
    pub home_advantage: f64,
    pub rho: f64,
    pub log_likelihood: f64,
    pub iterations: usize,
    pub matches: usize,
    /// Version stamp.
    pub fitted_at: DateTime<Utc>,
}

/// Full-time score distribution for one fixture.
#[derive(Debug, Clone, Serialize)]
pub struct ScorePrediction {
    /// `matrix[home_goals][away_goals]`; the last row/column hold the tail mass.
    pub matrix: Vec<Vec<f64>>,
    pub home_win: f64,
    pub draw: f64,
    pub away_win: f64,
    pub expected_home_goals: f64,
    pub expected_away_goals: f64,
    pub btts_yes: f64,
    pub btts_no: f64,
    /// `(line, over, under)` for each configured goals line.
    pub totals: Vec<(f64, f64, f64)>,
    pub top_scores: Vec<ExactScore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExactScore {
    pub home_goals: u32,
    pub away_goals: u32,
    pub probability: f64,
}

impl ScorePrediction {
    pub fn over(&self, line: f64) -> f64 {
        let mut p = 0.0;
        for (x, row) in self.matrix.iter().enumerate() {
            for (y, cell) in row.iter().enumerate() {
                if (x + y) as f64 > line {
                    p += cell;
                }
            }
        }
        p
    }

    /// Outcome distribution for a market, summing to 1.
    pub fn probabilities(&self, market: Market) -> OutcomeMap {
        match market {
            Market::MatchResult => OutcomeMap::from([
                (Outcome::Home, self.home_win),
                (Outcome::Draw, self.draw),
                (Outcome::Away, self.away_win),
            ]),
            Market::Totals => {
                let over = self.over(TOTALS_LINE);
                OutcomeMap::from([(Outcome::Over, over), (Outcome::Under, 1.0 - over)])
            }
        }
    }
}

/// Low-score correction factor.
pub fn tau(x: u32, y: u32, lambda: f64, mu: f64, rho: f64) -> f64 {
    match (x, y) {
        (0, 0) => 1.0 - lambda * mu * rho,
        (0, 1) => 1.0 + lambda * rho,
        (1, 0) => 1.0 + mu * rho,
        (1, 1) => 1.0 - rho,
        _ => 1.0,
    }
}

/// Partial derivatives of `tau` with respect to (λ, μ, ρ).
fn tau_gradient(x: u32, y: u32, lambda: f64, mu: f64, rho: f64) -> (f64, f64, f64) {
    match (x, y) {
        (0, 0) => (-mu * rho, -lambda * rho, -lambda * mu),
        (0, 1) => (rho, 0.0, lambda),
        (1, 0) => (0.0, rho, mu),
        (1, 1) => (0.0, 0.0, -1.0),
        _ => (0.0, 0.0, 0.0),
    }
}

/// Match weight `exp(-ξ · whole days between match and as_of)`.
pub fn time_weight(played_at: DateTime<Utc>, as_of: DateTime<Utc>, xi: f64) -> f64 {
    let days = (as_of - played_at).num_days().max(0) as f64;
    (-xi * days).exp()
}

/// Poisson pmf for 0..=max_goals with the tail mass folded into the last entry.
fn truncated_poisson(lambda: f64, max_goals: u32) -> Vec<f64> {
    let mut pmf = Vec::with_capacity(max_goals as usize + 1);
    let mut p = (-lambda).exp();
    let mut cumulative = 0.0;
    for k in 0..max_goals {
        pmf.push(p);
        cumulative += p;
        p *= lambda / (k + 1) as f64;
    }
    pmf.push((1.0 - cumulative).max(0.0));
    pmf
}

fn ln_factorial(n: u32) -> f64 {
    (2..=n).map(|k| (k as f64).ln()).sum()
}

struct Sample {
    home: usize,
    away: usize,
    home_goals: u32,
    away_goals: u32,
    weight: f64,
    ln_fact: f64,
}

/// Flat parameter vector: `[attack; n] [defence; n] γ ρ`.
struct Problem<'a> {
    samples: Vec<Sample>,
    total_weight: f64,
    teams: usize,
    config: &'a ModelConfig,
}

impl Problem<'_> {
    fn gamma_index(&self) -> usize {
        2 * self.teams
    }

    fn rho_index(&self) -> usize {
        2 * self.teams + 1
    }

    fn rates(&self, theta: &[f64], s: &Sample) -> (f64, f64) {
        let n = self.teams;
        let lambda = theta[s.home] * theta[n + s.away] * theta[self.gamma_index()];
        let mu = theta[s.away] * theta[n + s.home];
        (lambda, mu)
    }

    /// Mean weighted negative log-likelihood.
    fn objective(&self, theta: &[f64]) -> f64 {
        let rho = theta[self.rho_index()];
        let mut ll = 0.0;
        for s in &self.samples {
            let (lambda, mu) = self.rates(theta, s);
            let (lambda, mu) = (lambda.max(MIN_RATE), mu.max(MIN_RATE));
            let t = tau(s.home_goals, s.away_goals, lambda, mu, rho).max(MIN_TAU);
            let log_p = t.ln() + s.home_goals as f64 * lambda.ln() - lambda
                + s.away_goals as f64 * mu.ln()
                - mu
                - s.ln_fact;
            ll += s.weight * log_p;
        }
        -ll / self.total_weight
    }

    fn gradient(&self, theta: &[f64]) -> Vec<f64> {
        let n = self.teams;
        let gamma = theta[self.gamma_index()];
        let rho = theta[self.rho_index()];
        let mut grad = vec![0.0; theta.len()];

        for s in &self.samples {
            let (raw_lambda, raw_mu) = self.rates(theta, s);
            let lambda = raw_lambda.max(MIN_RATE);
            let mu = raw_mu.max(MIN_RATE);
            let (x, y) = (s.home_goals, s.away_goals);

            let t = tau(x, y, lambda, mu, rho);
            let (t_lambda, t_mu, t_rho) = if t > MIN_TAU {
                let (a, b, c) = tau_gradient(x, y, lambda, mu, rho);
                (a / t, b / t, c / t)
            } else {
                (0.0, 0.0, 0.0)
            };

            // d log p / d λ and d log p / d μ; zero where the floor is active
            let g_lambda = if raw_lambda > MIN_RATE {
                x as f64 / lambda - 1.0 + t_lambda
            } else {
                0.0
            };
            let g_mu = if raw_mu > MIN_RATE {
                y as f64 / mu - 1.0 + t_mu
            } else {
                0.0
            };

            let w = s.weight;
            let (a_home, a_away) = (theta[s.home], theta[s.away]);
            let (d_home, d_away) = (theta[n + s.home], theta[n + s.away]);

            grad[s.home] += w * g_lambda * d_away * gamma;
            grad[n + s.away] += w * g_lambda * a_home * gamma;
            grad[self.gamma_index()] += w * g_lambda * a_home * d_away;
            grad[s.away] += w * g_mu * d_home;
            grad[n + s.home] += w * g_mu * a_away;
            grad[self.rho_index()] += w * t_rho;
        }

        // Ascent direction on the log-likelihood is descent on the objective.
        for g in grad.iter_mut() {
            *g = -*g / self.total_weight;
        }
        grad
    }

    fn project(&self, theta: &mut [f64]) {
        let n = self.teams;
        let (lo, hi) = self.config.strength_bounds;
        for v in theta[..2 * n].iter_mut() {
            *v = v.clamp(lo, hi);
        }
        let mean_attack = theta[..n].iter().sum::<f64>() / n as f64;
        if mean_attack > 0.0 {
            for i in 0..n {
                theta[i] /= mean_attack;
                theta[n + i] = (theta[n + i] * mean_attack).clamp(lo, hi);
            }
        }
        let (g_lo, g_hi) = self.config.home_advantage_bounds;
        let gi = self.gamma_index();
        theta[gi] = theta[gi].clamp(g_lo, g_hi);
        let (r_lo, r_hi) = self.config.rho_bounds;
        let ri = self.rho_index();
        theta[ri] = theta[ri].clamp(r_lo, r_hi);
    }

    /// Returns the optimum, its objective value and the iteration count.
    fn solve(&self, mut theta: Vec<f64>) -> Result<(Vec<f64>, f64, usize), FitError> {
        self.project(&mut theta);
        let mut value = self.objective(&theta);
        if !value.is_finite() {
            return Err(FitError::NonFinite);
        }

        let tolerance = self.config.tolerance;
        let mut step = INITIAL_STEP;
        let mut candidate = vec![0.0; theta.len()];

        for iteration in 1..=self.config.max_iterations {
            let grad = self.gradient(&theta);
            if grad.iter().any(|g| !g.is_finite()) {
                return Err(FitError::NonFinite);
            }

            // Backtracking: grow the step after a success, halve on failure.
            let next_value = loop {
                for (c, (t, g)) in candidate.iter_mut().zip(theta.iter().zip(&grad)) {
                    *c = t - step * g;
                }
                self.project(&mut candidate);
                let v = self.objective(&candidate);
                if v.is_finite() && v < value {
                    break Some(v);
                }
                step *= 0.5;
                if step < MIN_STEP {
                    break None;
                }
            };

            let Some(next_value) = next_value else {
                // No descent direction left inside the feasible set.
                return Ok((theta, value, iteration));
            };

            let moved: f64 = theta
                .iter()
                .zip(&candidate)
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>()
                .sqrt();
            let improvement = value - next_value;
            theta.copy_from_slice(&candidate);
            value = next_value;
            step = (step * 2.0).min(10.0);

            if improvement <= tolerance * (1.0 + value.abs()) || moved <= tolerance {
                return Ok((theta, value, iteration));
            }
        }

        Err(FitError::NotConverged(self.config.max_iterations))
    }
}

/// Dixon-Coles model with soft failure: a failed fit leaves it un-fitted and
/// every prediction returns `None`.
pub struct ScoringModel {
    config: ModelConfig,
    params: Option<ScoringParams>,
}

impl ScoringModel {
    pub fn new(config: ModelConfig) -> Self {
        ScoringModel {
            config,
            params: None,
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.params.is_some()
    }

    pub fn params(&self) -> Option<&ScoringParams> {
        self.params.as_ref()
    }

    /// Parameters for the persistence collaborator.
    pub fn snapshot(&self) -> Option<ScoringParams> {
        self.params.clone()
    }

    pub fn restore(&mut self, params: ScoringParams) {
        info!(
            "Dixon-Coles parameters restored (fitted_at={}, teams={})",
            params.fitted_at,
            params.attack.len()
        );
        self.params = Some(params);
    }

    /// Fit on a match history, weighting each match by its age at `as_of`.
    pub fn fit(
        &mut self,
        matches: &[MatchRecord],
        as_of: DateTime<Utc>,
    ) -> Result<&ScoringParams, FitError> {
        // Never keep serving parameters from before a failed attempt.
        self.params = None;
        info!("Fitting Dixon-Coles on {} matches", matches.len());

        match self.solve(matches, as_of) {
            Ok(params) => {
                info!(
                    "Dixon-Coles fitted: gamma={:.3}, rho={:.4}, teams={}, iterations={}",
                    params.home_advantage,
                    params.rho,
                    params.attack.len(),
                    params.iterations
                );
                Ok(self.params.insert(params))
            }
            Err(e) => {
                warn!("Dixon-Coles fit failed, model marked un-fitted: {}", e);
                Err(e)
            }
        }
    }

    fn solve(&self, matches: &[MatchRecord], as_of: DateTime<Utc>) -> Result<ScoringParams, FitError> {
        let need = self.config.min_training_matches.max(1);
        if matches.len() < need {
            return Err(FitError::InsufficientData {
                got: matches.len(),
                need,
            });
        }

        let teams: Vec<&str> = matches
            .iter()
            .flat_map(|m| [m.home_team.as_str(), m.away_team.as_str()])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if teams.len() < 2 {
            return Err(FitError::InsufficientData {
                got: matches.len(),
                need,
            });
        }
        let index: BTreeMap<&str, usize> = teams.iter().enumerate().map(|(i, t)| (*t, i)).collect();

        let samples: Vec<Sample> = matches
            .iter()
            .map(|m| Sample {
                home: index[m.home_team.as_str()],
                away: index[m.away_team.as_str()],
                home_goals: m.home_goals,
                away_goals: m.away_goals,
                weight: time_weight(m.played_at, as_of, self.config.time_decay),
                ln_fact: ln_factorial(m.home_goals) + ln_factorial(m.away_goals),
            })
            .collect();
        let total_weight: f64 = samples.iter().map(|s| s.weight).sum();
        if !(total_weight > 0.0 && total_weight.is_finite()) {
            return Err(FitError::NonFinite);
        }

        let n = teams.len();
        let problem = Problem {
            samples,
            total_weight,
            teams: n,
            config: &self.config,
        };

        let mut theta = vec![1.0; 2 * n + 2];
        theta[2 * n] = INITIAL_HOME_ADVANTAGE;
        theta[2 * n + 1] = INITIAL_RHO;

        let (theta, objective, iterations) = problem.solve(theta)?;
        if theta.iter().any(|v| !v.is_finite()) {
            return Err(FitError::NonFinite);
        }

        Ok(ScoringParams {
            attack: teams.iter().enumerate().map(|(i, t)| (t.to_string(), theta[i])).collect(),
            defence: teams
                .iter()
                .enumerate()
                .map(|(i, t)| (t.to_string(), theta[n + i]))
                .collect(),
            home_advantage: theta[2 * n],
            rho: theta[2 * n + 1],
            log_likelihood: -objective * total_weight,
            iterations,
            matches: matches.len(),
            fitted_at: Utc::now(),
        })
    }

    /// Score distribution for `home` vs `away`; `None` when un-fitted or when
    /// either team was not in the fitted history.
    pub fn predict(&self, home: &str, away: &str) -> Option<ScorePrediction> {
        let params = self.params.as_ref()?;
        let lambda = params.attack.get(home)? * params.defence.get(away)? * params.home_advantage;
        let mu = params.attack.get(away)? * params.defence.get(home)?;
        let max_goals = self.config.max_goals.max(1);

        let home_pmf = truncated_poisson(lambda, max_goals);
        let away_pmf = truncated_poisson(mu, max_goals);

        let mut matrix: Vec<Vec<f64>> = home_pmf
            .iter()
            .enumerate()
            .map(|(x, px)| {
                away_pmf
                    .iter()
                    .enumerate()
                    .map(|(y, py)| (tau(x as u32, y as u32, lambda, mu, params.rho) * px * py).max(0.0))
                    .collect()
            })
            .collect();

        let total: f64 = matrix.iter().flatten().sum();
        if !(total > 0.0 && total.is_finite()) {
            return None;
        }
        for cell in matrix.iter_mut().flatten() {
            *cell /= total;
        }

        let (mut home_win, mut draw, mut away_win, mut btts) = (0.0, 0.0, 0.0, 0.0);
        let mut scores = Vec::with_capacity(matrix.len() * matrix.len());
        for (x, row) in matrix.iter().enumerate() {
            for (y, &p) in row.iter().enumerate() {
                match x.cmp(&y) {
                    std::cmp::Ordering::Greater => home_win += p,
                    std::cmp::Ordering::Equal => draw += p,
                    std::cmp::Ordering::Less => away_win += p,
                }
                if x > 0 && y > 0 {
                    btts += p;
                }
                scores.push(ExactScore {
                    home_goals: x as u32,
                    away_goals: y as u32,
                    probability: p,
                });
            }
        }
        scores.sort_by(|a, b| b.probability.total_cmp(&a.probability));
        scores.truncate(self.config.top_scores);

        let mut prediction = ScorePrediction {
            matrix,
            home_win,
            draw,
            away_win,
            expected_home_goals: lambda,
            expected_away_goals: mu,
            btts_yes: btts,
            btts_no: 1.0 - btts,
            totals: Vec::new(),
            top_scores: scores,
        };
        prediction.totals = self
            .config
            .goal_lines
            .iter()
            .map(|&line| {
                let over = prediction.over(line);
                (line, over, 1.0 - over)
            })
            .collect();
        Some(prediction)
    }

    /// Top-N exact scores, empty when no prediction is available.
    pub fn most_likely_scores(&self, home: &str, away: &str, top_n: usize) -> Vec<ExactScore> {
        let Some(prediction) = self.predict(home, away) else {
            return Vec::new();
        };
        let mut scores: Vec<ExactScore> = prediction
            .matrix
            .iter()
            .enumerate()
            .flat_map(|(x, row)| {
                row.iter().enumerate().map(move |(y, &p)| ExactScore {
                    home_goals: x as u32,
                    away_goals: y as u32,
                    probability: p,
                })
            })
            .collect();
        scores.sort_by(|a, b| b.probability.total_cmp(&a.probability));
        scores.truncate(top_n);
        scores
    }
}
