use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::betting::devig::DevigMethod;
use crate::models::SettleResult;
use crate::predict::ensemble::Source;

/// Sports value-betting engine
#[derive(Parser, Debug, Clone)]
#[command(name = "valuebet-engine", version, about)]
pub struct Config {
    /// SQLite database path (signal log, bankroll and model snapshots)
    #[arg(long, env = "DATABASE_PATH", default_value = "valuebet.db")]
    pub database_path: String,

    /// Starting bankroll used when no snapshot exists yet
    #[arg(long, env = "INITIAL_BANKROLL")]
    pub initial_balance: Option<f64>,

    /// Optional JSON file with model and betting settings
    #[arg(long, env = "ENGINE_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Fractional Kelly multiplier override (0.0–1.0)
    #[arg(long, env = "KELLY_FRACTION")]
    pub kelly_fraction: Option<f64>,

    /// Minimum edge required to emit a signal (e.g. 0.03 = 3%)
    #[arg(long, env = "MIN_VALUE_EDGE")]
    pub min_edge: Option<f64>,

    /// Margin-removal method for market consensus
    #[arg(long, env = "DEVIG_METHOD", value_enum)]
    pub devig_method: Option<DevigMethod>,

    /// Reference ("sharp") bookmaker name
    #[arg(long, env = "SHARP_BOOKMAKER")]
    pub sharp_bookmaker: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run one scan cycle over a fixtures file
    Scan(ScanArgs),
    /// Re-run the scan on an interval until interrupted
    Watch {
        #[command(flatten)]
        scan: ScanArgs,
        /// Seconds between scan cycles
        #[arg(long, env = "ODDS_POLL_INTERVAL", default_value = "120")]
        interval_secs: u64,
    },
    /// Settle a recorded bet
    Settle {
        signal_id: String,
        #[arg(value_enum)]
        result: SettleResult,
    },
    /// Print bankroll statistics
    Stats,
    /// Clear the bankroll halt flag and losing streak
    Reset,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ScanArgs {
    /// JSON file with upcoming fixtures and their quoted prices
    #[arg(long, env = "FIXTURES_PATH")]
    pub fixtures: PathBuf,

    /// JSON file with settled match history used to fit the models
    #[arg(long, env = "HISTORY_PATH")]
    pub history: Option<PathBuf>,

    /// Record the computed stakes against the bankroll
    #[arg(long, env = "AUTO_RECORD", default_value = "false")]
    pub record: bool,
}

impl Config {
    /// Resolve the engine settings: JSON file (or defaults) plus CLI overrides.
    pub fn engine_settings(&self) -> anyhow::Result<EngineSettings> {
        let mut settings = match &self.settings {
            Some(path) => EngineSettings::load(path)?,
            None => EngineSettings::default(),
        };
        if let Some(balance) = self.initial_balance {
            settings.betting.initial_bankroll = balance;
        }
        if let Some(kelly) = self.kelly_fraction {
            settings.betting.kelly_fraction = kelly;
        }
        if let Some(edge) = self.min_edge {
            settings.betting.min_value_edge = edge;
        }
        if let Some(method) = self.devig_method {
            settings.betting.devig_method = method;
        }
        if let Some(sharp) = &self.sharp_bookmaker {
            settings.betting.sharp_bookmaker = Some(sharp.clone()).filter(|s| !s.is_empty());
        }
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be between {min} and {max}, got {value}")]
    OutOfRange {
        name: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },
    #[error("{0} has its lower bound above its upper bound")]
    InvertedBand(&'static str),
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("system {size} of {total} is not a valid combination")]
    InvalidSystem { total: usize, size: usize },
}

fn check_range(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            min,
            max,
            value,
        })
    }
}

fn check_band(name: &'static str, band: (f64, f64)) -> Result<(), ConfigError> {
    if band.0 > band.1 {
        Err(ConfigError::InvertedBand(name))
    } else {
        Ok(())
    }
}

/// All tunables of the prediction and decision pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub model: ModelConfig,
    pub betting: BettingConfig,
}

impl EngineSettings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings: EngineSettings = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.model.validate()?;
        self.betting.validate()
    }
}

/// Scoring model, rating system and ensemble parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    // --- Dixon-Coles ---
    pub rho_bounds: (f64, f64),
    /// xi in `exp(-xi * days_since_match)`
    pub time_decay: f64,
    pub max_goals: u32,
    pub strength_bounds: (f64, f64),
    pub home_advantage_bounds: (f64, f64),
    pub max_iterations: usize,
    pub tolerance: f64,
    pub min_training_matches: usize,
    pub goal_lines: Vec<f64>,
    pub top_scores: usize,

    // --- Elo ---
    pub elo_initial: f64,
    pub elo_k_factor: f64,
    pub elo_home_advantage: f64,
    pub elo_margin_multiplier: bool,
    pub elo_draw_base: f64,
    pub elo_draw_floor: f64,
    pub elo_draw_scale: f64,

    // --- Ensemble ---
    pub ensemble_weights: BTreeMap<Source, f64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            rho_bounds: (-0.5, 0.5),
            time_decay: 0.0019,
            max_goals: 7,
            strength_bounds: (0.01, 5.0),
            home_advantage_bounds: (0.5, 2.5),
            max_iterations: 3000,
            tolerance: 1e-9,
            min_training_matches: 500,
            goal_lines: vec![1.5, 2.5, 3.5],
            top_scores: 5,
            elo_initial: 1500.0,
            elo_k_factor: 32.0,
            elo_home_advantage: 65.0,
            elo_margin_multiplier: true,
            elo_draw_base: 0.28,
            elo_draw_floor: 0.05,
            elo_draw_scale: 300.0,
            ensemble_weights: BTreeMap::from([
                (Source::DixonColes, 0.35),
                (Source::Elo, 0.15),
                (Source::MarketConsensus, 0.40),
                (Source::Classifier, 0.10),
            ]),
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_band("rho_bounds", self.rho_bounds)?;
        check_range("rho_bounds.0", self.rho_bounds.0, -1.0, 1.0)?;
        check_range("rho_bounds.1", self.rho_bounds.1, -1.0, 1.0)?;
        check_band("strength_bounds", self.strength_bounds)?;
        if self.strength_bounds.0 <= 0.0 {
            return Err(ConfigError::OutOfRange {
                name: "strength_bounds.0",
                min: f64::EPSILON,
                max: self.strength_bounds.1,
                value: self.strength_bounds.0,
            });
        }
        check_band("home_advantage_bounds", self.home_advantage_bounds)?;
        check_range("time_decay", self.time_decay, 0.0, 1.0)?;
        check_range("max_goals", self.max_goals as f64, 1.0, 20.0)?;
        check_range("elo_draw_base", self.elo_draw_base, 0.0, 1.0)?;
        check_range("elo_draw_floor", self.elo_draw_floor, 0.0, self.elo_draw_base)?;
        if self.elo_draw_scale <= 0.0 {
            return Err(ConfigError::OutOfRange {
                name: "elo_draw_scale",
                min: f64::EPSILON,
                max: f64::MAX,
                value: self.elo_draw_scale,
            });
        }
        if self.ensemble_weights.values().any(|w| *w < 0.0)
            || self.ensemble_weights.values().sum::<f64>() <= 0.0
        {
            return Err(ConfigError::Empty("ensemble_weights"));
        }
        Ok(())
    }
}

/// Value detection, multi-leg construction and bankroll parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BettingConfig {
    // --- Singles ---
    pub min_value_edge: f64,
    pub min_confirmed_edge: f64,
    pub max_value_edge: f64,
    pub min_odds: f64,
    pub max_odds: f64,
    pub min_bookmakers: usize,
    pub sharp_bookmaker: Option<String>,
    pub sharp_tolerance: f64,
    pub devig_method: DevigMethod,

    // --- Expresses ---
    pub express_sizes: Vec<usize>,
    pub express_pool_cap: usize,
    pub express_max_results: usize,
    pub express_min_leg_prob: f64,
    pub express_max_leg_odds: f64,
    pub express_min_leg_edge: f64,
    pub express_max_total_odds: f64,
    pub express_correlation_discount: f64,
    pub express_same_league_penalty: f64,
    pub express_same_day_penalty: f64,

    // --- Systems: (total legs, combination size) ---
    pub system_configs: Vec<(usize, usize)>,
    pub system_min_leg_prob: f64,

    // --- Bankroll ---
    pub initial_bankroll: f64,
    pub kelly_fraction: f64,
    pub max_bet_percent: f64,
    pub max_express_bet_percent: f64,
    pub max_system_bet_percent: f64,
    pub min_bet_amount: f64,
    pub min_system_stake: f64,

    // --- Stop-loss ---
    pub max_daily_loss_percent: f64,
    pub max_weekly_loss_percent: f64,
    pub max_losing_streak: u32,
    pub bankruptcy_threshold: f64,
    pub max_drawdown: f64,

    // --- Monitoring ---
    pub line_drop_threshold: f64,
}

impl Default for BettingConfig {
    fn default() -> Self {
        Self {
            min_value_edge: 0.03,
            min_confirmed_edge: 0.05,
            max_value_edge: 0.25,
            min_odds: 1.35,
            max_odds: 5.50,
            min_bookmakers: 5,
            sharp_bookmaker: Some("Pinnacle".to_string()),
            sharp_tolerance: 0.02,
            devig_method: DevigMethod::Shin,
            express_sizes: vec![2, 3, 4],
            express_pool_cap: 50,
            express_max_results: 3,
            express_min_leg_prob: 0.52,
            express_max_leg_odds: 2.20,
            express_min_leg_edge: 0.03,
            express_max_total_odds: 15.0,
            express_correlation_discount: 0.95,
            express_same_league_penalty: 0.90,
            express_same_day_penalty: 0.97,
            system_configs: vec![(3, 2), (4, 3), (5, 3), (5, 4)],
            system_min_leg_prob: 0.55,
            initial_bankroll: 1000.0,
            kelly_fraction: 0.20,
            max_bet_percent: 0.04,
            max_express_bet_percent: 0.02,
            max_system_bet_percent: 0.03,
            min_bet_amount: 1.0,
            min_system_stake: 0.5,
            max_daily_loss_percent: 0.08,
            max_weekly_loss_percent: 0.15,
            max_losing_streak: 7,
            bankruptcy_threshold: 0.15,
            max_drawdown: 0.30,
            line_drop_threshold: 0.08,
        }
    }
}

impl BettingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_band("edge band", (self.min_value_edge, self.max_value_edge))?;
        check_band("odds band", (self.min_odds, self.max_odds))?;
        check_range("min_odds", self.min_odds, 1.0, f64::MAX)?;
        check_range("kelly_fraction", self.kelly_fraction, 0.0, 1.0)?;
        check_range("max_bet_percent", self.max_bet_percent, 0.0, 1.0)?;
        check_range("max_express_bet_percent", self.max_express_bet_percent, 0.0, 1.0)?;
        check_range("max_system_bet_percent", self.max_system_bet_percent, 0.0, 1.0)?;
        check_range("sharp_tolerance", self.sharp_tolerance, 0.0, 1.0)?;
        check_range("express_correlation_discount", self.express_correlation_discount, 0.0, 1.0)?;
        check_range("express_same_league_penalty", self.express_same_league_penalty, 0.0, 1.0)?;
        check_range("express_same_day_penalty", self.express_same_day_penalty, 0.0, 1.0)?;
        check_range("max_daily_loss_percent", self.max_daily_loss_percent, 0.0, 1.0)?;
        check_range("max_weekly_loss_percent", self.max_weekly_loss_percent, 0.0, 1.0)?;
        check_range("bankruptcy_threshold", self.bankruptcy_threshold, 0.0, 1.0)?;
        check_range("max_drawdown", self.max_drawdown, 0.0, 1.0)?;
        check_range("line_drop_threshold", self.line_drop_threshold, 0.0, 1.0)?;
        if self.initial_bankroll <= 0.0 {
            return Err(ConfigError::OutOfRange {
                name: "initial_bankroll",
                min: f64::EPSILON,
                max: f64::MAX,
                value: self.initial_bankroll,
            });
        }
        if self.express_sizes.is_empty() || self.express_sizes.iter().any(|n| *n < 2) {
            return Err(ConfigError::Empty("express_sizes"));
        }
        for &(total, size) in &self.system_configs {
            if size == 0 || size > total {
                return Err(ConfigError::InvalidSystem { total, size });
            }
        }
        Ok(())
    }
}
