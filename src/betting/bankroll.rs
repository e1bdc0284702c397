//! Bankroll controller: adaptive Kelly sizing, bet ledger and stop-loss guards.
//!
//! Balance changes only through [`BankrollController::record_bet`] (debit) and
//! [`BankrollController::settle`] (credit or refund). Both are idempotent per
//! bet id. Once a stop-loss condition trips, every sizing call returns 0 and
//! new bets are refused until [`BankrollController::reset`].

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::betting::kelly::{adaptive_fraction, floor_to_cents, kelly_fraction};
use crate::config::BettingConfig;
use crate::models::{MultiLegBet, SettleResult, SignalStatus};

#[derive(Debug, Error, PartialEq)]
pub enum BankrollError {
    #[error("bankroll is halted: {0}")]
    Halted(String),
    #[error("bet {0} is already recorded")]
    DuplicateBet(String),
    #[error("invalid stake {0:.2}")]
    InvalidStake(f64),
    #[error("invalid price {0:.3}")]
    InvalidPrice(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetKind {
    Single,
    Express,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetRecord {
    pub id: String,
    pub kind: BetKind,
    pub stake: f64,
    pub price: f64,
    pub status: SignalStatus,
    pub placed_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub profit: f64,
}

/// Everything the controller needs to resume after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankrollState {
    pub balance: f64,
    pub initial: f64,
    pub peak: f64,
    pub losing_streak: u32,
    pub daily_pnl: f64,
    pub weekly_pnl: f64,
    pub day: NaiveDate,
    /// (ISO year, ISO week)
    pub week: (i32, u32),
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub bets: BTreeMap<String, BetRecord>,
}

impl BankrollState {
    fn new(initial: f64, now: DateTime<Utc>) -> Self {
        BankrollState {
            balance: initial,
            initial,
            peak: initial,
            losing_streak: 0,
            daily_pnl: 0.0,
            weekly_pnl: 0.0,
            day: now.date_naive(),
            week: iso_week(now),
            halted: false,
            halt_reason: None,
            bets: BTreeMap::new(),
        }
    }
}

fn iso_week(at: DateTime<Utc>) -> (i32, u32) {
    let w = at.iso_week();
    (w.year(), w.week())
}

#[derive(Debug, Clone, Serialize)]
pub struct BankrollStats {
    pub balance: f64,
    pub initial: f64,
    pub peak: f64,
    pub drawdown: f64,
    pub total_bets: usize,
    pub settled: usize,
    pub won: usize,
    pub lost: usize,
    pub void: usize,
    pub pending: usize,
    pub win_rate: f64,
    pub total_staked: f64,
    pub total_profit: f64,
    pub roi: f64,
    pub losing_streak: u32,
    pub kelly_fraction: f64,
    pub daily_pnl: f64,
    pub weekly_pnl: f64,
    pub halted: bool,
    pub halt_reason: Option<String>,
}

pub struct BankrollController {
    config: BettingConfig,
    state: BankrollState,
}

impl BankrollController {
    pub fn new(config: BettingConfig) -> Self {
        let state = BankrollState::new(config.initial_bankroll, Utc::now());
        BankrollController { config, state }
    }

    pub fn from_state(config: BettingConfig, state: BankrollState) -> Self {
        BankrollController { config, state }
    }

    pub fn state(&self) -> &BankrollState {
        &self.state
    }

    pub fn balance(&self) -> f64 {
        self.state.balance
    }

    pub fn is_halted(&self) -> bool {
        self.state.halted
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.state.halt_reason.as_deref()
    }

    pub fn bet(&self, id: &str) -> Option<&BetRecord> {
        self.state.bets.get(id)
    }

    /// Fractional drop from the peak balance.
    pub fn drawdown(&self) -> f64 {
        if self.state.peak <= 0.0 {
            return 0.0;
        }
        ((self.state.peak - self.state.balance) / self.state.peak).max(0.0)
    }

    /// Current fractional Kelly multiplier.
    pub fn kelly_multiplier(&self) -> f64 {
        adaptive_fraction(self.config.kelly_fraction, self.state.losing_streak, self.drawdown())
    }

    /// Floor to cents, cap at `max_percent` of the balance, zero below the minimum.
    fn finalize_stake(&self, fraction: f64, max_percent: f64) -> f64 {
        if self.state.halted || fraction <= 0.0 || !fraction.is_finite() {
            return 0.0;
        }
        let capped = fraction.min(max_percent) * self.state.balance;
        let stake = floor_to_cents(capped);
        if stake < self.config.min_bet_amount {
            0.0
        } else {
            stake
        }
    }

    /// Stake for a single bet at a decimal price.
    pub fn single_stake(&self, probability: f64, price: f64) -> f64 {
        let fraction = kelly_fraction(probability, price) * self.kelly_multiplier();
        self.finalize_stake(fraction, self.config.max_bet_percent)
    }

    /// Stake for an express, sized on its correlation-adjusted probability at
    /// half the single-bet multiplier.
    pub fn express_stake(&self, bet: &MultiLegBet) -> f64 {
        let fraction =
            kelly_fraction(bet.adjusted_probability().clamp(0.0, 1.0), bet.total_price()) * self.kelly_multiplier() * 0.5;
        self.finalize_stake(fraction, self.config.max_express_bet_percent)
    }

    /// Per-combination stake for a system bet.
    pub fn system_stake(&self, combinations: u64) -> f64 {
        if self.state.halted || combinations == 0 {
            return 0.0;
        }
        let per_combo = self.state.balance * self.config.max_system_bet_percent / combinations as f64;
        floor_to_cents(per_combo.max(self.config.min_system_stake))
    }

    fn roll_periods(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.state.day {
            self.state.day = today;
            self.state.daily_pnl = 0.0;
        }
        let week = iso_week(now);
        if week != self.state.week {
            self.state.week = week;
            self.state.weekly_pnl = 0.0;
        }
    }

    pub fn record_bet(&mut self, id: &str, kind: BetKind, stake: f64, price: f64) -> Result<(), BankrollError> {
        self.record_bet_at(id, kind, stake, price, Utc::now())
    }

    /// Debit `stake` and open a pending record under `id`.
    pub fn record_bet_at(
        &mut self,
        id: &str,
        kind: BetKind,
        stake: f64,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<(), BankrollError> {
        self.roll_periods(now);
        if self.state.halted {
            let reason = self.state.halt_reason.clone().unwrap_or_default();
            return Err(BankrollError::Halted(reason));
        }
        if self.state.bets.contains_key(id) {
            return Err(BankrollError::DuplicateBet(id.to_string()));
        }
        if !(stake > 0.0 && stake.is_finite()) || stake > self.state.balance {
            return Err(BankrollError::InvalidStake(stake));
        }
        if !(price > 1.0 && price.is_finite()) {
            return Err(BankrollError::InvalidPrice(price));
        }

        self.state.balance -= stake;
        self.state.bets.insert(
            id.to_string(),
            BetRecord {
                id: id.to_string(),
                kind,
                stake,
                price,
                status: SignalStatus::Pending,
                placed_at: now,
                settled_at: None,
                profit: 0.0,
            },
        );
        info!("💰 Bet {} recorded: stake={:.2} @ {:.2}, balance={:.2}", id, stake, price, self.state.balance);
        Ok(())
    }

    pub fn settle(&mut self, id: &str, result: SettleResult) -> Option<f64> {
        self.settle_at(id, result, Utc::now())
    }

    /// Settle a pending bet and return its profit. Unknown or already settled
    /// ids are logged and ignored.
    pub fn settle_at(&mut self, id: &str, result: SettleResult, now: DateTime<Utc>) -> Option<f64> {
        self.roll_periods(now);

        let record = match self.state.bets.get_mut(id) {
            Some(r) if r.status == SignalStatus::Pending => r,
            Some(r) => {
                warn!("Bet {} already settled as {}, ignoring", id, r.status.as_str());
                return None;
            }
            None => {
                warn!("Settlement for unknown bet {}, ignoring", id);
                return None;
            }
        };

        let (credit, profit) = match result {
            SettleResult::Won => (record.stake * record.price, record.stake * (record.price - 1.0)),
            SettleResult::Lost => (0.0, -record.stake),
            SettleResult::Void => (record.stake, 0.0),
        };
        record.status = result.into();
        record.settled_at = Some(now);
        record.profit = profit;

        self.state.balance += credit;
        self.state.daily_pnl += profit;
        self.state.weekly_pnl += profit;
        match result {
            SettleResult::Won => self.state.losing_streak = 0,
            SettleResult::Lost => self.state.losing_streak += 1,
            SettleResult::Void => {}
        }
        if self.state.balance > self.state.peak {
            self.state.peak = self.state.balance;
        }

        info!(
            "Bet {} settled {:?}: profit={:+.2}, balance={:.2}, streak={}",
            id, result, profit, self.state.balance, self.state.losing_streak
        );
        self.check_stop_loss();
        Some(profit)
    }

    fn stop_loss_reason(&self) -> Option<String> {
        let s = &self.state;
        let c = &self.config;
        if -s.daily_pnl > c.max_daily_loss_percent * s.balance {
            return Some(format!("daily loss {:.2} exceeds {:.0}% of bankroll", -s.daily_pnl, c.max_daily_loss_percent * 100.0));
        }
        if -s.weekly_pnl > c.max_weekly_loss_percent * s.balance {
            return Some(format!("weekly loss {:.2} exceeds {:.0}% of bankroll", -s.weekly_pnl, c.max_weekly_loss_percent * 100.0));
        }
        if s.losing_streak >= c.max_losing_streak {
            return Some(format!("{} consecutive losses", s.losing_streak));
        }
        if s.balance < c.bankruptcy_threshold * s.initial {
            return Some(format!("balance {:.2} below {:.0}% of initial", s.balance, c.bankruptcy_threshold * 100.0));
        }
        let drawdown = self.drawdown();
        if drawdown > c.max_drawdown {
            return Some(format!("drawdown {:.1}% exceeds {:.0}%", drawdown * 100.0, c.max_drawdown * 100.0));
        }
        None
    }

    fn check_stop_loss(&mut self) {
        if self.state.halted {
            return;
        }
        if let Some(reason) = self.stop_loss_reason() {
            warn!("🛑 Betting halted: {}", reason);
            self.state.halted = true;
            self.state.halt_reason = Some(reason);
        }
    }

    /// Clear the halt flag and the losing streak. Balance and ledger are kept.
    pub fn reset(&mut self) {
        info!("Bankroll reset (was halted: {})", self.state.halted);
        self.state.halted = false;
        self.state.halt_reason = None;
        self.state.losing_streak = 0;
    }

    pub fn stats(&self) -> BankrollStats {
        self.stats_at(Utc::now())
    }

    /// Summary as of `now`. Daily and weekly P&L read as zero once their
    /// period has ended, even before the next bet rolls the state over.
    pub fn stats_at(&self, now: DateTime<Utc>) -> BankrollStats {
        let count = |status: SignalStatus| self.state.bets.values().filter(|b| b.status == status).count();
        let won = count(SignalStatus::Won);
        let lost = count(SignalStatus::Lost);
        let void = count(SignalStatus::Void);
        let pending = count(SignalStatus::Pending);
        let total_staked: f64 = self
            .state
            .bets
            .values()
            .filter(|b| b.status != SignalStatus::Pending)
            .map(|b| b.stake)
            .sum();
        let total_profit: f64 = self.state.bets.values().map(|b| b.profit).sum();
        let decided = won + lost;

        BankrollStats {
            balance: self.state.balance,
            initial: self.state.initial,
            peak: self.state.peak,
            drawdown: self.drawdown(),
            total_bets: self.state.bets.len(),
            settled: won + lost + void,
            won,
            lost,
            void,
            pending,
            win_rate: if decided > 0 { won as f64 / decided as f64 } else { 0.0 },
            total_staked,
            total_profit,
            roi: if total_staked > 0.0 { total_profit / total_staked } else { 0.0 },
            losing_streak: self.state.losing_streak,
            kelly_fraction: self.kelly_multiplier(),
            daily_pnl: if now.date_naive() == self.state.day { self.state.daily_pnl } else { 0.0 },
            weekly_pnl: if iso_week(now) == self.state.week { self.state.weekly_pnl } else { 0.0 },
            halted: self.state.halted,
            halt_reason: self.state.halt_reason.clone(),
        }
    }
}
