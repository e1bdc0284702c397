use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Goals line of the `Totals` market.
pub const TOTALS_LINE: f64 = 2.5;

/// Betting market a price set quotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    /// 1X2 match result
    MatchResult,
    /// Total goals over/under 2.5
    Totals,
}

impl Market {
    pub fn outcomes(self) -> &'static [Outcome] {
        match self {
            Market::MatchResult => &[Outcome::Home, Outcome::Draw, Outcome::Away],
            Market::Totals => &[Outcome::Over, Outcome::Under],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Market::MatchResult => "h2h",
            Market::Totals => "totals",
        }
    }
}

/// Closed set of outcome labels. External strings are mapped in
/// `as_str` / `FromStr` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Home,
    Draw,
    Away,
    Over,
    Under,
}

impl Outcome {
    pub fn market(self) -> Market {
        match self {
            Outcome::Home | Outcome::Draw | Outcome::Away => Market::MatchResult,
            Outcome::Over | Outcome::Under => Market::Totals,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Home => "home",
            Outcome::Draw => "draw",
            Outcome::Away => "away",
            Outcome::Over => "over",
            Outcome::Under => "under",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "home" | "1" => Ok(Outcome::Home),
            "draw" | "x" => Ok(Outcome::Draw),
            "away" | "2" => Ok(Outcome::Away),
            "over" => Ok(Outcome::Over),
            "under" => Ok(Outcome::Under),
            other => Err(format!("unknown outcome '{}'", other)),
        }
    }
}

/// Probability (or price) per outcome of one market.
pub type OutcomeMap = BTreeMap<Outcome, f64>;

/// One bookmaker's decimal prices for a market at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotedPriceSet {
    pub bookmaker: String,
    pub market: Market,
    pub prices: OutcomeMap,
    pub snapshot_at: DateTime<Utc>,
}

/// An upcoming fixture with every bookmaker's latest prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
    pub id: String,
    pub sport: String,
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub commence_time: DateTime<Utc>,
    #[serde(default)]
    pub quotes: Vec<QuotedPriceSet>,
}

impl Fixture {
    fn quotes_for(&self, market: Market) -> impl Iterator<Item = &QuotedPriceSet> {
        self.quotes.iter().filter(move |q| q.market == market)
    }

    /// Highest price for an outcome and the bookmaker offering it.
    pub fn best_price(&self, outcome: Outcome) -> Option<(f64, &str)> {
        let mut best: Option<(f64, &str)> = None;
        for quote in self.quotes_for(outcome.market()) {
            if let Some(&price) = quote.prices.get(&outcome) {
                if price > 1.0 && best.map_or(true, |(p, _)| price > p) {
                    best = Some((price, quote.bookmaker.as_str()));
                }
            }
        }
        best
    }

    /// Simple average price per outcome across bookmakers.
    pub fn average_prices(&self, market: Market) -> OutcomeMap {
        let mut sums: BTreeMap<Outcome, (f64, u32)> = BTreeMap::new();
        for quote in self.quotes_for(market) {
            for (&outcome, &price) in &quote.prices {
                if price > 0.0 {
                    let entry = sums.entry(outcome).or_insert((0.0, 0));
                    entry.0 += price;
                    entry.1 += 1;
                }
            }
        }
        sums.into_iter()
            .map(|(o, (sum, n))| (o, sum / n as f64))
            .collect()
    }

    /// Bookmaker margin on the average prices: `Σ 1/price − 1`.
    pub fn overround(&self, market: Market) -> f64 {
        let avg = self.average_prices(market);
        if avg.is_empty() {
            return 0.0;
        }
        avg.values().map(|p| 1.0 / p).sum::<f64>() - 1.0
    }

    /// Number of distinct bookmakers quoting a market.
    pub fn bookmaker_count(&self, market: Market) -> usize {
        self.quotes_for(market)
            .map(|q| q.bookmaker.to_lowercase())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Price quoted by a specific bookmaker (case-insensitive).
    pub fn price_from(&self, bookmaker: &str, outcome: Outcome) -> Option<f64> {
        self.quotes_for(outcome.market())
            .find(|q| q.bookmaker.eq_ignore_ascii_case(bookmaker))
            .and_then(|q| q.prices.get(&outcome).copied())
    }

    pub fn reference(&self) -> FixtureRef {
        FixtureRef {
            id: self.id.clone(),
            league: self.league.clone(),
            home_team: self.home_team.clone(),
            away_team: self.away_team.clone(),
            commence_time: self.commence_time,
        }
    }
}

/// A settled historical match used to fit the models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    pub home_team: String,
    pub away_team: String,
    pub home_goals: u32,
    pub away_goals: u32,
    pub played_at: DateTime<Utc>,
}

/// The fixture fields a signal or leg needs once detached from the fixture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureRef {
    pub id: String,
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub commence_time: DateTime<Utc>,
}

impl FixtureRef {
    pub fn match_day(&self) -> NaiveDate {
        self.commence_time.date_naive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Pending,
    Won,
    Lost,
    Void,
    Expired,
}

impl SignalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalStatus::Pending => "pending",
            SignalStatus::Won => "won",
            SignalStatus::Lost => "lost",
            SignalStatus::Void => "void",
            SignalStatus::Expired => "expired",
        }
    }
}

/// Result reported by the operator when a bet is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SettleResult {
    Won,
    Lost,
    Void,
}

impl From<SettleResult> for SignalStatus {
    fn from(r: SettleResult) -> Self {
        match r {
            SettleResult::Won => SignalStatus::Won,
            SettleResult::Lost => SignalStatus::Lost,
            SettleResult::Void => SignalStatus::Void,
        }
    }
}

/// A candidate single-outcome bet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueSignal {
    /// Stable per (fixture, market, outcome).
    pub id: String,
    pub fixture: FixtureRef,
    pub market: Market,
    pub outcome: Outcome,
    pub probability: f64,
    pub price: f64,
    pub bookmaker: String,
    pub edge: f64,
    pub overround: f64,
    pub confidence: Confidence,
    pub model_count: usize,
    pub sharp_agrees: bool,
    pub stake: f64,
    /// Stake as a fraction of the bankroll at sizing time.
    pub stake_fraction: f64,
    pub status: SignalStatus,
    pub created_at: DateTime<Utc>,
}

impl ValueSignal {
    pub fn signal_id(fixture_id: &str, outcome: Outcome) -> String {
        format!("{}:{}:{}", fixture_id, outcome.market().as_str(), outcome.as_str())
    }

    /// Apply a settlement result. Only pending signals move.
    pub fn settle(&mut self, result: SettleResult) -> bool {
        if self.status != SignalStatus::Pending {
            return false;
        }
        self.status = result.into();
        true
    }

    /// Expire a pending signal whose fixture already started.
    pub fn expire_if_started(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == SignalStatus::Pending && self.fixture.commence_time <= now {
            self.status = SignalStatus::Expired;
            return true;
        }
        false
    }
}

/// One selection inside a multi-leg bet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    pub signal_id: String,
    pub fixture: FixtureRef,
    pub outcome: Outcome,
    pub price: f64,
    pub probability: f64,
    pub edge: f64,
}

impl From<&ValueSignal> for Leg {
    fn from(s: &ValueSignal) -> Self {
        Leg {
            signal_id: s.id.clone(),
            fixture: s.fixture.clone(),
            outcome: s.outcome,
            price: s.price,
            probability: s.probability,
            edge: s.edge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MultiLegKind {
    Express,
    /// Every `size`-leg subset of the legs is a separate combination.
    System { size: usize },
}

/// Express (parlay) or system bet. Aggregates are recomputed from the legs on
/// every call, so they can never drift from the leg data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiLegBet {
    pub id: String,
    pub kind: MultiLegKind,
    pub legs: Vec<Leg>,
    /// In (0, 1]; 1.0 for systems.
    pub correlation_discount: f64,
    /// Whole stake for an express, per-combination stake for a system.
    pub stake: f64,
    pub status: SignalStatus,
    pub created_at: DateTime<Utc>,
}

impl MultiLegBet {
    pub fn new(kind: MultiLegKind, legs: Vec<Leg>, correlation_discount: f64) -> Self {
        MultiLegBet {
            id: format!("{:08x}", rand::random::<u32>()),
            kind,
            legs,
            correlation_discount,
            stake: 0.0,
            status: SignalStatus::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn total_price(&self) -> f64 {
        self.legs.iter().map(|l| l.price).product()
    }

    /// Joint probability assuming independent legs.
    pub fn combined_probability(&self) -> f64 {
        self.legs.iter().map(|l| l.probability).product()
    }

    pub fn adjusted_probability(&self) -> f64 {
        self.combined_probability() * self.correlation_discount
    }

    pub fn expected_value(&self) -> f64 {
        self.combined_probability() * self.total_price() - 1.0
    }

    pub fn adjusted_expected_value(&self) -> f64 {
        self.adjusted_probability() * self.total_price() - 1.0
    }

    pub fn potential_payout(&self) -> f64 {
        self.stake * self.total_price()
    }

    pub fn combinations(&self) -> u64 {
        match self.kind {
            MultiLegKind::Express => 1,
            MultiLegKind::System { size } => binomial(self.legs.len(), size),
        }
    }

    pub fn total_stake(&self) -> f64 {
        self.stake * self.combinations() as f64
    }

    pub fn average_leg_probability(&self) -> f64 {
        if self.legs.is_empty() {
            return 0.0;
        }
        self.expected_winning_legs() / self.legs.len() as f64
    }

    pub fn expected_winning_legs(&self) -> f64 {
        self.legs.iter().map(|l| l.probability).sum()
    }
}

/// `n choose k`, 0 when `k > n`.
pub fn binomial(n: usize, k: usize) -> u64 {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut acc: u64 = 1;
    for i in 0..k {
        acc = acc * (n - i) as u64 / (i + 1) as u64;
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn quote(bookmaker: &str, home: f64, draw: f64, away: f64) -> QuotedPriceSet {
        QuotedPriceSet {
            bookmaker: bookmaker.into(),
            market: Market::MatchResult,
            prices: BTreeMap::from([
                (Outcome::Home, home),
                (Outcome::Draw, draw),
                (Outcome::Away, away),
            ]),
            snapshot_at: Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap(),
        }
    }

    fn fixture() -> Fixture {
        Fixture {
            id: "f1".into(),
            sport: "soccer".into(),
            league: "EPL".into(),
            home_team: "Arsenal".into(),
            away_team: "Chelsea".into(),
            commence_time: Utc.with_ymd_and_hms(2026, 3, 1, 15, 0, 0).unwrap(),
            quotes: vec![
                quote("Bet365", 2.10, 3.40, 3.60),
                quote("Pinnacle", 2.05, 3.50, 3.80),
                quote("Unibet", 2.00, 3.30, 3.90),
            ],
        }
    }

    #[test]
    fn best_price_picks_highest_quote_and_its_bookmaker() {
        let f = fixture();
        assert_eq!(f.best_price(Outcome::Home), Some((2.10, "Bet365")));
        assert_eq!(f.best_price(Outcome::Away), Some((3.90, "Unibet")));
        assert_eq!(f.best_price(Outcome::Over), None);
    }

    #[test]
    fn average_prices_and_overround() {
        let f = fixture();
        let avg = f.average_prices(Market::MatchResult);
        assert_relative_eq!(avg[&Outcome::Home], 2.05, epsilon = 1e-9);
        let expected = 1.0 / 2.05 + 1.0 / 3.40 + 1.0 / (11.3 / 3.0) - 1.0;
        assert_relative_eq!(f.overround(Market::MatchResult), expected, epsilon = 1e-9);
        assert_eq!(f.overround(Market::Totals), 0.0);
    }

    #[test]
    fn bookmaker_count_is_case_insensitive() {
        let mut f = fixture();
        f.quotes.push(quote("bet365", 2.0, 3.0, 4.0));
        assert_eq!(f.bookmaker_count(Market::MatchResult), 3);
        assert_eq!(f.price_from("pinnacle", Outcome::Draw), Some(3.50));
    }

    #[test]
    fn outcome_string_mapping_round_trips() {
        for o in [Outcome::Home, Outcome::Draw, Outcome::Away, Outcome::Over, Outcome::Under] {
            assert_eq!(o.as_str().parse::<Outcome>(), Ok(o));
        }
        assert!("btts".parse::<Outcome>().is_err());
    }

    #[test]
    fn signal_settles_only_once() {
        let f = fixture();
        let mut s = ValueSignal {
            id: ValueSignal::signal_id(&f.id, Outcome::Home),
            fixture: f.reference(),
            market: Market::MatchResult,
            outcome: Outcome::Home,
            probability: 0.55,
            price: 2.1,
            bookmaker: "Bet365".into(),
            edge: 0.155,
            overround: 0.05,
            confidence: Confidence::Medium,
            model_count: 2,
            sharp_agrees: true,
            stake: 10.0,
            stake_fraction: 0.01,
            status: SignalStatus::Pending,
            created_at: Utc::now(),
        };
        assert_eq!(s.id, "f1:h2h:home");
        assert!(s.settle(SettleResult::Won));
        assert!(!s.settle(SettleResult::Lost));
        assert_eq!(s.status, SignalStatus::Won);
        assert!(!s.expire_if_started(Utc::now()));
    }

    #[test]
    fn multi_leg_aggregates_follow_legs() {
        let f = fixture();
        let leg = |p: f64, price: f64| Leg {
            signal_id: "s".into(),
            fixture: f.reference(),
            outcome: Outcome::Home,
            price,
            probability: p,
            edge: p * price - 1.0,
        };
        let mut bet = MultiLegBet::new(MultiLegKind::Express, vec![leg(0.6, 1.9), leg(0.55, 2.0)], 0.9);
        assert_relative_eq!(bet.total_price(), 3.8, epsilon = 1e-12);
        assert_relative_eq!(bet.combined_probability(), 0.33, epsilon = 1e-12);
        assert_relative_eq!(bet.adjusted_probability(), 0.297, epsilon = 1e-12);
        assert_relative_eq!(bet.adjusted_expected_value(), 0.297 * 3.8 - 1.0, epsilon = 1e-12);
        bet.legs.pop();
        assert_relative_eq!(bet.total_price(), 1.9, epsilon = 1e-12);
        bet.stake = 10.0;
        assert_relative_eq!(bet.potential_payout(), 19.0, epsilon = 1e-12);
    }

    #[test]
    fn binomial_counts_combinations() {
        assert_eq!(binomial(4, 3), 4);
        assert_eq!(binomial(5, 3), 10);
        assert_eq!(binomial(50, 5), 2_118_760);
        assert_eq!(binomial(3, 4), 0);
    }
}
