use approx::assert_relative_eq;
use chrono::{DateTime, Duration, TimeZone, Utc};

use valuebet_engine::betting::bankroll::{BankrollController, BankrollError, BetKind};
use valuebet_engine::config::{BettingConfig, EngineSettings, ModelConfig};
use valuebet_engine::models::{
    Confidence, Fixture, Market, MatchRecord, Outcome, OutcomeMap, QuotedPriceSet, SettleResult, SignalStatus,
};
use valuebet_engine::predict::ensemble::{Blend, Source};
use valuebet_engine::ValueEngine;

fn kickoff() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, 12, 14, 0, 0).unwrap()
}

fn quote(bookmaker: &str, home: f64, draw: f64, away: f64) -> QuotedPriceSet {
    QuotedPriceSet {
        bookmaker: bookmaker.into(),
        market: Market::MatchResult,
        prices: OutcomeMap::from([(Outcome::Home, home), (Outcome::Draw, draw), (Outcome::Away, away)]),
        snapshot_at: kickoff() - Duration::hours(20),
    }
}

/// Five bookmakers, best home price 2.10 at Bet365.
fn fixture(home: &str, away: &str) -> Fixture {
    let mut quotes = vec![quote("Bet365", 2.10, 3.40, 3.60)];
    for book in ["Pinnacle", "Unibet", "William Hill", "Betfair"] {
        quotes.push(quote(book, 2.00, 3.30, 3.50));
    }
    Fixture {
        id: format!("{}-{}", home, away).to_lowercase(),
        sport: "soccer".into(),
        league: "EPL".into(),
        home_team: home.into(),
        away_team: away.into(),
        commence_time: kickoff(),
        quotes,
    }
}

#[test]
fn value_single_is_detected_sized_and_settled() {
    let engine = ValueEngine::new(EngineSettings::default());
    let f = fixture("Arsenal", "Chelsea");
    let blend = Blend {
        market: Market::MatchResult,
        probabilities: OutcomeMap::from([(Outcome::Home, 0.55), (Outcome::Draw, 0.25), (Outcome::Away, 0.20)]),
        sources: vec![Source::DixonColes, Source::MarketConsensus],
    };

    let signals = engine.evaluate_blend(&f, &blend, kickoff() - Duration::hours(3));
    assert_eq!(signals.len(), 1);
    let s = &signals[0];
    assert_eq!(s.outcome, Outcome::Home);
    assert_eq!(s.bookmaker, "Bet365");
    assert_relative_eq!(s.edge, 0.155, epsilon = 1e-9);
    assert_eq!(s.confidence, Confidence::Medium);
    assert!(s.sharp_agrees);
    assert!(s.stake > 0.0);
    // never above the 4% single-bet cap
    assert!(s.stake <= 40.0);

    engine.record_signal(s).unwrap();
    assert_relative_eq!(engine.stats().balance, 1000.0 - s.stake, epsilon = 1e-9);

    let profit = engine.settle(&s.id, SettleResult::Won).unwrap();
    assert_relative_eq!(profit, s.stake * 1.10, epsilon = 1e-9);
    assert_relative_eq!(engine.stats().balance, 1000.0 + profit, epsilon = 1e-9);
}

#[test]
fn settlement_is_idempotent() {
    let engine = ValueEngine::new(EngineSettings::default());
    let f = fixture("Arsenal", "Chelsea");
    let blend = Blend {
        market: Market::MatchResult,
        probabilities: OutcomeMap::from([(Outcome::Home, 0.55), (Outcome::Draw, 0.25), (Outcome::Away, 0.20)]),
        sources: vec![Source::Elo, Source::MarketConsensus],
    };
    let signal = engine.evaluate_blend(&f, &blend, kickoff() - Duration::hours(3)).remove(0);
    engine.record_signal(&signal).unwrap();

    // the same opportunity found by a re-scan cannot be recorded twice
    assert!(matches!(engine.record_signal(&signal), Err(BankrollError::DuplicateBet(_))));

    let first = engine.settle(&signal.id, SettleResult::Lost);
    let balance = engine.stats().balance;
    assert_eq!(first, Some(-signal.stake));
    assert_eq!(engine.settle(&signal.id, SettleResult::Won), None);
    assert_eq!(engine.settle(&signal.id, SettleResult::Lost), None);
    assert_relative_eq!(engine.stats().balance, balance);
    assert_eq!(engine.stats().lost, 1);
    assert_eq!(engine.settle("never-recorded", SettleResult::Won), None);
}

#[test]
fn seventh_straight_loss_halts_betting() {
    let mut bankroll = BankrollController::new(BettingConfig::default());
    for i in 0..6 {
        let id = format!("bet-{}", i);
        bankroll.record_bet(&id, BetKind::Single, 5.0, 2.0).unwrap();
        bankroll.settle(&id, SettleResult::Lost);
    }
    assert!(!bankroll.is_halted());
    assert_eq!(bankroll.stats().losing_streak, 6);

    bankroll.record_bet("bet-6", BetKind::Single, 5.0, 2.0).unwrap();
    bankroll.settle("bet-6", SettleResult::Lost);
    assert!(bankroll.is_halted());
    assert_eq!(bankroll.halt_reason(), Some("7 consecutive losses"));
    assert_eq!(bankroll.single_stake(0.6, 2.0), 0.0);
    assert!(matches!(
        bankroll.record_bet("bet-7", BetKind::Single, 5.0, 2.0),
        Err(BankrollError::Halted(_))
    ));

    bankroll.reset();
    assert!(!bankroll.is_halted());
    assert!(bankroll.single_stake(0.6, 2.0) > 0.0);
}

/// Same book as `fixture` with the home price moved: `home_price` at Bet365,
/// 0.05 less everywhere else.
fn priced(home: &str, away: &str, home_price: f64) -> Fixture {
    let mut f = fixture(home, away);
    for q in &mut f.quotes {
        let shade = if q.bookmaker == "Bet365" { 0.0 } else { 0.05 };
        q.prices.insert(Outcome::Home, home_price - shade);
    }
    f
}

fn history() -> Vec<MatchRecord> {
    let teams = ["Arsenal", "Brentford", "Chelsea", "Everton", "Fulham", "Wolves"];
    let start = Utc.with_ymd_and_hms(2025, 8, 9, 15, 0, 0).unwrap();
    let mut out = Vec::new();
    let mut k = 0i64;
    for round in 0..3 {
        for (h, home) in teams.iter().enumerate() {
            for (a, away) in teams.iter().enumerate() {
                if h == a {
                    continue;
                }
                let gap = a as i64 - h as i64;
                out.push(MatchRecord {
                    home_team: home.to_string(),
                    away_team: away.to_string(),
                    home_goals: (1 + gap / 2 + (k + round) % 3).max(0) as u32,
                    away_goals: ((-gap) / 2 + k % 2).max(0) as u32,
                    played_at: start + Duration::days(k * 2),
                });
                k += 1;
            }
        }
    }
    out
}

#[test]
fn fitted_models_feed_the_scan() {
    let settings = EngineSettings {
        model: ModelConfig {
            min_training_matches: 20,
            max_iterations: 20_000,
            ..ModelConfig::default()
        },
        ..EngineSettings::default()
    };
    let mut engine = ValueEngine::new(settings);
    let history = history();
    let as_of = history.last().unwrap().played_at + Duration::days(1);
    engine.fit(&history, as_of).expect("scoring model converges");
    assert!(engine.scoring().snapshot().is_some());
    assert_eq!(engine.ratings().team_count(), 6);

    let f = fixture("Arsenal", "Wolves");
    let blends = engine.blends(&f);
    let result = blends.iter().find(|b| b.market == Market::MatchResult).unwrap();
    assert!(result.sources.contains(&Source::Elo));
    assert!(result.sources.contains(&Source::MarketConsensus));
    assert!(result.sources.contains(&Source::DixonColes));
    let total: f64 = result.probabilities.values().sum();
    assert_relative_eq!(total, 1.0, epsilon = 1e-9);

    // unknown teams only get the market view
    let unknown = engine.blends(&fixture("Leeds", "Burnley"));
    let consensus = unknown.iter().find(|b| b.market == Market::MatchResult).unwrap();
    assert_eq!(consensus.sources, vec![Source::MarketConsensus]);

    // Price the home side about 10% above the blended probability. The market
    // view moves with the price, so settle it over a few rounds.
    let mut price = 2.10;
    for _ in 0..6 {
        let blend = engine
            .blends(&priced("Chelsea", "Everton", price))
            .into_iter()
            .find(|b| b.market == Market::MatchResult)
            .unwrap();
        assert_eq!(blend.sources.len(), 3);
        price = 1.10 / blend.probabilities[&Outcome::Home];
    }
    let value = priced("Chelsea", "Everton", price);

    let report = engine.scan_at(&[value.clone(), fixture("Leeds", "Burnley")], kickoff() - Duration::hours(2));
    assert_eq!(report.fixtures, 2);
    let home = report
        .signals
        .iter()
        .find(|s| s.fixture.id == value.id && s.outcome == Outcome::Home)
        .expect("home side is value");
    assert_eq!(home.bookmaker, "Bet365");
    assert_eq!(home.model_count, 3);
    assert!(home.edge > 0.05 && home.edge < 0.15);
    for s in &report.signals {
        assert_eq!(s.status, SignalStatus::Pending);
        assert!(s.edge >= 0.03 && s.edge <= 0.25);
        assert!(s.price >= 1.35 && s.price <= 5.50);
    }
    for pair in report.signals.windows(2) {
        assert!(pair[0].edge >= pair[1].edge);
    }
}
