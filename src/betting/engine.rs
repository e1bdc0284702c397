use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::betting::bankroll::{BankrollController, BankrollError, BankrollState, BankrollStats, BetKind};
use crate::betting::express::{Combinations, MultiLegBuilder};
use crate::betting::movement::{LineMonitor, LineMove};
use crate::betting::value::{sort_by_edge, ValueDetector};
use crate::config::EngineSettings;
use crate::models::{Fixture, Market, MatchRecord, MultiLegBet, MultiLegKind, SettleResult, ValueSignal};
use crate::predict::dixon_coles::{FitError, ScoringModel};
use crate::predict::elo::RatingSystem;
use crate::predict::ensemble::{market_consensus, Blend, EnsembleBlender, OutcomeClassifier, Source, Unavailable};

/// Result of one scan cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub generated_at: DateTime<Utc>,
    pub fixtures: usize,
    pub signals: Vec<ValueSignal>,
    pub expresses: Vec<MultiLegBet>,
    pub systems: Vec<MultiLegBet>,
    pub line_moves: Vec<LineMove>,
    pub stats: BankrollStats,
}

/// The prediction and decision pipeline behind one facade. Models are
/// read-only between fits; the bankroll is the only shared mutable state and
/// sits behind a mutex so record and settle calls are serialised.
pub struct ValueEngine {
    settings: EngineSettings,
    scoring: ScoringModel,
    ratings: RatingSystem,
    classifier: Box<dyn OutcomeClassifier>,
    blender: EnsembleBlender,
    detector: ValueDetector,
    builder: MultiLegBuilder,
    bankroll: Mutex<BankrollController>,
    lines: Mutex<LineMonitor>,
}

impl ValueEngine {
    pub fn new(settings: EngineSettings) -> Self {
        let bankroll = BankrollController::new(settings.betting.clone());
        Self::with_bankroll(settings, bankroll)
    }

    /// Resume from a persisted bankroll.
    pub fn from_state(settings: EngineSettings, state: BankrollState) -> Self {
        let bankroll = BankrollController::from_state(settings.betting.clone(), state);
        Self::with_bankroll(settings, bankroll)
    }

    fn with_bankroll(settings: EngineSettings, bankroll: BankrollController) -> Self {
        ValueEngine {
            scoring: ScoringModel::new(settings.model.clone()),
            ratings: RatingSystem::new(settings.model.clone()),
            classifier: Box::new(Unavailable),
            blender: EnsembleBlender::new(settings.model.ensemble_weights.clone()),
            detector: ValueDetector::new(settings.betting.clone()),
            builder: MultiLegBuilder::new(settings.betting.clone()),
            lines: Mutex::new(LineMonitor::new(settings.betting.line_drop_threshold)),
            bankroll: Mutex::new(bankroll),
            settings,
        }
    }

    pub fn with_classifier(mut self, classifier: Box<dyn OutcomeClassifier>) -> Self {
        info!("Using outcome classifier: {}", classifier.name());
        self.classifier = classifier;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn scoring(&self) -> &ScoringModel {
        &self.scoring
    }

    pub fn scoring_mut(&mut self) -> &mut ScoringModel {
        &mut self.scoring
    }

    pub fn ratings(&self) -> &RatingSystem {
        &self.ratings
    }

    pub fn ratings_mut(&mut self) -> &mut RatingSystem {
        &mut self.ratings
    }

    /// Refit both models on a settled history. The rating system always
    /// refits; the scoring model may fail and is then left un-fitted.
    pub fn fit(&mut self, history: &[MatchRecord], as_of: DateTime<Utc>) -> Result<(), FitError> {
        self.ratings.fit(history);
        self.scoring.fit(history, as_of).map(|_| ())
    }

    /// Blended distribution per market for one fixture.
    pub fn blends(&self, fixture: &Fixture) -> Vec<Blend> {
        let score = self.scoring.predict(&fixture.home_team, &fixture.away_team);
        let method = self.settings.betting.devig_method;

        let mut blends = Vec::new();
        for market in [Market::MatchResult, Market::Totals] {
            let mut inputs = Vec::new();
            if let Some(p) = &score {
                inputs.push((Source::DixonColes, p.probabilities(market)));
            }
            if let Some(p) = self.ratings.predict_market(&fixture.home_team, &fixture.away_team, market) {
                inputs.push((Source::Elo, p));
            }
            if let Some(p) = market_consensus(fixture, market, method) {
                inputs.push((Source::MarketConsensus, p));
            }
            if let Some(p) = self.classifier.predict(fixture, market) {
                inputs.push((Source::Classifier, p));
            }

            match self.blender.blend(market, &inputs) {
                Some(blend) => blends.push(blend),
                None => debug!("{}: no source for {}, skipping", fixture.id, market.as_str()),
            }
        }
        blends
    }

    /// Unsized signals for one fixture.
    pub fn analyze(&self, fixture: &Fixture, now: DateTime<Utc>) -> Vec<ValueSignal> {
        if fixture.commence_time <= now {
            debug!("{} already started, skipping", fixture.id);
            return Vec::new();
        }
        let blends = self.blends(fixture);
        self.detector.detect(fixture, &blends, now)
    }

    /// Signals for a fixture against a blend supplied by the caller, sized
    /// against the current bankroll.
    pub fn evaluate_blend(&self, fixture: &Fixture, blend: &Blend, now: DateTime<Utc>) -> Vec<ValueSignal> {
        let mut signals = self.detector.evaluate(fixture, blend, now);
        let bankroll = self.bankroll.lock().unwrap();
        size_singles(&bankroll, &mut signals);
        signals
    }

    pub fn scan(&self, fixtures: &[Fixture]) -> ScanReport {
        self.scan_at(fixtures, Utc::now())
    }

    pub fn scan_at(&self, fixtures: &[Fixture], now: DateTime<Utc>) -> ScanReport {
        let mut signals: Vec<ValueSignal> = Vec::new();
        let mut line_moves = Vec::new();
        {
            let mut lines = self.lines.lock().unwrap();
            lines.prune(now);
            for fixture in fixtures {
                line_moves.extend(lines.observe(fixture));
                signals.extend(self.analyze(fixture, now));
            }
        }
        sort_by_edge(&mut signals);

        let mut expresses = self.builder.build_expresses(&signals);
        let mut systems = self.builder.build_systems(&signals);

        let bankroll = self.bankroll.lock().unwrap();
        size_singles(&bankroll, &mut signals);
        for express in &mut expresses {
            express.stake = bankroll.express_stake(express);
        }
        for system in &mut systems {
            system.stake = bankroll.system_stake(system.combinations());
        }
        if bankroll.is_halted() {
            warn!("Bankroll halted ({}), all stakes are zero", bankroll.halt_reason().unwrap_or("unknown"));
        }

        info!(
            "🔎 Scan complete: {} fixtures, {} signals, {} expresses, {} systems, {} line moves",
            fixtures.len(),
            signals.len(),
            expresses.len(),
            systems.len(),
            line_moves.len()
        );

        ScanReport {
            generated_at: now,
            fixtures: fixtures.len(),
            signals,
            expresses,
            systems,
            line_moves,
            stats: bankroll.stats(),
        }
    }

    /// Debit a single signal's stake.
    pub fn record_signal(&self, signal: &ValueSignal) -> Result<(), BankrollError> {
        self.bankroll
            .lock()
            .unwrap()
            .record_bet(&signal.id, BetKind::Single, signal.stake, signal.price)
    }

    /// Debit a multi-leg bet's total stake. Systems are recorded at their
    /// mean combination price.
    pub fn record_multi_leg(&self, bet: &MultiLegBet) -> Result<(), BankrollError> {
        let (kind, price) = match bet.kind {
            MultiLegKind::Express => (BetKind::Express, bet.total_price()),
            MultiLegKind::System { size } => (BetKind::System, mean_combination_price(bet, size)),
        };
        self.bankroll
            .lock()
            .unwrap()
            .record_bet(&bet.id, kind, bet.total_stake(), price)
    }

    pub fn settle(&self, id: &str, result: SettleResult) -> Option<f64> {
        self.bankroll.lock().unwrap().settle(id, result)
    }

    pub fn stats(&self) -> BankrollStats {
        self.bankroll.lock().unwrap().stats()
    }

    pub fn is_halted(&self) -> bool {
        self.bankroll.lock().unwrap().is_halted()
    }

    pub fn reset(&self) {
        self.bankroll.lock().unwrap().reset();
    }

    pub fn bankroll_state(&self) -> BankrollState {
        self.bankroll.lock().unwrap().state().clone()
    }
}

fn size_singles(bankroll: &BankrollController, signals: &mut [ValueSignal]) {
    let balance = bankroll.balance();
    for signal in signals.iter_mut() {
        signal.stake = bankroll.single_stake(signal.probability, signal.price);
        signal.stake_fraction = if balance > 0.0 { signal.stake / balance } else { 0.0 };
    }
}

fn mean_combination_price(bet: &MultiLegBet, size: usize) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;
    for combo in Combinations::new(bet.legs.len(), size) {
        total += combo.iter().map(|&i| bet.legs[i].price).product::<f64>();
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    total / count as f64
}
