use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info, warn};

use valuebet_engine::betting::bankroll::{BankrollError, BankrollState};
use valuebet_engine::config::{Command, Config, EngineSettings, ScanArgs};
use valuebet_engine::db::{Database, BANKROLL_SNAPSHOT, RATINGS_SNAPSHOT, SCORING_SNAPSHOT};
use valuebet_engine::feed::{FixtureSource, JsonFileSource};
use valuebet_engine::models::{SettleResult, SignalStatus};
use valuebet_engine::predict::dixon_coles::ScoringParams;
use valuebet_engine::predict::elo::TeamRating;
use valuebet_engine::{ScanReport, ValueEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let settings = config.engine_settings()?;

    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    let engine = match db.load_snapshot::<BankrollState>(BANKROLL_SNAPSHOT)? {
        Some(state) => {
            if config.initial_balance.is_some() {
                warn!("Bankroll snapshot exists, ignoring --initial-balance");
            }
            info!("Resuming bankroll at {:.2}", state.balance);
            ValueEngine::from_state(settings, state)
        }
        None => {
            info!("Starting bankroll at {:.2}", settings.betting.initial_bankroll);
            ValueEngine::new(settings)
        }
    };

    match config.command {
        Command::Scan(args) => {
            let (engine, report) = run_cycle(engine, &db, &args, true).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            save_bankroll(&db, &engine)?;
        }
        Command::Watch { scan, interval_secs } => {
            watch(engine, db, scan, Duration::from_secs(interval_secs)).await?;
        }
        Command::Settle { signal_id, result } => {
            settle(&engine, &db, &signal_id, result)?;
            println!("{}", serde_json::to_string_pretty(&engine.stats())?);
        }
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&engine.stats())?);
        }
        Command::Reset => {
            engine.reset();
            save_bankroll(&db, &engine)?;
            println!("{}", serde_json::to_string_pretty(&engine.stats())?);
        }
    }

    Ok(())
}

/// Repeat the scan until Ctrl-C. Models are fitted on the first cycle only.
async fn watch(mut engine: ValueEngine, db: Database, args: ScanArgs, every: Duration) -> Result<()> {
    let settings = engine.settings().clone();
    let mut interval = tokio::time::interval(every);
    let mut first = true;
    info!("👀 Watching {} every {}s", args.fixtures.display(), every.as_secs());

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if engine.is_halted() {
                    warn!("🛑 Bankroll halted, skipping cycle (run `reset` to resume)");
                    continue;
                }
                match run_cycle(engine, &db, &args, first).await {
                    Ok((next, report)) => {
                        engine = next;
                        first = false;
                        for m in report.line_moves.iter().filter(|m| m.sharp) {
                            info!(
                                "Sharp move {} {}: {:.2} → {:.2}",
                                m.fixture_id, m.outcome, m.previous_price, m.current_price
                            );
                        }
                        if let Err(e) = save_bankroll(&db, &engine) {
                            error!("Failed to save bankroll snapshot: {}", e);
                        }
                    }
                    Err(e) => {
                        // The engine moved into the failed cycle; reload from the last snapshot.
                        error!("Scan cycle failed: {:#}", e);
                        engine = reload(&db, settings.clone())?;
                        first = true;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                save_bankroll(&db, &engine)?;
                return Ok(());
            }
        }
    }
}

fn reload(db: &Database, settings: EngineSettings) -> Result<ValueEngine> {
    Ok(match db.load_snapshot::<BankrollState>(BANKROLL_SNAPSHOT)? {
        Some(state) => ValueEngine::from_state(settings, state),
        None => ValueEngine::new(settings),
    })
}

/// Load data, fit (or restore) the models off the async runtime, scan, and
/// persist the outcome.
async fn run_cycle(
    mut engine: ValueEngine,
    db: &Database,
    args: &ScanArgs,
    fit: bool,
) -> Result<(ValueEngine, ScanReport)> {
    let source = JsonFileSource::new(&args.fixtures, args.history.clone());
    let fixtures = source.fetch_fixtures().await?;
    info!("{}: {} fixture(s)", source.name(), fixtures.len());

    let history = if fit { source.fetch_results().await? } else { Vec::new() };
    if fit && history.is_empty() {
        restore_models(&mut engine, db)?;
    }

    let record = args.record;
    let (engine, report, recorded) = tokio::task::spawn_blocking(move || {
        if !history.is_empty() {
            info!("Fitting models on {} matches", history.len());
            if let Err(e) = engine.fit(&history, Utc::now()) {
                warn!("Scoring model fit failed, continuing without it: {}", e);
            }
        }
        let report = engine.scan(&fixtures);
        let recorded = if record { record_stakes(&engine, &report) } else { Vec::new() };
        (engine, report, recorded)
    })
    .await
    .context("Scan worker panicked")?;

    persist_report(db, &report, &recorded)?;
    if fit {
        if let Some(params) = engine.scoring().snapshot() {
            db.save_snapshot(SCORING_SNAPSHOT, &params)?;
        }
        if engine.ratings().team_count() > 0 {
            db.save_snapshot(RATINGS_SNAPSHOT, &engine.ratings().snapshot())?;
        }
    }
    Ok((engine, report))
}

fn restore_models(engine: &mut ValueEngine, db: &Database) -> Result<()> {
    if let Some(params) = db.load_snapshot::<ScoringParams>(SCORING_SNAPSHOT)? {
        info!("Restored scoring model fitted at {}", params.fitted_at);
        engine.scoring_mut().restore(params);
    }
    if let Some(ratings) = db.load_snapshot::<HashMap<String, TeamRating>>(RATINGS_SNAPSHOT)? {
        info!("Restored {} team ratings", ratings.len());
        engine.ratings_mut().restore(ratings);
    }
    Ok(())
}

/// Debit every staked single and multi-leg bet. Returns the recorded ids.
fn record_stakes(engine: &ValueEngine, report: &ScanReport) -> Vec<String> {
    let mut recorded = Vec::new();
    let singles = report
        .signals
        .iter()
        .filter(|s| s.stake > 0.0)
        .map(|s| (s.id.as_str(), engine.record_signal(s)));
    let multis = report
        .expresses
        .iter()
        .chain(&report.systems)
        .filter(|b| b.stake > 0.0)
        .map(|b| (b.id.as_str(), engine.record_multi_leg(b)));

    for (id, outcome) in singles.chain(multis) {
        match outcome {
            Ok(()) => recorded.push(id.to_string()),
            Err(BankrollError::DuplicateBet(_)) => {}
            Err(BankrollError::Halted(reason)) => {
                warn!("Recording stopped: {}", reason);
                break;
            }
            Err(e) => warn!("Bet {} not recorded: {}", id, e),
        }
    }
    if !recorded.is_empty() {
        info!("💰 Recorded {} bet(s), balance {:.2}", recorded.len(), engine.stats().balance);
    }
    recorded
}

fn persist_report(db: &Database, report: &ScanReport, recorded: &[String]) -> Result<()> {
    let was_recorded = |id: &str| recorded.iter().any(|r| r == id);
    for signal in &report.signals {
        db.upsert_signal(signal, was_recorded(&signal.id))?;
    }
    for bet in report.expresses.iter().chain(&report.systems) {
        db.insert_multi_leg(bet, was_recorded(&bet.id))?;
    }
    let expired = db.expire_started(report.generated_at)?;
    if expired > 0 {
        info!("Expired {} signal(s) whose fixture kicked off", expired);
    }
    Ok(())
}

fn settle(engine: &ValueEngine, db: &Database, id: &str, result: SettleResult) -> Result<()> {
    let Some(profit) = engine.settle(id, result) else {
        anyhow::bail!("No pending bet with id {}", id);
    };
    let status = SignalStatus::from(result);
    if !db.update_signal_status(id, status)? && !db.update_multi_leg_status(id, status)? {
        warn!("Bet {} settled in the bankroll but missing from the signal log", id);
    }
    db.record_settlement(id, result, profit)?;
    save_bankroll(db, engine)?;
    info!("Settled {} as {}: {:+.2}", id, status.as_str(), profit);
    Ok(())
}

fn save_bankroll(db: &Database, engine: &ValueEngine) -> Result<()> {
    db.save_snapshot(BANKROLL_SNAPSHOT, &engine.bankroll_state())
}
