//! Runs a whole benchmark.
//!
//! [`run_benchmark`] goes through these steps:
//!
//! 1. open the run directory ([`RunContext`]), reusing it when the run id already exists
//! 2. load the card database and every seat's pool; a seat whose agent, pool or deck cannot be
//!    prepared is excluded and recorded, the others carry on
//! 3. build decks (in parallel, one dialogue per agent), or reuse those stored by an earlier
//!    run, or import the fixed decklist of the benchmark file
//! 4. write `.dck` files, deck records and the pool summary
//! 5. pair the seats and run every match not closed yet, with bounded parallelism; a match with
//!    some games logged resumes at its first missing game
//! 6. close the result log and recompute the report from it
//!
//! Each match runs on its own thread; a panic in one is recorded as an aborted match and does
//! not affect the others.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, Once};

use anyhow::Context;
use serde::Serialize;
use tracing::{error, info, instrument, trace, warn};

use crate::agent::DecisionAgent;
use crate::bench_config::{AgentEntry, BenchConfig};
use crate::card_pool::{load_pool_file, CardDatabase, CardPool, CompositionStats};
use crate::configuration::Configuration;
use crate::constraints::Constraints;
use crate::deck::builder::build_deck;
use crate::deck::decklist::parse_decklist;
use crate::deck::{Deck, DeckRecord, FormatRules};
use crate::engine::adapter::EngineAdapter;
use crate::engine::EngineConfig;
use crate::match_runner::{run_match, worker_failure, MatchSpec, Seat};
use crate::results::log::{LogRecord, MatchClosed, ResultSink, SeatExclusion};
use crate::results::report::BenchmarkReport;
use crate::results::{MatchResult, MatchStatus};
use crate::run_context::{new_run_id, CancelToken, RunContext, POOL_SUMMARY_FILE};
use crate::scheduler::MatchScheduler;

/// Run (or resume) the benchmark described by `bench`.
///
/// Returns the report recomputed from the result log. When `cancel` fires, running games are
/// recorded as aborted and the report covers the matches closed so far; the same `run_id`
/// resumes the run later.
pub fn run_benchmark(
    bench: &BenchConfig,
    settings: Configuration,
    run_id: Option<&str>,
    cancel: CancelToken,
) -> anyhow::Result<BenchmarkReport> {
    let run_id = run_id
        .map(str::to_string)
        .unwrap_or_else(|| new_run_id(&bench.run.run_id_prefix));
    let ctx = RunContext::init(bench, settings, &run_id, cancel)?;
    if settings.verbose {
        println!("Run {} in {}", ctx.run_id(), ctx.run_dir().display());
    }

    let seats = prepare_seats(bench, &ctx)?;
    let specs = plan_matches(bench, &ctx, &seats)?;
    info!(seats = seats.len(), matches = specs.len(), "matches planned");

    let evaluator = Evaluator {
        shared: Arc::new(WorkerShared {
            engine: bench.engine.clone(),
            settings,
            cancel: ctx.cancel().clone(),
            run_dir: ctx.run_dir().to_path_buf(),
            sink: ctx.sink()?,
        }),
    };
    evaluator.run(ctx.constraints().clone(), specs)?;
    drop(evaluator);

    let report = ctx.teardown()?;
    if settings.verbose {
        print!("{}", report.summary_table());
    }
    Ok(report)
}

/// Pool check of one seat.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolCheck {
    pub agent: String,
    pub result: Result<CompositionStats, String>,
}

/// Load every pool of `bench` and check that a legal deck can be built from it.
pub fn check_pools(bench: &BenchConfig) -> anyhow::Result<Vec<PoolCheck>> {
    let rules = bench.format_rules()?;
    let db = load_card_database(bench)?;
    Ok(bench
        .agents
        .iter()
        .map(|entry| {
            let result = load_seat_pool(entry, &db, rules).and_then(|pool| {
                rules.is_satisfiable(&pool)?;
                Ok(pool.stats())
            });
            PoolCheck {
                agent: entry.config.id.clone(),
                result,
            }
        })
        .collect())
}

fn load_card_database(bench: &BenchConfig) -> anyhow::Result<CardDatabase> {
    let path = &bench.card_database;
    CardDatabase::from_json_file(path)
        .with_context(|| format!("could not load card database {}", path.display()))
}

fn load_seat_pool(
    entry: &AgentEntry,
    db: &CardDatabase,
    rules: &FormatRules,
) -> Result<CardPool, String> {
    load_pool_file(&entry.config.id, &entry.pool, db, rules.set.as_deref(), rules.pool_size)
        .map_err(|e| format!("{}: {e}", entry.pool.display()))
}

struct Candidate<'a> {
    entry: &'a AgentEntry,
    agent: Arc<DecisionAgent>,
    pool: Arc<CardPool>,
}

#[derive(Serialize)]
struct SeatSummary {
    pool_file: PathBuf,
    pool: CompositionStats,
    deck: Option<DeckSummary>,
}

#[derive(Serialize)]
struct DeckSummary {
    colors: String,
    cards: usize,
    auto_completed: bool,
    composition: CompositionStats,
}

/// Agents, pools and decks of every seat that can play.
#[instrument(skip_all)]
fn prepare_seats(bench: &BenchConfig, ctx: &RunContext) -> anyhow::Result<Vec<Seat>> {
    let rules = bench.format_rules()?;
    let db = load_card_database(bench)?;
    let sink = ctx.sink()?;
    info!(cards = db.len(), "card database loaded");

    let mut summary = BTreeMap::new();
    let mut candidates = vec![];
    for entry in &bench.agents {
        let id = &entry.config.id;
        let agent = match DecisionAgent::from_config(Arc::new(entry.config.clone())) {
            Ok(agent) => agent.with_cancel(ctx.cancel().clone()),
            Err(e) => {
                exclude(ctx, &sink, id, "agent", e.to_string());
                continue;
            }
        };
        let pool = match load_seat_pool(entry, &db, rules) {
            Ok(pool) => Arc::new(pool),
            Err(reason) => {
                exclude(ctx, &sink, id, "pool", reason);
                continue;
            }
        };
        summary.insert(
            id.clone(),
            SeatSummary {
                pool_file: entry.pool.clone(),
                pool: pool.stats(),
                deck: None,
            },
        );
        candidates.push(Candidate {
            entry,
            agent: Arc::new(agent),
            pool,
        });
    }

    let decks = obtain_decks(&candidates, rules, ctx);
    let mut seats = vec![];
    for (candidate, deck) in candidates.iter().zip(decks) {
        let id = &candidate.entry.config.id;
        let deck = match deck {
            Ok(deck) => deck,
            Err(reason) => {
                exclude(ctx, &sink, id, "deck", reason);
                continue;
            }
        };
        let deck_file = deck
            .write_dck(&ctx.decks_dir(), id)
            .with_context(|| format!("could not export the deck of {id}"))?;
        write_json(&ctx.decks_dir().join(format!("{id}.json")), &deck.to_record())?;
        if let Some(seat) = summary.get_mut(id) {
            seat.deck = Some(DeckSummary {
                colors: deck.colors().iter().collect(),
                cards: deck.total_cards(),
                auto_completed: deck.auto_completed(),
                composition: deck.stats(),
            });
        }
        seats.push(Seat {
            agent: candidate.agent.clone(),
            deck: Arc::new(deck),
            deck_file,
        });
    }
    write_json(&ctx.run_dir().join(POOL_SUMMARY_FILE), &summary)?;
    Ok(seats)
}

/// One deck per candidate, in order: stored, imported or built.
fn obtain_decks(
    candidates: &[Candidate],
    rules: &FormatRules,
    ctx: &RunContext,
) -> Vec<Result<Deck, String>> {
    let decks_dir = ctx.decks_dir();
    std::thread::scope(|scope| {
        let handles: Vec<_> = candidates
            .iter()
            .map(|candidate| {
                let decks_dir = &decks_dir;
                scope.spawn(move || obtain_deck(candidate, rules, decks_dir))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err("deck building panicked".to_string()))
            })
            .collect()
    })
}

fn obtain_deck(
    candidate: &Candidate,
    rules: &FormatRules,
    decks_dir: &Path,
) -> Result<Deck, String> {
    let id = &candidate.entry.config.id;
    if let Some(deck) = stored_deck(decks_dir, id, &candidate.pool, rules) {
        info!(agent = %id, "reusing stored deck");
        return Ok(deck);
    }
    if let Some(path) = &candidate.entry.deck {
        let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
        return Deck::from_decklist(candidate.pool.clone(), &parse_decklist(&text), rules)
            .map_err(|e| format!("{}: {e}", path.display()));
    }
    let built =
        build_deck(&candidate.agent, candidate.pool.clone(), rules).map_err(|e| e.to_string())?;
    let transcript = decks_dir.join(format!("{id}-build.jsonl"));
    if let Err(e) = write_jsonl(&transcript, &built.exchanges) {
        warn!(agent = %id, "could not write deck building transcript: {e:#}");
    }
    Ok(built.deck)
}

fn stored_deck(
    decks_dir: &Path,
    id: &str,
    pool: &Arc<CardPool>,
    rules: &FormatRules,
) -> Option<Deck> {
    let path = decks_dir.join(format!("{id}.json"));
    let text = std::fs::read_to_string(&path).ok()?;
    let record: DeckRecord = match serde_json::from_str(&text) {
        Ok(record) => record,
        Err(e) => {
            warn!(agent = %id, "ignoring unreadable stored deck: {e}");
            return None;
        }
    };
    match Deck::from_record(&record, pool.clone(), rules) {
        Ok(deck) => Some(deck),
        Err(e) => {
            warn!(agent = %id, "ignoring stored deck: {e}");
            None
        }
    }
}

fn exclude(ctx: &RunContext, sink: &ResultSink, agent: &str, stage: &str, reason: String) {
    warn!(target: "run", agent, stage, %reason, "seat excluded");
    if ctx.settings().verbose {
        println!("\x1b[31mExcluded {agent} ({stage}): {reason}\x1b[39m");
    }
    if !ctx.prior().excluded.contains(agent) {
        sink.append(LogRecord::SeatExcluded(SeatExclusion {
            agent: agent.to_string(),
            stage: stage.to_string(),
            reason,
        }));
    }
}

/// Matches still to play, in pairing order.
///
/// A match whose last logged game ended it, but which was never closed, is closed here.
fn plan_matches(
    bench: &BenchConfig,
    ctx: &RunContext,
    seats: &[Seat],
) -> anyhow::Result<Vec<MatchSpec>> {
    let ids: Vec<String> = seats.iter().map(|s| s.agent.id().to_string()).collect();
    let by_id: BTreeMap<&str, &Seat> = seats.iter().map(|s| (s.agent.id(), s)).collect();
    let rules = bench.format_rules()?;
    let prior = ctx.prior();
    let sink = ctx.sink()?;

    let mut specs = vec![];
    for pairup in bench.run.pairing.pairups(&ids) {
        if prior.is_closed(&pairup.match_id) {
            trace!(match_id = %pairup.match_id, "already closed");
            continue;
        }
        if let Some(status) = prior.unclosed_abort(&pairup.match_id) {
            warn!(
                target: "run",
                match_id = %pairup.match_id,
                ?status,
                "closing match aborted by an earlier run"
            );
            sink.append(LogRecord::Match(MatchClosed {
                match_id: pairup.match_id.clone(),
                agents: pairup.agents.clone(),
                games_planned: bench.run.games_per_match,
                status,
            }));
            continue;
        }
        let seat = |i: usize| by_id.get(pairup.agents[i].as_str());
        let (Some(a), Some(b)) = (seat(0), seat(1)) else {
            continue;
        };
        let spec = MatchSpec::new(
            pairup.match_id.clone(),
            [(*a).clone(), (*b).clone()],
            rules.engine_format.clone(),
            bench.run.games_per_match,
        )?
        .resume_at(prior.resume_game(&pairup.match_id));
        specs.push(spec);
    }
    Ok(specs)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value).context("serialization failed")?;
    std::fs::write(path, text).with_context(|| format!("could not write {}", path.display()))
}

fn write_jsonl<T: Serialize>(path: &Path, values: &[T]) -> anyhow::Result<()> {
    let mut text = String::new();
    for value in values {
        text += &serde_json::to_string(value)?;
        text.push('\n');
    }
    std::fs::write(path, text).with_context(|| format!("could not write {}", path.display()))
}

struct WorkerShared {
    engine: EngineConfig,
    settings: Configuration,
    cancel: CancelToken,
    run_dir: PathBuf,
    sink: ResultSink,
}

struct Finished {
    result: MatchResult,
    freed: Constraints,
}

struct Evaluator {
    shared: Arc<WorkerShared>,
}

impl Evaluator {
    fn run(&self, resources: Constraints, specs: Vec<MatchSpec>) -> anyhow::Result<()> {
        let verbose = self.shared.settings.verbose;
        setup_panic_hook();
        if verbose {
            disable_line_wrap();
        }

        let mut scheduler = MatchScheduler::new(resources, specs);
        let (tx_result, rx_result) = mpsc::channel();
        let running = Arc::new(Mutex::new(vec![]));

        for (spec, grant) in scheduler.advance() {
            self.launch_match(spec, grant, tx_result.clone(), &running);
        }

        // not finished <=> match running <=> result to receive
        let mut cancel_seen = false;
        while !scheduler.is_finished() {
            let finished: Finished = rx_result
                .recv()
                .context("every match worker is gone")?;
            if self.shared.cancel.is_cancelled() && !cancel_seen {
                cancel_seen = true;
                let dropped = scheduler.clear_pending();
                warn!(target: "run", dropped, "run cancelled, pending matches not started");
            }
            trace!(match_id = %finished.result.match_id, "match finished");
            for (spec, grant) in scheduler.on_result(finished.freed) {
                self.launch_match(spec, grant, tx_result.clone(), &running);
            }
        }

        if verbose {
            enable_line_wrap();
            println!();
        }
        Ok(())
    }

    fn launch_match(
        &self,
        spec: MatchSpec,
        grant: Constraints,
        tx_result: Sender<Finished>,
        running: &Arc<Mutex<Vec<String>>>,
    ) {

        let shared = self.shared.clone();
        let mutex = running.clone();
        let label = spec.to_string();

        if let Ok(mut guard) = mutex.lock() {
            guard.push(label.clone());
            if shared.settings.verbose {
                print_running_matches(&guard);
            }
        }

        std::thread::spawn(move || {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                let adapter = EngineAdapter::new(
                    &shared.engine,
                    shared.settings,
                    &grant,
                    &shared.cancel,
                    Some(&shared.run_dir),
                );
                run_match(&spec, &adapter, &shared.sink)
            }));
            let result = match outcome {
                Ok(result) => result,
                Err(panic) => {
                    let detail = panic_message(panic.as_ref());
                    error!(match_id = spec.id(), "match worker panicked: {detail}");
                    worker_failure(&spec, detail, &shared.sink)
                }
            };

            if shared.settings.verbose {
                print_match_result(&result);
            }
            Self::remove_running_match(&mutex, &label);

            if tx_result.send(Finished { result, freed: grant }).is_err() {
                warn!(match_id = spec.id(), "result of a match nobody waits for");
            }
        });
    }

    fn remove_running_match(mutex: &Mutex<Vec<String>>, label: &str) {
        let Ok(mut guard) = mutex.lock() else {
            return;
        };
        match guard.iter().position(|s| s == label) {
            Some(pos) => {
                guard.remove(pos);
            }
            None => warn!(label, "finished match was not running"),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}

fn print_match_result(result: &MatchResult) {
    let problem = match &result.status {
        MatchStatus::Completed => String::new(),
        MatchStatus::Aborted { reason, detail } => format!("aborted ({reason}): {detail}"),
    };
    // clear line, green match, score, red problems, start of line
    println!(
        "\x1b[2K\x1b[32m{}: \x1b[39m{} \x1b[31m{problem}\x1b[39m\x1b[0G",
        result.match_id,
        result.score_line(),
    );
}

fn print_running_matches(running: &[String]) {
    // clear, green, default, start of line
    print!("\x1b[2K\x1b[32mRunning...:\x1b[39m {}\x1b[0G", running.join(", "));
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

static PANIC_HOOK: Once = Once::new();
static LINE_WRAP_OFF: AtomicBool = AtomicBool::new(false);

/// Restore line wrapping before a panic message is printed. Installed once per process, returns
/// whether this call installed it.
fn setup_panic_hook() -> bool {
    let mut installed = false;
    PANIC_HOOK.call_once(|| {
        let orig_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic_info| {
            if LINE_WRAP_OFF.load(Ordering::SeqCst) {
                enable_line_wrap();
            }
            orig_hook(panic_info);
        }));
        installed = true;
    });
    installed
}

fn disable_line_wrap() {
    LINE_WRAP_OFF.store(true, Ordering::SeqCst);
    print!("\x1b[?7l");
}

fn enable_line_wrap() {
    LINE_WRAP_OFF.store(false, Ordering::SeqCst);
    print!("\x1b[?7h");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "worker panicked: boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "worker panicked: bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(3);
        assert_eq!(panic_message(payload.as_ref()), "worker panicked");
    }

    #[test]
    fn panic_hook_is_installed_once() {
        setup_panic_hook();
        assert!(!setup_panic_hook());
        assert!(!setup_panic_hook());
    }
}
