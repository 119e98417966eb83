//! Plays one game through one engine process.
//!
//! A reader thread forwards engine stdout lines over a channel; the game loop waits on it with a
//! timeout bounded by the game deadline and the cancellation poll interval, so a silent engine
//! can always be killed.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{ChildStdin, ChildStdout};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, instrument, trace, warn};

use super::process::{LimitedProcess, ProcessSpec};
use super::protocol::{context_text, parse_line, EngineEvent, EngineProtocolError};
use super::{game_seed, EngineConfig, LaunchParams, OrchestrationError};
use crate::agent::{Choice, DecisionAgent, DecisionOption, DecisionRequest, Exchange};
use crate::configuration::Configuration;
use crate::constraints::Constraints;
use crate::results::{GameEndReason, GameResult};
use crate::run_context::{CancelToken, GAMES_DIR};

const KILL_TIMEOUT: Duration = Duration::from_secs(2);
const EXIT_GRACE: Duration = Duration::from_millis(200);

/// One game to play.
#[derive(Debug, Clone, Copy)]
pub struct GameSetup<'a> {
    pub match_id: &'a str,
    /// 1-based.
    pub game: u32,
    /// Agents by engine seat for this game.
    pub seats: [&'a DecisionAgent; 2],
    /// Deck files by engine seat for this game.
    pub deck_files: [&'a Path; 2],
    pub format: &'a str,
}

/// Runs games of one match worker.
#[derive(Debug, Clone, Copy)]
pub struct EngineAdapter<'a> {
    engine: &'a EngineConfig,
    settings: Configuration,
    grant: &'a Constraints,
    cancel: &'a CancelToken,
    run_dir: Option<&'a Path>,
}

enum EngineLine {
    Line(String),
    Eof,
    ReadError(String),
}

enum Outcome {
    Ended {
        winner_seat: Option<usize>,
        reason: GameEndReason,
    },
    Timeout,
    Crash(String),
    Protocol(EngineProtocolError),
    Cancelled,
}

#[derive(Debug, Default)]
struct Progress {
    greeted: bool,
    turn: u32,
    decisions: [u32; 2],
    forfeits: [u32; 2],
}

impl<'a> EngineAdapter<'a> {
    /// `grant` gives the engine memory and CPUs, and the game time limit. Per-game decision logs
    /// go under `run_dir` when given.
    pub fn new(
        engine: &'a EngineConfig,
        settings: Configuration,
        grant: &'a Constraints,
        cancel: &'a CancelToken,
        run_dir: Option<&'a Path>,
    ) -> Self {
        Self {
            engine,
            settings,
            grant,
            cancel,
            run_dir,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Play one game to its end.
    ///
    /// Crashes, protocol errors, timeouts and cancellation are game outcomes, not errors. Only a
    /// failure to start the engine at all is an error.
    #[instrument(skip_all, fields(match_id = setup.match_id, game = setup.game))]
    pub fn play_game(&self, setup: &GameSetup) -> Result<GameResult, OrchestrationError> {
        let args = self.engine.expand_args(&LaunchParams {
            match_id: setup.match_id,
            game: setup.game,
            deck_files: setup.deck_files,
            format: setup.format,
            seed: game_seed(setup.match_id, setup.game),
        });
        let mut process = self.spawn(&args)?;
        let started = Instant::now();
        debug!(pid = process.child.id(), contained = process.is_contained(), "engine started");

        let mut audit = AuditLog::open(self.run_dir, setup);
        let mut progress = Progress::default();
        let outcome = match (process.child.stdin.take(), process.child.stdout.take()) {
            (Some(stdin), Some(stdout)) => {
                let lines = spawn_reader(stdout);
                self.run_loop(setup, &mut process, stdin, lines, started, &mut progress, &mut audit)
            }
            _ => Outcome::Crash("engine pipes unavailable".to_string()),
        };

        if let Err(e) = process.try_kill(KILL_TIMEOUT) {
            warn!("could not clean up engine: {e:#}");
        }

        let seats = setup.seats.map(|agent| agent.id().to_string());
        let mut decisions = BTreeMap::new();
        let mut forfeits = BTreeMap::new();
        for (seat, id) in seats.iter().enumerate() {
            *decisions.entry(id.clone()).or_insert(0) += progress.decisions[seat];
            *forfeits.entry(id.clone()).or_insert(0) += progress.forfeits[seat];
        }
        let (winner, reason, detail) = match outcome {
            Outcome::Ended {
                winner_seat: Some(seat),
                reason,
            } => (Some(seats[seat].clone()), reason, None),
            Outcome::Ended {
                winner_seat: None, ..
            } => (None, GameEndReason::Draw, None),
            Outcome::Timeout => (
                None,
                GameEndReason::Timeout,
                Some(format!("no result after {:?}", self.grant.game_time_limit())),
            ),
            Outcome::Crash(detail) => (None, GameEndReason::EngineCrash, Some(detail)),
            Outcome::Protocol(e) => (None, GameEndReason::ProtocolError, Some(e.to_string())),
            Outcome::Cancelled => (None, GameEndReason::Aborted, Some("run cancelled".to_string())),
        };
        info!(?winner, %reason, turns = progress.turn, "game over");

        Ok(GameResult {
            match_id: setup.match_id.to_string(),
            game: setup.game,
            seats,
            winner,
            reason,
            detail,
            turns: progress.turn,
            decisions,
            forfeits,
            duration_ms: started.elapsed().as_millis() as u64,
            decision_log: audit.relative_path(),
        })
    }

    fn spawn(&self, args: &[String]) -> Result<LimitedProcess, OrchestrationError> {
        let spec = ProcessSpec {
            command: &self.engine.command,
            args,
            working_dir: self.engine.working_dir.as_deref(),
            allow_stderr: self.settings.debug_engine_stderr,
        };
        let attempts = self.engine.spawn_retries + 1;
        let mut last_error = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                let factor = 1u64 << (attempt - 1).min(16);
                let delay =
                    Duration::from_millis(self.engine.spawn_backoff_ms.saturating_mul(factor));
                if !self.cancel.sleep(delay) {
                    return Err(OrchestrationError::Cancelled);
                }
            }
            match self.launch(&spec) {
                Ok(process) => return Ok(process),
                Err(e) => {
                    warn!(attempt = attempt + 1, "could not spawn engine: {e:#}");
                    last_error = format!("{e:#}");
                }
            }
        }
        Err(OrchestrationError::Spawn {
            attempts,
            message: last_error,
        })
    }

    fn launch(&self, spec: &ProcessSpec) -> anyhow::Result<LimitedProcess> {
        if !self.settings.contain_engines {
            return LimitedProcess::launch_without_container(spec);
        }
        match LimitedProcess::launch(spec, self.grant.engine_ram() as i64, &self.grant.cpu_list()) {
            Ok(process) => Ok(process),
            Err(e) if self.settings.allow_uncontained => {
                warn!("could not contain engine, running it uncontained: {e:#}");
                LimitedProcess::launch_without_container(spec)
            }
            Err(e) => Err(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_loop(
        &self,
        setup: &GameSetup,
        process: &mut LimitedProcess,
        mut stdin: ChildStdin,
        lines: Receiver<EngineLine>,
        started: Instant,
        progress: &mut Progress,
        audit: &mut AuditLog,
    ) -> Outcome {
        let deadline = started + self.grant.game_time_limit();
        let poll = Duration::from_millis(self.engine.cancel_poll_ms.max(1));
        loop {
            if self.cancel.is_cancelled() {
                return Outcome::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                return Outcome::Timeout;
            }
            let line = match lines.recv_timeout((deadline - now).min(poll)) {
                Ok(EngineLine::Line(line)) => line,
                Ok(EngineLine::Eof) | Err(RecvTimeoutError::Disconnected) => {
                    return Outcome::Crash(exit_detail(process));
                }
                Ok(EngineLine::ReadError(e)) => {
                    return Outcome::Crash(format!("could not read engine output: {e}"));
                }
                Err(RecvTimeoutError::Timeout) => continue,
            };

            let event = match parse_line(&line, &self.engine.comment_prefix) {
                Ok(Some(event)) => event,
                Ok(None) => {
                    trace!(line = %line, "engine comment");
                    continue;
                }
                Err(e) => return Outcome::Protocol(e),
            };
            let handled = self.handle(event, setup, progress, &mut stdin, audit, deadline);
            if let Some(outcome) = handled {
                return outcome;
            }
        }
    }

    /// `Some` when the game is over.
    fn handle(
        &self,
        event: EngineEvent,
        setup: &GameSetup,
        progress: &mut Progress,
        stdin: &mut ChildStdin,
        audit: &mut AuditLog,
        deadline: Instant,
    ) -> Option<Outcome> {
        if !progress.greeted && !matches!(event, EngineEvent::Hello { .. }) {
            return Some(Outcome::Protocol(EngineProtocolError::MissingHello));
        }
        match event {
            EngineEvent::Hello { protocol, engine } => {
                if protocol != self.engine.protocol_version {
                    return Some(Outcome::Protocol(EngineProtocolError::VersionMismatch {
                        expected: self.engine.protocol_version.clone(),
                        found: protocol,
                    }));
                }
                debug!(?engine, %protocol, "engine ready");
                progress.greeted = true;
                None
            }
            EngineEvent::TurnStarted { turn, active_seat } => {
                trace!(turn, active_seat, "turn");
                progress.turn = turn;
                None
            }
            EngineEvent::PhaseChanged { phase } => {
                trace!(%phase, "phase");
                None
            }
            EngineEvent::DecisionRequested {
                seat,
                context,
                options,
                pass,
            } => {
                if seat > 1 {
                    return Some(Outcome::Protocol(EngineProtocolError::UnknownSeat(seat)));
                }
                if options.is_empty() {
                    return Some(Outcome::Protocol(EngineProtocolError::NoOptions { seat }));
                }
                let context = context_text(&context);
                let answer =
                    self.decide(setup, seat, context, options, pass, progress, audit, deadline);
                match writeln!(stdin, "{answer}").and_then(|()| stdin.flush()) {
                    Ok(()) => None,
                    Err(e) => Some(Outcome::Crash(format!("could not answer engine: {e}"))),
                }
            }
            EngineEvent::GameEnded { winner_seat, reason } => match winner_seat {
                Some(seat) if seat > 1 => {
                    Some(Outcome::Protocol(EngineProtocolError::UnknownWinner(seat)))
                }
                Some(seat) => {
                    let reason = match GameEndReason::from_engine(&reason) {
                        GameEndReason::Draw => GameEndReason::RulesLoss,
                        reason => reason,
                    };
                    Some(Outcome::Ended {
                        winner_seat: Some(seat),
                        reason,
                    })
                }
                None => Some(Outcome::Ended {
                    winner_seat: None,
                    reason: GameEndReason::Draw,
                }),
            },
            EngineEvent::EngineError { message } => {
                Some(Outcome::Crash(format!("engine error: {message}")))
            }
        }
    }

    /// Ask the agent of `seat`, returning the option id to submit.
    #[allow(clippy::too_many_arguments)]
    fn decide(
        &self,
        setup: &GameSetup,
        seat: usize,
        context: String,
        options: Vec<DecisionOption>,
        pass: Option<String>,
        progress: &mut Progress,
        audit: &mut AuditLog,
        deadline: Instant,
    ) -> String {
        let agent = setup.seats[seat];
        let remaining = deadline.saturating_duration_since(Instant::now());
        let request = DecisionRequest {
            context,
            options,
            pass_option: pass,
            timeout: agent.config().decision_timeout().min(remaining),
        };
        let response = agent.decide(&request);
        progress.decisions[seat] += 1;
        let answer = match response.choice {
            Choice::Selected(id) => id,
            Choice::Forfeit => {
                progress.forfeits[seat] += 1;
                let fallback = request
                    .pass_option
                    .clone()
                    .unwrap_or_else(|| request.options[0].id.clone());
                debug!(seat, %fallback, "agent forfeited the decision");
                fallback
            }
        };
        audit.record(progress.turn, seat, &answer, &response.exchanges);
        answer
    }
}

fn spawn_reader(stdout: ChildStdout) -> Receiver<EngineLine> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            let message = match line {
                Ok(line) => EngineLine::Line(line),
                Err(e) => {
                    let _ = tx.send(EngineLine::ReadError(e.to_string()));
                    return;
                }
            };
            if tx.send(message).is_err() {
                return;
            }
        }
        let _ = tx.send(EngineLine::Eof);
    });
    rx
}

/// Exit status of an engine that closed its output, if it exits shortly.
fn exit_detail(process: &mut LimitedProcess) -> String {
    let deadline = Instant::now() + EXIT_GRACE;
    loop {
        match process.child.try_wait() {
            Ok(Some(status)) => return format!("engine exited unexpectedly ({status})"),
            Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(10)),
            _ => return "engine closed its output unexpectedly".to_string(),
        }
    }
}

#[derive(Serialize)]
struct AuditEntry<'a> {
    turn: u32,
    seat: usize,
    submitted: &'a str,
    #[serde(flatten)]
    exchange: &'a Exchange,
}

/// Per-game JSONL file of every exchange.
struct AuditLog {
    writer: Option<BufWriter<File>>,
    relative: PathBuf,
}

impl AuditLog {
    fn open(run_dir: Option<&Path>, setup: &GameSetup) -> Self {
        let file_name = format!("{}-g{}.jsonl", setup.match_id, setup.game);
        let relative = Path::new(GAMES_DIR).join(file_name);
        let writer = run_dir.and_then(|dir| match File::create(dir.join(&relative)) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                warn!("could not create decision log {}: {e}", relative.display());
                None
            }
        });
        Self { writer, relative }
    }

    fn record(&mut self, turn: u32, seat: usize, submitted: &str, exchanges: &[Exchange]) {
        let Some(writer) = &mut self.writer else {
            return;
        };
        for exchange in exchanges {
            let entry = AuditEntry {
                turn,
                seat,
                submitted,
                exchange,
            };
            let written = serde_json::to_writer(&mut *writer, &entry)
                .map_err(std::io::Error::from)
                .and_then(|()| writer.write_all(b"\n"));
            if let Err(e) = written {
                warn!("could not write decision log: {e}");
                self.writer = None;
                return;
            }
        }
        if let Err(e) = writer.flush() {
            warn!("could not flush decision log: {e}");
        }
    }

    fn relative_path(&self) -> Option<String> {
        self.writer
            .as_ref()
            .map(|_| self.relative.to_string_lossy().into_owned())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::agent::{AgentConfig, BackendKind};
    use crate::constraints::ConstraintsBuilder;

    fn agent(id: &str, backend: BackendKind) -> DecisionAgent {
        DecisionAgent::from_config(Arc::new(AgentConfig::baseline(id, backend))).unwrap()
    }

    fn grant(limit: Duration) -> Constraints {
        ConstraintsBuilder::new()
            .with_total_cpu_count(1)
            .with_max_total_ram(1_000)
            .with_game_time_limit(limit)
            .build()
            .unwrap()
    }

    fn sh(script: &str) -> EngineConfig {
        let mut engine = EngineConfig::new("sh", vec!["-c".to_string(), script.to_string()]);
        engine.spawn_retries = 0;
        engine.cancel_poll_ms = 10;
        engine
    }

    fn play(
        engine: &EngineConfig,
        limit: Duration,
        cancel: &CancelToken,
        run_dir: Option<&Path>,
    ) -> GameResult {
        let first = agent("first", BackendKind::FirstOption);
        let quitter = agent("quitter", BackendKind::Forfeit);
        let grant = grant(limit);
        let settings = Configuration::new().with_contain_engines(false);
        let adapter = EngineAdapter::new(engine, settings, &grant, cancel, run_dir);
        adapter
            .play_game(&GameSetup {
                match_id: "first-vs-quitter-m1",
                game: 1,
                seats: [&first, &quitter],
                deck_files: [Path::new("a.dck"), Path::new("b.dck")],
                format: "sealed",
            })
            .unwrap()
    }

    const DECISIONS: &str = r#"
echo '{"type":"hello","protocol":"1"}'
echo '# warming up'
echo '{"type":"turn_started","turn":1,"active_seat":0}'
echo '{"type":"decision","seat":0,"context":"t1","options":[{"id":"attack","label":"Attack"},{"id":"pass","label":"Pass"}],"pass":"pass"}'
read a0
echo '{"type":"turn_started","turn":2,"active_seat":1}'
echo '{"type":"decision","seat":1,"context":"t2","options":[{"id":"attack","label":"Attack"},{"id":"block","label":"Block"}]}'
read a1
if [ "$a0" = attack ] && [ "$a1" = attack ]; then
  echo '{"type":"game_ended","winner_seat":0,"reason":"forfeit"}'
else
  echo '{"type":"game_ended","winner_seat":1,"reason":"life_total"}'
fi
"#;

    #[test]
    fn decisions_are_answered_and_forfeits_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(GAMES_DIR)).unwrap();
        let limit = Duration::from_secs(20);
        let result = play(&sh(DECISIONS), limit, &CancelToken::new(), Some(dir.path()));
        // the quitter forfeits with no pass option, so the first option is submitted
        assert_eq!(result.winner.as_deref(), Some("first"));
        assert_eq!(result.reason, GameEndReason::Forfeit);
        assert_eq!(result.turns, 2);
        assert_eq!(result.decisions["first"], 1);
        assert_eq!(result.forfeits["quitter"], 1);
        assert_eq!(result.forfeits["first"], 0);

        let log = result.decision_log.unwrap();
        let text = std::fs::read_to_string(dir.path().join(log)).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("\"submitted\":\"attack\""));
        assert!(text.contains("\"agent\":\"quitter\""));
    }

    #[test]
    fn silent_engine_times_out() {
        let engine = sh(r#"echo '{"type":"hello","protocol":"1"}'; exec sleep 30"#);
        let start = Instant::now();
        let result = play(&engine, Duration::from_millis(300), &CancelToken::new(), None);
        assert_eq!(result.reason, GameEndReason::Timeout);
        assert_eq!(result.winner, None);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn early_exit_is_a_crash() {
        let engine = sh(r#"echo '{"type":"hello","protocol":"1"}'; exit 3"#);
        let result = play(&engine, Duration::from_secs(20), &CancelToken::new(), None);
        assert_eq!(result.reason, GameEndReason::EngineCrash);
        assert!(result.detail.unwrap().contains("unexpectedly"));
    }

    #[test]
    fn protocol_violations() {
        let wrong_version = sh(r#"echo '{"type":"hello","protocol":"9"}'; exec sleep 5"#);
        let result = play(&wrong_version, Duration::from_secs(20), &CancelToken::new(), None);
        assert_eq!(result.reason, GameEndReason::ProtocolError);
        assert!(result.detail.unwrap().contains("protocol 9"));

        let no_hello =
            sh(r#"echo '{"type":"turn_started","turn":1,"active_seat":0}'; exec sleep 5"#);
        let result = play(&no_hello, Duration::from_secs(20), &CancelToken::new(), None);
        assert_eq!(result.reason, GameEndReason::ProtocolError);

        let no_options = sh(
            r#"echo '{"type":"hello","protocol":"1"}'; echo '{"type":"decision","seat":0,"options":[]}'; exec sleep 5"#,
        );
        let result = play(&no_options, Duration::from_secs(20), &CancelToken::new(), None);
        assert_eq!(result.reason, GameEndReason::ProtocolError);
    }

    #[test]
    fn cancellation_aborts_the_game() {
        let engine = sh(r#"echo '{"type":"hello","protocol":"1"}'; exec sleep 30"#);
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            remote.cancel();
        });
        let result = play(&engine, Duration::from_secs(20), &cancel, None);
        canceller.join().unwrap();
        assert_eq!(result.reason, GameEndReason::Aborted);
    }

    #[test]
    fn missing_engine_is_a_spawn_failure() {
        let engine = EngineConfig::new("/nonexistent/forge", vec![]);
        let mut engine = engine;
        engine.spawn_retries = 1;
        engine.spawn_backoff_ms = 1;
        let first = agent("first", BackendKind::FirstOption);
        let quitter = agent("quitter", BackendKind::Forfeit);
        let grant = grant(Duration::from_secs(1));
        let cancel = CancelToken::new();
        let settings = Configuration::new().with_contain_engines(false);
        let adapter = EngineAdapter::new(&engine, settings, &grant, &cancel, None);

        let err = adapter
            .play_game(&GameSetup {
                match_id: "m",
                game: 1,
                seats: [&first, &quitter],
                deck_files: [Path::new("a"), Path::new("b")],
                format: "sealed",
            })
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Spawn { attempts: 2, .. }));
    }
}
