//! Run-wide state: output directory, logger, result log, cancellation and resources.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{info, instrument};

use crate::bench_config::BenchConfig;
use crate::configuration::Configuration;
use crate::constraints::{Constraints, ConstraintsBuilder};
use crate::logger::init_logger;
use crate::results::log::{read_log, PriorState, ResultLog, ResultSink};
use crate::results::report::{build_report, write_report, BenchmarkReport, RESULT_LOG_FILE};

pub const DECKS_DIR: &str = "decks";
pub const GAMES_DIR: &str = "games";
pub const POOL_SUMMARY_FILE: &str = "pool_summary.json";
pub const LOG_FILE: &str = "bench.log";

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Run-level cancellation flag, shared by every worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking up early on cancellation. Returns `false` if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }

    /// The underlying flag, for signal handlers.
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.0.clone()
    }
}

/// Everything a run shares, created by [`RunContext::init`] and closed by
/// [`RunContext::teardown`].
#[derive(Debug)]
pub struct RunContext {
    run_id: String,
    run_dir: PathBuf,
    settings: Configuration,
    cancel: CancelToken,
    constraints: Constraints,
    prior: PriorState,
    log: ResultLog,
}

impl RunContext {
    /// Create (or reopen, to resume) the run directory `<output>/<run id>`.
    ///
    /// Environment constraints take precedence over those of the benchmark file.
    #[instrument(skip(bench, cancel))]
    pub fn init(
        bench: &BenchConfig,
        settings: Configuration,
        run_id: &str,
        cancel: CancelToken,
    ) -> anyhow::Result<Self> {
        let run_dir = bench.run.output_dir.join(run_id);
        for dir in [DECKS_DIR, GAMES_DIR] {
            std::fs::create_dir_all(run_dir.join(dir))
                .with_context(|| format!("could not create {}", run_dir.join(dir).display()))?;
        }
        let run_dir = run_dir
            .canonicalize()
            .context("could not resolve run directory")?;

        if settings.log {
            init_logger(&run_dir.join(LOG_FILE))?;
        }

        let constraints = ConstraintsBuilder::from_env()
            .or(bench.constraints())
            .build()
            .context("invalid resource constraints")?;

        let log_path = run_dir.join(RESULT_LOG_FILE);
        let prior = PriorState::from_records(&read_log(&log_path)?);
        if !prior.closed.is_empty() || !prior.games.is_empty() {
            info!(
                closed = prior.closed.len(),
                started = prior.games.len(),
                "resuming run"
            );
        }
        let log = ResultLog::open(&log_path)?;

        info!(run_id, dir = %run_dir.display(), ?constraints, "run initialized");
        Ok(Self {
            run_id: run_id.to_string(),
            run_dir,
            settings,
            cancel,
            constraints,
            prior,
            log,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn decks_dir(&self) -> PathBuf {
        self.run_dir.join(DECKS_DIR)
    }

    pub fn settings(&self) -> Configuration {
        self.settings
    }

    pub fn cancel(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    /// What the result log held when the run was opened.
    pub fn prior(&self) -> &PriorState {
        &self.prior
    }

    pub fn sink(&self) -> anyhow::Result<ResultSink> {
        self.log.sink().context("result log is closed")
    }

    /// Close the result log, then recompute and write the report from it.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub fn teardown(self) -> anyhow::Result<BenchmarkReport> {
        self.log.close()?;
        let records = read_log(&self.run_dir.join(RESULT_LOG_FILE))?;
        let report = build_report(&self.run_id, &records);
        write_report(&self.run_dir, &report)?;
        info!(
            matches = report.totals.matches,
            games = report.totals.games,
            "report written"
        );
        Ok(report)
    }
}

/// `<prefix>-<local timestamp>`, used when no run id is given.
pub fn new_run_id(prefix: &str) -> String {
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    let stamp = time::format_description::parse("[year][month][day]-[hour][minute][second]")
        .ok()
        .and_then(|format| now.format(&format).ok())
        .unwrap_or_else(|| now.unix_timestamp().to_string());
    format!("{prefix}-{stamp}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_is_cut_short_by_cancel() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(1)));

        let remote = token.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });
        let start = Instant::now();
        assert!(!token.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        canceller.join().unwrap();
        assert!(token.flag().load(Ordering::SeqCst));
    }

    #[test]
    fn run_ids_carry_the_prefix() {
        let id = new_run_id("sealed");
        assert!(id.starts_with("sealed-"));
        assert!(id.len() > "sealed-".len());
    }
}
