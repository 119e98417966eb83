//! Append-only JSONL result log.
//!
//! The log is the source of truth of a run. It is appended to by a single writer thread fed
//! through a channel, one record per line, flushed after every record. Reading it back tolerates
//! a torn last line left by a crash mid-write.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{AbortReason, GameEndReason, GameResult, MatchStatus};

/// A seat that could not take part in the run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeatExclusion {
    pub agent: String,
    /// Stage at which the seat was dropped: `agent`, `pool` or `deck`.
    pub stage: String,
    pub reason: String,
}

/// Written once when a match is over, whether it completed or aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchClosed {
    pub match_id: String,
    pub agents: [String; 2],
    pub games_planned: u32,
    #[serde(flatten)]
    pub status: MatchStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "kebab-case")]
pub enum LogRecord {
    Game(GameResult),
    Match(MatchClosed),
    SeatExcluded(SeatExclusion),
}

/// Owner of the writer thread.
#[derive(Debug)]
pub struct ResultLog {
    path: PathBuf,
    tx: Option<Sender<LogRecord>>,
    writer: Option<JoinHandle<anyhow::Result<()>>>,
}

/// Cloneable handle used by workers to append records.
#[derive(Debug, Clone)]
pub struct ResultSink(Sender<LogRecord>);

impl ResultSink {
    pub fn append(&self, record: LogRecord) {
        if self.0.send(record).is_err() {
            warn!("result log already closed, record dropped");
        }
    }
}

impl ResultLog {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .with_context(|| format!("could not open result log {}", path.display()))?;
        if ends_with_torn_line(&mut file)? {
            warn!("result log ends with a partial record, starting on a new line");
            file.write_all(b"\n")?;
        }

        let (tx, rx) = mpsc::channel();
        let writer = std::thread::Builder::new()
            .name("result-log".to_string())
            .spawn(move || write_records(file, rx))
            .context("could not start result log writer")?;

        Ok(Self {
            path: path.to_path_buf(),
            tx: Some(tx),
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sink(&self) -> Option<ResultSink> {
        self.tx.clone().map(ResultSink)
    }

    /// Stop accepting records and wait until every record is written.
    ///
    /// Blocks until every [`ResultSink`] is dropped.
    pub fn close(mut self) -> anyhow::Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> anyhow::Result<()> {
        drop(self.tx.take());
        match self.writer.take() {
            Some(writer) => writer
                .join()
                .map_err(|_| anyhow::anyhow!("result log writer panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for ResultLog {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("result log did not close cleanly: {e:#}");
        }
    }
}

fn ends_with_torn_line(file: &mut File) -> anyhow::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn write_records(mut file: File, rx: Receiver<LogRecord>) -> anyhow::Result<()> {
    // ends when every sender is gone
    for record in rx {
        let mut line = serde_json::to_string(&record).context("could not serialize record")?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .context("could not append to result log")?;
        file.flush()?;
        debug!(?record, "record appended");
    }
    file.sync_all().ok();
    Ok(())
}

/// Read every record of a log. Unreadable lines (a torn last write) are skipped with a warning.
pub fn read_log(path: &Path) -> anyhow::Result<Vec<LogRecord>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => {
            return Err(e).with_context(|| format!("could not open result log {}", path.display()))
        }
    };
    let mut records = vec![];
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.context("could not read result log")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(line = number + 1, "skipping unreadable result log line: {e}"),
        }
    }
    Ok(records)
}

/// What an earlier run of the same run id already recorded.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PriorState {
    pub closed: BTreeSet<String>,
    /// Latest non-aborted game result per match and game index.
    pub games: BTreeMap<String, BTreeMap<u32, GameResult>>,
    pub excluded: BTreeSet<String>,
}

impl PriorState {
    pub fn from_records(records: &[LogRecord]) -> Self {
        let mut state = PriorState::default();
        for record in records {
            match record {
                LogRecord::Game(game) if game.reason != GameEndReason::Aborted => {
                    state
                        .games
                        .entry(game.match_id.clone())
                        .or_default()
                        .insert(game.game, game.clone());
                }
                LogRecord::Game(_) => {}
                LogRecord::Match(closed) => {
                    state.closed.insert(closed.match_id.clone());
                }
                LogRecord::SeatExcluded(seat) => {
                    state.excluded.insert(seat.agent.clone());
                }
            }
        }
        state
    }

    pub fn is_closed(&self, match_id: &str) -> bool {
        self.closed.contains(match_id)
    }

    /// First game of `match_id` with no usable result yet (1-based).
    pub fn resume_game(&self, match_id: &str) -> u32 {
        let Some(games) = self.games.get(match_id) else {
            return 1;
        };
        let mut next = 1;
        while games.contains_key(&next) {
            next += 1;
        }
        next
    }

    /// Status to close `match_id` with when its last logged game ended the match but the run
    /// stopped before writing the close record.
    pub fn unclosed_abort(&self, match_id: &str) -> Option<MatchStatus> {
        if self.is_closed(match_id) {
            return None;
        }
        let (_, last) = self.games.get(match_id)?.iter().next_back()?;
        if !last.reason.aborts_match() {
            return None;
        }
        let reason = AbortReason::from_game(last.reason)?;
        Some(MatchStatus::Aborted {
            reason,
            detail: last.detail.clone().unwrap_or_else(|| last.reason.to_string()),
        })
    }
}
