#![allow(dead_code)]

use std::path::{Path, PathBuf};

use mtg_llm_bench::prelude::*;
use time::format_description;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

pub fn init_as_file_logger() {
    let local_offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]").unwrap(),
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_ansi(false)
        .with_timer(timer)
        .with_test_writer()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn settings() -> Configuration {
    Configuration::new()
        .with_verbose(false)
        .with_contain_engines(false)
}

/// Benchmark file for two baseline agents sharing the fixture pool, the forfeiting one with the
/// fixture decklist, run against `engine` (a script under `tests/fixtures`).
pub fn bench_yaml(
    output_dir: &Path,
    engine: &str,
    games_per_match: u32,
    extra_run: &str,
) -> String {

    format!(
        "
run:
  run_id_prefix: test
  output_dir: {output}
  games_per_match: {games_per_match}
  max_parallel_engines: 2
{extra_run}
engine:
  command: sh
  args: [{engine}, '{{deck0}}', '{{deck1}}', '{{format}}']
  game_time_limit_secs: 2
  spawn_retries: 0
  cancel_poll_ms: 20
card_database: {cards}
agents:
  - id: first
    backend: first-option
    pool: {pool}
  - id: quitter
    backend: forfeit
    pool: {pool}
    deck: {deck}
",
        output = output_dir.display(),
        engine = fixture(engine).display(),
        cards = fixture("cards.json").display(),
        pool = fixture("pool.txt").display(),
        deck = fixture("deck.txt").display(),
    )
}

pub fn bench(output_dir: &Path, engine: &str, games_per_match: u32) -> BenchConfig {
    BenchConfig::from_yaml(&bench_yaml(output_dir, engine, games_per_match, "")).unwrap()
}
