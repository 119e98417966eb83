use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use mtg_llm_bench::prelude::*;
use mtg_llm_bench::results::report::write_report;

#[derive(Parser, Debug)]
#[command(name = "mtg-bench", version, about = "LLM vs LLM Magic: The Gathering benchmark")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a benchmark, or resume it when the run id already exists
    Run {
        /// Benchmark file
        #[arg(short, long)]
        config: PathBuf,
        /// Run id, defaults to `<prefix>-<timestamp>`
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Recompute the report of a run directory from its result log
    Report {
        #[arg(long)]
        run_dir: PathBuf,
    },
    /// Load every pool of a benchmark file and check that a legal deck can be built from it
    CheckPool {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config, run_id } => {
            let bench = BenchConfig::load(&config)?;
            let cancel = CancelToken::new();
            watch_signals(&cancel)?;
            run_benchmark(&bench, Configuration::from_env(), run_id.as_deref(), cancel.clone())?;
            if cancel.is_cancelled() {
                bail!("run interrupted, run again with the same --run-id to resume");
            }
        }
        Command::Report { run_dir } => {
            let report = recompute_report(&run_dir)?;
            write_report(&run_dir, &report)?;
            print!("{}", report.summary_table());
        }
        Command::CheckPool { config } => {
            let bench = BenchConfig::load(&config)?;
            let mut failed = 0;
            for check in check_pools(&bench)? {
                match check.result {
                    Ok(stats) => println!(
                        "{}: {} cards, {} unique, average mana value {:.2}",
                        check.agent, stats.total_cards, stats.unique_cards, stats.average_mana_value
                    ),
                    Err(reason) => {
                        failed += 1;
                        println!("{}: {reason}", check.agent);
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} pool(s) unusable");
            }
        }
    }
    Ok(())
}

/// Cancel the run on SIGINT or SIGTERM.
fn watch_signals(cancel: &CancelToken) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("could not start signal runtime")?;

    let on_interrupt = cancel.flag();
    #[cfg(unix)]
    let on_terminate = cancel.flag();
    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            runtime.spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\nInterrupt received, stopping running games...");
                    on_interrupt.store(true, Ordering::SeqCst);
                }
            });

            #[cfg(unix)]
            runtime.spawn(async move {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        eprintln!("\nSIGTERM received, stopping running games...");
                        on_terminate.store(true, Ordering::SeqCst);
                    }
                    Err(e) => eprintln!("could not register SIGTERM handler: {e}"),
                }
            });

            runtime.block_on(std::future::pending::<()>());
        })
        .context("could not start signal thread")?;
    Ok(())
}
