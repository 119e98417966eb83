//! Resource constraints for engine processes.
//!
//! Every running game owns one engine process. Constraints bound how many of them run at once
//! and what each one may use: a memory ceiling and a set of CPUs (applied through a Linux cgroup
//! when engines are contained), plus a wall-clock limit per game.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use mtg_llm_bench::constraints::ConstraintsBuilder;
//!
//! let constraints = ConstraintsBuilder::new()
//!     .with_max_total_ram(16_000)
//!     .with_ram_per_engine(2_000)
//!     .with_cpu_list("0-3")
//!     .with_cpus_per_engine(2)
//!     .with_max_parallel_engines(2)
//!     .with_game_time_limit(Duration::from_secs(1800))
//!     .build()
//!     .unwrap();
//! ```
//!
//! Values can also be read from the environment with [`ConstraintsBuilder::from_env()`]; values
//! missing there can be completed from the benchmark file with [`ConstraintsBuilder::or`].

use std::{collections::BTreeSet, env, time::Duration};

use anyhow::{bail, Context};
use tracing::warn;

const DEFAULT_GAME_TIME_LIMIT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Default, Clone, PartialEq)]
enum AutoCpus {
    #[default]
    Auto,
    Count(usize),
    List(String),
}

/// Builder for [`Constraints`]. Memory values are in MB.
///
/// By default memory is bounded by what is currently available, CPUs by the number of physical
/// cores, with one CPU per engine and as many parallel engines as the CPUs allow.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConstraintsBuilder {
    total_ram: Option<usize>,
    engine_ram: Option<usize>,
    cpus: AutoCpus,
    cpus_per_engine: Option<usize>,
    max_parallel: Option<usize>,
    game_time_limit: Option<Duration>,
}

impl ConstraintsBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read constraints from the environment.
    ///
    /// - `MAX_TOTAL_RAM` (MB)
    /// - `RAM_PER_ENGINE` (MB)
    /// - `CPU_LIST`: comma-separated CPUs or ranges, e.g. `"0-3,6"`
    /// - `TOTAL_CPU_COUNT`: ignored when `CPU_LIST` is set
    /// - `CPUS_PER_ENGINE`
    /// - `MAX_PARALLEL_ENGINES`
    /// - `GAME_TIME_LIMIT_SECS`
    #[must_use]
    pub fn from_env() -> Self {
        fn parse_usize(var: &str) -> Option<usize> {
            env::var(var).ok()?.trim().parse().ok()
        }

        let cpus = if let Ok(list) = env::var("CPU_LIST") {
            AutoCpus::List(list)
        } else if let Some(count) = parse_usize("TOTAL_CPU_COUNT") {
            AutoCpus::Count(count)
        } else {
            AutoCpus::Auto
        };

        ConstraintsBuilder {
            total_ram: parse_usize("MAX_TOTAL_RAM"),
            engine_ram: parse_usize("RAM_PER_ENGINE"),
            cpus,
            cpus_per_engine: parse_usize("CPUS_PER_ENGINE"),
            max_parallel: parse_usize("MAX_PARALLEL_ENGINES"),
            game_time_limit: parse_usize("GAME_TIME_LIMIT_SECS")
                .map(|s| Duration::from_secs(s as u64)),
        }
    }

    /// Complete the values left unset in `self` with those of `fallback`.
    #[must_use]
    pub fn or(self, fallback: ConstraintsBuilder) -> Self {
        Self {
            total_ram: self.total_ram.or(fallback.total_ram),
            engine_ram: self.engine_ram.or(fallback.engine_ram),
            cpus: match self.cpus {
                AutoCpus::Auto => fallback.cpus,
                cpus => cpus,
            },
            cpus_per_engine: self.cpus_per_engine.or(fallback.cpus_per_engine),
            max_parallel: self.max_parallel.or(fallback.max_parallel),
            game_time_limit: self.game_time_limit.or(fallback.game_time_limit),
        }
    }

    #[must_use]
    pub fn with_max_total_ram(self, max: usize) -> Self {
        Self {
            total_ram: Some(max),
            ..self
        }
    }

    #[must_use]
    pub fn with_ram_per_engine(self, max: usize) -> Self {
        Self {
            engine_ram: Some(max),
            ..self
        }
    }

    /// CPUs usable by engines, as `"0-3,6,8"`.
    #[must_use]
    pub fn with_cpu_list(self, cpus: &str) -> Self {
        Self {
            cpus: AutoCpus::List(cpus.to_string()),
            ..self
        }
    }

    /// Ignored if [`with_cpu_list`](Self::with_cpu_list) is used.
    #[must_use]
    pub fn with_total_cpu_count(self, max: usize) -> Self {
        if let AutoCpus::List(_) = self.cpus {
            warn!("`with_total_cpu_count` is ignored if `with_cpu_list` is used!");
            self
        } else {
            Self {
                cpus: AutoCpus::Count(max),
                ..self
            }
        }
    }

    #[must_use]
    pub fn with_cpus_per_engine(self, count: usize) -> Self {
        Self {
            cpus_per_engine: Some(count),
            ..self
        }
    }

    #[must_use]
    pub fn with_max_parallel_engines(self, count: usize) -> Self {
        Self {
            max_parallel: Some(count),
            ..self
        }
    }

    /// Wall-clock ceiling of one game.
    #[must_use]
    pub fn with_game_time_limit(self, limit: Duration) -> Self {
        Self {
            game_time_limit: Some(limit),
            ..self
        }
    }

    /// # Errors
    ///
    /// Fails when the constraints are impossible, e.g. an engine needs more RAM or CPUs than the
    /// total.
    pub fn build(self) -> anyhow::Result<Constraints> {
        let mut sys = sysinfo::System::new();

        let total_ram = self.total_ram.map(|i| i * 1_000_000).unwrap_or_else(|| {
            sys.refresh_memory();
            sys.available_memory() as usize
        });

        if total_ram < self.engine_ram.unwrap_or(0) * 1_000_000 {
            bail!(
                "Engine RAM size ({}MB) is greater than total RAM ({}MB)",
                self.engine_ram.unwrap_or(0),
                total_ram / 1_000_000
            );
        }

        // physical cores by default, engines are CPU bound
        let cpus = match self.cpus {
            AutoCpus::Auto => (0..num_cpus::get_physical().max(1) as u16).collect(),
            AutoCpus::Count(count) => (0..count as u16).collect(),
            AutoCpus::List(s) => cpu_list_to_set(&s).context("error parsing cpu list")?,
        };
        let cpus_per_engine = self.cpus_per_engine.unwrap_or(1).max(1);
        let engine_slots = cpus.len() / cpus_per_engine;
        if engine_slots == 0 {
            bail!(
                "{} CPUs per engine requested but only {} CPUs available",
                cpus_per_engine,
                cpus.len()
            );
        }
        let engine_ram = self
            .engine_ram
            .map(|i| i * 1_000_000)
            .unwrap_or(total_ram / engine_slots);
        let max_parallel = match self.max_parallel {
            Some(0) => bail!("at least one parallel engine is required"),
            Some(n) => n,
            None => engine_slots,
        };

        Ok(Constraints {
            total_ram,
            engine_ram,
            cpus,
            cpus_per_engine,
            max_parallel,
            game_time_limit: self.game_time_limit.unwrap_or(DEFAULT_GAME_TIME_LIMIT),
        })
    }
}

fn cpu_list_to_set(s: &str) -> anyhow::Result<BTreeSet<u16>> {
    if s.trim().is_empty() {
        bail!("Empty string");
    }
    let mut set = BTreeSet::new();
    for item in s.split(',').map(str::trim) {
        match item.split_once('-') {
            None => {
                let value: u16 = item
                    .parse()
                    .with_context(|| format!("could not parse {item}"))?;
                set.insert(value);
            }
            Some((start, end)) => {
                let start: u16 = start
                    .parse()
                    .with_context(|| format!("could not parse {start}"))?;
                let end: u16 = end
                    .parse()
                    .with_context(|| format!("could not parse {end}"))?;
                set.extend(start.min(end)..=start.max(end));
            }
        }
    }
    Ok(set)
}

/// Resource pool of a run, or the share granted to one running game. Obtained using
/// [`ConstraintsBuilder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Constraints {
    pub(crate) total_ram: usize,
    pub(crate) engine_ram: usize,
    pub(crate) cpus: BTreeSet<u16>,
    pub(crate) cpus_per_engine: usize,
    pub(crate) max_parallel: usize,
    pub(crate) game_time_limit: Duration,
}

impl Constraints {
    pub fn builder() -> ConstraintsBuilder {
        ConstraintsBuilder::new()
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn game_time_limit(&self) -> Duration {
        self.game_time_limit
    }

    /// Memory ceiling of one engine, in bytes.
    pub fn engine_ram(&self) -> usize {
        self.engine_ram
    }

    /// CPUs of this grant in cgroup `cpuset` syntax (`"0,1"`).
    pub fn cpu_list(&self) -> String {
        self.cpus
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub(crate) fn add(&mut self, res: Constraints) {
        self.total_ram += res.total_ram;
        self.cpus.extend(res.cpus);
    }

    /// Grant the resources of one engine, if they are available.
    pub(crate) fn try_take_engine(&mut self) -> Option<Constraints> {
        if self.cpus.len() < self.cpus_per_engine || self.total_ram < self.engine_ram {
            return None;
        }
        let mut cpus = BTreeSet::new();
        for _ in 0..self.cpus_per_engine {
            cpus.extend(self.cpus.pop_first());
        }
        self.total_ram -= self.engine_ram;
        Some(Constraints {
            total_ram: self.engine_ram,
            cpus,
            ..*self
        })
    }
}
