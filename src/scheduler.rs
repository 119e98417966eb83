use std::collections::VecDeque;

use tracing::{trace, warn};

use crate::constraints::Constraints;

/// FIFO queue of matches, started as long as engine resources and the parallelism bound allow.
pub struct MatchScheduler<T> {
    resources: Constraints,
    pending: VecDeque<T>,
    running: usize,
}

impl<T> MatchScheduler<T> {
    pub fn new(resources: Constraints, matches: impl IntoIterator<Item = T>) -> Self {
        MatchScheduler {
            resources,
            pending: matches.into_iter().collect(),
            running: 0,
        }
    }

    /// Matches to start now, each with the resources granted to its engine.
    pub fn advance(&mut self) -> Vec<(T, Constraints)> {
        let mut to_run = vec![];
        while self.running < self.resources.max_parallel() && !self.pending.is_empty() {
            let grant = match self.resources.try_take_engine() {
                Some(grant) => grant,
                None if self.running == 0 => {
                    // never leave the queue stuck with nothing running
                    warn!("not enough resources for one engine, running it unrestricted");
                    self.unrestricted_grant()
                }
                None => break,
            };
            if let Some(next) = self.pending.pop_front() {
                self.running += 1;
                to_run.push((next, grant));
            }
        }
        trace!(started = to_run.len(), pending = self.pending.len(), "advance");
        to_run
    }

    /// A match finished and gave back `freed`.
    pub fn on_result(&mut self, freed: Constraints) -> Vec<(T, Constraints)> {
        self.resources.add(freed);
        self.running = self.running.saturating_sub(1);
        self.advance()
    }

    /// Drop every match not started yet.
    pub fn clear_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn running(&self) -> usize {
        self.running
    }

    /// All matches ran and finished.
    pub fn is_finished(&self) -> bool {
        self.running == 0 && self.pending.is_empty()
    }

    fn unrestricted_grant(&self) -> Constraints {
        Constraints {
            total_ram: 0,
            engine_ram: 0,
            cpus: Default::default(),
            ..self.resources.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::ConstraintsBuilder;

    fn resources(cpus: usize, parallel: usize) -> Constraints {
        ConstraintsBuilder::new()
            .with_total_cpu_count(cpus)
            .with_max_total_ram(8_000)
            .with_ram_per_engine(1_000)
            .with_max_parallel_engines(parallel)
            .build()
            .unwrap()
    }

    #[test]
    fn bounded_by_parallelism_and_fifo() {
        let mut scheduler = MatchScheduler::new(resources(8, 2), ["m1", "m2", "m3"]);
        let mut started = scheduler.advance();
        assert_eq!(started.iter().map(|(m, _)| *m).collect::<Vec<_>>(), vec!["m1", "m2"]);
        assert_eq!(scheduler.running(), 2);
        assert!(scheduler.advance().is_empty());

        let (_, second) = started.pop().unwrap();
        let (_, first) = started.pop().unwrap();
        let next = scheduler.on_result(first);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].0, "m3");
        assert!(!scheduler.is_finished());

        let mut grants: Vec<_> = next.into_iter().map(|(_, g)| g).collect();
        grants.push(second);
        for grant in grants {
            assert!(scheduler.on_result(grant).is_empty());
        }
        assert!(scheduler.is_finished());
    }

    #[test]
    fn bounded_by_cpus() {
        let mut scheduler = MatchScheduler::new(resources(1, 4), 0..3);
        let started = scheduler.advance();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].1.cpu_list(), "0");
    }

    #[test]
    fn clearing_pending_ends_the_run_once_running_matches_return() {
        let mut scheduler = MatchScheduler::new(resources(1, 1), 0..5);
        let (_, grant) = scheduler.advance().pop().unwrap();
        assert_eq!(scheduler.clear_pending(), 4);
        assert!(scheduler.on_result(grant).is_empty());
        assert!(scheduler.is_finished());
    }
}
