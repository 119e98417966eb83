//! Which agents meet, and how many times.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Pairing {
    /// Every unordered pair of agents.
    RoundRobin {
        #[serde(default = "one")]
        matches_per_pair: u32,
    },
    /// `challenger` against every other agent.
    Gauntlet {
        challenger: String,
        #[serde(default = "one")]
        matches_per_pair: u32,
    },
}

fn one() -> u32 {
    1
}

impl Default for Pairing {
    fn default() -> Self {
        Pairing::RoundRobin { matches_per_pair: 1 }
    }
}

/// A match to play, before seats are attached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pairup {
    pub match_id: String,
    pub agents: [String; 2],
}

impl Pairing {
    pub fn matches_per_pair(&self) -> u32 {
        match self {
            Pairing::RoundRobin { matches_per_pair }
            | Pairing::Gauntlet {
                matches_per_pair, ..
            } => *matches_per_pair,
        }
    }

    /// Matches between `agents`, in a deterministic order with deterministic ids.
    pub fn pairups(&self, agents: &[String]) -> Vec<Pairup> {
        let pairs: Vec<(&String, &String)> = match self {
            Pairing::RoundRobin { .. } => agents
                .iter()
                .enumerate()
                .flat_map(|(i, a)| agents[i + 1..].iter().map(move |b| (a, b)))
                .collect(),
            Pairing::Gauntlet { challenger, .. } => match agents.iter().find(|a| *a == challenger) {
                Some(challenger) => agents
                    .iter()
                    .filter(|a| *a != challenger)
                    .map(|other| (challenger, other))
                    .collect(),
                None => vec![],
            },
        };

        let mut pairups = vec![];
        for (a, b) in pairs {
            for k in 1..=self.matches_per_pair() {
                pairups.push(Pairup {
                    match_id: format!("{a}-vs-{b}-m{k}"),
                    agents: [a.clone(), b.clone()],
                });
            }
        }
        pairups
    }
}
