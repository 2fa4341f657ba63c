//! The eight readiness criteria and their fixed-size containers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One of the independent boolean readiness checks for a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    ReviewsAddressed,
    CommentsAcknowledged,
    QuietPeriod,
    CiPassing,
    NoUnresolvedThreads,
    MergeEligible,
    NotMerged,
    CommitsPushed,
}

impl Criterion {
    /// All criteria in declaration order. `index()` is the position here.
    pub const ALL: [Criterion; 8] = [
        Criterion::ReviewsAddressed,
        Criterion::CommentsAcknowledged,
        Criterion::QuietPeriod,
        Criterion::CiPassing,
        Criterion::NoUnresolvedThreads,
        Criterion::MergeEligible,
        Criterion::NotMerged,
        Criterion::CommitsPushed,
    ];

    /// Fix order: earlier criteria are preconditions for later ones.
    pub const PRECEDENCE: [Criterion; 8] = [
        Criterion::NotMerged,
        Criterion::MergeEligible,
        Criterion::CiPassing,
        Criterion::NoUnresolvedThreads,
        Criterion::ReviewsAddressed,
        Criterion::CommentsAcknowledged,
        Criterion::CommitsPushed,
        Criterion::QuietPeriod,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Position in [`Criterion::PRECEDENCE`]; lower is fixed first.
    pub fn rank(self) -> usize {
        Self::PRECEDENCE
            .iter()
            .position(|c| *c == self)
            .unwrap_or(Self::PRECEDENCE.len())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Criterion::ReviewsAddressed => "reviews_addressed",
            Criterion::CommentsAcknowledged => "comments_acknowledged",
            Criterion::QuietPeriod => "quiet_period",
            Criterion::CiPassing => "ci_passing",
            Criterion::NoUnresolvedThreads => "no_unresolved_threads",
            Criterion::MergeEligible => "merge_eligible",
            Criterion::NotMerged => "not_merged",
            Criterion::CommitsPushed => "commits_pushed",
        }
    }
}

impl std::fmt::Display for Criterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Criterion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Criterion::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown criterion: {}", s))
    }
}

/// Fixed-size map of the eight criteria to their last evaluated value.
///
/// Serialized as a `{name: bool}` object. Unknown names are ignored and
/// missing names read as `false`, so snapshots written with a different
/// criteria set still load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, bool>", into = "BTreeMap<String, bool>")]
pub struct Criteria([bool; 8]);

impl Criteria {
    pub fn all_true() -> Self {
        Self([true; 8])
    }

    pub fn get(&self, criterion: Criterion) -> bool {
        self.0[criterion.index()]
    }

    pub fn set(&mut self, criterion: Criterion, value: bool) {
        self.0[criterion.index()] = value;
    }

    pub fn all_passed(&self) -> bool {
        self.0.iter().all(|v| *v)
    }

    /// Failing criteria, highest precedence first.
    pub fn failing(&self) -> Vec<Criterion> {
        Criterion::PRECEDENCE
            .iter()
            .copied()
            .filter(|c| !self.get(*c))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Criterion, bool)> + '_ {
        Criterion::ALL.iter().map(move |c| (*c, self.get(*c)))
    }
}

impl From<BTreeMap<String, bool>> for Criteria {
    fn from(map: BTreeMap<String, bool>) -> Self {
        let mut criteria = Criteria::default();
        for (name, value) in map {
            if let Ok(criterion) = name.parse::<Criterion>() {
                criteria.set(criterion, value);
            }
        }
        criteria
    }
}

impl From<Criteria> for BTreeMap<String, bool> {
    fn from(criteria: Criteria) -> Self {
        criteria
            .iter()
            .map(|(c, v)| (c.as_str().to_string(), v))
            .collect()
    }
}

/// Consecutive failure counters, one per criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, u32>", into = "BTreeMap<String, u32>")]
pub struct RetryCounts([u32; 8]);

impl RetryCounts {
    pub fn get(&self, criterion: Criterion) -> u32 {
        self.0[criterion.index()]
    }

    /// Increment and return the new count.
    pub fn increment(&mut self, criterion: Criterion) -> u32 {
        let slot = &mut self.0[criterion.index()];
        *slot = slot.saturating_add(1);
        *slot
    }

    pub fn reset(&mut self, criterion: Criterion) {
        self.0[criterion.index()] = 0;
    }

    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }
}

impl From<BTreeMap<String, u32>> for RetryCounts {
    fn from(map: BTreeMap<String, u32>) -> Self {
        let mut counts = RetryCounts::default();
        for (name, value) in map {
            if let Ok(criterion) = name.parse::<Criterion>() {
                counts.0[criterion.index()] = value;
            }
        }
        counts
    }
}

impl From<RetryCounts> for BTreeMap<String, u32> {
    fn from(counts: RetryCounts) -> Self {
        Criterion::ALL
            .iter()
            .filter(|c| counts.get(**c) > 0)
            .map(|c| (c.as_str().to_string(), counts.get(*c)))
            .collect()
    }
}
