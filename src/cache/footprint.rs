use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;

use super::TagSet;

/// The lines a task fetches at one cache level, grouped by cache set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Footprint {
    sets: BTreeMap<usize, BTreeSet<TagSet>>,
}

impl Footprint {
    pub fn new() -> Self {
        Footprint::default()
    }

    pub fn record(&mut self, set: usize, line: TagSet) {
        self.sets.entry(set).or_default().insert(line);
    }

    /// Whether any fetch maps to `set`.
    pub fn uses(&self, set: usize) -> bool {
        self.sets.contains_key(&set)
    }

    /// The lines fetched in `set`.
    pub fn lines(&self, set: usize) -> impl Iterator<Item = TagSet> + '_ {
        self.sets.get(&set).into_iter().flat_map(|s| s.iter().copied())
    }

    /// All sets in use, in increasing order.
    pub fn sets(&self) -> impl Iterator<Item = usize> + '_ {
        self.sets.keys().copied()
    }

    /// The sets used by both footprints.
    pub fn conflicts(&self, other: &Footprint) -> Vec<usize> {
        self.sets().filter(|s| other.uses(*s)).collect()
    }

    /// The number of distinct lines that `others` fetch in `set` and
    /// `self` does not.
    pub fn foreign_lines(&self, set: usize, others: &[&Footprint]) -> usize {
        let own = self.sets.get(&set);
        others
            .iter()
            .flat_map(|o| o.lines(set))
            .filter(|l| own.map_or(true, |s| !s.contains(l)))
            .unique()
            .count()
    }
}
