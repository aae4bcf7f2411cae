use std::collections::BTreeSet;

use super::{Access, CacheConfig, TagSet};
use crate::program::Address;

/// The three abstract interpretations of an LRU cache set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    /// Lines guaranteed to be cached; ages are upper bounds.
    Must,
    /// Lines possibly cached; ages are lower bounds.
    May,
    /// Lines that may have been evicted since they were loaded; one
    /// extra way collects lines that are no longer persistent.
    Persistence,
}

/// The ways of one cache set under one abstract domain, way 0 being
/// the youngest. Each way holds the lines of that age.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WayList {
    ways: Vec<BTreeSet<TagSet>>,
}

impl WayList {
    pub fn new(ways: usize) -> Self {
        WayList {
            ways: vec![BTreeSet::new(); ways],
        }
    }

    /// The age of `line`, if it occurs in any way.
    pub fn age(&self, line: TagSet) -> Option<usize> {
        self.ways.iter().position(|w| w.contains(&line))
    }

    pub fn ways(&self) -> &[BTreeSet<TagSet>] {
        &self.ways
    }

    pub fn lines(&self) -> impl Iterator<Item = (usize, TagSet)> + '_ {
        self.ways
            .iter()
            .enumerate()
            .flat_map(|(age, w)| w.iter().map(move |l| (age, *l)))
    }

    pub fn is_empty(&self) -> bool {
        self.ways.iter().all(|w| w.is_empty())
    }

    /// LRU touch of `line`. The ways younger than the old position of
    /// `line` (up to and including it if `inclusive`) age by one.
    /// Lines leaving the oldest way are evicted unless `sticky`, in
    /// which case they stay in the oldest way.
    fn touch(&mut self, line: TagSet, inclusive: bool, sticky: bool) {
        let n = self.ways.len();
        let old = self.age(line);
        if let Some(h) = old {
            self.ways[h].remove(&line);
        }
        let aging = match old {
            Some(h) if inclusive => (h + 1).min(n),
            Some(h) => h,
            None => n,
        };
        for age in (0..aging).rev() {
            let moved = std::mem::take(&mut self.ways[age]);
            if age + 1 < n {
                self.ways[age + 1].extend(moved);
            } else if sticky {
                self.ways[age].extend(moved);
            }
        }
        self.ways[0].insert(line);
    }

    /// Combine two way-lists line by line. Lines present on only one
    /// side survive iff `union`; lines present on both sides end up at
    /// the age chosen by `pick`.
    fn combine(&self, other: &WayList, union: bool, pick: fn(usize, usize) -> usize) -> WayList {
        debug_assert_eq!(self.ways.len(), other.ways.len());
        let mut result = WayList::new(self.ways.len());
        for (age, line) in self.lines() {
            match other.age(line) {
                Some(theirs) => {
                    result.ways[pick(age, theirs)].insert(line);
                }
                None if union => {
                    result.ways[age].insert(line);
                }
                None => (),
            }
        }
        if union {
            for (age, line) in other.lines() {
                if self.age(line).is_none() {
                    result.ways[age].insert(line);
                }
            }
        }
        result
    }
}

/// The abstract state of one cache set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetState {
    pub must: WayList,
    pub may: WayList,
    pub persist: WayList,
}

impl SetState {
    fn new(assoc: usize) -> Self {
        SetState {
            must: WayList::new(assoc),
            may: WayList::new(assoc),
            persist: WayList::new(assoc + 1),
        }
    }

    pub fn domain(&self, d: Domain) -> &WayList {
        match d {
            Domain::Must => &self.must,
            Domain::May => &self.may,
            Domain::Persistence => &self.persist,
        }
    }

    fn access(&mut self, line: TagSet) {
        self.must.touch(line, false, false);
        self.may.touch(line, true, false);
        self.persist.touch(line, false, true);
    }

    fn join(&self, other: &SetState) -> SetState {
        SetState {
            must: self.must.combine(&other.must, false, usize::max),
            may: self.may.combine(&other.may, true, usize::min),
            persist: self.persist.combine(&other.persist, true, usize::max),
        }
    }
}

/// The abstract state of a whole cache: one [SetState] per cache set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheState {
    config: CacheConfig,
    sets: Vec<SetState>,
}

impl CacheState {
    /// The state of an empty (or unknown) cache.
    pub fn new(config: CacheConfig) -> Self {
        CacheState {
            config,
            sets: vec![SetState::new(config.associativity()); config.sets()],
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn set(&self, index: usize) -> &SetState {
        &self.sets[index]
    }

    /// The age of the line of `addr` in domain `d`, if present.
    pub fn age(&self, d: Domain, addr: Address) -> Option<usize> {
        let line = self.config.tagset(addr);
        self.sets[self.config.set_of(line)].domain(d).age(line)
    }

    /// Classify a fetch of `addr` without changing the state.
    pub fn classify(&self, addr: Address) -> Access {
        let line = self.config.tagset(addr);
        let set = &self.sets[self.config.set_of(line)];
        if let Some(age) = set.must.age(line) {
            Access::AlwaysHit { age }
        } else if set.may.age(line).is_none() {
            Access::AlwaysMiss
        } else if set
            .persist
            .age(line)
            .map_or(false, |age| age < self.config.associativity())
        {
            Access::FirstMiss
        } else {
            Access::Unknown
        }
    }

    /// Update the state for a fetch of `addr`.
    pub fn access(&mut self, addr: Address) {
        let line = self.config.tagset(addr);
        let index = self.config.set_of(line);
        self.sets[index].access(line);
    }

    /// Update the state for a fetch of `addr` that may or may not take
    /// place: the result covers both outcomes.
    pub fn access_maybe(&mut self, addr: Address) {
        let line = self.config.tagset(addr);
        let index = self.config.set_of(line);
        let mut touched = self.sets[index].clone();
        touched.access(line);
        self.sets[index] = self.sets[index].join(&touched);
    }

    /// The state at a control-flow merge of `self` and `other`.
    pub fn join(&self, other: &CacheState) -> CacheState {
        debug_assert_eq!(self.config, other.config);
        CacheState {
            config: self.config,
            sets: self
                .sets
                .iter()
                .zip(other.sets.iter())
                .map(|(a, b)| a.join(b))
                .collect(),
        }
    }
}
