/*! Abstract interpretation of set-associative LRU instruction caches.

The analysis tracks three abstract domains per cache set (see
[Domain]): the *Must* cache, whose lines are guaranteed to be cached,
the *May* cache, outside of which lines are guaranteed not to be
cached, and the *Persistence* cache, whose lines are never evicted once
loaded. From these, every instruction fetch is classified per loop
context as one of the [Access] classes.

A two-level [Hierarchy] analyses the first level on its own and the
second level based on the classification of the first. */

use crate::program::{ProcId, Program};
use crate::time::Duration;

mod analysis;
mod classify;
mod config;
mod footprint;
mod state;

pub use analysis::{analyze_level, LevelAnalysis};
pub use classify::{Access, Chmc, Classification, Fetch};
pub use config::{CacheConfig, ConfigError, TagSet};
pub use footprint::Footprint;
pub use state::{CacheState, Domain, SetState, WayList};

/// A private first-level cache, optionally backed by a (possibly
/// shared) second-level cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hierarchy {
    pub l1: CacheConfig,
    pub l2: Option<CacheConfig>,
}

impl Hierarchy {
    pub fn single(l1: CacheConfig) -> Self {
        Hierarchy { l1, l2: None }
    }

    pub fn two_level(l1: CacheConfig, l2: CacheConfig) -> Self {
        Hierarchy { l1, l2: Some(l2) }
    }

    /// Latency of a fetch that misses the first level but hits the
    /// second.
    pub fn l2_hit_latency(&self) -> Duration {
        self.l2.map_or(self.l1.miss_latency(), |c| c.hit_latency())
    }

    /// Latency of a fetch served by main memory.
    pub fn miss_penalty(&self) -> Duration {
        self.l2.map_or(self.l1.miss_latency(), |c| c.miss_latency())
    }

    /// Classify all fetches of the program reachable from `entry`.
    pub fn analyze(&self, program: &Program, entry: ProcId) -> CacheAnalysis {
        let l1 = analyze_level(program, entry, &self.l1, None);
        match &self.l2 {
            None => CacheAnalysis {
                footprint: l1.footprint,
                l1: l1.classification,
                l2: None,
            },
            Some(c) => {
                let l2 = analyze_level(program, entry, c, Some(&l1.classification));
                CacheAnalysis {
                    l1: l1.classification,
                    l2: Some(l2.classification),
                    footprint: l2.footprint,
                }
            }
        }
    }
}

/// The classifications of all levels of a [Hierarchy].
#[derive(Debug, Clone)]
pub struct CacheAnalysis {
    pub l1: Classification,
    pub l2: Option<Classification>,
    /// The lines fetched at the last level.
    pub footprint: Footprint,
}

impl CacheAnalysis {
    /// Account for tasks on other cores that share the second level;
    /// the first level is private and stays unchanged.
    pub fn with_interference(&self, others: &[&Footprint]) -> CacheAnalysis {
        CacheAnalysis {
            l1: self.l1.clone(),
            l2: self
                .l2
                .as_ref()
                .map(|c| c.with_interference(&self.footprint, others)),
            footprint: self.footprint.clone(),
        }
    }
}

#[cfg(test)]
mod tests;
