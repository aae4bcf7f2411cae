use std::collections::HashMap;
use std::fmt;

use super::{CacheConfig, Footprint, TagSet};
use crate::context::{Context, Iteration};
use crate::program::{BlockId, ProcId};
use crate::time::Duration;

/// Cache hit/miss classification (CHMC) of a single fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// The fetch is served by the cache level above.
    HitUpper,
    /// The line is cached at most `age` positions from the young end.
    AlwaysHit { age: usize },
    /// The line is never cached.
    AlwaysMiss,
    /// The line misses at most once, in the first iteration of the
    /// enclosing loop.
    FirstMiss,
    Unknown,
}

impl Access {
    /// The classification covering the fetch in both `self` and
    /// `other`.
    pub fn join(self, other: Access) -> Access {
        use Access::*;
        match (self, other) {
            (AlwaysHit { age: a }, AlwaysHit { age: b }) => AlwaysHit { age: a.max(b) },
            (AlwaysHit { .. }, FirstMiss) | (FirstMiss, AlwaysHit { .. }) => FirstMiss,
            (a, b) if a == b => a,
            _ => Unknown,
        }
    }

    pub fn is_hit(self) -> bool {
        matches!(self, Access::HitUpper | Access::AlwaysHit { .. })
    }

    /// Best- and worst-case outcome of the fetch at this level as
    /// `(hit, hit)`, `(hit, miss)` or `(miss, miss)`; `None` if the
    /// fetch does not reach this level.
    fn outcomes(self, ctx: Context) -> Option<(bool, bool)> {
        match self {
            Access::HitUpper => None,
            Access::AlwaysHit { .. } => Some((true, true)),
            Access::AlwaysMiss => Some((false, false)),
            Access::FirstMiss if ctx.innermost() == Some(Iteration::Steady) => Some((true, true)),
            Access::FirstMiss | Access::Unknown => Some((true, false)),
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::HitUpper => write!(f, "HU"),
            Access::AlwaysHit { age } => write!(f, "AH@{}", age),
            Access::AlwaysMiss => write!(f, "AM"),
            Access::FirstMiss => write!(f, "FM"),
            Access::Unknown => write!(f, "U"),
        }
    }
}

/// One classified instruction fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fetch {
    pub line: TagSet,
    pub access: Access,
}

/// The classification record of one basic block in one context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chmc {
    fetches: Vec<Fetch>,
    pub hits: usize,
    pub misses: usize,
    pub unknowns: usize,
    /// Best-case latency of all fetches at this level.
    pub bcost: Duration,
    /// Worst-case latency of all fetches at this level.
    pub wcost: Duration,
}

impl Chmc {
    pub fn new(fetches: Vec<Fetch>, config: &CacheConfig, ctx: Context) -> Self {
        let mut chmc = Chmc {
            fetches,
            hits: 0,
            misses: 0,
            unknowns: 0,
            bcost: 0,
            wcost: 0,
        };
        let latency = |hit: bool| {
            if hit {
                config.hit_latency()
            } else {
                config.miss_latency()
            }
        };
        for f in &chmc.fetches {
            match f.access {
                Access::HitUpper | Access::AlwaysHit { .. } => chmc.hits += 1,
                Access::AlwaysMiss => chmc.misses += 1,
                Access::FirstMiss | Access::Unknown => chmc.unknowns += 1,
            }
            if let Some((best, worst)) = f.access.outcomes(ctx) {
                chmc.bcost += latency(best);
                chmc.wcost += latency(worst);
            }
        }
        assert_eq!(
            chmc.hits + chmc.misses + chmc.unknowns,
            chmc.fetches.len(),
            "inconsistent classification counts"
        );
        chmc
    }

    pub fn fetches(&self) -> &[Fetch] {
        &self.fetches
    }

    pub fn access(&self, instr: usize) -> Option<Access> {
        self.fetches.get(instr).map(|f| f.access)
    }

    fn join(&self, other: &Chmc, config: &CacheConfig, ctx: Context) -> Chmc {
        assert_eq!(
            self.fetches.len(),
            other.fetches.len(),
            "classification records of different blocks"
        );
        let fetches = self
            .fetches
            .iter()
            .zip(other.fetches.iter())
            .map(|(a, b)| Fetch {
                line: a.line,
                access: a.access.join(b.access),
            })
            .collect();
        Chmc::new(fetches, config, ctx)
    }
}

/// Classification records of all analysed blocks of a program at one
/// cache level, keyed by procedure, block and context.
#[derive(Debug, Clone)]
pub struct Classification {
    config: CacheConfig,
    records: HashMap<(ProcId, BlockId, Context), Chmc>,
}

impl Classification {
    pub fn new(config: CacheConfig) -> Self {
        Classification {
            config,
            records: HashMap::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn get(&self, proc: ProcId, block: BlockId, ctx: Context) -> Option<&Chmc> {
        self.records.get(&(proc, block, ctx))
    }

    /// The classification of the `instr`-th fetch of a block.
    pub fn access(
        &self,
        proc: ProcId,
        block: BlockId,
        ctx: Context,
        instr: usize,
    ) -> Option<Access> {
        self.get(proc, block, ctx).and_then(|c| c.access(instr))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(ProcId, BlockId, Context), &Chmc)> {
        self.records.iter()
    }

    /// Store the record of a block; a block analysed again in the same
    /// context (from another call site) keeps the join of both.
    pub fn record(&mut self, proc: ProcId, block: BlockId, ctx: Context, fetches: Vec<Fetch>) {
        let fresh = Chmc::new(fetches, &self.config, ctx);
        let config = self.config;
        self.records
            .entry((proc, block, ctx))
            .and_modify(|old| *old = old.join(&fresh, &config, ctx))
            .or_insert(fresh);
    }

    /// Account for other tasks sharing this cache level.
    ///
    /// A line guaranteed to be cached at age `a` in set `s` stays
    /// guaranteed only if `a` plus the number of foreign lines that the
    /// tasks in `others` map to `s` stays below the associativity. Any
    /// foreign line in `s` voids persistence.
    pub fn with_interference(&self, own: &Footprint, others: &[&Footprint]) -> Classification {
        let assoc = self.config.associativity();
        let records = self
            .records
            .iter()
            .map(|(key, chmc)| {
                let fetches = chmc
                    .fetches
                    .iter()
                    .map(|f| {
                        let set = self.config.set_of(f.line);
                        let foreign = own.foreign_lines(set, others);
                        let access = match f.access {
                            Access::AlwaysHit { age } if age + foreign >= assoc => Access::Unknown,
                            Access::FirstMiss if foreign > 0 => Access::Unknown,
                            a => a,
                        };
                        Fetch { access, ..*f }
                    })
                    .collect();
                (*key, Chmc::new(fetches, &self.config, key.2))
            })
            .collect();
        Classification {
            config: self.config,
            records,
        }
    }
}
