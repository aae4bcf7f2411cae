use std::collections::HashMap;

use tracing::{debug, trace};

use super::{Access, CacheConfig, CacheState, Classification, Fetch, Footprint};
use crate::context::{Context, Iteration};
use crate::program::{BlockId, LoopId, ProcId, Procedure, Program};

/// The outcome of analysing one cache level from one entry procedure.
#[derive(Debug, Clone)]
pub struct LevelAnalysis {
    pub classification: Classification,
    /// The lines fetched at this level.
    pub footprint: Footprint,
    /// The abstract state when the entry procedure returns.
    pub exit: CacheState,
}

/// Analyse one cache level of `program`, starting in `entry` with an
/// empty cache.
///
/// For a second-level cache, `upper` is the classification of the
/// level above: fetches that always hit there never reach this level,
/// fetches that always miss there reach it for sure, and any other
/// fetch reaches it only possibly.
pub fn analyze_level(
    program: &Program,
    entry: ProcId,
    config: &CacheConfig,
    upper: Option<&Classification>,
) -> LevelAnalysis {
    let mut analyzer = Analyzer {
        program,
        config: *config,
        upper,
        classification: Classification::new(*config),
        footprint: Footprint::new(),
        recording: true,
    };
    let exit = analyzer.procedure(entry, CacheState::new(*config));
    debug!(
        "cache analysis of {} from {}: {} records, {} sets in use",
        program.procedure(entry).name,
        entry,
        analyzer.classification.len(),
        analyzer.footprint.sets().count()
    );
    LevelAnalysis {
        classification: analyzer.classification,
        footprint: analyzer.footprint,
        exit,
    }
}

struct Analyzer<'a> {
    program: &'a Program,
    config: CacheConfig,
    upper: Option<&'a Classification>,
    classification: Classification,
    footprint: Footprint,
    // false while searching for a loop fixpoint
    recording: bool,
}

type States = HashMap<BlockId, CacheState>;

fn state_of(out: &States, block: BlockId) -> &CacheState {
    match out.get(&block) {
        Some(s) => s,
        None => panic!("no cache state for block {}", block),
    }
}

impl<'a> Analyzer<'a> {
    /// Analyse a procedure invocation and return the join of the
    /// states at its sinks.
    fn procedure(&mut self, id: ProcId, entry: CacheState) -> CacheState {
        let program = self.program;
        let proc = program.procedure(id);
        let mut out = States::new();
        self.region(proc, proc.topo(), None, Context::ROOT, entry.clone(), &mut out);
        proc.sinks()
            .iter()
            .filter_map(|b| out.get(b))
            .fold(None, |acc: Option<CacheState>, s| match acc {
                None => Some(s.clone()),
                Some(a) => Some(a.join(s)),
            })
            .unwrap_or(entry)
    }

    /// Analyse the blocks of `order`, whose first block receives
    /// `entry`; every other block receives the join of the states of
    /// its analysed predecessors, taken left to right.
    fn region(
        &mut self,
        proc: &Procedure,
        order: &[BlockId],
        current: Option<LoopId>,
        ctx: Context,
        entry: CacheState,
        out: &mut States,
    ) {
        let mut entry = Some(entry);
        for &b in order {
            let input = match entry.take() {
                Some(s) => s,
                None => merge_preds(proc, b, out),
            };
            match proc.block(b).header_of.filter(|&l| Some(l) != current) {
                Some(l) => self.inner_loop(proc, l, ctx, input, out),
                None => {
                    let s = self.block(proc, b, ctx, input);
                    out.insert(b, s);
                }
            }
        }
    }

    fn inner_loop(
        &mut self,
        proc: &Procedure,
        id: LoopId,
        ctx: Context,
        entry: CacheState,
        out: &mut States,
    ) {
        let lp = proc.get_loop(id);
        if lp.bound == 0 {
            // the body never runs: control passes the loop untouched
            trace!("loop {} of {} is never executed", id, proc.name);
            for &b in lp.blocks() {
                out.insert(b, entry.clone());
            }
            return;
        }
        let first_ctx = ctx.enter(Iteration::First);
        let steady_ctx = ctx.enter(Iteration::Steady);

        self.region(proc, lp.topo(), Some(id), first_ctx, entry, out);
        let first: Vec<(BlockId, CacheState)> = lp
            .blocks()
            .iter()
            .filter_map(|b| out.get(b).map(|s| (*b, s.clone())))
            .collect();

        // iterate the steady state until the header input is stable
        let recording = std::mem::replace(&mut self.recording, false);
        let mut head = state_of(out, lp.sink).clone();
        let mut rounds = 0;
        loop {
            rounds += 1;
            self.region(proc, lp.topo(), Some(id), steady_ctx, head.clone(), out);
            let next = head.join(state_of(out, lp.sink));
            if next == head {
                break;
            }
            head = next;
        }
        self.recording = recording;
        trace!("loop {} of {} stable after {} rounds", id, proc.name, rounds);
        if recording {
            self.region(proc, lp.topo(), Some(id), steady_ctx, head, out);
        }

        // after the loop, a block may have last executed in either pass
        for (b, s) in first {
            let joined = s.join(state_of(out, b));
            out.insert(b, joined);
        }
    }

    fn block(
        &mut self,
        proc: &Procedure,
        id: BlockId,
        ctx: Context,
        mut state: CacheState,
    ) -> CacheState {
        let block = proc.block(id);
        let mut fetches = Vec::with_capacity(block.instrs.len());
        for (i, instr) in block.instrs.iter().enumerate() {
            let line = self.config.tagset(instr.addr);
            let above = self
                .upper
                .map(|u| u.access(proc.id, id, ctx, i).unwrap_or(Access::Unknown));
            let access = match above {
                Some(Access::HitUpper) | Some(Access::AlwaysHit { .. }) => Access::HitUpper,
                None | Some(Access::AlwaysMiss) => {
                    let a = state.classify(instr.addr);
                    state.access(instr.addr);
                    a
                }
                Some(Access::FirstMiss) | Some(Access::Unknown) => {
                    let a = state.classify(instr.addr);
                    state.access_maybe(instr.addr);
                    a
                }
            };
            if self.recording && access != Access::HitUpper {
                self.footprint.record(self.config.set_of(line), line);
            }
            fetches.push(Fetch { line, access });

            if let Some(callee) = instr.callee {
                let returned = self.procedure(callee, state.clone());
                state = returned.join(&state);
            }
        }
        if self.recording {
            trace!("{}/{} {}: {:?}", proc.name, id, ctx, fetches);
            self.classification.record(proc.id, id, ctx, fetches);
        }
        state
    }
}

fn merge_preds(proc: &Procedure, id: BlockId, out: &States) -> CacheState {
    let mut states = proc.block(id).preds.iter().filter_map(|p| out.get(p));
    let first = match states.next() {
        Some(s) => s.clone(),
        None => panic!("block {} of {} reached with no analysed predecessor", id, proc.name),
    };
    states.fold(first, |acc, s| acc.join(s))
}
