use std::collections::HashMap;

use tracing::{debug, trace};

use super::{Engine, LoopTreatment, ProcTiming, Scenario, TimingError, Timestamps};
use crate::bus::{BusTracker, TdmaSchedule};
use crate::cache::Access;
use crate::context::{Context, Iteration};
use crate::offset_graph::{Endpoint, Objective, OffsetGraph};
use crate::program::{BlockId, Loop, LoopId, ProcId, Procedure};
use crate::time::{Duration, Instant};

/// Where a fetch is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessType {
    L1Hit,
    L2Hit,
    L2Miss,
}

#[derive(Debug, Clone, Copy)]
struct Stamp {
    start: Instant,
    finish: Instant,
    // the most recent bus transfer up to the end of the block
    bus: BusTracker,
}

type Times = HashMap<BlockId, Stamp>;

/// One propagation pass of an [Engine] for one scenario.
pub(super) struct Run<'e, 'a> {
    engine: &'e Engine<'a>,
    scenario: Scenario,
    // true while an iteration is analysed at relative time zero
    summarizing: bool,
    summaries: HashMap<(ProcId, LoopId, Context), (Duration, Duration)>,
    stamps: Timestamps,
}

fn end_align(time: Duration, interval: Duration) -> Duration {
    if interval == 0 || time % interval == 0 {
        0
    } else {
        interval - time % interval
    }
}

impl<'e, 'a> Run<'e, 'a> {
    pub(super) fn new(engine: &'e Engine<'a>, scenario: Scenario) -> Self {
        Run {
            engine,
            scenario,
            summarizing: false,
            summaries: HashMap::new(),
            stamps: Timestamps::default(),
        }
    }

    pub(super) fn into_stamps(self) -> Timestamps {
        self.stamps
    }

    fn is_later(&self, a: Instant, b: Instant) -> bool {
        match self.scenario {
            Scenario::Wcet => a > b,
            Scenario::Bcet => a < b,
        }
    }

    fn set(&mut self, proc: ProcId, times: &mut Times, block: BlockId, stamp: Stamp) {
        if !self.summarizing {
            self.stamps.blocks.insert((proc, block), (stamp.start, stamp.finish));
        }
        times.insert(block, stamp);
    }

    /// Propagate through a procedure invoked at `start`.
    pub(super) fn procedure(
        &mut self,
        id: ProcId,
        start: Instant,
    ) -> Result<ProcTiming, TimingError> {
        let program = self.engine.program;
        let proc = program.procedure(id);
        let summarizing = std::mem::replace(&mut self.summarizing, false);
        let mut times = Times::new();
        let entry = Stamp {
            start,
            finish: start,
            bus: BusTracker::new(),
        };
        let result = self.region(proc, proc.topo(), None, Context::ROOT, entry, &mut times);
        self.summarizing = summarizing;
        result?;

        let mut finishes = proc.sinks().iter().filter_map(|b| times.get(b)).map(|s| s.finish);
        let first = match finishes.next() {
            Some(f) => f,
            None => panic!("no sink of {} was reached", proc.name),
        };
        let finish = finishes.fold(first, |acc, f| if self.is_later(f, acc) { f } else { acc });
        assert!(finish >= start, "computed negative runtime for {}", proc.name);
        let timing = ProcTiming {
            start,
            finish,
            cost: finish - start,
        };
        debug!(
            "{:?} of {} ({}) starting at {}: {}",
            self.scenario, proc.name, id, start, timing.cost
        );
        if !self.summarizing {
            self.stamps.procedures.insert(id, timing);
        }
        Ok(timing)
    }

    /// Propagate through the blocks of `order`. The first block starts
    /// as given by `entry`, every other one after its latest (WCET) or
    /// earliest (BCET) processed predecessor.
    fn region(
        &mut self,
        proc: &Procedure,
        order: &[BlockId],
        current: Option<LoopId>,
        ctx: Context,
        entry: Stamp,
        times: &mut Times,
    ) -> Result<(), TimingError> {
        let mut entry = Some(entry);
        for &b in order {
            let from = match entry.take() {
                Some(e) => e,
                None => self.start_of(proc, b, times),
            };
            match proc.block(b).header_of.filter(|&l| Some(l) != current) {
                Some(l) => self.inner_loop(proc, l, ctx, from, times)?,
                None => {
                    let stamp = self.block(proc, b, ctx, from.finish, from.bus)?;
                    self.set(proc.id, times, b, stamp);
                }
            }
        }
        Ok(())
    }

    /// The predecessor stamp a block starts from.
    fn start_of(&self, proc: &Procedure, id: BlockId, times: &Times) -> Stamp {
        let mut from: Option<Stamp> = None;
        for p in &proc.block(id).preds {
            if let Some(s) = times.get(p) {
                if from.map_or(true, |f| self.is_later(s.finish, f.finish)) {
                    from = Some(*s);
                }
            }
        }
        match from {
            Some(s) => s,
            None => panic!("block {} of {} reached with no processed predecessor", id, proc.name),
        }
    }

    fn block(
        &mut self,
        proc: &Procedure,
        id: BlockId,
        ctx: Context,
        start: Instant,
        mut bus: BusTracker,
    ) -> Result<Stamp, TimingError> {
        let program = self.engine.program;
        let instr_cost = self.engine.platform.instr_cost(self.scenario);
        let mut cost = 0;
        for (i, instr) in proc.block(id).instrs.iter().enumerate() {
            cost += self.fetch(proc.id, id, ctx, i, start + cost, &mut bus);
            cost += instr_cost;
            if let Some(callee) = instr.callee {
                let t = self.procedure(callee, start + cost)?;
                cost += t.cost;
                trace!(
                    "call from {}/{} to {}: {}",
                    proc.name,
                    id,
                    program.procedure(callee).name,
                    t.cost
                );
            }
        }
        trace!("{}/{} {} at {}: {}", proc.name, id, ctx, start, cost);
        Ok(Stamp {
            start,
            finish: start + cost,
            bus,
        })
    }

    /// Whether a fetch with the given classification is counted as a
    /// hit at its level.
    fn hits(&self, ctx: Context, access: Access) -> bool {
        match self.scenario {
            Scenario::Wcet => {
                access.is_hit()
                    || (access == Access::FirstMiss && ctx.innermost() == Some(Iteration::Steady))
            }
            Scenario::Bcet => access != Access::AlwaysMiss,
        }
    }

    fn access_type(&self, proc: ProcId, block: BlockId, ctx: Context, instr: usize) -> AccessType {
        let analysis = self.engine.analysis;
        let l1 = analysis
            .l1
            .access(proc, block, ctx, instr)
            .unwrap_or(Access::Unknown);
        if self.hits(ctx, l1) {
            return AccessType::L1Hit;
        }
        let l2 = analysis
            .l2
            .as_ref()
            .map(|c| c.access(proc, block, ctx, instr).unwrap_or(Access::Unknown));
        match l2 {
            Some(a) if self.hits(ctx, a) => AccessType::L2Hit,
            _ => AccessType::L2Miss,
        }
    }

    fn fetch(
        &self,
        proc: ProcId,
        block: BlockId,
        ctx: Context,
        instr: usize,
        time: Instant,
        bus: &mut BusTracker,
    ) -> Duration {
        let platform = self.engine.platform;
        let latency = match self.access_type(proc, block, ctx, instr) {
            AccessType::L1Hit => return platform.hierarchy.l1.hit_latency(),
            AccessType::L2Hit => platform.hierarchy.l2_hit_latency(),
            AccessType::L2Miss => platform.hierarchy.miss_penalty(),
        };
        match (self.summarizing, platform.bus.tdma(), self.scenario) {
            (true, Some(s), Scenario::Wcet) => bus.delay(s, time, latency),
            (true, Some(_), Scenario::Bcet) => latency,
            _ => platform.bus.delay(self.scenario, self.engine.core, time, latency),
        }
    }

    fn iterations(&self, lp: &Loop) -> u64 {
        match self.scenario {
            Scenario::Wcet if !lp.natural_exit => lp.bound + 1,
            _ => lp.bound,
        }
    }

    /// Let every block of a loop finish at `finish`.
    fn finish_loop(
        &mut self,
        proc: &Procedure,
        lp: &Loop,
        start: Instant,
        finish: Instant,
        times: &mut Times,
    ) {
        for &b in lp.blocks() {
            let stamp = Stamp {
                start,
                finish,
                bus: BusTracker::new(),
            };
            self.set(proc.id, times, b, stamp);
        }
    }

    fn inner_loop(
        &mut self,
        proc: &Procedure,
        id: LoopId,
        ctx: Context,
        entry: Stamp,
        times: &mut Times,
    ) -> Result<(), TimingError> {
        let lp = proc.get_loop(id);
        if lp.bound == 0 {
            debug!("loop {} of {} is never executed", id, proc.name);
            self.finish_loop(proc, lp, entry.finish, entry.finish, times);
            return Ok(());
        }
        let schedule = self.engine.platform.bus.tdma();
        match (self.engine.platform.loops, schedule) {
            (LoopTreatment::Summarize, _) => self.summarize(proc, lp, ctx, entry.finish, times),
            (LoopTreatment::OffsetGraph, Some(s)) => {
                self.offset_graph(proc, lp, ctx, entry, s, times)
            }
            _ => self.unroll(proc, lp, ctx, entry, times),
        }
    }

    fn unroll(
        &mut self,
        proc: &Procedure,
        lp: &Loop,
        ctx: Context,
        entry: Stamp,
        times: &mut Times,
    ) -> Result<(), TimingError> {
        let mut next = entry;
        for i in 0..self.iterations(lp) {
            let it = if i == 0 { Iteration::First } else { Iteration::Steady };
            self.region(proc, lp.topo(), Some(lp.id), ctx.enter(it), next, times)?;
            let sink = times[&lp.sink];
            assert!(
                sink.finish >= next.finish,
                "computed negative runtime for loop {} of {}",
                lp.id,
                proc.name
            );
            next = sink;
        }
        trace!(
            "loop {} of {} {}: {} to {}",
            lp.id,
            proc.name,
            ctx,
            entry.finish,
            next.finish
        );
        let header = Stamp {
            start: entry.finish,
            ..next
        };
        self.set(proc.id, times, lp.header, header);
        Ok(())
    }

    /// One iteration of a loop at relative time zero: its latest block
    /// finish (WCET) or its sink finish (BCET).
    fn iteration(
        &mut self,
        proc: &Procedure,
        lp: &Loop,
        ctx: Context,
    ) -> Result<Duration, TimingError> {
        let summarizing = std::mem::replace(&mut self.summarizing, true);
        let mut local = Times::new();
        let entry = Stamp {
            start: 0,
            finish: 0,
            bus: BusTracker::new(),
        };
        let result = self.region(proc, lp.topo(), Some(lp.id), ctx, entry, &mut local);
        self.summarizing = summarizing;
        result?;
        Ok(match self.scenario {
            Scenario::Wcet => local.values().map(|s| s.finish).max().unwrap_or(0),
            Scenario::Bcet => local[&lp.sink].finish,
        })
    }

    fn summarize(
        &mut self,
        proc: &Procedure,
        lp: &Loop,
        ctx: Context,
        start: Instant,
        times: &mut Times,
    ) -> Result<(), TimingError> {
        let key = (proc.id, lp.id, ctx);
        let (first, steady) = match self.summaries.get(&key) {
            Some(&s) => s,
            None => {
                let first = self.iteration(proc, lp, ctx.enter(Iteration::First))?;
                let steady = self.iteration(proc, lp, ctx.enter(Iteration::Steady))?;
                self.summaries.insert(key, (first, steady));
                (first, steady)
            }
        };
        let rest = self.iterations(lp) - 1;
        let interval = self.engine.platform.bus.tdma().map_or(0, TdmaSchedule::interval);
        let cost = match self.scenario {
            Scenario::Wcet => {
                interval + first + interval + (steady + end_align(steady, interval)) * rest
            }
            Scenario::Bcet => first + steady * rest,
        };
        debug!(
            "{:?} summary of loop {} of {} {}: first {}, steady {}, total {}",
            self.scenario, lp.id, proc.name, ctx, first, steady, cost
        );
        self.finish_loop(proc, lp, start, start + cost, times);
        Ok(())
    }

    /// The cost of one steady-state iteration starting at the absolute
    /// time `offset`, computed by a separate pass for `scenario`.
    fn steady_at(
        &self,
        proc: &Procedure,
        lp: &Loop,
        ctx: Context,
        offset: Instant,
        scenario: Scenario,
    ) -> Result<Duration, TimingError> {
        let mut sub = Run::new(self.engine, scenario);
        let mut local = Times::new();
        let entry = Stamp {
            start: offset,
            finish: offset,
            bus: BusTracker::new(),
        };
        sub.region(
            proc,
            lp.topo(),
            Some(lp.id),
            ctx.enter(Iteration::Steady),
            entry,
            &mut local,
        )?;
        Ok(local[&lp.sink].finish - offset)
    }

    fn offset_graph(
        &mut self,
        proc: &Procedure,
        lp: &Loop,
        ctx: Context,
        entry: Stamp,
        schedule: &TdmaSchedule,
        times: &mut Times,
    ) -> Result<(), TimingError> {
        self.region(proc, lp.topo(), Some(lp.id), ctx.enter(Iteration::First), entry, times)?;
        let first_end = times[&lp.sink].finish;
        let steady = self.iterations(lp) - 1;
        if steady == 0 {
            self.finish_loop(proc, lp, entry.finish, first_end, times);
            return Ok(());
        }

        let interval = schedule.interval();
        let mut graph = OffsetGraph::new(interval);
        let (start_node, _) = graph.add_node(first_end);
        let mut work = vec![start_node];
        while let Some(node) = work.pop() {
            let offset = graph.node(node).offset;
            let bc = self.steady_at(proc, lp, ctx, offset, Scenario::Bcet)?;
            let wc = self.steady_at(proc, lp, ctx, offset, Scenario::Wcet)?;
            let (lo, hi) = (bc.min(wc), bc.max(wc));
            graph.set_weights(node, lo, hi);
            let ends: Vec<Duration> = if hi - lo >= interval {
                (0..interval).collect()
            } else {
                (lo..=hi).map(|d| (offset + d) % interval).collect()
            };
            for end in ends {
                let (next, new) = graph.add_node(end);
                // the iteration is charged to the node it starts in
                graph.add_edge(Endpoint::Node(node), Endpoint::Node(next), 0, 0);
                if new {
                    work.push(next);
                }
            }
        }
        graph.connect_terminals(start_node);
        trace!("{}", graph);

        let objective = Objective::from(self.scenario);
        let solution = self
            .engine
            .solver
            .solve(&graph, objective, steady)
            .map_err(|source| TimingError::Solver {
                proc: proc.id,
                lp: lp.id,
                source,
            })?;
        debug!(
            "offset graph of loop {} of {} {}: {} offsets, {:?} {} for {} iterations",
            lp.id,
            proc.name,
            ctx,
            graph.nodes().len(),
            objective,
            solution.value,
            steady
        );
        self.finish_loop(proc, lp, entry.finish, first_end + solution.value, times);
        if !self.summarizing {
            self.stamps.graphs.push((proc.id, lp.id, graph));
        }
        Ok(())
    }
}
