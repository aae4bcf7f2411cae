/*! Best- and worst-case execution-time propagation.

The [Engine] walks the control-flow graph of a procedure in topological
order and assigns every basic block a start and a finish time. A block
starts when its last (WCET) or first (BCET) predecessor finishes; its
cost is the sum of the fetch latency of each instruction, as implied by
the cache classification of its context and the bus model, the fixed
per-instruction execution cost, and the cost of called procedures.

Loops are handled according to the [LoopTreatment] of the [Platform]:
virtually unrolled, summarised from one first and one steady-state
iteration, or bounded with an [OffsetGraph](crate::offset_graph::OffsetGraph)
for TDMA buses. */

use std::collections::HashMap;

use thiserror::Error;

use crate::bus::{BusModel, ScheduleError};
use crate::cache::{CacheAnalysis, Hierarchy};
use crate::offset_graph::{OffsetGraph, PathSolver, SolveLp, SolverError};
use crate::program::{BlockId, LoopId, ProcId, Program};
use crate::time::{Duration, Instant};

mod run;

use run::Run;

/// Which bound is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    /// Best-case execution time.
    Bcet,
    /// Worst-case execution time.
    Wcet,
}

/// How the timing of loops is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopTreatment {
    /// Propagate times through every iteration.
    #[default]
    Unroll,
    /// Analyse one first and one steady-state iteration at relative time
    /// zero and extrapolate, aligning to the TDMA interval.
    Summarize,
    /// Explore the TDMA offsets reachable by steady-state iterations
    /// and bound their total cost with a flow problem. Loops are
    /// unrolled if the bus has no TDMA schedule.
    OffsetGraph,
}

/// The timing-relevant parameters of the hardware platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub hierarchy: Hierarchy,
    pub bus: BusModel,
    /// Best-case execution cost of an instruction, excluding its fetch.
    pub instr_bcet: Duration,
    /// Worst-case execution cost of an instruction, excluding its fetch.
    pub instr_wcet: Duration,
    pub loops: LoopTreatment,
    /// Whether tasks are analysed in isolation, i.e., without release
    /// times and precedence constraints.
    pub independent: bool,
}

impl Platform {
    /// A platform whose bus transfers must fit into a TDMA slot.
    pub fn new(hierarchy: Hierarchy, bus: BusModel) -> Result<Self, ScheduleError> {
        if let Some(s) = bus.tdma() {
            s.check_transfer(hierarchy.l2_hit_latency())?;
            s.check_transfer(hierarchy.miss_penalty())?;
        }
        Ok(Platform {
            hierarchy,
            bus,
            instr_bcet: 0,
            instr_wcet: 0,
            loops: LoopTreatment::Unroll,
            independent: false,
        })
    }

    pub fn with_instr_cost(mut self, bcet: Duration, wcet: Duration) -> Self {
        assert!(bcet <= wcet, "instruction BCET exceeds WCET");
        self.instr_bcet = bcet;
        self.instr_wcet = wcet;
        self
    }

    pub fn with_loops(mut self, loops: LoopTreatment) -> Self {
        self.loops = loops;
        self
    }

    pub fn with_independent_tasks(mut self, independent: bool) -> Self {
        self.independent = independent;
        self
    }

    pub fn instr_cost(&self, scenario: Scenario) -> Duration {
        match scenario {
            Scenario::Bcet => self.instr_bcet,
            Scenario::Wcet => self.instr_wcet,
        }
    }
}

/// Error type returned when the timing of a procedure cannot be
/// determined.
#[derive(Debug, Error)]
pub enum TimingError {
    #[error("failed to bound loop {lp} of procedure {proc}")]
    Solver {
        proc: ProcId,
        lp: LoopId,
        #[source]
        source: SolverError,
    },
}

/// Timing of one procedure invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcTiming {
    pub start: Instant,
    pub finish: Instant,
    /// The running cost, `finish - start`.
    pub cost: Duration,
}

/// Start and finish times computed during one analysis. Blocks and
/// procedures that execute more than once keep their latest times.
#[derive(Debug, Clone, Default)]
pub struct Timestamps {
    blocks: HashMap<(ProcId, BlockId), (Instant, Instant)>,
    procedures: HashMap<ProcId, ProcTiming>,
    graphs: Vec<(ProcId, LoopId, OffsetGraph)>,
}

impl Timestamps {
    /// The start and finish time of a block.
    pub fn block(&self, proc: ProcId, block: BlockId) -> Option<(Instant, Instant)> {
        self.blocks.get(&(proc, block)).copied()
    }

    pub fn procedure(&self, proc: ProcId) -> Option<ProcTiming> {
        self.procedures.get(&proc).copied()
    }

    /// The offset graphs built for loops, in the order they were solved.
    pub fn offset_graphs(&self) -> &[(ProcId, LoopId, OffsetGraph)] {
        &self.graphs
    }
}

/// Computes execution-time bounds of the procedures of a program on one
/// core of a platform.
pub struct Engine<'a> {
    program: &'a Program,
    analysis: &'a CacheAnalysis,
    platform: &'a Platform,
    solver: Box<dyn SolveLp + 'a>,
    core: usize,
}

impl<'a> Engine<'a> {
    /// An engine on core 0 that solves offset graphs with the embedded
    /// [PathSolver].
    pub fn new(program: &'a Program, analysis: &'a CacheAnalysis, platform: &'a Platform) -> Self {
        Engine {
            program,
            analysis,
            platform,
            solver: Box::new(PathSolver),
            core: 0,
        }
    }

    pub fn with_solver(mut self, solver: impl SolveLp + 'a) -> Self {
        self.solver = Box::new(solver);
        self
    }

    /// Analyse on the given core, which determines the TDMA slot.
    pub fn on_core(mut self, core: usize) -> Self {
        if let Some(s) = self.platform.bus.schedule() {
            assert!(core < s.cores(), "core {} is not in the bus schedule", core);
        }
        self.core = core;
        self
    }

    pub fn core(&self) -> usize {
        self.core
    }

    pub fn platform(&self) -> &Platform {
        self.platform
    }

    /// Bound the execution time of `entry` when invoked at `start`.
    pub fn analyze(
        &self,
        entry: ProcId,
        start: Instant,
        scenario: Scenario,
    ) -> Result<ProcTiming, TimingError> {
        self.trace(entry, start, scenario).map(|(t, _)| t)
    }

    /// Like [Engine::analyze], additionally returning the times of all
    /// blocks.
    pub fn trace(
        &self,
        entry: ProcId,
        start: Instant,
        scenario: Scenario,
    ) -> Result<(ProcTiming, Timestamps), TimingError> {
        let mut run = Run::new(self, scenario);
        let timing = run.procedure(entry, start)?;
        Ok((timing, run.into_stamps()))
    }
}
