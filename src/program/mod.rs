/*! The control-flow model of the analysed program.

A [Program] is a set of [Procedure]s. Each procedure consists of basic
[Block]s connected by *forward* edges and of natural [Loop]s. The back
edge of a loop is not part of the edge set: it is implied by the loop's
sink, after which control returns to the loop's header.

The analyses walk procedures in topological order, where every loop is
collapsed into its header. Loop bodies are walked in their own
topological order, header first, with nested loops again collapsed into
their headers. Both orders are computed by the [ProcedureBuilder]. */

use std::collections::HashSet;

use derive_more::{Display, From, Into};
use thiserror::Error;

/// A byte address in the program's instruction memory.
pub type Address = u64;

/// Index of a procedure in a [Program].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into, Display)]
#[display(fmt = "P{}", _0)]
pub struct ProcId(pub usize);

/// Index of a basic block in its [Procedure].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into, Display)]
#[display(fmt = "B{}", _0)]
pub struct BlockId(pub usize);

/// Index of a loop in its [Procedure].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into, Display)]
#[display(fmt = "L{}", _0)]
pub struct LoopId(pub usize);

/// Errors detected while assembling the control-flow model.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProgramError {
    #[error("procedure {proc}: block {block} does not exist")]
    UnknownBlock { proc: ProcId, block: BlockId },
    #[error("procedure {proc}: forward edges contain a cycle through {block}")]
    Cycle { proc: ProcId, block: BlockId },
    #[error("procedure {proc}: loop {lp} must contain its header and its sink")]
    MalformedLoop { proc: ProcId, lp: LoopId },
    #[error("procedure {proc}: block {block} heads more than one loop")]
    DuplicateHeader { proc: ProcId, block: BlockId },
    #[error("procedure {proc}: loop {lp} is entered through {block} instead of its header")]
    LoopEntry { proc: ProcId, lp: LoopId, block: BlockId },
    #[error("procedure {proc}: loops {a} and {b} overlap without nesting")]
    Overlap { proc: ProcId, a: LoopId, b: LoopId },
    #[error("procedure {proc}: the sink of loop {lp} lies in a nested loop")]
    NestedSink { proc: ProcId, lp: LoopId },
    #[error("procedure {proc}: block {block} has no predecessor but is not the entry")]
    Unreachable { proc: ProcId, block: BlockId },
    #[error("procedure {0} has no blocks")]
    Empty(ProcId),
    #[error("procedure {0} has no exit")]
    NoSink(ProcId),
    #[error("procedure {0} is stored at the wrong index")]
    Misplaced(ProcId),
    #[error("procedure {caller} calls unknown procedure {callee}")]
    UnknownCallee { caller: ProcId, callee: ProcId },
    #[error("procedure {0} is part of a recursive call chain")]
    Recursive(ProcId),
}

/// A single instruction: its fetch address and, for calls, the called
/// procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub addr: Address,
    pub callee: Option<ProcId>,
}

impl Instr {
    pub fn new(addr: Address) -> Self {
        Instr { addr, callee: None }
    }

    pub fn call(addr: Address, callee: ProcId) -> Self {
        Instr {
            addr,
            callee: Some(callee),
        }
    }

    pub fn is_call(&self) -> bool {
        self.callee.is_some()
    }
}

/// A basic block.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub instrs: Vec<Instr>,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    /// The loop this block is the header of, if any.
    pub header_of: Option<LoopId>,
    /// The innermost loop containing this block, if any.
    pub innermost: Option<LoopId>,
}

/// A natural loop.
#[derive(Debug, Clone)]
pub struct Loop {
    pub id: LoopId,
    pub header: BlockId,
    /// The block whose back edge returns to the header.
    pub sink: BlockId,
    /// Maximum number of iterations.
    pub bound: u64,
    /// Whether `bound` counts the executions of the header. If not,
    /// the header runs once more than the body and the worst case
    /// unrolls `bound + 1` iterations.
    pub natural_exit: bool,
    /// Enclosing loop.
    pub parent: Option<LoopId>,
    /// Nesting level, 0 for outermost loops.
    pub level: usize,
    blocks: Vec<BlockId>,
    topo: Vec<BlockId>,
}

impl Loop {
    /// All blocks of the loop, including those of nested loops.
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    /// The loop body in topological order with nested loops collapsed
    /// into their headers. The header always comes first.
    pub fn topo(&self) -> &[BlockId] {
        &self.topo
    }

    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.binary_search(&block).is_ok()
    }
}

/// A procedure with its blocks and loops.
#[derive(Debug, Clone)]
pub struct Procedure {
    pub id: ProcId,
    pub name: String,
    blocks: Vec<Block>,
    loops: Vec<Loop>,
    topo: Vec<BlockId>,
    sinks: Vec<BlockId>,
}

impl Procedure {
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0]
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn get_loop(&self, id: LoopId) -> &Loop {
        &self.loops[id.0]
    }

    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    /// The loop headed by `block`, if any.
    pub fn loop_headed_by(&self, block: BlockId) -> Option<&Loop> {
        self.block(block).header_of.map(|l| self.get_loop(l))
    }

    /// The procedure body in topological order with loops collapsed
    /// into their headers. The entry block comes first.
    pub fn topo(&self) -> &[BlockId] {
        &self.topo
    }

    pub fn entry(&self) -> BlockId {
        self.topo[0]
    }

    /// The blocks of [Procedure::topo] through which control leaves
    /// the procedure.
    pub fn sinks(&self) -> &[BlockId] {
        &self.sinks
    }

    /// All procedures called from this one.
    pub fn callees(&self) -> impl Iterator<Item = ProcId> + '_ {
        self.blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .filter_map(|i| i.callee)
    }

    /// The number of loops enclosing `block`.
    pub fn loop_depth(&self, block: BlockId) -> usize {
        self.block(block)
            .innermost
            .map(|l| self.get_loop(l).level + 1)
            .unwrap_or(0)
    }
}

/// The whole program: all procedures, indexed by their [ProcId].
#[derive(Debug, Clone)]
pub struct Program {
    procs: Vec<Procedure>,
}

impl Program {
    /// Assemble a program. Procedure `i` must carry `ProcId(i)`, calls
    /// must target known procedures and the call graph must be
    /// acyclic.
    pub fn new(procs: Vec<Procedure>) -> Result<Self, ProgramError> {
        for (i, p) in procs.iter().enumerate() {
            if p.id != ProcId(i) {
                return Err(ProgramError::Misplaced(p.id));
            }
            if let Some(callee) = p.callees().find(|c| c.0 >= procs.len()) {
                return Err(ProgramError::UnknownCallee {
                    caller: p.id,
                    callee,
                });
            }
        }
        let program = Program { procs };
        program.check_recursion()?;
        Ok(program)
    }

    fn check_recursion(&self) -> Result<(), ProgramError> {
        // depth-first search for a back edge in the call graph
        fn visit(
            prog: &Program,
            p: ProcId,
            active: &mut HashSet<ProcId>,
            done: &mut HashSet<ProcId>,
        ) -> Result<(), ProgramError> {
            if done.contains(&p) {
                return Ok(());
            }
            if !active.insert(p) {
                return Err(ProgramError::Recursive(p));
            }
            for c in prog.procedure(p).callees() {
                visit(prog, c, active, done)?;
            }
            active.remove(&p);
            done.insert(p);
            Ok(())
        }
        let mut active = HashSet::new();
        let mut done = HashSet::new();
        for p in &self.procs {
            visit(self, p.id, &mut active, &mut done)?;
        }
        Ok(())
    }

    pub fn procedure(&self, id: ProcId) -> &Procedure {
        &self.procs[id.0]
    }

    pub fn procedures(&self) -> &[Procedure] {
        &self.procs
    }
}

mod builder;

pub use builder::ProcedureBuilder;
