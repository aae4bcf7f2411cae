use std::collections::BTreeSet;

use super::{Address, Block, BlockId, Instr, Loop, LoopId, ProcId, Procedure, ProgramError};

struct LoopSpec {
    header: BlockId,
    sink: BlockId,
    members: Vec<BlockId>,
    bound: u64,
    natural_exit: bool,
}

/// Incrementally assemble a [Procedure] and derive its topological
/// orders, loop nesting and sinks.
///
/// Block `B0` is the entry of the procedure.
pub struct ProcedureBuilder {
    id: ProcId,
    name: String,
    blocks: Vec<Vec<Instr>>,
    edges: Vec<(BlockId, BlockId)>,
    loops: Vec<LoopSpec>,
}

/// Width of an instruction in bytes, used by [ProcedureBuilder::straight].
pub const INSTR_BYTES: Address = 4;

impl ProcedureBuilder {
    pub fn new(id: ProcId, name: impl Into<String>) -> Self {
        ProcedureBuilder {
            id,
            name: name.into(),
            blocks: Vec::new(),
            edges: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Add a block with the given instructions.
    pub fn block(&mut self, instrs: impl IntoIterator<Item = Instr>) -> BlockId {
        self.blocks.push(instrs.into_iter().collect());
        BlockId(self.blocks.len() - 1)
    }

    /// Add a block of `count` consecutive non-call instructions
    /// starting at `start`.
    pub fn straight(&mut self, start: Address, count: usize) -> BlockId {
        self.block((0..count as Address).map(|k| Instr::new(start + k * INSTR_BYTES)))
    }

    /// Add a forward control-flow edge.
    pub fn edge(&mut self, from: BlockId, to: BlockId) -> &mut Self {
        self.edges.push((from, to));
        self
    }

    /// Declare a loop. `members` lists all blocks of the loop, nested
    /// loops included; the header and the sink are added implicitly.
    pub fn add_loop(
        &mut self,
        header: BlockId,
        sink: BlockId,
        members: &[BlockId],
        bound: u64,
        natural_exit: bool,
    ) -> LoopId {
        let mut members = members.to_vec();
        members.push(header);
        members.push(sink);
        members.sort();
        members.dedup();
        self.loops.push(LoopSpec {
            header,
            sink,
            members,
            bound,
            natural_exit,
        });
        LoopId(self.loops.len() - 1)
    }

    pub fn build(self) -> Result<Procedure, ProgramError> {
        let proc = self.id;
        let n = self.blocks.len();
        if n == 0 {
            return Err(ProgramError::Empty(proc));
        }
        let check = |b: BlockId| {
            if b.0 < n {
                Ok(b)
            } else {
                Err(ProgramError::UnknownBlock { proc, block: b })
            }
        };

        let mut blocks: Vec<Block> = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(i, instrs)| Block {
                id: BlockId(i),
                instrs,
                preds: Vec::new(),
                succs: Vec::new(),
                header_of: None,
                innermost: None,
            })
            .collect();
        for &(from, to) in &self.edges {
            let (from, to) = (check(from)?, check(to)?);
            if !blocks[from.0].succs.contains(&to) {
                blocks[from.0].succs.push(to);
                blocks[to.0].preds.push(from);
            }
        }
        if let Some(b) = blocks.iter().skip(1).find(|b| b.preds.is_empty()) {
            return Err(ProgramError::Unreachable { proc, block: b.id });
        }

        let order = topological_order(proc, &blocks)?;
        let mut pos = vec![0; n];
        for (k, b) in order.iter().enumerate() {
            pos[b.0] = k;
        }

        // validate loops and determine the nesting
        for (l, spec) in self.loops.iter().enumerate() {
            for &m in &spec.members {
                check(m)?;
            }
            if spec.members.binary_search(&spec.header).is_err()
                || spec.members.binary_search(&spec.sink).is_err()
            {
                return Err(ProgramError::MalformedLoop { proc, lp: LoopId(l) });
            }
            if blocks[spec.header.0].header_of.is_some() {
                return Err(ProgramError::DuplicateHeader {
                    proc,
                    block: spec.header,
                });
            }
            blocks[spec.header.0].header_of = Some(LoopId(l));
        }
        let mut parents = vec![None; self.loops.len()];
        for (a, la) in self.loops.iter().enumerate() {
            let sa: BTreeSet<_> = la.members.iter().collect();
            for (b, lb) in self.loops.iter().enumerate().filter(|(b, _)| *b != a) {
                let sb: BTreeSet<_> = lb.members.iter().collect();
                if sa.is_disjoint(&sb) || (sb.len() < sa.len() && sb.is_subset(&sa)) {
                    continue;
                }
                if sa.len() == sb.len() || !sa.is_subset(&sb) {
                    return Err(ProgramError::Overlap {
                        proc,
                        a: LoopId(a),
                        b: LoopId(b),
                    });
                }
                // `b` strictly contains `a`: keep the smallest such loop
                let closer = match parents[a] {
                    None => true,
                    Some(LoopId(p)) => lb.members.len() < self.loops[p].members.len(),
                };
                if closer {
                    parents[a] = Some(LoopId(b));
                }
            }
        }
        let levels: Vec<usize> = (0..self.loops.len())
            .map(|l| {
                let mut level = 0;
                let mut cur = parents[l];
                while let Some(LoopId(p)) = cur {
                    level += 1;
                    cur = parents[p];
                }
                level
            })
            .collect();

        // the innermost loop of a block is the deepest one containing it
        for (l, spec) in self.loops.iter().enumerate() {
            for &m in &spec.members {
                let deeper = match blocks[m.0].innermost {
                    None => true,
                    Some(LoopId(o)) => levels[l] > levels[o],
                };
                if deeper {
                    blocks[m.0].innermost = Some(LoopId(l));
                }
            }
        }

        let mut loops = Vec::with_capacity(self.loops.len());
        for (l, spec) in self.loops.into_iter().enumerate() {
            let id = LoopId(l);
            for &m in spec.members.iter().filter(|&&m| m != spec.header) {
                let outside = blocks[m.0]
                    .preds
                    .iter()
                    .any(|p| spec.members.binary_search(p).is_err());
                if outside {
                    return Err(ProgramError::LoopEntry {
                        proc,
                        lp: id,
                        block: m,
                    });
                }
            }
            if blocks[spec.sink.0].innermost != Some(id) {
                return Err(ProgramError::NestedSink { proc, lp: id });
            }
            let mut topo: Vec<BlockId> = spec
                .members
                .iter()
                .copied()
                .filter(|&m| {
                    blocks[m.0].innermost == Some(id)
                        || blocks[m.0]
                            .header_of
                            .map_or(false, |h| parents[h.0] == Some(id))
                })
                .collect();
            topo.sort_by_key(|b| pos[b.0]);
            debug_assert_eq!(topo.first(), Some(&spec.header));
            loops.push(Loop {
                id,
                header: spec.header,
                sink: spec.sink,
                bound: spec.bound,
                natural_exit: spec.natural_exit,
                parent: parents[l],
                level: levels[l],
                blocks: spec.members,
                topo,
            });
        }

        let topo: Vec<BlockId> = order
            .iter()
            .copied()
            .filter(|&b| match blocks[b.0].innermost {
                None => true,
                Some(l) => blocks[b.0].header_of == Some(l) && loops[l.0].level == 0,
            })
            .collect();
        let sinks: Vec<BlockId> = topo
            .iter()
            .copied()
            .filter(|&b| match blocks[b.0].header_of {
                Some(l) => loops[l.0].blocks.iter().all(|m| {
                    blocks[m.0]
                        .succs
                        .iter()
                        .all(|s| loops[l.0].contains(*s))
                }),
                None => blocks[b.0].succs.is_empty(),
            })
            .collect();
        if sinks.is_empty() {
            return Err(ProgramError::NoSink(proc));
        }

        Ok(Procedure {
            id: proc,
            name: self.name,
            blocks,
            loops,
            topo,
            sinks,
        })
    }
}

/// Kahn's algorithm over the forward edges, always picking the ready
/// block with the smallest index.
fn topological_order(proc: ProcId, blocks: &[Block]) -> Result<Vec<BlockId>, ProgramError> {
    let mut indegree: Vec<usize> = blocks.iter().map(|b| b.preds.len()).collect();
    let mut ready: BTreeSet<BlockId> = blocks
        .iter()
        .filter(|b| b.preds.is_empty())
        .map(|b| b.id)
        .collect();
    let mut order = Vec::with_capacity(blocks.len());
    while let Some(b) = ready.iter().next().copied() {
        ready.remove(&b);
        order.push(b);
        for s in &blocks[b.0].succs {
            indegree[s.0] -= 1;
            if indegree[s.0] == 0 {
                ready.insert(*s);
            }
        }
    }
    match indegree.iter().position(|&d| d > 0) {
        Some(b) => Err(ProgramError::Cycle {
            proc,
            block: BlockId(b),
        }),
        None => Ok(order),
    }
}
