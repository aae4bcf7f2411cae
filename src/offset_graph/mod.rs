/*! Offset graphs of loops executing on a TDMA bus.

The cost of one loop iteration on a TDMA bus depends on the *offset* at
which it starts, i.e., its start time modulo the TDMA interval. An
[OffsetGraph] has one node per reachable offset, weighted with the best-
and worst-case cost of an iteration starting there, and one transition
edge from each offset to every offset at which such an iteration may
end.

Consecutive iterations form a walk through the graph: it enters at the
offset of the first iteration it covers (the only successor of the
supersource), follows one transition per iteration and leaves to the
supersink. The flow through a node counts the iterations starting at
its offset. The loop cost is found by minimising (BCET) or maximising
(WCET) the total weight of such a flow with the given number of
iterations, an integer program delegated to a [SolveLp]
implementation. */

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write;

use itertools::Itertools;

use crate::time::Duration;
use crate::timing::Scenario;

mod solver;

pub use solver::{parse_objective, Flow, LpSolve, PathSolver, Solution, SolveLp, SolverError};

/// The direction of optimisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    Minimize,
    Maximize,
}

impl From<Scenario> for Objective {
    fn from(s: Scenario) -> Self {
        match s {
            Scenario::Bcet => Objective::Minimize,
            Scenario::Wcet => Objective::Maximize,
        }
    }
}

/// One end of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Source,
    Sink,
    /// The node with the given index.
    Node(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub offset: Duration,
    pub bcet: Duration,
    pub wcet: Duration,
    incoming: Vec<usize>,
    outgoing: Vec<usize>,
}

impl Node {
    pub fn weight(&self, objective: Objective) -> Duration {
        match objective {
            Objective::Minimize => self.bcet,
            Objective::Maximize => self.wcet,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: Endpoint,
    pub to: Endpoint,
    pub bcet: Duration,
    pub wcet: Duration,
}

impl Edge {
    pub fn weight(&self, objective: Objective) -> Duration {
        match objective {
            Objective::Minimize => self.bcet,
            Objective::Maximize => self.wcet,
        }
    }
}

/// Offset nodes and their edges; see the [module documentation](self).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetGraph {
    interval: Duration,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    by_offset: HashMap<Duration, usize>,
    sources: Vec<usize>,
    sinks: Vec<usize>,
}

impl OffsetGraph {
    /// An empty graph for offsets modulo `interval`.
    pub fn new(interval: Duration) -> Self {
        assert!(interval > 0, "offset graph without an interval");
        OffsetGraph {
            interval,
            nodes: Vec::new(),
            edges: Vec::new(),
            by_offset: HashMap::new(),
            sources: Vec::new(),
            sinks: Vec::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn find(&self, offset: Duration) -> Option<usize> {
        self.by_offset.get(&(offset % self.interval)).copied()
    }

    /// The node of `offset` (taken modulo the interval), created with
    /// zero weights if it does not exist yet. The flag tells whether
    /// the node is new.
    pub fn add_node(&mut self, offset: Duration) -> (usize, bool) {
        let offset = offset % self.interval;
        if let Some(&n) = self.by_offset.get(&offset) {
            return (n, false);
        }
        self.nodes.push(Node {
            offset,
            bcet: 0,
            wcet: 0,
            incoming: Vec::new(),
            outgoing: Vec::new(),
        });
        let n = self.nodes.len() - 1;
        self.by_offset.insert(offset, n);
        (n, true)
    }

    pub fn set_weights(&mut self, node: usize, bcet: Duration, wcet: Duration) {
        assert!(bcet <= wcet, "node weights out of order");
        let n = &mut self.nodes[node];
        n.bcet = bcet;
        n.wcet = wcet;
    }

    /// Add an edge unless the same pair of endpoints is already
    /// connected. Returns the index of the new edge.
    pub fn add_edge(
        &mut self,
        from: Endpoint,
        to: Endpoint,
        bcet: Duration,
        wcet: Duration,
    ) -> Option<usize> {
        if self.edges.iter().any(|e| e.from == from && e.to == to) {
            return None;
        }
        let id = self.edges.len();
        self.edges.push(Edge { from, to, bcet, wcet });
        match from {
            Endpoint::Source => self.sources.push(id),
            Endpoint::Node(n) => self.nodes[n].outgoing.push(id),
            Endpoint::Sink => panic!("edge {} leaves the supersink", id),
        }
        match to {
            Endpoint::Sink => self.sinks.push(id),
            Endpoint::Node(n) => self.nodes[n].incoming.push(id),
            Endpoint::Source => panic!("edge {} enters the supersource", id),
        }
        Some(id)
    }

    /// Let walks enter at `start` and leave from any node.
    pub fn connect_terminals(&mut self, start: usize) {
        assert!(start < self.nodes.len(), "no node #{} to start at", start);
        self.add_edge(Endpoint::Source, Endpoint::Node(start), 0, 0);
        for n in 0..self.nodes.len() {
            self.add_edge(Endpoint::Node(n), Endpoint::Sink, 0, 0);
        }
    }

    /// Indices of the edges ending in `node`.
    pub fn incoming(&self, node: usize) -> &[usize] {
        &self.nodes[node].incoming
    }

    /// Indices of the edges starting in `node`.
    pub fn outgoing(&self, node: usize) -> &[usize] {
        &self.nodes[node].outgoing
    }

    /// Indices of the edges leaving the supersource.
    pub fn source_edges(&self) -> &[usize] {
        &self.sources
    }

    /// Indices of the edges entering the supersink.
    pub fn sink_edges(&self) -> &[usize] {
        &self.sinks
    }

    /// The integer program of a walk covering `units` iterations, in
    /// lp_solve's LP format. Edge `i` maps to the variable `x<i>` and
    /// node `n` to `y<n>`.
    pub fn to_lp(&self, objective: Objective, units: u64) -> String {
        let mut lp = String::new();
        // writing to a String cannot fail
        let _ = self.write_lp(&mut lp, objective, units);
        lp
    }

    fn write_lp(&self, f: &mut String, objective: Objective, units: u64) -> fmt::Result {
        write!(f, "/*\n * Objective function\n */\n\n")?;
        write!(
            f,
            "{}",
            match objective {
                Objective::Maximize => "MAX: ",
                Objective::Minimize => "MIN: ",
            }
        )?;
        let edge_terms = self
            .edges
            .iter()
            .enumerate()
            .filter(|(_, e)| e.weight(objective) != 0)
            .map(|(i, e)| format!("{} x{}", e.weight(objective), i));
        let node_terms = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.weight(objective) != 0)
            .map(|(i, n)| format!("{} y{}", n.weight(objective), i));
        writeln!(f, "{};", sum(edge_terms.chain(node_terms)))?;

        write!(f, "\n/*\n * Constraints\n */\n\n")?;
        writeln!(f, "/* Flow conservation constraints */")?;
        for (i, node) in self.nodes.iter().enumerate() {
            let inflow = sum(node.incoming.iter().map(|e| format!("x{}", e)));
            let outflow = sum(node.outgoing.iter().map(|e| format!("x{}", e)));
            writeln!(f, "{} = y{};", inflow, i)?;
            writeln!(f, "y{} = {};", i, outflow)?;
        }

        writeln!(f, "\n/* Demand / supply constraints */")?;
        for ids in [&self.sources, &self.sinks] {
            writeln!(f, "{} = 1;", sum(ids.iter().map(|e| format!("x{}", e))))?;
        }
        writeln!(f, "\n/* Iteration count */")?;
        let visits = sum((0..self.nodes.len()).map(|n| format!("y{}", n)));
        writeln!(f, "{} = {};", visits, units)?;

        let vars: Vec<String> = (0..self.edges.len())
            .map(|e| format!("x{}", e))
            .chain((0..self.nodes.len()).map(|n| format!("y{}", n)))
            .collect();
        write!(f, "\n/*\n * Variable bounds\n */\n\n")?;
        for v in &vars {
            writeln!(f, "{} >= 0;", v)?;
            writeln!(f, "{} <= {};", v, units)?;
        }
        write!(f, "\n/*\n * Variable declarations\n */\n\n")?;
        for v in &vars {
            writeln!(f, "int {};", v)?;
        }
        Ok(())
    }
}

/// The terms joined by `+`, or `0` if there are none.
fn sum(terms: impl Iterator<Item = String>) -> String {
    let mut terms = terms.peekable();
    if terms.peek().is_none() {
        "0".to_owned()
    } else {
        terms.join(" + ")
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Source => write!(f, "source"),
            Endpoint::Sink => write!(f, "sink"),
            Endpoint::Node(n) => write!(f, "node #{}", n),
        }
    }
}

impl fmt::Display for OffsetGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = |ids: &[usize], end: &dyn Fn(&Edge) -> Endpoint| -> String {
            ids.iter()
                .map(|&e| format!("{} ({})", e, end(&self.edges[e])))
                .join(", ")
        };
        writeln!(
            f,
            "Offset graph with {} nodes and {} edges (interval {})",
            self.nodes.len(),
            self.edges.len(),
            self.interval
        )?;
        writeln!(f, "\nNodes:")?;
        for (i, n) in self.nodes.iter().enumerate() {
            writeln!(
                f,
                "  #{} at offset {}: BCET {}, WCET {}",
                i, n.offset, n.bcet, n.wcet
            )?;
            writeln!(f, "    In-Edges : {}", list(&n.incoming, &|e| e.from))?;
            writeln!(f, "    Out-Edges: {}", list(&n.outgoing, &|e| e.to))?;
        }
        writeln!(f, "\nEdges:")?;
        for (i, e) in self.edges.iter().enumerate() {
            writeln!(
                f,
                "  {}: {} --> {} with BCET {}, WCET {}",
                i, e.from, e.to, e.bcet, e.wcet
            )?;
        }
        Ok(())
    }
}
