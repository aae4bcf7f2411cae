use std::io::{self, Write};
use std::path::PathBuf;
use std::process::Command;

use auto_impl::auto_impl;
use thiserror::Error;
use tracing::{debug, trace};

use super::{Endpoint, Objective, OffsetGraph};

/// Error type returned when an offset graph cannot be solved. None of
/// these is retried.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("failed to write the integer program")]
    Io(#[from] io::Error),
    #[error("failed to run the solver {}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("the solver timed out")]
    Timeout,
    #[error("the integer program is infeasible")]
    Infeasible,
    #[error("the integer program is unbounded")]
    Unbounded,
    #[error("the solver found no solution")]
    NoSolution,
    #[error("the solver rejected the integer program as erroneous")]
    Erroneous,
    #[error("the solver failed with exit status {0:?}")]
    Unavailable(Option<i32>),
    #[error("unexpected solver output: {0:?}")]
    Malformed(String),
}

/// The flow through every edge and node of a solved offset graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    pub edges: Vec<u64>,
    pub nodes: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    /// The optimal value of the objective function.
    pub value: u64,
    /// The optimal flow, if the solver reports it.
    pub flow: Option<Flow>,
}

/// Generic interface for integer-program solvers of offset graphs.
#[auto_impl(&, Box)]
pub trait SolveLp {
    /// The optimal total weight of a walk from the supersource to the
    /// supersink that starts `units` iterations.
    fn solve(
        &self,
        graph: &OffsetGraph,
        objective: Objective,
        units: u64,
    ) -> Result<Solution, SolverError>;
}

/// The external `lp_solve` program.
#[derive(Debug, Clone)]
pub struct LpSolve {
    binary: PathBuf,
}

impl LpSolve {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        LpSolve {
            binary: binary.into(),
        }
    }
}

impl Default for LpSolve {
    /// Look up `lp_solve` in the `PATH`.
    fn default() -> Self {
        LpSolve::new("lp_solve")
    }
}

impl SolveLp for LpSolve {
    fn solve(
        &self,
        graph: &OffsetGraph,
        objective: Objective,
        units: u64,
    ) -> Result<Solution, SolverError> {
        let mut model = tempfile::Builder::new()
            .prefix("offset-graph")
            .suffix(".lp")
            .tempfile()?;
        model.write_all(graph.to_lp(objective, units).as_bytes())?;
        model.flush()?;
        trace!("wrote integer program to {}", model.path().display());

        let output = Command::new(&self.binary)
            .arg("-presolve")
            .arg(model.path())
            .output()
            .map_err(|source| SolverError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;
        match output.status.code() {
            Some(0) => (),
            Some(1) => return Err(SolverError::Timeout),
            Some(2) => return Err(SolverError::Infeasible),
            Some(3) => return Err(SolverError::Unbounded),
            Some(7) => return Err(SolverError::NoSolution),
            Some(255) => return Err(SolverError::Erroneous),
            code => return Err(SolverError::Unavailable(code)),
        }
        let value = parse_objective(&String::from_utf8_lossy(&output.stdout))?;
        debug!("lp_solve: {:?} objective {}", objective, value);
        Ok(Solution { value, flow: None })
    }
}

/// Extract the objective value from lp_solve's output, given either as
/// an integer or as an integral floating-point number.
pub fn parse_objective(output: &str) -> Result<u64, SolverError> {
    let malformed = || SolverError::Malformed(output.trim().to_owned());
    let line = output
        .lines()
        .find(|l| l.trim_start().starts_with("Value of objective function:"))
        .ok_or_else(malformed)?;
    let field = line.split_whitespace().nth(4).ok_or_else(malformed)?;
    if let Ok(v) = field.parse::<u64>() {
        return Ok(v);
    }
    match field.parse::<f64>() {
        Ok(v) if v >= 0.0 && v.fract() == 0.0 && v <= u64::MAX as f64 => Ok(v as u64),
        _ => Err(SolverError::Malformed(line.trim().to_owned())),
    }
}

/// An embedded solver that searches the best walk of the requested
/// number of iterations directly.
///
/// The best walk ending in each node after `k` iterations is extended
/// by one transition at a time, so the running time grows with the
/// number of iterations times the number of edges. Unlike the integer
/// program of [OffsetGraph::to_lp], which also admits cycles of flow
/// detached from the entry node, only walks that an execution can
/// actually take are considered. The bound is therefore never looser
/// than the one found by [LpSolve].
#[derive(Debug, Clone, Copy, Default)]
pub struct PathSolver;

impl PathSolver {
    fn better(objective: Objective, candidate: u64, current: Option<u64>) -> bool {
        match (objective, current) {
            (_, None) => true,
            (Objective::Maximize, Some(c)) => candidate > c,
            (Objective::Minimize, Some(c)) => candidate < c,
        }
    }
}

impl SolveLp for PathSolver {
    fn solve(
        &self,
        graph: &OffsetGraph,
        objective: Objective,
        units: u64,
    ) -> Result<Solution, SolverError> {
        let nodes = graph.nodes().len();
        let edges = graph.edges();
        let mut flow = Flow {
            edges: vec![0; edges.len()],
            nodes: vec![0; nodes],
        };
        if units == 0 {
            return Ok(Solution {
                value: 0,
                flow: Some(flow),
            });
        }

        // best[n]: weight of the best walk whose latest iteration starts
        // in node n; via[k][n]: the edge that walk took into n
        let mut best: Vec<Option<u64>> = vec![None; nodes];
        let mut via: Vec<Vec<Option<usize>>> = Vec::new();
        let mut step = vec![None; nodes];
        for &e in graph.source_edges() {
            if let Endpoint::Node(n) = edges[e].to {
                let w = edges[e].weight(objective) + graph.node(n).weight(objective);
                if Self::better(objective, w, best[n]) {
                    best[n] = Some(w);
                    step[n] = Some(e);
                }
            }
        }
        via.push(step);
        for _ in 1..units {
            let mut next: Vec<Option<u64>> = vec![None; nodes];
            let mut step = vec![None; nodes];
            for (e, edge) in edges.iter().enumerate() {
                if let (Endpoint::Node(n), Endpoint::Node(m)) = (edge.from, edge.to) {
                    if let Some(w) = best[n] {
                        let w = w + edge.weight(objective) + graph.node(m).weight(objective);
                        if Self::better(objective, w, next[m]) {
                            next[m] = Some(w);
                            step[m] = Some(e);
                        }
                    }
                }
            }
            best = next;
            via.push(step);
        }

        let mut exit: Option<(u64, usize)> = None;
        for &e in graph.sink_edges() {
            if let Endpoint::Node(n) = edges[e].from {
                if let Some(w) = best[n] {
                    let w = w + edges[e].weight(objective);
                    if Self::better(objective, w, exit.map(|(v, _)| v)) {
                        exit = Some((w, e));
                    }
                }
            }
        }
        let (value, last) = exit.ok_or(SolverError::Infeasible)?;

        flow.edges[last] = 1;
        let mut node = match edges[last].from {
            Endpoint::Node(n) => n,
            _ => return Err(SolverError::Infeasible),
        };
        for step in via.iter().rev() {
            flow.nodes[node] += 1;
            let e = step[node].ok_or(SolverError::Infeasible)?;
            flow.edges[e] += 1;
            if let Endpoint::Node(prev) = edges[e].from {
                node = prev;
            }
        }
        trace!("path solver: flow {:?}", flow);
        debug!(
            "path solver: {:?} objective {} for {} units",
            objective, value, units
        );
        Ok(Solution {
            value,
            flow: Some(flow),
        })
    }
}
