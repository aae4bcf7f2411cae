/*! Task graphs mapped to the cores of a platform.

A [TaskGraph] lists tasks in topological order of their precedence
constraints. Each task runs one program from an entry procedure on a
fixed core. [TaskGraph::analyze] places the tasks in this order: a task
starts once it is released, all its predecessors have finished and its
core is free, and its cost is bounded by the timing [Engine] from that
start time. */

use std::collections::HashMap;

use derive_more::{Display, From, Into};
use thiserror::Error;
use tracing::debug;

use crate::cache::{CacheAnalysis, Footprint, Hierarchy};
use crate::offset_graph::SolveLp;
use crate::program::{ProcId, Program};
use crate::time::{Duration, Instant};
use crate::timing::{Engine, Platform, Scenario, TimingError};

/// Index of a task in its [TaskGraph].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into, Display)]
#[display(fmt = "T{}", _0)]
pub struct TaskId(pub usize);

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task {task} precedes unknown task {succ}")]
    UnknownSuccessor { task: TaskId, succ: TaskId },
    #[error("task {task} precedes {succ}, which is listed before it")]
    NotTopological { task: TaskId, succ: TaskId },
    #[error("task {task} is mapped to core {core}, which the bus does not serve")]
    UnknownCore { task: TaskId, core: usize },
    #[error("task {task} is released at {earliest} but no later than {latest}")]
    Release {
        task: TaskId,
        earliest: Instant,
        latest: Instant,
    },
    #[error("failed to analyse task {task}")]
    Timing {
        task: TaskId,
        #[source]
        source: TimingError,
    },
}

#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub program: Program,
    pub entry: ProcId,
    pub core: usize,
    /// Earliest and latest release time.
    pub release: (Instant, Instant),
    /// Tasks that may only start once this one has finished.
    pub successors: Vec<TaskId>,
}

impl Task {
    pub fn new(name: impl Into<String>, program: Program, entry: ProcId) -> Self {
        Task {
            name: name.into(),
            program,
            entry,
            core: 0,
            release: (0, 0),
            successors: Vec::new(),
        }
    }

    pub fn on_core(mut self, core: usize) -> Self {
        self.core = core;
        self
    }

    pub fn released(mut self, earliest: Instant, latest: Instant) -> Self {
        self.release = (earliest, latest);
        self
    }

    pub fn before(mut self, succ: TaskId) -> Self {
        self.successors.push(succ);
        self
    }

    fn release_for(&self, scenario: Scenario) -> Instant {
        match scenario {
            Scenario::Bcet => self.release.0,
            Scenario::Wcet => self.release.1,
        }
    }
}

/// The placement of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTiming {
    pub task: TaskId,
    pub start: Instant,
    pub finish: Instant,
    pub cost: Duration,
}

#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: Vec<Task>,
}

impl TaskGraph {
    pub fn new(tasks: Vec<Task>) -> Result<Self, TaskError> {
        for (i, t) in tasks.iter().enumerate() {
            let task = TaskId(i);
            if t.release.0 > t.release.1 {
                return Err(TaskError::Release {
                    task,
                    earliest: t.release.0,
                    latest: t.release.1,
                });
            }
            for &succ in &t.successors {
                if succ.0 >= tasks.len() {
                    return Err(TaskError::UnknownSuccessor { task, succ });
                }
                if succ.0 <= i {
                    return Err(TaskError::NotTopological { task, succ });
                }
            }
        }
        Ok(TaskGraph { tasks })
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.0]
    }

    /// Classify the fetches of every task. With `interference`, the
    /// shared cache level of each task additionally accounts for the
    /// footprints of all tasks on other cores.
    pub fn cache_analyses(&self, hierarchy: &Hierarchy, interference: bool) -> Vec<CacheAnalysis> {
        let own: Vec<CacheAnalysis> = self
            .tasks
            .iter()
            .map(|t| hierarchy.analyze(&t.program, t.entry))
            .collect();
        if !interference || hierarchy.l2.is_none() {
            return own;
        }
        own.iter()
            .zip(&self.tasks)
            .map(|(analysis, task)| {
                let others: Vec<&Footprint> = own
                    .iter()
                    .zip(&self.tasks)
                    .filter(|(_, t)| t.core != task.core)
                    .map(|(a, _)| &a.footprint)
                    .collect();
                analysis.with_interference(&others)
            })
            .collect()
    }

    /// Place all tasks for the given scenario. `analyses` holds the
    /// cache analysis of each task, in task order.
    pub fn analyze(
        &self,
        analyses: &[CacheAnalysis],
        platform: &Platform,
        solver: &dyn SolveLp,
        scenario: Scenario,
    ) -> Result<Vec<TaskTiming>, TaskError> {
        assert_eq!(analyses.len(), self.tasks.len(), "one cache analysis per task");
        let cores = platform.bus.schedule().map(|s| s.cores());
        let mut bounds: Vec<Instant> = self.tasks.iter().map(|t| t.release_for(scenario)).collect();
        let mut core_free: HashMap<usize, Instant> = HashMap::new();
        let mut result = Vec::with_capacity(self.tasks.len());

        for (i, (task, analysis)) in self.tasks.iter().zip(analyses).enumerate() {
            let id = TaskId(i);
            if cores.map_or(false, |n| task.core >= n) {
                return Err(TaskError::UnknownCore {
                    task: id,
                    core: task.core,
                });
            }
            let start = if platform.independent {
                0
            } else {
                bounds[i].max(core_free.get(&task.core).copied().unwrap_or(0))
            };
            let engine = Engine::new(&task.program, analysis, platform)
                .with_solver(solver)
                .on_core(task.core);
            let timing = engine
                .analyze(task.entry, start, scenario)
                .map_err(|source| TaskError::Timing { task: id, source })?;
            debug!(
                "{:?} of task {} ({}) on core {}: start {}, cost {}",
                scenario, task.name, id, task.core, start, timing.cost
            );
            if !platform.independent {
                core_free.insert(task.core, timing.finish);
                for s in &task.successors {
                    bounds[s.0] = bounds[s.0].max(timing.finish);
                }
            }
            result.push(TaskTiming {
                task: id,
                start,
                finish: timing.finish,
                cost: timing.cost,
            });
        }
        Ok(result)
    }
}
