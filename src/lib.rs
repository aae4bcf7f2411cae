/*! Cache-aware best- and worst-case execution-time analysis.

This crate bounds the execution time of programs running on cores with
private instruction caches, an optional shared second-level cache and a
shared (possibly TDMA-arbitrated) memory bus.

The analysis proceeds in three steps:

1. [cache] classifies every instruction fetch of a [program] per loop
   [context] by abstract interpretation of the LRU cache hierarchy.
2. [timing] propagates start and finish times through the control-flow
   graph, charging each fetch the latency implied by its classification
   and the [bus] model, and bounds loops by unrolling, summarising or
   solving an [offset_graph].
3. [task] sequences the procedures of a task graph on their cores.

All quantities of time are counted in processor cycles (see [time]). */

pub mod bus;
pub mod cache;
pub mod context;
pub mod offset_graph;
pub mod program;
pub mod task;
pub mod time;
pub mod timing;
