/// This library uses a simple discrete time model: all quantities
/// are counted in processor cycles.
pub type Time = u64;

/// Syntactic sugar to give a hint that a time value indicates a
/// point in time (e.g., the start of a block or of a task).
pub type Instant = Time;

/// Syntactic sugar to give a hint that a time value denotes an
/// interval length (e.g., a latency or an execution-time bound).
pub type Duration = Time;
