/*! Models of the memory bus between the private caches and the
shared cache or memory.

A fetch that misses the first-level cache travels over the bus. On a
[BusModel::Private] bus it costs the plain latency of the level that
serves it. On a TDMA-arbitrated bus ([TdmaSchedule]) every core owns one
slot per round and may only start a transfer that completes within its
own slot, so the cost of a fetch depends on *when* it is issued. */

use thiserror::Error;
use tracing::warn;

use crate::time::{Duration, Instant};
use crate::timing::Scenario;

/// Error type returned for TDMA schedules that cannot be used.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("a TDMA schedule needs at least one core")]
    NoCores,
    #[error("TDMA slots must not be empty")]
    EmptySlot,
    #[error("slot of core {core} starting at {start} does not fit in the interval {interval}")]
    SlotOutsideInterval {
        core: usize,
        start: Instant,
        interval: Duration,
    },
    #[error("a transfer of {latency} cycles does not fit in a slot of {slot} cycles")]
    SlotTooShort { slot: Duration, latency: Duration },
}

/// A static TDMA bus schedule in which every core owns one slot of
/// `slot_len` cycles per round of `interval` cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdmaSchedule {
    slot_len: Duration,
    interval: Duration,
    slot_starts: Vec<Instant>,
}

impl TdmaSchedule {
    /// A schedule given by the start of each core's slot within a
    /// round of length `interval`.
    pub fn new(
        slot_len: Duration,
        interval: Duration,
        slot_starts: Vec<Instant>,
    ) -> Result<Self, ScheduleError> {
        if slot_starts.is_empty() {
            return Err(ScheduleError::NoCores);
        }
        if slot_len == 0 {
            return Err(ScheduleError::EmptySlot);
        }
        if let Some((core, &start)) = slot_starts
            .iter()
            .enumerate()
            .find(|(_, &s)| s + slot_len > interval)
        {
            return Err(ScheduleError::SlotOutsideInterval {
                core,
                start,
                interval,
            });
        }
        Ok(TdmaSchedule {
            slot_len,
            interval,
            slot_starts,
        })
    }

    /// Slots of equal length assigned to the cores in order.
    pub fn round_robin(cores: usize, slot_len: Duration) -> Result<Self, ScheduleError> {
        let starts = (0..cores as Duration).map(|c| c * slot_len).collect();
        TdmaSchedule::new(slot_len, cores as Duration * slot_len, starts)
    }

    pub fn cores(&self) -> usize {
        self.slot_starts.len()
    }

    pub fn slot_len(&self) -> Duration {
        self.slot_len
    }

    /// The length of one round of the schedule.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn slot_start(&self, core: usize) -> Instant {
        self.slot_starts[core]
    }

    /// Ensure a transfer of `latency` cycles fits into a single slot.
    pub fn check_transfer(&self, latency: Duration) -> Result<(), ScheduleError> {
        if latency > self.slot_len {
            Err(ScheduleError::SlotTooShort {
                slot: self.slot_len,
                latency,
            })
        } else {
            Ok(())
        }
    }

    /// The position of `time` relative to the start of `core`'s slot.
    pub fn offset(&self, core: usize, time: Instant) -> Duration {
        let start = self.slot_start(core) % self.interval;
        (time % self.interval + self.interval - start) % self.interval
    }

    /// The time from issuing a transfer of `latency` cycles on `core` at
    /// `time` until it completes: immediate if it still fits into the
    /// current slot, otherwise after waiting for the next one.
    pub fn access_delay(&self, core: usize, time: Instant, latency: Duration) -> Duration {
        let offset = self.offset(core, time);
        if offset + latency <= self.slot_len {
            latency
        } else {
            self.interval - offset + latency
        }
    }

    /// Upper bound on the delay of a transfer when the issue time is
    /// not known.
    pub fn worst_delay(&self, latency: Duration) -> Duration {
        (self.cores() as Duration - 1) * self.interval + 2 * latency
    }
}

/// The bus connecting a core to the shared level of the memory
/// hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusModel {
    /// No contention: every transfer costs its latency.
    Private,
    /// Shared bus arbitrated by the given schedule.
    Tdma(TdmaSchedule),
    /// Shared bus whose arbitration is not modelled: the worst case
    /// assumes a full round of waiting for every other core.
    Unmodeled(TdmaSchedule),
}

impl BusModel {
    pub fn schedule(&self) -> Option<&TdmaSchedule> {
        match self {
            BusModel::Private => None,
            BusModel::Tdma(s) | BusModel::Unmodeled(s) => Some(s),
        }
    }

    /// The TDMA schedule, if the bus timing depends on the issue time.
    pub fn tdma(&self) -> Option<&TdmaSchedule> {
        match self {
            BusModel::Tdma(s) => Some(s),
            _ => None,
        }
    }

    /// The cost of a transfer of `latency` cycles issued by `core` at
    /// `time`.
    pub fn delay(
        &self,
        scenario: Scenario,
        core: usize,
        time: Instant,
        latency: Duration,
    ) -> Duration {
        match (self, scenario) {
            (BusModel::Private, _) | (BusModel::Unmodeled(_), Scenario::Bcet) => latency,
            (BusModel::Unmodeled(s), Scenario::Wcet) => s.worst_delay(latency),
            (BusModel::Tdma(s), _) => s.access_delay(core, time, latency),
        }
    }
}

/// The most recent bus transfer of a block, used when loop iterations
/// are summarised at relative time zero.
///
/// Without absolute times the slot boundaries are unknown, so delays
/// are bounded relative to the end of the previous transfer: a transfer
/// that fits into the remainder of the slot used by the previous one
/// costs its latency, otherwise it waits for the slot of the next
/// round. The first transfer assumes the worst alignment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusTracker {
    latest: Option<Transfer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transfer {
    end: Instant,
    latency: Duration,
}

impl BusTracker {
    pub fn new() -> Self {
        BusTracker::default()
    }

    /// End time of the most recent transfer, if any.
    pub fn latest(&self) -> Option<Instant> {
        self.latest.map(|t| t.end)
    }

    /// The cost of a transfer of `latency` cycles issued at `time`.
    pub fn delay(&mut self, schedule: &TdmaSchedule, time: Instant, latency: Duration) -> Duration {
        let slot = schedule.slot_len();
        let interval = schedule.interval();
        let cores = schedule.cores() as Duration;
        let delay = match self.latest {
            None => {
                self.latest = Some(Transfer {
                    end: time + latency,
                    latency,
                });
                interval - slot + latency
            }
            Some(prev) => {
                let offset = time.saturating_sub(prev.end);
                if offset + latency < slot {
                    latency
                } else {
                    let p = prev.latency;
                    let n = (offset + p) / interval + 1;
                    // still inside a slot granted after the previous transfer
                    if offset + latency + p <= ((n - 1) * cores + 1) * slot {
                        latency
                    } else {
                        let d = n * interval + latency - p - offset;
                        self.latest = Some(Transfer {
                            end: time + d,
                            latency,
                        });
                        d
                    }
                }
            }
        };
        if delay > slot * (cores - 1) + 2 * latency {
            warn!(
                "bus delay of {} cycles at {} exceeds the bound of the schedule",
                delay, time
            );
        }
        delay
    }
}

#[cfg(test)]
mod tests;
