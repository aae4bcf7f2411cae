use crate::bus::{BusModel, BusTracker, ScheduleError, TdmaSchedule};
use crate::timing::Scenario;

fn four_cores() -> TdmaSchedule {
    TdmaSchedule::round_robin(4, 10).unwrap()
}

#[test]
fn round_robin_layout() {
    let s = four_cores();
    assert_eq!(s.cores(), 4);
    assert_eq!(s.interval(), 40);
    assert_eq!(
        (0..4).map(|c| s.slot_start(c)).collect::<Vec<_>>(),
        vec![0, 10, 20, 30]
    );
    assert_eq!(s.offset(1, 0), 30);
    assert_eq!(s.offset(1, 52), 2);
    assert_eq!(s.offset(3, 29), 39);
}

#[test]
fn invalid_schedules() {
    assert_eq!(TdmaSchedule::round_robin(0, 10), Err(ScheduleError::NoCores));
    assert_eq!(TdmaSchedule::round_robin(2, 0), Err(ScheduleError::EmptySlot));
    assert_eq!(
        TdmaSchedule::new(10, 30, vec![0, 25]),
        Err(ScheduleError::SlotOutsideInterval {
            core: 1,
            start: 25,
            interval: 30
        })
    );
    let s = four_cores();
    assert!(s.check_transfer(10).is_ok());
    assert_eq!(
        s.check_transfer(11),
        Err(ScheduleError::SlotTooShort {
            slot: 10,
            latency: 11
        })
    );
}

#[test]
fn transfers_wait_for_own_slot() {
    let s = four_cores();
    // fits into the remainder of the slot
    assert_eq!(s.access_delay(0, 0, 6), 6);
    assert_eq!(s.access_delay(0, 4, 6), 6);
    assert_eq!(s.access_delay(0, 84, 6), 6);
    // too late in the slot: wait for the next round
    assert_eq!(s.access_delay(0, 5, 6), 41);
    // outside the slot: wait for its start
    assert_eq!(s.access_delay(1, 0, 6), 16);
    assert_eq!(s.access_delay(1, 52, 6), 6);
    assert_eq!(s.access_delay(3, 0, 10), 40);
}

#[test]
fn delay_never_exceeds_worst_case() {
    let s = four_cores();
    for core in 0..4 {
        for t in 0..200 {
            for latency in [1, 6, 10] {
                let d = s.access_delay(core, t, latency);
                assert!(d >= latency);
                assert!(d <= s.worst_delay(latency));
            }
        }
    }
}

#[test]
fn bus_models() {
    let s = four_cores();
    assert_eq!(s.worst_delay(6), 3 * 40 + 12);

    let private = BusModel::Private;
    assert_eq!(private.delay(Scenario::Wcet, 0, 5, 6), 6);
    assert!(private.schedule().is_none());

    let unmodeled = BusModel::Unmodeled(s.clone());
    assert_eq!(unmodeled.delay(Scenario::Wcet, 2, 5, 6), 132);
    assert_eq!(unmodeled.delay(Scenario::Bcet, 2, 5, 6), 6);
    assert!(unmodeled.tdma().is_none());
    assert_eq!(unmodeled.schedule(), Some(&s));

    let tdma = BusModel::Tdma(s);
    assert_eq!(tdma.delay(Scenario::Wcet, 0, 5, 6), 41);
    assert_eq!(tdma.delay(Scenario::Bcet, 0, 5, 6), 41);
    assert!(tdma.tdma().is_some());
}

#[test]
fn tracker_relative_delays() {
    let s = four_cores();
    let mut t = BusTracker::new();
    assert_eq!(t.latest(), None);

    // the first transfer assumes the worst alignment
    assert_eq!(t.delay(&s, 0, 6), 36);
    assert_eq!(t.latest(), Some(6));

    // shortly after the previous one: same slot
    assert_eq!(t.delay(&s, 8, 6), 6);
    assert_eq!(t.latest(), Some(6));

    // too far: the next slot one round after the previous transfer
    assert_eq!(t.delay(&s, 20, 6), 26);
    assert_eq!(t.latest(), Some(46));

    let mut other = BusTracker::new();
    for time in [3, 17, 60, 61, 150] {
        assert!(other.delay(&s, time, 10) >= 10);
    }
}
