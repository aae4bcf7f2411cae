use std::io::Write;

use crate::cache::{
    analyze_level, Access, CacheConfig, CacheState, Classification, ConfigError, Domain,
    Footprint, Hierarchy, TagSet,
};
use crate::context::{Context, Iteration};
use crate::program::{Instr, ProcId, ProcedureBuilder, Program};
use crate::tests::{b, cfg, Lru, Rng};

const FIRST: Iteration = Iteration::First;
const STEADY: Iteration = Iteration::Steady;

fn ctx(its: &[Iteration]) -> Context {
    Context::from_iterations(its.iter().copied())
}

fn classes(c: &Classification, proc: usize, block: usize, its: &[Iteration]) -> Vec<Access> {
    c.get(ProcId(proc), b(block), ctx(its))
        .unwrap()
        .fetches()
        .iter()
        .map(|f| f.access)
        .collect()
}

#[test]
fn parse_config() {
    let c: CacheConfig = "4 2 16 1 10".parse().unwrap();
    assert_eq!(c.sets(), 4);
    assert_eq!(c.associativity(), 2);
    assert_eq!(c.line_size(), 16);
    assert_eq!(c.hit_latency(), 1);
    assert_eq!(c.miss_latency(), 10);
    assert_eq!(c.tagset(0x13), TagSet(1));
    assert_eq!(c.set_index(0x40), 0);
    assert_eq!(c.set_index(0x50), 1);
    assert_eq!(c.set_index(0x7c), 3);

    let c: CacheConfig = "  64\n4\t32 2 40 trailing".parse().unwrap();
    assert_eq!(c.sets(), 64);
    assert_eq!(c.set_index(0x20 * 65), 1);
}

#[test]
fn reject_bad_configs() {
    assert!(matches!(
        "4 2 16".parse::<CacheConfig>(),
        Err(ConfigError::Missing("hit latency"))
    ));
    assert!(matches!(
        "4 two 16 1 10".parse::<CacheConfig>(),
        Err(ConfigError::Invalid { field: "associativity", .. })
    ));
    assert!(matches!(
        "3 2 16 1 10".parse::<CacheConfig>(),
        Err(ConfigError::NotPowerOfTwo { value: 3, .. })
    ));
    assert!(matches!(
        "4 2 12 1 10".parse::<CacheConfig>(),
        Err(ConfigError::NotPowerOfTwo { value: 12, .. })
    ));
    assert!(matches!(
        "4 0 16 1 10".parse::<CacheConfig>(),
        Err(ConfigError::ZeroAssociativity)
    ));
}

#[test]
fn config_from_file() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    writeln!(f, "16 4 32 6 30").unwrap();
    let c = CacheConfig::from_file(f.path()).unwrap();
    assert_eq!(c.sets(), 16);
    assert_eq!(c.miss_latency(), 30);

    let missing = f.path().with_extension("missing");
    let err = CacheConfig::from_file(&missing).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("missing"));
}

#[test]
fn lru_update() {
    // one set, two ways: every line conflicts
    let c = cfg(1, 2, 16, 1, 10);
    let mut s = CacheState::new(c);
    s.access(0x00);
    s.access(0x10);
    assert_eq!(s.age(Domain::Must, 0x10), Some(0));
    assert_eq!(s.age(Domain::Must, 0x00), Some(1));
    assert_eq!(s.classify(0x04), Access::AlwaysHit { age: 1 });

    // touching the older line makes it the youngest
    s.access(0x00);
    assert_eq!(s.age(Domain::Must, 0x00), Some(0));
    assert_eq!(s.age(Domain::Must, 0x10), Some(1));

    // a third line evicts the oldest
    s.access(0x20);
    assert_eq!(s.age(Domain::Must, 0x10), None);
    assert_eq!(s.age(Domain::May, 0x10), None);
    assert_eq!(s.classify(0x10), Access::AlwaysMiss);
    // but persistence keeps it in the extra way
    assert_eq!(s.age(Domain::Persistence, 0x10), Some(2));
    s.access(0x30);
    assert_eq!(s.age(Domain::Persistence, 0x10), Some(2));
    assert_eq!(s.age(Domain::Persistence, 0x00), Some(2));
}

#[test]
fn join_semantics() {
    let c = cfg(1, 4, 16, 1, 10);
    let mut a = CacheState::new(c);
    for addr in [0x00, 0x10, 0x20] {
        a.access(addr);
    }
    // a: must = [0x20, 0x10, 0x00]
    let mut b = CacheState::new(c);
    for addr in [0x20, 0x00, 0x30] {
        b.access(addr);
    }
    // b: must = [0x30, 0x00, 0x20]
    let j = a.join(&b);
    assert_eq!(j.age(Domain::Must, 0x00), Some(2));
    assert_eq!(j.age(Domain::Must, 0x20), Some(2));
    assert_eq!(j.age(Domain::Must, 0x10), None);
    assert_eq!(j.age(Domain::Must, 0x30), None);

    assert_eq!(j.age(Domain::May, 0x00), Some(1));
    assert_eq!(j.age(Domain::May, 0x20), Some(0));
    assert_eq!(j.age(Domain::May, 0x10), Some(1));
    assert_eq!(j.age(Domain::May, 0x30), Some(0));

    assert_eq!(j.age(Domain::Persistence, 0x00), Some(2));
    assert_eq!(j.age(Domain::Persistence, 0x20), Some(2));
    assert_eq!(j.age(Domain::Persistence, 0x10), Some(1));
    assert_eq!(j.age(Domain::Persistence, 0x30), Some(0));

    assert_eq!(j.classify(0x10), Access::FirstMiss);
    assert_eq!(j.classify(0x00), Access::AlwaysHit { age: 2 });
    assert_eq!(j.classify(0x40), Access::AlwaysMiss);
}

fn random_state(c: CacheConfig, rng: &mut Rng, n: usize) -> CacheState {
    let mut s = CacheState::new(c);
    for _ in 0..n {
        let addr = rng.below(12) * 16;
        if rng.below(3) == 0 {
            s.access_maybe(addr);
        } else {
            s.access(addr);
        }
    }
    s
}

#[test]
fn join_laws() {
    let c = cfg(2, 3, 16, 1, 10);
    let mut rng = Rng::new(7);
    for _ in 0..50 {
        let x = random_state(c, &mut rng, 8);
        let y = random_state(c, &mut rng, 8);
        let z = random_state(c, &mut rng, 8);

        assert_eq!(x.join(&x), x);
        assert_eq!(x.join(&y), y.join(&x));
        let left = x.join(&y).join(&z);
        assert_eq!(left, x.join(&y.join(&z)));
        assert_eq!(left, z.join(&x).join(&y));

        // Must never grows and May never shrinks across a join
        let j = x.join(&y);
        for addr in (0..12).map(|k| k * 16) {
            if let Some(age) = j.age(Domain::Must, addr) {
                assert!(x.age(Domain::Must, addr).unwrap() <= age);
                assert!(y.age(Domain::Must, addr).unwrap() <= age);
            }
            for s in [&x, &y] {
                if let Some(age) = s.age(Domain::May, addr) {
                    assert!(j.age(Domain::May, addr).unwrap() <= age);
                }
            }
        }
    }
}

#[test]
fn copies_are_independent() {
    let c = cfg(4, 2, 16, 1, 10);
    let mut original = CacheState::new(c);
    original.access(0x00);
    let snapshot = original.clone();
    let mut copy = original.clone();
    copy.access(0x40);
    copy.access(0x80);
    assert_eq!(original, snapshot);
    assert_eq!(original.classify(0x00), Access::AlwaysHit { age: 0 });
    assert_eq!(copy.classify(0x00), Access::AlwaysMiss);
}

#[test]
fn abstract_state_is_sound_on_traces() {
    let c = cfg(2, 4, 16, 1, 10);
    let mut rng = Rng::new(42);
    for _ in 0..20 {
        let mut abs = CacheState::new(c);
        let mut lru = Lru::new(c);
        for _ in 0..200 {
            let addr = rng.below(24) * 8;
            let class = abs.classify(addr);
            let hit = lru.access(addr);
            match class {
                Access::AlwaysHit { .. } => assert!(hit, "{:#x} classified as hit", addr),
                Access::AlwaysMiss => assert!(!hit, "{:#x} classified as miss", addr),
                _ => (),
            }
            abs.access(addr);
        }
    }
}

#[test]
fn sequential_fetches_in_one_line() {
    let c: CacheConfig = "4 2 16 1 10".parse().unwrap();
    let mut pb = ProcedureBuilder::new(ProcId(0), "main");
    pb.block([0, 4, 8, 12].map(Instr::new));
    let prog = Program::new(vec![pb.build().unwrap()]).unwrap();
    let result = analyze_level(&prog, ProcId(0), &c, None);
    let rec = result.classification.get(ProcId(0), b(0), Context::ROOT).unwrap();
    assert_eq!(
        rec.fetches().iter().map(|f| f.access).collect::<Vec<_>>(),
        vec![
            Access::AlwaysMiss,
            Access::AlwaysHit { age: 0 },
            Access::AlwaysHit { age: 0 },
            Access::AlwaysHit { age: 0 }
        ]
    );
    assert_eq!((rec.hits, rec.misses, rec.unknowns), (3, 1, 0));
    assert_eq!(rec.bcost, 13);
    assert_eq!(rec.wcost, 13);
    assert_eq!(result.footprint.sets().collect::<Vec<_>>(), vec![0]);
    assert_eq!(result.exit.classify(0x0), Access::AlwaysHit { age: 0 });
}

/// B0 -> loop(B1 -> B2) -> B3, the loop body conflicting with B0 in set 0.
fn conflicting_loop(bound: u64) -> Program {
    let mut pb = ProcedureBuilder::new(ProcId(0), "main");
    pb.straight(0x000, 1);
    pb.straight(0x040, 1);
    pb.straight(0x044, 1);
    pb.straight(0x000, 1);
    pb.edge(b(0), b(1)).edge(b(1), b(2)).edge(b(1), b(3));
    pb.add_loop(b(1), b(2), &[], bound, false);
    Program::new(vec![pb.build().unwrap()]).unwrap()
}

#[test]
fn first_and_steady_contexts() {
    let c: CacheConfig = "4 2 16 1 10".parse().unwrap();
    let prog = conflicting_loop(5);
    let cls = analyze_level(&prog, ProcId(0), &c, None).classification;
    assert_eq!(classes(&cls, 0, 1, &[FIRST]), vec![Access::AlwaysMiss]);
    assert_eq!(classes(&cls, 0, 1, &[STEADY]), vec![Access::AlwaysHit { age: 0 }]);
    assert_eq!(classes(&cls, 0, 2, &[FIRST]), vec![Access::AlwaysHit { age: 0 }]);
    assert_eq!(classes(&cls, 0, 2, &[STEADY]), vec![Access::AlwaysHit { age: 0 }]);
    // the line of B0 survives the loop: two lines in a two-way set
    assert_eq!(classes(&cls, 0, 3, &[]), vec![Access::AlwaysHit { age: 1 }]);

    let first = cls.get(ProcId(0), b(1), ctx(&[FIRST])).unwrap();
    let steady = cls.get(ProcId(0), b(1), ctx(&[STEADY])).unwrap();
    assert_eq!(first.wcost + 4 * steady.wcost, 10 + 4);
}

/// B0 -> loop(B1 -> B2) -> B3, where B3 fetches from the line of B2.
fn skippable_loop(bound: u64) -> Program {
    let mut pb = ProcedureBuilder::new(ProcId(0), "main");
    pb.straight(0x000, 1);
    pb.straight(0x100, 1);
    pb.straight(0x200, 1);
    pb.straight(0x204, 1);
    pb.edge(b(0), b(1)).edge(b(1), b(2)).edge(b(2), b(3));
    pb.add_loop(b(1), b(2), &[], bound, true);
    Program::new(vec![pb.build().unwrap()]).unwrap()
}

#[test]
fn loop_that_never_runs_leaves_the_cache_alone() {
    let c: CacheConfig = "4 2 16 1 10".parse().unwrap();
    let skipped = analyze_level(&skippable_loop(0), ProcId(0), &c, None);
    assert_eq!(classes(&skipped.classification, 0, 3, &[]), vec![Access::AlwaysMiss]);
    assert!(skipped.classification.get(ProcId(0), b(1), ctx(&[FIRST])).is_none());
    assert!(skipped.classification.get(ProcId(0), b(2), ctx(&[STEADY])).is_none());
    assert!(!skipped.footprint.lines(0).any(|l| l == TagSet(0x10)));

    let once = analyze_level(&skippable_loop(1), ProcId(0), &c, None);
    assert_eq!(
        classes(&once.classification, 0, 3, &[]),
        vec![Access::AlwaysHit { age: 0 }]
    );
}

#[test]
fn first_miss_in_a_branch() {
    // loop header B1 branches to B2 (line 0x100, set 0) or B3 (set 1)
    // before the sink B4; only B2 touches set 0 inside the loop
    let c = cfg(2, 2, 16, 1, 10);
    let mut pb = ProcedureBuilder::new(ProcId(0), "main");
    pb.straight(0x010, 1);
    pb.straight(0x030, 1);
    pb.straight(0x100, 1);
    pb.straight(0x050, 1);
    pb.straight(0x070, 1);
    pb.straight(0x090, 1);
    pb.edge(b(0), b(1))
        .edge(b(1), b(2))
        .edge(b(1), b(3))
        .edge(b(2), b(4))
        .edge(b(3), b(4))
        .edge(b(1), b(5));
    pb.add_loop(b(1), b(4), &[b(2), b(3)], 4, false);
    let prog = Program::new(vec![pb.build().unwrap()]).unwrap();
    let cls = analyze_level(&prog, ProcId(0), &c, None).classification;

    assert_eq!(classes(&cls, 0, 2, &[FIRST]), vec![Access::AlwaysMiss]);
    assert_eq!(classes(&cls, 0, 2, &[STEADY]), vec![Access::FirstMiss]);
    let steady = cls.get(ProcId(0), b(2), ctx(&[STEADY])).unwrap();
    assert_eq!((steady.bcost, steady.wcost), (1, 1));
    assert_eq!(steady.unknowns, 1);
}

/// Walk `proc` concretely along the given branch decisions and record
/// every fetch with its context and whether it hit.
struct Walker<'a> {
    prog: &'a Program,
    lru: Lru,
    seen: Vec<(ProcId, usize, Context, usize, bool)>,
}

impl<'a> Walker<'a> {
    fn block(&mut self, proc: ProcId, block: usize, ctx: Context) {
        let prog = self.prog;
        let p = prog.procedure(proc);
        for (i, instr) in p.block(b(block)).instrs.iter().enumerate() {
            let hit = self.lru.access(instr.addr);
            self.seen.push((proc, block, ctx, i, hit));
            if let Some(callee) = instr.callee {
                self.block(callee, 0, Context::ROOT);
            }
        }
    }
}

#[test]
fn classification_is_sound_on_paths() {
    let c = cfg(2, 2, 16, 1, 10);
    let mut leaf = ProcedureBuilder::new(ProcId(1), "leaf");
    leaf.straight(0x200, 2);
    let mut pb = ProcedureBuilder::new(ProcId(0), "main");
    pb.block([Instr::new(0x000), Instr::call(0x004, ProcId(1))]);
    pb.straight(0x040, 1);
    pb.straight(0x080, 2);
    pb.straight(0x0c0, 1);
    pb.straight(0x100, 1);
    pb.straight(0x020, 1);
    pb.edge(b(0), b(1))
        .edge(b(1), b(2))
        .edge(b(1), b(3))
        .edge(b(2), b(4))
        .edge(b(3), b(4))
        .edge(b(1), b(5));
    pb.add_loop(b(1), b(4), &[b(2), b(3)], 3, false);
    let prog = Program::new(vec![pb.build().unwrap(), leaf.build().unwrap()]).unwrap();
    let cls = analyze_level(&prog, ProcId(0), &c, None).classification;

    for choices in 0..8u32 {
        let mut w = Walker {
            prog: &prog,
            lru: Lru::new(c),
            seen: Vec::new(),
        };
        w.block(ProcId(0), 0, Context::ROOT);
        for it in 0..3 {
            let ictx = ctx(&[if it == 0 { FIRST } else { STEADY }]);
            w.block(ProcId(0), 1, ictx);
            w.block(ProcId(0), if choices >> it & 1 == 1 { 2 } else { 3 }, ictx);
            w.block(ProcId(0), 4, ictx);
        }
        w.block(ProcId(0), 1, ctx(&[STEADY]));
        w.block(ProcId(0), 5, Context::ROOT);

        for (proc, block, ctx, i, hit) in w.seen {
            match cls.access(proc, b(block), ctx, i).unwrap() {
                Access::AlwaysHit { .. } => assert!(hit, "{} {} {} #{}", proc, block, ctx, i),
                Access::AlwaysMiss => assert!(!hit, "{} {} {} #{}", proc, block, ctx, i),
                _ => (),
            }
        }
    }
}

#[test]
fn second_level_sees_first_level_misses() {
    // a one-line L1 thrashes between the two lines of the loop body
    let l1 = cfg(1, 1, 16, 1, 6);
    let l2 = cfg(4, 4, 16, 6, 30);
    let mut pb = ProcedureBuilder::new(ProcId(0), "main");
    pb.straight(0x100, 1);
    pb.block([Instr::new(0x000), Instr::new(0x004), Instr::new(0x010)]);
    pb.straight(0x104, 1);
    pb.edge(b(0), b(1)).edge(b(1), b(2));
    pb.add_loop(b(1), b(1), &[], 10, true);
    let prog = Program::new(vec![pb.build().unwrap()]).unwrap();

    let result = Hierarchy::two_level(l1, l2).analyze(&prog, ProcId(0));
    let l2c = result.l2.as_ref().unwrap();
    assert_eq!(
        classes(&result.l1, 0, 1, &[STEADY]),
        vec![
            Access::AlwaysMiss,
            Access::AlwaysHit { age: 0 },
            Access::AlwaysMiss
        ]
    );
    assert_eq!(
        classes(l2c, 0, 1, &[FIRST]),
        vec![Access::AlwaysMiss, Access::HitUpper, Access::AlwaysMiss]
    );
    assert_eq!(
        classes(l2c, 0, 1, &[STEADY]),
        vec![
            Access::AlwaysHit { age: 0 },
            Access::HitUpper,
            Access::AlwaysHit { age: 0 }
        ]
    );
    // the L2 footprint only holds lines that reach the L2
    let lines: Vec<_> = result.footprint.lines(0).collect();
    assert_eq!(lines, vec![TagSet(0x0), TagSet(0x10)]);
    assert!(result.footprint.uses(1));
}

#[test]
fn uncertain_first_level_access() {
    let l2 = cfg(1, 2, 16, 6, 30);
    let mut s = CacheState::new(l2);
    s.access(0x00);
    s.access_maybe(0x10);
    // the possibly loaded line is not guaranteed, the old one aged at most by one
    assert_eq!(s.classify(0x10), Access::FirstMiss);
    assert_eq!(s.classify(0x00), Access::AlwaysHit { age: 1 });
    assert_eq!(s.age(Domain::May, 0x00), Some(0));
}

#[test]
fn records_merge_across_call_sites() {
    let c = cfg(4, 2, 16, 1, 10);
    let mut leaf = ProcedureBuilder::new(ProcId(1), "leaf");
    leaf.straight(0x400, 1);
    // the first call misses the leaf's line, the second may or may not
    let mut main = ProcedureBuilder::new(ProcId(0), "main");
    main.block([Instr::call(0x000, ProcId(1)), Instr::call(0x004, ProcId(1))]);
    let prog = Program::new(vec![main.build().unwrap(), leaf.build().unwrap()]).unwrap();
    let cls = analyze_level(&prog, ProcId(0), &c, None).classification;
    assert_eq!(classes(&cls, 1, 0, &[]), vec![Access::Unknown]);
    assert_eq!(cls.len(), 2);
}

#[test]
fn access_join_table() {
    use Access::*;
    assert_eq!(AlwaysHit { age: 0 }.join(AlwaysHit { age: 2 }), AlwaysHit { age: 2 });
    assert_eq!(AlwaysHit { age: 0 }.join(FirstMiss), FirstMiss);
    assert_eq!(FirstMiss.join(AlwaysHit { age: 1 }), FirstMiss);
    assert_eq!(AlwaysMiss.join(AlwaysMiss), AlwaysMiss);
    assert_eq!(AlwaysMiss.join(AlwaysHit { age: 0 }), Unknown);
    assert_eq!(FirstMiss.join(AlwaysMiss), Unknown);
    assert_eq!(HitUpper.join(HitUpper), HitUpper);
    assert_eq!(AlwaysHit { age: 3 }.to_string(), "AH@3");
}

#[test]
fn shared_cache_interference() {
    let c = cfg(4, 2, 16, 1, 10);
    let mut pb = ProcedureBuilder::new(ProcId(0), "main");
    pb.block([0x000, 0x040, 0x000, 0x010].map(Instr::new));
    let prog = Program::new(vec![pb.build().unwrap()]).unwrap();
    let own = analyze_level(&prog, ProcId(0), &c, None);
    assert_eq!(
        classes(&own.classification, 0, 0, &[]),
        vec![
            Access::AlwaysMiss,
            Access::AlwaysMiss,
            Access::AlwaysHit { age: 1 },
            Access::AlwaysMiss
        ]
    );

    // another task touches one foreign line in set 0 and a shared one
    let mut other = Footprint::new();
    other.record(0, TagSet(0x8));
    other.record(0, TagSet(0x4));
    other.record(2, TagSet(0x2));
    assert_eq!(own.footprint.foreign_lines(0, &[&other]), 1);
    assert_eq!(own.footprint.conflicts(&other), vec![0]);

    let shared = own
        .classification
        .with_interference(&own.footprint, &[&other]);
    assert_eq!(
        classes(&shared, 0, 0, &[]),
        vec![
            Access::AlwaysMiss,
            Access::AlwaysMiss,
            Access::Unknown,
            Access::AlwaysMiss
        ]
    );
    // the original classification is left untouched
    assert_eq!(
        classes(&own.classification, 0, 0, &[])[2],
        Access::AlwaysHit { age: 1 }
    );

    // lines in other sets do not interfere
    let mut far = Footprint::new();
    far.record(3, TagSet(0x7));
    let unaffected = own.classification.with_interference(&own.footprint, &[&far]);
    assert_eq!(
        classes(&unaffected, 0, 0, &[])[2],
        Access::AlwaysHit { age: 1 }
    );
}
