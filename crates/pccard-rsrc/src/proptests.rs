use proptest::prelude::*;

use crate::pool::{Interval, ResourcePool};

#[derive(Debug, Clone)]
enum Op {
    Find { len: u32, align: u32 },
    ReleaseNth(usize),
    Remove { base: u32, len: u32 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..0x800, prop_oneof![Just(0u32), Just(0x10), Just(0x100)])
            .prop_map(|(len, align)| Op::Find { len, align }),
        (0usize..8).prop_map(Op::ReleaseNth),
        (0u32..0x8000, 1u32..0x800).prop_map(|(off, len)| Op::Remove {
            base: 0x1_0000 + off,
            len
        }),
    ]
}

fn disjoint(a: &Interval, b: &Interval) -> bool {
    a.end <= b.start || b.end <= a.start
}

proptest! {
    /// After any sequence of find/release/remove operations, no two live
    /// grants overlap and no grant overlaps the free list.
    #[test]
    fn grants_stay_disjoint(ops in proptest::collection::vec(op_strategy(), 1..64)) {
        let mut pool = ResourcePool::new();
        pool.add_range(0x1_0000, 0x1_0000).unwrap();
        let mut live: Vec<(u32, u32)> = Vec::new();

        for op in ops {
            match op {
                Op::Find { len, align } => {
                    if let Ok(base) = pool.find(0, len, align) {
                        live.push((base, len));
                    }
                }
                Op::ReleaseNth(n) => {
                    if !live.is_empty() {
                        let (base, len) = live.remove(n % live.len());
                        pool.release(base, len).unwrap();
                    }
                }
                Op::Remove { base, len } => {
                    let _ = pool.remove_range(base, len);
                }
            }

            let grants = pool.granted_intervals();
            for (i, a) in grants.iter().enumerate() {
                for b in &grants[i + 1..] {
                    prop_assert!(disjoint(a, b), "overlapping grants {a:?} {b:?}");
                }
                for f in pool.free_intervals() {
                    prop_assert!(disjoint(a, f), "grant {a:?} overlaps free {f:?}");
                }
            }
        }
    }

    /// Free intervals stay sorted and non-overlapping.
    #[test]
    fn free_list_stays_sorted(ops in proptest::collection::vec(op_strategy(), 1..64)) {
        let mut pool = ResourcePool::new();
        pool.add_range(0x1_0000, 0x1_0000).unwrap();
        let mut live: Vec<(u32, u32)> = Vec::new();

        for op in ops {
            match op {
                Op::Find { len, align } => {
                    if let Ok(base) = pool.find(0, len, align) {
                        live.push((base, len));
                    }
                }
                Op::ReleaseNth(n) => {
                    if !live.is_empty() {
                        let (base, len) = live.remove(n % live.len());
                        pool.release(base, len).unwrap();
                    }
                }
                Op::Remove { base, len } => {
                    let _ = pool.remove_range(base, len);
                }
            }

            let free = pool.free_intervals();
            for w in free.windows(2) {
                prop_assert!(w[0].end <= w[1].start, "free list out of order: {w:?}");
            }
        }
    }
}
