use proptest::prelude::*;

use skiff_types::{Access, PageKey};

use crate::pool::FreePagePool;
use crate::tables::{InvertedPageTable, Residency, ShadowPageTable, TemporalPageTable};

#[derive(Debug, Clone, Copy)]
enum Op {
    Register { gva: u64, asid: u16, perm_idx: u8, hvp: u64 },
    Unregister { pick: usize },
}

const POOL_PAGES: usize = 8;
const MAX_OPS: usize = 96;

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        // Few distinct pages/ASIDs so synonym chains and re-registrations
        // actually happen.
        (0u64..6, 0u16..3, 0u8..3, 0u64..4).prop_map(|(page, asid, perm_idx, host)| {
            Op::Register {
                gva: 0x4000_0000 + (page << 12),
                asid,
                perm_idx,
                hvp: 0x9_0000 + (host << 12),
            }
        }),
        (0usize..64).prop_map(|pick| Op::Unregister { pick }),
    ]
}

/// Drives the tables the way the dispatcher does and checks the cross-table
/// invariants after every step: the synonym invariant (a host page is in the
/// SPT iff its IPT set is non-empty), the IPT/TPT bijection, and pool
/// conservation (allocated + free == capacity, no double-handouts).
fn check_invariants(
    ipt: &InvertedPageTable,
    tpt: &TemporalPageTable,
    spt: &ShadowPageTable,
    pool: &FreePagePool,
) {
    // Synonym invariant, both directions.
    for hvp in ipt.resident_pages() {
        assert!(!ipt.synonyms(hvp).is_empty(), "empty synonym set for {hvp:#x}");
        assert!(spt.contains(hvp), "resident {hvp:#x} missing from the SPT");
    }
    assert_eq!(ipt.len(), spt.len());

    // Bijection: every IPT member maps back through the TPT, and the TPT has
    // nothing else.
    let mut members = 0;
    for hvp in ipt.resident_pages() {
        for key in ipt.synonyms(hvp) {
            members += 1;
            assert_eq!(tpt.lookup(*key).unwrap(), hvp);
        }
    }
    assert_eq!(members, tpt.len());

    // Pool conservation: one device page per resident host page.
    assert_eq!(pool.free_pages() + spt.len(), pool.capacity());
}

proptest! {
    #[test]
    fn residency_invariants_hold_under_random_traffic(
        ops in proptest::collection::vec(op_strategy(), 1..MAX_OPS),
    ) {
        let mut ipt = InvertedPageTable::new();
        let mut tpt = TemporalPageTable::new();
        let mut spt = ShadowPageTable::new();
        let mut pool = FreePagePool::new(POOL_PAGES, 0x100_0000);

        for op in ops {
            match op {
                Op::Register { gva, asid, perm_idx, hvp } => {
                    let key = PageKey::pack(gva, asid, Access::ALL[perm_idx as usize]);
                    if tpt.contains(key) {
                        // Already resident; the dispatcher never re-registers.
                        continue;
                    }
                    tpt.register(key, hvp).unwrap();
                    match ipt.register(hvp, key).unwrap() {
                        Residency::FirstResident => {
                            let ppn = pool.allocate().unwrap();
                            spt.register(hvp, ppn).unwrap();
                        }
                        Residency::Synonym => {
                            spt.lookup(hvp).unwrap();
                        }
                    }
                }
                Op::Unregister { pick } => {
                    let keys = tpt.keys();
                    if keys.is_empty() {
                        continue;
                    }
                    let key = keys[pick % keys.len()];
                    let hvp = tpt.lookup(key).unwrap();
                    if !ipt.unregister(hvp, key).unwrap() {
                        let ppn = spt.remove(hvp).unwrap();
                        pool.recycle(ppn);
                    }
                    tpt.remove(key).unwrap();
                }
            }
            check_invariants(&ipt, &tpt, &spt, &pool);
        }
    }

    #[test]
    fn allocator_never_hands_out_a_page_twice(
        frees in proptest::collection::vec(any::<bool>(), 1..64),
    ) {
        let mut pool = FreePagePool::new(POOL_PAGES, 0);
        let mut held = Vec::new();
        for free in frees {
            if free {
                if let Some(ppn) = held.pop() {
                    pool.recycle(ppn);
                }
            } else if let Ok(ppn) = pool.allocate() {
                prop_assert!(!held.contains(&ppn), "ppn {ppn:#x} handed out twice");
                held.push(ppn);
            } else {
                prop_assert_eq!(held.len(), POOL_PAGES);
            }
        }
    }
}
