use netsat_model::{Vni, MAX_VNI};
use std::collections::BTreeSet;

/// Process-wide VNI allocator (§3, §4.2): lowest-free-first, reconstructible
/// from a scan of `/config/links/` on restart.
///
/// Invariant maintained throughout: every id in `freed` is `< frontier`,
/// i.e. nothing is ever freed that was never handed out. This lets
/// allocation compare just two candidates -- `freed`'s minimum and the
/// frontier -- instead of scanning a bitmap.
#[derive(Debug, Default)]
pub struct VniPool {
    freed: BTreeSet<u32>,
    frontier: u32,
}

#[derive(Debug, thiserror::Error)]
#[error("VNI space exhausted (all {MAX_VNI} identifiers in use)")]
pub struct VniExhausted;

impl VniPool {
    pub fn new() -> Self {
        Self {
            freed: BTreeSet::new(),
            frontier: 1,
        }
    }

    /// Called while reconstructing pool state from existing store records;
    /// does not affect `freed`.
    pub fn mark_used(&mut self, vni: Vni) {
        let v = vni.get();
        self.freed.remove(&v);
        if v >= self.frontier {
            self.frontier = v + 1;
        }
    }

    pub fn allocate(&mut self) -> Result<Vni, VniExhausted> {
        if let Some(&v) = self.freed.iter().next() {
            self.freed.remove(&v);
            return Ok(Vni::new(v).expect("freed ids are always valid"));
        }

        if self.frontier > MAX_VNI {
            return Err(VniExhausted);
        }

        let v = self.frontier;
        self.frontier += 1;
        Ok(Vni::new(v).expect("frontier never exceeds MAX_VNI here"))
    }

    pub fn free(&mut self, vni: Vni) {
        self.freed.insert(vni.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_first() {
        let mut pool = VniPool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 2);

        pool.free(a);
        let c = pool.allocate().unwrap();
        assert_eq!(c.get(), 1, "reused the freed id before advancing the frontier");

        let d = pool.allocate().unwrap();
        assert_eq!(d.get(), 3);
    }

    #[test]
    fn reconstructs_frontier_from_existing_records() {
        let mut pool = VniPool::new();
        pool.mark_used(Vni::new(5).unwrap());
        pool.mark_used(Vni::new(2).unwrap());

        let next = pool.allocate().unwrap();
        assert_eq!(next.get(), 6, "frontier must clear every previously observed id");
    }

    #[test]
    fn allocation_sequence_is_deterministic_under_identical_interleaving() {
        let run = |ops: &[Op]| -> Vec<u32> {
            let mut pool = VniPool::new();
            let mut allocated = Vec::new();
            for op in ops {
                match op {
                    Op::Alloc => allocated.push(pool.allocate().unwrap().get()),
                    Op::Free(i) => pool.free(Vni::new(allocated[*i]).unwrap()),
                }
            }
            allocated
        };

        enum Op {
            Alloc,
            Free(usize),
        }

        let ops = [Op::Alloc, Op::Alloc, Op::Free(0), Op::Alloc, Op::Alloc];
        assert_eq!(run(&ops), run(&ops));
    }
}
