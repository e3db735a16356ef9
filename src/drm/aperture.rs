use crate::utils::align_up;
use std::collections::BTreeMap;

/// First-fit allocator over a range of GTT address space.
#[derive(Debug)]
pub struct Aperture {
    base: u64,
    limit: u64,
    align: u64,

    // Tracks occupied ranges: Start Address -> Size
    allocations: BTreeMap<u64, u64>,
}

impl Aperture {
    /// `limit` is exclusive.
    #[must_use]
    pub fn new(base: u64, limit: u64, align: u64) -> Self {
        Self {
            base,
            limit,
            align,
            allocations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    /// Bytes currently placed.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.allocations.values().sum()
    }

    /// Reserve `size` bytes, returning the start offset.
    pub fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        let align = align.max(self.align);
        let mut candidate = align_up(self.base, align)?;

        for (&start, &len) in &self.allocations {
            if start >= candidate && start - candidate >= size {
                break;
            }
            candidate = candidate.max(align_up(start.checked_add(len)?, align)?);
        }

        if candidate.checked_add(size)? <= self.limit {
            self.allocations.insert(candidate, size);
            return Some(candidate);
        }

        None
    }

    pub fn free(&mut self, addr: u64) {
        if self.allocations.remove(&addr).is_none() {
            log::warn!("aperture: freeing untracked offset 0x{addr:x}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocations_are_aligned_and_disjoint() {
        let mut ap = Aperture::new(0x1_0000, 0x10_0000, 4096);
        let a = ap.allocate(0x3000, 0).unwrap();
        let b = ap.allocate(0x1000, 0).unwrap();

        assert_eq!(a, 0x1_0000);
        assert_eq!(b, a + 0x3000);
        assert_eq!(ap.used(), 0x4000);
    }

    #[test]
    fn test_hole_is_reused() {
        let mut ap = Aperture::new(0, 0x10000, 4096);
        let a = ap.allocate(0x2000, 0).unwrap();
        let _b = ap.allocate(0x1000, 0).unwrap();
        ap.free(a);

        assert_eq!(ap.allocate(0x1000, 0), Some(a));
    }

    #[test]
    fn test_exhaustion() {
        let mut ap = Aperture::new(0, 0x2000, 4096);
        assert!(ap.allocate(0x2000, 0).is_some());
        assert_eq!(ap.allocate(0x1000, 0), None);
    }
}
