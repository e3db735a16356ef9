use crate::drm::ioctl::{
    I915_GEM_DOMAIN_COMMAND, I915_GEM_DOMAIN_CPU, I915_GEM_DOMAIN_GTT,
    I915_GEM_DOMAIN_INSTRUCTION, I915_GEM_DOMAIN_RENDER, I915_GEM_DOMAIN_SAMPLER,
    I915_GEM_DOMAIN_VERTEX, RelocationEntry,
};
use crate::error::{WinsysError, WinsysResult};
use crate::winsys::bo::BufferObject;
use crate::winsys::lock;
use crate::winsys::tiling::Tiling;
use bitflags::bitflags;
use std::collections::HashSet;
use std::sync::Arc;

bitflags! {
    /// How a relocation's target is accessed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RelocFlags: u32 {
        /// Tiled target accessed without a GTT mapping; needs a fence register.
        const FENCE = 1 << 0;
        /// Address lives in the global GTT (instruction state).
        const GGTT  = 1 << 1;
        const WRITE = 1 << 2;
    }
}

bitflags! {
    /// GPU cache domains.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Domains: u32 {
        const CPU         = I915_GEM_DOMAIN_CPU;
        const RENDER      = I915_GEM_DOMAIN_RENDER;
        const SAMPLER     = I915_GEM_DOMAIN_SAMPLER;
        const COMMAND     = I915_GEM_DOMAIN_COMMAND;
        const INSTRUCTION = I915_GEM_DOMAIN_INSTRUCTION;
        const VERTEX      = I915_GEM_DOMAIN_VERTEX;
        const GTT         = I915_GEM_DOMAIN_GTT;
    }
}

/// Read and write domains for a relocation with `flags`.
#[must_use]
pub fn reloc_domains(flags: RelocFlags) -> (Domains, Domains) {
    if flags.contains(RelocFlags::WRITE) {
        let write = if flags.contains(RelocFlags::GGTT) {
            Domains::INSTRUCTION
        } else {
            Domains::RENDER
        };
        (write, write)
    } else {
        let read = Domains::RENDER | Domains::SAMPLER | Domains::INSTRUCTION | Domains::VERTEX;
        (read, Domains::empty())
    }
}

/// What a relocation points at.
#[derive(Debug, Clone)]
pub(crate) enum RelocTarget {
    /// The buffer holding the relocation. Holds no reference.
    Owner,
    Buffer(BufferObject),
}

/// One recorded address patch.
#[derive(Debug, Clone)]
pub(crate) struct Relocation {
    pub(crate) target: RelocTarget,
    pub(crate) entry: RelocationEntry,
    /// The target must be reachable through a fence register.
    pub(crate) needs_fence: bool,
}

impl Relocation {
    /// The target, resolving `Owner` to `owner`.
    pub(crate) fn target_of(&self, owner: &BufferObject) -> BufferObject {
        match &self.target {
            RelocTarget::Owner => owner.clone(),
            RelocTarget::Buffer(bo) => bo.clone(),
        }
    }
}

impl BufferObject {
    /// Records that the dword pair at `offset` holds the address of `target`
    /// plus `target_offset`.
    ///
    /// Slots are always 64-bit (gen8+ address width), so `offset + 8` must fit
    /// in the buffer; 32-bit slots of older generations are not supported.
    ///
    /// Returns the presumed address, which the caller writes into the command
    /// stream. The kernel patches it at submission if the target moved.
    ///
    /// A buffer may relocate to itself, but not to a buffer that already
    /// references it: relocations keep their targets alive, and a cycle would
    /// never be released.
    ///
    /// # Errors
    /// `RelocOutOfBounds` when the 8-byte slot or the delta does not fit,
    /// `RelocCycle` when `target` already references this buffer,
    /// `TooManyRelocations` when the per-buffer limit is reached.
    pub fn add_reloc(
        &self,
        offset: u64,
        target: &Self,
        target_offset: u64,
        flags: RelocFlags,
    ) -> WinsysResult<u64> {
        if offset.checked_add(8).is_none_or(|end| end > self.size()) {
            return Err(WinsysError::RelocOutOfBounds {
                offset,
                size: self.size(),
            });
        }
        let delta = u32::try_from(target_offset).map_err(|_| WinsysError::RelocOutOfBounds {
            offset: target_offset,
            size: target.size(),
        })?;

        let is_self = self.ptr_eq(target);
        if !is_self && target.has_reloc(self) {
            return Err(WinsysError::RelocCycle {
                owner: self.name().to_owned(),
                target: target.name().to_owned(),
            });
        }
        // Read the target before taking our own lock.
        let needs_fence = flags.contains(RelocFlags::FENCE) && target.tiling() != Tiling::None;
        let presumed = target.presumed_offset();
        let (read, write) = reloc_domains(flags);

        let max = self.bufmgr().config().max_relocs();
        let mut state = lock(&self.0.state);
        if state.relocs.len() >= max {
            return Err(WinsysError::TooManyRelocations(max));
        }

        state.relocs.push(Relocation {
            target: if is_self {
                RelocTarget::Owner
            } else {
                RelocTarget::Buffer(target.clone())
            },
            entry: RelocationEntry {
                target_handle: target.handle(),
                delta,
                offset,
                presumed_offset: presumed,
                read_domains: read.bits(),
                write_domain: write.bits(),
            },
            needs_fence,
        });

        log::trace!(
            "bo '{}': reloc @0x{offset:x} -> '{}'+0x{target_offset:x} ({flags:?})",
            self.name(),
            target.name()
        );
        Ok(presumed + target_offset)
    }

    #[must_use]
    pub fn relocation_count(&self) -> usize {
        lock(&self.0.state).relocs.len()
    }

    /// Drops relocations `start..`, releasing their targets.
    pub fn truncate_relocs(&self, start: usize) {
        let dropped: Vec<Relocation> = {
            let mut state = lock(&self.0.state);
            if start >= state.relocs.len() {
                return;
            }
            state.relocs.drain(start..).collect()
        };
        // Targets may be released here; do it outside our lock.
        drop(dropped);
    }

    /// Whether this buffer references `target`, directly or through other buffers.
    #[must_use]
    pub fn has_reloc(&self, target: &Self) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![self.clone()];

        while let Some(bo) = stack.pop() {
            if !visited.insert(Arc::as_ptr(&bo.0)) {
                continue;
            }
            let children: Vec<Self> = lock(&bo.0.state)
                .relocs
                .iter()
                .map(|reloc| reloc.target_of(&bo))
                .collect();

            for child in children {
                if child.ptr_eq(target) {
                    return true;
                }
                stack.push(child);
            }
        }
        false
    }

    /// Snapshot of the relocations, for building an execbuffer.
    pub(crate) fn relocations(&self) -> Vec<Relocation> {
        lock(&self.0.state).relocs.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WinsysConfig;
    use crate::drm::sim::{SimConfig, SimKernel};
    use crate::winsys::WinSys;
    use crate::winsys::test_support::winsys_on;

    #[test]
    fn test_domains_are_pure_function_of_flags() {
        let write_ggtt = reloc_domains(RelocFlags::WRITE | RelocFlags::GGTT);
        assert_eq!(write_ggtt, (Domains::INSTRUCTION, Domains::INSTRUCTION));

        let write = reloc_domains(RelocFlags::WRITE | RelocFlags::FENCE);
        assert_eq!(write, (Domains::RENDER, Domains::RENDER));

        let all_read = Domains::RENDER | Domains::SAMPLER | Domains::INSTRUCTION | Domains::VERTEX;
        for flags in [RelocFlags::empty(), RelocFlags::GGTT, RelocFlags::FENCE] {
            assert_eq!(reloc_domains(flags), (all_read, Domains::empty()));
        }
    }

    #[test]
    fn test_presumed_address_includes_target_offset() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let batch = ws.alloc_bo("batch", 4096, true).unwrap();
        let target = ws.alloc_bo("target", 4096, false).unwrap();
        target.set_presumed_offset(0x20_0000);

        let addr = batch.add_reloc(16, &target, 0x40, RelocFlags::WRITE).unwrap();
        assert_eq!(addr, 0x20_0040);

        let reloc = &batch.relocations()[0];
        assert_eq!(reloc.entry.presumed_offset, 0x20_0000);
        assert_eq!(reloc.entry.delta, 0x40);
        assert_eq!(reloc.entry.write_domain, Domains::RENDER.bits());
    }

    #[test]
    fn test_slot_must_fit_in_owner() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let batch = ws.alloc_bo("batch", 4096, true).unwrap();
        let target = ws.alloc_bo("target", 4096, false).unwrap();

        assert!(batch.add_reloc(4088, &target, 0, RelocFlags::empty()).is_ok());
        let err = batch.add_reloc(4092, &target, 0, RelocFlags::empty()).unwrap_err();
        assert!(matches!(err, WinsysError::RelocOutOfBounds { offset: 4092, .. }));
    }

    #[test]
    fn test_relocation_limit() {
        let kernel = SimKernel::new(SimConfig::default());
        let config = WinsysConfig::default().with_batch_size(4096 * 4);
        let ws = WinSys::create(Arc::new(kernel.open()), config).unwrap();
        let batch = ws.alloc_bo("batch", 4096, true).unwrap();
        let max = ws.config().max_relocs();

        for i in 0..max {
            batch
                .add_reloc((i as u64 * 8) % 4096, &batch, 0, RelocFlags::empty())
                .unwrap();
        }
        let err = batch.add_reloc(0, &batch, 0, RelocFlags::empty()).unwrap_err();
        assert!(matches!(err, WinsysError::TooManyRelocations(n) if n == max));
    }

    #[test]
    fn test_truncate_then_add() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let batch = ws.alloc_bo("batch", 4096, true).unwrap();
        let target = ws.alloc_bo("target", 4096, false).unwrap();

        for i in 0..6 {
            batch.add_reloc(i * 8, &target, 0, RelocFlags::empty()).unwrap();
        }
        batch.truncate_relocs(2);
        assert_eq!(target.ref_count(), 3);

        for i in 0..3 {
            batch.add_reloc(i * 8, &target, 0, RelocFlags::empty()).unwrap();
        }
        assert_eq!(batch.relocation_count(), 5);

        batch.truncate_relocs(10);
        assert_eq!(batch.relocation_count(), 5);
    }

    #[test]
    fn test_self_relocation_takes_no_reference() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let batch = ws.alloc_bo("batch", 4096, true).unwrap();

        batch.add_reloc(0, &batch, 64, RelocFlags::empty()).unwrap();
        assert_eq!(batch.ref_count(), 1);
        assert!(batch.has_reloc(&batch));
    }

    #[test]
    fn test_has_reloc_is_transitive() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let a = ws.alloc_bo("a", 4096, true).unwrap();
        let b = ws.alloc_bo("b", 4096, true).unwrap();
        let c = ws.alloc_bo("c", 4096, true).unwrap();

        a.add_reloc(0, &b, 0, RelocFlags::empty()).unwrap();
        b.add_reloc(0, &c, 0, RelocFlags::empty()).unwrap();
        c.add_reloc(0, &c, 8, RelocFlags::empty()).unwrap();

        assert!(a.has_reloc(&c));
        assert!(!c.has_reloc(&a));
        assert!(!b.has_reloc(&a));
    }

    #[test]
    fn test_cycle_is_rejected_and_buffers_are_freed() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = WinSys::create(
            Arc::new(kernel.open()),
            WinsysConfig::default().with_bo_reuse(false),
        )
        .unwrap();
        let baseline = kernel.live_objects();

        let a = ws.alloc_bo("a", 4096, true).unwrap();
        let b = ws.alloc_bo("b", 4096, true).unwrap();
        let c = ws.alloc_bo("c", 4096, true).unwrap();
        a.add_reloc(0, &b, 0, RelocFlags::empty()).unwrap();
        b.add_reloc(0, &c, 0, RelocFlags::empty()).unwrap();

        let err = b.add_reloc(8, &a, 0, RelocFlags::empty()).unwrap_err();
        assert!(matches!(err, WinsysError::RelocCycle { .. }));
        assert_eq!(err.errno(), -libc::EINVAL);
        assert!(c.add_reloc(0, &a, 0, RelocFlags::WRITE).is_err());
        assert_eq!(b.relocation_count(), 1);
        assert_eq!(c.relocation_count(), 0);

        drop((a, b, c));
        assert_eq!(kernel.live_objects(), baseline);
    }

    #[test]
    fn test_fence_only_for_tiled_targets() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let batch = ws.alloc_bo("batch", 4096, true).unwrap();
        let linear = ws.alloc_bo("linear", 4096, false).unwrap();
        let tiled = ws.alloc_bo("tiled", 8192, false).unwrap();
        tiled.set_tiling(Tiling::X, 512).unwrap();

        batch.add_reloc(0, &linear, 0, RelocFlags::FENCE).unwrap();
        batch.add_reloc(8, &tiled, 0, RelocFlags::FENCE).unwrap();

        let relocs = batch.relocations();
        assert!(!relocs[0].needs_fence);
        assert!(relocs[1].needs_fence);
    }
}
