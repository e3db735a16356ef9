//! Reference-counted buffer objects.
//!
//! A `BufferObject` is a shared handle to one kernel object. Cloning it
//! acquires a reference and dropping it releases one; the kernel handle goes
//! back to the buffer manager when the last reference (including references
//! held by other buffers' relocations) is gone.

use crate::drm::MapKind;
use crate::winsys::bufmgr::BufMgr;
use crate::winsys::reloc::Relocation;
use crate::winsys::tiling::{Swizzle, Tiling};
use crate::winsys::lock;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// How the kernel object behind a buffer came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BoKind {
    Allocated,
    Userptr,
    Imported,
}

/// A live CPU mapping of the whole object.
#[derive(Debug)]
pub(crate) struct Mapping {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) kind: MapKind,
}

// The mapping is owned by the buffer and only handed out as a raw pointer.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

#[derive(Debug, Default)]
pub(crate) struct BoState {
    pub(crate) tiling: Tiling,
    pub(crate) swizzle: Swizzle,
    pub(crate) pitch: u64,
    pub(crate) mapping: Option<Mapping>,
    pub(crate) relocs: Vec<Relocation>,
}

pub(crate) struct BoInner {
    pub(crate) bufmgr: Arc<BufMgr>,
    pub(crate) handle: u32,
    pub(crate) name: String,
    pub(crate) size: u64,
    pub(crate) kind: BoKind,
    /// Cleared once the object is shared; shared objects never enter the reuse cache.
    pub(crate) reusable: AtomicBool,
    pub(crate) state: Mutex<BoState>,
    /// Last GPU address the kernel reported, 0 before the first execution.
    pub(crate) offset: AtomicU64,
}

/// A handle to GPU-addressable memory.
#[derive(Clone)]
pub struct BufferObject(pub(crate) Arc<BoInner>);

impl BufferObject {
    pub(crate) fn new(
        bufmgr: Arc<BufMgr>,
        handle: u32,
        name: &str,
        size: u64,
        kind: BoKind,
        offset: u64,
    ) -> Self {
        Self(Arc::new(BoInner {
            bufmgr,
            handle,
            name: name.to_owned(),
            size,
            kind,
            reusable: AtomicBool::new(kind == BoKind::Allocated),
            state: Mutex::new(BoState::default()),
            offset: AtomicU64::new(offset),
        }))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Size in bytes, always a whole number of pages.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.0.size
    }

    /// Kernel handle, valid on the device that created or imported the buffer.
    #[must_use]
    pub fn handle(&self) -> u32 {
        self.0.handle
    }

    #[must_use]
    pub fn tiling(&self) -> Tiling {
        lock(&self.0.state).tiling
    }

    /// Row pitch in bytes; 0 for linear buffers.
    #[must_use]
    pub fn pitch(&self) -> u64 {
        lock(&self.0.state).pitch
    }

    #[must_use]
    pub fn swizzle(&self) -> Swizzle {
        lock(&self.0.state).swizzle
    }

    /// GPU address the buffer is expected to occupy at the next execution.
    #[must_use]
    pub fn presumed_offset(&self) -> u64 {
        self.0.offset.load(Ordering::Acquire)
    }

    pub(crate) fn set_presumed_offset(&self, offset: u64) {
        self.0.offset.store(offset, Ordering::Release);
    }

    /// Number of live references, counting relocations that target this buffer.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn mark_shared(&self) {
        self.0.reusable.store(false, Ordering::Release);
    }

    pub(crate) fn bufmgr(&self) -> &BufMgr {
        &self.0.bufmgr
    }
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("name", &self.0.name)
            .field("handle", &self.0.handle)
            .field("size", &self.0.size)
            .field("kind", &self.0.kind)
            .field("offset", &format_args!("0x{:x}", self.presumed_offset()))
            .finish_non_exhaustive()
    }
}

/// Takes another reference to `bo`. A missing buffer stays missing.
#[must_use]
pub fn acquire(bo: Option<&BufferObject>) -> Option<BufferObject> {
    bo.cloned()
}

/// Gives up a reference. Releasing nothing is a no-op.
pub fn release(bo: Option<BufferObject>) {
    drop(bo);
}

impl Drop for BoInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(mapping) = state.mapping.take() {
            self.bufmgr.driver().munmap(mapping.ptr, self.size);
        }
        let tiling = state.tiling;
        // Targets are released before this handle goes back to the manager.
        state.relocs.clear();

        self.bufmgr.forget_shared(self.handle);
        self.bufmgr.release_handle(
            self.handle,
            self.size,
            tiling,
            *self.reusable.get_mut(),
            *self.offset.get_mut(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::sim::{SimConfig, SimKernel};
    use crate::winsys::test_support::winsys_on;

    #[test]
    fn test_alive_while_references_remain() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let live = kernel.live_objects();
        let cached = ws.bufmgr().cached_count();

        let bo = ws.alloc_bo("scratch", 4096, true).unwrap();
        let extra = acquire(Some(&bo)).unwrap();
        assert_eq!(bo.ref_count(), 2);

        release(Some(bo));
        assert_eq!(extra.ref_count(), 1);
        assert_eq!(kernel.live_objects(), live + 1);

        release(Some(extra));
        assert_eq!(ws.bufmgr().cached_count(), cached + 1);
    }

    #[test]
    fn test_null_acquire_release_is_noop() {
        assert!(acquire(None).is_none());
        release(None);
    }

    #[test]
    fn test_relocation_keeps_target_alive() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let batch = ws.alloc_bo("batch", 4096, true).unwrap();
        let target = ws.alloc_bo("target", 4096, false).unwrap();

        batch
            .add_reloc(0, &target, 0, crate::winsys::reloc::RelocFlags::empty())
            .unwrap();
        assert_eq!(target.ref_count(), 2);

        drop(batch);
        assert_eq!(target.ref_count(), 1);
    }

    #[test]
    fn test_debug_output_names_buffer() {
        let kernel = SimKernel::new(SimConfig::default());
        let ws = winsys_on(&kernel);
        let bo = ws.alloc_bo("vertices", 4096, true).unwrap();
        assert!(format!("{bo:?}").contains("vertices"));
    }
}
